//! Requirement model.
//!
//! Callers describe what a call needs, not how to get it: a
//! [`RequirementSet`] maps each extension layer (transport, routing,
//! encryption, ...) to a set of [`Dimension`]s. The stack negotiator reads
//! the set to decide which layers are mandatory, and each plugin's `prepare`
//! hook reads it to decide whether it can participate.
//!
//! ```rust,ignore
//! use plexus::protocol::ExtensionLayer;
//! use plexus::requirement::{Dimension, RequirementSet};
//!
//! let requirements = RequirementSet::new()
//!     .with(ExtensionLayer::Encryption, Dimension::required())
//!     .with(ExtensionLayer::Encryption, Dimension::level(128, Some(256))?);
//! ```

mod dimension;
mod set;

pub use dimension::{ids, Dimension, DimensionValue, Orientation};
pub use set::RequirementSet;
