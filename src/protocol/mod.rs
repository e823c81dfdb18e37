//! Stack negotiation and session management.
//!
//! An outgoing call turns a [`RequirementSet`](crate::requirement::RequirementSet)
//! into a [`Session`] chain with the [`StackNegotiator`], then opens it with
//! the [`ConnectorPipeline`]. The accepting side mirrors this from the
//! [`SessionDescriptor`] the initiator writes on the raw transport connector.
//!
//! ## Call Flow
//!
//! ```text
//! Initiator                                  Acceptor
//!    |                                          |
//!    | negotiate(target, requirements)          |
//!    |   prepare() per layer, first fit         |
//!    |                                          |
//!    | open(): transport ──── raw channel ─────>| accept_connector()
//!    |-------- SessionDescriptor -------------->| accept(descriptor)
//!    |                                          |   prepare() per hop
//!    | wrap outward                             | open_incoming(): wrap outward
//!    |                                          |
//!    |<======= application bytes =============>| InvocationHandler
//! ```
//!
//! ## Layer Order
//!
//! | Layer           | Role                                |
//! |-----------------|-------------------------------------|
//! | `semantics`     | invocation semantics (outermost)    |
//! | `serialization` | object framing                      |
//! | `compression`   | stream modifier                     |
//! | `encryption`    | stream modifier                     |
//! | `routing`       | direct or gateway                   |
//! | `transport`     | physical or virtual link (innermost)|

mod capability;
mod negotiator;
mod pipeline;
mod session;

pub use capability::{
    Ability, CapabilitySource, ExtensionLayer, PluginCapability, PluginKey, Property,
    StaticCapabilities, SystemId,
};
pub use negotiator::StackNegotiator;
pub use pipeline::ConnectorPipeline;
pub use session::{
    read_descriptor, read_verdict, write_descriptor, write_verdict, Direction, HopDescriptor,
    Hops, Session, SessionDescriptor, SessionVerdict, MAX_VERDICT_LEN,
};
