//! Requirement dimensions.
//!
//! A dimension is one non-functional constraint within an extension layer,
//! such as "encryption level at least 128, ideally 256" or "compression is
//! required". Ordered dimensions carry an orientation so a hard threshold
//! and an optional soft target can be compared against offered values.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{PlexusError, Result};
use crate::protocol::Ability;

/// Well-known dimension identifiers.
pub mod ids {
    /// Unordered boolean; `true` makes the layer mandatory.
    pub const REQUIRED: &str = "required";
    /// Unordered ability code; restricts the layer to one plugin ability.
    pub const ABILITY: &str = "ability";
    /// Unordered text selector (e.g. a serialization type).
    pub const TYPE: &str = "type";
    /// Ordered strength/effort level of a modifier.
    pub const LEVEL: &str = "level";
    /// Unordered boolean; synchronous invocation semantics.
    pub const SYNCHRONOUS: &str = "synchronous";
    /// Unordered boolean; whether routing may use a gateway.
    pub const GATEWAY: &str = "gateway";
}

/// Value carried by a dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum DimensionValue {
    /// Boolean flag
    Bool(bool),
    /// Integer quantity or code
    Int(i64),
    /// Text selector
    Text(String),
}

impl DimensionValue {
    /// Compare two values of the same kind. Mixed kinds are incomparable.
    pub fn compare(&self, other: &DimensionValue) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Get the boolean payload, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the text payload, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for DimensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for DimensionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for DimensionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for DimensionValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for DimensionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Which direction of an ordered dimension is "better".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Larger values are better (e.g. key length)
    HigherIsBetter,
    /// Smaller values are better (e.g. latency)
    LowerIsBetter,
}

impl Orientation {
    /// Whether `candidate` is at least as good as `reference`.
    fn at_least(self, candidate: &DimensionValue, reference: &DimensionValue) -> Option<bool> {
        let ord = candidate.compare(reference)?;
        Some(match self {
            Self::HigherIsBetter => ord != Ordering::Less,
            Self::LowerIsBetter => ord != Ordering::Greater,
        })
    }
}

/// A single non-functional constraint.
///
/// Immutable after construction; `clone()` is the value copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    id: String,
    orientation: Option<Orientation>,
    hard: DimensionValue,
    soft: Option<DimensionValue>,
}

impl Dimension {
    /// Create an unordered dimension carrying only a hard value.
    pub fn unordered(id: &str, hard: impl Into<DimensionValue>) -> Self {
        Self {
            id: id.to_string(),
            orientation: None,
            hard: hard.into(),
            soft: None,
        }
    }

    /// Create an ordered dimension.
    ///
    /// Fails if `soft` is incomparable with `hard` or lies on the worse side
    /// of `hard` for the given orientation.
    pub fn ordered(
        id: &str,
        orientation: Orientation,
        hard: impl Into<DimensionValue>,
        soft: Option<DimensionValue>,
    ) -> Result<Self> {
        let hard = hard.into();
        if let Some(ref soft) = soft {
            match orientation.at_least(soft, &hard) {
                Some(true) => {},
                Some(false) => {
                    return Err(PlexusError::InvalidDimension(format!(
                        "{id}: soft value {soft} is worse than hard value {hard} ({orientation:?})"
                    )));
                },
                None => {
                    return Err(PlexusError::InvalidDimension(format!(
                        "{id}: soft value {soft} is not comparable with hard value {hard}"
                    )));
                },
            }
        }

        Ok(Self {
            id: id.to_string(),
            orientation: Some(orientation),
            hard,
            soft,
        })
    }

    /// `required = true`: the layer is mandatory.
    pub fn required() -> Self {
        Self::unordered(ids::REQUIRED, true)
    }

    /// Restrict a layer to the plugin with the given ability.
    pub fn ability(ability: Ability) -> Self {
        Self::unordered(ids::ABILITY, i64::from(ability.code()))
    }

    /// Ordered, higher-is-better `level` dimension.
    pub fn level(hard: i64, soft: Option<i64>) -> Result<Self> {
        Self::ordered(
            ids::LEVEL,
            Orientation::HigherIsBetter,
            hard,
            soft.map(DimensionValue::Int),
        )
    }

    /// Layer-local identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the dimension is ordered
    pub fn is_ordered(&self) -> bool {
        self.orientation.is_some()
    }

    /// Orientation of an ordered dimension
    pub fn orientation(&self) -> Option<Orientation> {
        self.orientation
    }

    /// Mandatory threshold
    pub fn hard(&self) -> &DimensionValue {
        &self.hard
    }

    /// Desired target, if any
    pub fn soft(&self) -> Option<&DimensionValue> {
        self.soft.as_ref()
    }

    /// Whether an offered value satisfies the hard requirement.
    ///
    /// Ordered dimensions accept anything at least as good as `hard`;
    /// unordered ones require equality.
    pub fn accepts(&self, offered: &DimensionValue) -> bool {
        match self.orientation {
            Some(orientation) => orientation.at_least(offered, &self.hard).unwrap_or(false),
            None => *offered == self.hard,
        }
    }

    /// Whether an offered value also reaches the soft target.
    ///
    /// Without a soft target this is the same as [`Dimension::accepts`].
    pub fn satisfies_soft(&self, offered: &DimensionValue) -> bool {
        match (self.orientation, &self.soft) {
            (Some(orientation), Some(soft)) => orientation.at_least(offered, soft).unwrap_or(false),
            _ => self.accepts(offered),
        }
    }
}
