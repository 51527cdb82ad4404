//! Identifier types for compute resources.

use crate::{define_id, IdError};

// =============================================================================
// Canonical identifiers
// =============================================================================

define_id!(InstanceId, "inst");
define_id!(OperationId, "op");
define_id!(AddressId, "addr");

// =============================================================================
// Presentation identifiers
// =============================================================================

/// Opaque numeric `id` shown to API clients.
///
/// Drawn at random from the non-zero `u64` space and serialised as a decimal
/// string, which is how the emulated provider renders resource ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NumericId(u64);

impl NumericId {
    /// Draws a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        loop {
            let value: u64 = rand::random();
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Wraps an existing value. Returns `None` for zero.
    #[must_use]
    pub const fn new(value: u64) -> Option<Self> {
        if value == 0 {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Returns the underlying integer.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NumericId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NumericId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        s.parse::<u64>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| IdError::InvalidNumeric(s.to_string()))
    }
}

impl serde::Serialize for NumericId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for NumericId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
