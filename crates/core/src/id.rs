//! Aggregate identity.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of an aggregate (e.g. an order).
///
/// Opaque to the system: any non-blank string chosen by the caller. It is the
/// broker ordering key on the write side and the projection key on the read
/// side, so it must stay stable for the lifetime of the entity.
///
/// Deserialization goes through the same validation as [`AggregateId::parse`],
/// so a blank id on the wire is rejected rather than silently accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AggregateId(String);

impl AggregateId {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::invalid_id("AggregateId: must not be blank"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AggregateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AggregateId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AggregateId> for String {
    fn from(value: AggregateId) -> Self {
        value.0
    }
}

impl FromStr for AggregateId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_ids_are_rejected() {
        assert!(AggregateId::parse("").is_err());
        assert!(AggregateId::parse("   ").is_err());
        assert!(matches!(
            "".parse::<AggregateId>(),
            Err(DomainError::InvalidId(_))
        ));
    }

    #[test]
    fn id_is_kept_verbatim() {
        let id = AggregateId::parse("o1").unwrap();
        assert_eq!(id.as_str(), "o1");
        assert_eq!(id.to_string(), "o1");
    }

    #[test]
    fn serde_is_transparent_and_validating() {
        let id: AggregateId = serde_json::from_str("\"order-42\"").unwrap();
        assert_eq!(id.as_str(), "order-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"order-42\"");

        let blank = serde_json::from_str::<AggregateId>("\"\"");
        assert!(blank.is_err());
    }
}
