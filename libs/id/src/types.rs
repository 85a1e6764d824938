//! Typed ID definitions.

use crate::{define_id, define_uuid_id};

// =============================================================================
// Platform IDs
// =============================================================================

// A dynamic service instance, i.e. one node of a project's workbench.
define_uuid_id!(InstanceId);
define_uuid_id!(ProjectId);

/// Platform user. Users are numbered by the outer platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(u64);

impl UserId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self, crate::IdError> {
        if s.is_empty() {
            return Err(crate::IdError::Empty);
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| crate::IdError::InvalidNumber(e.to_string()))
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = crate::IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for UserId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = u64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Scheduler IDs
// =============================================================================

// Regenerated every time an instance's sidecar is (re)created.
define_id!(RunId, "run");

// Owner token written into a distributed lock.
define_id!(LockToken, "lock");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_run_id_roundtrip() {
        let id = RunId::new();
        let s = id.to_string();
        let parsed: RunId = s.parse().unwrap();
        assert_eq!(id, parsed);
        assert!(s.starts_with("run_"));
    }

    #[test]
    fn test_run_id_invalid_prefix() {
        let result: Result<RunId, _> = "lock_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_run_id_missing_separator() {
        let result: Result<RunId, _> = "run01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_run_id_invalid_ulid() {
        let result: Result<RunId, _> = "run_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_instance_id_is_plain_uuid() {
        let raw = "2b4d6c4e-5a8f-4d1c-9a55-0c3f1e7d2b10";
        let id: InstanceId = raw.parse().unwrap();
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn test_instance_id_rejects_garbage() {
        let result: Result<InstanceId, _> = "not-a-uuid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUuid(_)));
        let empty: Result<InstanceId, _> = "".parse();
        assert!(empty.unwrap_err().is_empty());
    }

    #[test]
    fn test_instance_id_json_is_string() {
        let id = InstanceId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_user_id_json_is_number() {
        let id = UserId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        assert_eq!("42".parse::<UserId>().unwrap(), id);
        assert!("forty-two".parse::<UserId>().is_err());
    }

    proptest! {
        #[test]
        fn prop_instance_id_parse_display(bytes in any::<[u8; 16]>()) {
            let id = InstanceId::from_uuid(crate::Uuid::from_bytes(bytes));
            let parsed: InstanceId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }

        #[test]
        fn prop_run_id_parse_display(raw in any::<u128>()) {
            let id = RunId::from_ulid(crate::Ulid(raw));
            let parsed: RunId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
