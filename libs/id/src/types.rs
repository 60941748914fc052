//! Name and ID definitions.

use crate::{define_id, define_name, IdError};

/// Maximum length of a name, in bytes.
pub const MAX_NAME_LEN: usize = 253;

/// Validates a name.
///
/// Names must be non-empty, at most [`MAX_NAME_LEN`] bytes, and free of
/// whitespace and control characters.
pub fn validate_name(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > MAX_NAME_LEN {
        return Err(IdError::TooLong {
            max: MAX_NAME_LEN,
            actual: s.len(),
        });
    }
    if let Some((position, ch)) = s
        .char_indices()
        .find(|(_, c)| c.is_whitespace() || c.is_control())
    {
        return Err(IdError::InvalidCharacter { ch, position });
    }
    Ok(())
}

// =============================================================================
// Names
// =============================================================================

define_name!(
    /// Name of a model, pipeline, experiment or server, unique within its kind.
    ResourceName
);

define_name!(
    /// Identifier of an independent status reporter (a serving replica or a
    /// dataflow engine instance).
    ReporterId
);

// =============================================================================
// IDs
// =============================================================================

define_id!(
    /// Identifier of one published status event, carried into log spans.
    EventId,
    "evt"
);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resource_name_roundtrip() {
        let name: ResourceName = "iris-classifier".parse().unwrap();
        assert_eq!(name.as_str(), "iris-classifier");
        assert_eq!(name.to_string(), "iris-classifier");
    }

    #[test]
    fn test_name_empty() {
        let result: Result<ResourceName, _> = "".parse();
        assert!(matches!(result.unwrap_err(), IdError::Empty));
    }

    #[test]
    fn test_name_too_long() {
        let long = "a".repeat(MAX_NAME_LEN + 1);
        let result = ReporterId::parse(&long);
        assert_eq!(
            result.unwrap_err(),
            IdError::TooLong {
                max: MAX_NAME_LEN,
                actual: MAX_NAME_LEN + 1
            }
        );
        assert!(ReporterId::parse(&"a".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_name_rejects_whitespace() {
        let result = ResourceName::parse("my model");
        assert_eq!(
            result.unwrap_err(),
            IdError::InvalidCharacter {
                ch: ' ',
                position: 2
            }
        );
        assert!(ResourceName::parse("tab\there").is_err());
    }

    #[test]
    fn test_name_json_rejects_invalid() {
        let ok: ReporterId = serde_json::from_str("\"mlserver-0\"").unwrap();
        assert_eq!(ok.as_str(), "mlserver-0");

        let bad: Result<ReporterId, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_name_borrow_lookup() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(ResourceName::parse("m1").unwrap(), 1);
        assert_eq!(map.get("m1"), Some(&1));
    }

    #[test]
    fn test_event_id_roundtrip() {
        let id = EventId::new();
        let s = id.to_string();
        assert!(s.starts_with("evt_"));
        let parsed: EventId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_event_id_invalid_prefix() {
        let result: Result<EventId, _> = "req_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(
            result.unwrap_err(),
            IdError::InvalidPrefix {
                expected: "evt",
                actual: "req".to_string(),
            }
        );
    }

    #[test]
    fn test_event_id_missing_separator() {
        let result: Result<EventId, _> = "evt01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), IdError::MissingSeparator));
    }

    #[test]
    fn test_event_id_empty_and_bad_ulid() {
        assert_eq!(EventId::parse("").unwrap_err(), IdError::Empty);
        assert!(matches!(
            EventId::parse("evt_not-a-ulid").unwrap_err(),
            IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_event_ids_order_by_creation_time() {
        let first = EventId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = EventId::new();
        assert!(first.timestamp_ms() < second.timestamp_ms());
        assert!(first < second);
    }

    #[test]
    fn test_event_id_json_roundtrip() {
        let id = EventId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    proptest! {
        #[test]
        fn prop_valid_names_roundtrip(s in "[a-z0-9][a-z0-9.-]{0,62}") {
            let name = ResourceName::parse(&s).unwrap();
            let json = serde_json::to_string(&name).unwrap();
            let back: ResourceName = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(name, back);
        }
    }
}
