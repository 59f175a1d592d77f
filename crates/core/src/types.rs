//! Shared type aliases and id generation.

/// Flow ids are opaque strings, unique per submission.
pub type FlowId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh flow id.
///
/// The id is a v4 UUID rendered as a string. Callers must treat it as
/// opaque; nothing in the system parses it back.
pub fn new_flow_id() -> FlowId {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_ids_are_unique() {
        let a = new_flow_id();
        let b = new_flow_id();
        assert_ne!(a, b);
    }

    #[test]
    fn flow_id_is_nonempty() {
        assert!(!new_flow_id().is_empty());
    }
}
