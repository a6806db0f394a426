//! Identifier generation for stored records.

/// Generates a UUID v4 identifier for a stored record.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generates a topic API key.
///
/// Keys are generated once at topic creation and are immutable afterwards.
pub fn generate_api_key() -> String {
    format!("tk_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_keys_are_prefixed_and_unique() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert!(a.starts_with("tk_"));
        assert_ne!(a, b);
    }
}
