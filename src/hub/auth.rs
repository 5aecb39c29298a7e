// =============================================================================
// ClientHub authentication gate
// =============================================================================
//
// Grounded on `api/auth.rs`'s `constant_time_eq` and token-validation
// style; reused directly via `upstream::signing::constant_time_eq` rather
// than duplicating the comparison.

use crate::upstream::signing::constant_time_eq;

pub fn validate_token(expected: &str, provided: &str) -> bool {
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_token_is_valid() {
        assert!(validate_token("secret-token", "secret-token"));
    }

    #[test]
    fn mismatched_token_is_invalid() {
        assert!(!validate_token("secret-token", "wrong-token"));
    }

    #[test]
    fn empty_provided_token_is_invalid() {
        assert!(!validate_token("secret-token", ""));
    }
}
