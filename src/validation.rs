//! Validation for station, producer, and consumer names.
//!
//! All broker entities share one naming rule so a name is always usable as a
//! substrate subject token and as an object-store path segment:
//!
//! - not empty, at most 128 characters
//! - only lowercase ASCII alphanumerics, `_`, `-`, and `.`
//! - first and last character alphanumeric
//!
//! Dots are legal in external names but collide with subject hierarchy on
//! the substrate, so internal forms substitute `.` with `#`
//! ([`replace_delimiters`]) and human-facing surfaces reverse it
//! ([`revert_delimiters`]).

use crate::error::Error;

/// Maximum length for entity names.
pub const MAX_NAME_LENGTH: usize = 128;

const DELIMITER: char = '.';
const DELIMITER_REPLACEMENT: char = '#';

/// Validate an entity name against the shared naming rule.
///
/// `entity` names the kind being validated ("Station", "Consumer", …) and
/// only affects error messages. Callers lowercase before validating; this
/// function treats uppercase as an invalid character.
pub fn validate_name(name: &str, entity: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::Invalid(format!("{entity} name can not be empty")));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::Invalid(format!(
            "{entity} should be under {MAX_NAME_LENGTH} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'))
    {
        return Err(Error::Invalid(format!(
            "Only alphanumeric and the '_', '-', '.' characters are allowed in {entity}"
        )));
    }
    // Safe to index: the charset check above guarantees ASCII.
    let first = name.as_bytes()[0];
    let last = name.as_bytes()[name.len() - 1];
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err(Error::Invalid(format!(
            "{entity} name can not start or end with non alphanumeric character"
        )));
    }
    Ok(())
}

/// External → internal form: `.` becomes `#`.
pub fn replace_delimiters(name: &str) -> String {
    name.replace(DELIMITER, &DELIMITER_REPLACEMENT.to_string())
}

/// Internal → external form: `#` becomes `.`.
pub fn revert_delimiters(name: &str) -> String {
    name.replace(DELIMITER_REPLACEMENT, &DELIMITER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        for name in ["orders", "orders-v2", "site.orders", "a", "0", "a_b-c.d9"] {
            assert!(validate_name(name, "Station").is_ok(), "{name}");
        }
        let max = "a".repeat(MAX_NAME_LENGTH);
        assert!(validate_name(&max, "Station").is_ok());
    }

    #[test]
    fn rejects_empty() {
        let err = validate_name("", "Station").unwrap_err();
        assert!(err.to_string().contains("can not be empty"));
    }

    #[test]
    fn rejects_too_long() {
        let long = "a".repeat(MAX_NAME_LENGTH + 1);
        let err = validate_name(&long, "Station").unwrap_err();
        assert!(err.to_string().contains("under 128 characters"));
    }

    #[test]
    fn rejects_invalid_charset() {
        for name in ["Orders", "my station", "topic/name", "топик", "a:b", "a#b"] {
            let err = validate_name(name, "Station").unwrap_err();
            assert!(err.to_string().contains("alphanumeric"), "{name}");
        }
    }

    #[test]
    fn rejects_bad_first_or_last_char() {
        for name in [".orders", "-orders", "_orders", "orders.", "orders-", "orders_"] {
            let err = validate_name(name, "Station").unwrap_err();
            assert!(
                err.to_string().contains("start or end"),
                "{name}: {err}"
            );
        }
    }

    #[test]
    fn errors_are_showable() {
        assert!(validate_name("", "Consumer").unwrap_err().is_showable());
    }

    #[test]
    fn delimiter_substitution_is_a_bijection() {
        for name in ["site.orders", "a.b.c", "noseparator", "x.y"] {
            let internal = replace_delimiters(name);
            assert!(!internal.contains('.'));
            assert_eq!(revert_delimiters(&internal), name);
        }
    }
}
