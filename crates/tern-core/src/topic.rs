//! Topic name and topic filter validation and matching.
//!
//! Topic names are concrete publish addresses and may not contain wildcards.
//! Topic filters may contain `+` (exactly one level) and a trailing `#`
//! (zero or more levels). Levels are separated by `/`.

use crate::error::{ProtocolError, Result};

/// Maximum length of a topic name or filter in octets.
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Validate a topic name: non-empty, at most 65535 octets, no wildcards.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TOPIC_LEN || name.contains(['+', '#']) {
        return Err(ProtocolError::InvalidTopicName(name.to_string()).into());
    }
    Ok(())
}

/// Validate a topic filter.
///
/// `+` must occupy a whole level (bounded by `/` or the string ends) and `#`
/// must be the final level of the filter.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() || filter.len() > MAX_TOPIC_LEN {
        return Err(ProtocolError::InvalidTopicFilter(filter.to_string()).into());
    }

    let bytes = filter.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        let level_start = i == 0 || bytes[i - 1] == b'/';
        match b {
            b'+' => {
                let level_end = i + 1 == bytes.len() || bytes[i + 1] == b'/';
                if !level_start || !level_end {
                    return Err(ProtocolError::InvalidTopicFilter(filter.to_string()).into());
                }
            }
            b'#' => {
                if !level_start || i + 1 != bytes.len() {
                    return Err(ProtocolError::InvalidTopicFilter(filter.to_string()).into());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check whether a topic filter matches a topic name.
///
/// Matching is level-by-level. `+` matches exactly one level of any content,
/// `#` matches all remaining levels including zero (so `a/#` matches the
/// parent `a`). Topic names starting with `$` are never matched by a filter
/// that does not also start with `$`, and vice versa.
pub fn matches(filter: &str, name: &str) -> bool {
    if filter.is_empty() || name.is_empty() {
        return false;
    }

    if filter.starts_with('$') != name.starts_with('$') {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut name_levels = name.split('/');

    loop {
        match (filter_levels.next(), name_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(n)) if f == n => {}
            (Some(_), Some(_)) => return false,
            (Some(_), None) => return false,
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("a/b/c").is_ok());
        assert!(validate_name("/").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/+/c").is_err());
        assert!(validate_name("a/#").is_err());
        assert!(validate_name(&"x".repeat(MAX_TOPIC_LEN)).is_ok());
        assert!(validate_name(&"x".repeat(MAX_TOPIC_LEN + 1)).is_err());
    }

    #[test]
    fn test_filter_validation() {
        assert!(validate_filter("a/b/c").is_ok());
        assert!(validate_filter("+").is_ok());
        assert!(validate_filter("#").is_ok());
        assert!(validate_filter("a/+/c").is_ok());
        assert!(validate_filter("a/#").is_ok());
        assert!(validate_filter("+/+/+").is_ok());
        assert!(validate_filter("+/#").is_ok());

        assert!(validate_filter("").is_err());
        assert!(validate_filter("a+").is_err());
        assert!(validate_filter("+a").is_err());
        assert!(validate_filter("a/b+/c").is_err());
        assert!(validate_filter("a/#/c").is_err());
        assert!(validate_filter("a#").is_err());
        assert!(validate_filter("#/a").is_err());
        assert!(validate_filter(&"x".repeat(MAX_TOPIC_LEN + 1)).is_err());
    }

    #[test]
    fn test_exact_matching() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b/d"));
        assert!(!matches("", "a"));
        assert!(!matches("a", ""));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("+/b/c", "a/b/c"));
        assert!(matches("a/+/c", "a/b/c"));
        assert!(matches("a/b/+", "a/b/c"));
        assert!(matches("+/+/+", "a/b/c"));
        assert!(matches("a/+", "a/"));
        assert!(!matches("+", "a/b"));
        assert!(!matches("+//+", "a/b/c"));
        assert!(!matches("a/b/+/", "a/b/c"));
        assert!(!matches("a/+", "a"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("#", "a"));
        assert!(matches("#", "a/b/c"));
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("a/#", "a/b"));
        // A filter ending in /# also matches the parent level
        assert!(matches("a/#", "a"));
        assert!(matches("a/b/#", "a/b"));
        assert!(!matches("a/#", "b"));
        assert!(!matches("a/b/#", "a"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!matches("#", "$sys/broker"));
        assert!(!matches("+/broker", "$sys/broker"));
        assert!(matches("$sys/#", "$sys/broker"));
        assert!(matches("$sys/broker", "$sys/broker"));
        assert!(!matches("$sys/#", "sys/broker"));
    }
}
