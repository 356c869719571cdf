//! Parsing of `key=count` override pairs from the CLI.
use std::collections::HashMap;

use crate::error::{AppError, AppResult};

/// Parse repeatable `KEY=COUNT` arguments against the valid subcategory keys
/// of one section. Counts must be non-negative integers.
pub fn parse_count_pairs(
    items: &[String],
    valid: &[String],
) -> AppResult<HashMap<String, usize>> {
    let mut out = HashMap::new();
    for item in items {
        let Some((key, raw)) = item.split_once('=') else {
            return Err(AppError::Configuration(format!(
                "invalid override '{}', expected KEY=COUNT",
                item
            )));
        };
        let key = key.trim();
        if !valid.iter().any(|v| v == key) {
            let mut known = valid.to_vec();
            known.sort();
            return Err(AppError::Configuration(format!(
                "unknown subcategory '{}'; valid keys: {}",
                key,
                known.join(", ")
            )));
        }
        let count: usize = raw.trim().parse().map_err(|_| {
            AppError::Configuration(format!(
                "override '{}' must use a non-negative integer count",
                item
            ))
        })?;
        out.insert(key.to_string(), count);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Vec<String> {
        vec!["quality".to_string(), "lighting".to_string()]
    }

    #[test]
    fn parses_pairs() {
        let pairs = parse_count_pairs(
            &["quality=2".to_string(), "lighting=0".to_string()],
            &valid(),
        )
        .unwrap();
        assert_eq!(pairs.get("quality"), Some(&2));
        assert_eq!(pairs.get("lighting"), Some(&0));
    }

    #[test]
    fn rejects_bad_syntax_unknown_keys_and_negative_counts() {
        assert!(parse_count_pairs(&["quality".to_string()], &valid()).is_err());
        assert!(parse_count_pairs(&["framing=1".to_string()], &valid()).is_err());
        assert!(parse_count_pairs(&["quality=-1".to_string()], &valid()).is_err());
        assert!(parse_count_pairs(&["quality=two".to_string()], &valid()).is_err());
    }

    #[test]
    fn empty_input_is_empty_map() {
        assert!(parse_count_pairs(&[], &valid()).unwrap().is_empty());
    }
}
