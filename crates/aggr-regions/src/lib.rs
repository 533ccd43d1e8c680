//! Region Merger (`spec.md` §4.3).
//!
//! A pure, deterministic, side-effect-free function over region sets.
//! `existing_regions` may be a JSON array (`["Beijing","Shanghai"]`) or
//! a comma-joined string (`"Beijing,Shanghai"`); `additions` elements
//! (LLM-provided regions, or a news item's `city_name`) may be either
//! shape too. Empty tokens and the literal placeholders `null`/`None`
//! (case-insensitive — upstream sources emit both Python's `None` and
//! JSON's `null` depending on the producing service) are dropped.

use std::collections::BTreeSet;

/// Split one region-ish string into trimmed, non-empty, non-placeholder
/// tokens. Tries JSON-array decoding first, falls back to a comma
/// split — matching the two shapes `regions` and `city_name` are
/// observed to take upstream.
fn tokenize(input: &str) -> Vec<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let raw_tokens: Vec<String> = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<String>>(trimmed).unwrap_or_else(|_| {
            trimmed
                .split(',')
                .map(|s| s.to_string())
                .collect()
        })
    } else {
        trimmed.split(',').map(|s| s.to_string()).collect()
    };

    raw_tokens
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && !is_placeholder(t))
        .collect()
}

fn is_placeholder(token: &str) -> bool {
    matches!(token.to_ascii_lowercase().as_str(), "null" | "none")
}

/// Canonicalize a token set: sorted, de-duplicated, comma-joined.
/// A single-element result is returned without commas.
fn canonicalize(tokens: BTreeSet<String>) -> String {
    tokens.into_iter().collect::<Vec<_>>().join(",")
}

/// Merge `existing` with every string in `additions` into a canonical
/// region set. Each element of `additions` is tokenized the same way
/// as `existing` (comma-joined or JSON-array), so this accepts either
/// a single news item's `city_name` or another already-merged regions
/// string as an addition.
pub fn merge(existing: &str, additions: &[&str]) -> String {
    let mut tokens: BTreeSet<String> = tokenize(existing).into_iter().collect();
    for addition in additions {
        tokens.extend(tokenize(addition));
    }
    canonicalize(tokens)
}

/// Convenience wrapper over [`merge`] for the Aggregation/Merge
/// Engines: `existing_regions` plus the `city_name` tokens of a set of
/// attached news items.
pub fn merge_with_city_names(existing_regions: &str, city_names: &[String]) -> String {
    let refs: Vec<&str> = city_names.iter().map(|s| s.as_str()).collect();
    merge(existing_regions, &refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn merge_empty_is_empty() {
        assert_eq!(merge("", &[]), "");
    }

    #[test]
    fn merge_single_value_has_no_comma() {
        assert_eq!(merge("X", &["X"]), "X");
    }

    #[test]
    fn merge_drops_placeholders() {
        assert_eq!(merge("Beijing,null,None,,", &[]), "Beijing");
    }

    #[test]
    fn merge_accepts_json_array_existing() {
        let result = merge(r#"["Beijing","Shanghai"]"#, &["Beijing"]);
        assert_eq!(result, "Beijing,Shanghai");
    }

    #[test]
    fn merge_with_city_names_unions_and_sorts() {
        let result = merge_with_city_names("Shanghai", &["Beijing".to_string(), "Shanghai".to_string()]);
        assert_eq!(result, "Beijing,Shanghai");
    }

    fn token_strategy() -> impl Strategy<Value = String> {
        "[A-Za-z]{1,8}"
    }

    proptest! {
        #[test]
        fn merge_is_associative(a in prop::collection::vec(token_strategy(), 0..4),
                                 b in prop::collection::vec(token_strategy(), 0..4),
                                 c in prop::collection::vec(token_strategy(), 0..4)) {
            let a_str = a.join(",");
            let b_str = b.join(",");
            let c_str = c.join(",");

            let left = merge(&merge(&a_str, &[&b_str]), &[&c_str]);
            let bc = merge(&b_str, &[&c_str]);
            let right = merge(&a_str, &[&bc]);

            prop_assert_eq!(left, right);
        }

        #[test]
        fn merge_is_idempotent_on_repeat(a in prop::collection::vec(token_strategy(), 0..4)) {
            let a_str = a.join(",");
            let once = merge(&a_str, &[]);
            let twice = merge(&once, &[&once]);
            prop_assert_eq!(once, twice);
        }
    }
}
