use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s']").unwrap());
static APOSTROPHE_TRIM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^'+|'+$").unwrap());

/// Tokenize text into lowercase words.
/// Preserves apostrophes within words (e.g., "don't").
/// No stemming, no stop-word removal.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned = NON_WORD.replace_all(text, " ");
    cleaned
        .to_lowercase()
        .split_whitespace()
        .map(|t| APOSTROPHE_TRIM.replace_all(t, "").to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Distinct index keys for a piece of fact content.
pub fn keyword_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Normalize caller-supplied query keywords the same way content is indexed.
/// A keyword like `"Gelling!"` becomes `gelling`; multi-word input splits.
pub fn normalize_keywords<I, S>(keywords: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keywords
        .into_iter()
        .flat_map(|k| tokenize(k.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_tokenize() {
        assert_eq!(tokenize("Hello, world!"), vec!["hello", "world"]);
    }

    #[test]
    fn test_apostrophe_preserved() {
        assert_eq!(tokenize("Don't stop!"), vec!["don't", "stop"]);
    }

    #[test]
    fn test_degree_sign_splits_number() {
        assert_eq!(
            tokenize("PLA requires 60°C for gelling"),
            vec!["pla", "requires", "60", "c", "for", "gelling"]
        );
    }

    #[test]
    fn test_whitespace_only() {
        assert!(tokenize("   \t\n  ").is_empty());
    }

    #[test]
    fn test_keyword_set_dedups() {
        let set = keyword_set("heat heat HEAT transfer");
        assert_eq!(set.len(), 2);
        assert!(set.contains("heat"));
        assert!(set.contains("transfer"));
    }

    #[test]
    fn test_normalize_keywords() {
        let set = normalize_keywords(["Gelling!", "PLA polymer"]);
        let expected: BTreeSet<String> = ["gelling", "pla", "polymer"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(set, expected);
    }
}
