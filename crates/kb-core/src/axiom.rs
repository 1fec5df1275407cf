use serde::{Deserialize, Serialize};

/// A named set of concepts a cartridge's grains are expected to support.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainAxiom {
    pub name: String,
    pub concepts: Vec<String>,
}

impl DomainAxiom {
    pub fn new<I, S>(name: &str, concepts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = Vec::new();
        for c in concepts {
            let c = c.as_ref().trim().to_lowercase();
            if !c.is_empty() && !seen.contains(&c) {
                seen.push(c);
            }
        }
        Self {
            name: name.trim().to_string(),
            concepts: seen,
        }
    }

    /// Concepts found, case-insensitively, in any of `haystacks`.
    /// Haystacks are expected to be lower-cased already.
    pub fn matched_concepts(&self, haystacks: &[String]) -> usize {
        self.concepts
            .iter()
            .filter(|c| haystacks.iter().any(|h| h.contains(c.as_str())))
            .count()
    }
}
