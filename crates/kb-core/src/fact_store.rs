//! Content-addressed fact storage with a synchronous inverted keyword index.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::annotation::Annotation;
use crate::digest::content_hash;
use crate::error::{KbError, Missing, Result};
use crate::fact::{Fact, FactId, FactStatus};
use crate::time::now_unix_secs;
use crate::tokenizer::{keyword_set, normalize_keywords};

/// Outcome of [`FactStore::add_fact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddedFact {
    pub id: FactId,
    /// False when the content already existed and the call was a no-op.
    pub is_new: bool,
}

pub struct FactStore {
    facts: BTreeMap<FactId, Fact>,
    annotations: HashMap<FactId, Annotation>,
    by_hash: HashMap<String, FactId>,
    index: HashMap<String, BTreeSet<FactId>>,
    next_id: FactId,
}

impl Default for FactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FactStore {
    pub fn new() -> Self {
        Self {
            facts: BTreeMap::new(),
            annotations: HashMap::new(),
            by_hash: HashMap::new(),
            index: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Insert a fact, or return the existing id for identical content.
    ///
    /// Duplicates are the normal path for repeated ingestion: the stored
    /// annotation is left untouched and `is_new` is false.
    pub fn add_fact(&mut self, content: &str, annotation: Annotation) -> Result<AddedFact> {
        if let Some(id) = self.find_by_content(content) {
            return Ok(AddedFact { id, is_new: false });
        }
        if content.trim().is_empty() {
            return Err(KbError::InvalidFact("content is empty".to_string()));
        }
        annotation.validate()?;

        let id = self.next_id;
        self.next_id += 1;
        let fact = Fact::new(id, content, now_unix_secs());
        self.insert(fact, annotation);
        Ok(AddedFact { id, is_new: true })
    }

    fn insert(&mut self, fact: Fact, annotation: Annotation) {
        for token in keyword_set(&fact.content) {
            self.index.entry(token).or_default().insert(fact.id);
        }
        self.by_hash.insert(fact.content_hash.clone(), fact.id);
        self.annotations.insert(fact.id, annotation);
        self.facts.insert(fact.id, fact);
    }

    /// Undo an insertion whose persistence failed. The id is not reused.
    pub fn retract(&mut self, id: FactId) -> Option<(Fact, Annotation)> {
        let fact = self.facts.remove(&id)?;
        let annotation = self.annotations.remove(&id)?;
        self.by_hash.remove(&fact.content_hash);
        for token in keyword_set(&fact.content) {
            if let Some(ids) = self.index.get_mut(&token) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.index.remove(&token);
                }
            }
        }
        Some((fact, annotation))
    }

    pub fn get_fact(&self, id: FactId) -> Result<&Fact> {
        self.facts
            .get(&id)
            .ok_or(KbError::NotFound(Missing::Fact(id)))
    }

    pub fn annotation(&self, id: FactId) -> Result<&Annotation> {
        self.annotations
            .get(&id)
            .ok_or(KbError::NotFound(Missing::Annotation(id)))
    }

    /// Id of the fact with exactly this content, if stored.
    pub fn find_by_content(&self, content: &str) -> Option<FactId> {
        self.by_hash.get(&content_hash(content)).copied()
    }

    pub fn facts(&self) -> impl Iterator<Item = &Fact> {
        self.facts.values()
    }

    /// Union of index entries for the given keywords, active facts only.
    /// No ranking is applied.
    pub fn query<I, S>(&self, keywords: I) -> Result<BTreeSet<FactId>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hits = BTreeSet::new();
        for token in normalize_keywords(keywords) {
            let Some(ids) = self.index.get(&token) else {
                continue;
            };
            for &id in ids {
                let fact = self.facts.get(&id).ok_or_else(|| KbError::CorruptIndex {
                    token: token.clone(),
                    fact_id: id,
                })?;
                if fact.is_active() {
                    hits.insert(id);
                }
            }
        }
        Ok(hits)
    }

    /// Move a fact through its lifecycle; returns the previous status.
    pub fn set_status(&mut self, id: FactId, status: FactStatus) -> Result<FactStatus> {
        let fact = self
            .facts
            .get_mut(&id)
            .ok_or(KbError::NotFound(Missing::Fact(id)))?;
        let from = fact.status;
        if !from.can_transition_to(status) {
            return Err(KbError::InvalidTransition {
                id,
                from,
                to: status,
            });
        }
        fact.status = status;
        Ok(from)
    }

    /// Record a correction: add `content` as a new fact and deprecate `old`.
    ///
    /// The correction may not come from a less immutable epistemic level
    /// than the fact it replaces.
    pub fn supersede_fact(
        &mut self,
        old: FactId,
        content: &str,
        annotation: Annotation,
    ) -> Result<AddedFact> {
        let existing = self.annotation(old)?.epistemic_level;
        let status = self.get_fact(old)?.status;
        if !annotation.epistemic_level.can_override(existing) {
            return Err(KbError::EpistemicOverride {
                id: old,
                existing: existing.to_string(),
                attempted: annotation.epistemic_level.to_string(),
            });
        }
        if !status.can_transition_to(FactStatus::Deprecated) {
            return Err(KbError::InvalidTransition {
                id: old,
                from: status,
                to: FactStatus::Deprecated,
            });
        }
        let added = self.add_fact(content, annotation)?;
        if added.id == old {
            return Err(KbError::InvalidFact(
                "correction has the same content as the fact it supersedes".to_string(),
            ));
        }
        self.set_status(old, FactStatus::Deprecated)?;
        Ok(added)
    }

    pub fn touch(&mut self, id: FactId, now: u64) -> Result<()> {
        self.facts
            .get_mut(&id)
            .ok_or(KbError::NotFound(Missing::Fact(id)))?
            .touch(now);
        Ok(())
    }

    /// Index keys for one fact, as persisted alongside it.
    pub fn tokens_for(&self, id: FactId) -> Result<BTreeSet<String>> {
        Ok(keyword_set(&self.get_fact(id)?.content))
    }

    /// Ordered view of the whole index (token → fact ids).
    pub fn index_entries(&self) -> BTreeMap<&str, &BTreeSet<FactId>> {
        self.index.iter().map(|(k, v)| (k.as_str(), v)).collect()
    }

    /// Check that every index entry points at an existing fact.
    pub fn verify_index(&self) -> Result<()> {
        for (token, ids) in &self.index {
            if let Some(&missing) = ids.iter().find(|&&id| !self.facts.contains_key(&id)) {
                return Err(KbError::CorruptIndex {
                    token: token.clone(),
                    fact_id: missing,
                });
            }
        }
        Ok(())
    }

    /// Recompute the index from fact content. Returns the token count.
    pub fn rebuild_index(&mut self) -> usize {
        self.index.clear();
        for fact in self.facts.values() {
            for token in keyword_set(&fact.content) {
                self.index.entry(token).or_default().insert(fact.id);
            }
        }
        self.index.len()
    }

    // --- Restore hooks for the persistence layer ---

    /// Load a stored fact without re-deriving its id or timestamps.
    /// The index is restored separately via [`restore_index_entry`](Self::restore_index_entry).
    pub fn restore(&mut self, fact: Fact, annotation: Annotation) {
        self.next_id = self.next_id.max(fact.id + 1);
        self.by_hash.insert(fact.content_hash.clone(), fact.id);
        self.annotations.insert(fact.id, annotation);
        self.facts.insert(fact.id, fact);
    }

    pub fn restore_index_entry(&mut self, token: &str, ids: impl IntoIterator<Item = FactId>) {
        self.index
            .entry(token.to_string())
            .or_default()
            .extend(ids);
    }

    /// Make sure freshly assigned ids never collide with ids seen on disk.
    pub fn reserve_ids_through(&mut self, max_id: FactId) {
        self.next_id = self.next_id.max(max_id + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{Derivation, EpistemicLevel};

    fn ann(confidence: f64) -> Annotation {
        Annotation::new(confidence)
    }

    #[test]
    fn test_idempotent_insertion() {
        let mut store = FactStore::new();
        let a = store.add_fact("PLA requires 60°C for gelling", ann(0.92)).unwrap();
        let b = store.add_fact("PLA requires 60°C for gelling", ann(0.92)).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.is_new);
        assert!(!b.is_new);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_first_annotation_wins() {
        let mut store = FactStore::new();
        let a = store.add_fact("water boils at 100C", ann(0.9)).unwrap();
        store.add_fact("water boils at 100C", ann(0.1)).unwrap();
        assert_eq!(store.annotation(a.id).unwrap().confidence, 0.9);
    }

    #[test]
    fn test_duplicate_skips_annotation_validation() {
        let mut store = FactStore::new();
        store.add_fact("stable", ann(0.9)).unwrap();
        // Invalid annotation on a duplicate is ignored, not an error.
        assert!(store.add_fact("stable", ann(7.0)).is_ok());
    }

    #[test]
    fn test_rejects_empty_and_invalid() {
        let mut store = FactStore::new();
        assert!(matches!(
            store.add_fact("   ", ann(0.5)),
            Err(KbError::InvalidFact(_))
        ));
        assert!(matches!(
            store.add_fact("x", ann(-0.1)),
            Err(KbError::InvalidAnnotation(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_fact_not_found() {
        let store = FactStore::new();
        assert_eq!(
            store.get_fact(42).unwrap_err(),
            KbError::NotFound(Missing::Fact(42))
        );
    }

    #[test]
    fn test_query_union_case_insensitive() {
        let mut store = FactStore::new();
        let a = store.add_fact("PLA requires 60°C for gelling", ann(0.9)).unwrap().id;
        let b = store.add_fact("Agar gelling happens on cooling", ann(0.9)).unwrap().id;
        let c = store.add_fact("Steel is an alloy", ann(0.9)).unwrap().id;

        let hits = store.query(["GELLING"]).unwrap();
        assert_eq!(hits, BTreeSet::from([a, b]));

        let hits = store.query(["pla", "steel"]).unwrap();
        assert_eq!(hits, BTreeSet::from([a, c]));

        assert!(store.query(["nothing"]).unwrap().is_empty());
    }

    #[test]
    fn test_query_skips_inactive() {
        let mut store = FactStore::new();
        let a = store.add_fact("old gelling rule", ann(0.9)).unwrap().id;
        store.set_status(a, FactStatus::Archived).unwrap();
        assert!(store.query(["gelling"]).unwrap().is_empty());
        store.set_status(a, FactStatus::Active).unwrap();
        assert_eq!(store.query(["gelling"]).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_index_detected_and_rebuilt() {
        let mut store = FactStore::new();
        store.add_fact("copper conducts", ann(0.9)).unwrap();
        store.restore_index_entry("copper", [99]);

        assert!(matches!(
            store.query(["copper"]),
            Err(KbError::CorruptIndex { fact_id: 99, .. })
        ));
        assert!(store.verify_index().is_err());

        store.rebuild_index();
        assert!(store.verify_index().is_ok());
        assert_eq!(store.query(["copper"]).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_transition() {
        let mut store = FactStore::new();
        let id = store.add_fact("x marks", ann(0.5)).unwrap().id;
        store.set_status(id, FactStatus::Tombstone).unwrap();
        assert!(matches!(
            store.set_status(id, FactStatus::Active),
            Err(KbError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_supersede_deprecates_old() {
        let mut store = FactStore::new();
        let old = store.add_fact("PLA gels at 50C", ann(0.6)).unwrap().id;
        let new = store
            .supersede_fact(old, "PLA gels at 60C", ann(0.9))
            .unwrap();
        assert!(new.is_new);
        assert_eq!(store.get_fact(old).unwrap().status, FactStatus::Deprecated);
        assert!(store.get_fact(new.id).unwrap().is_active());
    }

    #[test]
    fn test_supersede_respects_epistemic_level() {
        let mut store = FactStore::new();
        let old = store
            .add_fact("mass is conserved", ann(0.99).with_level(EpistemicLevel::Empirical))
            .unwrap()
            .id;
        let err = store
            .supersede_fact(
                old,
                "mass feels conserved",
                ann(0.5).with_level(EpistemicLevel::Persona),
            )
            .unwrap_err();
        assert!(matches!(err, KbError::EpistemicOverride { .. }));
        assert!(store.get_fact(old).unwrap().is_active());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_retract_removes_everything() {
        let mut store = FactStore::new();
        let id = store
            .add_fact("ephemeral insight", ann(0.5).with_derivation(Derivation::positive("x")))
            .unwrap()
            .id;
        assert!(store.retract(id).is_some());
        assert!(store.is_empty());
        assert!(store.query(["ephemeral"]).unwrap().is_empty());
        assert!(store.find_by_content("ephemeral insight").is_none());
        // Id is not reused.
        let next = store.add_fact("another", ann(0.5)).unwrap().id;
        assert_ne!(next, id);
    }

    #[test]
    fn test_restore_advances_next_id() {
        let mut store = FactStore::new();
        store.restore(Fact::new(7, "restored fact", 0), ann(0.8));
        store.rebuild_index();
        let id = store.add_fact("fresh fact", ann(0.8)).unwrap().id;
        assert_eq!(id, 8);
        assert_eq!(store.query(["restored"]).unwrap(), BTreeSet::from([7]));
    }
}
