//! Reusable buffer of precomputed target representations
//!
//! Evaluation scores every (head, relation) query against the full candidate
//! pool of one relation. Precomputing the pool's representations once and
//! reusing them across the relation's queries is what makes that affordable.
//! The cache is a keyed ordered buffer: an arena of representation pairs plus
//! the relation it was loaded for. Reads are non-destructive (`peek_all`);
//! the only way to shrink the cache is `clear` with the exact expected size.
//! A size or key mismatch means scores would silently compare against the
//! wrong relation's targets, so both are fatal.
//!
//! Single-threaded use only: one (relation, query) pipeline at a time.

use crate::models::EntityRepr;
use crate::EmbeddingError;
use anyhow::Result;
use tracing::debug;

/// Precomputed (content, title) pairs for one relation's candidate pool
#[derive(Debug, Default)]
pub struct TargetCache {
    relation: Option<usize>,
    entries: Vec<EntityRepr>,
}

impl TargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relation the cache is currently loaded for, if any
    pub fn relation(&self) -> Option<usize> {
        self.relation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a chunk of precomputed representations for `relation`.
    ///
    /// Chunks may be loaded repeatedly to fill a large pool. Loading for a
    /// different relation than the one already cached is fatal; the cache
    /// must be cleared between relations.
    pub fn load(&mut self, relation: usize, entries: Vec<EntityRepr>) -> Result<()> {
        match self.relation {
            Some(loaded) if loaded != relation => {
                return Err(EmbeddingError::CacheRelationMismatch {
                    loaded,
                    requested: relation,
                }
                .into());
            }
            _ => self.relation = Some(relation),
        }
        self.entries.extend(entries);
        Ok(())
    }

    /// Non-destructive ordered view of every cached entry
    pub fn peek_all(&self) -> &[EntityRepr] {
        &self.entries
    }

    /// Check that the cache holds exactly `expected` entries for `relation`.
    /// Called after a full precompute before any query is scored.
    pub fn verify(&self, relation: usize, expected: usize) -> Result<()> {
        if let Some(loaded) = self.relation {
            if loaded != relation {
                return Err(EmbeddingError::CacheRelationMismatch {
                    loaded,
                    requested: relation,
                }
                .into());
            }
        }
        if self.entries.len() != expected {
            return Err(EmbeddingError::CacheInvariant {
                expected,
                actual: self.entries.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Drop all entries, returning the cache to empty for the next relation.
    /// `expected` must match the current size exactly.
    pub fn clear(&mut self, expected: usize) -> Result<()> {
        if self.entries.len() != expected {
            return Err(EmbeddingError::CacheInvariant {
                expected,
                actual: self.entries.len(),
            }
            .into());
        }
        debug!(
            "drained target cache: {} entries for relation {:?}",
            expected, self.relation
        );
        self.entries.clear();
        self.relation = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn repr(seed: f32) -> EntityRepr {
        EntityRepr {
            content: Array1::from_vec(vec![seed, seed + 1.0]),
            title: Array1::from_vec(vec![seed - 1.0, seed]),
        }
    }

    #[test]
    fn test_chunked_load_then_clear_returns_to_empty() {
        // precompute(chunks summing to T) -> peek(T) -> clear(T), T = 3
        let mut cache = TargetCache::new();
        cache.load(5, vec![repr(0.0), repr(1.0)]).unwrap();
        cache.load(5, vec![repr(2.0)]).unwrap();
        cache.verify(5, 3).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.relation(), Some(5));

        // Reads never change the size
        let entries = cache.peek_all();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1], repr(1.0));
        assert_eq!(cache.len(), 3);

        cache.clear(3).unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.relation(), None);
    }

    #[test]
    fn test_empty_pool_is_valid() {
        let mut cache = TargetCache::new();
        cache.load(0, Vec::new()).unwrap();
        cache.verify(0, 0).unwrap();
        cache.clear(0).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_mixed_relation_load_is_fatal() {
        let mut cache = TargetCache::new();
        cache.load(1, vec![repr(0.0)]).unwrap();
        let err = cache.load(2, vec![repr(1.0)]).unwrap_err();
        let err = err.downcast::<EmbeddingError>().unwrap();
        assert_eq!(
            err,
            EmbeddingError::CacheRelationMismatch {
                loaded: 1,
                requested: 2
            }
        );
        // The failed load must not have touched the arena
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_size_mismatch_is_fatal() {
        let mut cache = TargetCache::new();
        cache.load(0, vec![repr(0.0), repr(1.0)]).unwrap();

        let err = cache.verify(0, 3).unwrap_err();
        let err = err.downcast::<EmbeddingError>().unwrap();
        assert_eq!(
            err,
            EmbeddingError::CacheInvariant {
                expected: 3,
                actual: 2
            }
        );

        let err = cache.clear(1).unwrap_err();
        let err = err.downcast::<EmbeddingError>().unwrap();
        assert_eq!(
            err,
            EmbeddingError::CacheInvariant {
                expected: 1,
                actual: 2
            }
        );
        // A failed clear leaves the cache untouched
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_reload_after_clear_accepts_new_relation() {
        let mut cache = TargetCache::new();
        cache.load(1, vec![repr(0.0)]).unwrap();
        cache.clear(1).unwrap();
        cache.load(2, vec![repr(1.0), repr(2.0)]).unwrap();
        assert_eq!(cache.relation(), Some(2));
        assert_eq!(cache.len(), 2);
    }
}
