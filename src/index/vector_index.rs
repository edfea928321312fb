//! Exact nearest-neighbor index over a sharded concurrent map.
//!
//! Entries are stored as `Arc<IndexEntry>` and swapped whole, so a reader
//! holding an entry always sees a complete vector with its metadata. Writers
//! to different ids touch different shards and do not wait on each other.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{IndexError, IndexMetadata, Metric, PersistedVector, SearchFilter, SearchHit};
use crate::embedding::EmbeddingVector;
use crate::normalize::EntryId;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: EntryId,
    pub vector: EmbeddingVector,
    pub metadata: IndexMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Replaced,
}

pub struct VectorIndex {
    entries: DashMap<EntryId, Arc<IndexEntry>>,
    dimension: usize,
    metric: Metric,
}

impl VectorIndex {
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            entries: DashMap::new(),
            dimension,
            metric,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &EntryId) -> Option<Arc<IndexEntry>> {
        self.entries.get(id).map(|e| Arc::clone(e.value()))
    }

    fn check_vector(&self, values: &[f32]) -> Result<(), IndexError> {
        if values.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::InvalidVector("non-finite component".to_string()));
        }
        Ok(())
    }

    /// Insert or replace the vector for `id`. Replacement is a single swap.
    pub fn insert(
        &self,
        id: EntryId,
        vector: EmbeddingVector,
        metadata: IndexMetadata,
    ) -> Result<InsertOutcome, IndexError> {
        self.check_vector(vector.as_slice())?;
        let entry = Arc::new(IndexEntry {
            id: id.clone(),
            vector,
            metadata,
        });
        match self.entries.insert(id, entry) {
            Some(_) => Ok(InsertOutcome::Replaced),
            None => Ok(InsertOutcome::Inserted),
        }
    }

    /// Remove `id`. Returns whether it was present; absence is not an error.
    pub fn delete(&self, id: &EntryId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Top `k` matches by descending similarity. Ties go to the more recent
    /// entry, then to the smaller entry id.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, IndexError> {
        self.check_vector(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        // Min-heap of the best k seen so far; the root is the weakest.
        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);
        for item in self.entries.iter() {
            let entry = item.value();
            if !filter.matches(&entry.metadata) {
                continue;
            }
            let score = self.metric.similarity(query, entry.vector.as_slice());
            // total_cmp puts NaN above every real score; rank it last instead.
            let score = if score.is_nan() { f32::NEG_INFINITY } else { score };
            heap.push(Reverse(Ranked {
                score,
                entry: Arc::clone(entry),
            }));
            if heap.len() > k {
                heap.pop();
            }
        }

        let mut ranked: Vec<Ranked> = heap.into_iter().map(|Reverse(r)| r).collect();
        ranked.sort_by(|a, b| b.cmp(a));

        debug!(k, hits = ranked.len(), "index search");
        Ok(ranked
            .into_iter()
            .map(|r| SearchHit {
                entry_id: r.entry.id.clone(),
                score: r.score,
                metadata: r.entry.metadata.clone(),
            })
            .collect())
    }

    /// Copy of every entry, for persistence.
    pub fn entries(&self) -> Vec<Arc<IndexEntry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Load persisted rows. Any undecodable row is reported as corruption.
    pub fn restore(&self, rows: Vec<PersistedVector>) -> Result<usize, IndexError> {
        let mut loaded = 0;
        for row in rows {
            let vector = EmbeddingVector::from_le_bytes(&row.bytes).ok_or_else(|| IndexError::Corrupt {
                id: row.id.to_string(),
                reason: format!("blob length {} is not a multiple of 4", row.bytes.len()),
            })?;
            self.insert(row.id.clone(), vector, row.metadata)
                .map_err(|e| IndexError::Corrupt {
                    id: row.id.to_string(),
                    reason: e.to_string(),
                })?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

/// Search candidate ordered so that "greater" means "ranks higher".
struct Ranked {
    score: f32,
    entry: Arc<IndexEntry>,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.entry.metadata.timestamp.cmp(&other.entry.metadata.timestamp))
            .then_with(|| other.entry.id.cmp(&self.entry.id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Level;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    fn meta(minute: u32) -> IndexMetadata {
        IndexMetadata {
            service: "checkout".into(),
            level: Level::Info,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
        }
    }

    fn v(values: &[f32]) -> EmbeddingVector {
        EmbeddingVector::new(values.to_vec())
    }

    #[test]
    fn test_insert_is_idempotent_and_replaces() {
        let index = VectorIndex::new(2, Metric::Cosine);
        let id = EntryId::from("a");

        assert_eq!(index.insert(id.clone(), v(&[1.0, 0.0]), meta(0)).unwrap(), InsertOutcome::Inserted);
        assert_eq!(index.insert(id.clone(), v(&[0.0, 1.0]), meta(1)).unwrap(), InsertOutcome::Replaced);

        assert_eq!(index.len(), 1);
        let stored = index.get(&id).unwrap();
        assert_eq!(stored.vector.as_slice(), &[0.0, 1.0]);
        assert_eq!(stored.metadata, meta(1));
    }

    #[test]
    fn test_size_tracks_distinct_inserts_minus_deletes() {
        let index = VectorIndex::new(2, Metric::Cosine);
        let ops: &[(&str, bool)] = &[
            ("a", true), ("b", true), ("a", true), ("c", true),
            ("b", false), ("b", false), ("zz", false), ("d", true), ("a", false), ("a", true),
        ];

        let mut model: HashSet<&str> = HashSet::new();
        for (id, is_insert) in ops {
            if *is_insert {
                index.insert(EntryId::from(*id), v(&[1.0, 1.0]), meta(0)).unwrap();
                model.insert(id);
            } else {
                let removed = index.delete(&EntryId::from(*id));
                assert_eq!(removed, model.remove(id));
            }
            assert_eq!(index.len(), model.len());
        }
    }

    #[test]
    fn test_search_orders_by_score_then_recency_then_id() {
        let index = VectorIndex::new(2, Metric::Cosine);
        index.insert("best".into(), v(&[1.0, 0.0]), meta(0)).unwrap();
        // Same direction as "best" scaled, equal cosine; newer wins the tie.
        index.insert("newer".into(), v(&[2.0, 0.0]), meta(5)).unwrap();
        // Same score and same timestamp: ids ascending.
        index.insert("tie-b".into(), v(&[1.0, 1.0]), meta(3)).unwrap();
        index.insert("tie-a".into(), v(&[1.0, 1.0]), meta(3)).unwrap();
        index.insert("worst".into(), v(&[0.0, 1.0]), meta(9)).unwrap();

        let hits = index.search(&[1.0, 0.0], 10, &SearchFilter::default()).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "best", "tie-a", "tie-b", "worst"]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_extreme_vectors_do_not_outrank_real_matches() {
        let index = VectorIndex::new(2, Metric::Cosine);
        index.insert("match".into(), v(&[1.0, 0.1]), meta(0)).unwrap();
        index.insert("huge-opposite".into(), v(&[-3.0e38, -3.0e38]), meta(9)).unwrap();
        index.insert("huge-aligned".into(), v(&[3.0e38, 0.0]), meta(1)).unwrap();

        let hits = index.search(&[1.0, 0.0], 3, &SearchFilter::default()).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["huge-aligned", "match", "huge-opposite"]);
        assert!(hits.iter().all(|h| h.score.is_finite()));
    }

    #[test]
    fn test_search_truncates_to_k_and_applies_filter() {
        let index = VectorIndex::new(2, Metric::Cosine);
        for i in 0..20u32 {
            let mut m = meta(i);
            if i % 2 == 0 {
                m.level = Level::Error;
            }
            index.insert(format!("e{i:02}").into(), v(&[1.0, i as f32 / 10.0]), m).unwrap();
        }

        let hits = index.search(&[1.0, 0.0], 3, &SearchFilter::default()).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["e00", "e01", "e02"]);

        let errors_only = SearchFilter { min_level: Some(Level::Error), ..Default::default() };
        let hits = index.search(&[1.0, 0.0], 3, &errors_only).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["e00", "e02", "e04"]);

        assert!(index.search(&[1.0, 0.0], 0, &SearchFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_and_value_checks() {
        let index = VectorIndex::new(3, Metric::Cosine);
        assert!(matches!(
            index.insert("a".into(), v(&[1.0]), meta(0)),
            Err(IndexError::DimensionMismatch { expected: 3, actual: 1 })
        ));
        assert!(matches!(
            index.insert("a".into(), v(&[1.0, f32::NAN, 0.0]), meta(0)),
            Err(IndexError::InvalidVector(_))
        ));
        assert!(index.search(&[1.0], 1, &SearchFilter::default()).is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_restore_detects_corruption() {
        let index = VectorIndex::new(2, Metric::Cosine);
        let good = PersistedVector {
            id: "ok".into(),
            bytes: v(&[1.0, 2.0]).to_le_bytes(),
            metadata: meta(0),
        };
        assert_eq!(index.restore(vec![good]).unwrap(), 1);

        let truncated = PersistedVector {
            id: "bad".into(),
            bytes: vec![0, 0, 128],
            metadata: meta(0),
        };
        let err = index.restore(vec![truncated]).unwrap_err();
        assert!(err.is_fatal());

        let wrong_dim = PersistedVector {
            id: "bad2".into(),
            bytes: v(&[1.0, 2.0, 3.0]).to_le_bytes(),
            metadata: meta(0),
        };
        assert!(index.restore(vec![wrong_dim]).unwrap_err().is_fatal());
    }

    #[test]
    fn test_concurrent_inserts_and_reads() {
        let index = Arc::new(VectorIndex::new(4, Metric::Cosine));
        let writers: Vec<_> = (0..8)
            .map(|t| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let x = (t * 100 + i) as f32;
                        index.insert(format!("{t}-{i}").into(), v(&[x, x, x, x]), meta(0)).unwrap();
                    }
                })
            })
            .collect();
        let reader = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    for hit in index.search(&[1.0, 1.0, 1.0, 1.0], 5, &SearchFilter::default()).unwrap() {
                        // Every visible entry carries a whole vector.
                        let entry = index.get(&hit.entry_id).unwrap();
                        let first = entry.vector.as_slice()[0];
                        assert!(entry.vector.as_slice().iter().all(|x| *x == first));
                    }
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(index.len(), 800);
    }
}
