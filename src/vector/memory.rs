use super::{ScoredRecord, VectorIndex, VectorIndexError, VectorRecord, cosine_similarity};
use crate::search::MemoryFilter;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct IndexRecords {
    dimension: Option<usize>,
    records: BTreeMap<String, VectorRecord>,
}

/// Process-local brute-force cosine index.
///
/// Suitable for tests and small corpora; every query scans all records of the index. The
/// dimension of an index is fixed by its first upsert.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    indexes: RwLock<HashMap<String, IndexRecords>>,
}

impl InMemoryVectorIndex {
    /// Create an empty index set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored under `index`.
    pub async fn len(&self, index: &str) -> usize {
        self.indexes
            .read()
            .await
            .get(index)
            .map_or(0, |records| records.records.len())
    }

    /// Whether `index` holds no records.
    pub async fn is_empty(&self, index: &str) -> bool {
        self.len(index).await == 0
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, index: &str, records: Vec<VectorRecord>) -> Result<(), VectorIndexError> {
        let mut indexes = self.indexes.write().await;
        let entry = indexes.entry(index.to_string()).or_default();

        let expected = entry
            .dimension
            .or_else(|| records.first().map(|record| record.vector.len()));
        if let Some(expected) = expected
            && let Some(bad) = records.iter().find(|record| record.vector.len() != expected)
        {
            return Err(VectorIndexError::DimensionMismatch {
                expected,
                actual: bad.vector.len(),
            });
        }
        entry.dimension = expected;

        let count = records.len();
        for record in records {
            entry.records.insert(record.id.clone(), record);
        }
        tracing::debug!(index, records = count, "Upserted records");
        Ok(())
    }

    async fn query(
        &self,
        index: &str,
        vector: &[f32],
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, VectorIndexError> {
        let indexes = self.indexes.read().await;
        let Some(entry) = indexes.get(index) else {
            return Ok(Vec::new());
        };
        if let Some(expected) = entry.dimension
            && expected != vector.len()
        {
            return Err(VectorIndexError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }

        let mut scored: Vec<(f32, &VectorRecord)> = entry
            .records
            .values()
            .filter(|record| filter.matches(&record.tags))
            .map(|record| (cosine_similarity(vector, &record.vector), record))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, record)| ScoredRecord {
                record: VectorRecord {
                    vector: Vec::new(),
                    ..record.clone()
                },
                score,
            })
            .collect())
    }

    async fn delete_document(&self, index: &str, document_id: &str) -> Result<(), VectorIndexError> {
        let mut indexes = self.indexes.write().await;
        if let Some(entry) = indexes.get_mut(index) {
            let before = entry.records.len();
            entry
                .records
                .retain(|_, record| record.document_id != document_id);
            tracing::debug!(
                index,
                document_id,
                removed = before - entry.records.len(),
                "Deleted document records"
            );
        }
        Ok(())
    }
}
