//! HTTP client wrapper exposing Qdrant as a [`VectorIndex`].

use crate::pipeline::status::current_timestamp_rfc3339;
use crate::qdrant::{
    filters::{build_tag_filter, document_filter},
    payload::{build_payload, record_from_payload, stringify_point_id},
    types::{QdrantError, QueryResponse},
};
use crate::search::MemoryFilter;
use crate::vector::{ScoredRecord, VectorIndex, VectorIndexError, VectorRecord};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use std::collections::HashSet;
use tokio::sync::Mutex;

/// Qdrant-backed vector index; every index name maps to one collection.
pub struct QdrantVectorIndex {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    vector_size: usize,
    ensured: Mutex<HashSet<String>>,
}

impl QdrantVectorIndex {
    /// Construct a client for the Qdrant instance at `url`.
    pub fn new(url: &str, api_key: Option<String>, vector_size: usize) -> Result<Self, QdrantError> {
        let client = Client::builder().user_agent("semantic-memory/0.1").build()?;
        let base_url = normalize_base_url(url).map_err(QdrantError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            has_api_key = api_key.as_deref().is_some_and(|value| !value.is_empty()),
            vector_size,
            "Initialized Qdrant HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key,
            vector_size,
            ensured: Mutex::new(HashSet::new()),
        })
    }

    /// Create the collection and its payload indexes once per process.
    async fn ensure_collection(&self, collection_name: &str) -> Result<(), QdrantError> {
        let mut ensured = self.ensured.lock().await;
        if ensured.contains(collection_name) {
            return Ok(());
        }

        if !self.collection_exists(collection_name).await? {
            tracing::debug!(
                collection = collection_name,
                vector_size = self.vector_size,
                "Creating collection"
            );
            self.create_collection(collection_name).await?;
        }
        self.ensure_payload_indexes(collection_name).await?;
        ensured.insert(collection_name.to_string());
        Ok(())
    }

    async fn create_collection(&self, collection_name: &str) -> Result<(), QdrantError> {
        let body = json!({
            "vectors": {
                "size": self.vector_size,
                "distance": "Cosine"
            }
        });

        let response = self
            .request(Method::PUT, &format!("collections/{collection_name}"))
            .json(&body)
            .send()
            .await?;

        ensure_success(response, || {
            tracing::debug!(collection = collection_name, "Collection ensured/created");
        })
        .await
    }

    async fn ensure_payload_indexes(&self, collection_name: &str) -> Result<(), QdrantError> {
        let fields: [(&str, &str); 3] = [
            ("document_id", "keyword"),
            ("tags", "keyword"),
            ("chunk_hash", "keyword"),
        ];

        for (field, schema) in fields {
            let body = json!({
                "field_name": field,
                "field_schema": schema,
            });

            let response = self
                .request(Method::PUT, &format!("collections/{collection_name}/index"))
                .json(&body)
                .send()
                .await?;

            if response.status().is_success() {
                tracing::debug!(
                    collection = collection_name,
                    field,
                    schema,
                    "Payload index ensured"
                );
            } else if response.status() == StatusCode::CONFLICT {
                tracing::debug!(
                    collection = collection_name,
                    field,
                    schema,
                    "Payload index already exists"
                );
            } else {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = QdrantError::UnexpectedStatus { status, body };
                tracing::warn!(collection = collection_name, field, schema, error = %error, "Failed to ensure payload index");
            }
        }

        Ok(())
    }

    async fn collection_exists(&self, collection_name: &str) -> Result<bool, QdrantError> {
        let response = self
            .request(Method::GET, &format!("collections/{collection_name}"))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = QdrantError::UnexpectedStatus { status, body };
                tracing::error!(collection = collection_name, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        req
    }

    fn check_dimension(&self, actual: usize) -> Result<(), VectorIndexError> {
        if actual == self.vector_size {
            Ok(())
        } else {
            Err(VectorIndexError::DimensionMismatch {
                expected: self.vector_size,
                actual,
            })
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn upsert(&self, index: &str, records: Vec<VectorRecord>) -> Result<(), VectorIndexError> {
        if records.is_empty() {
            return Ok(());
        }
        for record in &records {
            self.check_dimension(record.vector.len())?;
        }
        self.ensure_collection(index).await?;

        let now = current_timestamp_rfc3339();
        let points: Vec<Value> = records
            .iter()
            .map(|record| {
                json!({
                    "id": record.id,
                    "vector": record.vector,
                    "payload": build_payload(record, &now),
                })
            })
            .collect();

        let point_count = points.len();
        let response = self
            .request(Method::PUT, &format!("collections/{index}/points"))
            .query(&[("wait", true)])
            .json(&json!({ "points": points }))
            .send()
            .await
            .map_err(QdrantError::from)?;

        ensure_success(response, || {
            tracing::debug!(collection = index, points = point_count, "Points indexed");
        })
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        index: &str,
        vector: &[f32],
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, VectorIndexError> {
        self.check_dimension(vector.len())?;

        let mut body = json!({
            "query": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter_value) = build_tag_filter(filter)
            && let Some(object) = body.as_object_mut()
        {
            object.insert("filter".into(), filter_value);
        }

        let response = self
            .request(Method::POST, &format!("collections/{index}/points/query"))
            .json(&body)
            .send()
            .await
            .map_err(QdrantError::from)?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(collection = index, "Collection missing; returning no results");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = QdrantError::UnexpectedStatus { status, body };
            tracing::error!(collection = index, error = %error, "Qdrant search failed");
            return Err(error.into());
        }

        let payload: QueryResponse = response.json().await.map_err(QdrantError::from)?;
        let mut skipped = 0_usize;
        let results: Vec<ScoredRecord> = payload
            .result
            .into_points()
            .into_iter()
            .filter_map(|point| {
                let id = stringify_point_id(point.id);
                let record = point
                    .payload
                    .as_ref()
                    .and_then(|payload| record_from_payload(id, payload));
                if record.is_none() {
                    skipped += 1;
                }
                record.map(|record| ScoredRecord {
                    record,
                    score: point.score,
                })
            })
            .collect();

        if skipped > 0 {
            tracing::warn!(collection = index, skipped, "Ignored points without a memory payload");
        }
        Ok(results)
    }

    async fn delete_document(&self, index: &str, document_id: &str) -> Result<(), VectorIndexError> {
        let response = self
            .request(Method::POST, &format!("collections/{index}/points/delete"))
            .query(&[("wait", true)])
            .json(&json!({ "filter": document_filter(document_id) }))
            .send()
            .await
            .map_err(QdrantError::from)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response, || {
            tracing::debug!(collection = index, document_id, "Document points deleted");
        })
        .await?;
        Ok(())
    }
}

async fn ensure_success<F>(response: reqwest::Response, on_success: F) -> Result<(), QdrantError>
where
    F: FnOnce(),
{
    if response.status().is_success() {
        on_success();
        Ok(())
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let error = QdrantError::UnexpectedStatus { status, body };
        tracing::error!(error = %error, "Qdrant request failed");
        Err(error)
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}
