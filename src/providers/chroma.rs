/*
 * Meeting Minutes Pipeline - Chroma Vector Store Provider
 * Copyright (c) 2024 Meeting Minutes Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{PipelineError, PipelineResult};
use crate::types::{Metadata, MetadataValue, VectorRecord};

use super::{QueryHit, VectorStore};

/// REST client for a Chroma server. Collections are created with the L2
/// space and carry their dimension in collection metadata so a mismatch
/// is caught before any write.
pub struct ChromaStore {
    client: Client,
    base_url: String,
    timeout: Duration,
    collection_ids: RwLock<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    id: String,
    #[serde(default)]
    metadata: Option<HashMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<HashMap<String, Value>>>>>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    documents: Option<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Option<Vec<Option<HashMap<String, Value>>>>,
}

fn value_to_metadata(value: Value) -> Option<MetadataValue> {
    match value {
        Value::String(s) => Some(MetadataValue::Str(s)),
        Value::Bool(b) => Some(MetadataValue::Bool(b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(MetadataValue::Int(i))
            } else {
                n.as_f64().map(MetadataValue::Float)
            }
        }
        _ => None,
    }
}

fn convert_metadata(raw: Option<HashMap<String, Value>>) -> Metadata {
    raw.unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| value_to_metadata(v).map(|m| (k, m)))
        .collect()
}

/// Build a Chroma `where` document from an equality filter.
fn where_clause(filter: &Metadata) -> Value {
    let clauses: Vec<Value> = filter
        .iter()
        .map(|(k, v)| {
            let mut clause = serde_json::Map::new();
            clause.insert(k.clone(), serde_json::to_value(v).unwrap_or(Value::Null));
            Value::Object(clause)
        })
        .collect();
    match clauses.len() {
        0 => json!({}),
        1 => clauses.into_iter().next().unwrap_or_else(|| json!({})),
        _ => json!({ "$and": clauses }),
    }
}

impl ChromaStore {
    pub fn new(client: Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            collection_ids: RwLock::new(HashMap::new()),
        }
    }

    async fn post_json(&self, path: &str, body: Value) -> PipelineResult<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| PipelineError::from_transport("vector-store", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status("vector-store", status, &body));
        }
        Ok(response)
    }

    /// Resolve (and cache) the collection id, creating the collection when
    /// `dim` is given and it does not exist yet.
    async fn collection_id(&self, name: &str, dim: Option<usize>) -> PipelineResult<String> {
        if let Some(id) = self.collection_ids.read().get(name) {
            return Ok(id.clone());
        }

        let mut body = json!({ "name": name, "get_or_create": true });
        if let Some(dim) = dim {
            body["metadata"] = json!({ "hnsw:space": "l2", "dimension": dim });
        }
        let response = self.post_json("/api/v1/collections", body).await?;
        let parsed: CollectionResponse = response.json().await.map_err(|e| {
            PipelineError::Internal(format!("vector-store collection parse failed: {e}"))
        })?;

        if let (Some(dim), Some(metadata)) = (dim, &parsed.metadata) {
            if let Some(existing) = metadata.get("dimension").and_then(|v| v.as_u64()) {
                if existing as usize != dim {
                    return Err(PipelineError::VectorDimMismatch {
                        expected: existing as usize,
                        actual: dim,
                    });
                }
            }
        }

        self.collection_ids
            .write()
            .insert(name.to_string(), parsed.id.clone());
        Ok(parsed.id)
    }
}

#[async_trait]
impl VectorStore for ChromaStore {
    fn name(&self) -> &str {
        "chroma"
    }

    async fn ensure_collection(&self, collection: &str, dim: usize) -> PipelineResult<()> {
        self.collection_id(collection, Some(dim)).await.map(|_| ())
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> PipelineResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let id = self.collection_id(collection, None).await?;
        let ids: Vec<&String> = records.iter().map(|r| &r.id).collect();
        let embeddings: Vec<&Vec<f32>> = records.iter().map(|r| &r.embedding).collect();
        let documents: Vec<&String> = records.iter().map(|r| &r.document).collect();
        let metadatas: Vec<&Metadata> = records.iter().map(|r| &r.metadata).collect();

        self.post_json(
            &format!("/api/v1/collections/{id}/upsert"),
            json!({
                "ids": ids,
                "embeddings": embeddings,
                "documents": documents,
                "metadatas": metadatas,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_where(&self, collection: &str, filter: &Metadata) -> PipelineResult<()> {
        let id = self.collection_id(collection, None).await?;
        self.post_json(
            &format!("/api/v1/collections/{id}/delete"),
            json!({ "where": where_clause(filter) }),
        )
        .await
        .map(|_| ())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&Metadata>,
    ) -> PipelineResult<Vec<QueryHit>> {
        let id = self.collection_id(collection, None).await?;
        let mut body = json!({
            "query_embeddings": [vector],
            "n_results": k,
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(filter) = filter {
            if !filter.is_empty() {
                body["where"] = where_clause(filter);
            }
        }

        let response = self
            .post_json(&format!("/api/v1/collections/{id}/query"), body)
            .await?;
        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Internal(format!("vector-store query parse failed: {e}")))?;

        let ids = parsed.ids.into_iter().next().unwrap_or_default();
        let distances = parsed
            .distances
            .and_then(|d| d.into_iter().next())
            .unwrap_or_default();
        let documents = parsed
            .documents
            .and_then(|d| d.into_iter().next())
            .unwrap_or_default();
        let metadatas = parsed
            .metadatas
            .and_then(|m| m.into_iter().next())
            .unwrap_or_default();

        let hits = ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| QueryHit {
                id,
                distance: distances.get(i).copied().unwrap_or(0.0),
                document: documents
                    .get(i)
                    .cloned()
                    .flatten()
                    .unwrap_or_default(),
                metadata: convert_metadata(metadatas.get(i).cloned().flatten()),
            })
            .collect();
        Ok(hits)
    }

    async fn get_where(
        &self,
        collection: &str,
        filter: &Metadata,
        limit: usize,
    ) -> PipelineResult<Vec<QueryHit>> {
        let id = self.collection_id(collection, None).await?;
        let response = self
            .post_json(
                &format!("/api/v1/collections/{id}/get"),
                json!({
                    "where": where_clause(filter),
                    "limit": limit,
                    "include": ["documents", "metadatas"],
                }),
            )
            .await?;
        let parsed: GetResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Internal(format!("vector-store get parse failed: {e}")))?;

        let documents = parsed.documents.unwrap_or_default();
        let metadatas = parsed.metadatas.unwrap_or_default();
        let hits = parsed
            .ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| QueryHit {
                id,
                distance: 0.0,
                document: documents.get(i).cloned().flatten().unwrap_or_default(),
                metadata: convert_metadata(metadatas.get(i).cloned().flatten()),
            })
            .collect();
        Ok(hits)
    }

    async fn count(&self, collection: &str) -> PipelineResult<usize> {
        let id = self.collection_id(collection, None).await?;
        let response = self
            .client
            .get(format!("{}/api/v1/collections/{id}/count", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| PipelineError::from_transport("vector-store", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status("vector-store", status, &body));
        }
        response
            .json::<usize>()
            .await
            .map_err(|e| PipelineError::Internal(format!("vector-store count parse failed: {e}")))
    }

    async fn ready(&self) -> bool {
        self.client
            .get(format!("{}/api/v1/heartbeat", self.base_url))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_clause_shapes() {
        let mut filter = Metadata::new();
        assert_eq!(where_clause(&filter), json!({}));

        filter.insert("source_id".into(), MetadataValue::Int(7));
        assert_eq!(where_clause(&filter), json!({ "source_id": 7 }));

        filter.insert("department".into(), MetadataValue::Str("eng".into()));
        let clause = where_clause(&filter);
        let and = clause.get("$and").and_then(|v| v.as_array()).unwrap();
        assert_eq!(and.len(), 2);
    }

    #[tokio::test]
    async fn query_parses_nested_result_arrays() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/collections")
            .with_status(200)
            .with_body(r#"{"id":"c-1","name":"meeting_minutes","metadata":null}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/v1/collections/c-1/query")
            .with_status(200)
            .with_body(
                r#"{"ids":[["minute-1-0"]],"distances":[[0.5]],
                    "documents":[["决定上线灰度发布"]],
                    "metadatas":[[{"source_id":1,"chunk_index":0}]]}"#,
            )
            .create_async()
            .await;

        let store = ChromaStore::new(Client::new(), &server.url(), Duration::from_secs(5));
        let hits = store
            .query("meeting_minutes", &[0.0f32; 4], 5, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "minute-1-0");
        assert!((hits[0].similarity() - 1.0 / 1.5).abs() < 1e-9);
        assert_eq!(
            hits[0].metadata.get("source_id"),
            Some(&MetadataValue::Int(1))
        );
    }
}
