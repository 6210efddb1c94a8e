//! Vector store client.
//!
//! Talks to Qdrant over its JSON REST API. Collections are created
//! lazily with cosine distance; payload filters are translated to the
//! native filter tree and score thresholds are applied client-side
//! after retrieval.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::{Error, Result};

/// Collection holding story memories.
pub const MEMORY_COLLECTION: &str = "memories";
/// Collection holding viewer decisions.
pub const DECISION_COLLECTION: &str = "decisions";
/// Catch-all collection.
pub const DEFAULT_COLLECTION: &str = "fabula";

/// A point to upsert: external string id, vector, JSON payload.
#[derive(Debug, Clone)]
pub struct PointRecord {
    pub id: String,
    pub vector: Vec<f64>,
    pub payload: Map<String, Value>,
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f64,
    pub payload: Map<String, Value>,
    pub vector: Option<Vec<f64>>,
}

/// Payload condition operators.
#[derive(Debug, Clone)]
pub enum ConditionOp {
    Match(Value),
    MatchAny(Vec<Value>),
    Range { gte: Option<f64>, lte: Option<f64> },
}

/// One payload condition.
#[derive(Debug, Clone)]
pub struct Condition {
    pub key: String,
    pub op: ConditionOp,
}

impl Condition {
    pub fn matches(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            op: ConditionOp::Match(value.into()),
        }
    }

    pub fn match_any(key: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            op: ConditionOp::MatchAny(values),
        }
    }

    pub fn range(key: impl Into<String>, gte: Option<f64>, lte: Option<f64>) -> Self {
        Self {
            key: key.into(),
            op: ConditionOp::Range { gte, lte },
        }
    }
}

/// Composite payload filter.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub must: Vec<Condition>,
    pub must_not: Vec<Condition>,
    pub should: Vec<Condition>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.must_not.is_empty() && self.should.is_empty()
    }
}

/// Search parameters.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub score_threshold: Option<f64>,
    pub filter: Option<Filter>,
    pub with_payload: bool,
    pub with_vector: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            score_threshold: None,
            filter: None,
            with_payload: true,
            with_vector: false,
        }
    }
}

/// Collection metadata.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub vector_size: usize,
    pub points_count: u64,
}

/// Vector store operations used by the memory layer. Narrow enough for
/// tests to provide an in-memory implementation.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<()>;
    async fn collection_exists(&self, name: &str) -> Result<bool>;
    async fn upsert(&self, collection: &str, points: Vec<PointRecord>) -> Result<()>;
    async fn search(
        &self,
        collection: &str,
        vector: &[f64],
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredPoint>>;
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()>;
    async fn collection_info(&self, name: &str) -> Result<CollectionInfo>;
    async fn health_check(&self) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ExistsResponse {
    result: ExistsResult,
}

#[derive(Debug, Deserialize)]
struct ExistsResult {
    exists: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: Value,
    score: f64,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
    #[serde(default)]
    vector: Option<Vec<f64>>,
}

/// REST client for Qdrant.
pub struct QdrantStore {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantStore {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    /// Create the three standard collections if missing.
    pub async fn ensure_default_collections(&self, vector_size: usize) -> Result<()> {
        for name in [MEMORY_COLLECTION, DECISION_COLLECTION, DEFAULT_COLLECTION] {
            self.ensure_collection(name, vector_size).await?;
        }
        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    async fn expect_success(resp: reqwest::Response, context: &str) -> Result<Value> {
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let detail = body
                .pointer("/status/error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(Error::Unavailable(format!("{context}: {detail}")));
        }
        Ok(body)
    }

    /// Map the external string id onto a stable point UUID. Identical
    /// ids collide deliberately, so re-upserts overwrite.
    fn point_uuid(id: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes()).to_string()
    }
}

fn condition_json(c: &Condition) -> Value {
    match &c.op {
        ConditionOp::Match(value) => json!({"key": c.key, "match": {"value": value}}),
        ConditionOp::MatchAny(values) => json!({"key": c.key, "match": {"any": values}}),
        ConditionOp::Range { gte, lte } => {
            let mut range = Map::new();
            if let Some(gte) = gte {
                range.insert("gte".into(), json!(gte));
            }
            if let Some(lte) = lte {
                range.insert("lte".into(), json!(lte));
            }
            json!({"key": c.key, "range": range})
        }
    }
}

fn filter_json(filter: &Filter) -> Value {
    let mut out = Map::new();
    for (name, conds) in [
        ("must", &filter.must),
        ("must_not", &filter.must_not),
        ("should", &filter.should),
    ] {
        if !conds.is_empty() {
            out.insert(
                name.into(),
                Value::Array(conds.iter().map(condition_json).collect()),
            );
        }
    }
    Value::Object(out)
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<()> {
        if self.collection_exists(name).await.unwrap_or(false) {
            return Ok(());
        }
        let body = json!({
            "vectors": {"size": vector_size, "distance": "Cosine"},
        });
        let resp = self
            .request(reqwest::Method::PUT, &format!("/collections/{name}"))
            .json(&body)
            .send()
            .await?;
        Self::expect_success(resp, &format!("create collection {name}")).await?;
        tracing::info!(collection = name, vector_size, "collection created");
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/collections/{name}/exists"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(false);
        }
        let body: ExistsResponse = resp.json().await?;
        Ok(body.result.exists)
    }

    async fn upsert(&self, collection: &str, points: Vec<PointRecord>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        for point in &points {
            if point.vector.iter().all(|v| *v == 0.0) {
                return Err(Error::BadRequest(format!(
                    "refusing to store zero vector for point {}",
                    point.id
                )));
            }
        }
        let body = json!({
            "points": points
                .iter()
                .map(|p| {
                    let mut payload = p.payload.clone();
                    payload.insert("id".into(), json!(p.id));
                    json!({
                        "id": Self::point_uuid(&p.id),
                        "vector": p.vector,
                        "payload": payload,
                    })
                })
                .collect::<Vec<_>>(),
        });
        let resp = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{collection}/points?wait=true"),
            )
            .json(&body)
            .send()
            .await?;
        Self::expect_success(resp, &format!("upsert into {collection}")).await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f64],
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = Map::new();
        body.insert("vector".into(), json!(vector));
        body.insert("limit".into(), json!(opts.limit));
        body.insert("with_payload".into(), json!(opts.with_payload));
        body.insert("with_vector".into(), json!(opts.with_vector));
        if let Some(filter) = opts.filter.as_ref().filter(|f| !f.is_empty()) {
            body.insert("filter".into(), filter_json(filter));
        }
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/search"),
            )
            .json(&Value::Object(body))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let detail = body
                .pointer("/status/error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(Error::Unavailable(format!(
                "search in {collection}: {detail}"
            )));
        }
        let parsed: SearchResponse = resp.json().await?;
        let threshold = opts.score_threshold.unwrap_or(f64::MIN);
        Ok(parsed
            .result
            .into_iter()
            .filter(|hit| hit.score >= threshold)
            .map(|hit| {
                let payload = hit.payload.unwrap_or_default();
                let id = payload
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| match &hit.id {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                ScoredPoint {
                    id,
                    score: hit.score,
                    payload,
                    vector: hit.vector,
                }
            })
            .collect())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = json!({
            "points": ids.iter().map(|id| Self::point_uuid(id)).collect::<Vec<_>>(),
        });
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/delete?wait=true"),
            )
            .json(&body)
            .send()
            .await?;
        Self::expect_success(resp, &format!("delete from {collection}")).await?;
        Ok(())
    }

    async fn collection_info(&self, name: &str) -> Result<CollectionInfo> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/collections/{name}"))
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Err(Error::NotFound(format!("collection {name}")));
        }
        let body = Self::expect_success(resp, &format!("describe collection {name}")).await?;
        let points_count = body
            .pointer("/result/points_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let vector_size = body
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        Ok(CollectionInfo {
            name: name.to_string(),
            vector_size,
            points_count,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let resp = self.request(reqwest::Method::GET, "/collections").send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Unavailable(format!(
                "vector store returned {}",
                resp.status()
            )))
        }
    }
}
