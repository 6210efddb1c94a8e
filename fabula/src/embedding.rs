//! Text embedding with caching and normalization.
//!
//! Vectors from the provider are normalized to unit L2 length and kept
//! in an in-memory cache keyed by the raw text for 24 hours, so a
//! repeated embed of the same text is bit-for-bit identical and free.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::llm::LanguageModel;
use crate::{Error, Result};

/// Embedding dimension of the default provider model.
pub const DEFAULT_DIMENSION: usize = 1024;
const BATCH_SIZE: usize = 100;
const CACHE_TTL_HOURS: i64 = 24;

struct CachedVector {
    vector: Vec<f64>,
    created_at: DateTime<Utc>,
}

/// Caching embedding front-end over a [`LanguageModel`].
pub struct EmbeddingService {
    llm: Arc<dyn LanguageModel>,
    dimension: usize,
    batch_size: usize,
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedVector>>,
}

impl EmbeddingService {
    pub fn new(llm: Arc<dyn LanguageModel>, dimension: usize) -> Self {
        Self {
            llm,
            dimension,
            batch_size: BATCH_SIZE,
            ttl: Duration::hours(CACHE_TTL_HOURS),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed one text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Upstream("no embedding generated".into()))
    }

    /// Embed many texts, serving repeats from cache and chunking the
    /// rest through the provider.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut results: Vec<Option<Vec<f64>>> = vec![None; texts.len()];
        let mut uncached_indices = Vec::new();
        let mut uncached_texts = Vec::new();
        {
            let cache = self.cache.lock().unwrap();
            let now = Utc::now();
            for (i, text) in texts.iter().enumerate() {
                match cache.get(text) {
                    Some(entry) if now - entry.created_at <= self.ttl => {
                        results[i] = Some(entry.vector.clone());
                    }
                    _ => {
                        uncached_indices.push(i);
                        uncached_texts.push(text.clone());
                    }
                }
            }
        }

        if !uncached_texts.is_empty() {
            let mut fresh = Vec::with_capacity(uncached_texts.len());
            for chunk in uncached_texts.chunks(self.batch_size) {
                let vectors = self.llm.embed_batch(chunk).await?;
                if vectors.len() != chunk.len() {
                    return Err(Error::Upstream(format!(
                        "provider returned {} embeddings for {} inputs",
                        vectors.len(),
                        chunk.len()
                    )));
                }
                for vector in vectors {
                    fresh.push(self.check_and_normalize(vector)?);
                }
            }

            let mut cache = self.cache.lock().unwrap();
            let now = Utc::now();
            for (slot, (text, vector)) in uncached_indices
                .iter()
                .zip(uncached_texts.into_iter().zip(fresh.into_iter()))
            {
                cache.insert(
                    text,
                    CachedVector {
                        vector: vector.clone(),
                        created_at: now,
                    },
                );
                results[*slot] = Some(vector);
            }
        }

        Ok(results.into_iter().map(|v| v.unwrap_or_default()).collect())
    }

    fn check_and_normalize(&self, vector: Vec<f64>) -> Result<Vec<f64>> {
        if vector.len() != self.dimension {
            return Err(Error::Upstream(format!(
                "embedding has dimension {}, expected {}",
                vector.len(),
                self.dimension
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::Upstream("embedding contains non-finite values".into()));
        }
        normalize(&vector).ok_or_else(|| Error::Upstream("embedding has zero length".into()))
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }
}

/// Scale a vector to unit L2 length. `None` for the zero vector.
pub fn normalize(vector: &[f64]) -> Option<Vec<f64>> {
    let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm == 0.0 {
        return None;
    }
    Some(vector.iter().map(|v| v / norm).collect())
}

/// Cosine similarity of two equal-length vectors.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(Error::BadRequest(format!(
            "vector dimensions differ: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|v| v * v).sum::<f64>().sqrt();
    let nb = b.iter().map(|v| v * v).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (na * nb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatRequest, ChatResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for CountingModel {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            Err(Error::Unavailable("chat not scripted".into()))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; 4];
                    v[t.len() % 4] = 1.0;
                    v[0] += t.len() as f64;
                    v
                })
                .collect())
        }
    }

    fn service() -> EmbeddingService {
        EmbeddingService::new(
            Arc::new(CountingModel {
                calls: AtomicUsize::new(0),
            }),
            4,
        )
    }

    #[tokio::test]
    async fn vectors_are_unit_length() {
        let svc = service();
        let v = svc.embed("anything").await.unwrap();
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn repeated_embeds_hit_the_cache() {
        let llm = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let svc = EmbeddingService::new(llm.clone(), 4);
        let first = svc.embed("same text").await.unwrap();
        let second = svc.embed("same text").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(svc.cache_len(), 1);
    }

    #[tokio::test]
    async fn batch_mixes_cached_and_fresh() {
        let llm = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let svc = EmbeddingService::new(llm.clone(), 4);
        svc.embed("a").await.unwrap();
        let out = svc
            .embed_batch(&["a".into(), "bb".into(), "ccc".into()])
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
        // "a" came from cache, the other two in a single provider call.
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_vector_is_rejected() {
        assert!(normalize(&[0.0, 0.0]).is_none());
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap(), 0.0);
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_err());
    }
}
