//! Work queue for expensive asset producers.
//!
//! Requests enter a bounded channel and are drained by a small worker
//! pool; each worker drives the external inference client and reports
//! into a short-lived result map plus the caller's reply channel.
//! [`AssetGenerator`] layers the cache and request coalescing on top:
//! at most one generation is ever in flight per fingerprint, and
//! concurrent callers for the same fingerprint share its outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::asset_cache::AssetCache;
use crate::{Error, Result};

/// Reference worker-pool size.
pub const DEFAULT_WORKERS: usize = 2;
const DEFAULT_WAIT_CAP: Duration = Duration::from_secs(300);
const RESULT_TTL: Duration = Duration::from_secs(600);
const RESULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Output of one producer invocation.
#[derive(Debug, Clone)]
pub struct ProducedAsset {
    pub bytes: Vec<u8>,
    pub format: String,
    pub duration_secs: Option<f64>,
}

/// An external inference back-end that can turn request options into
/// an artifact.
#[async_trait]
pub trait Producer: Send + Sync + 'static {
    type Options: Send + Sync + Clone + Serialize + 'static;

    /// Stable content hash over the semantically relevant options.
    fn fingerprint(opts: &Self::Options) -> String;

    /// The human-readable input the artifact was generated from.
    fn source_text(opts: &Self::Options) -> String;

    async fn produce(&self, opts: &Self::Options) -> Result<ProducedAsset>;
}

/// Completed work, kept briefly for late readers.
#[derive(Debug, Clone)]
pub struct WorkOutcome {
    pub id: String,
    pub fingerprint: String,
    pub asset: Option<Arc<ProducedAsset>>,
    pub error: Option<String>,
    /// Wall-clock time the producer call took, measured from a
    /// timestamp captured before the call.
    pub elapsed: Duration,
}

impl WorkOutcome {
    fn into_asset(self) -> Result<(Arc<ProducedAsset>, Duration)> {
        match (self.asset, self.error) {
            (Some(asset), _) => Ok((asset, self.elapsed)),
            (None, Some(error)) => Err(Error::Upstream(error)),
            (None, None) => Err(Error::Upstream("producer returned nothing".into())),
        }
    }
}

struct Job<O> {
    id: String,
    fingerprint: String,
    options: O,
    reply: oneshot::Sender<WorkOutcome>,
}

type ResultMap = Arc<Mutex<HashMap<String, (WorkOutcome, Instant)>>>;

/// Bounded queue feeding a fixed worker pool.
pub struct GenQueue<P: Producer> {
    tx: mpsc::Sender<Job<P::Options>>,
    results: ResultMap,
    wait_cap: Duration,
}

impl<P: Producer> GenQueue<P> {
    /// Spawn `workers` consumer tasks over a channel holding up to
    /// `capacity` queued requests.
    pub fn start(producer: Arc<P>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job<P::Options>>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let results: ResultMap = Arc::new(Mutex::new(HashMap::new()));

        for worker_id in 0..workers.max(1) {
            let producer = producer.clone();
            let rx = rx.clone();
            let results = results.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let started = Instant::now();
                    let produced = producer.produce(&job.options).await;
                    let elapsed = started.elapsed();
                    let outcome = match produced {
                        Ok(asset) => WorkOutcome {
                            id: job.id.clone(),
                            fingerprint: job.fingerprint.clone(),
                            asset: Some(Arc::new(asset)),
                            error: None,
                            elapsed,
                        },
                        Err(e) => {
                            tracing::warn!(worker = worker_id, error = %e, "generation failed");
                            WorkOutcome {
                                id: job.id.clone(),
                                fingerprint: job.fingerprint.clone(),
                                asset: None,
                                error: Some(e.to_string()),
                                elapsed,
                            }
                        }
                    };
                    results
                        .lock()
                        .unwrap()
                        .insert(job.id.clone(), (outcome.clone(), Instant::now()));
                    let _ = job.reply.send(outcome);
                }
                tracing::debug!(worker = worker_id, "queue worker finished");
            });
        }

        spawn_result_sweeper(Arc::downgrade(&results));
        Self {
            tx,
            results,
            wait_cap: DEFAULT_WAIT_CAP,
        }
    }

    /// Shorten the wait cap; used by tests.
    pub fn with_wait_cap(mut self, cap: Duration) -> Self {
        self.wait_cap = cap;
        self
    }

    /// Enqueue without waiting. Fails with `QueueFull` when the
    /// channel cannot accept the request.
    pub fn try_enqueue(
        &self,
        id: &str,
        fingerprint: &str,
        options: P::Options,
    ) -> Result<oneshot::Receiver<WorkOutcome>> {
        let (reply, receiver) = oneshot::channel();
        let job = Job {
            id: id.to_string(),
            fingerprint: fingerprint.to_string(),
            options,
            reply,
        };
        self.tx.try_send(job).map_err(|_| Error::QueueFull)?;
        Ok(receiver)
    }

    /// Enqueue and wait for the outcome, capped at five minutes.
    pub async fn enqueue_and_wait(
        &self,
        id: &str,
        fingerprint: &str,
        options: P::Options,
    ) -> Result<WorkOutcome> {
        let receiver = self.try_enqueue(id, fingerprint, options)?;
        match tokio::time::timeout(self.wait_cap, receiver).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Error::Unavailable("queue shut down mid-request".into())),
            Err(_) => Err(Error::Timeout("generation wait cap exceeded".into())),
        }
    }

    /// Look up a recently completed request by id.
    pub fn result(&self, id: &str) -> Option<WorkOutcome> {
        self.results
            .lock()
            .unwrap()
            .get(id)
            .map(|(outcome, _)| outcome.clone())
    }
}

fn spawn_result_sweeper(results: Weak<Mutex<HashMap<String, (WorkOutcome, Instant)>>>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RESULT_SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(results) = results.upgrade() else {
                break;
            };
            let mut results = results.lock().unwrap();
            results.retain(|_, (_, completed_at)| completed_at.elapsed() < RESULT_TTL);
        }
    });
}

/// A generated artifact as handed to callers.
#[derive(Debug, Clone)]
pub struct GeneratedAsset {
    pub fingerprint: String,
    pub bytes: Vec<u8>,
    pub format: String,
    pub duration_secs: Option<f64>,
    /// Whether the bytes came straight from cache.
    pub cached: bool,
    /// Producer time for fresh generations, zero for cache hits.
    pub elapsed: Duration,
}

/// Cache-fronted, coalescing facade over a [`GenQueue`].
pub struct AssetGenerator<P: Producer> {
    queue: GenQueue<P>,
    cache: Arc<AssetCache>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<Option<String>>>>,
    wait_cap: Duration,
}

enum Role {
    Leader,
    Follower(broadcast::Receiver<Option<String>>),
    Hit(Vec<u8>),
}

impl<P: Producer> AssetGenerator<P> {
    pub fn new(queue: GenQueue<P>, cache: Arc<AssetCache>) -> Self {
        Self {
            queue,
            cache,
            in_flight: Mutex::new(HashMap::new()),
            wait_cap: DEFAULT_WAIT_CAP,
        }
    }

    /// Shorten the follower wait cap; used by tests.
    pub fn with_wait_cap(mut self, cap: Duration) -> Self {
        self.wait_cap = cap;
        self
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    /// Produce (or fetch) the artifact for `opts`.
    ///
    /// Exactly one back-end call runs per fingerprint at a time;
    /// concurrent callers for the same fingerprint wait on it and then
    /// read the freshly cached bytes, so everyone observes identical
    /// content.
    pub async fn generate(&self, opts: P::Options) -> Result<GeneratedAsset> {
        let fingerprint = P::fingerprint(&opts);

        let role = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(leader) = in_flight.get(&fingerprint) {
                Role::Follower(leader.subscribe())
            } else {
                match self.cache.get(&fingerprint) {
                    Ok(bytes) => Role::Hit(bytes),
                    Err(Error::CacheMiss(_)) => {
                        let (tx, _) = broadcast::channel(4);
                        in_flight.insert(fingerprint.clone(), tx);
                        Role::Leader
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match role {
            Role::Hit(bytes) => Ok(self.from_cache(&fingerprint, bytes)),
            Role::Follower(mut signal) => {
                match tokio::time::timeout(self.wait_cap, signal.recv()).await {
                    Ok(Ok(None)) => {
                        let bytes = self.cache.get(&fingerprint)?;
                        Ok(self.from_cache(&fingerprint, bytes))
                    }
                    Ok(Ok(Some(error))) => Err(Error::Upstream(error)),
                    Ok(Err(_)) => Err(Error::Unavailable("generation was abandoned".into())),
                    Err(_) => Err(Error::Timeout("generation wait cap exceeded".into())),
                }
            }
            Role::Leader => {
                let outcome = self.lead(&fingerprint, opts).await;
                // Remove the marker before signalling so a caller who
                // arrives after the signal takes the plain cache path.
                let leader = self.in_flight.lock().unwrap().remove(&fingerprint);
                match outcome {
                    Ok(asset) => {
                        if let Some(leader) = leader {
                            let _ = leader.send(None);
                        }
                        Ok(asset)
                    }
                    Err(e) => {
                        if let Some(leader) = leader {
                            let _ = leader.send(Some(e.to_string()));
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    async fn lead(&self, fingerprint: &str, opts: P::Options) -> Result<GeneratedAsset> {
        let id = uuid::Uuid::new_v4().to_string();
        let source_text = P::source_text(&opts);
        let options_json = serde_json::to_value(&opts).unwrap_or_default();
        let outcome = self
            .queue
            .enqueue_and_wait(&id, fingerprint, opts)
            .await?;
        let (asset, elapsed) = outcome.into_asset()?;
        if let Err(e) = self.cache.put(
            fingerprint,
            &asset.bytes,
            &source_text,
            options_json,
            &asset.format,
            asset.duration_secs,
        ) {
            tracing::warn!(error = %e, fingerprint, "failed to cache generated asset");
        }
        Ok(GeneratedAsset {
            fingerprint: fingerprint.to_string(),
            bytes: asset.bytes.clone(),
            format: asset.format.clone(),
            duration_secs: asset.duration_secs,
            cached: false,
            elapsed,
        })
    }

    fn from_cache(&self, fingerprint: &str, bytes: Vec<u8>) -> GeneratedAsset {
        let entry = self.cache.entry(fingerprint);
        GeneratedAsset {
            fingerprint: fingerprint.to_string(),
            bytes,
            format: entry.as_ref().map(|e| e.format.clone()).unwrap_or_default(),
            duration_secs: entry.and_then(|e| e.duration_secs),
            cached: true,
            elapsed: Duration::ZERO,
        }
    }
}
