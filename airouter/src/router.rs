//! Router core: builds the fallback chain, drives the attempt loop, and
//! hands exhausted requests to the queue.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::catalog::Catalog;
use crate::clock::{system_clock, Clock};
use crate::providers::{Provider, ProviderError, ProviderResponse, ResponseBody};
use crate::queue::{
    DrainError, DrainedResponse, EnqueueOutcome, JobError, QueueConfig, QueueError, QueuedRequest,
    RequestQueue,
};
use crate::ratelimit::{ModelRateState, RateLimitTracker};
use crate::store::StateStore;
use crate::types::{Capability, ChainEntry, Vendor};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub priority: Vec<Vendor>,
    pub cb_failure_threshold: u32,
    pub cb_cooldown_ms: i64,
    pub low_requests_threshold: u64,
    pub queue: QueueConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            priority: vec![Vendor::OpenAi, Vendor::Anthropic, Vendor::Google],
            cb_failure_threshold: 5,
            cb_cooldown_ms: 60_000,
            low_requests_threshold: 5,
            queue: QueueConfig::default(),
        }
    }
}

/// A served request: which vendor answered, under which vendor-side model
/// name, and the translated response.
pub struct RouterResult {
    pub vendor: Vendor,
    pub vendor_model: String,
    pub requested_model: String,
    pub response: ProviderResponse,
}

pub enum ExecuteOutcome {
    Completed(RouterResult),
    Queued { job_id: Uuid, estimated_wait_ms: u64 },
}

impl std::fmt::Debug for ExecuteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteOutcome::Completed(result) => f
                .debug_tuple("Completed")
                .field(&result.vendor)
                .field(&result.vendor_model)
                .field(&result.requested_model)
                .finish(),
            ExecuteOutcome::Queued {
                job_id,
                estimated_wait_ms,
            } => f
                .debug_struct("Queued")
                .field("job_id", job_id)
                .field("estimated_wait_ms", estimated_wait_ms)
                .finish(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no provider can serve model {0}")]
    NoRoute(String),

    /// Client-fatal vendor rejection (non-429 4xx), propagated unchanged.
    #[error(transparent)]
    Provider(ProviderError),

    #[error("queue is full")]
    QueueFull,

    /// Terminal failure of an inline-queued request.
    #[error("{}", .0.message)]
    Job(JobError),

    #[error("request cancelled")]
    Cancelled,
}

enum ChainOutcome {
    Served(RouterResult),
    Fatal(RouterError),
    Exhausted,
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct VendorStatus {
    pub vendor: Vendor,
    pub circuit_state: &'static str,
    pub failure_count: u32,
    pub models: Vec<ModelStatus>,
}

#[derive(Debug, Serialize)]
pub struct ModelStatus {
    pub model: String,
    #[serde(flatten)]
    pub state: ModelRateState,
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub providers: Vec<VendorStatus>,
    pub queue_size: usize,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router {
    catalog: Catalog,
    providers: HashMap<Vendor, Arc<dyn Provider>>,
    priority: Vec<Vendor>,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<RateLimitTracker>,
    queue: Arc<RequestQueue>,
    clock: Arc<dyn Clock>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Load shared state (if configured) and resume any queued work left by
    /// a previous instance.
    pub async fn hydrate(&self) {
        self.breaker.load_from_store().await;
        self.tracker.load_from_store().await;
        self.queue.resume_from_store().await;
    }

    /// Route one request through the fallback chain; on exhaustion, park it
    /// in the queue.
    pub async fn execute(
        &self,
        requested_model: &str,
        capability: Capability,
        signal: CancellationToken,
        body: Value,
    ) -> Result<ExecuteOutcome, RouterError> {
        let chain = self.build_fallback_chain(requested_model, capability);
        if chain.is_empty() {
            return Err(RouterError::NoRoute(requested_model.to_string()));
        }

        match self
            .try_chain(&chain, requested_model, capability, &signal, &body)
            .await
        {
            ChainOutcome::Served(result) => Ok(ExecuteOutcome::Completed(result)),
            ChainOutcome::Fatal(err) => Err(err),
            ChainOutcome::Exhausted => {
                let earliest = self.tracker.earliest_available(&chain);
                let estimated_wait_ms =
                    (earliest - self.clock.now()).num_milliseconds().max(0) as u64;
                tracing::warn!(
                    model = requested_model,
                    estimated_wait_ms,
                    "all providers exhausted, deferring to queue"
                );

                match self
                    .queue
                    .enqueue(capability, requested_model, estimated_wait_ms, body)
                    .await
                {
                    Ok(EnqueueOutcome::Sync(Ok(resp))) => {
                        Ok(ExecuteOutcome::Completed(RouterResult {
                            vendor: resp.vendor,
                            vendor_model: resp.vendor_model,
                            requested_model: requested_model.to_string(),
                            response: ProviderResponse {
                                status: 200,
                                headers: HashMap::new(),
                                body: ResponseBody::Json(resp.body),
                            },
                        }))
                    }
                    Ok(EnqueueOutcome::Sync(Err(job_err))) => Err(RouterError::Job(job_err)),
                    Ok(EnqueueOutcome::Async {
                        job_id,
                        estimated_wait_ms,
                    }) => Ok(ExecuteOutcome::Queued {
                        job_id,
                        estimated_wait_ms,
                    }),
                    Err(QueueError::Full) => Err(RouterError::QueueFull),
                }
            }
        }
    }

    /// Ordered (vendor, vendor-model) candidates from the priority config.
    /// Unknown models still get a single best-effort entry on the first
    /// registered vendor, under their raw name.
    pub fn build_fallback_chain(&self, requested_model: &str, _capability: Capability) -> Vec<ChainEntry> {
        let mapping = self.catalog.find_mapping(requested_model);
        let mut chain = Vec::new();

        if let Some(mapping) = mapping {
            for vendor in &self.priority {
                if !self.providers.contains_key(vendor) {
                    continue;
                }
                if let Some(model) = mapping.name_for(*vendor) {
                    chain.push(ChainEntry {
                        vendor: *vendor,
                        model: model.to_string(),
                    });
                }
            }
        } else if let Some(first) = self
            .priority
            .iter()
            .find(|v| self.providers.contains_key(v))
        {
            chain.push(ChainEntry {
                vendor: *first,
                model: requested_model.to_string(),
            });
        }

        chain
    }

    async fn try_chain(
        &self,
        chain: &[ChainEntry],
        requested_model: &str,
        capability: Capability,
        signal: &CancellationToken,
        body: &Value,
    ) -> ChainOutcome {
        for (index, entry) in chain.iter().enumerate() {
            if signal.is_cancelled() {
                return ChainOutcome::Fatal(RouterError::Cancelled);
            }
            if !self.breaker.is_available(entry.vendor) {
                tracing::debug!(vendor = %entry.vendor, "skipping vendor, circuit not closed");
                continue;
            }
            if self.tracker.should_avoid(entry.vendor, &entry.model) {
                tracing::debug!(
                    vendor = %entry.vendor,
                    model = %entry.model,
                    "skipping vendor, rate pressure"
                );
                continue;
            }

            let provider = &self.providers[&entry.vendor];
            match provider
                .call(capability, requested_model, &entry.model, signal, body)
                .await
            {
                Ok(resp) => {
                    self.tracker
                        .update(entry.vendor, &entry.model, &resp.headers, resp.status);
                    self.breaker.record_success(entry.vendor);
                    if index > 0 {
                        let tier = self
                            .catalog
                            .find_mapping(requested_model)
                            .map(|m| m.tier.as_str())
                            .unwrap_or("unknown");
                        tracing::warn!(
                            requested = requested_model,
                            vendor = %entry.vendor,
                            model = %entry.model,
                            tier,
                            "served by fallback vendor"
                        );
                    }
                    return ChainOutcome::Served(RouterResult {
                        vendor: entry.vendor,
                        vendor_model: entry.model.clone(),
                        requested_model: requested_model.to_string(),
                        response: resp,
                    });
                }
                Err(err) => match &err {
                    ProviderError::Http {
                        status, headers, ..
                    } => {
                        self.tracker
                            .update(entry.vendor, &entry.model, headers, *status);
                        if *status >= 500 {
                            self.breaker.record_failure(entry.vendor);
                            tracing::warn!(vendor = %entry.vendor, status, "vendor failure, trying next");
                            continue;
                        }
                        if *status == 429 {
                            tracing::info!(vendor = %entry.vendor, "vendor rate limited, trying next");
                            continue;
                        }
                        // Any other 4xx is the client's problem; fallback
                        // would just repeat it.
                        return ChainOutcome::Fatal(RouterError::Provider(err));
                    }
                    ProviderError::Cancelled => {
                        return ChainOutcome::Fatal(RouterError::Cancelled);
                    }
                    _ => {
                        self.breaker.record_failure(entry.vendor);
                        tracing::warn!(vendor = %entry.vendor, error = %err, "transport failure, trying next");
                        continue;
                    }
                },
            }
        }
        ChainOutcome::Exhausted
    }

    /// The queue's drain callback re-enters the attempt loop here.
    async fn drain_attempt(&self, req: QueuedRequest) -> Result<DrainedResponse, DrainError> {
        let chain = self.build_fallback_chain(&req.requested_model, req.capability);
        if chain.is_empty() {
            return Err(DrainError::Failed(JobError {
                status: 400,
                code: "invalid_request_error".to_string(),
                message: format!("no provider can serve model {}", req.requested_model),
            }));
        }

        match self
            .try_chain(&chain, &req.requested_model, req.capability, &req.signal, &req.body)
            .await
        {
            ChainOutcome::Served(result) => match result.response.body {
                ResponseBody::Json(body) => Ok(DrainedResponse {
                    vendor: result.vendor,
                    vendor_model: result.vendor_model,
                    body,
                }),
                ResponseBody::Stream(_) => Err(DrainError::Failed(JobError {
                    status: 500,
                    code: "api_error".to_string(),
                    message: "queued request produced a stream".to_string(),
                })),
            },
            ChainOutcome::Fatal(RouterError::Provider(err)) => {
                Err(DrainError::Failed(JobError {
                    status: err.status().unwrap_or(500),
                    code: "upstream_error".to_string(),
                    message: err.to_string(),
                }))
            }
            ChainOutcome::Fatal(RouterError::Cancelled) => Err(DrainError::Failed(JobError {
                status: 499,
                code: "request_cancelled".to_string(),
                message: "request cancelled".to_string(),
            })),
            ChainOutcome::Fatal(err) => Err(DrainError::Failed(JobError {
                status: 500,
                code: "api_error".to_string(),
                message: err.to_string(),
            })),
            ChainOutcome::Exhausted => Err(DrainError::Exhausted {
                retry_at: self.tracker.earliest_available(&chain),
            }),
        }
    }

    /// Per-vendor breaker and rate-limit view plus queue depth.
    pub fn status(&self) -> StatusSnapshot {
        let rates = self.tracker.snapshot();
        let providers = self
            .priority
            .iter()
            .filter(|v| self.providers.contains_key(v))
            .map(|vendor| {
                let circuit = self.breaker.state_of(*vendor);
                let models = rates
                    .iter()
                    .filter(|(v, _, _)| v == vendor)
                    .map(|(_, model, state)| ModelStatus {
                        model: model.clone(),
                        state: state.clone(),
                    })
                    .collect();
                VendorStatus {
                    vendor: *vendor,
                    circuit_state: circuit.state.as_str(),
                    failure_count: circuit.failure_count,
                    models,
                }
            })
            .collect();

        StatusSnapshot {
            providers,
            queue_size: self.queue.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder (also wires the queue's drain callback back into the router)
// ---------------------------------------------------------------------------

pub struct RouterBuilder {
    catalog: Catalog,
    providers: Vec<Arc<dyn Provider>>,
    config: RouterConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<StateStore>>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            catalog: Catalog::new(),
            providers: Vec::new(),
            config: RouterConfig::default(),
            clock: system_clock(),
            store: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Arc<Router> {
        let breaker = Arc::new(CircuitBreaker::new(
            self.config.cb_failure_threshold,
            self.config.cb_cooldown_ms,
            Arc::clone(&self.clock),
            self.store.clone(),
        ));
        let tracker = Arc::new(RateLimitTracker::new(
            self.config.low_requests_threshold,
            Arc::clone(&self.clock),
            self.store.clone(),
        ));
        let queue = RequestQueue::new(
            self.config.queue.clone(),
            Arc::clone(&self.clock),
            self.store.clone(),
        );

        let providers: HashMap<Vendor, Arc<dyn Provider>> = self
            .providers
            .into_iter()
            .map(|p| (p.vendor(), p))
            .collect();

        let router = Arc::new(Router {
            catalog: self.catalog,
            providers,
            priority: self.config.priority,
            breaker,
            tracker,
            queue,
            clock: self.clock,
        });

        // The queue calls back into the router through a weak reference;
        // injection after construction breaks the ownership cycle.
        let weak = Arc::downgrade(&router);
        router.queue.set_drain_fn(Arc::new(move |req| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(router) = weak.upgrade() else {
                    return Err(DrainError::Failed(JobError {
                        status: 500,
                        code: "api_error".to_string(),
                        message: "router shut down".to_string(),
                    }));
                };
                router.drain_attempt(req).await
            })
        }));

        router
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
