pub mod breaker;
pub mod catalog;
pub mod clock;
pub mod compat;
pub mod headers;
pub mod providers;
pub mod queue;
pub mod ratelimit;
pub mod router;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use breaker::{CircuitBreaker, CircuitState};
pub use catalog::{Catalog, ModelMapping};
pub use clock::{system_clock, Clock, SystemClock};
pub use providers::{Provider, ProviderError, ProviderResponse, ResponseBody, SseStream};
pub use queue::{JobStatus, PollResult, QueueConfig, RequestQueue};
pub use ratelimit::RateLimitTracker;
pub use router::{ExecuteOutcome, Router, RouterBuilder, RouterConfig, RouterError, RouterResult};
pub use store::StateStore;
pub use types::{Capability, ChainEntry, Tier, Vendor};
