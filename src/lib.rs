// Flight route aggregation over multiple upstream providers

// Building blocks
pub mod cache;
pub mod circuit_breaker;
pub mod context;
pub mod models;
pub mod transport;

// Upstream access and aggregation
pub mod aggregator;
pub mod provider;
pub mod resilient_client;

// Ambient
pub mod config;
pub mod telemetry;

// Re-export key types for convenience
pub use aggregator::{AggregateError, RouteAggregator, RouteAggregatorBuilder};
pub use cache::{CacheConfig, CacheStats, TtlCache};
pub use config::{load_config, AppConfig, ConfigError};
pub use context::{CancelHandle, RequestContext};
pub use models::{AggregateResult, CodeShare, HealthReport, Route, RouteFilters};
pub use provider::{HttpRouteProvider, ProviderError, RouteCache, RouteProvider};
pub use resilient_client::{FetchError, ResilientClient};
pub use transport::{HttpTransport, ReqwestTransport};
