// Provider adapters: fetch, normalize and cache one upstream's routes

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    cache::{create_cache_key, TtlCache},
    circuit_breaker::CircuitBreakerConfig,
    context::RequestContext,
    models::{CodeShare, Route},
    resilient_client::{ClientConfig, FetchError, ResilientClient, RetryConfig},
    transport::HttpTransport,
};

pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Routes are shared between the cache and every reader.
pub type SharedRoutes = Arc<Vec<Route>>;
pub type RouteCache = TtlCache<SharedRoutes>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    pub fn is_interruption(&self) -> bool {
        matches!(self, ProviderError::Fetch(e) if e.is_interruption())
    }
}

#[async_trait]
pub trait RouteProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn get_routes(&self, ctx: &RequestContext) -> Result<SharedRoutes, ProviderError>;

    /// Lightweight probe, never used to serve route data.
    async fn is_healthy(&self, ctx: &RequestContext) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub routes_path: String,
    pub health_path: String,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub retry_config: RetryConfig,
    pub circuit_breaker_config: CircuitBreakerConfig,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            routes_path: String::new(),
            health_path: "/health".to_string(),
            timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(300),
            retry_config: RetryConfig::default(),
            circuit_breaker_config: CircuitBreakerConfig::default(),
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            service_name: self.name.clone(),
            base_url: self.base_url.clone(),
            timeout: self.timeout,
            retry_config: self.retry_config.clone(),
            circuit_breaker_config: self.circuit_breaker_config.clone(),
        }
    }
}

// Upstream payload: either a bare array or `{ "routes": [...] }`. Records are
// kept as raw values so one bad record cannot fail the batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum RoutesPayload {
    Wrapped { routes: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRoute {
    #[serde(default)]
    airline: String,
    #[serde(default)]
    source_airport: String,
    #[serde(default)]
    destination_airport: String,
    #[serde(default)]
    code_share: String,
    #[serde(default)]
    stops: i64,
    #[serde(default)]
    equipment: Option<String>,
}

impl RawRoute {
    fn into_route(self, provider: &str) -> Result<Route, String> {
        let airline = self.airline.trim();
        let source_airport = self.source_airport.trim();
        let destination_airport = self.destination_airport.trim();

        if airline.is_empty() {
            return Err("airline is required".to_string());
        }
        if source_airport.is_empty() {
            return Err("source airport is required".to_string());
        }
        if destination_airport.is_empty() {
            return Err("destination airport is required".to_string());
        }
        let code_share = CodeShare::parse(&self.code_share)
            .ok_or_else(|| format!("invalid code share {:?}", self.code_share))?;
        let stops = u32::try_from(self.stops)
            .map_err(|_| format!("stops must be non-negative, got {}", self.stops))?;

        let equipment = self
            .equipment
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty() && e != "UNKNOWN");

        Ok(Route {
            airline: airline.to_string(),
            source_airport: source_airport.to_string(),
            destination_airport: destination_airport.to_string(),
            code_share,
            stops,
            equipment,
            provider: provider.to_string(),
        })
    }
}

/// Parses an upstream payload into routes stamped with `provider`. Returns the
/// surviving routes and the number of dropped records.
pub fn parse_routes(body: &[u8], provider: &str) -> Result<(Vec<Route>, usize), ProviderError> {
    let payload: RoutesPayload =
        serde_json::from_slice(body).map_err(|e| ProviderError::Parse(e.to_string()))?;

    let records = match payload {
        RoutesPayload::Wrapped { routes } => routes,
        RoutesPayload::Bare(routes) => routes,
    };

    let total = records.len();
    let mut routes = Vec::with_capacity(total);

    for (index, record) in records.into_iter().enumerate() {
        let parsed = serde_json::from_value::<RawRoute>(record)
            .map_err(|e| e.to_string())
            .and_then(|raw| raw.into_route(provider));

        match parsed {
            Ok(route) => routes.push(route),
            Err(reason) => {
                tracing::warn!(provider, index, %reason, "invalid route skipped");
            }
        }
    }

    let skipped = total - routes.len();
    Ok((routes, skipped))
}

pub struct HttpRouteProvider {
    config: ProviderConfig,
    client: ResilientClient,
    cache: Arc<RouteCache>,
    cache_key: String,
}

impl HttpRouteProvider {
    pub fn new(
        config: ProviderConfig,
        transport: Arc<dyn HttpTransport>,
        cache: Arc<RouteCache>,
    ) -> Self {
        let client = ResilientClient::new(config.client_config(), transport);
        let cache_key = create_cache_key("routes", &config.name);

        Self {
            config,
            client,
            cache,
            cache_key,
        }
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    async fn load_routes(&self, ctx: &RequestContext) -> Result<SharedRoutes, ProviderError> {
        tracing::debug!(
            provider = %self.config.name,
            correlation_id = %ctx.correlation_id,
            "fetching routes from upstream"
        );

        let body = self.client.fetch(ctx, &self.config.routes_path).await?;
        let (routes, skipped) = parse_routes(&body, &self.config.name)?;

        tracing::info!(
            provider = %self.config.name,
            correlation_id = %ctx.correlation_id,
            routes = routes.len(),
            skipped,
            "fetched routes from upstream"
        );

        Ok(Arc::new(routes))
    }
}

#[async_trait]
impl RouteProvider for HttpRouteProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn get_routes(&self, ctx: &RequestContext) -> Result<SharedRoutes, ProviderError> {
        let load = self
            .cache
            .get_or_load(&self.cache_key, self.config.cache_ttl, || {
                self.load_routes(ctx)
            });

        // callers queued behind another caller's load still honour their own context
        tokio::select! {
            biased;
            routes = load => routes,
            interruption = ctx.interrupted() => Err(FetchError::from(interruption).into()),
        }
    }

    async fn is_healthy(&self, ctx: &RequestContext) -> Result<(), ProviderError> {
        let timeout = HEALTH_CHECK_TIMEOUT.min(self.config.timeout);
        self.client
            .probe(ctx, &self.config.health_path, timeout)
            .await?;
        Ok(())
    }
}
