// Fan-out/fan-in over every registered provider: merge, dedup, sort, filter

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;

use crate::{
    cache::{create_cache_key, CacheConfig, TtlCache},
    config::{AppConfig, ConfigError},
    context::{Interruption, RequestContext},
    models::{
        AggregateResult, HealthReport, OverallHealth, ProviderFailure, ProviderHealth, Route,
        RouteFilters,
    },
    provider::{HttpRouteProvider, RouteCache, RouteProvider, SharedRoutes},
    transport::HttpTransport,
};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateError {
    #[error("request cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl From<Interruption> for AggregateError {
    fn from(interruption: Interruption) -> Self {
        match interruption {
            Interruption::Cancelled => AggregateError::Cancelled,
            Interruption::DeadlineExceeded => AggregateError::DeadlineExceeded,
        }
    }
}

/// Merged, deduplicated and sorted routes before filtering.
#[derive(Debug)]
struct Snapshot {
    routes: Vec<Route>,
    providers_used: Vec<String>,
    failed_providers: Vec<ProviderFailure>,
}

/// Drops later duplicates, keeping the first occurrence of every route key.
pub fn dedup_routes(routes: &mut Vec<Route>) {
    let keep: Vec<bool> = {
        let mut seen = HashSet::with_capacity(routes.len());
        routes.iter().map(|r| seen.insert(r.dedup_key())).collect()
    };

    let mut keep = keep.into_iter();
    routes.retain(|_| keep.next().unwrap_or(false));
}

/// Stable sort by airline, source, destination, stops.
pub fn sort_routes(routes: &mut [Route]) {
    routes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

pub struct RouteAggregator {
    providers: Vec<Arc<dyn RouteProvider>>,
    snapshot_cache: TtlCache<Arc<Snapshot>>,
    snapshot_ttl: Duration,
    snapshot_key: String,
}

pub struct RouteAggregatorBuilder {
    providers: Vec<Arc<dyn RouteProvider>>,
    snapshot_ttl: Duration,
}

impl RouteAggregatorBuilder {
    pub fn provider(mut self, provider: Arc<dyn RouteProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Zero disables the merged-snapshot cache.
    pub fn snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<RouteAggregator, ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let snapshot_cache = TtlCache::new(CacheConfig {
            enabled: !self.snapshot_ttl.is_zero(),
            default_ttl: self.snapshot_ttl,
            ..Default::default()
        });

        Ok(RouteAggregator {
            providers: self.providers,
            snapshot_cache,
            snapshot_ttl: self.snapshot_ttl,
            snapshot_key: create_cache_key("aggregate", "routes"),
        })
    }
}

impl RouteAggregator {
    pub fn builder() -> RouteAggregatorBuilder {
        RouteAggregatorBuilder {
            providers: Vec::new(),
            snapshot_ttl: Duration::ZERO,
        }
    }

    /// One `HttpRouteProvider` per enabled provider, in declaration order,
    /// all sharing `route_cache`.
    pub fn from_config(
        config: &AppConfig,
        transport: Arc<dyn HttpTransport>,
        route_cache: Arc<RouteCache>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let builder = config
            .enabled_providers()
            .fold(Self::builder(), |builder, settings| {
                builder.provider(Arc::new(HttpRouteProvider::new(
                    settings.to_provider_config(),
                    Arc::clone(&transport),
                    Arc::clone(&route_cache),
                )))
            });

        builder.snapshot_ttl(config.cache.aggregate_ttl()).build()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub async fn get_routes(
        &self,
        ctx: &RequestContext,
        filters: &RouteFilters,
    ) -> Result<AggregateResult, AggregateError> {
        if let Some(interruption) = ctx.interruption() {
            return Err(interruption.into());
        }

        let (snapshot, cache_hit) = match self.snapshot_cache.get(&self.snapshot_key) {
            Some(snapshot) => (snapshot, true),
            None => {
                let snapshot = Arc::new(self.collect(ctx).await?);
                if snapshot.failed_providers.is_empty() {
                    self.snapshot_cache.insert(
                        &self.snapshot_key,
                        Arc::clone(&snapshot),
                        Some(self.snapshot_ttl),
                    );
                }
                (snapshot, false)
            }
        };

        let (routes, total_count) = filters.apply(&snapshot.routes);

        tracing::info!(
            correlation_id = %ctx.correlation_id,
            returned = routes.len(),
            total_count,
            providers_used = snapshot.providers_used.len(),
            failed = snapshot.failed_providers.len(),
            cache_hit,
            "aggregated routes"
        );

        Ok(AggregateResult {
            routes,
            total_count,
            providers_used: snapshot.providers_used.clone(),
            failed_providers: snapshot.failed_providers.clone(),
            cache_hit,
            timestamp: Utc::now(),
        })
    }

    async fn collect(&self, ctx: &RequestContext) -> Result<Snapshot, AggregateError> {
        let outcomes = self.fan_out(ctx).await?;

        let mut routes = Vec::new();
        let mut providers_used = Vec::new();
        let mut failed_providers = Vec::new();

        // declaration order, so earlier providers win dedup ties
        for (provider, outcome) in self.providers.iter().zip(outcomes) {
            let name = provider.name().to_string();
            match outcome {
                Ok(provider_routes) => {
                    routes.extend(provider_routes.iter().cloned());
                    providers_used.push(name);
                }
                Err(reason) => {
                    tracing::warn!(
                        provider = %name,
                        correlation_id = %ctx.correlation_id,
                        %reason,
                        "provider failed"
                    );
                    failed_providers.push(ProviderFailure {
                        provider: name,
                        reason,
                    });
                }
            }
        }

        let merged = routes.len();
        dedup_routes(&mut routes);
        sort_routes(&mut routes);

        tracing::debug!(
            correlation_id = %ctx.correlation_id,
            merged,
            unique = routes.len(),
            "merged provider results"
        );

        Ok(Snapshot {
            routes,
            providers_used,
            failed_providers,
        })
    }

    /// Runs every provider on its own task and waits for all of them. On
    /// interruption every task is aborted and awaited before returning.
    async fn fan_out(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<Result<SharedRoutes, String>>, AggregateError> {
        let handles: Vec<_> = self
            .providers
            .iter()
            .map(|provider| {
                let provider = Arc::clone(provider);
                let ctx = ctx.clone();
                tokio::spawn(async move { provider.get_routes(&ctx).await })
            })
            .collect();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let joined = join_all(handles);
        tokio::pin!(joined);

        let results = tokio::select! {
            results = &mut joined => results,
            interruption = ctx.interrupted() => {
                for handle in &abort_handles {
                    handle.abort();
                }
                let _ = joined.await;
                return Err(interruption.into());
            }
        };

        if let Some(interruption) = ctx.interruption() {
            return Err(interruption.into());
        }

        Ok(results
            .into_iter()
            .map(|joined| match joined {
                Ok(Ok(routes)) => Ok(routes),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("provider task failed: {}", e)),
            })
            .collect())
    }

    /// Probes every provider concurrently.
    pub async fn get_health(&self, ctx: &RequestContext) -> Result<HealthReport, AggregateError> {
        let probes = self.providers.iter().map(|provider| async move {
            let status = match provider.is_healthy(ctx).await {
                Ok(()) => ProviderHealth::Healthy,
                Err(e) => {
                    tracing::warn!(
                        provider = provider.name(),
                        correlation_id = %ctx.correlation_id,
                        error = %e,
                        "health check failed"
                    );
                    ProviderHealth::Unhealthy
                }
            };
            (provider.name().to_string(), status)
        });

        let providers: BTreeMap<String, ProviderHealth> =
            join_all(probes).await.into_iter().collect();

        if let Some(interruption) = ctx.interruption() {
            return Err(interruption.into());
        }

        Ok(HealthReport {
            status: OverallHealth::from_statuses(providers.values()),
            providers,
            timestamp: Utc::now(),
        })
    }
}
