// Route data model shared by providers and the aggregator

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CodeShare {
    #[serde(rename = "Y")]
    Yes,
    #[serde(rename = "N")]
    No,
}

impl CodeShare {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "Y" | "y" => Some(CodeShare::Yes),
            "N" | "n" => Some(CodeShare::No),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CodeShare::Yes => "Y",
            CodeShare::No => "N",
        }
    }
}

impl fmt::Display for CodeShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized flight route. `provider` is always stamped by the adapter
/// that produced the route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub airline: String,
    pub source_airport: String,
    pub destination_airport: String,
    pub code_share: CodeShare,
    pub stops: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<String>,
    pub provider: String,
}

/// Identity used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey<'a> {
    pub airline: &'a str,
    pub source_airport: &'a str,
    pub destination_airport: &'a str,
    pub code_share: CodeShare,
    pub stops: u32,
}

impl Route {
    pub fn dedup_key(&self) -> RouteKey<'_> {
        RouteKey {
            airline: &self.airline,
            source_airport: &self.source_airport,
            destination_airport: &self.destination_airport,
            code_share: self.code_share,
            stops: self.stops,
        }
    }

    pub fn sort_key(&self) -> (&str, &str, &str, u32) {
        (
            &self.airline,
            &self.source_airport,
            &self.destination_airport,
            self.stops,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteFilters {
    pub airline: Option<String>,
    pub source_airport: Option<String>,
    pub destination_airport: Option<String>,
    pub max_stops: Option<u32>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for RouteFilters {
    fn default() -> Self {
        Self {
            airline: None,
            source_airport: None,
            destination_airport: None,
            max_stops: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

fn field_matches(filter: &Option<String>, value: &str) -> bool {
    match filter.as_deref() {
        None | Some("") => true,
        Some(expected) => expected == value,
    }
}

impl RouteFilters {
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_LIMIT
        } else {
            self.limit
        }
    }

    pub fn matches(&self, route: &Route) -> bool {
        field_matches(&self.airline, &route.airline)
            && field_matches(&self.source_airport, &route.source_airport)
            && field_matches(&self.destination_airport, &route.destination_airport)
            && self.max_stops.map_or(true, |max| route.stops <= max)
    }

    /// Applies the predicates, then `offset` and `limit`, to an already sorted
    /// sequence. Returns the page and the number of matches before paging.
    pub fn apply(&self, routes: &[Route]) -> (Vec<Route>, usize) {
        let matching: Vec<&Route> = routes.iter().filter(|r| self.matches(r)).collect();
        let total = matching.len();

        let page = matching
            .into_iter()
            .skip(self.offset)
            .take(self.effective_limit())
            .cloned()
            .collect();

        (page, total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub routes: Vec<Route>,
    pub total_count: usize,
    pub providers_used: Vec<String>,
    pub failed_providers: Vec<ProviderFailure>,
    pub cache_hit: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderHealth {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallHealth {
    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a ProviderHealth>) -> Self {
        let (mut healthy, mut total) = (0usize, 0usize);
        for status in statuses {
            total += 1;
            if *status == ProviderHealth::Healthy {
                healthy += 1;
            }
        }

        match (healthy, total) {
            (0, _) => OverallHealth::Unhealthy,
            (h, t) if h == t => OverallHealth::Healthy,
            _ => OverallHealth::Degraded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: OverallHealth,
    pub providers: BTreeMap<String, ProviderHealth>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) fn route(airline: &str, src: &str, dst: &str, stops: u32, provider: &str) -> Route {
    Route {
        airline: airline.to_string(),
        source_airport: src.to_string(),
        destination_airport: dst.to_string(),
        code_share: CodeShare::No,
        stops,
        equipment: None,
        provider: provider.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Route> {
        vec![
            route("AA", "JFK", "LAX", 0, "p1"),
            route("AA", "JFK", "SFO", 1, "p1"),
            route("BA", "LHR", "JFK", 0, "p1"),
            route("BA", "LHR", "JFK", 2, "p2"),
            route("UA", "SFO", "ORD", 1, "p2"),
        ]
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let (page, total) = RouteFilters::default().apply(&sample());
        assert_eq!(total, 5);
        assert_eq!(page.len(), 5);
    }

    #[test]
    fn test_exact_match_and_max_stops() {
        let filters = RouteFilters {
            airline: Some("BA".to_string()),
            max_stops: Some(1),
            ..Default::default()
        };
        let (page, total) = filters.apply(&sample());
        assert_eq!(total, 1);
        assert_eq!(page[0].stops, 0);

        let filters = RouteFilters {
            source_airport: Some("JFK".to_string()),
            destination_airport: Some("SFO".to_string()),
            ..Default::default()
        };
        let (page, _) = filters.apply(&sample());
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].destination_airport, "SFO");
    }

    #[test]
    fn test_empty_string_filter_is_ignored() {
        let filters = RouteFilters {
            airline: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(filters.apply(&sample()).1, 5);
    }

    #[test]
    fn test_offset_and_limit_bounds() {
        let routes = sample();
        for offset in 0..7 {
            for limit in 1..7 {
                let filters = RouteFilters {
                    limit,
                    offset,
                    ..Default::default()
                };
                let (page, total) = filters.apply(&routes);
                assert!(page.len() <= limit);
                assert_eq!(page.len(), total.saturating_sub(offset).min(limit));
                if let Some(first) = page.first() {
                    assert_eq!(first, &routes[offset]);
                }
            }
        }
    }

    #[test]
    fn test_zero_limit_uses_default() {
        let filters = RouteFilters {
            limit: 0,
            ..Default::default()
        };
        assert_eq!(filters.effective_limit(), DEFAULT_LIMIT);
    }

    #[test]
    fn test_route_wire_shape() {
        let mut r = route("AA", "JFK", "LAX", 0, "p1");
        r.code_share = CodeShare::Yes;
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["sourceAirport"], "JFK");
        assert_eq!(json["codeShare"], "Y");
        assert!(json.get("equipment").is_none());
    }

    #[test]
    fn test_overall_health() {
        use ProviderHealth::*;
        assert_eq!(OverallHealth::from_statuses(&[Healthy, Healthy]), OverallHealth::Healthy);
        assert_eq!(OverallHealth::from_statuses(&[Healthy, Unhealthy]), OverallHealth::Degraded);
        assert_eq!(OverallHealth::from_statuses(&[Unhealthy]), OverallHealth::Unhealthy);
        assert_eq!(OverallHealth::from_statuses(&[]), OverallHealth::Unhealthy);
    }
}
