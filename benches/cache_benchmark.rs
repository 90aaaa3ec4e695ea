use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flight_routes::aggregator::{dedup_routes, sort_routes};
use flight_routes::cache::create_cache_key;
use flight_routes::{CacheConfig, CodeShare, Route, RouteFilters, TtlCache};
use rand::{seq::SliceRandom, thread_rng, Rng};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const AIRLINES: [&str; 6] = ["AA", "BA", "DL", "LH", "UA", "AF"];
const AIRPORTS: [&str; 8] = ["JFK", "LAX", "LHR", "CDG", "FRA", "SFO", "ORD", "ATL"];

fn random_routes(count: usize, provider: &str) -> Vec<Route> {
    let mut rng = thread_rng();
    (0..count)
        .map(|_| Route {
            airline: AIRLINES.choose(&mut rng).unwrap().to_string(),
            source_airport: AIRPORTS.choose(&mut rng).unwrap().to_string(),
            destination_airport: AIRPORTS.choose(&mut rng).unwrap().to_string(),
            code_share: if rng.gen_bool(0.2) { CodeShare::Yes } else { CodeShare::No },
            stops: rng.gen_range(0..3),
            equipment: None,
            provider: provider.to_string(),
        })
        .collect()
}

pub fn cache_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("route_cache");

    let routes = Arc::new(random_routes(1_000, "provider1"));
    let cache: TtlCache<Arc<Vec<Route>>> = TtlCache::new(CacheConfig::default());
    let key = create_cache_key("routes", "provider1");

    group.bench_function("get_or_load_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let value = cache
                    .get_or_load(&key, Duration::from_secs(300), || async {
                        Ok::<_, String>(routes.clone())
                    })
                    .await
                    .unwrap();
                black_box(value.len())
            })
        })
    });

    // mixed reads and writes from several threads over a small key space
    for threads in [1usize, 4].iter() {
        group.bench_with_input(BenchmarkId::new("mixed_access", threads), threads, |b, &threads| {
            b.iter(|| {
                let cache = Arc::new(TtlCache::<Arc<Vec<Route>>>::new(CacheConfig::default()));
                let names: Vec<String> = (0..20).map(|i| format!("provider{}", i)).collect();

                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let cache = Arc::clone(&cache);
                        let names = names.clone();
                        let routes = routes.clone();
                        thread::spawn(move || {
                            let mut rng = thread_rng();
                            for _ in 0..250 {
                                let key = create_cache_key("routes", names.choose(&mut rng).unwrap());
                                if rng.gen_bool(0.3) {
                                    cache.insert(&key, routes.clone(), None);
                                } else {
                                    let _ = cache.get(&key);
                                }
                            }
                        })
                    })
                    .collect();

                for handle in handles {
                    handle.join().unwrap();
                }

                black_box(cache.stats())
            });
        });
    }

    group.finish();
}

pub fn merge_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_pipeline");

    for per_provider in [1_000usize, 10_000].iter() {
        let mut merged = random_routes(*per_provider, "provider1");
        merged.extend(random_routes(*per_provider, "provider2"));
        let filters = RouteFilters {
            max_stops: Some(1),
            limit: 50,
            offset: 10,
            ..Default::default()
        };

        group.bench_with_input(
            BenchmarkId::new("dedup_sort_filter", per_provider),
            &merged,
            |b, merged| {
                b.iter(|| {
                    let mut routes = merged.clone();
                    dedup_routes(&mut routes);
                    sort_routes(&mut routes);
                    black_box(filters.apply(&routes))
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, cache_benchmark, merge_benchmark);
criterion_main!(benches);
