//! Cache and event-bus benchmark suite.
//!
//! Benchmarks the hot paths every tool call crosses:
//! - Response cache: fingerprinting, hits, inserts under eviction
//! - Event bus: publish fan-out, filtered history queries
//! - Engine: a cached tool call end to end
//!
//! Run with: cargo bench --bench cache_and_events
//! Results saved to: target/criterion/

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::{Value, json};
use tokio::runtime::Runtime;

use browser_mcp_server::cache::fingerprint;
use browser_mcp_server::config::{CacheConfig, EventConfig};
use browser_mcp_server::events::{EventQuery, EventSource, event_callback};
use browser_mcp_server::pool::{MidOptions, TopOptions};
use browser_mcp_server::{
    AutomationBackend, BrowserKind, Event, EventBus, EventCategory, EventFilter, Origin,
    ResourceId, ResourceLevel, ResponseCache, Result, Server, ToolCall,
};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const CACHE_SIZES: &[usize] = &[100, 1_000];
const SUBSCRIBER_COUNTS: &[usize] = &[0, 10, 100];
const HISTORY_SIZE: usize = 10_000;

// ============================================================================
// Benchmark: Response Cache
// ============================================================================

fn bench_fingerprint(c: &mut Criterion) {
    let arguments = json!({
        "pageId": "page-42",
        "urls": ["https://example.com", "https://example.org"],
        "options": { "b": 2, "a": 1 },
    });

    c.bench_function("fingerprint", |b| {
        b.iter(|| fingerprint(black_box("cookies"), black_box(&arguments)));
    });
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_cache");

    for &size in CACHE_SIZES {
        let cache = ResponseCache::new(CacheConfig {
            max_entries: size,
            ..CacheConfig::default()
        });
        let value = json!({ "title": "Example Domain", "url": "https://example.com" });
        for i in 0..size {
            cache.set(&format!("key-{i}"), &value, None, &[format!("page:{}", i % 10)]);
        }

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("hit", size), &size, |b, &size| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % size;
                black_box(cache.get(&format!("key-{i}")))
            });
        });

        group.bench_with_input(BenchmarkId::new("insert_evicting", size), &size, |b, _| {
            let mut i = size;
            b.iter(|| {
                i += 1;
                cache.set(&format!("key-{i}"), &value, Some(Duration::from_secs(60)), &[])
            });
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Event Bus
// ============================================================================

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_publish");
    group.throughput(Throughput::Elements(1));

    for &subscribers in SUBSCRIBER_COUNTS {
        let bus = EventBus::new(EventConfig::default());
        for i in 0..subscribers {
            let filter = if i % 2 == 0 {
                EventFilter::all()
            } else {
                EventFilter::all().categories([EventCategory::Network])
            };
            bus.subscribe(filter, None, event_callback(|_| Ok(())));
        }

        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    bus.publish(
                        Event::new("page.loaded", EventCategory::Lifecycle)
                            .with_source(EventSource::page("page-1"))
                            .with_data(json!({ "ms": 12 })),
                    )
                });
            },
        );
    }

    // History full: every publish also evicts the oldest record.
    let full = EventBus::new(EventConfig {
        max_history: HISTORY_SIZE,
        ..EventConfig::default()
    });
    for i in 0..HISTORY_SIZE {
        full.publish(
            Event::new(format!("type-{}", i % 20), EventCategory::Network)
                .with_source(EventSource::page(format!("page-{}", i % 50))),
        );
    }
    group.bench_function("history_at_cap", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i += 1;
            full.publish(
                Event::new(format!("type-{}", i % 20), EventCategory::Network)
                    .with_source(EventSource::page(format!("page-{}", i % 50))),
            )
        });
    });

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let bus = EventBus::new(EventConfig::default());
    let categories = [
        EventCategory::Lifecycle,
        EventCategory::Network,
        EventCategory::Console,
        EventCategory::Tool,
    ];
    for i in 0..HISTORY_SIZE {
        bus.publish(
            Event::new(format!("type-{}", i % 20), categories[i % categories.len()])
                .with_source(EventSource::page(format!("page-{}", i % 50))),
        );
    }

    let by_category = EventQuery {
        filter: EventFilter::all().categories([EventCategory::Network]),
        limit: 100,
    };

    let mut group = c.benchmark_group("event_query");
    group.bench_function("by_category", |b| b.iter(|| bus.query_events(black_box(&by_category))));
    group.bench_function("recent", |b| b.iter(|| bus.get_recent_events(black_box(100))));
    group.bench_function("by_source", |b| {
        let source = EventSource::page("page-7");
        b.iter(|| bus.get_events_by_source(black_box(&source), 100));
    });
    group.finish();
}

// ============================================================================
// Benchmark: Engine Round Trip
// ============================================================================

struct StaticBackend;

#[async_trait]
impl AutomationBackend for StaticBackend {
    async fn create_top(&self, _: BrowserKind, _: &TopOptions) -> Result<ResourceId> {
        Ok(ResourceId::new("browser"))
    }

    async fn create_mid(&self, _: &ResourceId, _: &MidOptions) -> Result<ResourceId> {
        Ok(ResourceId::new("context"))
    }

    async fn create_leaf(&self, _: &ResourceId) -> Result<ResourceId> {
        Ok(ResourceId::new("page"))
    }

    async fn is_connected(&self, _: &ResourceId) -> bool {
        true
    }

    async fn close(&self, _: &ResourceId, _: ResourceLevel) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _: Option<&ResourceId>, _: &ToolCall) -> Result<Value> {
        Ok(json!("Example Domain"))
    }
}

fn bench_cached_tool_call(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let _guard = rt.enter();
    let server = Server::builder()
        .backend(Arc::new(StaticBackend))
        .build()
        .expect("server");
    let origin = Origin::new("bench", browser_mcp_server::ConnectionId::generate());

    rt.block_on(async {
        let init = json!({
            "jsonrpc": "2.0", "id": 0, "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "bench", "version": "0" },
            },
        });
        server.process(origin.clone(), &init.to_string()).await;
    });

    let call = json!({
        "jsonrpc": "2.0", "id": 1, "method": "tools/call",
        "params": { "name": "current-title", "arguments": {} },
    })
    .to_string();

    c.bench_function("cached_tool_call", |b| {
        b.to_async(&rt)
            .iter(|| async { server.process(origin.clone(), black_box(&call)).await });
    });
}

criterion_group!(
    benches,
    bench_fingerprint,
    bench_cache,
    bench_publish,
    bench_query,
    bench_cached_tool_call
);
criterion_main!(benches);
