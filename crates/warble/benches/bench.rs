use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicI64, Ordering},
    },
    thread::scope,
    time::Instant,
};
use tokio::runtime::Builder;
use warble::{
    Broker, BrokerConfig, CUSTOM_EPOCH_MS, ChannelPool, ComposeConfig, ComposePost, Creator,
    FanoutConfig, FanoutPipeline, InMemoryComponentStore, InMemoryPostStore, InMemorySocialGraph,
    InMemoryTimelines, PostIdGenerator, PostType, TimeSource, WallClock,
};

// IDs generated per benchmark iteration (per-thread for multi-threaded).
const TOTAL_IDS: usize = 4096;

#[derive(Clone, Copy)]
struct FixedMockTime {
    millis: i64,
}

impl TimeSource for FixedMockTime {
    fn unix_millis(&self) -> i64 {
        self.millis
    }
}

fn fixed_clock() -> FixedMockTime {
    FixedMockTime {
        millis: CUSTOM_EPOCH_MS + 1_000_000,
    }
}

fn bench_idgen_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("idgen/sequential");
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    group.bench_function(format!("elems/{TOTAL_IDS}"), |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                let generator = PostIdGenerator::new("a", fixed_clock()).unwrap();
                for _ in 0..TOTAL_IDS {
                    black_box(generator.generate().unwrap());
                }
            }

            start.elapsed()
        });
    });

    group.finish();
}

fn bench_idgen_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("idgen/contended");

    for thread_count in [1, 2, 4, 8] {
        let ids_per_thread = TOTAL_IDS / thread_count;

        group.throughput(Throughput::Elements(TOTAL_IDS as u64));
        group.bench_function(format!("elems/{TOTAL_IDS}/threads/{thread_count}"), |b| {
            b.iter_custom(|iters| {
                let start = Instant::now();

                for _ in 0..iters {
                    let generator = Arc::new(PostIdGenerator::new("a", fixed_clock()).unwrap());
                    let barrier = Arc::new(Barrier::new(thread_count + 1));
                    scope(|s| {
                        for _ in 0..thread_count {
                            let generator = Arc::clone(&generator);
                            let barrier = Arc::clone(&barrier);
                            s.spawn(move || {
                                barrier.wait();
                                for _ in 0..ids_per_thread {
                                    black_box(generator.generate().unwrap());
                                }
                            });
                        }
                        barrier.wait();
                    });
                }

                start.elapsed()
            });
        });
    }

    group.finish();
}

type BenchCompose =
    ComposePost<InMemoryComponentStore, InMemoryPostStore, InMemoryTimelines, WallClock>;

/// Full write path: six uploads per post, fan-out drained by a live
/// pipeline. Every post gets its own author so the in-memory timelines
/// stay flat across iterations.
fn bench_compose_end_to_end(c: &mut Criterion) {
    let rt = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .build()
        .unwrap();

    let (compose, _pipeline) = rt.block_on(async {
        let broker = Broker::new(BrokerConfig::default());
        let pool = ChannelPool::new(broker.connect(), 8);
        let components = Arc::new(InMemoryComponentStore::default());
        let posts = Arc::new(InMemoryPostStore::default());
        let graph = Arc::new(InMemorySocialGraph::default());
        let home_timelines = Arc::new(InMemoryTimelines::default());
        let user_timelines = Arc::new(InMemoryTimelines::default());

        let pipeline = FanoutPipeline::spawn(
            pool.clone(),
            Arc::clone(&posts),
            Arc::clone(&graph),
            home_timelines,
            FanoutConfig::default(),
        )
        .await
        .unwrap();

        let compose: Arc<BenchCompose> = Arc::new(ComposePost::new(
            components,
            posts,
            user_timelines,
            pool,
            WallClock,
            ComposeConfig::default(),
        ));
        (compose, pipeline)
    });

    let next_req = Arc::new(AtomicI64::new(1));

    let mut group = c.benchmark_group("compose/end-to-end");
    group.throughput(Throughput::Elements(1));
    group.bench_function("six-uploads", |b| {
        b.to_async(&rt).iter_custom(|iters| {
            let compose = Arc::clone(&compose);
            let next_req = Arc::clone(&next_req);
            async move {
                let start = Instant::now();

                for _ in 0..iters {
                    let req_id = next_req.fetch_add(1, Ordering::Relaxed);
                    let creator = Creator {
                        user_id: req_id,
                        username: format!("user-{req_id}"),
                    };
                    compose.upload_creator(req_id, &creator).await.unwrap();
                    compose.upload_text(req_id, "benchmark post").await.unwrap();
                    compose.upload_media(req_id, &[]).await.unwrap();
                    compose.upload_urls(req_id, &[]).await.unwrap();
                    compose.upload_user_mentions(req_id, &[]).await.unwrap();
                    compose
                        .upload_unique_id(req_id, req_id + 1_000_000, PostType::Post)
                        .await
                        .unwrap();
                }

                start.elapsed()
            }
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_idgen_sequential,
    bench_idgen_contended,
    bench_compose_end_to_end
);
criterion_main!(benches);
