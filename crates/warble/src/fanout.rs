use crate::{
    aggregator::{FANOUT_EXCHANGE, fanout_routing_key},
    broker::Delivery,
    error::Result,
    model::{FanoutMessage, TimelinePost},
    pool::{ChannelPool, PooledChannel},
    store::{HomeTimelineStore, PostStore, SocialGraphStore},
    time::{TimeSource, WallClock},
};
use core::sync::atomic::Ordering::Relaxed;
use portable_atomic::AtomicU64;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct FanoutConfig {
    /// Region whose queue this pipeline consumes.
    pub region: String,
    pub num_workers: usize,
    /// How long each worker may wait for its channel at startup.
    pub pool_wait: Duration,
    /// How long shutdown waits per worker before aborting it.
    pub shutdown_timeout: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            region: "local".to_owned(),
            num_workers: 4,
            pool_wait: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

/// Counters the fan-out workers bump as they go.
#[derive(Debug, Default)]
pub struct FanoutMetrics {
    received: AtomicU64,
    timelines_updated: AtomicU64,
    inconsistencies: AtomicU64,
    poison_messages: AtomicU64,
    requeued: AtomicU64,
    queue_delay_ms_total: AtomicU64,
}

impl FanoutMetrics {
    /// Deliveries taken off the queue, including redeliveries.
    pub fn received(&self) -> u64 {
        self.received.load(Relaxed)
    }

    /// Home-timeline entries attempted per processed delivery; a
    /// redelivery counts its entries again even when the store
    /// deduplicates them.
    pub fn timelines_updated(&self) -> u64 {
        self.timelines_updated.load(Relaxed)
    }

    /// Messages referencing a post the store has no record of.
    pub fn inconsistencies(&self) -> u64 {
        self.inconsistencies.load(Relaxed)
    }

    /// Messages dropped because they would not decode.
    pub fn poison_messages(&self) -> u64 {
        self.poison_messages.load(Relaxed)
    }

    /// Deliveries nacked back to the queue after a store error.
    pub fn requeued(&self) -> u64 {
        self.requeued.load(Relaxed)
    }

    /// Summed milliseconds between publish and receipt.
    pub fn queue_delay_ms_total(&self) -> u64 {
        self.queue_delay_ms_total.load(Relaxed)
    }
}

/// Consumes one region's fan-out queue and writes follower home timelines.
///
/// [`spawn`](Self::spawn) borrows one pooled channel per worker, declares
/// and binds the region queue, and only then starts the workers; each
/// holds its channel until it stops. If a borrow or declare fails, no
/// worker is started and the channels taken so far go back to the pool.
/// Workers settle every delivery explicitly:
/// undecodable messages and messages whose post is missing are acked away
/// (the second case is counted as an inconsistency), store errors are
/// nacked so the broker can redeliver or dead-letter.
pub struct FanoutPipeline {
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    metrics: Arc<FanoutMetrics>,
    shutdown_timeout: Duration,
}

impl FanoutPipeline {
    pub async fn spawn<PS, SG, HT>(
        pool: ChannelPool,
        posts: Arc<PS>,
        graph: Arc<SG>,
        timelines: Arc<HT>,
        config: FanoutConfig,
    ) -> Result<Self>
    where
        PS: PostStore,
        SG: SocialGraphStore,
        HT: HomeTimelineStore,
    {
        let routing_key = fanout_routing_key(&config.region);
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(FanoutMetrics::default());

        // Every channel is acquired and bound before any worker spawns; a
        // failure here drops the guards gathered so far, which returns
        // their channels to the pool.
        let mut consumers = Vec::with_capacity(config.num_workers);
        for _ in 0..config.num_workers {
            let channel = pool.pop(config.pool_wait).await?;
            channel.exchange_declare(FANOUT_EXCHANGE)?;
            channel.queue_declare(&routing_key)?;
            channel.queue_bind(&routing_key, FANOUT_EXCHANGE, &routing_key)?;
            let consumer = channel.consume(&routing_key)?;
            consumers.push((channel, consumer));
        }

        let mut workers = Vec::with_capacity(consumers.len());
        for (worker_id, (channel, consumer)) in consumers.into_iter().enumerate() {
            let worker = FanoutWorker {
                worker_id,
                _channel: channel,
                consumer,
                posts: Arc::clone(&posts),
                graph: Arc::clone(&graph),
                timelines: Arc::clone(&timelines),
                metrics: Arc::clone(&metrics),
                shutdown: shutdown.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        info!(
            region = %config.region,
            workers = config.num_workers,
            queue = %routing_key,
            "fan-out pipeline up"
        );
        Ok(Self {
            workers,
            shutdown,
            metrics,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub fn metrics(&self) -> Arc<FanoutMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops the workers: each finishes the delivery it holds, then exits.
    /// A worker that outlives the per-worker deadline is aborted.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        let total = self.workers.len();
        let mut drained = 0usize;
        for handle in self.workers.drain(..) {
            let abort = handle.abort_handle();
            match timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(())) => drained += 1,
                Ok(Err(err)) => warn!(%err, "fan-out worker ended abnormally"),
                Err(_) => {
                    abort.abort();
                    warn!("fan-out worker exceeded the shutdown deadline, aborting");
                }
            }
        }
        info!(drained, total, "fan-out pipeline stopped");
    }
}

impl Drop for FanoutPipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct FanoutWorker<PS, SG, HT> {
    worker_id: usize,
    // Held for the worker's lifetime; returns to the pool when it stops.
    _channel: PooledChannel,
    consumer: crate::broker::Consumer,
    posts: Arc<PS>,
    graph: Arc<SG>,
    timelines: Arc<HT>,
    metrics: Arc<FanoutMetrics>,
    shutdown: CancellationToken,
}

impl<PS, SG, HT> FanoutWorker<PS, SG, HT>
where
    PS: PostStore,
    SG: SocialGraphStore,
    HT: HomeTimelineStore,
{
    async fn run(self) {
        debug!(
            worker = self.worker_id,
            queue = self.consumer.queue_name(),
            "fan-out worker up"
        );
        loop {
            let delivery = tokio::select! {
                () = self.shutdown.cancelled() => break,
                delivery = self.consumer.recv() => match delivery {
                    Ok(delivery) => delivery,
                    // Broker closed and the queue is drained.
                    Err(_) => break,
                },
            };
            self.handle(delivery).await;
        }
        debug!(worker = self.worker_id, "fan-out worker stopped");
    }

    async fn handle(&self, delivery: Delivery) {
        self.metrics.received.fetch_add(1, Relaxed);

        let message: FanoutMessage = match serde_json::from_slice(delivery.payload()) {
            Ok(message) => message,
            Err(err) => {
                self.metrics.poison_messages.fetch_add(1, Relaxed);
                warn!(
                    worker = self.worker_id,
                    %err,
                    "dropping fan-out message that does not decode"
                );
                delivery.ack();
                return;
            }
        };

        if message.notification_send_ts > 0 {
            let delay = (WallClock.unix_millis() - message.notification_send_ts).max(0);
            self.metrics.queue_delay_ms_total.fetch_add(delay as u64, Relaxed);
        }

        match self.apply(&message).await {
            Ok(Some(written)) => {
                self.metrics.timelines_updated.fetch_add(written as u64, Relaxed);
                delivery.ack();
            }
            Ok(None) => {
                self.metrics.inconsistencies.fetch_add(1, Relaxed);
                warn!(
                    worker = self.worker_id,
                    req_id = message.req_id,
                    post_id = message.post_id,
                    "fan-out message references a post the store does not have"
                );
                delivery.ack();
            }
            Err(err) => {
                self.metrics.requeued.fetch_add(1, Relaxed);
                warn!(
                    worker = self.worker_id,
                    req_id = message.req_id,
                    attempts = delivery.attempts(),
                    %err,
                    "home timeline write failed, returning message to the queue"
                );
                delivery.nack();
            }
        }
    }

    /// Writes the post onto every recipient timeline. `Ok(None)` means the
    /// post is not in the store, which the caller treats as a logged
    /// inconsistency rather than a retriable failure.
    async fn apply(&self, message: &FanoutMessage) -> Result<Option<usize>> {
        if self.posts.read_post(message.post_id).await?.is_none() {
            return Ok(None);
        }

        let mut recipients: HashSet<i64> = self
            .graph
            .followers(message.user_id)
            .await?
            .into_iter()
            .collect();
        recipients.extend(message.user_mention_ids.iter().copied());

        let entry = TimelinePost {
            post_id: message.post_id,
            timestamp: message.timestamp,
        };
        let entries: Vec<(i64, TimelinePost)> = recipients
            .into_iter()
            .map(|user_id| (user_id, entry))
            .collect();
        if entries.is_empty() {
            return Ok(Some(0));
        }
        self.timelines.insert_posts(&entries).await?;
        Ok(Some(entries.len()))
    }
}
