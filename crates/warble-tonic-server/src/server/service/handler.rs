//! gRPC service implementation for the compose-post write path.
//!
//! This module defines [`ComposeService`], the concrete implementation of
//! the `ComposePost` and `UniqueId` services from the protobuf schema. Six
//! component uploads under a shared request id assemble one post; whichever
//! upload completes the set also runs finalization, so any of these
//! handlers may end up storing the post and publishing its fan-out.
//!
//! ## Responsibilities
//!
//! - Own the in-process broker, channel pool, and in-memory stores.
//! - Validate incoming uploads and forward them into the compose aggregator.
//! - Assign post ids on request and feed them back in as uploads.
//! - Track in-flight requests and drain them on graceful shutdown.

use crate::server::{
    config::ServerConfig,
    service::config::{Clock, Compose, Generator},
    telemetry::{
        decrement_uploads_inflight, increment_ids_assigned, increment_upload_errors,
        increment_uploads, increment_uploads_inflight, record_upload_duration,
    },
};
use anyhow::Context;
use core::sync::atomic::{AtomicBool, Ordering};
use portable_atomic::AtomicU64;
use serde::Deserialize;
use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::Mutex,
    time::{sleep, timeout},
};
use tonic::{Request, Response, Status};
use tracing::{info, warn};
use warble_tonic_core::{
    Error,
    proto::{
        self, AssignUniqueIdReply, AssignUniqueIdRequest, UploadCreatorRequest,
        UploadMediaRequest, UploadReply, UploadTextRequest, UploadUniqueIdRequest,
        UploadUrlsRequest, UploadUserMentionsRequest, compose_post_server::ComposePost,
        unique_id_server::UniqueId,
    },
    warble::{
        Broker, BrokerConfig, ChannelPool, ComposeConfig, Creator, Error as ComposeError,
        FanoutConfig, FanoutPipeline, InMemoryComponentStore, InMemoryPostStore,
        InMemorySocialGraph, InMemoryTimelines, Media, Url, UserMention,
    },
};

/// gRPC front end for the compose-post write path.
///
/// Implements both services defined in the protobuf schema: `ComposePost`,
/// which buffers component uploads until a post can be finalized, and
/// `UniqueId`, which assigns post ids and forwards them as the final
/// component. One instance owns the in-process broker, the channel pool,
/// and the fan-out pipeline consuming this region's queue.
///
/// Cloning is cheap; every clone shares the same underlying state.
#[derive(Clone)]
pub struct ComposeService {
    config: ServerConfig,
    app: Arc<ComposeApp>,
}

struct ComposeApp {
    compose: Compose,
    generator: Generator,
    broker: Broker,
    pool: ChannelPool,
    pipeline: Mutex<Option<FanoutPipeline>>,
    accepting: AtomicBool,
    inflight: AtomicU64,
}

impl ComposeService {
    /// Builds the full write path and starts the fan-out pipeline.
    ///
    /// The broker, channel pool, and stores are created fresh; the social
    /// graph is seeded from `SEED_GRAPH` when configured. Fan-out workers
    /// are consuming this region's queue by the time this returns.
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let broker = Broker::new(BrokerConfig {
            queue_capacity: config.queue_capacity,
            max_redeliveries: config.max_redeliveries,
        });
        let pool = ChannelPool::new(broker.connect(), config.pool_max_size);

        let components = Arc::new(InMemoryComponentStore::default());
        let posts = Arc::new(InMemoryPostStore::default());
        let graph = Arc::new(InMemorySocialGraph::default());
        // Author timelines and follower home timelines are distinct stores;
        // a post reaches the author's own via the compose path only.
        let user_timelines = Arc::new(InMemoryTimelines::default());
        let home_timelines = Arc::new(InMemoryTimelines::default());

        if let Some(path) = &config.seed_graph {
            let seeded = seed_social_graph(&graph, path)?;
            info!(records = seeded, path = %path.display(), "seeded social graph");
        }

        let generator = Generator::new(&config.machine_id, Clock::default())
            .context("building the post-id generator")?;

        let compose = Compose::new(
            Arc::clone(&components),
            Arc::clone(&posts),
            user_timelines,
            pool.clone(),
            Clock::default(),
            ComposeConfig {
                regions: config.regions.clone(),
                component_ttl: config.component_ttl,
                pool_wait: config.pool_wait,
            },
        );

        let pipeline = FanoutPipeline::spawn(
            pool.clone(),
            posts,
            graph,
            home_timelines,
            FanoutConfig {
                region: config.region.clone(),
                num_workers: config.num_workers,
                pool_wait: config.pool_wait,
                shutdown_timeout: config.shutdown_timeout,
            },
        )
        .await
        .context("starting the fan-out pipeline")?;

        Ok(Self {
            config,
            app: Arc::new(ComposeApp {
                compose,
                generator,
                broker,
                pool,
                pipeline: Mutex::new(Some(pipeline)),
                accepting: AtomicBool::new(true),
                inflight: AtomicU64::new(0),
            }),
        })
    }

    /// Initiates a graceful shutdown.
    ///
    /// New uploads are refused immediately. In-flight uploads get up to the
    /// configured deadline to drain, then the fan-out pipeline stops, the
    /// channel pool closes, and the broker shuts down. A second call finds
    /// the pipeline already taken and is a no-op.
    pub async fn shutdown(&self) {
        self.app.accepting.store(false, Ordering::SeqCst);

        info!(
            inflight = self.app.inflight.load(Ordering::Relaxed),
            "refusing new uploads, draining in-flight requests"
        );
        let drained = timeout(self.config.shutdown_timeout, async {
            while self.app.inflight.load(Ordering::Relaxed) > 0 {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                inflight = self.app.inflight.load(Ordering::Relaxed),
                "graceful drain timed out"
            );
        }

        if let Some(pipeline) = self.app.pipeline.lock().await.take() {
            pipeline.shutdown().await;
        }
        self.app.pool.close();
        self.app.broker.close();
        info!("compose service shut down");
    }

    /// Admits one upload: refused outright once shutdown has begun.
    fn begin_upload(&self) -> Result<InflightGuard<'_>, Status> {
        if !self.app.accepting.load(Ordering::SeqCst) {
            increment_upload_errors();
            return Err(Error::ServiceShutdown.into());
        }
        increment_uploads();
        Ok(InflightGuard::enter(&self.app.inflight))
    }

    fn failed(err: ComposeError) -> Status {
        increment_upload_errors();
        Error::from(err).into()
    }

    fn invalid(reason: &str) -> Status {
        increment_upload_errors();
        Error::InvalidRequest {
            reason: reason.to_owned(),
        }
        .into()
    }
}

#[tonic::async_trait]
impl ComposePost for ComposeService {
    /// Buffers the creator record for a request.
    #[tracing::instrument(skip_all, fields(req_id = req.get_ref().req_id))]
    async fn upload_creator(
        &self,
        req: Request<UploadCreatorRequest>,
    ) -> Result<Response<UploadReply>, Status> {
        let _guard = self.begin_upload()?;
        let started = Instant::now();
        let msg = req.into_inner();
        let creator: Creator = msg
            .creator
            .ok_or_else(|| Self::invalid("a creator record is required"))?
            .into();
        self.app
            .compose
            .upload_creator(msg.req_id, &creator)
            .await
            .map_err(Self::failed)?;
        record_upload_duration(started.elapsed().as_millis() as f64);
        Ok(Response::new(UploadReply {}))
    }

    /// Buffers the post body for a request.
    #[tracing::instrument(skip_all, fields(req_id = req.get_ref().req_id))]
    async fn upload_text(
        &self,
        req: Request<UploadTextRequest>,
    ) -> Result<Response<UploadReply>, Status> {
        let _guard = self.begin_upload()?;
        let started = Instant::now();
        let msg = req.into_inner();
        self.app
            .compose
            .upload_text(msg.req_id, &msg.text)
            .await
            .map_err(Self::failed)?;
        record_upload_duration(started.elapsed().as_millis() as f64);
        Ok(Response::new(UploadReply {}))
    }

    /// Buffers media attachments. An empty list is a valid component.
    #[tracing::instrument(skip_all, fields(req_id = req.get_ref().req_id))]
    async fn upload_media(
        &self,
        req: Request<UploadMediaRequest>,
    ) -> Result<Response<UploadReply>, Status> {
        let _guard = self.begin_upload()?;
        let started = Instant::now();
        let msg = req.into_inner();
        let media: Vec<Media> = msg.media.into_iter().map(Into::into).collect();
        self.app
            .compose
            .upload_media(msg.req_id, &media)
            .await
            .map_err(Self::failed)?;
        record_upload_duration(started.elapsed().as_millis() as f64);
        Ok(Response::new(UploadReply {}))
    }

    /// Buffers an externally assigned post id and type.
    ///
    /// The two values land as separate fields but count as one arrival.
    /// Clients calling `AssignUniqueId` on the companion service must not
    /// also call this, or the arrival count runs ahead of the fields.
    #[tracing::instrument(skip_all, fields(req_id = req.get_ref().req_id))]
    async fn upload_unique_id(
        &self,
        req: Request<UploadUniqueIdRequest>,
    ) -> Result<Response<UploadReply>, Status> {
        let _guard = self.begin_upload()?;
        let started = Instant::now();
        let msg = req.into_inner();
        let post_type = proto::PostType::try_from(msg.post_type)
            .map_err(|_| Self::invalid(&format!("unknown post type code {}", msg.post_type)))?;
        self.app
            .compose
            .upload_unique_id(msg.req_id, msg.post_id, post_type.into())
            .await
            .map_err(Self::failed)?;
        record_upload_duration(started.elapsed().as_millis() as f64);
        Ok(Response::new(UploadReply {}))
    }

    /// Buffers shortened-url expansions. An empty list is a valid component.
    #[tracing::instrument(skip_all, fields(req_id = req.get_ref().req_id))]
    async fn upload_urls(
        &self,
        req: Request<UploadUrlsRequest>,
    ) -> Result<Response<UploadReply>, Status> {
        let _guard = self.begin_upload()?;
        let started = Instant::now();
        let msg = req.into_inner();
        let urls: Vec<Url> = msg.urls.into_iter().map(Into::into).collect();
        self.app
            .compose
            .upload_urls(msg.req_id, &urls)
            .await
            .map_err(Self::failed)?;
        record_upload_duration(started.elapsed().as_millis() as f64);
        Ok(Response::new(UploadReply {}))
    }

    /// Buffers mentioned users; they join the post's fan-out recipients.
    #[tracing::instrument(skip_all, fields(req_id = req.get_ref().req_id))]
    async fn upload_user_mentions(
        &self,
        req: Request<UploadUserMentionsRequest>,
    ) -> Result<Response<UploadReply>, Status> {
        let _guard = self.begin_upload()?;
        let started = Instant::now();
        let msg = req.into_inner();
        let user_mentions: Vec<UserMention> =
            msg.user_mentions.into_iter().map(Into::into).collect();
        self.app
            .compose
            .upload_user_mentions(msg.req_id, &user_mentions)
            .await
            .map_err(Self::failed)?;
        record_upload_duration(started.elapsed().as_millis() as f64);
        Ok(Response::new(UploadReply {}))
    }
}

#[tonic::async_trait]
impl UniqueId for ComposeService {
    /// Generates a post id and forwards it into the compose buffer.
    ///
    /// The reply carries the assigned id so the caller can reference the
    /// post before finalization lands. Ids are time-ordered and unique as
    /// long as every instance runs with a distinct machine id.
    #[tracing::instrument(skip_all, fields(req_id = req.get_ref().req_id))]
    async fn assign_unique_id(
        &self,
        req: Request<AssignUniqueIdRequest>,
    ) -> Result<Response<AssignUniqueIdReply>, Status> {
        let _guard = self.begin_upload()?;
        let started = Instant::now();
        let msg = req.into_inner();
        let post_type = proto::PostType::try_from(msg.post_type)
            .map_err(|_| Self::invalid(&format!("unknown post type code {}", msg.post_type)))?;
        let post_id = self.app.generator.generate().map_err(Self::failed)?;
        increment_ids_assigned();
        self.app
            .compose
            .upload_unique_id(msg.req_id, post_id, post_type.into())
            .await
            .map_err(Self::failed)?;
        record_upload_duration(started.elapsed().as_millis() as f64);
        Ok(Response::new(AssignUniqueIdReply { post_id }))
    }
}

/// Tracks one admitted upload; reverses the counters when dropped, error
/// paths included.
struct InflightGuard<'a> {
    inflight: &'a AtomicU64,
}

impl<'a> InflightGuard<'a> {
    fn enter(inflight: &'a AtomicU64) -> Self {
        inflight.fetch_add(1, Ordering::Relaxed);
        increment_uploads_inflight();
        Self { inflight }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        decrement_uploads_inflight();
    }
}

/// One record of the social-graph seed file.
#[derive(Debug, Deserialize)]
struct SeedFollow {
    user_id: i64,
    followers: Vec<i64>,
}

fn seed_social_graph(graph: &InMemorySocialGraph, path: &Path) -> anyhow::Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading social graph seed `{}`", path.display()))?;
    let records: Vec<SeedFollow> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing social graph seed `{}`", path.display()))?;
    let count = records.len();
    for record in records {
        graph.set_followers(record.user_id, record.followers);
    }
    Ok(count)
}
