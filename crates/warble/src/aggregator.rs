use crate::{
    error::{Error, Result},
    model::{ComponentField, Creator, FanoutMessage, Media, Post, PostType, Url, UserMention},
    pool::ChannelPool,
    store::{ComponentStore, PostStore, UserTimelineStore},
    time::TimeSource,
};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Exchange the compose path publishes fan-out messages to.
pub const FANOUT_EXCHANGE: &str = "write-home-timeline";

/// Component uploads a post is assembled from. The unique-id upload
/// carries two fields but still counts as one.
pub const REQUIRED_COMPONENTS: i64 = 6;

/// Routing key for one region's fan-out queue. The queue carrying that
/// region's messages uses the same string as its name.
pub fn fanout_routing_key(region: &str) -> String {
    format!("{FANOUT_EXCHANGE}-{region}")
}

#[derive(Clone, Debug)]
pub struct ComposeConfig {
    /// Regions every composed post is published to, one message each.
    pub regions: Vec<String>,
    /// How long a partially assembled post may sit in the component
    /// buffer. Every upload for the request refreshes it.
    pub component_ttl: Duration,
    /// How long to wait for a pooled channel when publishing.
    pub pool_wait: Duration,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            regions: vec!["local".to_owned()],
            component_ttl: Duration::from_secs(12),
            pool_wait: Duration::from_secs(5),
        }
    }
}

/// Assembles posts out of independently uploaded components.
///
/// Upstream services upload a post's text, creator, media, urls, mentions,
/// and id concurrently under a shared `req_id`. Each upload lands in the
/// [`ComponentStore`] buffer and bumps that request's arrival count; the
/// call that brings the count to [`REQUIRED_COMPONENTS`] finalizes the
/// post: it reads all seven fields back, writes the assembled [`Post`] to
/// the [`PostStore`], publishes one fan-out message per region, and
/// appends the post to the author's own timeline.
///
/// Finalization errors are logged and returned to the caller that
/// triggered them; nothing is rolled back. A request whose uploads stop
/// short of the full set simply ages out of the buffer.
pub struct ComposePost<CS, PS, UT, T> {
    components: Arc<CS>,
    posts: Arc<PS>,
    user_timelines: Arc<UT>,
    pool: ChannelPool,
    time: T,
    config: ComposeConfig,
}

impl<CS, PS, UT, T> ComposePost<CS, PS, UT, T>
where
    CS: ComponentStore,
    PS: PostStore,
    UT: UserTimelineStore,
    T: TimeSource,
{
    pub fn new(
        components: Arc<CS>,
        posts: Arc<PS>,
        user_timelines: Arc<UT>,
        pool: ChannelPool,
        time: T,
        config: ComposeConfig,
    ) -> Self {
        Self {
            components,
            posts,
            user_timelines,
            pool,
            time,
            config,
        }
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    pub async fn upload_text(&self, req_id: i64, text: &str) -> Result<()> {
        self.upload(req_id, vec![(ComponentField::Text, to_json(&text)?)])
            .await
    }

    pub async fn upload_creator(&self, req_id: i64, creator: &Creator) -> Result<()> {
        self.upload(req_id, vec![(ComponentField::Creator, to_json(creator)?)])
            .await
    }

    pub async fn upload_media(&self, req_id: i64, media: &[Media]) -> Result<()> {
        self.upload(req_id, vec![(ComponentField::Media, to_json(&media)?)])
            .await
    }

    pub async fn upload_urls(&self, req_id: i64, urls: &[Url]) -> Result<()> {
        self.upload(req_id, vec![(ComponentField::Urls, to_json(&urls)?)])
            .await
    }

    pub async fn upload_user_mentions(
        &self,
        req_id: i64,
        user_mentions: &[UserMention],
    ) -> Result<()> {
        self.upload(
            req_id,
            vec![(ComponentField::UserMentions, to_json(&user_mentions)?)],
        )
        .await
    }

    /// Uploads the post id and type together. One call, two fields, one
    /// arrival.
    pub async fn upload_unique_id(
        &self,
        req_id: i64,
        post_id: i64,
        post_type: PostType,
    ) -> Result<()> {
        self.upload(
            req_id,
            vec![
                (ComponentField::PostId, to_json(&post_id)?),
                (ComponentField::PostType, to_json(&post_type)?),
            ],
        )
        .await
    }

    async fn upload(&self, req_id: i64, fields: Vec<(ComponentField, String)>) -> Result<()> {
        let arrived = self
            .components
            .upload_component(req_id, fields, self.config.component_ttl)
            .await?;
        debug!(req_id, arrived, "buffered post components");
        // The arrival count only ever grows, so exactly one upload sees it
        // land on the full set and runs finalization.
        if arrived == REQUIRED_COMPONENTS {
            self.finalize(req_id).await?;
        }
        Ok(())
    }

    async fn finalize(&self, req_id: i64) -> Result<()> {
        let (text, creator, media, post_id, post_type, urls, user_mentions) = futures::try_join!(
            self.read_json::<String>(req_id, ComponentField::Text),
            self.read_json::<Creator>(req_id, ComponentField::Creator),
            self.read_json::<Vec<Media>>(req_id, ComponentField::Media),
            self.read_json::<i64>(req_id, ComponentField::PostId),
            self.read_json::<PostType>(req_id, ComponentField::PostType),
            self.read_json::<Vec<Url>>(req_id, ComponentField::Urls),
            self.read_json::<Vec<UserMention>>(req_id, ComponentField::UserMentions),
        )?;

        let timestamp = self.time.unix_millis();
        let post = Post {
            post_id,
            req_id,
            creator: creator.clone(),
            text,
            user_mentions: user_mentions.clone(),
            media,
            urls,
            timestamp,
            post_type,
        };

        self.posts
            .store_post(post)
            .await
            .inspect_err(|err| warn!(req_id, post_id, %err, "storing the post failed"))?;

        self.publish_fanout(req_id, post_id, &creator, &user_mentions, timestamp)
            .await
            .inspect_err(|err| warn!(req_id, post_id, %err, "publishing fan-out failed"))?;

        self.user_timelines
            .write_user_timeline(req_id, post_id, creator.user_id, timestamp)
            .await
            .inspect_err(|err| warn!(req_id, post_id, %err, "author timeline write failed"))?;

        debug!(req_id, post_id, "post composed");
        Ok(())
    }

    async fn read_json<V: DeserializeOwned>(
        &self,
        req_id: i64,
        field: ComponentField,
    ) -> Result<V> {
        let raw = self
            .components
            .read_component(req_id, field)
            .await?
            .ok_or(Error::MissingComponent { req_id, field })?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn publish_fanout(
        &self,
        req_id: i64,
        post_id: i64,
        creator: &Creator,
        user_mentions: &[UserMention],
        timestamp: i64,
    ) -> Result<()> {
        let message = FanoutMessage {
            req_id,
            post_id,
            user_id: creator.user_id,
            timestamp,
            user_mention_ids: user_mentions.iter().map(|m| m.user_id).collect(),
            span_context: current_span_context(),
            notification_send_ts: self.time.unix_millis(),
        };
        let payload = Bytes::from(serde_json::to_vec(&message)?);

        let channel = self.pool.pop(self.config.pool_wait).await?;
        channel.exchange_declare(FANOUT_EXCHANGE)?;
        for region in &self.config.regions {
            channel
                .publish(FANOUT_EXCHANGE, &fanout_routing_key(region), payload.clone())
                .await?;
        }
        Ok(())
    }
}

fn to_json<V: Serialize>(value: &V) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn current_span_context() -> String {
    tracing::Span::current()
        .id()
        .map(|id| id.into_u64().to_string())
        .unwrap_or_default()
}
