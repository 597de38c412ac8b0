//! Storage seams for the compose write path.
//!
//! Each trait covers one backing service of the original deployment: the
//! component buffer (memcached), the post archive (MongoDB), the social
//! graph, the author's own timeline, and the per-follower home timelines
//! (Redis sorted sets). The in-memory implementations in this module back
//! the tests and the single-process server; swapping in networked ones is
//! a matter of implementing the trait.

use crate::{
    error::Result,
    model::{ComponentField, Post, TimelinePost},
};
use core::future::Future;
use std::time::Duration;

mod memory;

pub use memory::{
    InMemoryComponentStore, InMemoryPostStore, InMemorySocialGraph, InMemoryTimelines,
};

/// The ephemeral buffer where a post's components meet.
pub trait ComponentStore: Send + Sync + 'static {
    /// Writes `fields` into the buffer for `req_id`, counts the call as one
    /// arrival regardless of how many fields it carries, and refreshes the
    /// buffer's TTL. Returns the arrival count after this call.
    fn upload_component(
        &self,
        req_id: i64,
        fields: Vec<(ComponentField, String)>,
        ttl: Duration,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Reads one buffered field, or `None` if it was never written or the
    /// buffer expired.
    fn read_component(
        &self,
        req_id: i64,
        field: ComponentField,
    ) -> impl Future<Output = Result<Option<String>>> + Send;
}

/// Durable storage for assembled posts.
pub trait PostStore: Send + Sync + 'static {
    fn store_post(&self, post: Post) -> impl Future<Output = Result<()>> + Send;

    fn read_post(&self, post_id: i64) -> impl Future<Output = Result<Option<Post>>> + Send;
}

/// Read side of the social graph.
pub trait SocialGraphStore: Send + Sync + 'static {
    /// User ids following `user_id`. Unknown users simply have none.
    fn followers(&self, user_id: i64) -> impl Future<Output = Result<Vec<i64>>> + Send;
}

/// The author's own timeline, written synchronously at compose time.
pub trait UserTimelineStore: Send + Sync + 'static {
    fn write_user_timeline(
        &self,
        req_id: i64,
        post_id: i64,
        user_id: i64,
        timestamp: i64,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Followers' home timelines, written by the fan-out workers.
pub trait HomeTimelineStore: Send + Sync + 'static {
    /// Adds each `(user_id, post)` entry to that user's timeline unless a
    /// post with the same id is already there. One call covers every
    /// recipient of a message, so a backend can batch it.
    fn insert_posts(
        &self,
        entries: &[(i64, TimelinePost)],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Reads a rank range of the timeline, newest first. `start` and
    /// `stop` are inclusive indexes into the sorted timeline; negative
    /// values count from its end, so `(0, -1)` reads all of it.
    fn read_timeline(
        &self,
        user_id: i64,
        start: i64,
        stop: i64,
    ) -> impl Future<Output = Result<Vec<TimelinePost>>> + Send;
}
