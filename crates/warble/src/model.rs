//! Data model for the compose-post write path.
//!
//! Component payloads are stored as JSON strings in the aggregation record,
//! so every type here round-trips through `serde_json`. Field names follow
//! the wire schema consumed by the fan-out pipeline.

use core::fmt;
use serde::{Deserialize, Serialize};

/// The author identity attached to a post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    pub user_id: i64,
    pub username: String,
}

/// A media attachment reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub media_id: i64,
    pub media_type: String,
}

/// A shortened link and its expansion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Url {
    pub expanded_url: String,
    pub shortened_url: String,
}

/// A user referenced in the post body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMention {
    pub user_id: i64,
    pub username: String,
}

/// Raised when decoding an out-of-range post type code.
#[derive(Clone, Debug, thiserror::Error)]
#[error("unknown post type code {0}")]
pub struct UnknownPostType(pub i32);

/// Post category, serialized as its integer code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum PostType {
    Post,
    Repost,
    Reply,
    Dm,
}

impl From<PostType> for i32 {
    fn from(value: PostType) -> Self {
        match value {
            PostType::Post => 0,
            PostType::Repost => 1,
            PostType::Reply => 2,
            PostType::Dm => 3,
        }
    }
}

impl TryFrom<i32> for PostType {
    type Error = UnknownPostType;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Post),
            1 => Ok(Self::Repost),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Dm),
            other => Err(UnknownPostType(other)),
        }
    }
}

/// A finalized post. Assembled exactly once by the aggregator and immutable
/// from then on; the fan-out pipeline only ever reads it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub post_id: i64,
    pub req_id: i64,
    pub creator: Creator,
    pub text: String,
    pub user_mentions: Vec<UserMention>,
    pub media: Vec<Media>,
    pub urls: Vec<Url>,
    pub timestamp: i64,
    pub post_type: PostType,
}

/// The broker payload produced once per finalize and consumed by fan-out
/// workers. Delivery is not exactly-once, so everything downstream of this
/// message must be idempotent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutMessage {
    pub req_id: i64,
    pub post_id: i64,
    pub user_id: i64,
    pub timestamp: i64,
    pub user_mention_ids: Vec<i64>,
    #[serde(default)]
    pub span_context: String,
    #[serde(default)]
    pub notification_send_ts: i64,
}

/// Membership entry in a per-user timeline: the post and its sort score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelinePost {
    pub post_id: i64,
    pub timestamp: i64,
}

/// The named slots of an aggregation record.
///
/// Six of these arrive as independent uploads; `PostId` and `PostType` share
/// one upload and therefore one arrival increment, which is why a record
/// holds seven fields but completes at a count of six.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentField {
    Text,
    Creator,
    Media,
    PostId,
    PostType,
    Urls,
    UserMentions,
}

impl ComponentField {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Creator => "creator",
            Self::Media => "media",
            Self::PostId => "post_id",
            Self::PostType => "post_type",
            Self::Urls => "urls",
            Self::UserMentions => "user_mentions",
        }
    }
}

impl fmt::Display for ComponentField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
