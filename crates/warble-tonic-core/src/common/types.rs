//! Conversions between wire messages and the core `warble` model.
//!
//! The protobuf messages in [`crate::proto`] and the serde models in
//! [`warble`] describe the same records. Handlers convert at the boundary
//! with `From`/`Into` so the core crate never sees a generated type; the
//! match statements below are the single place the two vocabularies meet.

use crate::proto;
use warble::{Creator, Media, PostType, Url, UserMention};

impl From<proto::Creator> for Creator {
    fn from(value: proto::Creator) -> Self {
        Self {
            user_id: value.user_id,
            username: value.username,
        }
    }
}

impl From<Creator> for proto::Creator {
    fn from(value: Creator) -> Self {
        Self {
            user_id: value.user_id,
            username: value.username,
        }
    }
}

impl From<proto::Media> for Media {
    fn from(value: proto::Media) -> Self {
        Self {
            media_id: value.media_id,
            media_type: value.media_type,
        }
    }
}

impl From<Media> for proto::Media {
    fn from(value: Media) -> Self {
        Self {
            media_id: value.media_id,
            media_type: value.media_type,
        }
    }
}

impl From<proto::Url> for Url {
    fn from(value: proto::Url) -> Self {
        Self {
            expanded_url: value.expanded_url,
            shortened_url: value.shortened_url,
        }
    }
}

impl From<Url> for proto::Url {
    fn from(value: Url) -> Self {
        Self {
            expanded_url: value.expanded_url,
            shortened_url: value.shortened_url,
        }
    }
}

impl From<proto::UserMention> for UserMention {
    fn from(value: proto::UserMention) -> Self {
        Self {
            user_id: value.user_id,
            username: value.username,
        }
    }
}

impl From<UserMention> for proto::UserMention {
    fn from(value: UserMention) -> Self {
        Self {
            user_id: value.user_id,
            username: value.username,
        }
    }
}

impl From<proto::PostType> for PostType {
    fn from(value: proto::PostType) -> Self {
        match value {
            proto::PostType::Post => PostType::Post,
            proto::PostType::Repost => PostType::Repost,
            proto::PostType::Reply => PostType::Reply,
            proto::PostType::Dm => PostType::Dm,
        }
    }
}

impl From<PostType> for proto::PostType {
    fn from(value: PostType) -> Self {
        match value {
            PostType::Post => proto::PostType::Post,
            PostType::Repost => proto::PostType::Repost,
            PostType::Reply => proto::PostType::Reply,
            PostType::Dm => proto::PostType::Dm,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_types_agree_across_the_wire() {
        for (wire, model) in [
            (proto::PostType::Post, PostType::Post),
            (proto::PostType::Repost, PostType::Repost),
            (proto::PostType::Reply, PostType::Reply),
            (proto::PostType::Dm, PostType::Dm),
        ] {
            assert_eq!(PostType::from(wire), model);
            assert_eq!(proto::PostType::from(model), wire);
            // The integer codes match too, so serde and protobuf encodings
            // of the same post agree.
            assert_eq!(wire as i32, i32::from(model));
        }
    }

    #[test]
    fn mention_records_convert_both_ways() {
        let wire = proto::UserMention {
            user_id: 4,
            username: "dana".to_owned(),
        };
        let model = UserMention::from(wire.clone());
        assert_eq!(model.user_id, 4);
        assert_eq!(model.username, "dana");
        assert_eq!(proto::UserMention::from(model), wire);
    }
}
