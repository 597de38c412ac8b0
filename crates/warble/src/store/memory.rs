use super::{ComponentStore, HomeTimelineStore, PostStore, SocialGraphStore, UserTimelineStore};
use crate::{
    error::Result,
    model::{ComponentField, Post, TimelinePost},
};
use parking_lot::Mutex;
use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

/// Component buffer backed by a hash map, with lazy TTL expiry: expired
/// records are ignored on read and recycled on the next write, the way a
/// cache with per-key TTLs behaves.
#[derive(Default)]
pub struct InMemoryComponentStore {
    records: Mutex<HashMap<i64, ComponentRecord>>,
}

struct ComponentRecord {
    fields: HashMap<ComponentField, String>,
    arrived_count: i64,
    expires_at: Instant,
}

impl ComponentStore for InMemoryComponentStore {
    async fn upload_component(
        &self,
        req_id: i64,
        fields: Vec<(ComponentField, String)>,
        ttl: Duration,
    ) -> Result<i64> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let record = records.entry(req_id).or_insert_with(|| ComponentRecord {
            fields: HashMap::new(),
            arrived_count: 0,
            expires_at: now + ttl,
        });
        if record.expires_at <= now {
            record.fields.clear();
            record.arrived_count = 0;
        }
        for (field, value) in fields {
            record.fields.insert(field, value);
        }
        record.arrived_count += 1;
        record.expires_at = now + ttl;
        Ok(record.arrived_count)
    }

    async fn read_component(&self, req_id: i64, field: ComponentField) -> Result<Option<String>> {
        let now = Instant::now();
        let records = self.records.lock();
        Ok(records
            .get(&req_id)
            .filter(|record| record.expires_at > now)
            .and_then(|record| record.fields.get(&field).cloned()))
    }
}

#[derive(Default)]
pub struct InMemoryPostStore {
    posts: Mutex<HashMap<i64, Post>>,
}

impl InMemoryPostStore {
    pub fn len(&self) -> usize {
        self.posts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.lock().is_empty()
    }
}

impl PostStore for InMemoryPostStore {
    async fn store_post(&self, post: Post) -> Result<()> {
        self.posts.lock().insert(post.post_id, post);
        Ok(())
    }

    async fn read_post(&self, post_id: i64) -> Result<Option<Post>> {
        Ok(self.posts.lock().get(&post_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemorySocialGraph {
    followers: Mutex<HashMap<i64, Vec<i64>>>,
}

impl InMemorySocialGraph {
    pub fn set_followers(&self, user_id: i64, followers: Vec<i64>) {
        self.followers.lock().insert(user_id, followers);
    }

    pub fn add_follower(&self, user_id: i64, follower_id: i64) {
        let mut graph = self.followers.lock();
        let followers = graph.entry(user_id).or_default();
        if !followers.contains(&follower_id) {
            followers.push(follower_id);
        }
    }
}

impl SocialGraphStore for InMemorySocialGraph {
    async fn followers(&self, user_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .followers
            .lock()
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Per-user timelines as vectors of `(post_id, timestamp)`, kept free of
/// duplicate post ids so a redelivered fan-out message is harmless. Serves
/// as both the home- and user-timeline store; the server wires up a
/// separate instance for each role.
#[derive(Default)]
pub struct InMemoryTimelines {
    timelines: Mutex<HashMap<i64, Vec<TimelinePost>>>,
}

impl InMemoryTimelines {
    /// All of `user_id`'s timeline, newest first. Test and bench helper.
    pub fn posts_for(&self, user_id: i64) -> Vec<TimelinePost> {
        let mut posts = self
            .timelines
            .lock()
            .get(&user_id)
            .cloned()
            .unwrap_or_default();
        sort_newest_first(&mut posts);
        posts
    }

    fn insert_if_absent(timeline: &mut Vec<TimelinePost>, post: TimelinePost) {
        if !timeline.iter().any(|existing| existing.post_id == post.post_id) {
            timeline.push(post);
        }
    }
}

fn sort_newest_first(posts: &mut [TimelinePost]) {
    posts.sort_unstable_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then(b.post_id.cmp(&a.post_id))
    });
}

impl HomeTimelineStore for InMemoryTimelines {
    async fn insert_posts(&self, entries: &[(i64, TimelinePost)]) -> Result<()> {
        let mut timelines = self.timelines.lock();
        for (user_id, post) in entries {
            Self::insert_if_absent(timelines.entry(*user_id).or_default(), *post);
        }
        Ok(())
    }

    async fn read_timeline(&self, user_id: i64, start: i64, stop: i64) -> Result<Vec<TimelinePost>> {
        let mut posts = self
            .timelines
            .lock()
            .get(&user_id)
            .cloned()
            .unwrap_or_default();
        sort_newest_first(&mut posts);

        let len = posts.len() as i64;
        let resolve = |index: i64| if index < 0 { len + index } else { index };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(posts[start as usize..=stop as usize].to_vec())
    }
}

impl UserTimelineStore for InMemoryTimelines {
    async fn write_user_timeline(
        &self,
        _req_id: i64,
        post_id: i64,
        user_id: i64,
        timestamp: i64,
    ) -> Result<()> {
        let mut timelines = self.timelines.lock();
        Self::insert_if_absent(
            timelines.entry(user_id).or_default(),
            TimelinePost { post_id, timestamp },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(12);

    #[tokio::test]
    async fn one_call_counts_once_no_matter_how_many_fields() {
        let store = InMemoryComponentStore::default();

        let count = store
            .upload_component(
                1,
                vec![
                    (ComponentField::PostId, "42".to_owned()),
                    (ComponentField::PostType, "0".to_owned()),
                ],
                TTL,
            )
            .await
            .unwrap();
        assert_eq!(count, 1);

        let count = store
            .upload_component(1, vec![(ComponentField::Text, "\"hi\"".to_owned())], TTL)
            .await
            .unwrap();
        assert_eq!(count, 2);

        assert_eq!(
            store.read_component(1, ComponentField::PostId).await.unwrap(),
            Some("42".to_owned())
        );
        assert_eq!(
            store.read_component(1, ComponentField::Text).await.unwrap(),
            Some("\"hi\"".to_owned())
        );
        assert_eq!(
            store.read_component(1, ComponentField::Media).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn duplicate_field_still_counts_as_an_arrival() {
        let store = InMemoryComponentStore::default();

        store
            .upload_component(1, vec![(ComponentField::Text, "\"a\"".to_owned())], TTL)
            .await
            .unwrap();
        let count = store
            .upload_component(1, vec![(ComponentField::Text, "\"b\"".to_owned())], TTL)
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            store.read_component(1, ComponentField::Text).await.unwrap(),
            Some("\"b\"".to_owned())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_expires_and_recycles() {
        let store = InMemoryComponentStore::default();

        store
            .upload_component(1, vec![(ComponentField::Text, "\"hi\"".to_owned())], TTL)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(13)).await;
        assert_eq!(
            store.read_component(1, ComponentField::Text).await.unwrap(),
            None
        );

        // A write after expiry starts a fresh buffer.
        let count = store
            .upload_component(1, vec![(ComponentField::Media, "[]".to_owned())], TTL)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            store.read_component(1, ComponentField::Text).await.unwrap(),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn every_write_refreshes_the_ttl() {
        let store = InMemoryComponentStore::default();

        store
            .upload_component(1, vec![(ComponentField::Text, "\"hi\"".to_owned())], TTL)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        store
            .upload_component(1, vec![(ComponentField::Media, "[]".to_owned())], TTL)
            .await
            .unwrap();

        // 16s after the first write, 8s after the refresh.
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(
            store.read_component(1, ComponentField::Text).await.unwrap(),
            Some("\"hi\"".to_owned())
        );

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(
            store.read_component(1, ComponentField::Text).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn timelines_ignore_duplicate_post_ids() {
        let timelines = InMemoryTimelines::default();

        timelines
            .insert_posts(&[
                (2, TimelinePost { post_id: 10, timestamp: 100 }),
                (3, TimelinePost { post_id: 10, timestamp: 100 }),
            ])
            .await
            .unwrap();
        timelines
            .insert_posts(&[(2, TimelinePost { post_id: 10, timestamp: 100 })])
            .await
            .unwrap();

        assert_eq!(timelines.posts_for(2).len(), 1);
        assert_eq!(timelines.posts_for(3).len(), 1);
    }

    #[tokio::test]
    async fn read_timeline_ranges_like_a_sorted_set() {
        let timelines = InMemoryTimelines::default();
        for (post_id, timestamp) in [(10, 100), (11, 300), (12, 200)] {
            timelines
                .insert_posts(&[(7, TimelinePost { post_id, timestamp })])
                .await
                .unwrap();
        }

        let all = timelines.read_timeline(7, 0, -1).await.unwrap();
        let ids: Vec<i64> = all.iter().map(|p| p.post_id).collect();
        assert_eq!(ids, [11, 12, 10], "newest first");

        let newest_two = timelines.read_timeline(7, 0, 1).await.unwrap();
        assert_eq!(newest_two.len(), 2);
        assert_eq!(newest_two[0].post_id, 11);

        assert!(timelines.read_timeline(7, 5, 9).await.unwrap().is_empty());
        assert!(timelines.read_timeline(999, 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_timeline_writes_are_idempotent() {
        let timelines = InMemoryTimelines::default();

        timelines.write_user_timeline(1, 42, 5, 100).await.unwrap();
        timelines.write_user_timeline(1, 42, 5, 100).await.unwrap();

        assert_eq!(timelines.posts_for(5).len(), 1);
    }
}
