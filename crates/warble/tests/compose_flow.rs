use std::{sync::Arc, time::Duration};
use warble::{
    Broker, BrokerConfig, ChannelPool, ComponentField, ComponentStore, ComposeConfig, ComposePost,
    Creator, Error, InMemoryComponentStore, InMemoryPostStore, InMemoryTimelines, Media, PostStore,
    PostType, Url, UserMention, WallClock,
};

type Compose = ComposePost<InMemoryComponentStore, InMemoryPostStore, InMemoryTimelines, WallClock>;

struct TestBed {
    broker: Broker,
    pool: ChannelPool,
    components: Arc<InMemoryComponentStore>,
    posts: Arc<InMemoryPostStore>,
    user_timelines: Arc<InMemoryTimelines>,
    compose: Arc<Compose>,
}

fn test_bed() -> TestBed {
    let broker = Broker::new(BrokerConfig::default());
    let pool = ChannelPool::new(broker.connect(), 8);
    let components = Arc::new(InMemoryComponentStore::default());
    let posts = Arc::new(InMemoryPostStore::default());
    let user_timelines = Arc::new(InMemoryTimelines::default());
    let compose = Arc::new(ComposePost::new(
        Arc::clone(&components),
        Arc::clone(&posts),
        Arc::clone(&user_timelines),
        pool.clone(),
        WallClock,
        ComposeConfig::default(),
    ));
    TestBed {
        broker,
        pool,
        components,
        posts,
        user_timelines,
        compose,
    }
}

fn creator() -> Creator {
    Creator {
        user_id: 1,
        username: "alice".to_owned(),
    }
}

fn media() -> Vec<Media> {
    vec![Media {
        media_id: 9,
        media_type: "png".to_owned(),
    }]
}

fn urls() -> Vec<Url> {
    vec![Url {
        expanded_url: "https://example.com/a".to_owned(),
        shortened_url: "https://wrbl.ly/a".to_owned(),
    }]
}

fn mentions() -> Vec<UserMention> {
    vec![UserMention {
        user_id: 4,
        username: "dana".to_owned(),
    }]
}

async fn upload_nth(compose: &Compose, req_id: i64, n: usize) -> warble::Result<()> {
    match n {
        0 => compose.upload_creator(req_id, &creator()).await,
        1 => compose.upload_text(req_id, "hello world").await,
        2 => compose.upload_media(req_id, &media()).await,
        3 => compose.upload_urls(req_id, &urls()).await,
        4 => compose.upload_user_mentions(req_id, &mentions()).await,
        _ => compose.upload_unique_id(req_id, 1000 + req_id, PostType::Post).await,
    }
}

#[tokio::test]
async fn six_uploads_assemble_a_post_in_any_order() {
    let bed = test_bed();

    for rotation in 0..6_usize {
        let req_id = rotation as i64 + 1;
        for step in 0..6 {
            upload_nth(&bed.compose, req_id, (rotation + step) % 6)
                .await
                .unwrap();
        }

        let post = bed
            .posts
            .read_post(1000 + req_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no post for rotation {rotation}"));
        assert_eq!(post.req_id, req_id);
        assert_eq!(post.creator, creator());
        assert_eq!(post.text, "hello world");
        assert_eq!(post.media, media());
        assert_eq!(post.urls, urls());
        assert_eq!(post.user_mentions, mentions());
        assert_eq!(post.post_type, PostType::Post);
        assert!(post.timestamp > 0);
    }

    assert_eq!(bed.posts.len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_finalize_exactly_once() {
    let bed = test_bed();

    let mut tasks = Vec::new();
    for req_id in 1..=20_i64 {
        for n in 0..6 {
            let compose = Arc::clone(&bed.compose);
            tasks.push(tokio::spawn(
                async move { upload_nth(&compose, req_id, n).await },
            ));
        }
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(bed.posts.len(), 20);
    for req_id in 1..=20_i64 {
        let post = bed.posts.read_post(1000 + req_id).await.unwrap().unwrap();
        assert_eq!(post.req_id, req_id);
        // Exactly one author-timeline entry per post.
        let author_posts = bed.user_timelines.posts_for(1);
        assert_eq!(
            author_posts
                .iter()
                .filter(|p| p.post_id == 1000 + req_id)
                .count(),
            1
        );
    }
}

#[tokio::test(start_paused = true)]
async fn partial_uploads_age_out_without_finalizing() {
    let bed = test_bed();

    upload_nth(&bed.compose, 5, 0).await.unwrap();
    upload_nth(&bed.compose, 5, 1).await.unwrap();
    upload_nth(&bed.compose, 5, 2).await.unwrap();

    tokio::time::advance(Duration::from_secs(13)).await;
    assert_eq!(
        bed.components
            .read_component(5, ComponentField::Text)
            .await
            .unwrap(),
        None
    );

    // Late arrivals land in a fresh buffer and do not finalize.
    upload_nth(&bed.compose, 5, 3).await.unwrap();
    upload_nth(&bed.compose, 5, 4).await.unwrap();
    upload_nth(&bed.compose, 5, 5).await.unwrap();

    assert!(bed.posts.is_empty());
}

#[tokio::test]
async fn composed_post_names_its_creator_and_lands_on_their_timeline() {
    let bed = test_bed();
    let req_id = 7;

    bed.compose.upload_creator(req_id, &creator()).await.unwrap();
    bed.compose.upload_text(req_id, "hi").await.unwrap();
    bed.compose.upload_media(req_id, &[]).await.unwrap();
    bed.compose.upload_urls(req_id, &[]).await.unwrap();
    bed.compose.upload_user_mentions(req_id, &[]).await.unwrap();
    bed.compose
        .upload_unique_id(req_id, 42, PostType::Post)
        .await
        .unwrap();

    let post = bed.posts.read_post(42).await.unwrap().unwrap();
    assert_eq!(post.post_id, 42);
    assert_eq!(post.req_id, req_id);
    assert_eq!(post.creator, creator());
    assert_eq!(post.text, "hi");
    assert!(post.media.is_empty());
    assert!(post.urls.is_empty());
    assert!(post.user_mentions.is_empty());
    assert_eq!(post.post_type, PostType::Post);

    let author_timeline = bed.user_timelines.posts_for(1);
    assert_eq!(author_timeline.len(), 1);
    assert_eq!(author_timeline[0].post_id, 42);
    assert_eq!(author_timeline[0].timestamp, post.timestamp);
}

#[tokio::test]
async fn duplicate_upload_spends_an_arrival_and_breaks_finalization() {
    let bed = test_bed();
    let req_id = 11;

    // The creator arrives twice; the unique id never does. The sixth call
    // still trips finalization, which then cannot find the post id.
    bed.compose.upload_creator(req_id, &creator()).await.unwrap();
    bed.compose.upload_creator(req_id, &creator()).await.unwrap();
    bed.compose.upload_text(req_id, "hi").await.unwrap();
    bed.compose.upload_media(req_id, &[]).await.unwrap();
    bed.compose.upload_urls(req_id, &[]).await.unwrap();
    let err = bed
        .compose
        .upload_user_mentions(req_id, &[])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::MissingComponent {
            req_id: 11,
            field: ComponentField::PostId,
        }
    ));
    assert!(bed.posts.is_empty());
    assert!(bed.user_timelines.posts_for(1).is_empty());
}

#[tokio::test]
async fn finalization_errors_surface_without_rollback() {
    let bed = test_bed();
    let req_id = 13;

    // With the broker gone, finalization stores the post, then fails to
    // publish. The error reaches the caller and the stored post stays.
    bed.broker.close();

    bed.compose.upload_creator(req_id, &creator()).await.unwrap();
    bed.compose.upload_text(req_id, "hi").await.unwrap();
    bed.compose.upload_media(req_id, &[]).await.unwrap();
    bed.compose.upload_urls(req_id, &[]).await.unwrap();
    bed.compose.upload_user_mentions(req_id, &[]).await.unwrap();
    let err = bed
        .compose
        .upload_unique_id(req_id, 99, PostType::Post)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::BrokerClosed));
    assert!(bed.posts.read_post(99).await.unwrap().is_some());
    // The author-timeline step never ran.
    assert!(bed.user_timelines.posts_for(1).is_empty());
}

#[tokio::test]
async fn repeated_composition_reuses_one_channel() {
    let bed = test_bed();

    for req_id in 1..=10_i64 {
        for n in 0..6 {
            upload_nth(&bed.compose, req_id, n).await.unwrap();
        }
    }

    assert_eq!(bed.broker.open_channels(), 1);
    assert_eq!(bed.pool.live(), 1);
    assert_eq!(bed.pool.idle_len(), 1);
}
