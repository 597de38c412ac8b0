use warble_tonic_core::warble::{
    ComposePost, InMemoryComponentStore, InMemoryPostStore, InMemoryTimelines, PostIdGenerator,
    WallClock,
};

/// Clock shared by the id generator and the compose path.
///
/// This controls the timestamps embedded into post ids and stamped onto
/// finalized posts.
pub type Clock = WallClock;

/// Post-id generator backing the unique-id service.
///
/// One instance serves the whole process, parameterized with the configured
/// machine id.
pub type Generator = PostIdGenerator<Clock>;

/// Compose aggregator specialized to this server's in-memory stores.
pub type Compose =
    ComposePost<InMemoryComponentStore, InMemoryPostStore, InMemoryTimelines, Clock>;
