use crate::model::ComponentField;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the compose/fan-out core.
///
/// Store errors are transient from the core's point of view: they are
/// surfaced to the immediate caller and never retried internally. Clock and
/// machine-id errors are fatal to the single call that produced them and
/// leave generator state untouched.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The backing store could not be reached or rejected the operation.
    #[error("store unavailable: {context}")]
    StoreUnavailable { context: String },

    /// Encoding or decoding a component payload failed.
    #[error("serialization failed: {context}")]
    Serialization { context: String },

    /// A finalize read found no value for a field that should have been
    /// uploaded. Seen when a record expired mid-flight or when a duplicate
    /// upload pushed the arrival count to the threshold early.
    #[error("request {req_id} is missing component `{field}`")]
    MissingComponent { req_id: i64, field: ComponentField },

    /// The wall clock reads earlier than the last id-generation call.
    #[error("clock moved backwards: now={now}ms, last={last}ms since epoch")]
    NonMonotonicClock { now: i64, last: i64 },

    /// The wall clock reads earlier than the id epoch itself.
    #[error("wall clock reads {unix_ms}ms, before the id epoch")]
    ClockBeforeEpoch { unix_ms: i64 },

    /// The configured machine id cannot be encoded into an id.
    #[error("invalid machine id `{machine_id}`: {reason}")]
    InvalidMachineId { machine_id: String, reason: &'static str },

    /// No pooled channel became available before the deadline.
    #[error("timed out after {waited_ms}ms waiting for a pooled channel")]
    PoolTimeout { waited_ms: u64 },

    /// The pool was closed while waiting for, or holding, a channel.
    #[error("channel pool is closed")]
    PoolClosed,

    /// The broker was shut down.
    #[error("broker is closed")]
    BrokerClosed,

    /// Publish against an exchange nobody declared.
    #[error("unknown exchange `{exchange}`")]
    UnknownExchange { exchange: String },

    /// Consume or bind against a queue nobody declared.
    #[error("unknown queue `{queue}`")]
    UnknownQueue { queue: String },

    /// Operation on a channel that was already closed.
    #[error("broker channel is closed")]
    ChannelClosed,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            context: err.to_string(),
        }
    }
}
