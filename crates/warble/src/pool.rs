use crate::{
    broker::{Channel, Connection},
    error::{Error, Result},
};
use core::ops::Deref;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{Instant, timeout},
};

/// A bounded pool of broker [`Channel`]s.
///
/// Channels are created lazily up to `max_size` and returned on drop of the
/// [`PooledChannel`] guard, so a returned channel is never lost and a
/// borrowed one never exceeds the cap. Callers that cannot get a channel
/// within their deadline fail with [`Error::PoolTimeout`] instead of
/// waiting forever.
///
/// Cloning is cheap; all clones share the same channels.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connection: Connection,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    max_size: usize,
}

struct PoolState {
    idle: VecDeque<Channel>,
    live: usize,
    closed: bool,
}

impl ChannelPool {
    pub fn new(connection: Connection, max_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connection,
                permits: Arc::new(Semaphore::new(max_size)),
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(max_size),
                    live: 0,
                    closed: false,
                }),
                max_size,
            }),
        }
    }

    /// Borrows a channel, preferring an idle one, creating a new one while
    /// under the cap, and otherwise waiting up to `wait` for a return.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolTimeout`] if no channel frees up within `wait`.
    /// - [`Error::PoolClosed`] once [`close`](Self::close) has been called.
    pub async fn pop(&self, wait: Duration) -> Result<PooledChannel> {
        let started = Instant::now();
        let permits = Arc::clone(&self.inner.permits);
        let permit = match timeout(wait, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                return Err(Error::PoolTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        let channel = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            match state.idle.pop_front() {
                Some(channel) => channel,
                None => {
                    let channel = self.inner.connection.open_channel()?;
                    state.live += 1;
                    channel
                }
            }
        };

        Ok(PooledChannel {
            channel: Some(channel),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Closes the pool: idle channels are closed now, borrowed ones as
    /// their guards drop, and every waiter in [`pop`](Self::pop) wakes with
    /// [`Error::PoolClosed`].
    pub fn close(&self) {
        let drained: Vec<Channel> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<Channel> = state.idle.drain(..).collect();
            state.live -= drained.len();
            drained
        };
        for channel in drained {
            channel.close();
        }
        self.inner.permits.close();
    }

    /// Channels currently alive, borrowed and idle together.
    pub fn live(&self) -> usize {
        self.inner.state.lock().live
    }

    pub fn idle_len(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }
}

/// A borrowed channel. Dropping it returns the channel to the pool;
/// [`discard`](Self::discard) retires it instead, making room for a fresh
/// one.
pub struct PooledChannel {
    channel: Option<Channel>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl core::fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PooledChannel").finish_non_exhaustive()
    }
}

impl PooledChannel {
    /// Closes the channel instead of returning it.
    pub fn discard(mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.state.lock().live -= 1;
            channel.close();
        }
    }
}

impl Deref for PooledChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        // Only `discard` removes the channel, and it consumes the guard.
        self.channel.as_ref().expect("channel already retired")
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            // The channel must be back in `idle` before the permit is
            // released, which happens when the `_permit` field drops after
            // this body runs.
            let mut state = self.pool.state.lock();
            if state.closed || !channel.is_open() {
                state.live -= 1;
                drop(state);
                channel.close();
            } else {
                state.idle.push_back(channel);
            }
        }
    }
}
