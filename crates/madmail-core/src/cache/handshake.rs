use crate::cache::worker::WorkerMessage;
use parking_lot::Mutex;
use std::time::Duration;

pub const DEFAULT_CLEAR_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Active,
    /// `CLEAR_CACHE` sent, waiting for the worker.
    Clearing,
    /// The worker confirmed; the page reloaded.
    Cleared,
    /// Reloaded without confirmation.
    Reloaded,
}

/// Whatever "reload the page" means for the host.
pub trait PageReload: Send + Sync {
    fn reload(&self);
}

/// The page's end of the channel pair to its controlling worker.
pub struct WorkerLink {
    pub outbox: async_channel::Sender<String>,
    pub inbox: async_channel::Receiver<String>,
}

/// Page side of cache invalidation. Reloads exactly once per update.
pub struct InvalidationHandshake {
    timeout: Duration,
    state: Mutex<HandshakeState>,
}

impl InvalidationHandshake {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(HandshakeState::Active),
        }
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.lock()
    }

    fn finish(&self, state: HandshakeState, reload: &dyn PageReload) -> HandshakeState {
        *self.state.lock() = state;
        reload.reload();
        state
    }

    /// Ask the worker to drop its caches and reload once it confirms, or
    /// after the timeout if it never does. Without a worker, reload now.
    pub async fn apply_update(&self, worker: Option<&WorkerLink>, reload: &dyn PageReload) -> HandshakeState {
        {
            let mut state = self.state.lock();
            if *state != HandshakeState::Active {
                log::debug!("Update already applied ({:?})", *state);
                return *state;
            }
            *state = HandshakeState::Clearing;
        }

        let Some(link) = worker else {
            log::info!("No cache worker, reloading");
            return self.finish(HandshakeState::Reloaded, reload);
        };

        if link
            .outbox
            .try_send(WorkerMessage::ClearCache.as_str().to_string())
            .is_err()
        {
            log::warn!("Cache worker unreachable, waiting for fallback");
        }

        let confirmation = async {
            loop {
                match link.inbox.recv().await {
                    Ok(token) if WorkerMessage::parse(&token) == Some(WorkerMessage::CacheCleared) => return,
                    Ok(token) => log::debug!("Ignoring {:?} while clearing", token),
                    Err(_) => std::future::pending::<()>().await,
                }
            }
        };

        tokio::select! {
            _ = confirmation => {
                log::info!("Cache cleared, reloading");
                self.finish(HandshakeState::Cleared, reload)
            }
            _ = tokio::time::sleep(self.timeout) => {
                log::info!("No cache confirmation after {:?}, reloading anyway", self.timeout);
                self.finish(HandshakeState::Reloaded, reload)
            }
        }
    }
}

impl Default for InvalidationHandshake {
    fn default() -> Self {
        Self::new(DEFAULT_CLEAR_TIMEOUT)
    }
}
