//! Console build update detection: the version monitor, the offline asset
//! cache and the invalidation handshake between them.

use crate::config::ConsoleSettings;
use anyhow::{Context, Result};
use madmail_core::cache::{
    AssetCacheWorker, HandshakeState, HttpAssetNetwork, InvalidationHandshake, PageReload, WorkerLink,
};
use madmail_core::version::{CacheVersionMonitor, HttpVersionSource, Visibility};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use url::Url;

/// Reload of the console shell: the next `install` refetches it.
#[derive(Default)]
struct ShellReload {
    requested: AtomicBool,
}

impl PageReload for ShellReload {
    fn reload(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

pub struct ConsoleUpdates {
    worker: Arc<AssetCacheWorker<HttpAssetNetwork>>,
    link: WorkerLink,
    handshake: Mutex<Arc<InvalidationHandshake>>,
    clear_timeout: std::time::Duration,
    visibility: watch::Sender<Visibility>,
    _monitor: CacheVersionMonitor,
    _worker_task: tokio::task::JoinHandle<()>,
}

impl ConsoleUpdates {
    /// Install the shell cache for `origin` and start watching its version.
    /// `notices` receives a line whenever a new build shows up.
    pub async fn start(
        origin: &str,
        settings: &ConsoleSettings,
        notices: async_channel::Sender<String>,
    ) -> Result<Self> {
        let base = Url::parse(&format!("{}/", origin.trim_end_matches('/')))
            .with_context(|| format!("invalid asset origin {}", origin))?;

        let network = Arc::new(HttpAssetNetwork::new(settings.request_timeout())?);
        let worker = Arc::new(AssetCacheWorker::new(base.clone(), network, Default::default()));
        worker
            .install()
            .await
            .with_context(|| format!("failed to cache console shell from {}", base))?;
        worker.activate();

        let (page_tx, page_rx) = async_channel::unbounded();
        worker.claim(page_tx);
        let (outbox, inbox) = async_channel::unbounded();
        let worker_task = AssetCacheWorker::spawn(worker.clone(), inbox);

        let source = Arc::new(HttpVersionSource::new(origin, settings.request_timeout())?);
        let (visibility, visibility_rx) = watch::channel(Visibility::Foreground);
        let monitor = CacheVersionMonitor::start(
            source,
            settings.version_check_interval(),
            visibility_rx,
            move |version| {
                let notice = format!("New console version {} available, run `update` to apply", version);
                match notices.try_send(notice) {
                    Ok(()) => {}
                    Err(async_channel::TrySendError::Full(notice)) => {
                        log::warn!("Notice channel full, dropping {:?}", notice);
                    }
                    Err(async_channel::TrySendError::Closed(_)) => {
                        log::debug!("Console closed, update notice for {} dropped", version);
                    }
                }
            },
        );

        Ok(Self {
            worker,
            link: WorkerLink {
                outbox,
                inbox: page_rx,
            },
            handshake: Mutex::new(Arc::new(InvalidationHandshake::new(settings.cache_clear_timeout()))),
            clear_timeout: settings.cache_clear_timeout(),
            visibility,
            _monitor: monitor,
            _worker_task: worker_task,
        })
    }

    /// The operator came back to the console; check for a new build now.
    pub fn foreground(&self) {
        self.visibility.send_replace(Visibility::Foreground);
    }

    /// Drop the cached build and refetch the shell.
    pub async fn apply(&self) -> Result<HandshakeState> {
        let handshake = self.handshake.lock().clone();
        let reload = ShellReload::default();
        let state = handshake.apply_update(Some(&self.link), &reload).await;

        if reload.requested.load(Ordering::SeqCst) {
            self.worker
                .install()
                .await
                .context("failed to refetch console shell")?;
            self.worker.activate();
            // A reloaded page starts with a fresh handshake
            *self.handshake.lock() = Arc::new(InvalidationHandshake::new(self.clear_timeout));
        }
        Ok(state)
    }
}
