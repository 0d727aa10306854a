//! Detects a new console build by watching `version.json`.

use crate::error::AdminError;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

pub const VERSION_RESOURCE: &str = "version.json";
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Somewhere the currently deployed version can be read from. `None` means
/// "no information this time", never "the version changed".
#[async_trait::async_trait]
pub trait VersionSource: Send + Sync + 'static {
    async fn fetch_version(&self) -> Option<String>;
}

#[derive(Deserialize)]
struct VersionFile {
    #[serde(default)]
    version: Option<String>,
}

/// Reads `{origin}/version.json`, bypassing HTTP caches.
pub struct HttpVersionSource {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpVersionSource {
    pub fn new(origin: &str, timeout: Duration) -> Result<Self, AdminError> {
        let invalid = |message: String| AdminError::InvalidEndpoint {
            endpoint: origin.to_string(),
            message,
        };
        let base = url::Url::parse(&format!("{}/", origin.trim_end_matches('/')))
            .map_err(|e| invalid(e.to_string()))?;
        let url = base.join(VERSION_RESOURCE).map_err(|e| invalid(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdminError::Transport {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[async_trait::async_trait]
impl VersionSource for HttpVersionSource {
    async fn fetch_version(&self) -> Option<String> {
        let resp = match self
            .client
            .get(self.url.clone())
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                log::debug!("Version check failed: {}", e);
                return None;
            }
        };
        if !resp.status().is_success() {
            log::debug!("Version check returned {}", resp.status());
            return None;
        }
        match resp.json::<VersionFile>().await {
            Ok(file) => file.version.filter(|v| !v.is_empty()),
            Err(e) => {
                log::debug!("Malformed {}: {}", VERSION_RESOURCE, e);
                None
            }
        }
    }
}

/// Last version seen. Starts empty, so the first observation is a baseline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionMarker {
    observed: Option<String>,
}

impl VersionMarker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observed(&self) -> Option<&str> {
        self.observed.as_deref()
    }

    /// Record a fetch result. Returns the new version when it drifted from a
    /// previously observed one.
    pub fn observe(&mut self, fetched: Option<String>) -> Option<String> {
        let fetched = fetched?;
        match self.observed.replace(fetched.clone()) {
            Some(previous) if previous != fetched => Some(fetched),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Foreground,
    Background,
}

/// Periodically compares the deployed version against the one the page
/// started with.
///
/// Checks once on start (baseline), then every `period` and every time
/// `visibility` turns to foreground. Stops when dropped.
pub struct CacheVersionMonitor {
    task: tokio::task::AbortHandle,
}

impl CacheVersionMonitor {
    pub fn start<S, F>(
        source: Arc<S>,
        period: Duration,
        mut visibility: watch::Receiver<Visibility>,
        mut on_update: F,
    ) -> Self
    where
        S: VersionSource,
        F: FnMut(String) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut marker = VersionMarker::new();
            marker.observe(source.fetch_version().await);
            log::info!(
                "Version monitor started at {}",
                marker.observed().unwrap_or("unknown")
            );

            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut watching_visibility = true;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = visibility.changed(), if watching_visibility => {
                        if changed.is_err() {
                            watching_visibility = false;
                            continue;
                        }
                        if *visibility.borrow_and_update() != Visibility::Foreground {
                            continue;
                        }
                        log::debug!("Foregrounded, checking version");
                    }
                }

                if let Some(version) = marker.observe(source.fetch_version().await) {
                    log::info!("New version available: {}", version);
                    on_update(version);
                }
            }
        });
        Self {
            task: task.abort_handle(),
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for CacheVersionMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
