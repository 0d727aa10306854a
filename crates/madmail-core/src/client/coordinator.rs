use crate::api::{self, ADMIN_PATH_KEY, DEFAULT_ADMIN_PATH};
use crate::client::poller::{PollOutcome, PollPolicy, ReconnectPoller};
use crate::client::refresh;
use crate::client::rpc::{AdminTransport, ApiTarget, RemoteAdminClient};
use crate::client::types::{
    CoordinatorEvent, DashboardData, MutationAction, NoticeLevel, PortAccess, RefreshReport,
    Session, SettingMutation, ToggleVocabulary,
};
use crate::endpoint;
use crate::error::{AdminError, CoordinatorError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Session flags that are raised for the duration of one operation.
#[derive(Clone, Copy)]
enum Flag {
    Busy,
    Refreshing,
    Connecting,
}

impl Flag {
    fn slot(self, session: &mut Session) -> &mut bool {
        match self {
            Flag::Busy => &mut session.busy,
            Flag::Refreshing => &mut session.refreshing,
            Flag::Connecting => &mut session.connecting,
        }
    }
}

/// Lowers its flag on drop, unless the session it was raised in is gone.
struct FlagGuard<'a, T: AdminTransport> {
    inner: &'a Inner<T>,
    epoch: u64,
    flag: Flag,
}

impl<T: AdminTransport> FlagGuard<'_, T> {
    fn is_live(&self) -> bool {
        self.inner.session.lock().epoch == self.epoch
    }
}

impl<T: AdminTransport> Drop for FlagGuard<'_, T> {
    fn drop(&mut self) {
        let mut session = self.inner.session.lock();
        if session.epoch == self.epoch {
            *self.flag.slot(&mut session) = false;
        }
    }
}

struct Inner<T: AdminTransport> {
    client: RemoteAdminClient<T>,
    session: Mutex<Session>,
    data: Mutex<DashboardData>,
    poller: ReconnectPoller,
    events: async_channel::Sender<CoordinatorEvent>,
}

impl<T: AdminTransport> Inner<T> {
    fn emit(&self, event: CoordinatorEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(async_channel::TrySendError::Closed(_)) => {}
            Err(async_channel::TrySendError::Full(event)) => {
                log::warn!("Event channel full, dropping {:?}", event);
            }
        }
    }

    fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(CoordinatorEvent::Notice {
            level,
            message: message.into(),
        });
    }

    /// Raise `flag` on the connected session and capture its target.
    fn raise(&self, flag: Flag) -> Result<(FlagGuard<'_, T>, ApiTarget), CoordinatorError> {
        let mut session = self.session.lock();
        if !session.connected {
            return Err(CoordinatorError::NotConnected);
        }
        let slot = flag.slot(&mut session);
        if *slot {
            return Err(CoordinatorError::Busy);
        }
        *slot = true;
        let target = ApiTarget::new(session.endpoint.clone(), session.token.clone());
        Ok((
            FlagGuard {
                inner: self,
                epoch: session.epoch,
                flag,
            },
            target,
        ))
    }
}

/// Owns one admin session: serialises mutations, tracks whether the server
/// needs a restart, moves the endpoint when the admin path changes and keeps
/// the dashboard data fresh.
///
/// Cheap to clone; clones share the session.
pub struct ConfigMutationCoordinator<T: AdminTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: AdminTransport> Clone for ConfigMutationCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: AdminTransport> ConfigMutationCoordinator<T> {
    pub fn new(
        client: RemoteAdminClient<T>,
        policy: PollPolicy,
        events: async_channel::Sender<CoordinatorEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                session: Mutex::new(Session::default()),
                data: Mutex::new(DashboardData::default()),
                poller: ReconnectPoller::new(policy),
                events,
            }),
        }
    }

    pub fn session(&self) -> Session {
        self.inner.session.lock().clone()
    }

    pub fn data(&self) -> DashboardData {
        self.inner.data.lock().clone()
    }

    pub fn pending_restart(&self) -> bool {
        self.inner.session.lock().pending_restart
    }

    pub fn is_busy(&self) -> bool {
        self.inner.session.lock().busy
    }

    pub fn is_polling(&self) -> bool {
        self.inner.poller.is_active()
    }

    /// The structured value of `key` from the last settings fetch.
    pub fn setting(&self, key: &str) -> api::SettingValue {
        self.inner
            .data
            .lock()
            .settings
            .as_ref()
            .map(|s| s.setting(key))
            .unwrap_or_else(|| api::SettingValue::unset(key))
    }

    // ── Session lifecycle ───────────────────────────────────────────────

    /// Probe `endpoint` with `token` and, if it answers, make it the live
    /// session. Any previous session is dropped first.
    pub async fn connect(&self, endpoint: &str, token: &str) -> Result<(), CoordinatorError> {
        if endpoint.trim().is_empty() || token.trim().is_empty() {
            return Err(CoordinatorError::MissingCredentials);
        }
        let endpoint = endpoint::normalize(endpoint)?;
        let token = token.trim().to_string();

        let guard = {
            let mut session = self.inner.session.lock();
            if session.connecting {
                return Err(CoordinatorError::Busy);
            }
            self.inner.poller.cancel();
            *session = Session {
                endpoint: endpoint.clone(),
                token: token.clone(),
                connecting: true,
                epoch: session.epoch + 1,
                ..Default::default()
            };
            *self.inner.data.lock() = DashboardData::default();
            FlagGuard {
                inner: &*self.inner,
                epoch: session.epoch,
                flag: Flag::Connecting,
            }
        };
        let target = ApiTarget::new(endpoint.clone(), token.clone());
        log::info!("Connecting to {}", endpoint);
        let result = self.inner.client.status(&target).await;

        {
            let mut session = self.inner.session.lock();
            if session.epoch != guard.epoch {
                log::debug!("Connect to {} superseded", endpoint);
                return Err(CoordinatorError::NotConnected);
            }
            match result {
                Ok(status) => {
                    session.connected = true;
                    session.connect_error = None;
                    self.inner.data.lock().status = Some(status);
                }
                Err(e) => {
                    log::warn!("Connect to {} failed: {}", endpoint, e);
                    session.connect_error = Some(e.to_string());
                    drop(session);
                    self.inner.notice(NoticeLevel::Error, e.to_string());
                    return Err(e.into());
                }
            }
        }
        drop(guard);

        log::info!("Connected to {}", endpoint);
        self.inner.emit(CoordinatorEvent::Connected { endpoint, token });
        self.refresh().await;
        Ok(())
    }

    /// Drop the session. Cancels the reconnect poll and resets everything to
    /// its initial state, so nothing in flight can revive it.
    pub fn disconnect(&self) {
        {
            let mut session = self.inner.session.lock();
            self.inner.poller.cancel();
            *session = Session {
                epoch: session.epoch + 1,
                ..Default::default()
            };
            *self.inner.data.lock() = DashboardData::default();
        }
        log::info!("Disconnected");
        self.inner.emit(CoordinatorEvent::Disconnected);
    }

    /// Fetch every display resource and merge the successes. Returns `None`
    /// when not connected, when another refresh is running, or when the
    /// session changed while fetching.
    pub async fn refresh(&self) -> Option<RefreshReport> {
        let (guard, target) = self.inner.raise(Flag::Refreshing).ok()?;
        let (fetched, report) = refresh::fetch_all(&self.inner.client, &target).await;

        {
            let session = self.inner.session.lock();
            if session.epoch != guard.epoch {
                log::debug!("Dropping refresh of a superseded session");
                return None;
            }
            refresh::merge(&mut self.inner.data.lock(), fetched);
        }
        drop(guard);

        self.inner.emit(CoordinatorEvent::Refreshed {
            updated: report.updated.clone(),
            failed: report.failed.iter().map(|(r, _)| *r).collect(),
        });
        Some(report)
    }

    // ── Settings ────────────────────────────────────────────────────────

    /// Apply one setting mutation.
    ///
    /// A failure leaves the session untouched. Changing `admin_path` moves
    /// the endpoint and hands off to the reconnect poll; any other key is
    /// followed by a refresh.
    pub async fn apply(&self, mutation: SettingMutation) -> Result<api::SettingValue, CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let SettingMutation { key, action, value } = mutation;
        let value = value.unwrap_or_default();

        let result = match action {
            MutationAction::Set => self.inner.client.set_setting(&target, &key, &value).await,
            MutationAction::Reset => self.inner.client.reset_setting(&target, &key).await,
        };
        let setting = match result {
            Ok(setting) => setting,
            Err(e) => {
                log::warn!("Applying {} failed: {}", key, e);
                self.inner.notice(NoticeLevel::Error, e.to_string());
                return Err(e.into());
            }
        };
        if !guard.is_live() {
            return Ok(setting);
        }

        let relocate_to = match action {
            MutationAction::Set if key == ADMIN_PATH_KEY && !value.is_empty() => Some(value.as_str()),
            MutationAction::Reset if key == ADMIN_PATH_KEY => Some(DEFAULT_ADMIN_PATH),
            _ => None,
        };
        if let Some(path) = relocate_to {
            self.inner.notice(NoticeLevel::Info, format!("{} updated", key));
            self.relocate(&guard, &target, path).await?;
            return Ok(setting);
        }

        if setting.requires_restart() {
            self.mark_pending_restart(&guard);
        }
        let verb = match action {
            MutationAction::Set => "updated",
            MutationAction::Reset => "reset",
        };
        self.inner.notice(NoticeLevel::Info, format!("{} {}", key, verb));
        self.refresh().await;
        Ok(setting)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<api::SettingValue, CoordinatorError> {
        self.apply(SettingMutation::set(key, value)).await
    }

    pub async fn reset(&self, key: &str) -> Result<api::SettingValue, CoordinatorError> {
        self.apply(SettingMutation::reset(key)).await
    }

    /// Reload on the old endpoint, move to `path`, then poll the new one.
    async fn relocate(
        &self,
        guard: &FlagGuard<'_, T>,
        old: &ApiTarget,
        path: &str,
    ) -> Result<(), CoordinatorError> {
        // The old endpoint is the only one answering until the reload lands
        if let Err(e) = self.inner.client.reload(old).await {
            log::warn!("Reload on {} failed, moving on: {}", old.request_url(), e);
        }
        let new_endpoint = endpoint::relocate(&old.endpoint, path)?;

        {
            let mut session = self.inner.session.lock();
            if session.epoch != guard.epoch {
                return Ok(());
            }
            session.endpoint = new_endpoint.clone();
            session.pending_restart = false;
            session.restart_stalled = false;
        }
        log::info!("Admin endpoint moved to {}", new_endpoint);
        self.inner.emit(CoordinatorEvent::EndpointChanged {
            endpoint: new_endpoint.clone(),
        });
        self.inner.emit(CoordinatorEvent::PendingRestart(false));
        self.inner.notice(NoticeLevel::Info, "Restarting...");

        self.start_reconnect(ApiTarget::new(new_endpoint, old.token.clone()), guard.epoch);
        Ok(())
    }

    fn mark_pending_restart(&self, guard: &FlagGuard<'_, T>) {
        let changed = {
            let mut session = self.inner.session.lock();
            if session.epoch != guard.epoch {
                return;
            }
            !std::mem::replace(&mut session.pending_restart, true)
        };
        if changed {
            self.inner.emit(CoordinatorEvent::PendingRestart(true));
        }
    }

    // ── Toggles and port access ─────────────────────────────────────────

    /// Read the current state of a toggle resource. Not a mutation.
    pub async fn toggle_status(&self, resource: &str) -> Result<api::ToggleStatus, CoordinatorError> {
        let target = {
            let session = self.inner.session.lock();
            if !session.connected {
                return Err(CoordinatorError::NotConnected);
            }
            ApiTarget::new(session.endpoint.clone(), session.token.clone())
        };
        Ok(self.inner.client.get_toggle(&target, resource).await?)
    }

    /// Flip a toggle resource whose reported state is `current`.
    pub async fn toggle(&self, resource: &str, current: &str) -> Result<api::ToggleStatus, CoordinatorError> {
        let action = ToggleVocabulary::for_resource(resource).flip(current);
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self.inner.client.set_toggle(&target, resource, action).await;
        let label = resource.rsplit('/').next().unwrap_or(resource);
        let status = self
            .finish(&guard, result, |s: &api::ToggleStatus| format!("{}: {}", label, s.status), true)
            .await?;
        Ok(status)
    }

    /// Make `port_key` local-only or public. Always leaves a restart pending;
    /// the operator applies it.
    pub async fn set_port_access(&self, port_key: &str, access: PortAccess) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let key = api::port_local_only_key(port_key);
        let result = match access {
            PortAccess::LocalOnly => self.inner.client.set_setting(&target, &key, "true").await,
            PortAccess::Public => self.inner.client.reset_setting(&target, &key).await,
        };
        if let Err(e) = result {
            log::warn!("Changing access of {} failed: {}", port_key, e);
            self.inner.notice(NoticeLevel::Error, e.to_string());
            return Err(e.into());
        }

        self.mark_pending_restart(&guard);
        let scope = match access {
            PortAccess::LocalOnly => "local only",
            PortAccess::Public => "public",
        };
        self.inner
            .notice(NoticeLevel::Info, format!("{} is now {}", port_key, scope));
        self.refresh().await;
        Ok(())
    }

    /// Flip the access scope of `port_key` from the reported `current`.
    pub async fn toggle_port_access(&self, port_key: &str, current: &str) -> Result<PortAccess, CoordinatorError> {
        let next = PortAccess::from_reported(current).flipped();
        self.set_port_access(port_key, next).await?;
        Ok(next)
    }

    // ── Restart ─────────────────────────────────────────────────────────

    /// Ask the server to reload its configuration, then wait for it.
    pub async fn reload(&self) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self.inner.client.reload(&target).await.map(|_| ());
        self.after_restart(&guard, target, result)
    }

    /// Ask the server process to restart, then wait for it.
    pub async fn restart(&self) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self.inner.client.restart(&target).await;
        self.after_restart(&guard, target, result)
    }

    fn after_restart(
        &self,
        guard: &FlagGuard<'_, T>,
        target: ApiTarget,
        result: Result<(), AdminError>,
    ) -> Result<(), CoordinatorError> {
        if let Err(e) = result {
            log::warn!("Restart request failed: {}", e);
            self.inner.notice(NoticeLevel::Error, e.to_string());
            return Err(e.into());
        }
        {
            let mut session = self.inner.session.lock();
            if session.epoch != guard.epoch {
                return Ok(());
            }
            session.pending_restart = false;
            session.restart_stalled = false;
        }
        self.inner.emit(CoordinatorEvent::PendingRestart(false));
        self.inner.notice(NoticeLevel::Info, "Restarting...");
        self.start_reconnect(target, guard.epoch);
        Ok(())
    }

    fn start_reconnect(&self, target: ApiTarget, epoch: u64) {
        let endpoint = target.endpoint.clone();
        self.inner.emit(CoordinatorEvent::ReconnectStarted {
            endpoint: endpoint.clone(),
        });
        let this = self.clone();
        self.inner
            .poller
            .start(self.inner.client.clone(), target, move |ticket, outcome| async move {
                this.finish_reconnect(ticket, epoch, endpoint, outcome).await;
            });
    }

    async fn finish_reconnect(&self, ticket: u64, epoch: u64, endpoint: String, outcome: PollOutcome) {
        {
            let mut session = self.inner.session.lock();
            // Checked under the session lock; disconnect cancels under it too
            if !self.inner.poller.is_current(ticket) || session.epoch != epoch {
                return;
            }
            session.restart_stalled = matches!(outcome, PollOutcome::StillUnreachable { .. });
        }

        match outcome {
            PollOutcome::Online { attempts } => {
                self.inner.emit(CoordinatorEvent::Online {
                    endpoint,
                    attempts,
                });
                self.inner.notice(NoticeLevel::Info, "Server is back online");
                self.refresh().await;
            }
            PollOutcome::StillUnreachable { attempts } => {
                self.inner.emit(CoordinatorEvent::StillRestarting {
                    endpoint,
                    attempts,
                });
                self.inner
                    .notice(NoticeLevel::Error, "Server may still be restarting");
            }
        }
    }

    // ── Accounts, quota, blocklist, DNS, queue ──────────────────────────

    /// Surface the outcome of a plain mutation and optionally refresh.
    async fn finish<R>(
        &self,
        guard: &FlagGuard<'_, T>,
        result: Result<R, AdminError>,
        message: impl FnOnce(&R) -> String,
        refresh_after: bool,
    ) -> Result<R, CoordinatorError> {
        match result {
            Ok(value) => {
                self.inner.notice(NoticeLevel::Info, message(&value));
                if refresh_after && guard.is_live() {
                    self.refresh().await;
                }
                Ok(value)
            }
            Err(e) => {
                log::warn!("Mutation failed: {}", e);
                self.inner.notice(NoticeLevel::Error, e.to_string());
                Err(e.into())
            }
        }
    }

    pub async fn create_account(&self) -> Result<api::CreateAccountResponse, CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self.inner.client.create_account(&target).await;
        self.finish(&guard, result, |a| format!("Created {}", a.email), true)
            .await
    }

    pub async fn delete_account(&self, username: &str) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self.inner.client.delete_account(&target, username).await;
        self.finish(&guard, result, |_| format!("Deleted {}", username), true)
            .await
    }

    pub async fn set_default_quota(&self, max_bytes: u64) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self.inner.client.set_default_quota(&target, max_bytes).await;
        self.finish(&guard, result, |_| "Default quota updated".to_string(), true)
            .await
    }

    pub async fn set_user_quota(&self, username: &str, max_bytes: u64) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self
            .inner
            .client
            .set_user_quota(&target, username, max_bytes)
            .await;
        self.finish(&guard, result, |_| format!("Quota of {} updated", username), true)
            .await
    }

    pub async fn reset_user_quota(&self, username: &str) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self.inner.client.reset_user_quota(&target, username).await;
        self.finish(&guard, result, |_| format!("Quota of {} reset", username), true)
            .await
    }

    pub async fn block_user(&self, username: &str, reason: Option<&str>) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self.inner.client.block_user(&target, username, reason).await;
        self.finish(&guard, result, |_| format!("Blocked {}", username), true)
            .await
    }

    pub async fn unblock_user(&self, username: &str) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self.inner.client.unblock_user(&target, username).await;
        self.finish(&guard, result, |_| format!("Unblocked {}", username), true)
            .await
    }

    pub async fn add_dns_override(
        &self,
        lookup_key: &str,
        target_host: &str,
        comment: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self
            .inner
            .client
            .add_dns(&target, lookup_key, target_host, comment)
            .await;
        self.finish(&guard, result, |_| format!("{} -> {}", lookup_key, target_host), true)
            .await
    }

    pub async fn delete_dns_override(&self, lookup_key: &str) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self.inner.client.delete_dns(&target, lookup_key).await;
        self.finish(&guard, result, |_| format!("Removed override {}", lookup_key), true)
            .await
    }

    pub async fn purge_queue(&self, action: &str) -> Result<(), CoordinatorError> {
        let (guard, target) = self.inner.raise(Flag::Busy)?;
        let result = self.inner.client.purge_queue(&target, action).await;
        self.finish(&guard, result, |_| format!("Queue purge '{}' done", action), false)
            .await
    }
}
