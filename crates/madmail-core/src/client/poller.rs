use crate::client::rpc::{AdminTransport, ApiTarget, RemoteAdminClient};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Timing of a reconnect poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub initial_delay: Duration,
    /// Upper bound for a single liveness probe.
    pub probe_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_millis(2000),
            initial_delay: Duration::from_millis(1000),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Online { attempts: u32 },
    StillUnreachable { attempts: u32 },
}

/// Probe `target` until it answers or the attempt budget runs out.
///
/// Waits `initial_delay`, then before every probe waits `interval`. Makes at
/// most `max_attempts` probes.
pub async fn poll_until_online<T: AdminTransport>(
    client: &RemoteAdminClient<T>,
    target: &ApiTarget,
    policy: PollPolicy,
) -> PollOutcome {
    tokio::time::sleep(policy.initial_delay).await;

    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.interval).await;
        match tokio::time::timeout(policy.probe_timeout, client.status(target)).await {
            Ok(Ok(_)) => {
                log::info!("{} is online after {} probe(s)", target.request_url(), attempt);
                return PollOutcome::Online { attempts: attempt };
            }
            Ok(Err(e)) => {
                log::debug!(
                    "Probe {}/{} of {} failed: {}",
                    attempt,
                    policy.max_attempts,
                    target.request_url(),
                    e
                );
            }
            Err(_) => {
                log::debug!(
                    "Probe {}/{} of {} timed out",
                    attempt,
                    policy.max_attempts,
                    target.request_url()
                );
            }
        }
    }

    log::warn!(
        "{} still unreachable after {} probes",
        target.request_url(),
        policy.max_attempts
    );
    PollOutcome::StillUnreachable {
        attempts: policy.max_attempts,
    }
}

/// Owns the one reconnect poll a coordinator may have running.
///
/// Starting a poll supersedes the previous one: its task is aborted and its
/// ticket stops being current, so a completion that slips through can tell it
/// is stale.
pub struct ReconnectPoller {
    policy: PollPolicy,
    /// Incremented on every start/cancel.
    generation: Arc<AtomicU64>,
    active: Mutex<Option<tokio::task::AbortHandle>>,
}

impl ReconnectPoller {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            generation: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Spawn a poll against `target`. `on_finish` receives the ticket and the
    /// outcome, unless the poll was superseded before it finished.
    pub fn start<T, F, Fut>(
        &self,
        client: RemoteAdminClient<T>,
        target: ApiTarget,
        on_finish: F,
    ) -> u64
    where
        T: AdminTransport,
        F: FnOnce(u64, PollOutcome) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut active = self.active.lock();
        if let Some(handle) = active.take() {
            handle.abort();
        }
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let policy = self.policy;

        log::info!("Polling {} for reconnect", target.request_url());
        let task = tokio::spawn(async move {
            let outcome = poll_until_online(&client, &target, policy).await;
            if generation.load(Ordering::SeqCst) != ticket {
                log::debug!("Reconnect poll {} superseded, dropping outcome", ticket);
                return;
            }
            on_finish(ticket, outcome).await;
        });
        *active = Some(task.abort_handle());
        ticket
    }

    /// Stop the running poll, if any. Its outcome will never be delivered.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.active.lock().take() {
            handle.abort();
            log::debug!("Reconnect poll cancelled");
        }
    }

    /// Whether `ticket` belongs to the most recent start and was not cancelled.
    pub fn is_current(&self, ticket: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket
    }

    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for ReconnectPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.active.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{self, RpcResponse};
    use crate::client::testing::ScriptedTransport;
    use tokio::time::Instant;

    fn client(transport: &Arc<ScriptedTransport>) -> RemoteAdminClient<ScriptedTransport> {
        RemoteAdminClient::new(transport.clone())
    }

    fn target() -> ApiTarget {
        ApiTarget::new("https://h/api/admin", "t")
    }

    #[tokio::test(start_paused = true)]
    async fn online_on_first_successful_probe() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(api::STATUS, Err("refused".to_string()));
        transport.respond(api::STATUS, Err("refused".to_string()));
        let start = Instant::now();

        let outcome = poll_until_online(&client(&transport), &target(), PollPolicy::default()).await;

        assert_eq!(outcome, PollOutcome::Online { attempts: 3 });
        assert_eq!(transport.calls_to(api::STATUS).len(), 3);
        // 1s initial delay + three 2s intervals
        assert_eq!(start.elapsed(), Duration::from_millis(7000));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_offline("https://h/api/admin", true);
        let policy = PollPolicy {
            max_attempts: 4,
            ..Default::default()
        };
        let start = Instant::now();

        let outcome = poll_until_online(&client(&transport), &target(), policy).await;

        assert_eq!(outcome, PollOutcome::StillUnreachable { attempts: 4 });
        assert_eq!(transport.calls().len(), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(1000 + 4 * 2000));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_counts_as_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        let _held = transport.hold(api::STATUS);
        let policy = PollPolicy {
            max_attempts: 2,
            ..Default::default()
        };

        let outcome = poll_until_online(&client(&transport), &target(), policy).await;
        assert_eq!(outcome, PollOutcome::StillUnreachable { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn new_start_supersedes_running_poll() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always(api::STATUS, Ok(RpcResponse::ok(api::STATUS, serde_json::json!({}))));
        let poller = ReconnectPoller::new(PollPolicy::default());
        let (tx, rx) = async_channel::unbounded::<(u64, PollOutcome)>();

        let tx1 = tx.clone();
        let first = poller.start(client(&transport), target(), move |ticket, outcome| async move {
            let _ = tx1.send((ticket, outcome)).await;
        });
        let tx2 = tx.clone();
        let second = poller.start(client(&transport), target(), move |ticket, outcome| async move {
            let _ = tx2.send((ticket, outcome)).await;
        });
        assert!(!poller.is_current(first));
        assert!(poller.is_current(second));

        let (ticket, outcome) = rx.recv().await.unwrap();
        assert_eq!(ticket, second);
        assert_eq!(outcome, PollOutcome::Online { attempts: 1 });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_delivery() {
        let transport = Arc::new(ScriptedTransport::new());
        let poller = ReconnectPoller::new(PollPolicy::default());
        let (tx, rx) = async_channel::unbounded::<PollOutcome>();

        let ticket = poller.start(client(&transport), target(), move |_, outcome| async move {
            let _ = tx.send(outcome).await;
        });
        assert!(poller.is_active());
        poller.cancel();
        assert!(!poller.is_current(ticket));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(transport.calls().is_empty());
        assert!(!poller.is_active());
    }
}
