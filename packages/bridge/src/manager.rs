use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use codex_bridge_error::BridgeError;
use tokio::sync::watch;

use crate::config::Config;
use crate::session::Session;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// What acquirers of an in-flight start eventually observe.
#[derive(Debug, Clone)]
enum StartState {
    Pending,
    Ready,
    Failed(String),
}

struct SessionSlot {
    session: Arc<Session>,
    /// Guarded by the registry lock for increments; decrements happen on
    /// lease drop. A slot observed at zero under the registry lock cannot
    /// gain a lease before its entry is removed.
    leases: std::sync::Mutex<usize>,
}

impl SessionSlot {
    fn lease_count(&self) -> usize {
        *self.leases.lock().expect("leases lock")
    }
}

enum Entry {
    Starting(watch::Receiver<StartState>),
    Ready(Arc<SessionSlot>),
}

struct ManagerInner {
    config: Arc<Config>,
    entries: tokio::sync::Mutex<HashMap<String, Entry>>,
    accepting: AtomicBool,
}

/// Registry `user_id → Session`: capacity-capped, lazily creating, idle
/// reaping. Never evicts an active session to admit a new user — at
/// capacity, new users get a capacity error.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                entries: tokio::sync::Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Gets or creates the user's session and takes a lease on it.
    /// Concurrent acquirers for the same user share a single in-flight
    /// start; a dead child is replaced transparently.
    pub async fn acquire(&self, user_id: &str) -> Result<LeasedSession, BridgeError> {
        loop {
            if !self.inner.accepting.load(Ordering::SeqCst) {
                return Err(BridgeError::ShuttingDown);
            }

            let waiter = {
                let mut entries = self.inner.entries.lock().await;
                let found = match entries.get(user_id) {
                    Some(Entry::Ready(slot)) => Some(Ok(slot.clone())),
                    Some(Entry::Starting(rx)) => Some(Err(rx.clone())),
                    None => None,
                };
                match found {
                    Some(Ok(slot)) => {
                        if self.slot_is_usable(&slot).await {
                            *slot.leases.lock().expect("leases lock") += 1;
                            slot.session.touch();
                            return Ok(LeasedSession {
                                inner: self.inner.clone(),
                                user_id: user_id.to_string(),
                                slot,
                            });
                        }
                        tracing::warn!(user_id, "session has a dead process, replacing");
                        entries.remove(user_id);
                        let session = slot.session.clone();
                        tokio::spawn(async move { session.close().await });
                        continue;
                    }
                    Some(Err(rx)) => rx,
                    None => {
                        let max = self.inner.config.max_sessions;
                        if max > 0 && entries.len() >= max {
                            tracing::error!(user_id, max, "max sessions reached, rejecting");
                            return Err(BridgeError::Capacity { max_sessions: max });
                        }
                        let (tx, rx) = watch::channel(StartState::Pending);
                        entries.insert(user_id.to_string(), Entry::Starting(rx.clone()));
                        // The start runs on its own task so an HTTP client
                        // disconnect cannot cancel it and strand the
                        // placeholder.
                        let manager = self.clone();
                        let owner = user_id.to_string();
                        tokio::spawn(async move { manager.run_start(&owner, tx).await });
                        rx
                    }
                }
            };

            // A start for this user is in flight; wait for the outcome and
            // retry the lookup.
            let mut waiter = waiter;
            loop {
                match waiter.borrow().clone() {
                    StartState::Pending => {}
                    StartState::Ready => break,
                    StartState::Failed(message) => {
                        return Err(BridgeError::upstream(message));
                    }
                }
                if waiter.changed().await.is_err() {
                    // Start task died without resolving; clear the stale
                    // placeholder and retry.
                    let mut entries = self.inner.entries.lock().await;
                    if matches!(entries.get(user_id), Some(Entry::Starting(_))) {
                        entries.remove(user_id);
                    }
                    break;
                }
            }
        }
    }

    async fn run_start(&self, user_id: &str, tx: watch::Sender<StartState>) {
        match Session::start(user_id, &self.inner.config).await {
            Ok(session) => {
                let mut entries = self.inner.entries.lock().await;
                if !self.inner.accepting.load(Ordering::SeqCst) {
                    entries.remove(user_id);
                    drop(entries);
                    session.close().await;
                    let _ = tx.send(StartState::Failed("Server is shutting down".into()));
                    return;
                }
                let slot = Arc::new(SessionSlot {
                    session,
                    leases: std::sync::Mutex::new(0),
                });
                entries.insert(user_id.to_string(), Entry::Ready(slot));
                drop(entries);
                let _ = tx.send(StartState::Ready);
                tracing::info!(user_id, "created session");
            }
            Err(err) => {
                self.inner.entries.lock().await.remove(user_id);
                let _ = tx.send(StartState::Failed(err.to_string()));
            }
        }
    }

    async fn slot_is_usable(&self, slot: &Arc<SessionSlot>) -> bool {
        if !slot.session.is_usable() {
            return false;
        }
        // A turn timeout flags the session for a liveness probe rather
        // than killing it outright.
        if slot.session.take_health_probe_request() && !slot.session.child_running().await {
            slot.session.mark_dead();
            return false;
        }
        true
    }

    /// Background task that tears down idle, unleased sessions.
    pub fn spawn_reaper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let idle_timeout = self.inner.config.idle_timeout;
        if idle_timeout.is_zero() {
            tracing::info!("idle timeout disabled, skipping reaper");
            return None;
        }
        let interval = self.inner.config.cleanup_interval;
        let inner = self.inner.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut reaped = Vec::new();
                {
                    let mut entries = inner.entries.lock().await;
                    entries.retain(|user_id, entry| match entry {
                        Entry::Ready(slot)
                            if slot.lease_count() == 0
                                && slot.session.idle_for() > idle_timeout =>
                        {
                            tracing::info!(
                                user_id = %user_id,
                                idle_secs = slot.session.idle_for().as_secs(),
                                "expiring idle session"
                            );
                            slot.session.mark_draining();
                            reaped.push(slot.session.clone());
                            false
                        }
                        _ => true,
                    });
                }
                for session in reaped {
                    session.close().await;
                }
            }
        }))
    }

    /// Refuses new acquires, waits up to `grace` for in-flight leases to
    /// drain, then force-closes every transport.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.accepting.store(false, Ordering::SeqCst);

        {
            let entries = self.inner.entries.lock().await;
            for entry in entries.values() {
                if let Entry::Ready(slot) = entry {
                    slot.session.mark_draining();
                }
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            let outstanding = {
                let entries = self.inner.entries.lock().await;
                entries
                    .values()
                    .filter_map(|entry| match entry {
                        Entry::Ready(slot) => Some(slot.lease_count()),
                        Entry::Starting(_) => Some(1),
                    })
                    .sum::<usize>()
            };
            if outstanding == 0 || Instant::now() >= deadline {
                if outstanding > 0 {
                    tracing::warn!(outstanding, "shutdown grace expired with leases held");
                }
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        let slots = {
            let mut entries = self.inner.entries.lock().await;
            entries
                .drain()
                .filter_map(|(_, entry)| match entry {
                    Entry::Ready(slot) => Some(slot),
                    Entry::Starting(_) => None,
                })
                .collect::<Vec<_>>()
        };
        for slot in slots {
            slot.session.close().await;
        }
        tracing::info!("session manager shutdown complete");
    }
}

/// A counted reference to a session held by an in-flight HTTP request.
/// Dropping it releases the lease; the last lease of a draining session
/// triggers teardown.
pub struct LeasedSession {
    inner: Arc<ManagerInner>,
    user_id: String,
    slot: Arc<SessionSlot>,
}

impl std::fmt::Debug for LeasedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedSession")
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl LeasedSession {
    pub fn session(&self) -> &Arc<Session> {
        &self.slot.session
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for LeasedSession {
    fn drop(&mut self) {
        let remaining = {
            let mut leases = self.slot.leases.lock().expect("leases lock");
            *leases = leases.saturating_sub(1);
            *leases
        };
        if remaining == 0
            && self.slot.session.state() == crate::session::SessionState::Draining
        {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };
            let inner = self.inner.clone();
            let user_id = self.user_id.clone();
            let slot = self.slot.clone();
            handle.spawn(async move {
                let mut entries = inner.entries.lock().await;
                if let Some(Entry::Ready(current)) = entries.get(&user_id) {
                    if Arc::ptr_eq(current, &slot) {
                        entries.remove(&user_id);
                    }
                }
                drop(entries);
                slot.session.close().await;
            });
        }
    }
}
