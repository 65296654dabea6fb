//! Session registry: the arena of persistent sessions, keyed by user.
//!
//! The registry owns every live session on this host. Creation is idempotent
//! per user: attaching by user id returns that user's existing session when
//! one is alive and spawns a fresh one otherwise. Sessions outlive the
//! connections that created them; a background sweeper destroys sessions
//! that have sat detached past the configured threshold and reaps
//! terminated entries.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{InputPolicy, SessionId};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::{BridgeFactory, SessionError, SpawnSpec, TerminalBridge};

/// How long a terminated entry lingers before the sweeper removes it.
///
/// During this window an attach by the dead session's id reports the session
/// as gone rather than unknown.
const TERMINATED_GRACE: Duration = Duration::from_secs(60);

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Being spawned; not yet accepting I/O.
    Creating,
    /// At least one client is attached.
    Active,
    /// Running with no attached clients.
    Detached,
    /// The process has exited or been killed.
    Terminated,
}

/// One registered session.
pub struct SessionEntry {
    /// Unique session identifier.
    pub id: SessionId,
    /// Owning user.
    pub user_id: String,
    /// Input arbitration policy, fixed at creation.
    pub policy: InputPolicy,
    /// The terminal behind this session.
    bridge: Arc<dyn TerminalBridge>,
    /// Lifecycle state.
    state: std::sync::Mutex<Lifecycle>,
    /// Number of currently attached clients.
    attached: AtomicUsize,
    /// Next output sequence number. Survives gateway reconnects.
    next_seq: AtomicU64,
    /// When the session last went to zero attachments.
    detached_since: std::sync::Mutex<Option<Instant>>,
    /// When the session terminated.
    terminated_at: std::sync::Mutex<Option<Instant>>,
}

impl SessionEntry {
    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: Lifecycle) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Whether the session can still accept I/O.
    pub fn is_live(&self) -> bool {
        self.state() != Lifecycle::Terminated && self.bridge.is_running()
    }

    /// Number of currently attached clients.
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    /// The terminal behind this session.
    pub fn bridge(&self) -> &Arc<dyn TerminalBridge> {
        &self.bridge
    }

    /// Allocates the next output sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Records one more attached client.
    fn note_attach(&self) {
        self.attached.fetch_add(1, Ordering::SeqCst);
        *self.detached_since.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if self.state() != Lifecycle::Terminated {
            self.set_state(Lifecycle::Active);
        }
    }

    /// Records that the session has no attached clients left.
    ///
    /// The gateway reports detachment only when a session's last viewer is
    /// gone, so this clears the attach count outright and starts the idle
    /// clock. Attachments are re-counted as viewers come back.
    fn note_detach(&self) {
        self.attached.store(0, Ordering::SeqCst);
        if self.state() == Lifecycle::Active {
            self.set_state(Lifecycle::Detached);
            *self.detached_since.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(Instant::now());
        }
    }

    fn mark_terminated(&self) {
        self.set_state(Lifecycle::Terminated);
        let mut terminated_at = self.terminated_at.lock().unwrap_or_else(|e| e.into_inner());
        if terminated_at.is_none() {
            *terminated_at = Some(Instant::now());
        }
    }

    fn detached_for(&self) -> Option<Duration> {
        self.detached_since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| t.elapsed())
    }

    fn terminated_for(&self) -> Option<Duration> {
        self.terminated_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| t.elapsed())
    }
}

/// Summary of a session for status reporting.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Owning user.
    pub user_id: String,
    /// Lifecycle state.
    pub state: Lifecycle,
    /// Number of attached clients.
    pub attached: usize,
    /// Process ID of the shell, if available.
    pub pid: Option<u32>,
}

/// Registry limits and spawn defaults.
#[derive(Clone)]
pub struct RegistryConfig {
    /// Ceiling on concurrently live sessions.
    pub max_sessions: usize,
    /// Template for new terminal processes.
    pub spawn: SpawnSpec,
    /// Policy applied when an attach request does not name one.
    pub default_policy: InputPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            spawn: SpawnSpec::default(),
            default_policy: InputPolicy::Shared,
        }
    }
}

/// Thread-safe session registry backed by DashMap.
pub struct SessionRegistry {
    /// Map of session ID to entry.
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    /// Map of user ID to that user's current session.
    users: DashMap<String, SessionId>,
    /// Spawns terminals for new sessions.
    factory: Arc<dyn BridgeFactory>,
    config: RegistryConfig,
}

impl SessionRegistry {
    /// Creates a new registry.
    pub fn new(factory: Arc<dyn BridgeFactory>, config: RegistryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            users: DashMap::new(),
            factory,
            config,
        }
    }

    /// Returns the number of live (non-terminated) sessions.
    pub fn live_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.value().is_live()).count()
    }

    /// Resolves an attach request and records the attachment.
    ///
    /// Addressed by session id, the session must exist and be live. Addressed
    /// by user id, the user's live session is returned, or a fresh one is
    /// created. The per-user entry lock serializes concurrent creates for the
    /// same user, so a burst of attaches yields exactly one session.
    pub fn attach(
        &self,
        session_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Arc<SessionEntry>, SessionError> {
        if let Some(sid) = session_id {
            let entry = self.get(sid)?;
            entry.note_attach();
            return Ok(entry);
        }

        let user_id = user_id.ok_or_else(|| SessionError::NotFound(String::new()))?;
        let entry = self.create(user_id, None)?;
        entry.note_attach();
        Ok(entry)
    }

    /// Gets a live session by id.
    pub fn get(&self, session_id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        let entry = self
            .sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if !entry.is_live() {
            return Err(SessionError::AlreadyTerminated(session_id.to_string()));
        }

        Ok(entry)
    }

    /// Returns the user's session, creating one if none is alive.
    ///
    /// Idempotent: repeated calls for the same user return the same session
    /// until it terminates.
    pub fn create(
        &self,
        user_id: &str,
        policy: Option<InputPolicy>,
    ) -> Result<Arc<SessionEntry>, SessionError> {
        match self.users.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = self
                    .sessions
                    .get(occupied.get())
                    .map(|e| Arc::clone(e.value()));
                if let Some(entry) = existing {
                    if entry.is_live() {
                        return Ok(entry);
                    }
                }
                // Previous session died; replace the mapping.
                let entry = self.spawn_entry(user_id, policy)?;
                occupied.insert(entry.id.clone());
                Ok(entry)
            }
            Entry::Vacant(vacant) => {
                let entry = self.spawn_entry(user_id, policy)?;
                vacant.insert(entry.id.clone());
                Ok(entry)
            }
        }
    }

    fn spawn_entry(
        &self,
        user_id: &str,
        policy: Option<InputPolicy>,
    ) -> Result<Arc<SessionEntry>, SessionError> {
        if self.live_count() >= self.config.max_sessions {
            return Err(SessionError::LimitReached {
                limit: self.config.max_sessions,
            });
        }

        let id = Uuid::new_v4().to_string();
        let entry = Arc::new(SessionEntry {
            id: id.clone(),
            user_id: user_id.to_string(),
            policy: policy.unwrap_or(self.config.default_policy),
            bridge: self.factory.spawn(&id, &self.config.spawn)?,
            state: std::sync::Mutex::new(Lifecycle::Creating),
            attached: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            detached_since: std::sync::Mutex::new(Some(Instant::now())),
            terminated_at: std::sync::Mutex::new(None),
        });
        entry.set_state(Lifecycle::Detached);

        self.sessions.insert(id.clone(), Arc::clone(&entry));

        tracing::info!(
            session_id = %id,
            user_id = %user_id,
            policy = ?entry.policy,
            "Created session"
        );

        Ok(entry)
    }

    /// Records that a session lost its last viewer. The session keeps
    /// running; the sweeper destroys it only after the detached threshold.
    pub fn detach(&self, session_id: &str) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        entry.note_detach();
        tracing::debug!(session_id = %session_id, "All viewers detached");
        Ok(())
    }

    /// Writes input bytes to a session's terminal.
    pub async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), SessionError> {
        let entry = self.get(session_id)?;
        entry.bridge.write(data).await
    }

    /// Resizes a session's terminal.
    pub async fn resize(&self, session_id: &str, rows: u16, cols: u16) -> Result<(), SessionError> {
        let entry = self.get(session_id)?;
        entry.bridge.resize(rows, cols).await
    }

    /// Marks a session terminated after its process exited on its own.
    pub fn note_exit(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id).map(|e| Arc::clone(e.value())) {
            entry.mark_terminated();
            self.unlink_user(&entry);
            tracing::info!(session_id = %session_id, "Session terminated");
        }
    }

    /// Kills a session and marks it terminated. Idempotent: destroying an
    /// unknown or already-dead session is a no-op.
    pub async fn destroy(&self, session_id: &str) {
        let entry = match self.sessions.get(session_id).map(|e| Arc::clone(e.value())) {
            Some(entry) => entry,
            None => return,
        };

        if entry.state() != Lifecycle::Terminated {
            if let Err(e) = entry.bridge.shutdown().await {
                tracing::warn!(session_id = %session_id, error = %e, "Error killing session");
            }
            entry.mark_terminated();
            self.unlink_user(&entry);
            tracing::info!(session_id = %session_id, "Destroyed session");
        }
    }

    fn unlink_user(&self, entry: &SessionEntry) {
        // Only drop the mapping if it still points at this session; the user
        // may already have a replacement.
        self.users
            .remove_if(&entry.user_id, |_, sid| *sid == entry.id);
    }

    /// Lists all registered sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|e| {
                let entry = e.value();
                SessionInfo {
                    id: entry.id.clone(),
                    user_id: entry.user_id.clone(),
                    state: entry.state(),
                    attached: entry.attached(),
                    pid: entry.bridge.pid(),
                }
            })
            .collect()
    }

    /// One sweep: destroy sessions detached past the threshold, reap
    /// terminated entries past their grace period.
    pub async fn sweep(&self, detached_timeout: Duration) {
        let mut to_destroy = Vec::new();
        let mut to_reap = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value();
            match session.state() {
                Lifecycle::Detached => {
                    if session.detached_for().is_some_and(|d| d >= detached_timeout) {
                        to_destroy.push(session.id.clone());
                    }
                }
                Lifecycle::Terminated => {
                    if session.terminated_for().is_some_and(|d| d >= TERMINATED_GRACE) {
                        to_reap.push(session.id.clone());
                    }
                }
                _ => {}
            }
        }

        for id in to_destroy {
            tracing::info!(session_id = %id, "Destroying session idle past threshold");
            self.destroy(&id).await;
        }

        for id in to_reap {
            if self.sessions.remove(&id).is_some() {
                tracing::info!(session_id = %id, "Reaped terminated session");
            }
        }
    }

    /// Starts a background task that periodically sweeps the registry.
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        detached_timeout: Duration,
        cancel: CancellationToken,
    ) {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        registry.sweep(detached_timeout).await;
                    }
                }
            }
        });
    }
}
