//! Connection Manager
//!
//! Owns one protocol session plus its operation locks, health monitor and
//! reconnection state machine, and exposes the protocol-agnostic file API.
//!
//! # Operation template
//!
//! 1. claim `verb:path` in the lock registry (fail fast if held)
//! 2. `ensure_connection`: reconnect first if the session is idle past the
//!    threshold, fails its liveness probe, or is `Degraded`
//! 3. run the protocol call under the operation timeout
//! 4. on connection loss or timeout, run one reconnect cycle and retry once
//! 5. the lock guard is dropped on every path
//!
//! Steps 2-4 together are bounded by the operation budget, which stays
//! below the lock ceiling. Operations that find the session slot empty
//! while another caller reconnects wait for that reconnect instead of
//! failing.
//!
//! # State machine
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Ready ⇄ Degraded
//!                    ↑                           │
//!                    └──────── Reconnecting ←────┘
//! ```

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::classify::{classify, ErrorClass};
use super::error::{RemoteError, RemoteResult};
use super::health::{spawn_keep_alive, HealthMonitor, HealthSnapshot, KeepAliveOutcome};
use super::lock::{OperationLockGuard, OperationLockRegistry, Verb};
use super::path;
use super::retry::RetryPolicy;
use super::session::{DefaultConnector, ProtocolSession, RemoteEntry, SessionConnector};
use super::state::{SessionState, StateEvent};
use crate::config::{ConnectionConfig, CredentialStore};

/// Consecutive keep-alive failures that mark a session `Degraded`
const DEGRADED_AFTER_FAILURES: u32 = 2;

/// Upper bound for closing a session during teardown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a single keep-alive probe
const KEEP_ALIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lock ceiling before any config is known
const DEFAULT_LOCK_CEILING: Duration = Duration::from_secs(60);

/// Slack between the operation budget and the lock ceiling
const LOCK_TAKEOVER_GRACE: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Caller-initiated: release every lock and end in `Disconnected`
    User,
    /// First half of a reconnect cycle: in-flight operations keep their
    /// locks and the state stays `Reconnecting`
    Internal,
}

struct Inner {
    connector: Arc<dyn SessionConnector>,
    credentials: RwLock<Option<Arc<dyn CredentialStore>>>,
    /// Survives every disconnect except a user disconnect with `clear_config`
    config: RwLock<Option<ConnectionConfig>>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<StateEvent>,
    session: tokio::sync::RwLock<Option<Arc<dyn ProtocolSession>>>,
    /// Held for the whole of a connect or reconnect cycle
    connect_gate: tokio::sync::Mutex<()>,
    locks: Arc<OperationLockRegistry>,
    health: Arc<HealthMonitor>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn current_state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `next` and publish the event. Transitions are serialized by
    /// the state mutex; repeating the current state is a no-op.
    fn transition(&self, next: SessionState, detail: Option<String>) {
        let mut state = self.state.lock();
        let previous = *state;
        if previous == next {
            return;
        }
        *state = next;
        match &detail {
            Some(d) => info!("Session state {} -> {} ({})", previous, next, d),
            None => info!("Session state {} -> {}", previous, next),
        }
        // No subscribers is fine
        let _ = self.events.send(StateEvent::new(previous, next, detail));
    }

    /// Transition only when the current state is one of `from`
    fn transition_from(&self, from: &[SessionState], next: SessionState, detail: Option<String>) {
        let mut state = self.state.lock();
        let previous = *state;
        if !from.contains(&previous) || previous == next {
            return;
        }
        *state = next;
        info!("Session state {} -> {}", previous, next);
        let _ = self.events.send(StateEvent::new(previous, next, detail));
    }

    fn on_keep_alive(&self, outcome: KeepAliveOutcome) {
        match outcome {
            KeepAliveOutcome::Failed {
                consecutive_failures,
            } if consecutive_failures >= DEGRADED_AFTER_FAILURES => {
                self.transition_from(
                    &[SessionState::Ready],
                    SessionState::Degraded,
                    Some(format!("{} consecutive keep-alive failures", consecutive_failures)),
                );
            }
            KeepAliveOutcome::Failed { .. } => {}
            KeepAliveOutcome::Alive => {
                self.transition_from(
                    &[SessionState::Degraded],
                    SessionState::Ready,
                    Some("keep-alive recovered".to_string()),
                );
            }
        }
    }

    fn stop_keep_alive(&self) {
        if let Some(handle) = self.keep_alive.lock().take() {
            handle.abort();
            debug!("Keep-alive stopped");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.keep_alive.get_mut().take() {
            handle.abort();
        }
    }
}

/// Orchestrates one remote connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Manager for the real SFTP and FTP/FTPS transports
    pub fn new() -> Self {
        Self::with_connector(Arc::new(DefaultConnector::default()))
    }

    pub fn with_connector(connector: Arc<dyn SessionConnector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                credentials: RwLock::new(None),
                config: RwLock::new(None),
                state: Mutex::new(SessionState::Disconnected),
                events,
                session: tokio::sync::RwLock::new(None),
                connect_gate: tokio::sync::Mutex::new(()),
                locks: Arc::new(OperationLockRegistry::new(DEFAULT_LOCK_CEILING)),
                health: Arc::new(HealthMonitor::new()),
                keep_alive: Mutex::new(None),
            }),
        }
    }

    /// Resolve missing passwords and passphrases from `store` at connect time
    pub fn with_credentials(self, store: Arc<dyn CredentialStore>) -> Self {
        *self.inner.credentials.write() = Some(store);
        self
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Connect with `config`, or with the preserved config when `None`.
    ///
    /// Transport failures are retried with exponential backoff; rejected
    /// credentials are not. A second call while an attempt is in flight is
    /// rejected with [`RemoteError::ConnectInProgress`].
    pub async fn connect(&self, config: impl Into<Option<ConnectionConfig>>) -> RemoteResult<()> {
        let _gate = self
            .inner
            .connect_gate
            .try_lock()
            .map_err(|_| RemoteError::ConnectInProgress)?;

        let config = match config.into() {
            Some(config) => {
                config.validate()?;
                *self.inner.config.write() = Some(config.clone());
                config
            }
            None => self.preserved_config()?,
        };

        if self.inner.session.read().await.is_some() {
            debug!("Replacing existing session for {}", config.display_name());
            self.teardown(Teardown::User).await;
        }

        self.establish(&config).await.map(|_| ())
    }

    /// Stop keep-alive, close the session, release every operation lock and
    /// go to `Disconnected`. `clear_config` forgets the config as well;
    /// without it a later `connect(None)` reuses it.
    pub async fn disconnect(&self, clear_config: bool) -> RemoteResult<()> {
        info!("Disconnecting (clear_config={})", clear_config);
        self.teardown(Teardown::User).await;
        if clear_config {
            *self.inner.config.write() = None;
        }
        Ok(())
    }

    /// Run one full reconnect cycle with the preserved config
    pub async fn reconnect(&self) -> RemoteResult<()> {
        let _gate = self
            .inner
            .connect_gate
            .try_lock()
            .map_err(|_| RemoteError::ConnectInProgress)?;
        let config = self.preserved_config()?;

        info!("Manual reconnect to {}", config.display_name());
        self.teardown(Teardown::User).await;
        self.establish(&config).await.map(|_| ())
    }

    pub fn state(&self) -> SessionState {
        self.inner.current_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// State transition events, in order
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.events.subscribe()
    }

    /// The config the manager currently holds
    pub fn current_config(&self) -> Option<ConnectionConfig> {
        self.inner.config.read().clone()
    }

    pub fn get_connection_health(&self) -> HealthSnapshot {
        self.inner.health.snapshot()
    }

    /// Keys of operation locks currently held
    pub fn held_locks(&self) -> Vec<String> {
        self.inner.locks.held_keys()
    }

    /// Store `secret` for the current connection in the credential store
    pub async fn save_credentials(&self, secret: &str) -> RemoteResult<()> {
        let (store, key) = self.credential_slot()?;
        let secret = secret.to_string();
        tokio::task::spawn_blocking(move || store.set(&key, &secret))
            .await
            .map_err(|e| RemoteError::Protocol(format!("credential task failed: {}", e)))??;
        Ok(())
    }

    /// Delete the stored secret for the current connection
    pub async fn forget_credentials(&self) -> RemoteResult<()> {
        let (store, key) = self.credential_slot()?;
        info!("Forgetting stored credentials for {}", key);
        tokio::task::spawn_blocking(move || store.delete(&key))
            .await
            .map_err(|e| RemoteError::Protocol(format!("credential task failed: {}", e)))??;
        Ok(())
    }

    fn credential_slot(&self) -> RemoteResult<(Arc<dyn CredentialStore>, String)> {
        let config = self.preserved_config()?;
        let store = self.inner.credentials.read().clone().ok_or_else(|| {
            RemoteError::Unsupported("no credential store configured".to_string())
        })?;
        Ok((store, config.identity().credential_key()))
    }

    fn preserved_config(&self) -> RemoteResult<ConnectionConfig> {
        self.inner
            .config
            .read()
            .clone()
            .ok_or(RemoteError::NoConfiguration)
    }

    /// Fill in a missing password or passphrase from the credential store.
    ///
    /// The resolved secret is only handed to the connector; the preserved
    /// config keeps whatever the caller supplied.
    async fn resolve_credentials(&self, config: &ConnectionConfig) -> ConnectionConfig {
        let missing = config.auth.needs_secret();
        let store = self.inner.credentials.read().clone();
        let (true, Some(store)) = (missing, store) else {
            return config.clone();
        };

        let key = config.identity().credential_key();
        let lookup_key = key.clone();
        match tokio::task::spawn_blocking(move || store.get(&lookup_key)).await {
            Ok(Ok(Some(secret))) => {
                debug!("Resolved secret for {} from credential store", key);
                let mut resolved = config.clone();
                resolved.auth = resolved.auth.with_secret(secret);
                resolved
            }
            Ok(Ok(None)) => {
                debug!("No stored secret for {}", key);
                config.clone()
            }
            Ok(Err(e)) => {
                warn!("Credential lookup for {} failed: {}", key, e);
                config.clone()
            }
            Err(e) => {
                warn!("Credential lookup task for {} failed: {}", key, e);
                config.clone()
            }
        }
    }

    /// Connect attempts with backoff. Caller holds the connect gate.
    async fn establish(&self, config: &ConnectionConfig) -> RemoteResult<Arc<dyn ProtocolSession>> {
        let policy = RetryPolicy::from_config(config);
        let resolved = self.resolve_credentials(config).await;
        let target_name = config.display_name();
        self.inner
            .locks
            .set_ceiling(operation_budget(config) + LOCK_TAKEOVER_GRACE);

        let inner = &self.inner;
        let on_authenticating = move || inner.transition(SessionState::Authenticating, None);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.inner.transition(
                SessionState::Connecting,
                Some(format!("attempt {} to {}", attempt, target_name)),
            );
            info!(
                "Connecting to {} ({}, attempt {}/{})",
                target_name,
                config.protocol,
                attempt,
                policy.max_retries + 1
            );

            let result = match tokio::time::timeout(
                config.connect_timeout(),
                self.inner.connector.open(&resolved, &on_authenticating),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    target_name,
                    config.connect_timeout()
                ))),
            };

            let err = match result {
                Ok(session) => {
                    self.install(Arc::clone(&session), config).await;
                    return Ok(session);
                }
                Err(e) => e,
            };

            let class = classify(&err);
            self.inner.health.record_failure();

            if class == ErrorClass::AuthFailure {
                error!("Authentication to {} failed: {}", target_name, err);
                self.inner
                    .transition(SessionState::Disconnected, Some(err.to_string()));
                return Err(err);
            }

            if !policy.should_retry(class, attempt) {
                self.inner
                    .transition(SessionState::Disconnected, Some(err.to_string()));
                if policy.should_retry(class, 1) {
                    error!(
                        "Connection to {} failed after {} attempts, giving up",
                        target_name, attempt
                    );
                    return Err(RemoteError::Connection(format!(
                        "Could not connect to {} after {} attempts (last error: {}). \
                         Automatic recovery has stopped; disconnect and reconnect manually",
                        target_name, attempt, err
                    )));
                }
                return Err(err);
            }

            let delay = policy.next_delay(attempt);
            warn!(
                "Connect attempt {} to {} failed ({:?}): {}; retrying in {:?}",
                attempt, target_name, class, err, delay
            );
            self.inner.transition(
                SessionState::Reconnecting,
                Some(format!("retrying in {:?}: {}", delay, err)),
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn install(&self, session: Arc<dyn ProtocolSession>, config: &ConnectionConfig) {
        *self.inner.session.write().await = Some(Arc::clone(&session));
        self.inner.health.mark_connected();
        self.inner.health.record_success();
        self.inner.transition(SessionState::Ready, None);
        info!("Connected to {}", config.display_name());

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = config.keep_alive_interval();
        let handle = spawn_keep_alive(
            session,
            Arc::clone(&self.inner.health),
            interval,
            interval.min(KEEP_ALIVE_PROBE_TIMEOUT),
            move |outcome| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_keep_alive(outcome);
                }
            },
        );
        if let Some(previous) = self.inner.keep_alive.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn teardown(&self, kind: Teardown) {
        self.inner.stop_keep_alive();

        let session = self.inner.session.write().await.take();
        if let Some(session) = session {
            match tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await {
                Ok(Ok(())) => debug!("Session closed"),
                Ok(Err(e)) => debug!("Session close returned: {}", e),
                Err(_) => warn!("Session close timed out after {:?}", CLOSE_TIMEOUT),
            }
        }

        self.inner.health.reset();
        if kind == Teardown::User {
            let released = self.inner.locks.release_all();
            if released > 0 {
                info!("Released {} outstanding operation locks", released);
            }
            self.inner.transition(SessionState::Disconnected, None);
        }
    }

    /// Reconnect after `stale` was found unusable.
    ///
    /// Concurrent callers queue on the connect gate; whoever comes second
    /// reuses the session the first one established.
    async fn recover(
        &self,
        stale: &Arc<dyn ProtocolSession>,
        reason: String,
    ) -> RemoteResult<Arc<dyn ProtocolSession>> {
        let _gate = self.inner.connect_gate.lock().await;

        if let Some(current) = self.inner.session.read().await.clone() {
            if !same_session(&current, stale) && current.is_connected() {
                debug!("Session already re-established by a concurrent caller");
                return Ok(current);
            }
        }

        let config = self.preserved_config()?;
        info!("Reconnecting to {}: {}", config.display_name(), reason);
        self.inner
            .transition(SessionState::Reconnecting, Some(reason));
        self.teardown(Teardown::Internal).await;
        self.establish(&config).await
    }

    /// Session that is safe to use right now, reconnecting first if the
    /// current one is idle past the threshold, failed its probe, or is
    /// `Degraded`.
    async fn ensure_connection(&self) -> RemoteResult<Arc<dyn ProtocolSession>> {
        let mut session = self.inner.session.read().await.clone();
        let establishing = matches!(
            self.state(),
            SessionState::Connecting | SessionState::Authenticating | SessionState::Reconnecting
        );
        if session.is_none() && establishing && self.current_config().is_some() {
            // Another caller is mid-reconnect; its result is ours too
            debug!("Waiting for the in-progress connect to finish");
            drop(self.inner.connect_gate.lock().await);
            session = self.inner.session.read().await.clone();
        }
        let Some(session) = session else {
            return match self.current_config() {
                Some(config) => Err(RemoteError::Connection(format!(
                    "Not connected to {}; connect first",
                    config.display_name()
                ))),
                None => Err(RemoteError::NoConfiguration),
            };
        };

        let idle_threshold = self
            .current_config()
            .map(|c| c.idle_timeout())
            .unwrap_or(Duration::from_secs(30 * 60));
        let idle = self.inner.health.idle_for();

        let stale_reason = if self.state() == SessionState::Degraded {
            Some("keep-alive reports the session degraded".to_string())
        } else if idle >= idle_threshold {
            Some(format!("idle for {}s", idle.as_secs()))
        } else if !session.probe().await {
            Some("liveness probe failed".to_string())
        } else {
            None
        };

        match stale_reason {
            Some(reason) => self.recover(&session, reason).await,
            None => Ok(session),
        }
    }

    fn operation_timeout(&self) -> Duration {
        self.current_config()
            .map(|c| c.operation_timeout())
            .unwrap_or(DEFAULT_LOCK_CEILING)
    }

    fn resolve_path(&self, raw: &str) -> String {
        let root = self
            .current_config()
            .map(|c| c.root())
            .unwrap_or_else(|| "/".to_string());
        path::resolve(&root, raw)
    }

    fn lock(&self, verb: Verb, path: &str) -> RemoteResult<OperationLockGuard> {
        self.inner.locks.acquire(verb, path)
    }

    /// One protocol call under the operation timeout, feeding health
    async fn attempt<T, F, Fut>(
        &self,
        op: &F,
        session: Arc<dyn ProtocolSession>,
    ) -> RemoteResult<T>
    where
        F: Fn(Arc<dyn ProtocolSession>) -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let limit = self.operation_timeout();
        let result = match tokio::time::timeout(limit, op(session)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(format!(
                "operation did not finish within {:?}",
                limit
            ))),
        };

        match &result {
            Ok(_) => {
                self.inner.health.record_success();
                self.inner.health.touch();
            }
            Err(e) if classify(e).is_connection_loss() => {
                let failures = self.inner.health.record_failure();
                warn!("Operation failed ({} consecutive): {}", failures, e);
            }
            // The server answered; the session itself is fine
            Err(_) => self.inner.health.touch(),
        }
        result
    }

    /// The shared operation template.
    ///
    /// The lock is held for the whole run, which is bounded by the operation
    /// budget. The budget is below the lock ceiling, so a lock is never
    /// taken over while its owner is still running.
    async fn run<T, F, Fut>(&self, lock: Option<(Verb, &str)>, op: F) -> RemoteResult<T>
    where
        F: Fn(Arc<dyn ProtocolSession>) -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let _guard = lock
            .map(|(verb, path)| self.lock(verb, path))
            .transpose()?;
        let budget = self
            .current_config()
            .map(|c| operation_budget(&c))
            .unwrap_or(DEFAULT_LOCK_CEILING);

        match tokio::time::timeout(budget, self.run_with_recovery(op)).await {
            Ok(result) => result,
            Err(_) => {
                let failures = self.inner.health.record_failure();
                warn!(
                    "Operation exceeded its {:?} budget ({} consecutive failures)",
                    budget, failures
                );
                Err(RemoteError::Timeout(format!(
                    "operation did not finish within {:?}, reconnects included",
                    budget
                )))
            }
        }
    }

    /// One attempt, then one reconnect and retry on connection loss
    async fn run_with_recovery<T, F, Fut>(&self, op: F) -> RemoteResult<T>
    where
        F: Fn(Arc<dyn ProtocolSession>) -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let session = self.ensure_connection().await?;
        let err = match self.attempt(&op, Arc::clone(&session)).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let class = classify(&err);
        let retries = self.current_config().map(|c| c.max_retries()).unwrap_or(0);
        if !class.is_connection_loss() || retries == 0 {
            return Err(err);
        }

        warn!("Operation hit {:?}: {}; reconnecting and retrying once", class, err);
        let session = self.recover(&session, err.to_string()).await?;
        self.attempt(&op, session).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // File operations
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn list_files(&self, dir: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let dir = self.resolve_path(dir);
        self.run(None, |s| {
            let dir = dir.clone();
            async move { s.list(&dir).await }
        })
        .await
    }

    pub async fn read_file(&self, file: &str) -> RemoteResult<Vec<u8>> {
        let file = self.resolve_path(file);
        self.run(Some((Verb::Read, file.as_str())), |s| {
            let file = file.clone();
            async move { s.read(&file).await }
        })
        .await
    }

    pub async fn write_file(&self, file: &str, data: &[u8]) -> RemoteResult<()> {
        let file = self.resolve_path(file);
        let data: Arc<[u8]> = Arc::from(data);
        self.run(Some((Verb::Write, file.as_str())), |s| {
            let file = file.clone();
            let data = Arc::clone(&data);
            async move { s.write(&file, &data).await }
        })
        .await
    }

    pub async fn delete_file(&self, target: &str, recursive: bool) -> RemoteResult<()> {
        let target = self.resolve_path(target);
        if target == "/" {
            return Err(RemoteError::Unsupported(
                "refusing to delete the remote root".to_string(),
            ));
        }
        self.run(Some((Verb::Delete, target.as_str())), |s| {
            let target = target.clone();
            async move { s.remove(&target, recursive).await }
        })
        .await
    }

    /// Rename `old` to `new`. An existing `new` is a [`RemoteError::Conflict`]
    /// unless `overwrite` confirms replacing it.
    pub async fn rename_file(&self, old: &str, new: &str, overwrite: bool) -> RemoteResult<()> {
        let old = self.resolve_path(old);
        let new = self.resolve_path(new);
        if old == new {
            return Ok(());
        }
        self.run(Some((Verb::Rename, old.as_str())), |s| {
            let (old, new) = (old.clone(), new.clone());
            async move {
                if s.exists(&new).await? {
                    if !overwrite {
                        return Err(RemoteError::Conflict(new));
                    }
                    debug!("Replacing {} on rename", new);
                    s.remove(&new, true).await?;
                }
                s.rename(&old, &new).await
            }
        })
        .await
    }

    /// Copy `src` to `dst` through the client. Directories need `recursive`.
    pub async fn copy_file(
        &self,
        src: &str,
        dst: &str,
        recursive: bool,
        overwrite: bool,
    ) -> RemoteResult<()> {
        let src = self.resolve_path(src);
        let dst = self.resolve_path(dst);
        if src == dst {
            return Err(RemoteError::Unsupported(format!(
                "cannot copy {} onto itself",
                src
            )));
        }
        self.run(Some((Verb::Copy, src.as_str())), |s| {
            let (src, dst) = (src.clone(), dst.clone());
            async move {
                if s.exists(&dst).await? {
                    if !overwrite {
                        return Err(RemoteError::Conflict(dst));
                    }
                    debug!("Replacing {} on copy", dst);
                    s.remove(&dst, true).await?;
                }
                s.copy(&src, &dst, recursive).await
            }
        })
        .await
    }

    /// Create an empty file; never overwrites
    pub async fn create_file(&self, file: &str) -> RemoteResult<()> {
        let file = self.resolve_path(file);
        self.run(Some((Verb::Write, file.as_str())), |s| {
            let file = file.clone();
            async move {
                if s.exists(&file).await? {
                    return Err(RemoteError::Conflict(file));
                }
                s.write(&file, &[]).await
            }
        })
        .await
    }

    /// Create a directory; never overwrites
    pub async fn create_directory(&self, dir: &str) -> RemoteResult<()> {
        let dir = self.resolve_path(dir);
        self.run(Some((Verb::Mkdir, dir.as_str())), |s| {
            let dir = dir.clone();
            async move {
                if s.exists(&dir).await? {
                    return Err(RemoteError::Conflict(dir));
                }
                s.mkdir(&dir).await
            }
        })
        .await
    }

    pub async fn file_exists(&self, target: &str) -> RemoteResult<bool> {
        let target = self.resolve_path(target);
        self.run(None, |s| {
            let target = target.clone();
            async move { s.exists(&target).await }
        })
        .await
    }

    pub async fn stat(&self, target: &str) -> RemoteResult<RemoteEntry> {
        let target = self.resolve_path(target);
        self.run(None, |s| {
            let target = target.clone();
            async move { s.stat(&target).await }
        })
        .await
    }
}

/// Longest one operation may legitimately run: a reconnect before the first
/// attempt, waiting out another caller's reconnect, a recovery cycle and two
/// attempts.
fn operation_budget(config: &ConnectionConfig) -> Duration {
    let policy = RetryPolicy::from_config(config);
    let backoff: Duration = (1..=policy.max_retries)
        .map(|attempt| policy.next_delay(attempt))
        .sum();
    let connect_cycle =
        CLOSE_TIMEOUT + config.connect_timeout() * (policy.max_retries + 1) + backoff;
    KEEP_ALIVE_PROBE_TIMEOUT + connect_cycle * 3 + config.operation_timeout() * 2
}

fn same_session(a: &Arc<dyn ProtocolSession>, b: &Arc<dyn ProtocolSession>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
