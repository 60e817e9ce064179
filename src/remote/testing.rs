//! In-memory protocol session with fault injection
//!
//! Sessions opened by one [`MockConnector`] share a [`MockState`], so files
//! and queued faults survive a reconnect the way a real server's would.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::{RemoteError, RemoteResult};
use super::path;
use super::session::{ProtocolSession, RemoteEntry, SessionConnector};
use crate::config::{ConnectionConfig, Protocol};

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

/// Server-side state shared by every session of one connector
#[derive(Debug)]
pub struct MockState {
    nodes: Mutex<BTreeMap<String, Node>>,
    fail_keep_alive: AtomicBool,
    fail_probe: AtomicBool,
    /// Raw transport messages returned by upcoming writes, one per write
    write_faults: Mutex<VecDeque<String>>,
    write_delay: Mutex<Duration>,
    write_attempts: AtomicUsize,
    keep_alives: AtomicUsize,
}

impl Default for MockState {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            nodes: Mutex::new(nodes),
            fail_keep_alive: AtomicBool::new(false),
            fail_probe: AtomicBool::new(false),
            write_faults: Mutex::new(VecDeque::new()),
            write_delay: Mutex::new(Duration::ZERO),
            write_attempts: AtomicUsize::new(0),
            keep_alives: AtomicUsize::new(0),
        }
    }
}

impl MockState {
    pub fn seed_file(&self, p: &str, data: &[u8]) {
        let mut nodes = self.nodes.lock();
        let mut dir = path::parent(p).to_string();
        while dir != "/" {
            nodes.entry(dir.clone()).or_insert(Node::Dir);
            dir = path::parent(&dir).to_string();
        }
        nodes.insert(p.to_string(), Node::File(data.to_vec()));
    }

    pub fn seed_dir(&self, p: &str) {
        self.nodes.lock().insert(p.to_string(), Node::Dir);
    }

    pub fn file(&self, p: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(p) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, p: &str) -> bool {
        self.nodes.lock().contains_key(p)
    }

    pub fn fail_keep_alive(&self, fail: bool) {
        self.fail_keep_alive.store(fail, Ordering::SeqCst);
    }

    pub fn fail_probe(&self, fail: bool) {
        self.fail_probe.store(fail, Ordering::SeqCst);
    }

    /// Make the next write fail with `message`, dropping the session
    pub fn fail_next_write(&self, message: &str) {
        self.write_faults.lock().push_back(message.to_string());
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn keep_alives(&self) -> usize {
        self.keep_alives.load(Ordering::SeqCst)
    }
}

/// Fake [`ProtocolSession`]
#[derive(Debug)]
pub struct MockSession {
    state: Arc<MockState>,
    connected: AtomicBool,
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSession {
    pub fn new() -> Self {
        Self::with_state(Arc::new(MockState::default()))
    }

    pub fn with_state(state: Arc<MockState>) -> Self {
        Self {
            state,
            connected: AtomicBool::new(true),
        }
    }

    pub fn seed_file(&self, p: &str, data: &[u8]) {
        self.state.seed_file(p, data);
    }

    pub fn fail_keep_alive(&self, fail: bool) {
        self.state.fail_keep_alive(fail);
    }

    /// Simulate the server silently dropping the session
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn check_connected(&self) -> RemoteResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::from_transport("Not connected"))
        }
    }

    fn entry(p: &str, node: &Node) -> RemoteEntry {
        match node {
            Node::File(data) => RemoteEntry::file(p, data.len() as u64, None),
            Node::Dir => RemoteEntry::directory(p, None),
        }
    }
}

#[async_trait]
impl ProtocolSession for MockSession {
    fn protocol(&self) -> Protocol {
        Protocol::Sftp
    }

    async fn list(&self, dir: &str) -> RemoteResult<Vec<RemoteEntry>> {
        self.check_connected()?;
        let nodes = self.state.nodes.lock();
        match nodes.get(dir) {
            Some(Node::Dir) => Ok(nodes
                .iter()
                .filter(|(p, _)| p.as_str() != "/" && path::parent(p) == dir)
                .map(|(p, node)| Self::entry(p, node))
                .collect()),
            Some(Node::File(_)) => Err(RemoteError::Protocol(format!("{} is not a directory", dir))),
            None => Err(RemoteError::NotFound(dir.to_string())),
        }
    }

    async fn read(&self, p: &str) -> RemoteResult<Vec<u8>> {
        self.check_connected()?;
        match self.state.nodes.lock().get(p) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(RemoteError::Protocol(format!("{} is a directory", p))),
            None => Err(RemoteError::NotFound(p.to_string())),
        }
    }

    async fn write(&self, p: &str, data: &[u8]) -> RemoteResult<()> {
        self.check_connected()?;
        self.state.write_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fault = self.state.write_faults.lock().pop_front();
        if let Some(message) = fault {
            self.connected.store(false, Ordering::SeqCst);
            return Err(RemoteError::from_transport(message));
        }

        let mut nodes = self.state.nodes.lock();
        let parent = path::parent(p);
        if !matches!(nodes.get(parent), Some(Node::Dir)) {
            return Err(RemoteError::NotFound(parent.to_string()));
        }
        if matches!(nodes.get(p), Some(Node::Dir)) {
            return Err(RemoteError::Protocol(format!("{} is a directory", p)));
        }
        nodes.insert(p.to_string(), Node::File(data.to_vec()));
        Ok(())
    }

    async fn remove(&self, p: &str, recursive: bool) -> RemoteResult<()> {
        self.check_connected()?;
        let mut nodes = self.state.nodes.lock();
        match nodes.get(p) {
            None => return Err(RemoteError::NotFound(p.to_string())),
            Some(Node::Dir) => {
                let has_children = nodes.keys().any(|k| k != p && path::is_within(p, k));
                if has_children && !recursive {
                    return Err(RemoteError::Protocol(format!("{}: directory not empty", p)));
                }
            }
            Some(Node::File(_)) => {}
        }
        nodes.retain(|k, _| !path::is_within(p, k));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()> {
        self.check_connected()?;
        let mut nodes = self.state.nodes.lock();
        if !nodes.contains_key(from) {
            return Err(RemoteError::NotFound(from.to_string()));
        }
        let moved: Vec<String> = nodes
            .keys()
            .filter(|k| path::is_within(from, k))
            .cloned()
            .collect();
        nodes.retain(|k, _| !path::is_within(to, k));
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                nodes.insert(format!("{}{}", to, &old[from.len()..]), node);
            }
        }
        Ok(())
    }

    async fn mkdir(&self, p: &str) -> RemoteResult<()> {
        self.check_connected()?;
        let mut nodes = self.state.nodes.lock();
        if nodes.contains_key(p) {
            return Err(RemoteError::Protocol(format!("{}: already exists", p)));
        }
        if !matches!(nodes.get(path::parent(p)), Some(Node::Dir)) {
            return Err(RemoteError::NotFound(path::parent(p).to_string()));
        }
        nodes.insert(p.to_string(), Node::Dir);
        Ok(())
    }

    async fn stat(&self, p: &str) -> RemoteResult<RemoteEntry> {
        self.check_connected()?;
        self.state
            .nodes
            .lock()
            .get(p)
            .map(|node| Self::entry(p, node))
            .ok_or_else(|| RemoteError::NotFound(p.to_string()))
    }

    async fn probe(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.state.fail_probe.load(Ordering::SeqCst)
    }

    async fn keep_alive(&self) -> RemoteResult<()> {
        self.state.keep_alives.fetch_add(1, Ordering::SeqCst);
        self.check_connected()?;
        if self.state.fail_keep_alive.load(Ordering::SeqCst) {
            return Err(RemoteError::from_transport("keep-alive timed out"));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> RemoteResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Ways a scripted `open` can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    Auth,
    Refused,
    Reset,
}

/// Fake [`SessionConnector`] handing out [`MockSession`]s
#[derive(Debug, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
    opens: AtomicUsize,
    failures: Mutex<VecDeque<OpenFailure>>,
    open_delay: Mutex<Duration>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    last_config: Mutex<Option<ConnectionConfig>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &Arc<MockState> {
        &self.state
    }

    /// Successful and failed `open` calls so far
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Queue failures for the next `open` calls, in order
    pub fn fail_opens(&self, failures: &[OpenFailure]) {
        self.failures.lock().extend(failures.iter().copied());
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Most recently opened session
    pub fn current(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }

    /// Config seen by the last `open`, secrets included
    pub fn last_config(&self) -> Option<ConnectionConfig> {
        self.last_config.lock().clone()
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn open(
        &self,
        config: &ConnectionConfig,
        on_authenticating: &(dyn Fn() + Send + Sync),
    ) -> RemoteResult<Arc<dyn ProtocolSession>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock() = Some(config.clone());

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().pop_front();
        match failure {
            Some(OpenFailure::Refused) => {
                return Err(RemoteError::from_transport(format!(
                    "connect ECONNREFUSED {}:{}",
                    config.host,
                    config.port()
                )))
            }
            Some(OpenFailure::Reset) => {
                return Err(RemoteError::from_transport("read ECONNRESET"));
            }
            Some(OpenFailure::Auth) => {
                on_authenticating();
                return Err(RemoteError::Authentication(
                    "All configured authentication methods failed".to_string(),
                ));
            }
            None => {}
        }

        on_authenticating();
        let session = Arc::new(MockSession::with_state(Arc::clone(&self.state)));
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}
