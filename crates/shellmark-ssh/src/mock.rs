//! In-memory transport for testing channel consumers without an SSH server.
//!
//! Shell channels interpret a tiny line-oriented shell: `echo` (with `$?`
//! substitution), `true`, `false`, `sleep N`, `exit [N]` and `cat` on exec
//! channels. Every other command goes to a caller-supplied handler. Output is
//! scheduled on the tokio clock, so commands can be made slow.

use crate::{
    resolve_path, Channel, Connection, ConnectionInfo, DirEntry, Recv, RemoteFilesystem,
    RemoteMetadata, StreamKind, Transport, TransportError, TransportType,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// What a handled command writes and returns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockOutput {
    /// Bytes written to standard output
    pub stdout: Bytes,
    /// Bytes written to standard error
    pub stderr: Bytes,
    /// Exit status
    pub exit_status: i32,
    /// Delay before standard output appears
    pub stdout_delay: Duration,
    /// Delay before standard error appears
    pub stderr_delay: Duration,
}

impl MockOutput {
    /// Successful command writing `stdout`
    pub fn stdout(stdout: impl Into<Bytes>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Command writing only to standard error
    pub fn stderr(stderr: impl Into<Bytes>) -> Self {
        Self {
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// Add standard error output
    pub fn with_stderr(mut self, stderr: impl Into<Bytes>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Set the exit status
    pub fn with_status(mut self, status: i32) -> Self {
        self.exit_status = status;
        self
    }

    /// Delay both streams by `delay`
    pub fn after(mut self, delay: Duration) -> Self {
        self.stdout_delay = delay;
        self.stderr_delay = delay;
        self
    }

    /// Delay only standard output
    pub fn stdout_after(mut self, delay: Duration) -> Self {
        self.stdout_delay = delay;
        self
    }

    /// Delay only standard error
    pub fn stderr_after(mut self, delay: Duration) -> Self {
        self.stderr_delay = delay;
        self
    }

    fn not_found(command: &str) -> Self {
        let name = command.split_whitespace().next().unwrap_or(command);
        Self::stderr(format!("sh: {}: command not found\n", name)).with_status(127)
    }
}

/// Handler for commands the mock shell does not implement itself
pub type CommandHandler = Arc<dyn Fn(&str) -> MockOutput + Send + Sync>;

#[derive(Clone)]
struct MockSettings {
    handler: CommandHandler,
    send_ready: bool,
    writes_stalled: bool,
    banner: Option<Bytes>,
}

/// Transport that hands out [`MockConnection`]s
pub struct MockTransport {
    settings: MockSettings,
    fail_with: Option<String>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Mock whose unknown commands fail with status 127
    pub fn new() -> Self {
        Self {
            settings: MockSettings {
                handler: Arc::new(MockOutput::not_found),
                send_ready: true,
                writes_stalled: false,
                banner: None,
            },
            fail_with: None,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Route unknown commands to `handler`
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) -> MockOutput + Send + Sync + 'static,
    {
        self.settings.handler = Arc::new(handler);
        self
    }

    /// Make every channel report that it cannot accept writes
    pub fn never_ready(mut self) -> Self {
        self.settings.send_ready = false;
        self
    }

    /// Make every write accept nothing, as when the remote window is full
    pub fn stall_writes(mut self) -> Self {
        self.settings.writes_stalled = true;
        self
    }

    /// Bytes a shell channel prints as soon as it opens (motd, prompt noise)
    pub fn with_banner(mut self, banner: impl Into<Bytes>) -> Self {
        self.settings.banner = Some(banner.into());
        self
    }

    /// Make `connect` fail with a connection error
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    /// Every connection opened so far
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        lock(&self.connections).clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
        if let Some(message) = &self.fail_with {
            return Err(TransportError::Connection(message.clone()));
        }
        let connection = Arc::new(MockConnection::with_settings(self.settings.clone()));
        lock(&self.connections).push(Arc::clone(&connection));
        Ok(connection)
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: "mock.example.com".to_string(),
            port: 22,
            username: "mockuser".to_string(),
            transport_type: TransportType::Local,
        }
    }
}

/// In-memory connection
pub struct MockConnection {
    settings: MockSettings,
    connected: AtomicBool,
    close_count: AtomicUsize,
    keepalive: Mutex<Option<Duration>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    filesystem: Arc<MemoryFilesystem>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnection {
    /// Connection with default settings
    pub fn new() -> Self {
        MockTransport::new().into_connection()
    }

    fn with_settings(settings: MockSettings) -> Self {
        Self {
            settings,
            connected: AtomicBool::new(true),
            close_count: AtomicUsize::new(0),
            keepalive: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            filesystem: Arc::new(MemoryFilesystem::new()),
        }
    }

    /// Every channel opened so far, in order
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        lock(&self.channels).clone()
    }

    /// Most recently opened channel
    pub fn last_channel(&self) -> Option<Arc<MockChannel>> {
        lock(&self.channels).last().cloned()
    }

    /// How many times `close` ran while connected
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Keepalive interval last requested
    pub fn keepalive(&self) -> Option<Duration> {
        *lock(&self.keepalive)
    }

    /// The filesystem served by `open_sftp`
    pub fn filesystem(&self) -> Arc<MemoryFilesystem> {
        Arc::clone(&self.filesystem)
    }

    fn open(&self, shell: bool) -> Result<Arc<dyn Channel>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Connection("connection is closed".to_string()));
        }
        let channel = Arc::new(MockChannel::new(self.settings.clone(), shell));
        lock(&self.channels).push(Arc::clone(&channel));
        Ok(channel)
    }
}

impl MockTransport {
    fn into_connection(self) -> MockConnection {
        MockConnection::with_settings(self.settings)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn open_exec_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        self.open(false)
    }

    async fn open_shell_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        self.open(true)
    }

    async fn open_sftp(&self) -> Result<Box<dyn RemoteFilesystem>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Connection("connection is closed".to_string()));
        }
        Ok(Box::new(SharedFilesystem(Arc::clone(&self.filesystem))))
    }

    async fn set_keepalive(&self, interval: Duration) -> Result<(), TransportError> {
        *lock(&self.keepalive) = Some(interval);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
            for channel in self.channels() {
                channel.remote_close();
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ChannelState {
    stdout: VecDeque<(Instant, Bytes)>,
    stderr: VecDeque<(Instant, Bytes)>,
    line_buffer: BytesMut,
    sent: BytesMut,
    stdin: BytesMut,
    command: Option<String>,
    last_status: i32,
    busy_until: Option<Instant>,
    eof_at: Option<Instant>,
    exit_status: Option<i32>,
    exited: bool,
    closed: bool,
}

impl ChannelState {
    fn queue(&mut self, stream: StreamKind) -> &mut VecDeque<(Instant, Bytes)> {
        match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    /// Schedule a command's output after whatever is already running
    fn schedule(&mut self, output: MockOutput) -> Instant {
        let start = self.busy_until.map_or_else(Instant::now, |busy| busy.max(Instant::now()));
        let stdout_at = start + output.stdout_delay;
        let stderr_at = start + output.stderr_delay;
        if !output.stdout.is_empty() {
            self.stdout.push_back((stdout_at, output.stdout));
        }
        if !output.stderr.is_empty() {
            self.stderr.push_back((stderr_at, output.stderr));
        }
        let done = stdout_at.max(stderr_at);
        self.busy_until = Some(done);
        self.last_status = output.exit_status;
        done
    }
}

/// In-memory channel
pub struct MockChannel {
    settings: MockSettings,
    shell: bool,
    state: Mutex<ChannelState>,
    close_count: AtomicUsize,
    active_reads: Arc<AtomicUsize>,
}

struct ReadGuard(Arc<AtomicUsize>);

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockChannel {
    fn new(settings: MockSettings, shell: bool) -> Self {
        let mut state = ChannelState::default();
        if shell {
            if let Some(banner) = &settings.banner {
                state.stdout.push_back((Instant::now(), banner.clone()));
            }
        }
        Self {
            settings,
            shell,
            state: Mutex::new(state),
            close_count: AtomicUsize::new(0),
            active_reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether this is a shell channel
    pub fn is_shell(&self) -> bool {
        self.shell
    }

    /// Everything written to the channel
    pub fn sent(&self) -> Bytes {
        lock(&self.state).sent.clone().freeze()
    }

    /// Input delivered to an exec channel before end-of-input
    pub fn stdin(&self) -> Bytes {
        lock(&self.state).stdin.clone().freeze()
    }

    /// Command requested with `exec`
    pub fn command(&self) -> Option<String> {
        lock(&self.state).command.clone()
    }

    /// How many times `close` ran on an open channel
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Reads currently waiting on this channel
    pub fn active_reads(&self) -> usize {
        self.active_reads.load(Ordering::SeqCst)
    }

    /// Push unsolicited bytes onto an output stream
    pub fn inject(&self, stream: StreamKind, data: impl Into<Bytes>) {
        lock(&self.state).queue(stream).push_back((Instant::now(), data.into()));
    }

    fn remote_close(&self) {
        let mut state = lock(&self.state);
        state.exited = true;
        state.eof_at.get_or_insert_with(Instant::now);
    }

    fn interpret(&self, state: &mut ChannelState, line: &str) {
        let mut words = line.split_whitespace();
        let program = words.next().unwrap_or_default();
        match program {
            "echo" => {
                let status = state.last_status.to_string();
                let text: Vec<String> = words.map(|w| w.replace("$?", &status)).collect();
                state.schedule(MockOutput::stdout(format!("{}\n", text.join(" "))));
            }
            "true" => {
                state.schedule(MockOutput::default());
            }
            "false" => {
                state.schedule(MockOutput::default().with_status(1));
            }
            "sleep" => {
                let secs = words.next().and_then(|w| w.parse::<f64>().ok()).unwrap_or(0.0);
                state.schedule(MockOutput::default().after(Duration::from_secs_f64(secs.max(0.0))));
            }
            "exit" => {
                let status = words
                    .next()
                    .and_then(|w| w.parse::<i32>().ok())
                    .unwrap_or(state.last_status);
                let done = state.schedule(MockOutput::default().with_status(status));
                state.exit_status = Some(status);
                state.eof_at = Some(done);
            }
            "cat" if !self.shell => {
                let input = state.stdin.clone().freeze();
                state.schedule(MockOutput::stdout(input));
            }
            _ => {
                let output = (self.settings.handler)(line);
                state.schedule(output);
            }
        }
    }

    fn feed_shell(&self, state: &mut ChannelState, data: &[u8]) {
        state.line_buffer.extend_from_slice(data);
        while let Some(pos) = state.line_buffer.iter().position(|b| *b == b'\n') {
            let line = state.line_buffer.split_to(pos + 1);
            if state.exit_status.is_some() {
                continue;
            }
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                self.interpret(state, &line);
            }
        }
    }

    fn ensure_open(state: &ChannelState) -> Result<(), TransportError> {
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn exec(&self, command: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        if self.shell || state.command.is_some() {
            return Err(TransportError::Protocol("exec request refused".to_string()));
        }
        state.command = Some(command.to_string());
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        if state.exited {
            return Err(TransportError::ChannelClosed);
        }
        if self.settings.writes_stalled {
            return Ok(0);
        }
        state.sent.extend_from_slice(data);
        if self.shell {
            self.feed_shell(&mut state, data);
        } else {
            state.stdin.extend_from_slice(data);
        }
        Ok(data.len())
    }

    async fn send_eof(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        if let (false, Some(command)) = (self.shell, state.command.clone()) {
            if state.eof_at.is_none() {
                self.interpret(&mut state, command.trim());
                let done = state.busy_until.unwrap_or_else(Instant::now);
                state.exit_status = Some(state.last_status);
                state.eof_at = Some(done);
            }
        }
        Ok(())
    }

    async fn recv(
        &self,
        stream: StreamKind,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Recv, TransportError> {
        self.active_reads.fetch_add(1, Ordering::SeqCst);
        let _guard = ReadGuard(Arc::clone(&self.active_reads));
        let give_up = Instant::now() + timeout;

        loop {
            let wake = {
                let mut state = lock(&self.state);
                Self::ensure_open(&state)?;
                let now = Instant::now();
                let eof_at = state.eof_at;
                let queue = state.queue(stream);
                match queue.front().map(|(at, _)| *at) {
                    Some(at) if at <= now => {
                        let (at, mut data) = queue.pop_front().unwrap_or((at, Bytes::new()));
                        if data.len() > max_bytes {
                            let rest = data.split_off(max_bytes);
                            queue.push_front((at, rest));
                        }
                        return Ok(Recv::Data(data));
                    }
                    Some(at) => at,
                    None => match eof_at {
                        Some(eof) if eof <= now => return Ok(Recv::Eof),
                        Some(eof) => eof,
                        None => give_up,
                    },
                }
            };

            if Instant::now() >= give_up {
                return Ok(Recv::Empty);
            }
            sleep_until(wake.min(give_up)).await;
        }
    }

    async fn ready_to_send(&self) -> Result<bool, TransportError> {
        let state = lock(&self.state);
        Self::ensure_open(&state)?;
        Ok(self.settings.send_ready && !state.exited)
    }

    async fn exit_status_ready(&self) -> Result<bool, TransportError> {
        let state = lock(&self.state);
        Ok(state.eof_at.is_some_and(|eof| eof <= Instant::now()))
    }

    async fn exit_status(&self) -> Result<i32, TransportError> {
        let eof_at = {
            let state = lock(&self.state);
            state.eof_at
        };
        let Some(eof_at) = eof_at else {
            return Err(TransportError::Protocol("process has not exited".to_string()));
        };
        sleep_until(eof_at).await;
        lock(&self.state)
            .exit_status
            .ok_or_else(|| TransportError::Protocol("no exit status reported".to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.closed {
            state.closed = true;
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        let state = lock(&self.state);
        state.closed || state.exited
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir { mode: u32 },
    File { data: Bytes, mode: u32 },
    Symlink { target: PathBuf },
}

impl Node {
    fn metadata(&self) -> RemoteMetadata {
        let (kind, mode, size) = match self {
            Node::Dir { mode } => (0o040000, *mode, 0),
            Node::File { data, mode } => (0o100000, *mode, data.len() as u64),
            Node::Symlink { target } => (0o120000, 0o777, target.as_os_str().len() as u64),
        };
        RemoteMetadata {
            size: Some(size),
            uid: Some(1000),
            gid: Some(1000),
            perm: Some(kind | (mode & 0o7777)),
            atime: Some(0),
            mtime: Some(0),
        }
    }
}

/// In-memory [`RemoteFilesystem`] rooted at `/`, starting in `/home/mock`
pub struct MemoryFilesystem {
    nodes: Mutex<BTreeMap<PathBuf, Node>>,
    cwd: Mutex<PathBuf>,
}

impl Default for MemoryFilesystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFilesystem {
    /// Filesystem containing `/`, `/home` and `/home/mock`
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        for dir in ["/", "/home", "/home/mock"] {
            nodes.insert(PathBuf::from(dir), Node::Dir { mode: 0o755 });
        }
        Self {
            nodes: Mutex::new(nodes),
            cwd: Mutex::new(PathBuf::from("/home/mock")),
        }
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        normalize(&resolve_path(&lock(&self.cwd), path))
    }

    fn not_found(path: &Path) -> TransportError {
        TransportError::NotFound(path.display().to_string())
    }

    fn follow(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> Result<(PathBuf, Node), TransportError> {
        let mut current = path.to_path_buf();
        for _ in 0..32 {
            match nodes.get(&current) {
                Some(Node::Symlink { target }) => {
                    let parent = current.parent().unwrap_or(Path::new("/")).to_path_buf();
                    current = normalize(&resolve_path(&parent, target));
                }
                Some(node) => return Ok((current, node.clone())),
                None => return Err(Self::not_found(path)),
            }
        }
        Err(TransportError::Sftp(format!("too many links: {}", path.display())))
    }

    fn require_parent(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> Result<(), TransportError> {
        let parent = path.parent().unwrap_or(Path::new("/"));
        match Self::follow(nodes, parent)? {
            (_, Node::Dir { .. }) => Ok(()),
            _ => Err(TransportError::Sftp(format!("not a directory: {}", parent.display()))),
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
            _ => {}
        }
    }
    out
}

#[async_trait]
impl RemoteFilesystem for MemoryFilesystem {
    async fn chdir(&self, path: &Path) -> Result<(), TransportError> {
        let target = self.absolute(path);
        let (resolved, node) = Self::follow(&lock(&self.nodes), &target)?;
        if !matches!(node, Node::Dir { .. }) {
            return Err(TransportError::Sftp(format!("not a directory: {}", target.display())));
        }
        *lock(&self.cwd) = resolved;
        Ok(())
    }

    async fn getcwd(&self) -> Result<PathBuf, TransportError> {
        Ok(lock(&self.cwd).clone())
    }

    async fn stat(&self, path: &Path) -> Result<RemoteMetadata, TransportError> {
        let path = self.absolute(path);
        Self::follow(&lock(&self.nodes), &path).map(|(_, node)| node.metadata())
    }

    async fn lstat(&self, path: &Path) -> Result<RemoteMetadata, TransportError> {
        let path = self.absolute(path);
        lock(&self.nodes)
            .get(&path)
            .map(Node::metadata)
            .ok_or_else(|| Self::not_found(&path))
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, TransportError> {
        let path = self.absolute(path);
        let nodes = lock(&self.nodes);
        let (dir, node) = Self::follow(&nodes, &path)?;
        if !matches!(node, Node::Dir { .. }) {
            return Err(TransportError::Sftp(format!("not a directory: {}", path.display())));
        }
        Ok(nodes
            .iter()
            .filter(|(child, _)| child.parent() == Some(dir.as_path()) && **child != dir)
            .map(|(child, node)| DirEntry {
                path: child.clone(),
                metadata: node.metadata(),
            })
            .collect())
    }

    async fn mkdir(&self, path: &Path, mode: i32) -> Result<(), TransportError> {
        let path = self.absolute(path);
        let mut nodes = lock(&self.nodes);
        Self::require_parent(&nodes, &path)?;
        if nodes.contains_key(&path) {
            return Err(TransportError::Sftp(format!("file exists: {}", path.display())));
        }
        nodes.insert(path, Node::Dir { mode: mode as u32 });
        Ok(())
    }

    async fn rmdir(&self, path: &Path) -> Result<(), TransportError> {
        let path = self.absolute(path);
        let mut nodes = lock(&self.nodes);
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {}
            Some(_) => return Err(TransportError::Sftp(format!("not a directory: {}", path.display()))),
            None => return Err(Self::not_found(&path)),
        }
        if nodes.keys().any(|child| child.parent() == Some(path.as_path()) && *child != path) {
            return Err(TransportError::Sftp(format!("directory not empty: {}", path.display())));
        }
        nodes.remove(&path);
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<(), TransportError> {
        let path = self.absolute(path);
        let mut nodes = lock(&self.nodes);
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => Err(TransportError::Sftp(format!("is a directory: {}", path.display()))),
            Some(_) => {
                nodes.remove(&path);
                Ok(())
            }
            None => Err(Self::not_found(&path)),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), TransportError> {
        let from = self.absolute(from);
        let to = self.absolute(to);
        let mut nodes = lock(&self.nodes);
        Self::require_parent(&nodes, &to)?;
        let moved: Vec<PathBuf> = nodes.keys().filter(|p| p.starts_with(&from)).cloned().collect();
        if moved.is_empty() {
            return Err(Self::not_found(&from));
        }
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let suffix = old.strip_prefix(&from).unwrap_or(Path::new(""));
                let new = if suffix.as_os_str().is_empty() { to.clone() } else { to.join(suffix) };
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn symlink(&self, target: &Path, path: &Path) -> Result<(), TransportError> {
        let path = self.absolute(path);
        let mut nodes = lock(&self.nodes);
        Self::require_parent(&nodes, &path)?;
        nodes.insert(path, Node::Symlink { target: target.to_path_buf() });
        Ok(())
    }

    async fn readlink(&self, path: &Path) -> Result<PathBuf, TransportError> {
        let path = self.absolute(path);
        match lock(&self.nodes).get(&path) {
            Some(Node::Symlink { target }) => Ok(target.clone()),
            Some(_) => Err(TransportError::Sftp(format!("not a symlink: {}", path.display()))),
            None => Err(Self::not_found(&path)),
        }
    }

    async fn realpath(&self, path: &Path) -> Result<PathBuf, TransportError> {
        let path = self.absolute(path);
        Self::follow(&lock(&self.nodes), &path).map(|(resolved, _)| resolved)
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), TransportError> {
        let path = self.absolute(path);
        let mut nodes = lock(&self.nodes);
        let (resolved, _) = Self::follow(&nodes, &path)?;
        match nodes.get_mut(&resolved) {
            Some(Node::Dir { mode: current }) | Some(Node::File { mode: current, .. }) => {
                *current = mode & 0o7777;
                Ok(())
            }
            _ => Err(Self::not_found(&path)),
        }
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes, TransportError> {
        let path = self.absolute(path);
        match Self::follow(&lock(&self.nodes), &path)? {
            (_, Node::File { data, .. }) => Ok(data),
            _ => Err(TransportError::Sftp(format!("not a file: {}", path.display()))),
        }
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<u64, TransportError> {
        let path = self.absolute(path);
        let mut nodes = lock(&self.nodes);
        Self::require_parent(&nodes, &path)?;
        if matches!(nodes.get(&path), Some(Node::Dir { .. })) {
            return Err(TransportError::Sftp(format!("is a directory: {}", path.display())));
        }
        nodes.insert(
            path,
            Node::File {
                data: Bytes::copy_from_slice(data),
                mode: 0o644,
            },
        );
        Ok(data.len() as u64)
    }
}

/// Hands the connection's filesystem out behind a `Box`
struct SharedFilesystem(Arc<MemoryFilesystem>);

#[async_trait]
impl RemoteFilesystem for SharedFilesystem {
    async fn chdir(&self, path: &Path) -> Result<(), TransportError> {
        self.0.chdir(path).await
    }
    async fn getcwd(&self) -> Result<PathBuf, TransportError> {
        self.0.getcwd().await
    }
    async fn stat(&self, path: &Path) -> Result<RemoteMetadata, TransportError> {
        self.0.stat(path).await
    }
    async fn lstat(&self, path: &Path) -> Result<RemoteMetadata, TransportError> {
        self.0.lstat(path).await
    }
    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, TransportError> {
        self.0.list_dir(path).await
    }
    async fn mkdir(&self, path: &Path, mode: i32) -> Result<(), TransportError> {
        self.0.mkdir(path, mode).await
    }
    async fn rmdir(&self, path: &Path) -> Result<(), TransportError> {
        self.0.rmdir(path).await
    }
    async fn remove(&self, path: &Path) -> Result<(), TransportError> {
        self.0.remove(path).await
    }
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), TransportError> {
        self.0.rename(from, to).await
    }
    async fn symlink(&self, target: &Path, path: &Path) -> Result<(), TransportError> {
        self.0.symlink(target, path).await
    }
    async fn readlink(&self, path: &Path) -> Result<PathBuf, TransportError> {
        self.0.readlink(path).await
    }
    async fn realpath(&self, path: &Path) -> Result<PathBuf, TransportError> {
        self.0.realpath(path).await
    }
    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), TransportError> {
        self.0.chmod(path, mode).await
    }
    async fn read_file(&self, path: &Path) -> Result<Bytes, TransportError> {
        self.0.read_file(path).await
    }
    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<u64, TransportError> {
        self.0.write_file(path, data).await
    }
}

/// Mock state is plain data, so a poisoned lock is still usable
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(channel: &dyn Channel, stream: StreamKind) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match channel.recv(stream, 1024, Duration::from_millis(50)).await.unwrap() {
                Recv::Data(data) => out.extend_from_slice(&data),
                Recv::Empty => return out,
                Recv::Eof => return out,
            }
        }
    }

    #[tokio::test]
    async fn test_mock_shell_echo_and_status() {
        let connection = MockConnection::new();
        let channel = connection.open_shell_channel().await.unwrap();

        channel.send_all(b"false\necho done $?\n").await.unwrap();
        let out = read_all(channel.as_ref(), StreamKind::Stdout).await;
        assert_eq!(out, b"done 1\n");
    }

    #[tokio::test]
    async fn test_mock_shell_unknown_command() {
        let connection = MockConnection::new();
        let channel = connection.open_shell_channel().await.unwrap();

        channel.send_all(b"frobnicate --now\necho $?\n").await.unwrap();
        assert_eq!(read_all(channel.as_ref(), StreamKind::Stdout).await, b"127\n");
        let err = read_all(channel.as_ref(), StreamKind::Stderr).await;
        assert_eq!(err, b"sh: frobnicate: command not found\n");
    }

    #[tokio::test]
    async fn test_mock_exec_cat_and_eof() {
        let connection = MockConnection::new();
        let channel = connection.open_exec_channel().await.unwrap();

        channel.exec("cat").await.unwrap();
        channel.send_all(b"payload").await.unwrap();
        channel.send_eof().await.unwrap();

        assert_eq!(read_all(channel.as_ref(), StreamKind::Stdout).await, b"payload");
        assert_eq!(
            channel.recv(StreamKind::Stdout, 16, Duration::from_millis(10)).await.unwrap(),
            Recv::Eof
        );
        assert!(channel.exit_status_ready().await.unwrap());
        assert_eq!(channel.exit_status().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mock_recv_splits_large_chunks() {
        let transport = MockTransport::new().with_handler(|_| MockOutput::stdout("abcdef"));
        let connection = transport.connect().await.unwrap();
        let channel = connection.open_exec_channel().await.unwrap();
        channel.exec("produce").await.unwrap();
        channel.send_eof().await.unwrap();

        let first = channel.recv(StreamKind::Stdout, 4, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first, Recv::Data(Bytes::from_static(b"abcd")));
        let second = channel.recv(StreamKind::Stdout, 4, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second, Recv::Data(Bytes::from_static(b"ef")));
    }

    #[tokio::test]
    async fn test_mock_close_is_counted_once() {
        let connection = MockConnection::new();
        let channel = connection.open_exec_channel().await.unwrap();
        channel.close().await.unwrap();
        channel.close().await.unwrap();

        let mock = connection.last_channel().unwrap();
        assert_eq!(mock.close_count(), 1);
        assert!(channel.is_closed());
        assert!(matches!(
            channel.send(b"x").await,
            Err(TransportError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_memory_filesystem_basics() {
        let fs = MemoryFilesystem::new();
        assert_eq!(fs.getcwd().await.unwrap(), PathBuf::from("/home/mock"));

        fs.mkdir(Path::new("data"), 0o700).await.unwrap();
        fs.write_file(Path::new("data/a.txt"), b"hello").await.unwrap();
        assert_eq!(fs.read_file(Path::new("/home/mock/data/a.txt")).await.unwrap(), Bytes::from_static(b"hello"));

        fs.chdir(Path::new("data")).await.unwrap();
        let entries = fs.list_dir(Path::new(".")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_name(), Some("a.txt"));

        fs.symlink(Path::new("a.txt"), Path::new("link")).await.unwrap();
        assert!(fs.lstat(Path::new("link")).await.unwrap().is_symlink());
        assert!(fs.stat(Path::new("link")).await.unwrap().is_file());

        assert!(!fs.exists(Path::new("missing")).await.unwrap());
        assert!(fs.rmdir(Path::new("/home/mock/data")).await.is_err());
    }
}
