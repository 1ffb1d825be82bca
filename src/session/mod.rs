//! Sessions: one logical connection with failover, transaction and
//! savepoint state.

pub mod config;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::pipeline::{Dispatcher, Reply, ReplyFuture, ResponseShape};
use crate::protocol::{codec, Command};

pub use config::{HostInfo, SessionConfig, SslMode, TlsOptions};

/// Session-local state guarded by a short-lived lock.
#[derive(Debug, Default)]
struct SessionState {
    tx_active: bool,
    /// Insertion-ordered savepoint names; the server stays authoritative.
    savepoints: Vec<String>,
}

/// One logical connection to a CoralDB deployment.
///
/// A session owns exactly one physical connection, selected from the
/// configured host list by priority, and multiplexes all statement and
/// control traffic over it through a FIFO pipeline. Cloning is deliberately
/// not offered; share a session behind an `Arc` to submit concurrently.
#[derive(Debug)]
pub struct Session {
    dispatcher: Dispatcher,
    config: SessionConfig,
    connected: HostInfo,
    session_id: String,
    state: Mutex<SessionState>,
    next_stmt_id: AtomicU32,
    closed: AtomicBool,
}

impl Session {
    /// Connect using a connection string (see [`config`] for the forms).
    pub async fn connect(url: &str) -> Result<Self> {
        Self::with_config(SessionConfig::from_url(url)?).await
    }

    /// Connect using an already-resolved configuration.
    ///
    /// Hosts are tried in descending priority order, each attempt with the
    /// full connect timeout. A communications failure advances to the next
    /// candidate; a server-side authentication rejection aborts the scan.
    pub async fn with_config(mut config: SessionConfig) -> Result<Self> {
        if config.hosts.is_empty() {
            return Err(Error::Usage("no hosts configured".to_string()));
        }
        config.hosts.sort_by(|a, b| b.priority.cmp(&a.priority));

        let candidates = config.hosts.clone();
        let mut last_err: Option<Error> = None;
        for host in &candidates {
            match Connection::open(&host.host, host.port, &config.tls, config.connect_timeout)
                .await
            {
                Ok(mut conn) => {
                    match conn
                        .authenticate(&config.schema, &config.username, &config.password)
                        .await
                    {
                        Ok(session_id) => {
                            tracing::info!(
                                "session {} established with {}:{}",
                                session_id,
                                host.host,
                                host.port
                            );
                            return Ok(Self {
                                dispatcher: Dispatcher::spawn(conn),
                                connected: host.clone(),
                                session_id,
                                state: Mutex::new(SessionState::default()),
                                next_stmt_id: AtomicU32::new(1),
                                closed: AtomicBool::new(false),
                                config,
                            });
                        }
                        Err(e @ Error::Server { .. }) => return Err(e),
                        Err(e) => {
                            tracing::warn!(
                                "authentication with {}:{} failed: {}",
                                host.host,
                                host.port,
                                e
                            );
                            last_err = Some(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("connection to {}:{} failed: {}", host.host, host.port, e);
                    last_err = Some(e);
                }
            }
        }

        let attempts = candidates.len();
        Err(Error::Communications(match last_err {
            Some(e) => format!("all {} candidate hosts failed, last error: {}", attempts, e),
            None => format!("all {} candidate hosts failed", attempts),
        }))
    }

    /// The schema this session authenticated against.
    pub fn schema(&self) -> &str {
        &self.config.schema
    }

    /// Server-assigned session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The host this session is connected to.
    pub fn connected_host(&self) -> &HostInfo {
        &self.connected
    }

    /// Whether a transaction is currently active.
    pub fn in_transaction(&self) -> bool {
        self.state.lock().tx_active
    }

    // ==================== Pipeline plumbing ====================

    pub(crate) async fn submit_command(
        &self,
        cmd: &Command,
        shape: ResponseShape,
    ) -> Result<ReplyFuture> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        let frame = codec::encode_command(cmd)?;
        self.dispatcher.submit(frame, shape).await
    }

    async fn execute_ack(&self, cmd: Command) -> Result<()> {
        let fut = self.submit_command(&cmd, ResponseShape::Ack).await?;
        match fut.await? {
            Reply::Ack | Reply::Pong { .. } => Ok(()),
            other => Err(Error::Communications(format!(
                "unexpected reply to control command: {:?}",
                other
            ))),
        }
    }

    pub(crate) fn allocate_stmt_id(&self) -> u32 {
        self.next_stmt_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_fallback_code(&self, code: u16) -> bool {
        self.config.prepare_fallback_codes.contains(&code)
    }

    // ==================== Utility ====================

    /// Round trip a ping; returns the server timestamp.
    pub async fn ping(&self) -> Result<i64> {
        let fut = self.submit_command(&Command::Ping, ResponseShape::Ack).await?;
        match fut.await? {
            Reply::Pong { timestamp } => Ok(timestamp),
            other => Err(Error::Communications(format!(
                "unexpected reply to ping: {:?}",
                other
            ))),
        }
    }

    /// Close the session. All in-flight requests fail with
    /// [`Error::SessionClosed`]; idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("closing session {}", self.session_id);
        self.dispatcher.shutdown();
    }

    // ==================== Transactions ====================

    /// Begin a transaction. At most one may be active per session.
    pub async fn start_transaction(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.tx_active {
                return Err(Error::Usage("transaction already in progress".to_string()));
            }
            state.tx_active = true;
        }
        match self.execute_ack(Command::Begin).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.lock().tx_active = false;
                Err(e)
            }
        }
    }

    /// Commit the active transaction.
    pub async fn commit(&self) -> Result<()> {
        self.require_transaction()?;
        self.execute_ack(Command::Commit).await?;
        let mut state = self.state.lock();
        state.tx_active = false;
        state.savepoints.clear();
        Ok(())
    }

    /// Roll back the active transaction.
    pub async fn rollback(&self) -> Result<()> {
        self.require_transaction()?;
        self.execute_ack(Command::Rollback).await?;
        let mut state = self.state.lock();
        state.tx_active = false;
        state.savepoints.clear();
        Ok(())
    }

    fn require_transaction(&self) -> Result<()> {
        if !self.state.lock().tx_active {
            return Err(Error::Usage("no active transaction".to_string()));
        }
        Ok(())
    }

    // ==================== Savepoints ====================

    /// Set a savepoint. With `None` a unique name is generated. Returns the
    /// effective name.
    pub async fn set_savepoint(&self, name: Option<&str>) -> Result<String> {
        let name = match name {
            Some(n) => Self::validated_name(n)?,
            None => format!("sp_{}", Uuid::new_v4().simple()),
        };
        self.execute_ack(Command::SetSavepoint { name: name.clone() })
            .await?;
        let mut state = self.state.lock();
        state.savepoints.retain(|s| s != &name);
        state.savepoints.push(name.clone());
        Ok(name)
    }

    /// Roll back to a savepoint; later savepoints are discarded, the target
    /// remains valid.
    pub async fn rollback_to(&self, name: &str) -> Result<()> {
        let name = Self::validated_name(name)?;
        self.execute_ack(Command::RollbackToSavepoint { name: name.clone() })
            .await?;
        let mut state = self.state.lock();
        if let Some(pos) = state.savepoints.iter().position(|s| s == &name) {
            state.savepoints.truncate(pos + 1);
        }
        Ok(())
    }

    /// Release a savepoint and every savepoint set after it.
    pub async fn release_savepoint(&self, name: &str) -> Result<()> {
        let name = Self::validated_name(name)?;
        self.execute_ack(Command::ReleaseSavepoint { name: name.clone() })
            .await?;
        let mut state = self.state.lock();
        if let Some(pos) = state.savepoints.iter().position(|s| s == &name) {
            state.savepoints.truncate(pos);
        }
        Ok(())
    }

    /// Empty names are a caller error, rejected before any round trip.
    fn validated_name(name: &str) -> Result<String> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(Error::Usage("savepoint name must not be empty".to_string()));
        }
        Ok(trimmed.to_string())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}

/// Fluent construction of a [`Session`] without a connection string.
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    /// Add a candidate host with default port and priority.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config
            .hosts
            .push(HostInfo::new(host, config::DEFAULT_PORT));
        self
    }

    /// Add a candidate host with explicit port and priority.
    pub fn address(mut self, host: impl Into<String>, port: u16, priority: u16) -> Self {
        self.config.hosts.push(HostInfo {
            host: host.into(),
            port,
            priority,
        });
        self
    }

    pub fn user(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.config.schema = schema.into();
        self
    }

    /// Per-host connect timeout. Zero means wait indefinitely.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.config.tls.mode = mode;
        self
    }

    pub fn ssl_ca(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.config.tls.ca_path = Some(path.into());
        self
    }

    /// Replace the fallback-eligible prepare error codes.
    pub fn prepare_fallback_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.config.prepare_fallback_codes = codes.into_iter().collect();
        self
    }

    pub async fn connect(self) -> Result<Session> {
        Session::with_config(self.config).await
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
