//! Statement construction and execution.
//!
//! One [`Statement`] object represents one logical statement across repeated
//! executions. The driver decides per execution whether to send it one-shot
//! or through a server-side prepared slot:
//!
//! - the first execution is always one-shot;
//! - a second execution with an unchanged shape attempts a server prepare
//!   and, on success, switches to prepared execution for all further calls;
//! - a prepare refused with a fallback-eligible error code (server slot cap
//!   reached, prepare unsupported) silently degrades the statement to
//!   one-shot for the rest of its life;
//! - any shape mutation deallocates a live slot and restarts the cycle.
//!
//! Only bound values may change without invalidating the slot.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::task::{Context, Poll};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::pipeline::{Reply, ReplyFuture, ResponseShape};
use crate::protocol::{Command, StatementOp, StatementPayload};
use crate::result::StatementResult;
use crate::session::Session;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").unwrap_or_else(|e| panic!("invalid regex: {}", e))
});

/// Prepared-statement lifecycle of one statement object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrepareState {
    /// No slot; `executions` one-shot runs of the current shape so far.
    Initial { executions: u32 },
    /// Bound to a server-side slot.
    Prepared { stmt_id: u32, execution_count: u64 },
    /// The server refused to prepare; one-shot for the statement's lifetime
    /// unless the shape changes.
    Fallback,
}

/// A reusable statement: structural shape plus bound values.
pub struct Statement {
    op: StatementOp,
    collection: Option<String>,
    criteria: Option<String>,
    projection: Vec<String>,
    sort: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    rows: Vec<Value>,
    patch: Option<Value>,
    sql: Option<String>,
    binds: HashMap<String, Value>,
    state: PrepareState,
    last_shape: Option<u64>,
    stale_slots: Vec<u32>,
}

impl Statement {
    fn new(op: StatementOp, collection: Option<String>, sql: Option<String>) -> Self {
        Self {
            op,
            collection,
            criteria: None,
            projection: Vec::new(),
            sort: Vec::new(),
            limit: None,
            offset: None,
            rows: Vec::new(),
            patch: None,
            sql,
            binds: HashMap::new(),
            state: PrepareState::Initial { executions: 0 },
            last_shape: None,
            stale_slots: Vec::new(),
        }
    }

    /// Find documents in a collection.
    pub fn find(collection: impl Into<String>) -> Self {
        Self::new(StatementOp::Find, Some(collection.into()), None)
    }

    /// Insert documents into a collection.
    pub fn insert(collection: impl Into<String>) -> Self {
        Self::new(StatementOp::Insert, Some(collection.into()), None)
    }

    /// Update documents matching a criteria.
    pub fn update(collection: impl Into<String>) -> Self {
        Self::new(StatementOp::Update, Some(collection.into()), None)
    }

    /// Delete documents matching a criteria.
    pub fn delete(collection: impl Into<String>) -> Self {
        Self::new(StatementOp::Delete, Some(collection.into()), None)
    }

    /// An opaque SQL statement.
    pub fn sql(text: impl Into<String>) -> Self {
        Self::new(StatementOp::Sql, None, Some(text.into()))
    }

    // ==================== Shape mutators ====================

    /// Selection criteria with optional `:name` placeholders.
    pub fn filter(&mut self, criteria: impl Into<String>) -> &mut Self {
        self.criteria = Some(criteria.into());
        self
    }

    /// Restrict returned fields.
    pub fn project(&mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.projection = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sort specification, e.g. `["age desc", "name"]`.
    pub fn sort(&mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.sort = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.offset = Some(offset);
        self
    }

    /// Add one document to an insert statement.
    pub fn add_row(&mut self, row: Value) -> &mut Self {
        self.rows.push(row);
        self
    }

    /// Patch document for an update statement.
    pub fn patch(&mut self, patch: Value) -> &mut Self {
        self.patch = Some(patch);
        self
    }

    // ==================== Values ====================

    /// Bind a placeholder value. Never invalidates a prepared slot.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.binds.insert(name.into(), value);
        self
    }

    // ==================== Execution ====================

    /// Execute and wait for the result.
    pub async fn execute(&mut self, session: &Session) -> Result<StatementResult> {
        self.submit(session).await?.await
    }

    /// Submit for execution and return immediately with a future for the
    /// result. The request is on the wire (or queued behind the session's
    /// writer) when this returns.
    pub async fn submit(&mut self, session: &Session) -> Result<PendingExecution> {
        let placeholders = self.placeholders();
        self.validate_binds(&placeholders)?;
        self.refresh_shape();
        self.flush_stale_slots(session).await;

        enum Action {
            OneShot,
            TryPrepare,
            ExecPrepared(u32),
        }

        let action = match self.state {
            PrepareState::Initial { executions: 0 } => Action::OneShot,
            PrepareState::Initial { .. } => Action::TryPrepare,
            PrepareState::Prepared { stmt_id, .. } => Action::ExecPrepared(stmt_id),
            PrepareState::Fallback => Action::OneShot,
        };

        match action {
            Action::OneShot => {
                if let PrepareState::Initial { executions } = &mut self.state {
                    *executions += 1;
                }
                self.submit_one_shot(session).await
            }
            Action::TryPrepare => {
                let stmt_id = session.allocate_stmt_id();
                let prepare = Command::Prepare {
                    stmt_id,
                    stmt: self.prepare_payload(session.schema(), &placeholders),
                };
                let fut = session.submit_command(&prepare, ResponseShape::Ack).await?;
                match fut.await {
                    Ok(_) => {
                        tracing::debug!("statement prepared in slot {}", stmt_id);
                        self.state = PrepareState::Prepared {
                            stmt_id,
                            execution_count: 0,
                        };
                        self.submit_prepared(session, stmt_id, &placeholders).await
                    }
                    Err(Error::Server { code, message }) if session.is_fallback_code(code) => {
                        tracing::warn!(
                            "prepare refused with code {} ({}), falling back to one-shot",
                            code,
                            message
                        );
                        self.state = PrepareState::Fallback;
                        self.submit_one_shot(session).await
                    }
                    Err(e) => Err(e),
                }
            }
            Action::ExecPrepared(stmt_id) => {
                if let PrepareState::Prepared {
                    execution_count, ..
                } = &mut self.state
                {
                    *execution_count += 1;
                }
                self.submit_prepared(session, stmt_id, &placeholders).await
            }
        }
    }

    async fn submit_one_shot(&self, session: &Session) -> Result<PendingExecution> {
        let mut stmt = self.base_payload(session.schema());
        stmt.args = self.binds.clone();
        let cmd = Command::StmtExecute { stmt };
        let fut = session.submit_command(&cmd, ResponseShape::Rows).await?;
        Ok(PendingExecution { inner: fut })
    }

    async fn submit_prepared(
        &self,
        session: &Session,
        stmt_id: u32,
        placeholders: &[String],
    ) -> Result<PendingExecution> {
        let args = placeholders
            .iter()
            .map(|p| self.binds.get(p).cloned().unwrap_or(Value::Null))
            .collect();
        let cmd = Command::ExecutePrepared { stmt_id, args };
        let fut = session.submit_command(&cmd, ResponseShape::Rows).await?;
        Ok(PendingExecution { inner: fut })
    }

    /// Detect a shape change since the previous execution and restart the
    /// prepare cycle, retiring a live slot.
    fn refresh_shape(&mut self) {
        let sig = self.shape_signature();
        if self.last_shape != Some(sig) {
            if let PrepareState::Prepared { stmt_id, .. } = self.state {
                self.stale_slots.push(stmt_id);
            }
            if self.last_shape.is_some() {
                self.state = PrepareState::Initial { executions: 0 };
            }
            self.last_shape = Some(sig);
        }
    }

    /// Deallocate retired slots. Failures are ignored: on a dead session the
    /// slots are already gone.
    async fn flush_stale_slots(&mut self, session: &Session) {
        for stmt_id in self.stale_slots.drain(..) {
            let cmd = Command::DeallocatePrepared { stmt_id };
            if let Ok(fut) = session.submit_command(&cmd, ResponseShape::Ack).await {
                drop(fut);
            }
        }
    }

    fn base_payload(&self, schema: &str) -> StatementPayload {
        let mut stmt = StatementPayload::new(self.op, schema);
        stmt.collection = self.collection.clone();
        stmt.criteria = self.criteria.clone();
        stmt.projection = self.projection.clone();
        stmt.sort = self.sort.clone();
        stmt.limit = self.limit;
        stmt.offset = self.offset;
        stmt.rows = self.rows.clone();
        stmt.patch = self.patch.clone();
        stmt.sql = self.sql.clone();
        stmt
    }

    fn prepare_payload(&self, schema: &str, placeholders: &[String]) -> StatementPayload {
        let mut stmt = self.base_payload(schema);
        stmt.placeholders = placeholders.to_vec();
        stmt
    }

    /// Placeholders referenced by this statement, in first-occurrence order.
    fn placeholders(&self) -> Vec<String> {
        let mut names = Vec::new();
        for text in [self.criteria.as_deref(), self.sql.as_deref()]
            .into_iter()
            .flatten()
        {
            for cap in PLACEHOLDER_RE.captures_iter(text) {
                if let Some(name) = cap.get(1) {
                    let name = name.as_str();
                    if !names.iter().any(|n| n == name) {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names
    }

    fn validate_binds(&self, placeholders: &[String]) -> Result<()> {
        for name in placeholders {
            if !self.binds.contains_key(name) {
                return Err(Error::Usage(format!(
                    "placeholder ':{}' is referenced but never bound",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Structural signature excluding bound values.
    fn shape_signature(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.op.hash(&mut hasher);
        self.collection.hash(&mut hasher);
        self.criteria.hash(&mut hasher);
        self.projection.hash(&mut hasher);
        self.sort.hash(&mut hasher);
        self.limit.hash(&mut hasher);
        self.offset.hash(&mut hasher);
        self.sql.hash(&mut hasher);
        // Value is not Hash; canonical JSON stands in for document content
        for row in &self.rows {
            row.to_string().hash(&mut hasher);
        }
        self.patch.as_ref().map(|p| p.to_string()).hash(&mut hasher);
        hasher.finish()
    }
}

/// Future for a submitted statement execution.
///
/// Holding this handle is the asynchronous execution path; awaiting it
/// immediately is the synchronous one. Both travel the same pipeline.
pub struct PendingExecution {
    inner: ReplyFuture,
}

impl Future for PendingExecution {
    type Output = Result<StatementResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(Reply::Result(data))) => Poll::Ready(Ok(StatementResult::new(data))),
            Poll::Ready(Ok(_)) => Poll::Ready(Err(Error::Communications(
                "unexpected reply to statement execution".to_string(),
            ))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}
