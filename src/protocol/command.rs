use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Commands sent from the client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Authenticate against a schema.
    Auth {
        schema: String,
        username: String,
        password: String,
    },

    /// Keep-alive round trip.
    Ping,

    /// Execute a statement one-shot, bound values inline.
    StmtExecute { stmt: StatementPayload },

    /// Register a server-side prepared statement under a client-chosen id.
    /// The payload carries the placeholder order instead of bound values.
    Prepare { stmt_id: u32, stmt: StatementPayload },

    /// Execute a previously prepared statement with fresh bound values,
    /// given in the placeholder order declared at prepare time.
    ExecutePrepared { stmt_id: u32, args: Vec<Value> },

    /// Release a server-side prepared statement slot.
    DeallocatePrepared { stmt_id: u32 },

    // ==================== Transaction control ====================
    Begin,
    Commit,
    Rollback,

    SetSavepoint { name: String },
    RollbackToSavepoint { name: String },
    ReleaseSavepoint { name: String },
}

/// The operation a statement performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementOp {
    Find,
    Insert,
    Update,
    Delete,
    Sql,
}

/// The structural form of a statement as it travels on the wire.
///
/// Everything here except `args` is part of the statement's shape; `args`
/// carries bound values for one-shot execution and stays empty for prepared
/// registration, where `placeholders` fixes the argument order instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementPayload {
    pub op: StatementOp,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projection: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Documents for insert operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Value>,
    /// Patch document for update operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Value>,
    /// Statement text for SQL operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    /// Bound values by placeholder name (one-shot execution only).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, Value>,
    /// Placeholder order for later `ExecutePrepared` calls (prepare only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub placeholders: Vec<String>,
}

impl StatementPayload {
    /// A bare payload for the given operation and schema.
    pub fn new(op: StatementOp, schema: impl Into<String>) -> Self {
        Self {
            op,
            schema: schema.into(),
            collection: None,
            criteria: None,
            projection: Vec::new(),
            sort: Vec::new(),
            limit: None,
            offset: None,
            rows: Vec::new(),
            patch: None,
            sql: None,
            args: HashMap::new(),
            placeholders: Vec::new(),
        }
    }
}
