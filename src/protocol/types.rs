use serde::{Deserialize, Serialize};

/// Metadata for one column of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,
}

impl Column {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: None,
            type_hint: None,
        }
    }
}

/// Severity of a statement warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    Note,
    Warning,
    Error,
}

/// A warning attached to a completed statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub level: WarningLevel,
    pub code: u16,
    pub message: String,
}

/// Well-known server error codes.
pub mod error_codes {
    pub const UNKNOWN_COLLECTION: u16 = 1100;
    pub const DUPLICATE_KEY: u16 = 1200;
    pub const BAD_STATEMENT: u16 = 1300;
    pub const SAVEPOINT_NOT_FOUND: u16 = 1400;
    pub const NO_ACTIVE_TRANSACTION: u16 = 1401;
    pub const MAX_PREPARED_REACHED: u16 = 1500;
    pub const PREPARE_UNSUPPORTED: u16 = 1501;
    pub const UNAUTHENTICATED: u16 = 1600;
    pub const ACCESS_DENIED: u16 = 1601;
}
