//! The driver contract
//!
//! One `DriverConnection` per daemon, holding one authenticated backend
//! session; `DriverCursor`s are forward-only and owned by that
//! connection. Every operation returns `DriverResult` with the payload
//! from [`crate::DriverError`].

use std::collections::HashMap;

use crate::error::DriverResult;
use crate::types::{ColumnInfo, Row};
use sqlrelay_protocol::binds::BindValue;

/// How the backend spells bind-variable placeholders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindFormat {
    /// `?`
    QuestionMark,
    /// `:1`, `:name`
    ColonName,
    /// `@name`
    AtName,
}

impl BindFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuestionMark => "?",
            Self::ColonName => ":n",
            Self::AtName => "@name",
        }
    }
}

/// Optional capabilities, queried once at log-in time
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverCapabilities {
    /// Native transaction blocks (`begin`); when false the daemon may
    /// simulate them by toggling autocommit
    pub transaction_blocks: bool,
    /// Driver can produce a parsed query tree
    pub query_tree: bool,
    /// Driver supports streaming writes of lob binds
    pub streaming_lobs: bool,
    /// Driver answers table-list calls natively; otherwise the core
    /// composes a query
    pub native_table_lists: bool,
    /// Server-side cursors for stored procedure output
    pub server_cursors: bool,
}

/// One authenticated backend session
pub trait DriverConnection: Send + std::fmt::Debug {
    // --- session ---------------------------------------------------

    /// Open the backend session with driver-specific parameters
    fn connect(&mut self, params: &HashMap<String, String>) -> DriverResult<()>;
    fn log_out(&mut self);
    /// Cheap liveness probe between client sessions
    fn ping(&mut self) -> DriverResult<()>;
    /// Short backend name, e.g. "oracle"
    fn identify(&self) -> &'static str;
    fn db_version(&mut self) -> DriverResult<String>;
    fn server_version(&mut self) -> DriverResult<String>;
    fn bind_format(&self) -> BindFormat;
    fn capabilities(&self) -> DriverCapabilities;

    // --- transactions ----------------------------------------------

    fn autocommit(&mut self, on: bool) -> DriverResult<()>;
    fn begin(&mut self) -> DriverResult<()>;
    fn commit(&mut self) -> DriverResult<()>;
    fn rollback(&mut self) -> DriverResult<()>;

    // --- queries ---------------------------------------------------

    /// Prepare a statement on a fresh cursor
    fn prepare(&mut self, query: &[u8]) -> DriverResult<Box<dyn DriverCursor>>;

    // --- metadata --------------------------------------------------

    fn get_db_list(&mut self, wild: &str) -> DriverResult<Vec<String>>;
    fn get_table_list(&mut self, wild: &str) -> DriverResult<Vec<String>>;
    fn get_column_list(&mut self, table: &str, wild: &str) -> DriverResult<Vec<ColumnInfo>>;
    fn get_current_database(&mut self) -> DriverResult<String>;
    fn select_database(&mut self, name: &str) -> DriverResult<()>;
    fn get_last_insert_id(&mut self) -> DriverResult<u64>;
}

/// A prepared statement with a forward-only result set
pub trait DriverCursor: Send {
    /// Attach one input bind ahead of execution
    fn bind_input(&mut self, name: &str, value: &BindValue) -> DriverResult<()>;
    /// Declare one output bind ahead of execution
    fn define_output(&mut self, name: &str, value: &BindValue, max_size: u32) -> DriverResult<()>;
    /// Execute the prepared statement
    fn execute(&mut self) -> DriverResult<()>;
    /// Column metadata; valid after execute
    fn columns(&self) -> &[ColumnInfo];
    /// Next row, or `None` at end of result set
    fn fetch_row(&mut self) -> DriverResult<Option<Row>>;
    /// Total rows in the result set when the backend reports it
    fn row_count(&self) -> Option<u64>;
    /// Rows affected by DML when the backend reports it
    fn affected_rows(&self) -> Option<u64>;
    /// Post-execution value of an output bind
    fn output_value(&self, name: &str) -> Option<BindValue>;
    /// Discard any remaining rows and reset for re-execution
    fn abort(&mut self) -> DriverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_format_spelling() {
        assert_eq!(BindFormat::QuestionMark.as_str(), "?");
        assert_eq!(BindFormat::ColonName.as_str(), ":n");
        assert_eq!(BindFormat::AtName.as_str(), "@name");
    }
}
