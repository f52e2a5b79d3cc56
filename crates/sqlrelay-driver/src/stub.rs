//! The stub driver
//!
//! An in-memory backend for tests and bring-up. Behavior is scripted:
//! fixed tables answer selects, DML reports one affected row, output
//! binds return pre-seeded values, and failure injection covers the
//! disconnect/re-log-in paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{DriverError, DriverResult};
use crate::traits::{BindFormat, DriverCapabilities, DriverConnection, DriverCursor};
use crate::types::{ColumnInfo, ColumnType, Field, Row};
use sqlrelay_protocol::binds::BindValue;

/// One fixed table served by the stub
#[derive(Debug, Clone)]
pub struct StubTable {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

impl StubTable {
    pub fn new(name: &str, columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            rows,
        }
    }
}

/// Scripted behavior knobs
#[derive(Debug, Clone, Default)]
pub struct StubBehavior {
    /// Values returned for output binds, by bind name
    pub output_values: HashMap<String, BindValue>,
    /// Fail the next fetch with a connection-lost error after this many
    /// rows were returned
    pub fail_fetch_after: Option<usize>,
    /// Make `ping` fail until cleared; login still succeeds
    pub fail_ping: bool,
    /// Refuse the next `connect`
    pub fail_connect: bool,
    /// Value returned by `get_last_insert_id`
    pub last_insert_id: u64,
    /// Whether the stub claims native transaction blocks
    pub transaction_blocks: bool,
}

#[derive(Debug, Default)]
struct StubState {
    tables: Vec<StubTable>,
    behavior: StubBehavior,
    /// Every statement executed, in order; tests assert on this
    executed: Vec<String>,
    current_database: String,
    autocommit: bool,
    in_transaction: bool,
    connected: bool,
    logins: u64,
}

/// The stub driver connection
#[derive(Debug)]
pub struct StubDriver {
    state: Arc<Mutex<StubState>>,
}

impl StubDriver {
    pub fn new() -> Self {
        let state = StubState {
            current_database: "main".to_string(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_table(self, table: StubTable) -> Self {
        self.state.lock().unwrap().tables.push(table);
        self
    }

    pub fn with_behavior(self, behavior: StubBehavior) -> Self {
        self.state.lock().unwrap().behavior = behavior;
        self
    }

    /// Handle for scripting failures mid-test
    pub fn handle(&self) -> StubHandle {
        StubHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for StubDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle used by tests to adjust behavior while the daemon owns
/// the connection
#[derive(Clone)]
pub struct StubHandle {
    state: Arc<Mutex<StubState>>,
}

impl StubHandle {
    pub fn set_fail_ping(&self, fail: bool) {
        self.state.lock().unwrap().behavior.fail_ping = fail;
    }

    pub fn set_fail_fetch_after(&self, rows: Option<usize>) {
        self.state.lock().unwrap().behavior.fail_fetch_after = rows;
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn logins(&self) -> u64 {
        self.state.lock().unwrap().logins
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().unwrap().in_transaction
    }
}

fn not_connected() -> DriverError {
    DriverError::disconnected("stub: not connected")
}

impl DriverConnection for StubDriver {
    fn connect(&mut self, _params: &HashMap<String, String>) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.behavior.fail_connect {
            return Err(DriverError::disconnected("stub: connect refused"));
        }
        state.connected = true;
        state.logins += 1;
        Ok(())
    }

    fn log_out(&mut self) {
        self.state.lock().unwrap().connected = false;
    }

    fn ping(&mut self) -> DriverResult<()> {
        let state = self.state.lock().unwrap();
        if !state.connected || state.behavior.fail_ping {
            return Err(DriverError::disconnected("stub: ping failed"));
        }
        Ok(())
    }

    fn identify(&self) -> &'static str {
        "stub"
    }

    fn db_version(&mut self) -> DriverResult<String> {
        Ok("stub-1.0".to_string())
    }

    fn server_version(&mut self) -> DriverResult<String> {
        Ok(env!("CARGO_PKG_VERSION").to_string())
    }

    fn bind_format(&self) -> BindFormat {
        BindFormat::QuestionMark
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            transaction_blocks: self.state.lock().unwrap().behavior.transaction_blocks,
            native_table_lists: true,
            ..Default::default()
        }
    }

    fn autocommit(&mut self, on: bool) -> DriverResult<()> {
        self.state.lock().unwrap().autocommit = on;
        Ok(())
    }

    fn begin(&mut self) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.behavior.transaction_blocks {
            return Err(DriverError::recoverable(
                0,
                "0A000",
                "stub: transaction blocks not supported",
            ));
        }
        state.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.in_transaction = false;
        state.executed.push("commit".to_string());
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.in_transaction = false;
        state.executed.push("rollback".to_string());
        Ok(())
    }

    fn prepare(&mut self, query: &[u8]) -> DriverResult<Box<dyn DriverCursor>> {
        if !self.state.lock().unwrap().connected {
            return Err(not_connected());
        }
        let text = String::from_utf8_lossy(query).into_owned();
        debug!(query = %text, "stub prepared statement");
        Ok(Box::new(StubCursor {
            state: Arc::clone(&self.state),
            query: text,
            columns: Vec::new(),
            pending: Vec::new(),
            fetched: 0,
            affected: None,
            row_count: None,
            outputs: Vec::new(),
            output_values: HashMap::new(),
        }))
    }

    fn get_db_list(&mut self, wild: &str) -> DriverResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut dbs = vec![state.current_database.clone()];
        dbs.retain(|db| wild.is_empty() || db.contains(wild));
        Ok(dbs)
    }

    fn get_table_list(&mut self, wild: &str) -> DriverResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tables
            .iter()
            .map(|t| t.name.clone())
            .filter(|name| wild.is_empty() || name.contains(wild))
            .collect())
    }

    fn get_column_list(&mut self, table: &str, wild: &str) -> DriverResult<Vec<ColumnInfo>> {
        let state = self.state.lock().unwrap();
        let table = state
            .tables
            .iter()
            .find(|t| t.name == table)
            .ok_or_else(|| {
                DriverError::recoverable(1146, "42S02", format!("stub: no table '{}'", table))
            })?;
        Ok(table
            .columns
            .iter()
            .filter(|c| wild.is_empty() || c.name.contains(wild))
            .cloned()
            .collect())
    }

    fn get_current_database(&mut self) -> DriverResult<String> {
        Ok(self.state.lock().unwrap().current_database.clone())
    }

    fn select_database(&mut self, name: &str) -> DriverResult<()> {
        self.state.lock().unwrap().current_database = name.to_string();
        Ok(())
    }

    fn get_last_insert_id(&mut self) -> DriverResult<u64> {
        Ok(self.state.lock().unwrap().behavior.last_insert_id)
    }
}

struct StubCursor {
    state: Arc<Mutex<StubState>>,
    query: String,
    columns: Vec<ColumnInfo>,
    pending: Vec<Row>,
    fetched: usize,
    affected: Option<u64>,
    row_count: Option<u64>,
    outputs: Vec<String>,
    output_values: HashMap<String, BindValue>,
}

fn first_keyword(query: &str) -> String {
    query
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

impl DriverCursor for StubCursor {
    fn bind_input(&mut self, _name: &str, _value: &BindValue) -> DriverResult<()> {
        Ok(())
    }

    fn define_output(
        &mut self,
        name: &str,
        _value: &BindValue,
        _max_size: u32,
    ) -> DriverResult<()> {
        self.outputs.push(name.to_string());
        Ok(())
    }

    fn execute(&mut self) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(not_connected());
        }
        state.executed.push(self.query.clone());

        self.columns.clear();
        self.pending.clear();
        self.fetched = 0;
        self.affected = None;
        self.row_count = None;

        // Output binds resolve from the scripted value table
        for name in &self.outputs {
            let value = state
                .behavior
                .output_values
                .get(name)
                .cloned()
                .unwrap_or(BindValue::Null);
            self.output_values.insert(name.clone(), value);
        }

        match first_keyword(&self.query).as_str() {
            "select" => {
                let lower = self.query.to_ascii_lowercase();
                if let Some(table) = state.tables.iter().find(|t| {
                    lower.contains(&format!(" {}", t.name.to_ascii_lowercase()))
                }) {
                    self.columns = table.columns.clone();
                    self.pending = table.rows.clone();
                    self.row_count = Some(table.rows.len() as u64);
                } else {
                    return Err(DriverError::recoverable(
                        1146,
                        "42S02",
                        format!("stub: no table matches '{}'", self.query),
                    ));
                }
            }
            "insert" | "update" | "delete" => {
                self.affected = Some(1);
            }
            // Everything else (DDL, call, drop, truncate) succeeds with
            // an empty result
            _ => {}
        }
        Ok(())
    }

    fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    fn fetch_row(&mut self) -> DriverResult<Option<Row>> {
        let state = self.state.lock().unwrap();
        if let Some(limit) = state.behavior.fail_fetch_after {
            if self.fetched >= limit {
                return Err(DriverError::disconnected("stub: backend went away"));
            }
        }
        drop(state);
        if self.fetched >= self.pending.len() {
            return Ok(None);
        }
        let row = self.pending[self.fetched].clone();
        self.fetched += 1;
        Ok(Some(row))
    }

    fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    fn affected_rows(&self) -> Option<u64> {
        self.affected
    }

    fn output_value(&self, name: &str) -> Option<BindValue> {
        self.output_values.get(name).cloned()
    }

    fn abort(&mut self) -> DriverResult<()> {
        self.pending.clear();
        self.fetched = 0;
        Ok(())
    }
}

/// A 3-column, 5-row fixture used across the test suites
pub fn fixture_table() -> StubTable {
    StubTable::new(
        "t",
        vec![
            ColumnInfo::named("id", ColumnType::Int),
            ColumnInfo::named("name", ColumnType::Varchar),
            ColumnInfo::named("score", ColumnType::Double),
        ],
        vec![
            vec![
                Field::Integer(1),
                Field::Text(b"ada".to_vec()),
                Field::Double(99.5),
            ],
            vec![
                Field::Integer(2),
                Field::Text(b"grace".to_vec()),
                Field::Double(98.25),
            ],
            vec![
                Field::Integer(3),
                Field::Text(b"edsger".to_vec()),
                Field::Double(97.0),
            ],
            vec![
                Field::Integer(4),
                Field::Text(b"barbara".to_vec()),
                Field::Double(96.125),
            ],
            vec![Field::Integer(5), Field::Null, Field::Double(95.75)],
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_stub() -> StubDriver {
        let mut stub = StubDriver::new().with_table(fixture_table());
        stub.connect(&HashMap::new()).unwrap();
        stub
    }

    #[test]
    fn select_returns_fixture_rows() {
        let mut stub = connected_stub();
        let mut cursor = stub.prepare(b"select * from t").unwrap();
        cursor.execute().unwrap();
        assert_eq!(cursor.columns().len(), 3);
        assert_eq!(cursor.row_count(), Some(5));

        let mut rows = 0;
        while let Some(row) = cursor.fetch_row().unwrap() {
            assert_eq!(row.len(), 3);
            rows += 1;
        }
        assert_eq!(rows, 5);
    }

    #[test]
    fn unknown_table_is_recoverable() {
        let mut stub = connected_stub();
        let mut cursor = stub.prepare(b"select * from missing").unwrap();
        let err = cursor.execute().unwrap_err();
        assert!(err.connection_alive);
        assert_eq!(err.sqlstate, "42S02");
    }

    #[test]
    fn dml_reports_affected_rows() {
        let mut stub = connected_stub();
        let mut cursor = stub.prepare(b"update t set score = 0").unwrap();
        cursor.execute().unwrap();
        assert_eq!(cursor.affected_rows(), Some(1));
        assert_eq!(cursor.row_count(), None);
    }

    #[test]
    fn scripted_output_bind() {
        let mut behavior = StubBehavior::default();
        behavior
            .output_values
            .insert("n".to_string(), BindValue::Integer(42));
        let mut stub = StubDriver::new().with_behavior(behavior);
        stub.connect(&HashMap::new()).unwrap();

        let mut cursor = stub.prepare(b"call get_n(?)").unwrap();
        cursor
            .define_output("n", &BindValue::Integer(0), 0)
            .unwrap();
        cursor.execute().unwrap();
        assert_eq!(cursor.output_value("n"), Some(BindValue::Integer(42)));
    }

    #[test]
    fn fetch_failure_injection() {
        let mut stub = connected_stub();
        stub.handle().set_fail_fetch_after(Some(2));
        let mut cursor = stub.prepare(b"select * from t").unwrap();
        cursor.execute().unwrap();
        assert!(cursor.fetch_row().unwrap().is_some());
        assert!(cursor.fetch_row().unwrap().is_some());
        let err = cursor.fetch_row().unwrap_err();
        assert!(!err.connection_alive);
    }

    #[test]
    fn ping_toggles_and_relogin_counts() {
        let mut stub = connected_stub();
        assert!(stub.ping().is_ok());
        stub.handle().set_fail_ping(true);
        assert!(stub.ping().is_err());
        stub.handle().set_fail_ping(false);
        stub.log_out();
        stub.connect(&HashMap::new()).unwrap();
        assert_eq!(stub.handle().logins(), 2);
    }
}
