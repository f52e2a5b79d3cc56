//! Temporary-table sanitation
//!
//! A client may create session- or transaction-local temp tables. The
//! daemon records their names and, before handing the backend session to
//! the next client, drops or truncates them so no state leaks between
//! sessions. Session-scoped and transaction-scoped lists are distinct:
//! transaction lists replay at commit/rollback, session lists at session
//! end.

use sqlrelay_driver::DriverConnection;
use tracing::{debug, warn};

/// What to do with a recorded table at sanitation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sanitize {
    Drop,
    Truncate,
}

/// One scope's pending sanitation work
#[derive(Debug, Default)]
pub struct TempTableList {
    drop: Vec<String>,
    truncate: Vec<String>,
}

impl TempTableList {
    pub fn add(&mut self, name: &str, action: Sanitize) {
        let list = match action {
            Sanitize::Drop => &mut self.drop,
            Sanitize::Truncate => &mut self.truncate,
        };
        if !list.iter().any(|t| t == name) {
            list.push(name.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.drop.is_empty() && self.truncate.is_empty()
    }

    /// Replay the recorded work against the driver and clear the lists.
    /// Failures are logged, not surfaced; sanitation is best-effort and
    /// must never take the daemon down.
    pub fn replay(&mut self, driver: &mut dyn DriverConnection) {
        for table in self.drop.drain(..) {
            let query = format!("drop table {}", table);
            if let Err(e) = run(driver, &query) {
                warn!(table = %table, error = %e, "temp table drop failed");
            } else {
                debug!(table = %table, "dropped temp table");
            }
        }
        for table in self.truncate.drain(..) {
            let query = format!("truncate table {}", table);
            if let Err(e) = run(driver, &query) {
                warn!(table = %table, error = %e, "temp table truncate failed");
            }
        }
    }
}

fn run(
    driver: &mut dyn DriverConnection,
    query: &str,
) -> sqlrelay_driver::DriverResult<()> {
    let mut cursor = driver.prepare(query.as_bytes())?;
    cursor.execute()
}

/// Detect `create [global|local] temporary table <name>` and return the
/// table name. Queries are otherwise opaque to the core.
pub fn temp_table_name(query: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(query);
    let mut words = text.split_whitespace().map(|w| w.to_ascii_lowercase());
    if words.next()? != "create" {
        return None;
    }
    let mut word = words.next()?;
    if word == "global" || word == "local" {
        word = words.next()?;
    }
    if word != "temporary" && word != "temp" {
        return None;
    }
    if words.next()? != "table" {
        return None;
    }
    // Re-walk the original text to keep the name's case
    let lower = text.to_ascii_lowercase();
    let after = lower.find(" table ")? + " table ".len();
    text[after..]
        .split_whitespace()
        .next()
        .map(|name| name.trim_matches(|c| c == '(' || c == ';').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlrelay_driver::StubDriver;
    use std::collections::HashMap;

    #[test]
    fn detects_temp_table_names() {
        assert_eq!(
            temp_table_name(b"create temporary table scratch (x int)"),
            Some("scratch".to_string())
        );
        assert_eq!(
            temp_table_name(b"CREATE GLOBAL TEMPORARY TABLE Work_Set as select 1"),
            Some("Work_Set".to_string())
        );
        assert_eq!(temp_table_name(b"create table permanent (x int)"), None);
        assert_eq!(temp_table_name(b"select * from t"), None);
    }

    #[test]
    fn replay_issues_drop_and_truncate() {
        let mut driver = StubDriver::new();
        driver.connect(&HashMap::new()).unwrap();
        let handle = driver.handle();

        let mut list = TempTableList::default();
        list.add("scratch", Sanitize::Drop);
        list.add("scratch", Sanitize::Drop); // deduplicated
        list.add("keepme", Sanitize::Truncate);
        list.replay(&mut driver);

        let executed = handle.executed();
        assert_eq!(
            executed,
            vec!["drop table scratch".to_string(), "truncate table keepme".to_string()]
        );
        assert!(list.is_empty());
    }
}
