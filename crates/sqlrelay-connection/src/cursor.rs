//! Cursor pool and row buffering
//!
//! Each daemon owns a fixed pool of cursors, created at start and reused
//! across sessions. A cursor holds the prepared statement, its binds,
//! and a row window of up to `fetch` rows buffered from the driver
//! before anything is written to the wire, so a driver failure mid-batch
//! can still be reported as a clean error record.

use sqlrelay_driver::{ColumnInfo, DriverCursor, DriverError, DriverResult, Row};
use sqlrelay_protocol::binds::OutputBindSpec;

/// Cursor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Free,
    Allocated,
    Prepared,
    Executed,
    ResultSetOpen,
}

/// Where a cursor's rows come from
enum RowSource {
    None,
    Driver(Box<dyn DriverCursor>),
    /// Metadata lists are materialized up front and drained like any
    /// other result set
    Materialized(std::vec::IntoIter<Row>),
}

/// One cursor slot
pub struct Cursor {
    id: u16,
    state: CursorState,
    query: Vec<u8>,
    source: RowSource,
    columns: Vec<ColumnInfo>,
    output_specs: Vec<OutputBindSpec>,

    row_buffer: Vec<Row>,
    first_row_index: u64,
    end_of_result_set: bool,
    suspended: bool,

    row_count: Option<u64>,
    affected_rows: Option<u64>,
    total_rows_returned: u64,
}

impl Cursor {
    fn new(id: u16) -> Self {
        Self {
            id,
            state: CursorState::Free,
            query: Vec::new(),
            source: RowSource::None,
            columns: Vec::new(),
            output_specs: Vec::new(),
            row_buffer: Vec::new(),
            first_row_index: 0,
            end_of_result_set: false,
            suspended: false,
            row_count: None,
            affected_rows: None,
            total_rows_returned: 0,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn end_of_result_set(&self) -> bool {
        self.end_of_result_set
    }

    pub fn query(&self) -> &[u8] {
        &self.query
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn output_specs(&self) -> &[OutputBindSpec] {
        &self.output_specs
    }

    pub fn set_output_specs(&mut self, specs: Vec<OutputBindSpec>) {
        self.output_specs = specs;
    }

    pub fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    pub fn affected_rows(&self) -> Option<u64> {
        self.affected_rows
    }

    pub fn total_rows_returned(&self) -> u64 {
        self.total_rows_returned
    }

    /// Attach a freshly prepared driver cursor
    pub fn attach(&mut self, query: Vec<u8>, driver_cursor: Box<dyn DriverCursor>) {
        self.query = query;
        self.source = RowSource::Driver(driver_cursor);
        self.state = CursorState::Prepared;
        self.reset_window();
    }

    /// Attach a pre-built result set (metadata lists)
    pub fn attach_materialized(&mut self, columns: Vec<ColumnInfo>, rows: Vec<Row>) {
        self.query.clear();
        self.columns = columns;
        self.row_count = Some(rows.len() as u64);
        self.affected_rows = None;
        self.source = RowSource::Materialized(rows.into_iter());
        self.state = CursorState::Executed;
        self.reset_window();
    }

    fn reset_window(&mut self) {
        self.row_buffer.clear();
        self.first_row_index = 0;
        self.end_of_result_set = false;
        self.suspended = false;
        self.total_rows_returned = 0;
    }

    /// The driver cursor, for bind attachment and execution
    pub fn driver_cursor(&mut self) -> Option<&mut Box<dyn DriverCursor>> {
        match &mut self.source {
            RowSource::Driver(c) => Some(c),
            _ => None,
        }
    }

    /// Execute the attached statement
    pub fn execute(&mut self) -> DriverResult<()> {
        match &mut self.source {
            RowSource::Driver(c) => {
                c.execute()?;
                self.columns = c.columns().to_vec();
                self.row_count = c.row_count();
                self.affected_rows = c.affected_rows();
                self.state = CursorState::Executed;
                self.reset_window();
                Ok(())
            }
            _ => Err(DriverError::recoverable(
                0,
                "HY010",
                "no statement prepared on this cursor",
            )),
        }
    }

    fn next_row(&mut self) -> DriverResult<Option<Row>> {
        match &mut self.source {
            RowSource::Driver(c) => c.fetch_row(),
            RowSource::Materialized(rows) => Ok(rows.next()),
            RowSource::None => Ok(None),
        }
    }

    /// Skip `skip` rows, then buffer up to `fetch` rows (`fetch == 0`
    /// buffers everything left). The window is filled completely before
    /// any byte hits the wire.
    pub fn fill_window(&mut self, skip: u64, fetch: u64) -> DriverResult<&[Row]> {
        self.first_row_index += self.row_buffer.len() as u64;
        self.row_buffer.clear();

        // The driver cannot reposition; discard to honor the skip.
        for _ in 0..skip {
            match self.next_row()? {
                Some(_) => self.first_row_index += 1,
                None => {
                    self.end_of_result_set = true;
                    self.state = CursorState::ResultSetOpen;
                    return Ok(&self.row_buffer);
                }
            }
        }

        loop {
            if fetch > 0 && self.row_buffer.len() as u64 >= fetch {
                break;
            }
            match self.next_row()? {
                Some(row) => self.row_buffer.push(row),
                None => {
                    self.end_of_result_set = true;
                    break;
                }
            }
        }
        self.total_rows_returned += self.row_buffer.len() as u64;
        self.state = CursorState::ResultSetOpen;
        Ok(&self.row_buffer)
    }

    /// The rows buffered by the last `fill_window`
    pub fn window_rows(&self) -> &[Row] {
        &self.row_buffer
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    /// Re-attach a client to a suspended result set
    pub fn resume(&mut self) -> bool {
        if self.suspended {
            self.suspended = false;
            true
        } else {
            false
        }
    }

    /// Discard remaining rows; the cursor stays allocated for re-execute
    pub fn abort(&mut self) -> DriverResult<()> {
        if let RowSource::Driver(c) = &mut self.source {
            c.abort()?;
        }
        self.reset_window();
        self.end_of_result_set = true;
        if self.state == CursorState::ResultSetOpen {
            self.state = CursorState::Executed;
        }
        Ok(())
    }

    /// Return the cursor to the free list
    pub fn release(&mut self) {
        self.query.clear();
        self.source = RowSource::None;
        self.columns.clear();
        self.output_specs.clear();
        self.reset_window();
        self.row_count = None;
        self.affected_rows = None;
        self.state = CursorState::Free;
    }
}

/// The fixed per-daemon cursor pool
pub struct CursorPool {
    cursors: Vec<Cursor>,
}

impl CursorPool {
    pub fn new(count: u16) -> Self {
        Self {
            cursors: (0..count).map(Cursor::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Claim a free cursor; `None` means the client gets the no-cursors
    /// error
    pub fn acquire(&mut self) -> Option<u16> {
        let cursor = self
            .cursors
            .iter_mut()
            .find(|c| c.state == CursorState::Free)?;
        cursor.state = CursorState::Allocated;
        Some(cursor.id)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Cursor> {
        self.cursors.get_mut(id as usize)
    }

    pub fn get(&self, id: u16) -> Option<&Cursor> {
        self.cursors.get(id as usize)
    }

    pub fn release(&mut self, id: u16) {
        if let Some(cursor) = self.cursors.get_mut(id as usize) {
            cursor.release();
        }
    }

    /// End-of-session sweep. Suspended result sets survive when
    /// `keep_suspended`; everything else returns to the free list.
    pub fn release_all(&mut self, keep_suspended: bool) {
        for cursor in &mut self.cursors {
            if keep_suspended && cursor.suspended {
                continue;
            }
            cursor.release();
        }
    }

    /// Discard suspended result sets whose client never came back
    pub fn discard_suspended(&mut self) -> usize {
        let mut discarded = 0;
        for cursor in &mut self.cursors {
            if cursor.suspended {
                cursor.release();
                discarded += 1;
            }
        }
        discarded
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cursor> {
        self.cursors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlrelay_driver::{stub::fixture_table, DriverConnection, StubDriver};
    use std::collections::HashMap;

    fn pool_with_query(fetch_query: &[u8]) -> (CursorPool, u16) {
        let mut driver = StubDriver::new().with_table(fixture_table());
        driver.connect(&HashMap::new()).unwrap();
        let mut pool = CursorPool::new(3);
        let id = pool.acquire().unwrap();
        let dc = driver.prepare(fetch_query).unwrap();
        let cursor = pool.get_mut(id).unwrap();
        cursor.attach(fetch_query.to_vec(), dc);
        cursor.execute().unwrap();
        (pool, id)
    }

    #[test]
    fn acquire_exhausts_then_none() {
        let mut pool = CursorPool::new(2);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
        pool.release(0);
        assert_eq!(pool.acquire(), Some(0));
    }

    #[test]
    fn window_of_zero_fetches_everything() {
        let (mut pool, id) = pool_with_query(b"select * from t");
        let cursor = pool.get_mut(id).unwrap();
        let rows = cursor.fill_window(0, 0).unwrap();
        assert_eq!(rows.len(), 5);
        assert!(cursor.end_of_result_set());
    }

    #[test]
    fn paged_windows_respect_fetch_and_mark_end() {
        let (mut pool, id) = pool_with_query(b"select * from t");
        let cursor = pool.get_mut(id).unwrap();

        assert_eq!(cursor.fill_window(0, 2).unwrap().len(), 2);
        assert!(!cursor.end_of_result_set());
        assert_eq!(cursor.fill_window(0, 2).unwrap().len(), 2);
        assert!(!cursor.end_of_result_set());
        let last = cursor.fill_window(0, 2).unwrap();
        assert_eq!(last.len(), 1);
        assert!(cursor.end_of_result_set());
        assert_eq!(cursor.total_rows_returned(), 5);
    }

    #[test]
    fn skip_discards_rows() {
        let (mut pool, id) = pool_with_query(b"select * from t");
        let cursor = pool.get_mut(id).unwrap();
        let rows = cursor.fill_window(3, 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(cursor.end_of_result_set());
    }

    #[test]
    fn suspend_survives_release_sweep() {
        let (mut pool, id) = pool_with_query(b"select * from t");
        pool.get_mut(id).unwrap().fill_window(0, 2).unwrap();
        pool.get_mut(id).unwrap().suspend();

        pool.release_all(true);
        assert_eq!(pool.get(id).unwrap().state(), CursorState::ResultSetOpen);
        assert!(pool.get(id).unwrap().is_suspended());

        // Every non-suspended cursor must be free after the sweep
        for cursor in pool.iter() {
            assert!(
                cursor.state() == CursorState::Free
                    || (cursor.state() == CursorState::ResultSetOpen && cursor.is_suspended())
            );
        }

        assert_eq!(pool.discard_suspended(), 1);
        assert_eq!(pool.get(id).unwrap().state(), CursorState::Free);
    }
}
