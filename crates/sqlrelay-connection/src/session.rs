//! The client session state machine
//!
//! One `Controller` drives one client at a time over a blocking stream:
//! authenticate first, then a strict request/response command loop until
//! the session ends, suspends, or the backend goes away. Every limit
//! violation answers with its canonical 900000-range code; every dropped
//! session ends with an explicit disconnect record rather than a mute
//! close.

use std::io::{Read, Write};

use sqlrelay_common::auth::{Authenticator, StaticUserList};
use sqlrelay_common::client_errors::{ClientLimitError, LIMIT_SQLSTATE};
use sqlrelay_common::config::{LimitsConfig, SessionConfig};
use sqlrelay_driver::{
    BindValue, ColumnInfo, ColumnType, DriverConnection, DriverError, Field,
};
use sqlrelay_protocol::binds::{
    self, BindError, BindLimits, InputBind, OutputBindSpec,
};
use sqlrelay_protocol::codec::{CodecError, ProtocolReader, ProtocolWriter};
use sqlrelay_protocol::columns::ColumnDesc;
use sqlrelay_protocol::consts::{
    DataTag, Opcode, ResponseStatus, END_RESULT_SET,
};
use sqlrelay_rendezvous::ConnectionState;
use tracing::{debug, info, warn};

use crate::cursor::{CursorPool, CursorState};
use crate::stats::StatsSink;
use crate::temp_tables::{temp_table_name, Sanitize, TempTableList};

/// Bytes per long-data segment on the wire
const LOB_SEGMENT: usize = 32768;

/// How a session finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Clean end (END_SESSION, client close, or fatal protocol error)
    EndSession,
    /// SUSPEND_SESSION: state is parked awaiting a direct reconnect
    Suspended,
    /// The backend connection is gone; the daemon must re-log-in
    Disconnect,
}

/// What a command handler wants the loop to do next
enum Flow {
    Continue,
    End,
    Suspend,
}

/// Session-fatal conditions; everything else answers the client and
/// keeps the loop running
enum SessionError {
    /// Framing/limit failure where the stream can no longer be trusted
    Protocol(String),
    /// A bind block violated a limit mid-record: the canonical error is
    /// still owed to the client, but the stream is unrecoverable after it
    BindRefused(ClientLimitError, String),
    /// Client socket error
    Io(std::io::Error),
    /// A disconnect record has been sent; the backend needs a re-log-in
    Disconnect,
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => SessionError::Io(io),
            other => SessionError::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

/// Static configuration for a controller
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub limits: LimitsConfig,
    pub session: SessionConfig,
}

/// One fully-parsed query request
struct QueryRequest {
    client_info: Vec<u8>,
    query: Vec<u8>,
    /// First violation hit on a drainable field; the request was still
    /// consumed so the session can continue
    violation: Option<ClientLimitError>,
    in_binds: Vec<InputBind>,
    out_specs: Vec<OutputBindSpec>,
    send_column_info: bool,
    skip: u64,
    fetch: u64,
}

/// Drives the client protocol against one backend session
pub struct Controller {
    settings: ControllerSettings,
    auth: StaticUserList,
    driver: Box<dyn DriverConnection>,
    cursors: CursorPool,
    session_temp: TempTableList,
    trans_temp: TempTableList,
    stats: StatsSink,

    /// (port, unix socket path) clients reconnect to after a suspend
    resume_endpoint: (u16, String),

    authenticated: bool,
    in_transaction_block: bool,
    in_fake_transaction: bool,
}

impl Controller {
    pub fn new(
        settings: ControllerSettings,
        auth: StaticUserList,
        driver: Box<dyn DriverConnection>,
        cursor_count: u16,
        stats: StatsSink,
    ) -> Self {
        Self {
            settings,
            auth,
            driver,
            cursors: CursorPool::new(cursor_count),
            session_temp: TempTableList::default(),
            trans_temp: TempTableList::default(),
            stats,
            resume_endpoint: (0, String::new()),
            authenticated: false,
            in_transaction_block: false,
            in_fake_transaction: false,
        }
    }

    /// Where a suspending client is told to reconnect
    pub fn set_resume_endpoint(&mut self, port: u16, unix_socket: &str) {
        self.resume_endpoint = (port, unix_socket.to_string());
    }

    pub fn driver_mut(&mut self) -> &mut dyn DriverConnection {
        self.driver.as_mut()
    }

    pub fn cursors(&self) -> &CursorPool {
        &self.cursors
    }

    /// Discard suspended result sets whose client never came back
    pub fn discard_suspended(&mut self) -> usize {
        self.cursors.discard_suspended()
    }

    /// Whether any cursor is parked awaiting a resume
    pub fn has_suspended_state(&self) -> bool {
        self.cursors.iter().any(|c| c.is_suspended())
    }

    /// Run one client session to completion
    pub fn run_session<R: Read, W: Write>(
        &mut self,
        reader: R,
        writer: W,
        client_addr: &str,
    ) -> SessionOutcome {
        let mut r = ProtocolReader::new(reader);
        let mut w = ProtocolWriter::new(writer);

        self.authenticated = false;
        self.stats.set_client_addr(client_addr);
        self.stats.set_state(ConnectionState::SessionStart);
        self.stats.with_aggregate(|s| {
            s.opened_client_connections += 1;
            s.open_client_connections += 1;
        });
        self.session_start();

        let outcome = loop {
            self.stats.set_state(ConnectionState::GetCommand);
            let opcode = match r.read_opcode() {
                Ok(Some(op)) => op,
                Ok(None) => {
                    debug!(client = %client_addr, "client closed between commands");
                    break SessionOutcome::EndSession;
                }
                Err(CodecError::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    info!(client = %client_addr, "idle client timeout");
                    break SessionOutcome::EndSession;
                }
                Err(e) => {
                    warn!(client = %client_addr, error = %e, "bad command header");
                    break SessionOutcome::EndSession;
                }
            };

            match self.dispatch(opcode, &mut r, &mut w) {
                Ok(Flow::Continue) => {}
                Ok(Flow::End) => break SessionOutcome::EndSession,
                Ok(Flow::Suspend) => break SessionOutcome::Suspended,
                Err(SessionError::Disconnect) => break SessionOutcome::Disconnect,
                Err(SessionError::BindRefused(limit, msg)) => {
                    warn!(client = %client_addr, error = %msg, "bind block refused; closing session");
                    let _ = send_limit_error(&mut w, limit);
                    self.stats.record_error();
                    break SessionOutcome::EndSession;
                }
                Err(SessionError::Protocol(msg)) => {
                    warn!(client = %client_addr, error = %msg, "protocol error; closing session");
                    break SessionOutcome::EndSession;
                }
                Err(SessionError::Io(e)) => {
                    debug!(client = %client_addr, error = %e, "client socket error");
                    break SessionOutcome::EndSession;
                }
            }
        };

        self.stats.set_state(ConnectionState::SessionEnd);
        match outcome {
            SessionOutcome::EndSession => self.end_session(),
            SessionOutcome::Suspended => self.park_session(),
            SessionOutcome::Disconnect => {
                self.cursors.release_all(false);
                self.in_transaction_block = false;
                self.in_fake_transaction = false;
            }
        }
        self.stats
            .with_aggregate(|s| s.open_client_connections -= 1);
        outcome
    }

    fn dispatch<R: Read, W: Write>(
        &mut self,
        opcode: Opcode,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        if !self.authenticated && opcode != Opcode::Authenticate {
            send_error_record(
                w,
                ResponseStatus::ErrorOccurredDisconnect,
                0,
                "08004",
                "Command received before authentication.",
            )?;
            return Ok(Flow::End);
        }

        match opcode {
            Opcode::Authenticate => self.cmd_authenticate(r, w),
            Opcode::NewQuery => self.cmd_new_query(r, w),
            Opcode::ReexecuteQuery => self.cmd_reexecute(r, w),
            Opcode::FetchResultSet => self.cmd_fetch(r, w),
            Opcode::FetchFromBindCursor => self.cmd_fetch_from_bind_cursor(r, w),
            Opcode::AbortResultSet => self.cmd_abort(r),
            Opcode::SuspendResultSet => self.cmd_suspend_result_set(r, w),
            Opcode::ResumeResultSet => self.cmd_resume_result_set(r, w),
            Opcode::SuspendSession => self.cmd_suspend_session(w),
            Opcode::EndSession => {
                self.stats.count_command(|c| c.end_session += 1);
                Ok(Flow::End)
            }
            Opcode::Ping => self.cmd_ping(w),
            Opcode::Identify => self.cmd_identify(w),
            Opcode::DbVersion => self.cmd_db_version(w),
            Opcode::ServerVersion => self.cmd_server_version(w),
            Opcode::BindFormat => self.cmd_bind_format(w),
            Opcode::Autocommit => self.cmd_autocommit(r, w),
            Opcode::Begin => self.cmd_begin(w),
            Opcode::Commit => self.cmd_commit(w),
            Opcode::Rollback => self.cmd_rollback(w),
            Opcode::GetDbList => self.cmd_get_db_list(r, w),
            Opcode::GetTableList => self.cmd_get_table_list(r, w),
            Opcode::GetColumnList => self.cmd_get_column_list(r, w),
            Opcode::SelectDatabase => self.cmd_select_database(r, w),
            Opcode::GetCurrentDatabase => self.cmd_get_current_database(w),
            Opcode::GetLastInsertId => self.cmd_get_last_insert_id(w),
        }
    }

    // -----------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------

    fn session_start(&mut self) {
        if let Err(e) = self.driver.autocommit(self.settings.session.autocommit) {
            warn!(error = %e, "failed to set session autocommit");
        }
        for query in self.settings.session.session_start_queries.clone() {
            self.run_side_query(&query);
        }
    }

    fn end_session(&mut self) {
        if self.in_transaction_block || self.in_fake_transaction {
            if let Err(e) = self.driver.rollback() {
                warn!(error = %e, "rollback at session end failed");
            }
        }
        self.in_transaction_block = false;
        if self.in_fake_transaction {
            self.in_fake_transaction = false;
            let _ = self.driver.autocommit(self.settings.session.autocommit);
        }
        self.trans_temp.replay(self.driver.as_mut());
        self.session_temp.replay(self.driver.as_mut());
        for query in self.settings.session.session_end_queries.clone() {
            self.run_side_query(&query);
        }
        self.cursors.release_all(true);
        self.authenticated = false;
    }

    /// SUSPEND_SESSION: keep cursor state, skip sanitation
    fn park_session(&mut self) {
        for id in 0..self.cursors.len() as u16 {
            if let Some(cursor) = self.cursors.get_mut(id) {
                match cursor.state() {
                    CursorState::ResultSetOpen => cursor.suspend(),
                    CursorState::Free => {}
                    _ => cursor.release(),
                }
            }
        }
        self.authenticated = false;
    }

    fn run_side_query(&mut self, query: &str) {
        let result = self
            .driver
            .prepare(query.as_bytes())
            .and_then(|mut c| c.execute());
        if let Err(e) = result {
            warn!(query = %query, error = %e, "session query failed");
        }
    }

    fn bind_limits(&self) -> BindLimits {
        BindLimits {
            max_count: self.settings.limits.max_bind_count,
            max_name_length: self.settings.limits.max_bind_name_length,
            max_string_value_length: self.settings.limits.max_string_bind_value_length,
            max_lob_value_length: self.settings.limits.max_lob_bind_value_length,
        }
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    fn cmd_authenticate<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.authenticate += 1);
        let user = r.read_lstring("user", 128)?;
        let password = r.read_lstring("password", 128)?;

        if self.auth.authenticate(&user, &password) {
            self.authenticated = true;
            w.write_u16(ResponseStatus::NoError.to_u16());
            w.flush()?;
            debug!(user = %user, "client authenticated");
            Ok(Flow::Continue)
        } else {
            info!(user = %user, "authentication refused");
            send_error_record(
                w,
                ResponseStatus::ErrorOccurred,
                0,
                "IM001",
                "Authentication Error.",
            )?;
            Ok(Flow::End)
        }
    }

    fn read_query_request<R: Read>(
        &mut self,
        r: &mut ProtocolReader<R>,
    ) -> Result<QueryRequest, SessionError> {
        let mut violation = None;

        // Client info; oversize is drained so the session can continue
        let info_len = r.read_u64()?;
        let client_info = if info_len > self.settings.limits.max_client_info_length {
            drain(r, info_len)?;
            violation = Some(ClientLimitError::MaxClientInfoLength);
            Vec::new()
        } else {
            r.read_bytes("client info", info_len, self.settings.limits.max_client_info_length)?
        };

        // Query text; same treatment
        let query_len = r.read_u32()?;
        let query = if query_len > self.settings.limits.max_query_size {
            drain(r, query_len as u64)?;
            violation = violation.or(Some(ClientLimitError::MaxQueryLength));
            Vec::new()
        } else {
            r.read_bytes("query", query_len as u64, self.settings.limits.max_query_size as u64)?
        };

        // A bind-block failure leaves the stream mid-record; the caller
        // still answers with the canonical limit error, then gives up on
        // the session.
        let limits = self.bind_limits();
        let in_binds = binds::read_input_binds(r, &limits).map_err(bind_violation)?;
        let out_specs = binds::read_output_bind_specs(r, &limits).map_err(bind_violation)?;

        let send_column_info = r.read_u16()? != 0;
        let skip = r.read_u64()?;
        let fetch = r.read_u64()?;

        Ok(QueryRequest {
            client_info,
            query,
            violation,
            in_binds,
            out_specs,
            send_column_info,
            skip,
            fetch,
        })
    }

    fn cmd_new_query<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.new_query += 1);
        self.stats.set_state(ConnectionState::ProcessSql);

        let req = self.read_query_request(r)?;
        if !req.client_info.is_empty() {
            self.stats.set_client_info(&req.client_info);
        }

        if let Some(limit) = req.violation {
            send_limit_error(w, limit)?;
            self.stats.record_error();
            return Ok(Flow::Continue);
        }

        let cursor_id = match self.cursors.acquire() {
            Some(id) => id,
            None => {
                send_limit_error(w, ClientLimitError::NoCursors)?;
                self.stats.record_error();
                return Ok(Flow::Continue);
            }
        };
        self.stats
            .with_aggregate(|s| s.times_new_cursor_used += 1);

        match self.driver.prepare(&req.query) {
            Ok(dc) => {
                let cursor = self
                    .cursors
                    .get_mut(cursor_id)
                    .expect("freshly acquired cursor");
                cursor.attach(req.query.clone(), dc);
            }
            Err(e) => {
                self.cursors.release(cursor_id);
                let flow = send_driver_error(w, &self.settings.limits, &self.stats, &e)?;
                return match flow {
                    Flow::End => Err(SessionError::Disconnect),
                    other => Ok(other),
                };
            }
        }

        self.execute_and_stream(w, cursor_id, &req, false)
    }

    fn cmd_reexecute<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.reexecute_query += 1);
        self.stats.set_state(ConnectionState::ProcessSql);

        let cursor_id = r.read_u16()?;
        let req = self.read_query_request_for_reexecute(r)?;

        if let Some(limit) = req.violation {
            send_limit_error(w, limit)?;
            self.stats.record_error();
            return Ok(Flow::Continue);
        }

        match self.cursors.get(cursor_id).map(|c| c.state()) {
            Some(CursorState::Prepared)
            | Some(CursorState::Executed)
            | Some(CursorState::ResultSetOpen) => {}
            _ => {
                send_error_record(
                    w,
                    ResponseStatus::ErrorOccurred,
                    0,
                    "HY109",
                    "No prepared statement on that cursor.",
                )?;
                return Ok(Flow::Continue);
            }
        }
        self.stats.with_aggregate(|s| s.times_cursor_reused += 1);
        self.execute_and_stream(w, cursor_id, &req, true)
    }

    /// REEXECUTE_QUERY carries everything NEW_QUERY does except the
    /// client info and query text
    fn read_query_request_for_reexecute<R: Read>(
        &mut self,
        r: &mut ProtocolReader<R>,
    ) -> Result<QueryRequest, SessionError> {
        let limits = self.bind_limits();
        let in_binds = binds::read_input_binds(r, &limits).map_err(bind_violation)?;
        let out_specs = binds::read_output_bind_specs(r, &limits).map_err(bind_violation)?;
        let send_column_info = r.read_u16()? != 0;
        let skip = r.read_u64()?;
        let fetch = r.read_u64()?;
        Ok(QueryRequest {
            client_info: Vec::new(),
            query: Vec::new(),
            violation: None,
            in_binds,
            out_specs,
            send_column_info,
            skip,
            fetch,
        })
    }

    fn execute_and_stream<W: Write>(
        &mut self,
        w: &mut ProtocolWriter<W>,
        cursor_id: u16,
        req: &QueryRequest,
        reexecute: bool,
    ) -> Result<Flow, SessionError> {
        let limits = self.settings.limits.clone();

        let cursor = match self.cursors.get_mut(cursor_id) {
            Some(c) => c,
            None => {
                send_error_record(
                    w,
                    ResponseStatus::ErrorOccurred,
                    0,
                    "HY109",
                    "Invalid cursor id.",
                )?;
                return Ok(Flow::Continue);
            }
        };

        let sql = if reexecute {
            cursor.query().to_vec()
        } else {
            req.query.clone()
        };
        self.stats.set_sql_text(&sql);
        cursor.set_output_specs(req.out_specs.clone());

        // Binds go straight to the driver cursor
        if let Some(dc) = cursor.driver_cursor() {
            for bind in &req.in_binds {
                if let Err(e) = dc.bind_input(&bind.name, &bind.value) {
                    return send_driver_error(w, &limits, &self.stats, &e).map(|_| Flow::Continue);
                }
            }
            for spec in &req.out_specs {
                if let Err(e) = dc.define_output(&spec.name, &BindValue::Null, spec.max_size) {
                    return send_driver_error(w, &limits, &self.stats, &e).map(|_| Flow::Continue);
                }
            }
        }

        if let Err(e) = cursor.execute() {
            let flow = send_driver_error(w, &limits, &self.stats, &e)?;
            if !reexecute {
                self.cursors.release(cursor_id);
            }
            return match flow {
                Flow::End => Err(SessionError::Disconnect),
                other => Ok(other),
            };
        }

        // Select-list limit
        let col_count = self.cursors.get(cursor_id).map(|c| c.columns().len()).unwrap_or(0);
        if limits.max_select_list > 0 && col_count as u32 > limits.max_select_list {
            send_limit_error(w, ClientLimitError::MaxSelectList)?;
            self.cursors.release(cursor_id);
            return Ok(Flow::Continue);
        }

        // Record temp tables for end-of-scope sanitation
        if let Some(name) = temp_table_name(&sql) {
            if self.in_transaction_block || self.in_fake_transaction {
                self.trans_temp.add(&name, Sanitize::Drop);
            } else {
                self.session_temp.add(&name, Sanitize::Drop);
            }
        }

        self.stats.record_query(&sql);
        self.stats.set_state(ConnectionState::ReturnResultSet);
        self.stream_result_set(w, cursor_id, req.send_column_info, req.skip, req.fetch, true)
    }

    /// Fill the cursor window, then write the result-set header (cursor
    /// id, optional column info, output binds) and the first batch
    fn stream_result_set<W: Write>(
        &mut self,
        w: &mut ProtocolWriter<W>,
        cursor_id: u16,
        send_column_info: bool,
        skip: u64,
        fetch: u64,
        with_header: bool,
    ) -> Result<Flow, SessionError> {
        let limits = self.settings.limits.clone();
        let want_column_info = send_column_info && self.settings.session.send_column_info;

        let cursor = match self.cursors.get_mut(cursor_id) {
            Some(c) => c,
            None => {
                send_error_record(
                    w,
                    ResponseStatus::ErrorOccurred,
                    0,
                    "HY109",
                    "Invalid cursor id.",
                )?;
                return Ok(Flow::Continue);
            }
        };

        // Buffer before writing anything so a mid-fetch driver failure
        // still becomes a clean error record.
        if let Err(e) = cursor.fill_window(skip, fetch) {
            let flow = send_driver_error(w, &limits, &self.stats, &e)?;
            return match flow {
                Flow::End => Err(SessionError::Disconnect),
                other => Ok(other),
            };
        }

        w.write_u16(ResponseStatus::NoError.to_u16());
        w.write_u16(cursor_id);

        if with_header {
            w.write_u16(want_column_info as u16);
            let columns = cursor.columns().to_vec();
            w.write_u32(columns.len() as u32);
            if want_column_info {
                for col in &columns {
                    column_desc(col).write(w);
                }
            }

            // Output bind values, in client definition order
            let specs = cursor.output_specs().to_vec();
            w.write_u16(specs.len() as u16);
            for spec in &specs {
                let value = cursor
                    .driver_cursor()
                    .and_then(|dc| dc.output_value(&spec.name))
                    .unwrap_or(BindValue::Null);
                binds::write_output_bind_value(w, &value);
            }
        }

        write_batch(w, cursor);
        w.flush()?;
        Ok(Flow::Continue)
    }

    fn cmd_fetch<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.fetch_result_set += 1);
        let cursor_id = r.read_u16()?;
        let skip = r.read_u64()?;
        let fetch = r.read_u64()?;

        match self.cursors.get(cursor_id).map(|c| (c.state(), c.is_suspended())) {
            Some((CursorState::Executed, false)) | Some((CursorState::ResultSetOpen, false)) => {}
            _ => {
                send_error_record(
                    w,
                    ResponseStatus::ErrorOccurred,
                    0,
                    "24000",
                    "No open result set on that cursor.",
                )?;
                return Ok(Flow::Continue);
            }
        }
        self.stats.set_state(ConnectionState::ReturnResultSet);
        self.stream_result_set(w, cursor_id, false, skip, fetch, false)
    }

    fn cmd_fetch_from_bind_cursor<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.fetch_from_bind_cursor += 1);
        let cursor_id = r.read_u16()?;
        // A ref-cursor output bind materializes on its own cursor slot;
        // fetching from it is the same as any open result set.
        match self.cursors.get(cursor_id).map(|c| c.state()) {
            Some(CursorState::Executed) | Some(CursorState::ResultSetOpen) => {
                self.stream_result_set(w, cursor_id, false, 0, 0, true)
            }
            _ => {
                send_error_record(
                    w,
                    ResponseStatus::ErrorOccurred,
                    0,
                    "24000",
                    "No open bind cursor with that id.",
                )?;
                Ok(Flow::Continue)
            }
        }
    }

    fn cmd_abort<R: Read>(&mut self, r: &mut ProtocolReader<R>) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.abort_result_set += 1);
        let cursor_id = r.read_u16()?;
        if let Some(cursor) = self.cursors.get_mut(cursor_id) {
            if let Err(e) = cursor.abort() {
                warn!(cursor = cursor_id, error = %e, "abort failed");
            }
            self.cursors.release(cursor_id);
        }
        // ABORT_RESULT_SET has no response
        Ok(Flow::Continue)
    }

    fn cmd_suspend_result_set<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.suspend_result_set += 1);
        let cursor_id = r.read_u16()?;
        match self.cursors.get_mut(cursor_id) {
            Some(cursor) if cursor.state() == CursorState::ResultSetOpen => {
                cursor.suspend();
                w.write_u16(ResponseStatus::NoError.to_u16());
                w.write_u16(self.resume_endpoint.0);
                w.write_lstring(&self.resume_endpoint.1);
                w.flush()?;
                Ok(Flow::Continue)
            }
            _ => {
                send_error_record(
                    w,
                    ResponseStatus::ErrorOccurred,
                    0,
                    "24000",
                    "No open result set on that cursor.",
                )?;
                Ok(Flow::Continue)
            }
        }
    }

    fn cmd_resume_result_set<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.resume_result_set += 1);
        let cursor_id = r.read_u16()?;
        let skip = r.read_u64()?;
        let fetch = r.read_u64()?;

        let resumed = self
            .cursors
            .get_mut(cursor_id)
            .map(|c| c.resume())
            .unwrap_or(false);
        if !resumed {
            send_limit_error(w, ClientLimitError::ResultSetNotSuspended)?;
            return Ok(Flow::Continue);
        }
        self.stats.set_state(ConnectionState::ReturnResultSet);
        self.stream_result_set(w, cursor_id, false, skip, fetch, false)
    }

    fn cmd_suspend_session<W: Write>(
        &mut self,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.suspend_session += 1);
        w.write_u16(ResponseStatus::NoError.to_u16());
        w.write_u16(self.resume_endpoint.0);
        w.write_lstring(&self.resume_endpoint.1);
        w.flush()?;
        Ok(Flow::Suspend)
    }

    fn cmd_ping<W: Write>(&mut self, w: &mut ProtocolWriter<W>) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.ping += 1);
        match self.driver.ping() {
            Ok(()) => {
                w.write_u16(ResponseStatus::NoError.to_u16());
                w.flush()?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                let flow = send_driver_error(w, &self.settings.limits, &self.stats, &e)?;
                match flow {
                    Flow::End => Err(SessionError::Disconnect),
                    other => Ok(other),
                }
            }
        }
    }

    fn cmd_identify<W: Write>(&mut self, w: &mut ProtocolWriter<W>) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.identify += 1);
        let identity = self.driver.identify().to_string();
        w.write_u16(ResponseStatus::NoError.to_u16());
        w.write_lstring(&identity);
        w.flush()?;
        Ok(Flow::Continue)
    }

    fn cmd_db_version<W: Write>(&mut self, w: &mut ProtocolWriter<W>) -> Result<Flow, SessionError> {
        self.respond_string(w, |driver| driver.db_version())
    }

    fn cmd_server_version<W: Write>(
        &mut self,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.respond_string(w, |driver| driver.server_version())
    }

    fn cmd_bind_format<W: Write>(
        &mut self,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        let format = self.driver.bind_format().as_str();
        w.write_u16(ResponseStatus::NoError.to_u16());
        w.write_lstring(format);
        w.flush()?;
        Ok(Flow::Continue)
    }

    fn respond_string<W: Write, F>(
        &mut self,
        w: &mut ProtocolWriter<W>,
        f: F,
    ) -> Result<Flow, SessionError>
    where
        F: FnOnce(&mut dyn DriverConnection) -> sqlrelay_driver::DriverResult<String>,
    {
        match f(self.driver.as_mut()) {
            Ok(value) => {
                w.write_u16(ResponseStatus::NoError.to_u16());
                w.write_lstring(&value);
                w.flush()?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                let flow = send_driver_error(w, &self.settings.limits, &self.stats, &e)?;
                match flow {
                    Flow::End => Err(SessionError::Disconnect),
                    other => Ok(other),
                }
            }
        }
    }

    fn cmd_autocommit<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.autocommit += 1);
        let on = r.read_u16()? != 0;
        match self.driver.autocommit(on) {
            Ok(()) => {
                w.write_u16(ResponseStatus::NoError.to_u16());
                w.flush()?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                let flow = send_driver_error(w, &self.settings.limits, &self.stats, &e)?;
                match flow {
                    Flow::End => Err(SessionError::Disconnect),
                    other => Ok(other),
                }
            }
        }
    }

    fn cmd_begin<W: Write>(&mut self, w: &mut ProtocolWriter<W>) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.begin += 1);
        if self.in_transaction_block || self.in_fake_transaction {
            send_error_record(
                w,
                ResponseStatus::ErrorOccurred,
                0,
                "25001",
                "Already in a transaction block.",
            )?;
            return Ok(Flow::Continue);
        }

        let native = self.driver.capabilities().transaction_blocks;
        let result = if native {
            self.driver.begin().map(|()| {
                self.in_transaction_block = true;
            })
        } else if self.settings.session.fake_transaction_blocks {
            self.driver.autocommit(false).map(|()| {
                self.in_fake_transaction = true;
            })
        } else {
            // Neither native support nor fake blocks configured: surface
            // the mismatch instead of silently succeeding.
            Err(DriverError::recoverable(
                0,
                "0A000",
                "Transaction blocks are not supported by this backend.",
            ))
        };

        match result {
            Ok(()) => {
                w.write_u16(ResponseStatus::NoError.to_u16());
                w.flush()?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                let flow = send_driver_error(w, &self.settings.limits, &self.stats, &e)?;
                match flow {
                    Flow::End => Err(SessionError::Disconnect),
                    other => Ok(other),
                }
            }
        }
    }

    fn cmd_commit<W: Write>(&mut self, w: &mut ProtocolWriter<W>) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.commit += 1);
        self.finish_transaction(w, true)
    }

    fn cmd_rollback<W: Write>(&mut self, w: &mut ProtocolWriter<W>) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.rollback += 1);
        self.finish_transaction(w, false)
    }

    fn finish_transaction<W: Write>(
        &mut self,
        w: &mut ProtocolWriter<W>,
        commit: bool,
    ) -> Result<Flow, SessionError> {
        let result = if commit {
            self.driver.commit()
        } else {
            self.driver.rollback()
        };

        match result {
            Ok(()) => {
                self.trans_temp.replay(self.driver.as_mut());
                self.in_transaction_block = false;
                if self.in_fake_transaction {
                    self.in_fake_transaction = false;
                    if let Err(e) = self.driver.autocommit(self.settings.session.autocommit) {
                        warn!(error = %e, "failed to restore autocommit after fake block");
                    }
                }
                w.write_u16(ResponseStatus::NoError.to_u16());
                w.flush()?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                let flow = send_driver_error(w, &self.settings.limits, &self.stats, &e)?;
                match flow {
                    Flow::End => Err(SessionError::Disconnect),
                    other => Ok(other),
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Metadata commands: each materializes a small result set on a real
    // cursor slot and streams it like any query result
    // -----------------------------------------------------------------

    fn stream_materialized<W: Write>(
        &mut self,
        w: &mut ProtocolWriter<W>,
        columns: Vec<ColumnInfo>,
        rows: Vec<Vec<Field>>,
    ) -> Result<Flow, SessionError> {
        let cursor_id = match self.cursors.acquire() {
            Some(id) => id,
            None => {
                send_limit_error(w, ClientLimitError::NoCursors)?;
                return Ok(Flow::Continue);
            }
        };
        if let Some(cursor) = self.cursors.get_mut(cursor_id) {
            cursor.attach_materialized(columns, rows);
        }
        let flow = self.stream_result_set(w, cursor_id, true, 0, 0, true)?;
        self.cursors.release(cursor_id);
        Ok(flow)
    }

    fn cmd_get_db_list<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.metadata += 1);
        let wild = r.read_lstring("wildcard", 1024)?;
        match self.driver.get_db_list(&wild) {
            Ok(names) => self.stream_materialized(
                w,
                vec![ColumnInfo::named("database", ColumnType::Varchar)],
                names
                    .into_iter()
                    .map(|n| vec![Field::Text(n.into_bytes())])
                    .collect(),
            ),
            Err(e) => {
                let flow = send_driver_error(w, &self.settings.limits, &self.stats, &e)?;
                match flow {
                    Flow::End => Err(SessionError::Disconnect),
                    other => Ok(other),
                }
            }
        }
    }

    fn cmd_get_table_list<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.metadata += 1);
        let wild = r.read_lstring("wildcard", 1024)?;
        match self.driver.get_table_list(&wild) {
            Ok(names) => self.stream_materialized(
                w,
                vec![ColumnInfo::named("table", ColumnType::Varchar)],
                names
                    .into_iter()
                    .map(|n| vec![Field::Text(n.into_bytes())])
                    .collect(),
            ),
            Err(e) => {
                let flow = send_driver_error(w, &self.settings.limits, &self.stats, &e)?;
                match flow {
                    Flow::End => Err(SessionError::Disconnect),
                    other => Ok(other),
                }
            }
        }
    }

    fn cmd_get_column_list<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.metadata += 1);
        let table = r.read_lstring("table", 1024)?;
        let wild = r.read_lstring("wildcard", 1024)?;
        match self.driver.get_column_list(&table, &wild) {
            Ok(cols) => self.stream_materialized(
                w,
                vec![
                    ColumnInfo::named("column", ColumnType::Varchar),
                    ColumnInfo::named("type", ColumnType::Varchar),
                    ColumnInfo::named("size", ColumnType::Int),
                ],
                cols.into_iter()
                    .map(|c| {
                        vec![
                            Field::Text(c.name.clone().into_bytes()),
                            Field::Text(format!("{:?}", c.column_type).into_bytes()),
                            Field::Integer(c.size as i64),
                        ]
                    })
                    .collect(),
            ),
            Err(e) => {
                let flow = send_driver_error(w, &self.settings.limits, &self.stats, &e)?;
                match flow {
                    Flow::End => Err(SessionError::Disconnect),
                    other => Ok(other),
                }
            }
        }
    }

    fn cmd_select_database<R: Read, W: Write>(
        &mut self,
        r: &mut ProtocolReader<R>,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.metadata += 1);
        let name = r.read_lstring("database", 1024)?;
        match self.driver.select_database(&name) {
            Ok(()) => {
                w.write_u16(ResponseStatus::NoError.to_u16());
                w.flush()?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                let flow = send_driver_error(w, &self.settings.limits, &self.stats, &e)?;
                match flow {
                    Flow::End => Err(SessionError::Disconnect),
                    other => Ok(other),
                }
            }
        }
    }

    fn cmd_get_current_database<W: Write>(
        &mut self,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.metadata += 1);
        self.respond_string(w, |driver| driver.get_current_database())
    }

    fn cmd_get_last_insert_id<W: Write>(
        &mut self,
        w: &mut ProtocolWriter<W>,
    ) -> Result<Flow, SessionError> {
        self.stats.count_command(|c| c.metadata += 1);
        match self.driver.get_last_insert_id() {
            Ok(id) => {
                w.write_u16(ResponseStatus::NoError.to_u16());
                w.write_u64(id);
                w.flush()?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                let flow = send_driver_error(w, &self.settings.limits, &self.stats, &e)?;
                match flow {
                    Flow::End => Err(SessionError::Disconnect),
                    other => Ok(other),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------

/// Map a bind-block refusal to its session error; limit violations carry
/// their canonical code so the loop can answer before closing
fn bind_violation(err: BindError) -> SessionError {
    let mapped = match &err {
        BindError::TooMany(_) => Some(ClientLimitError::MaxBindCount),
        BindError::NameTooLong(_) => Some(ClientLimitError::MaxBindNameLength),
        BindError::StringValueTooLong(_) => Some(ClientLimitError::MaxStringBindValueLength),
        BindError::LobValueTooLong(_) => Some(ClientLimitError::MaxLobBindValueLength),
        BindError::Duplicate(_) => Some(ClientLimitError::DuplicateBindName),
        _ => None,
    };
    match mapped {
        Some(limit) => SessionError::BindRefused(limit, err.to_string()),
        None => match err {
            BindError::Codec(e) => SessionError::from(e),
            other => SessionError::Protocol(other.to_string()),
        },
    }
}

fn column_desc(col: &ColumnInfo) -> ColumnDesc {
    ColumnDesc {
        name: col.name.clone(),
        type_id: col.column_type.to_u16(),
        size: col.size,
        precision: col.precision,
        scale: col.scale,
        nullable: col.nullable,
        primary_key: col.primary_key,
        unique: col.unique,
        part_of_key: col.part_of_key,
        unsigned: col.unsigned,
        zerofill: col.zerofill,
        binary: col.binary,
        autoincrement: col.autoincrement,
    }
}

/// One row batch: row-count flags, the buffered rows, and the end marker
/// when the result set is exhausted
fn write_batch<W: Write>(w: &mut ProtocolWriter<W>, cursor: &crate::cursor::Cursor) {
    match cursor.row_count() {
        Some(n) => {
            w.write_u16(1);
            w.write_u64(n);
        }
        None => w.write_u16(0),
    }
    match cursor.affected_rows() {
        Some(n) => {
            w.write_u16(1);
            w.write_u64(n);
        }
        None => w.write_u16(0),
    }

    // The window was filled before any of this was written
    for row in cursor.window_rows() {
        for field in row {
            write_field(w, field);
        }
    }
    if cursor.end_of_result_set() {
        w.write_u8(END_RESULT_SET);
    }
}

fn write_field<W: Write>(w: &mut ProtocolWriter<W>, field: &Field) {
    match field {
        Field::Null => w.write_u8(DataTag::Null.to_u8()),
        Field::Text(bytes) => {
            w.write_u8(DataTag::String.to_u8());
            w.write_lbytes(bytes);
        }
        Field::Integer(v) => {
            w.write_u8(DataTag::Integer.to_u8());
            w.write_i64(*v);
        }
        Field::Double(v) => {
            w.write_u8(DataTag::Double.to_u8());
            w.write_f64(*v);
        }
        Field::Date(d) => {
            w.write_u8(DataTag::Date.to_u8());
            w.write_i16(d.year);
            w.write_u16(d.month);
            w.write_u16(d.day);
            w.write_u16(d.hour);
            w.write_u16(d.minute);
            w.write_u16(d.second);
            w.write_u32(d.microsecond);
            w.write_u16(d.tz.len() as u16);
            w.write_bytes(d.tz.as_bytes());
        }
        Field::Lob(bytes) => {
            w.write_u8(DataTag::StartLong.to_u8());
            w.write_u64(bytes.len() as u64);
            for chunk in bytes.chunks(LOB_SEGMENT) {
                w.write_u8(DataTag::String.to_u8());
                w.write_lbytes(chunk);
            }
            w.write_u8(DataTag::EndLong.to_u8());
        }
    }
}

fn send_error_record<W: Write>(
    w: &mut ProtocolWriter<W>,
    status: ResponseStatus,
    native_code: u64,
    sqlstate: &str,
    message: &str,
) -> Result<(), SessionError> {
    w.write_u16(status.to_u16());
    w.write_u64(native_code);
    w.write_lstring(sqlstate);
    w.write_lstring(message);
    w.flush()?;
    Ok(())
}

fn send_limit_error<W: Write>(
    w: &mut ProtocolWriter<W>,
    limit: ClientLimitError,
) -> Result<(), SessionError> {
    send_error_record(
        w,
        ResponseStatus::ErrorOccurred,
        limit.code(),
        LIMIT_SQLSTATE,
        limit.message(),
    )
}

/// Forward a driver error; `Flow::End` signals the caller to convert to
/// a disconnect
fn send_driver_error<W: Write>(
    w: &mut ProtocolWriter<W>,
    limits: &LimitsConfig,
    stats: &StatsSink,
    err: &DriverError,
) -> Result<Flow, SessionError> {
    stats.record_error();
    let status = if err.connection_alive {
        ResponseStatus::ErrorOccurred
    } else {
        ResponseStatus::ErrorOccurredDisconnect
    };
    send_error_record(
        w,
        status,
        err.native_code as u64,
        &err.sqlstate,
        err.truncated_message(limits.max_error_length),
    )?;
    if err.connection_alive {
        Ok(Flow::Continue)
    } else {
        Ok(Flow::End)
    }
}

/// Consume and discard `len` bytes from the stream
fn drain<R: Read>(r: &mut ProtocolReader<R>, len: u64) -> Result<(), SessionError> {
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(8192);
        r.read_bytes("drain", chunk, 0).map_err(SessionError::from)?;
        remaining -= chunk;
    }
    Ok(())
}
