//! Shared test harness: a scripted wire client and controller builders
//!
//! The client speaks the real octet protocol over one half of a
//! `UnixStream::pair`, with the controller running on the other half in
//! a thread, exactly as it would behind a hand-off descriptor.

#![allow(dead_code)]

use std::os::unix::net::UnixStream;

use sqlrelay_common::auth::StaticUserList;
use sqlrelay_common::config::{LimitsConfig, SessionConfig, UserConfig};
use sqlrelay_connection::session::{Controller, ControllerSettings, SessionOutcome};
use sqlrelay_connection::stats::StatsSink;
use sqlrelay_driver::stub::{fixture_table, StubBehavior, StubDriver, StubHandle, StubTable};
use sqlrelay_driver::DriverConnection;
use sqlrelay_protocol::binds::{
    self, BindValue, DateTimeTz, InputBind, OutputBindSpec,
};
use sqlrelay_protocol::codec::{ProtocolReader, ProtocolWriter};
use sqlrelay_protocol::columns::ColumnDesc;
use sqlrelay_protocol::consts::{DataTag, Opcode, ResponseStatus, END_RESULT_SET};

pub const TEST_USER: &str = "alice";
pub const TEST_PASSWORD: &str = "secret";

/// Build a controller around the stub driver
pub fn build_controller(
    tables: Vec<StubTable>,
    behavior: StubBehavior,
    limits: LimitsConfig,
    session: SessionConfig,
) -> (Controller, StubHandle) {
    let mut stub = StubDriver::new().with_behavior(behavior);
    for table in tables {
        stub = stub.with_table(table);
    }
    let handle = stub.handle();
    let mut driver: Box<dyn DriverConnection> = Box::new(stub);
    driver
        .connect(&std::collections::HashMap::new())
        .expect("stub connect");

    let auth = StaticUserList::new(vec![UserConfig {
        user: TEST_USER.into(),
        password: TEST_PASSWORD.into(),
    }]);
    let controller = Controller::new(
        ControllerSettings { limits, session },
        auth,
        driver,
        5,
        StatsSink::None,
    );
    (controller, handle)
}

pub fn default_controller() -> (Controller, StubHandle) {
    build_controller(
        vec![fixture_table()],
        StubBehavior::default(),
        LimitsConfig::default(),
        SessionConfig::default(),
    )
}

/// Run one session on a background thread; returns the client half and a
/// join handle yielding the controller and its outcome
pub fn start_session(
    mut controller: Controller,
) -> (
    UnixStream,
    std::thread::JoinHandle<(Controller, SessionOutcome)>,
) {
    let (client, server) = UnixStream::pair().expect("socketpair");
    let handle = std::thread::spawn(move || {
        let reader = server.try_clone().expect("clone server half");
        let outcome = controller.run_session(reader, &server, "test-client");
        (controller, outcome)
    });
    (client, handle)
}

/// A value decoded from a row
#[derive(Debug, Clone, PartialEq)]
pub enum WireField {
    Null,
    Text(Vec<u8>),
    Integer(i64),
    Double(f64),
    Date(DateTimeTz),
    Lob(Vec<u8>),
    Cursor(u16),
}

/// A decoded result-set response
#[derive(Debug)]
pub struct ResultSet {
    pub cursor_id: u16,
    pub column_count: u32,
    pub columns: Vec<ColumnDesc>,
    pub output_values: Vec<BindValue>,
    pub actual_rows: Option<u64>,
    pub affected_rows: Option<u64>,
    pub rows: Vec<Vec<WireField>>,
    pub end_of_result_set: bool,
}

/// A decoded error record
#[derive(Debug)]
pub struct WireError {
    pub disconnect: bool,
    pub code: u64,
    pub sqlstate: String,
    pub message: String,
}

pub struct TestClient {
    r: ProtocolReader<UnixStream>,
    w: ProtocolWriter<UnixStream>,
    /// Column count of the last headered result set; headerless batch
    /// responses (fetch/resume) reuse it, as a real client would
    last_column_count: u32,
}

impl TestClient {
    pub fn new(stream: UnixStream) -> Self {
        let reader = stream.try_clone().expect("clone client half");
        Self {
            r: ProtocolReader::new(reader),
            w: ProtocolWriter::new(stream),
            last_column_count: 0,
        }
    }

    pub fn authenticate(&mut self, user: &str, password: &str) -> Result<(), WireError> {
        self.w.write_u16(Opcode::Authenticate.to_u16());
        self.w.write_lstring(user);
        self.w.write_lstring(password);
        self.w.flush().unwrap();
        self.read_status()
    }

    /// Read the leading status word; errors parse the full error record
    pub fn read_status(&mut self) -> Result<(), WireError> {
        let status = self.r.read_u16().expect("status word");
        match ResponseStatus::from_u16(status).expect("valid status") {
            ResponseStatus::NoError => Ok(()),
            ResponseStatus::ErrorOccurred => Err(self.read_error_body(false)),
            ResponseStatus::ErrorOccurredDisconnect => Err(self.read_error_body(true)),
        }
    }

    fn read_error_body(&mut self, disconnect: bool) -> WireError {
        WireError {
            disconnect,
            code: self.r.read_u64().expect("error code"),
            sqlstate: self.r.read_lstring("sqlstate", 64).expect("sqlstate"),
            message: self.r.read_lstring("message", 65536).expect("message"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_query(
        &mut self,
        client_info: &[u8],
        sql: &[u8],
        in_binds: &[InputBind],
        out_specs: &[OutputBindSpec],
        send_column_info: bool,
        skip: u64,
        fetch: u64,
    ) -> Result<ResultSet, WireError> {
        self.w.write_u16(Opcode::NewQuery.to_u16());
        self.w.write_u64(client_info.len() as u64);
        self.w.write_bytes(client_info);
        self.w.write_u32(sql.len() as u32);
        self.w.write_bytes(sql);
        binds::write_input_binds(&mut self.w, in_binds);
        binds::write_output_bind_specs(&mut self.w, out_specs);
        self.w.write_u16(send_column_info as u16);
        self.w.write_u64(skip);
        self.w.write_u64(fetch);
        self.w.flush().unwrap();

        self.read_status()?;
        Ok(self.read_result_set(true, fetch))
    }

    pub fn select(&mut self, sql: &str, fetch: u64) -> Result<ResultSet, WireError> {
        self.new_query(b"", sql.as_bytes(), &[], &[], true, 0, fetch)
    }

    pub fn fetch(&mut self, cursor_id: u16, skip: u64, fetch: u64) -> Result<ResultSet, WireError> {
        self.w.write_u16(Opcode::FetchResultSet.to_u16());
        self.w.write_u16(cursor_id);
        self.w.write_u64(skip);
        self.w.write_u64(fetch);
        self.w.flush().unwrap();

        self.read_status()?;
        Ok(self.read_result_set(false, fetch))
    }

    pub fn suspend_result_set(&mut self, cursor_id: u16) -> Result<(u16, String), WireError> {
        self.w.write_u16(Opcode::SuspendResultSet.to_u16());
        self.w.write_u16(cursor_id);
        self.w.flush().unwrap();

        self.read_status()?;
        let port = self.r.read_u16().expect("port");
        let socket = self.r.read_lstring("socket", 1024).expect("socket path");
        Ok((port, socket))
    }

    pub fn suspend_session(&mut self) -> Result<(u16, String), WireError> {
        self.w.write_u16(Opcode::SuspendSession.to_u16());
        self.w.flush().unwrap();

        self.read_status()?;
        let port = self.r.read_u16().expect("port");
        let socket = self.r.read_lstring("socket", 1024).expect("socket path");
        Ok((port, socket))
    }

    pub fn resume_result_set(
        &mut self,
        cursor_id: u16,
        skip: u64,
        fetch: u64,
    ) -> Result<ResultSet, WireError> {
        self.w.write_u16(Opcode::ResumeResultSet.to_u16());
        self.w.write_u16(cursor_id);
        self.w.write_u64(skip);
        self.w.write_u64(fetch);
        self.w.flush().unwrap();

        self.read_status()?;
        Ok(self.read_result_set(false, fetch))
    }

    pub fn ping(&mut self) -> Result<(), WireError> {
        self.simple(Opcode::Ping)
    }

    pub fn begin(&mut self) -> Result<(), WireError> {
        self.simple(Opcode::Begin)
    }

    pub fn commit(&mut self) -> Result<(), WireError> {
        self.simple(Opcode::Commit)
    }

    pub fn rollback(&mut self) -> Result<(), WireError> {
        self.simple(Opcode::Rollback)
    }

    pub fn end_session(&mut self) {
        self.w.write_u16(Opcode::EndSession.to_u16());
        self.w.flush().unwrap();
    }

    fn simple(&mut self, opcode: Opcode) -> Result<(), WireError> {
        self.w.write_u16(opcode.to_u16());
        self.w.flush().unwrap();
        self.read_status()
    }

    pub fn identify(&mut self) -> Result<String, WireError> {
        self.w.write_u16(Opcode::Identify.to_u16());
        self.w.flush().unwrap();
        self.read_status()?;
        Ok(self.r.read_lstring("identity", 1024).expect("identity"))
    }

    pub fn get_table_list(&mut self, wild: &str) -> Result<ResultSet, WireError> {
        self.w.write_u16(Opcode::GetTableList.to_u16());
        self.w.write_lstring(wild);
        self.w.flush().unwrap();
        self.read_status()?;
        Ok(self.read_result_set(true, 0))
    }

    pub fn get_last_insert_id(&mut self) -> Result<u64, WireError> {
        self.w.write_u16(Opcode::GetLastInsertId.to_u16());
        self.w.flush().unwrap();
        self.read_status()?;
        Ok(self.r.read_u64().expect("last insert id"))
    }

    /// Decode a result-set response after its status word
    fn read_result_set(&mut self, with_header: bool, fetch: u64) -> ResultSet {
        let cursor_id = self.r.read_u16().expect("cursor id");
        let mut columns = Vec::new();
        let mut output_values = Vec::new();

        if with_header {
            let has_column_info = self.r.read_u16().expect("column info flag") != 0;
            self.last_column_count = self.r.read_u32().expect("column count");
            if has_column_info {
                for _ in 0..self.last_column_count {
                    columns.push(ColumnDesc::read(&mut self.r).expect("column desc"));
                }
            }
            let out_count = self.r.read_u16().expect("output bind count");
            for _ in 0..out_count {
                output_values
                    .push(binds::read_output_bind_value(&mut self.r).expect("output value"));
            }
        }
        let column_count = self.last_column_count;

        let (actual_rows, affected_rows, rows, end) = self.read_batch(column_count, fetch);
        ResultSet {
            cursor_id,
            column_count,
            columns,
            output_values,
            actual_rows,
            affected_rows,
            rows,
            end_of_result_set: end,
        }
    }

    #[allow(clippy::type_complexity)]
    fn read_batch(
        &mut self,
        column_count: u32,
        fetch: u64,
    ) -> (Option<u64>, Option<u64>, Vec<Vec<WireField>>, bool) {
        let actual = if self.r.read_u16().expect("actual flag") != 0 {
            Some(self.r.read_u64().expect("actual rows"))
        } else {
            None
        };
        let affected = if self.r.read_u16().expect("affected flag") != 0 {
            Some(self.r.read_u64().expect("affected rows"))
        } else {
            None
        };

        let mut rows = Vec::new();
        let mut end = false;
        loop {
            if fetch > 0 && rows.len() as u64 >= fetch {
                // Full batch; the server sent no end marker
                break;
            }
            let tag = self.r.read_u8().expect("row tag");
            if tag == END_RESULT_SET {
                end = true;
                break;
            }
            let mut row = Vec::with_capacity(column_count as usize);
            row.push(self.read_field(tag));
            for _ in 1..column_count {
                let tag = self.r.read_u8().expect("field tag");
                row.push(self.read_field(tag));
            }
            rows.push(row);
        }
        (actual, affected, rows, end)
    }

    fn read_field(&mut self, tag: u8) -> WireField {
        match DataTag::from_u8(tag).expect("data tag") {
            DataTag::Null => WireField::Null,
            DataTag::String => {
                WireField::Text(self.r.read_lbytes("field", 1 << 24).expect("text"))
            }
            DataTag::Integer => WireField::Integer(self.r.read_i64().expect("integer")),
            DataTag::Double => WireField::Double(self.r.read_f64().expect("double")),
            DataTag::Date => WireField::Date(DateTimeTz {
                year: self.r.read_i16().expect("year"),
                month: self.r.read_u16().expect("month"),
                day: self.r.read_u16().expect("day"),
                hour: self.r.read_u16().expect("hour"),
                minute: self.r.read_u16().expect("minute"),
                second: self.r.read_u16().expect("second"),
                microsecond: self.r.read_u32().expect("microsecond"),
                tz: {
                    let len = self.r.read_u16().expect("tz len");
                    String::from_utf8(
                        self.r.read_bytes("tz", len as u64, 64).expect("tz"),
                    )
                    .expect("tz utf8")
                },
            }),
            DataTag::StartLong => {
                let _total = self.r.read_u64().expect("lob length");
                let mut bytes = Vec::new();
                loop {
                    let seg_tag = self.r.read_u8().expect("lob segment tag");
                    match DataTag::from_u8(seg_tag).expect("lob tag") {
                        DataTag::String => {
                            bytes.extend(self.r.read_lbytes("lob segment", 1 << 24).expect("lob"));
                        }
                        DataTag::EndLong => break,
                        other => panic!("unexpected tag {:?} inside long data", other),
                    }
                }
                WireField::Lob(bytes)
            }
            DataTag::Cursor => WireField::Cursor(self.r.read_u16().expect("cursor field")),
            DataTag::EndLong => panic!("END_LONG_DATA outside long data"),
        }
    }
}
