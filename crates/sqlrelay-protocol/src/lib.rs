//! SQL Relay client wire protocol
//!
//! Length-prefixed typed records over a stream socket, all integers in
//! network byte order. The opcode and tag values are the wire contract;
//! deployed clients key off the exact numbers.

pub mod binds;
pub mod codec;
pub mod columns;
pub mod consts;

pub use binds::{BindValue, DateTimeTz, InputBind, OutputBind, OutputBindSpec};
pub use codec::{CodecError, ProtocolReader, ProtocolWriter};
pub use columns::ColumnDesc;
pub use consts::{
    BindTag, DataTag, HandoffByte, Opcode, ResponseStatus, END_BIND_VARS, END_COLUMN_INFO,
    END_RESULT_SET,
};
