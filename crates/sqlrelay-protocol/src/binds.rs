//! Bind variable transport
//!
//! A bind block is `u16 count` followed by `count` entries of
//! `{u8 name_len, name, u8 type_tag, payload}` and a terminating
//! `END_BIND_VARS` byte. Limits are enforced here in the codec layer so
//! every caller gets the same refusal behavior.

use std::collections::HashSet;
use std::io::{Read, Write};

use crate::codec::{CodecError, ProtocolReader, ProtocolWriter};
use crate::consts::{BindTag, END_BIND_VARS};

/// A date/time value with sub-second precision and a timezone name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateTimeTz {
    pub year: i16,
    pub month: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub microsecond: u32,
    pub tz: String,
}

/// A typed bind value
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    String(Vec<u8>),
    Integer(i64),
    Double {
        value: f64,
        precision: u32,
        scale: u32,
    },
    Blob(Vec<u8>),
    Clob(Vec<u8>),
    /// Output-only: the daemon allocates a cursor and returns its id
    Cursor,
    Date(DateTimeTz),
}

impl BindValue {
    pub fn tag(&self) -> BindTag {
        match self {
            BindValue::Null => BindTag::Null,
            BindValue::String(_) => BindTag::String,
            BindValue::Integer(_) => BindTag::Integer,
            BindValue::Double { .. } => BindTag::Double,
            BindValue::Blob(_) => BindTag::Blob,
            BindValue::Clob(_) => BindTag::Clob,
            BindValue::Cursor => BindTag::Cursor,
            BindValue::Date(_) => BindTag::Date,
        }
    }
}

/// One input bind supplied by the client
#[derive(Debug, Clone, PartialEq)]
pub struct InputBind {
    pub name: String,
    pub value: BindValue,
}

/// One output bind declared by the client ahead of execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBindSpec {
    pub name: String,
    pub tag: BindTag,
    /// Buffer size the daemon allocates for string/lob outputs
    pub max_size: u32,
}

/// An output bind with its post-execution value
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBind {
    pub spec: OutputBindSpec,
    pub value: BindValue,
}

/// Limits applied while parsing a bind block
#[derive(Debug, Clone, Copy)]
pub struct BindLimits {
    pub max_count: u16,
    pub max_name_length: u16,
    pub max_string_value_length: u32,
    pub max_lob_value_length: u32,
}

/// Refusals raised while parsing a bind block
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("bind count {0} exceeds the maximum")]
    TooMany(u16),
    #[error("bind name length {0} exceeds the maximum")]
    NameTooLong(u8),
    #[error("string bind value length {0} exceeds the maximum")]
    StringValueTooLong(u32),
    #[error("lob bind value length {0} exceeds the maximum")]
    LobValueTooLong(u32),
    #[error("duplicate bind name '{0}'")]
    Duplicate(String),
    #[error("unknown bind type tag {0}")]
    UnknownTag(u8),
    #[error("bind block missing END_BIND_VARS terminator")]
    MissingTerminator,
}

fn read_bind_header<R: Read>(
    r: &mut ProtocolReader<R>,
    limits: &BindLimits,
    seen: &mut HashSet<String>,
) -> Result<(String, BindTag), BindError> {
    let name_len = r.read_u8()?;
    if name_len as u16 > limits.max_name_length {
        return Err(BindError::NameTooLong(name_len));
    }
    let name_bytes = r.read_bytes("bind name", name_len as u64, limits.max_name_length as u64)?;
    let name =
        String::from_utf8(name_bytes).map_err(|_| CodecError::InvalidUtf8("bind name"))?;
    if !seen.insert(name.clone()) {
        return Err(BindError::Duplicate(name));
    }
    let tag_byte = r.read_u8()?;
    let tag = BindTag::from_u8(tag_byte).ok_or(BindError::UnknownTag(tag_byte))?;
    Ok((name, tag))
}

fn read_date<R: Read>(r: &mut ProtocolReader<R>) -> Result<DateTimeTz, BindError> {
    Ok(DateTimeTz {
        year: r.read_i16()?,
        month: r.read_u16()?,
        day: r.read_u16()?,
        hour: r.read_u16()?,
        minute: r.read_u16()?,
        second: r.read_u16()?,
        microsecond: r.read_u32()?,
        tz: {
            let len = r.read_u16()?;
            let bytes = r.read_bytes("bind tz", len as u64, 64)?;
            String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8("bind tz"))?
        },
    })
}

fn write_date<W: Write>(w: &mut ProtocolWriter<W>, d: &DateTimeTz) {
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

/// Parse an input bind block
pub fn read_input_binds<R: Read>(
    r: &mut ProtocolReader<R>,
    limits: &BindLimits,
) -> Result<Vec<InputBind>, BindError> {
    let count = r.read_u16()?;
    if count > limits.max_count {
        return Err(BindError::TooMany(count));
    }
    let mut seen = HashSet::new();
    let mut binds = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (name, tag) = read_bind_header(r, limits, &mut seen)?;
        let value = match tag {
            BindTag::Null => BindValue::Null,
            BindTag::String => {
                let len = r.read_u32()?;
                if len > limits.max_string_value_length {
                    return Err(BindError::StringValueTooLong(len));
                }
                BindValue::String(r.read_bytes(
                    "string bind",
                    len as u64,
                    limits.max_string_value_length as u64,
                )?)
            }
            BindTag::Integer => BindValue::Integer(r.read_i64()?),
            BindTag::Double => BindValue::Double {
                value: r.read_f64()?,
                precision: r.read_u32()?,
                scale: r.read_u32()?,
            },
            BindTag::Blob | BindTag::Clob => {
                let len = r.read_u32()?;
                if len > limits.max_lob_value_length {
                    return Err(BindError::LobValueTooLong(len));
                }
                let bytes =
                    r.read_bytes("lob bind", len as u64, limits.max_lob_value_length as u64)?;
                if tag == BindTag::Blob {
                    BindValue::Blob(bytes)
                } else {
                    BindValue::Clob(bytes)
                }
            }
            BindTag::Cursor => BindValue::Cursor,
            BindTag::Date => BindValue::Date(read_date(r)?),
        };
        binds.push(InputBind { name, value });
    }
    if r.read_u8()? != END_BIND_VARS {
        return Err(BindError::MissingTerminator);
    }
    Ok(binds)
}

/// Parse an output bind block (declarations, not values)
pub fn read_output_bind_specs<R: Read>(
    r: &mut ProtocolReader<R>,
    limits: &BindLimits,
) -> Result<Vec<OutputBindSpec>, BindError> {
    let count = r.read_u16()?;
    if count > limits.max_count {
        return Err(BindError::TooMany(count));
    }
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (name, tag) = read_bind_header(r, limits, &mut seen)?;
        let max_size = match tag {
            BindTag::String | BindTag::Blob | BindTag::Clob => r.read_u32()?,
            _ => 0,
        };
        specs.push(OutputBindSpec {
            name,
            tag,
            max_size,
        });
    }
    if r.read_u8()? != END_BIND_VARS {
        return Err(BindError::MissingTerminator);
    }
    Ok(specs)
}

fn write_bind_header<W: Write>(w: &mut ProtocolWriter<W>, name: &str, tag: BindTag) {
    w.write_u8(name.len() as u8);
    w.write_bytes(name.as_bytes());
    w.write_u8(tag.to_u8());
}

/// Serialize an input bind block (client side)
pub fn write_input_binds<W: Write>(w: &mut ProtocolWriter<W>, binds: &[InputBind]) {
    w.write_u16(binds.len() as u16);
    for bind in binds {
        write_bind_header(w, &bind.name, bind.value.tag());
        match &bind.value {
            BindValue::Null | BindValue::Cursor => {}
            BindValue::String(bytes) => w.write_lbytes(bytes),
            BindValue::Integer(v) => w.write_i64(*v),
            BindValue::Double {
                value,
                precision,
                scale,
            } => {
                w.write_f64(*value);
                w.write_u32(*precision);
                w.write_u32(*scale);
            }
            BindValue::Blob(bytes) | BindValue::Clob(bytes) => w.write_lbytes(bytes),
            BindValue::Date(d) => write_date(w, d),
        }
    }
    w.write_u8(END_BIND_VARS);
}

/// Serialize an output bind block (client side)
pub fn write_output_bind_specs<W: Write>(w: &mut ProtocolWriter<W>, specs: &[OutputBindSpec]) {
    w.write_u16(specs.len() as u16);
    for spec in specs {
        write_bind_header(w, &spec.name, spec.tag);
        match spec.tag {
            BindTag::String | BindTag::Blob | BindTag::Clob => w.write_u32(spec.max_size),
            _ => {}
        }
    }
    w.write_u8(END_BIND_VARS);
}

/// Serialize one post-execution output bind value (server side)
pub fn write_output_bind_value<W: Write>(w: &mut ProtocolWriter<W>, value: &BindValue) {
    w.write_u8(value.tag().to_u8());
    match value {
        BindValue::Null | BindValue::Cursor => {}
        BindValue::String(bytes) | BindValue::Blob(bytes) | BindValue::Clob(bytes) => {
            w.write_lbytes(bytes)
        }
        BindValue::Integer(v) => w.write_i64(*v),
        BindValue::Double {
            value,
            precision,
            scale,
        } => {
            w.write_f64(*value);
            w.write_u32(*precision);
            w.write_u32(*scale);
        }
        BindValue::Date(d) => write_date(w, d),
    }
}

/// Parse one output bind value (client side)
pub fn read_output_bind_value<R: Read>(
    r: &mut ProtocolReader<R>,
) -> Result<BindValue, BindError> {
    let tag_byte = r.read_u8()?;
    let tag = BindTag::from_u8(tag_byte).ok_or(BindError::UnknownTag(tag_byte))?;
    Ok(match tag {
        BindTag::Null => BindValue::Null,
        BindTag::Cursor => BindValue::Cursor,
        BindTag::String => BindValue::String(r.read_lbytes("output bind", u32::MAX as u64)?),
        BindTag::Blob => BindValue::Blob(r.read_lbytes("output bind", u32::MAX as u64)?),
        BindTag::Clob => BindValue::Clob(r.read_lbytes("output bind", u32::MAX as u64)?),
        BindTag::Integer => BindValue::Integer(r.read_i64()?),
        BindTag::Double => BindValue::Double {
            value: r.read_f64()?,
            precision: r.read_u32()?,
            scale: r.read_u32()?,
        },
        BindTag::Date => BindValue::Date(read_date(r)?),
    })
}
