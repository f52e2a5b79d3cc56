//! Portable column and field types

use sqlrelay_protocol::binds::DateTimeTz;

/// The core's portable column type enum; drivers map their native type
/// ids onto this
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ColumnType {
    Unknown = 0,
    Char = 1,
    Varchar = 2,
    Binary = 3,
    Int = 4,
    Smallint = 5,
    Bigint = 6,
    Tinyint = 7,
    Real = 8,
    Float = 9,
    Double = 10,
    Decimal = 11,
    Numeric = 12,
    Bit = 13,
    Date = 14,
    Time = 15,
    Timestamp = 16,
    Blob = 17,
    Clob = 18,
    Interval = 19,
    Guid = 20,
}

impl ColumnType {
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => Self::Char,
            2 => Self::Varchar,
            3 => Self::Binary,
            4 => Self::Int,
            5 => Self::Smallint,
            6 => Self::Bigint,
            7 => Self::Tinyint,
            8 => Self::Real,
            9 => Self::Float,
            10 => Self::Double,
            11 => Self::Decimal,
            12 => Self::Numeric,
            13 => Self::Bit,
            14 => Self::Date,
            15 => Self::Time,
            16 => Self::Timestamp,
            17 => Self::Blob,
            18 => Self::Clob,
            19 => Self::Interval,
            20 => Self::Guid,
            _ => Self::Unknown,
        }
    }

    /// Whether values of this type stream as long data
    pub fn is_lob(self) -> bool {
        matches!(self, Self::Blob | Self::Clob)
    }
}

/// Column metadata as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: ColumnType,
    pub size: u32,
    pub precision: u32,
    pub scale: u32,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub part_of_key: bool,
    pub unsigned: bool,
    pub zerofill: bool,
    pub binary: bool,
    pub autoincrement: bool,
}

impl Default for ColumnType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl ColumnInfo {
    /// Shorthand for test fixtures and metadata result sets
    pub fn named(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            ..Default::default()
        }
    }
}

/// One value in a fetched row
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Null,
    Text(Vec<u8>),
    Integer(i64),
    Double(f64),
    Date(DateTimeTz),
    /// Long data; streamed to the client in segments
    Lob(Vec<u8>),
}

/// One fetched row
pub type Row = Vec<Field>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_ids_round_trip() {
        for v in 0..=20u16 {
            assert_eq!(ColumnType::from_u16(v).to_u16(), v);
        }
        assert_eq!(ColumnType::from_u16(999), ColumnType::Unknown);
    }

    #[test]
    fn lob_detection() {
        assert!(ColumnType::Blob.is_lob());
        assert!(ColumnType::Clob.is_lob());
        assert!(!ColumnType::Varchar.is_lob());
    }
}
