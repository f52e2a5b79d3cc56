//! Column descriptors
//!
//! Sent ahead of a result set when the client asked for column info.

use std::io::{Read, Write};

use crate::codec::{CodecError, ProtocolReader, ProtocolWriter};

/// One column of a result set as described on the wire
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnDesc {
    pub name: String,
    /// Portable type id (the driver crate's `ColumnType` discriminant)
    pub type_id: u16,
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

fn flag(v: bool) -> u16 {
    v as u16
}

impl ColumnDesc {
    /// Serialize in wire order
    pub fn write<W: Write>(&self, w: &mut ProtocolWriter<W>) {
        w.write_u16(self.name.len() as u16);
        w.write_bytes(self.name.as_bytes());
        w.write_u16(self.type_id);
        w.write_u32(self.size);
        w.write_u32(self.precision);
        w.write_u32(self.scale);
        w.write_u16(flag(self.nullable));
        w.write_u16(flag(self.primary_key));
        w.write_u16(flag(self.unique));
        w.write_u16(flag(self.part_of_key));
        w.write_u16(flag(self.unsigned));
        w.write_u16(flag(self.zerofill));
        w.write_u16(flag(self.binary));
        w.write_u16(flag(self.autoincrement));
    }

    /// Parse in wire order
    pub fn read<R: Read>(r: &mut ProtocolReader<R>) -> Result<Self, CodecError> {
        let name_len = r.read_u16()?;
        let name_bytes = r.read_bytes("column name", name_len as u64, u16::MAX as u64)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| CodecError::InvalidUtf8("column name"))?;
        Ok(Self {
            name,
            type_id: r.read_u16()?,
            size: r.read_u32()?,
            precision: r.read_u32()?,
            scale: r.read_u32()?,
            nullable: r.read_u16()? != 0,
            primary_key: r.read_u16()? != 0,
            unique: r.read_u16()? != 0,
            part_of_key: r.read_u16()? != 0,
            unsigned: r.read_u16()? != 0,
            zerofill: r.read_u16()? != 0,
            binary: r.read_u16()? != 0,
            autoincrement: r.read_u16()? != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn descriptor_round_trip() {
        let desc = ColumnDesc {
            name: "employee_id".into(),
            type_id: 4,
            size: 8,
            precision: 19,
            scale: 0,
            nullable: false,
            primary_key: true,
            unique: true,
            part_of_key: true,
            unsigned: false,
            zerofill: false,
            binary: false,
            autoincrement: true,
        };
        let mut w = ProtocolWriter::new(Vec::new());
        desc.write(&mut w);
        w.flush().unwrap();
        let bytes: Vec<u8> = w.get_ref().clone();
        let mut r = ProtocolReader::new(Cursor::new(bytes));
        assert_eq!(ColumnDesc::read(&mut r).unwrap(), desc);
    }
}
