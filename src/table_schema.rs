// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The external table metadata binary format: what a table's schema looks like on
//! disk, independent of its row data (which lives in pages addressed by the block
//! range index and the key-to-page index).
//!
//! The wire layout is bit-exact:
//!
//! ```text
//! varlong version (=1)
//! varlong flags   (=0 or bit0=HAS_FK)
//! utf   tablespace
//! utf   name
//! utf   uuid
//! u8    auto_increment (0|1)
//! varint maxSerialPosition
//! u8    pkColumnCount
//! utf[] primaryKey   (pkColumnCount entries)
//! varint tableFlags
//! varint columnCount
//! for each column:
//!    varlong colVersion (=1)
//!    varlong colFlags   (bit0=HAS_DEFAULT)
//!    utf     name
//!    varint  type
//!    varint  serialPosition
//!    if HAS_DEFAULT: bytesArray defaultValue
//! if HAS_FK:
//!    varint fkCount
//!    for each fk:
//!       utf name
//!       utf parentTableId
//!       varint colCount
//!       utf[] columns         (colCount)
//!       utf[] parentColumns   (colCount)
//!       varint onUpdateAction
//!       varint onDeleteAction
//! ```

use crate::{
    serde::{Deserializable, DeserializeError, Serializable, SerializeError},
    Error,
};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

const CURRENT_VERSION: u64 = 1;
const CURRENT_COLUMN_VERSION: u64 = 1;
const FLAG_HAS_FK: u64 = 0b1;
const COLUMN_FLAG_HAS_DEFAULT: u64 = 0b1;

const CORRUPTED_TABLE_FILE: &str = "corrupted table file";

/// Opaque column type code. This crate never interprets it (values are opaque bytes
/// everywhere else too); it only round-trips and, for primary key columns, checks
/// membership in [`ColumnTypeCode::is_valid_primary_key_type`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ColumnTypeCode(pub u32);

impl ColumnTypeCode {
    pub const INTEGER: Self = Self(1);
    pub const LONG: Self = Self(2);
    pub const STRING: Self = Self(3);
    pub const BYTES: Self = Self(4);
    pub const TIMESTAMP: Self = Self(5);
    pub const DOUBLE: Self = Self(6);
    pub const BOOLEAN: Self = Self(7);

    /// Whether a column of this type may be used as (part of) a primary key.
    ///
    /// Floating-point and boolean columns are excluded: equality/ordering on floats is
    /// not well-behaved for a key, and a boolean key can only ever distinguish two
    /// rows.
    #[must_use]
    pub fn is_valid_primary_key_type(self) -> bool {
        matches!(
            self,
            Self::INTEGER | Self::LONG | Self::STRING | Self::BYTES | Self::TIMESTAMP
        )
    }
}

/// A single column definition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ColumnMetadata {
    pub name: String,
    pub type_code: ColumnTypeCode,
    pub serial_position: u32,
    pub default_value: Option<Vec<u8>>,
}

/// A foreign key from this table's columns to another table's primary key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForeignKeyMetadata {
    pub name: String,
    pub parent_table_id: String,
    pub columns: Vec<String>,
    pub parent_columns: Vec<String>,
    pub on_update_action: u32,
    pub on_delete_action: u32,
}

/// Full schema of one user table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableMetadata {
    pub tablespace: String,
    pub name: String,
    pub uuid: String,
    pub auto_increment: bool,
    pub max_serial_position: u32,
    pub primary_key_columns: Vec<String>,
    pub table_flags: u32,
    pub columns: Vec<ColumnMetadata>,
    pub foreign_keys: Vec<ForeignKeyMetadata>,
}

fn write_utf<W: Write>(writer: &mut W, s: &str) -> Result<(), SerializeError> {
    writer.write_u32_varint(s.len() as u32)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn read_utf<R: Read>(reader: &mut R) -> Result<String, DeserializeError> {
    let len = reader.read_u32_varint()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(std::str::from_utf8(&buf)?.to_owned())
}

fn write_bytes_array<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), SerializeError> {
    writer.write_u32_varint(bytes.len() as u32)?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_bytes_array<R: Read>(reader: &mut R) -> Result<Vec<u8>, DeserializeError> {
    let len = reader.read_u32_varint()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

impl Serializable for ColumnMetadata {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError> {
        writer.write_u64_varint(CURRENT_COLUMN_VERSION)?;

        let flags = if self.default_value.is_some() {
            COLUMN_FLAG_HAS_DEFAULT
        } else {
            0
        };
        writer.write_u64_varint(flags)?;

        write_utf(writer, &self.name)?;
        writer.write_u32_varint(self.type_code.0)?;
        writer.write_u32_varint(self.serial_position)?;

        if let Some(default_value) = &self.default_value {
            write_bytes_array(writer, default_value)?;
        }

        Ok(())
    }
}

impl Deserializable for ColumnMetadata {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError> {
        let version = reader.read_u64_varint()?;
        if version != CURRENT_COLUMN_VERSION {
            return Err(DeserializeError::InvalidHeader(CORRUPTED_TABLE_FILE));
        }

        let flags = reader.read_u64_varint()?;
        if flags & !COLUMN_FLAG_HAS_DEFAULT != 0 {
            return Err(DeserializeError::InvalidHeader(CORRUPTED_TABLE_FILE));
        }

        let name = read_utf(reader)?;
        let type_code = ColumnTypeCode(reader.read_u32_varint()?);
        let serial_position = reader.read_u32_varint()?;

        let default_value = if flags & COLUMN_FLAG_HAS_DEFAULT != 0 {
            Some(read_bytes_array(reader)?)
        } else {
            None
        };

        Ok(Self {
            name,
            type_code,
            serial_position,
            default_value,
        })
    }
}

impl Serializable for ForeignKeyMetadata {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError> {
        write_utf(writer, &self.name)?;
        write_utf(writer, &self.parent_table_id)?;

        writer.write_u32_varint(self.columns.len() as u32)?;
        for column in &self.columns {
            write_utf(writer, column)?;
        }
        for column in &self.parent_columns {
            write_utf(writer, column)?;
        }

        writer.write_u32_varint(self.on_update_action)?;
        writer.write_u32_varint(self.on_delete_action)?;

        Ok(())
    }
}

impl Deserializable for ForeignKeyMetadata {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError> {
        let name = read_utf(reader)?;
        let parent_table_id = read_utf(reader)?;

        let col_count = reader.read_u32_varint()? as usize;
        let mut columns = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            columns.push(read_utf(reader)?);
        }
        let mut parent_columns = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            parent_columns.push(read_utf(reader)?);
        }

        let on_update_action = reader.read_u32_varint()?;
        let on_delete_action = reader.read_u32_varint()?;

        Ok(Self {
            name,
            parent_table_id,
            columns,
            parent_columns,
            on_update_action,
            on_delete_action,
        })
    }
}

impl Serializable for TableMetadata {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError> {
        writer.write_u64_varint(CURRENT_VERSION)?;

        let flags = if self.foreign_keys.is_empty() { 0 } else { FLAG_HAS_FK };
        writer.write_u64_varint(flags)?;

        write_utf(writer, &self.tablespace)?;
        write_utf(writer, &self.name)?;
        write_utf(writer, &self.uuid)?;
        writer.write_u8(u8::from(self.auto_increment))?;
        writer.write_u32_varint(self.max_serial_position)?;

        #[expect(
            clippy::cast_possible_truncation,
            reason = "tables have far fewer than 256 primary key columns"
        )]
        writer.write_u8(self.primary_key_columns.len() as u8)?;
        for pk in &self.primary_key_columns {
            write_utf(writer, pk)?;
        }

        writer.write_u32_varint(self.table_flags)?;

        writer.write_u32_varint(self.columns.len() as u32)?;
        for column in &self.columns {
            column.serialize(writer)?;
        }

        if flags & FLAG_HAS_FK != 0 {
            writer.write_u32_varint(self.foreign_keys.len() as u32)?;
            for fk in &self.foreign_keys {
                fk.serialize(writer)?;
            }
        }

        Ok(())
    }
}

impl Deserializable for TableMetadata {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError> {
        let version = reader.read_u64_varint()?;
        if version != CURRENT_VERSION {
            return Err(DeserializeError::InvalidHeader(CORRUPTED_TABLE_FILE));
        }

        let flags = reader.read_u64_varint()?;
        if flags & !FLAG_HAS_FK != 0 {
            return Err(DeserializeError::InvalidHeader(CORRUPTED_TABLE_FILE));
        }

        let tablespace = read_utf(reader)?;
        let name = read_utf(reader)?;
        let uuid = read_utf(reader)?;
        let auto_increment = reader.read_u8()? != 0;
        let max_serial_position = reader.read_u32_varint()?;

        let pk_column_count = reader.read_u8()?;
        let mut primary_key_columns = Vec::with_capacity(pk_column_count as usize);
        for _ in 0..pk_column_count {
            primary_key_columns.push(read_utf(reader)?);
        }

        let table_flags = reader.read_u32_varint()?;

        let column_count = reader.read_u32_varint()? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            columns.push(ColumnMetadata::deserialize(reader)?);
        }

        let foreign_keys = if flags & FLAG_HAS_FK != 0 {
            let fk_count = reader.read_u32_varint()? as usize;
            let mut out = Vec::with_capacity(fk_count);
            for _ in 0..fk_count {
                out.push(ForeignKeyMetadata::deserialize(reader)?);
            }
            out
        } else {
            Vec::new()
        };

        Ok(Self {
            tablespace,
            name,
            uuid,
            auto_increment,
            max_serial_position,
            primary_key_columns,
            table_flags,
            columns,
            foreign_keys,
        })
    }
}

impl TableMetadata {
    /// Checks the schema-level invariants that the wire format itself cannot enforce:
    /// no duplicate column or foreign key names, auto-increment implies exactly one
    /// primary key column, and every primary key column references a column that
    /// exists and has a type valid for a key.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen_columns = std::collections::HashSet::new();
        for column in &self.columns {
            if !seen_columns.insert(column.name.as_str()) {
                return Err(Error::InvariantViolation(format!(
                    "duplicate column: {}",
                    column.name
                )));
            }
        }

        let mut seen_fks = std::collections::HashSet::new();
        for fk in &self.foreign_keys {
            if !seen_fks.insert(fk.name.as_str()) {
                return Err(Error::InvariantViolation(format!(
                    "duplicate foreign key: {}",
                    fk.name
                )));
            }
        }

        if self.auto_increment && self.primary_key_columns.len() != 1 {
            return Err(Error::InvariantViolation(
                "auto-increment requires exactly one primary key column".into(),
            ));
        }

        for pk in &self.primary_key_columns {
            let column = self
                .columns
                .iter()
                .find(|column| &column.name == pk)
                .ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "primary key references unknown column: {pk}"
                    ))
                })?;

            if !column.type_code.is_valid_primary_key_type() {
                return Err(Error::InvariantViolation(format!(
                    "invalid primary key type for column: {pk}"
                )));
            }
        }

        Ok(())
    }

    /// Returns a copy of this table with `column_name` dropped, as by `ALTER TABLE
    /// ... DROP COLUMN`.
    ///
    /// Fails, leaving `self` untouched, if `column_name` does not exist or is part of
    /// the primary key.
    pub fn alter_drop_column(&self, column_name: &str) -> crate::Result<Self> {
        if !self.columns.iter().any(|column| column.name == column_name) {
            return Err(Error::InvariantViolation(format!(
                "unknown column in ALTER: {column_name}"
            )));
        }

        let mut next = self.clone();
        next.columns.retain(|column| column.name != column_name);
        next.validate()?;

        Ok(next)
    }
}
