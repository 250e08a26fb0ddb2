//! Response payload decoding: OK and ERR packets, column definitions and
//! text-protocol rows.

use std::sync::Arc;

use mywire_core::{ColumnInfo, Error, Result, Row, ServerError, Value};
use serde::Serialize;

use super::cursor::{ByteCursor, NULL_MARKER};
use crate::types::{FieldType, column_flags, decode_text_value};

/// Decoded OK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

/// Decode an OK payload (leading 0x00 included).
///
/// Only the two counters are required; status and warnings default to 0
/// when a server omits them.
pub fn parse_ok_packet(payload: &[u8]) -> Result<OkPacket> {
    let mut cursor = ByteCursor::new(payload);
    cursor.skip(1)?;
    let affected_rows = cursor.read_encoded_len()?;
    let last_insert_id = cursor.read_encoded_len()?;
    let status_flags = if cursor.remaining() >= 2 {
        cursor.read_u16_le()?
    } else {
        0
    };
    let warnings = if cursor.remaining() >= 2 {
        cursor.read_u16_le()?
    } else {
        0
    };
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
    })
}

/// Decode an ERR payload into a [`ServerError`].
///
/// Layout after the 0xFF marker: 2-byte code, optional `#` + 5-byte SQL
/// state, then the message text.
pub fn parse_err_packet(payload: &[u8]) -> Result<ServerError> {
    let mut cursor = ByteCursor::new(payload);
    if cursor.peek() == Some(0xFF) {
        cursor.skip(1)?;
    }
    let code = cursor.read_u16_le()?;
    let sql_state = if cursor.peek() == Some(b'#') {
        cursor.skip(1)?;
        Some(cursor.read_encoded_string(5)?)
    } else {
        None
    };
    let message = cursor.read_rest_string();
    Ok(ServerError {
        code,
        sql_state,
        message,
    })
}

/// Metadata for one result column, in the order the server sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldInfo {
    pub catalog: String,
    pub schema: String,
    /// Table name or alias
    pub table: String,
    pub org_table: String,
    /// Column name or alias
    pub name: String,
    pub org_name: String,
    /// Collation id of the column
    pub charset: u16,
    /// Maximum display length
    pub length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl FieldInfo {
    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.flags & column_flags::BINARY != 0
    }
}

/// Decode a Protocol::ColumnDefinition41 payload.
pub fn parse_field_info(payload: &[u8]) -> Result<FieldInfo> {
    let mut cursor = ByteCursor::new(payload);
    let catalog = cursor.read_lenenc_string()?;
    let schema = cursor.read_lenenc_string()?;
    let table = cursor.read_lenenc_string()?;
    let org_table = cursor.read_lenenc_string()?;
    let name = cursor.read_lenenc_string()?;
    let org_name = cursor.read_lenenc_string()?;
    // Length of the fixed-size block that follows (always 0x0c).
    cursor.read_encoded_len()?;
    let charset = cursor.read_u16_le()?;
    let length = cursor.read_u32_le()?;
    let column_type = FieldType::from_u8(cursor.read_u8()?);
    let flags = cursor.read_u16_le()?;
    let decimals = cursor.read_u8()?;

    Ok(FieldInfo {
        catalog,
        schema,
        table,
        org_table,
        name,
        org_name,
        charset,
        length,
        column_type,
        flags,
        decimals,
    })
}

/// Decode a text-protocol row, one cell per field in `fields` order.
pub fn parse_text_row(
    payload: &[u8],
    fields: &[FieldInfo],
    columns: &Arc<ColumnInfo>,
) -> Result<Row> {
    let mut cursor = ByteCursor::new(payload);
    let mut values = Vec::with_capacity(fields.len());

    for field in fields {
        if cursor.peek() == Some(NULL_MARKER) {
            cursor.skip(1)?;
            values.push(Value::Null);
            continue;
        }
        let data = cursor.read_lenenc_bytes().map_err(|e| {
            Error::decode(format!("row cell for column '{}': {}", field.name, e))
        })?;
        values.push(decode_text_value(field.column_type, data, field.is_unsigned()));
    }

    Ok(Row::with_columns(Arc::clone(columns), values))
}

/// Outcome of a statement that did not produce rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WriteResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
}

/// What `Connection::execute` returns: a write summary or a result set,
/// never both.
#[derive(Debug, Clone)]
pub enum ExecuteResult {
    Write(WriteResult),
    ResultSet { fields: Vec<FieldInfo>, rows: Vec<Row> },
}

impl ExecuteResult {
    /// Rows of a result set, if this is one.
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            ExecuteResult::ResultSet { rows, .. } => Some(rows),
            ExecuteResult::Write(_) => None,
        }
    }

    /// Column metadata of a result set, if this is one.
    pub fn fields(&self) -> Option<&[FieldInfo]> {
        match self {
            ExecuteResult::ResultSet { fields, .. } => Some(fields),
            ExecuteResult::Write(_) => None,
        }
    }

    /// The write summary, if this is a write.
    pub fn write_result(&self) -> Option<WriteResult> {
        match self {
            ExecuteResult::Write(w) => Some(*w),
            ExecuteResult::ResultSet { .. } => None,
        }
    }
}

/// What `Connection::query` returns: just the rows, or the write summary
/// for statements without a result set.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Rows(Vec<Row>),
    Write(WriteResult),
}

impl From<ExecuteResult> for QueryResult {
    fn from(result: ExecuteResult) -> Self {
        match result {
            ExecuteResult::Write(w) => QueryResult::Write(w),
            ExecuteResult::ResultSet { rows, .. } => QueryResult::Rows(rows),
        }
    }
}

impl QueryResult {
    /// Take the rows, or an empty vector for a write.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows(rows) => rows,
            QueryResult::Write(_) => Vec::new(),
        }
    }
}
