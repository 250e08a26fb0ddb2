//! Column types, text-protocol value decoding and SQL literal formatting.
//!
//! Result rows in the text protocol carry every cell as a length-encoded
//! string; the column's [`FieldType`] and UNSIGNED flag decide which
//! [`Value`] variant the text becomes.

use mywire_core::Value;
use serde::Serialize;

/// MySQL field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Map a wire type code. Codes this client does not know decode as text.
    #[must_use]
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }

    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(self, FieldType::Decimal | FieldType::NewDecimal)
    }

    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
                | FieldType::Bit
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }

    /// SQL name of the type, for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column definition flags.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// Decode one text-protocol cell.
///
/// Unsigned integers widen to the next signed variant so no value wraps;
/// an unsigned BIGINT above `i64::MAX` is kept as decimal text. Text that
/// does not parse as the declared type is returned as `Value::Text`.
pub fn decode_text_value(field_type: FieldType, data: &[u8], is_unsigned: bool) -> Value {
    let text = String::from_utf8_lossy(data);
    let fallback = || Value::Text(text.to_string());

    match field_type {
        FieldType::Tiny if is_unsigned => {
            text.parse::<u8>().map_or_else(|_| fallback(), |v| Value::SmallInt(i16::from(v)))
        }
        FieldType::Tiny => text.parse::<i8>().map_or_else(|_| fallback(), Value::TinyInt),
        FieldType::Short | FieldType::Year if is_unsigned => {
            text.parse::<u16>().map_or_else(|_| fallback(), |v| Value::Int(i32::from(v)))
        }
        FieldType::Short | FieldType::Year => {
            text.parse::<i16>().map_or_else(|_| fallback(), Value::SmallInt)
        }
        FieldType::Long | FieldType::Int24 if is_unsigned => {
            text.parse::<u32>().map_or_else(|_| fallback(), |v| Value::BigInt(i64::from(v)))
        }
        FieldType::Long | FieldType::Int24 => {
            text.parse::<i32>().map_or_else(|_| fallback(), Value::Int)
        }
        FieldType::LongLong if is_unsigned => match text.parse::<u64>() {
            Ok(v) => i64::try_from(v).map_or_else(|_| Value::Decimal(v.to_string()), Value::BigInt),
            Err(_) => fallback(),
        },
        FieldType::LongLong => text.parse::<i64>().map_or_else(|_| fallback(), Value::BigInt),
        FieldType::Float => text.parse::<f32>().map_or_else(|_| fallback(), Value::Float),
        FieldType::Double => text.parse::<f64>().map_or_else(|_| fallback(), Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.to_string()),
        FieldType::Json => serde_json::from_slice(data).map_or_else(|_| fallback(), Value::Json),
        FieldType::Null => Value::Null,
        t if t.is_blob() => Value::Bytes(data.to_vec()),
        _ => fallback(),
    }
}

/// Quote a string as a MySQL literal.
pub fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

/// Render bytes as a hex literal (`X'..'`).
pub fn escape_bytes(data: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(data.len() * 2 + 3);
    out.push_str("X'");
    for byte in data {
        let _ = write!(out, "{byte:02X}");
    }
    out.push('\'');
    out
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NULL".to_string()
    } else if f.is_infinite() {
        if f.is_sign_positive() {
            "1e308".to_string()
        } else {
            "-1e308".to_string()
        }
    } else {
        f.to_string()
    }
}

/// Format a value as a SQL literal.
pub fn format_value_for_sql(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::Float(f) => format_float(f64::from(*f)),
        Value::Double(f) => format_float(*f),
        Value::Decimal(s) => s.clone(),
        Value::Text(s) => escape_string(s),
        Value::Bytes(b) => escape_bytes(b),
        Value::Json(j) => escape_string(&j.to_string()),
    }
}

/// Build final SQL text by substituting parameters.
///
/// `?` placeholders consume parameters in order; `$N` refers to the N-th
/// parameter (1-based). Placeholders inside quoted strings, double-quoted
/// identifiers and backtick identifiers are left alone, as are placeholders
/// with no matching parameter.
pub fn interpolate_params(sql: &str, params: &[Value]) -> String {
    if params.is_empty() {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + params.len() * 16);
    let mut chars = sql.char_indices().peekable();
    let mut next_positional = 0;

    while let Some((start, ch)) = chars.next() {
        match ch {
            '?' => match params.get(next_positional) {
                Some(value) => {
                    out.push_str(&format_value_for_sql(value));
                    next_positional += 1;
                }
                None => out.push('?'),
            },
            '$' => {
                let digits_start = start + 1;
                let mut digits_end = digits_start;
                while let Some(&(i, c)) = chars.peek() {
                    if !c.is_ascii_digit() {
                        break;
                    }
                    digits_end = i + 1;
                    chars.next();
                }
                let digits = &sql[digits_start..digits_end];
                let value = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| params.get(i));
                match value {
                    Some(value) => out.push_str(&format_value_for_sql(value)),
                    None => {
                        out.push('$');
                        out.push_str(digits);
                    }
                }
            }
            '\'' | '"' | '`' => {
                out.push(ch);
                // Copy through the closing quote; a doubled or backslash-escaped
                // quote stays inside. Backticks take no backslash escapes.
                while let Some((_, c)) = chars.next() {
                    out.push(c);
                    if c == '\\' && ch != '`' {
                        if let Some((_, escaped)) = chars.next() {
                            out.push(escaped);
                        }
                    } else if c == ch {
                        if chars.peek().map(|&(_, n)| n) == Some(ch) {
                            out.push(ch);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            _ => out.push(ch),
        }
    }

    out
}
