//! Core types for the mywire MySQL client.
//!
//! This crate holds the driver-independent pieces:
//!
//! - `Error` taxonomy shared by every operation
//! - `Value` for dynamically-typed cells and parameters
//! - `Row` with index and name based access

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, DecodeError, Error, ReadError,
    ResponseTimeoutError, Result, ServerError, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
