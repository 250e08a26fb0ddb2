//! MySQL/MariaDB wire-protocol client.
//!
//! This crate speaks the MySQL client/server protocol directly over a
//! blocking TCP socket. It provides:
//!
//! - Packet framing with sequence numbers and 16MB split/reassembly
//! - Handshake and `mysql_native_password` authentication
//! - Text-protocol queries with result-set decoding
//! - A per-read response timeout that closes the connection on expiry
//! - The pre-5.7 EOF-after-fields quirk, keyed on the server version
//!
//! # Example
//!
//! ```rust,no_run
//! use mywire::{ClientConfig, Connection, ExecuteResult, Value};
//!
//! # fn main() -> mywire::Result<()> {
//! let config = ClientConfig::new()
//!     .host("localhost")
//!     .user("root")
//!     .database("shop")
//!     .charset("utf8mb4");
//!
//! let mut conn = Connection::new(config);
//! conn.connect()?;
//!
//! match conn.execute("SELECT id, name FROM users WHERE id = ?", &[Value::Int(1)])? {
//!     ExecuteResult::ResultSet { fields, rows } => {
//!         println!("{} columns, {} rows", fields.len(), rows.len());
//!     }
//!     ExecuteResult::Write(w) => println!("{} rows affected", w.affected_rows),
//! }
//! conn.close();
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod types;
pub mod version;

pub use config::ClientConfig;
pub use connection::{CloseHandle, Connection, ConnectionState};
pub use protocol::{ExecuteResult, FieldInfo, QueryResult, WriteResult};
pub use types::{FieldType, interpolate_params};
pub use version::less_than_57;

pub use mywire_core::{
    ColumnInfo, ConnectionErrorKind, Error, FromValue, Result, Row, ServerError, Value,
};
