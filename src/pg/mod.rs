//! Minimal PostgreSQL wire protocol client for round-trip baselines.
//!
//! This module provides a blocking client that:
//! - Uses the binary format for every parameter and result column
//! - Prepares named statements once per connection
//! - Encodes Bind+Execute+Sync requests ahead of time
//! - Drains replies without decoding rows
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `connection`: Startup, authentication, prepare and raw socket access
//! - `types`: Type OIDs and binary parameter encoding
//! - `statement`: Prepared statements and the per-connection registry
//! - `query_buf`: Pre-built request buffers
//! - `scanner`: Reading replies until ReadyForQuery

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod query_buf;
pub mod scanner;
pub mod scram;
pub mod statement;
pub mod types;


pub use config::PgConfig;
pub use connection::PgConnection;
pub use error::{BuildError, ConnectError, PgError, PgResult, ServerError};
pub use protocol::TransactionStatus;
pub use query_buf::build_prepared_query_buf;
pub use scanner::{ResponseScanner, ScanStrategy};
pub use statement::{PreparedStatement, StatementRegistry};
pub use types::{Oid, PgValue};
