//! pgbaseline: the cheapest possible PostgreSQL round trip.
//!
//! Statements are prepared once, requests are encoded ahead of time, and
//! replies are drained without decoding, so a timed loop measures little
//! more than the network and the server.

pub mod error;
pub mod harness;
pub mod pg;
pub mod seed;

pub use error::BenchError;
pub use harness::BenchContext;
pub use pg::{PgConfig, PgConnection, PgError, PgResult};
