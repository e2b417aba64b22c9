//! Benchmark context: one seeded connection with the benchmark statements
//! prepared, plus everything a timed loop needs to run without allocating.
//!
//! ```no_run
//! use pgbaseline::harness::{BenchContext, SELECT_PERSON_NAME};
//! use pgbaseline::pg::PgConfig;
//!
//! let mut ctx = BenchContext::setup(PgConfig::from_env()?)?;
//! let bufs = ctx.query_bufs(SELECT_PERSON_NAME)?;
//! for buf in &bufs {
//!     ctx.round_trip(buf)?;
//! }
//! ctx.teardown()?;
//! # Ok::<(), pgbaseline::BenchError>(())
//! ```

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::error::{BenchError, Result};
use crate::pg::{
    PgConfig, PgConnection, PgValue, PreparedStatement, ResponseScanner, ScanStrategy,
    TransactionStatus,
};
use crate::seed;

pub const SELECT_PERSON_NAME: &str = "selectPersonName";
pub const SELECT_PERSON: &str = "selectPerson";
pub const SELECT_MULTIPLE_PEOPLE: &str = "selectMultiplePeople";
pub const SELECT_LARGE_TEXT: &str = "selectLargeText";

/// Statements prepared by [`BenchContext::setup`]. Each takes one int4.
pub const STATEMENTS: [(&str, &str); 4] = [
    (
        SELECT_PERSON_NAME,
        "select first_name from person where id=$1",
    ),
    (
        SELECT_PERSON,
        "select id, first_name, last_name, sex, birth_date, weight, height, update_time
from person
where id=$1",
    ),
    (
        SELECT_MULTIPLE_PEOPLE,
        "select id, first_name, last_name, sex, birth_date, weight, height, update_time
from person
where id between $1 and $1 + 24",
    ),
    (SELECT_LARGE_TEXT, "select repeat('*', $1)"),
];

/// Fixed so that runs visit ids in the same order.
const SHUFFLE_SEED: u64 = 0x5EED_0F_1D5;

pub struct BenchContext {
    conn: PgConnection,
    scanner: ResponseScanner,
    person_ids: Vec<i32>,
}

impl BenchContext {
    /// Connect, seed, prepare [`STATEMENTS`] and shuffle person ids. Replies
    /// are drained with the framed scanner.
    pub fn setup(config: PgConfig) -> Result<Self> {
        Self::setup_with(&config, ScanStrategy::default())
    }

    pub fn setup_with(config: &PgConfig, strategy: ScanStrategy) -> Result<Self> {
        let mut conn = PgConnection::connect(config)?;
        seed::load_test_data(&mut conn)?;

        for (name, sql) in STATEMENTS {
            conn.prepare(name, sql)?;
        }

        let mut person_ids: Vec<i32> = (1..=seed::PERSON_COUNT).collect();
        person_ids.shuffle(&mut StdRng::seed_from_u64(SHUFFLE_SEED));

        debug!(
            statements = conn.statements().len(),
            people = person_ids.len(),
            ?strategy,
            "bench context ready"
        );

        Ok(Self {
            conn,
            scanner: ResponseScanner::new(strategy),
            person_ids,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::setup(PgConfig::from_env()?)
    }

    /// Person ids in shuffled order.
    pub fn person_ids(&self) -> &[i32] {
        &self.person_ids
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub fn statement(&self, name: &str) -> Result<Arc<PreparedStatement>> {
        self.conn
            .statement(name)
            .ok_or_else(|| BenchError::UnknownStatement(name.to_string()))
    }

    /// One request buffer per person id, in shuffled order.
    pub fn query_bufs(&self, name: &str) -> Result<Vec<Bytes>> {
        let stmt = self.statement(name)?;
        self.person_ids
            .iter()
            .map(|&id| build(&stmt, PgValue::Int4(id)))
            .collect()
    }

    /// A `selectLargeText` request producing `size` bytes of text.
    pub fn large_text_buf(&self, size: i32) -> Result<Bytes> {
        let stmt = self.statement(SELECT_LARGE_TEXT)?;
        build(&stmt, PgValue::Int4(size))
    }

    /// Write a pre-built buffer and drain the reply.
    #[inline]
    pub fn round_trip(&mut self, buf: &[u8]) -> Result<TransactionStatus> {
        self.conn.send_query_buf(buf)?;
        Ok(self.conn.read_until_ready(&mut self.scanner)?)
    }

    pub fn teardown(mut self) -> Result<()> {
        self.conn.close()?;
        Ok(())
    }
}

fn build(stmt: &PreparedStatement, arg: PgValue) -> Result<Bytes> {
    stmt.query_buf(&[arg]).map_err(|source| BenchError::Build {
        statement: stmt.name.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_names_are_unique() {
        let mut names: Vec<&str> = STATEMENTS.iter().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), STATEMENTS.len());
    }

    #[test]
    fn test_every_statement_takes_one_parameter() {
        for (name, sql) in STATEMENTS {
            assert!(sql.contains("$1"), "{}", name);
            assert!(!sql.contains("$2"), "{}", name);
        }
    }

    #[test]
    fn test_build_reports_statement_name() {
        let mut stmt = PreparedStatement::new(SELECT_PERSON_NAME, STATEMENTS[0].1);
        stmt.param_types = vec![crate::pg::Oid::INT4];
        assert!(build(&stmt, PgValue::Int4(7)).is_ok());

        let err = build(&stmt, PgValue::Text("7".into())).unwrap_err();
        assert!(matches!(err, BenchError::Build { ref statement, .. } if statement == SELECT_PERSON_NAME));
    }
}
