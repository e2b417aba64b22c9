//! Benchmark dataset: a `person` table with a fixed number of rows.
//!
//! Rows are generated server-side from `generate_series`, so two seeded
//! databases hold identical data and ids run from 1 to [`PERSON_COUNT`].

use tracing::debug;

use crate::error::{BenchError, Result};
use crate::pg::PgConnection;

/// Rows inserted by [`load_test_data`].
pub const PERSON_COUNT: i32 = 10_000;

const DROP_PERSON: &str = "drop table if exists person";

const CREATE_PERSON: &str = "create table person(
  id serial primary key,
  first_name text not null,
  last_name text not null,
  sex text not null,
  birth_date date not null,
  weight int4 not null,
  height int4 not null,
  update_time timestamptz not null
)";

fn insert_people() -> String {
    format!(
        "insert into person(first_name, last_name, sex, birth_date, weight, height, update_time)
select
  (array['Adam','Beth','Carl','Dana','Evan','Fran','Gwen','Hugo','Iris','Jack'])[n % 10 + 1],
  (array['Smith','Jones','Brown','Davis','Miller','Wilson','Moore','Taylor','Thomas','Clark'])[(n / 10) % 10 + 1],
  case when n % 2 = 0 then 'female' else 'male' end,
  date '1950-01-01' + (n * 7) % 18250,
  50 + n % 75,
  150 + n % 50,
  timestamptz '2020-01-01 00:00:00+00' + n * interval '1 minute'
from generate_series(1, {}) n",
        PERSON_COUNT
    )
}

/// Recreate and fill the `person` table, then refresh planner statistics.
///
/// Run this before preparing statements that reference `person`: dropping
/// the table invalidates any plan that depends on it.
pub fn load_test_data(conn: &mut PgConnection) -> Result<()> {
    let insert = insert_people();
    let steps: [(&'static str, &str); 4] = [
        ("drop", DROP_PERSON),
        ("create", CREATE_PERSON),
        ("insert", &insert),
        ("analyze", "analyze person"),
    ];

    for (step, sql) in steps {
        let tags = conn
            .simple_query(sql)
            .map_err(|source| BenchError::Seed { step, source })?;
        debug!(step, tags = ?tags, "seed step done");
    }
    Ok(())
}
