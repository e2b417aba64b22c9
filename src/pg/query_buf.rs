//! Pre-built Bind+Execute+Sync request buffers.
//!
//! A buffer is encoded once, outside any timed loop, so that sending it
//! later is a single socket write. Building is pure: it reads only the
//! statement metadata and the arguments.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::BuildError;
use super::protocol::{put_cstr, try_put_frame, ExecuteMessage, Format, FrontendMessage, SyncMessage};
use super::statement::PreparedStatement;
use super::types::PgValue;

/// Bind (unnamed portal, all-binary formats), Execute (no row limit) and
/// Sync for `stmt`, as one contiguous buffer.
pub fn build_prepared_query_buf(
    stmt: &PreparedStatement,
    args: &[PgValue],
) -> Result<Bytes, BuildError> {
    if args.len() != stmt.param_types.len() {
        return Err(BuildError::ParameterCount {
            statement: stmt.name.clone(),
            expected: stmt.param_types.len(),
            actual: args.len(),
        });
    }
    let param_count = i16::try_from(args.len()).map_err(|_| BuildError::TooLarge {
        what: "parameter count",
    })?;
    let column_count = i16::try_from(stmt.columns.len()).map_err(|_| BuildError::TooLarge {
        what: "result column count",
    })?;

    let mut buf = BytesMut::with_capacity(estimate_len(stmt, args));

    try_put_frame(&mut buf, b'B', |b| -> Result<(), BuildError> {
        put_cstr(b, "");
        put_cstr(b, &stmt.name);

        b.put_i16(param_count);
        for _ in 0..param_count {
            b.put_i16(Format::Binary as i16);
        }

        b.put_i16(param_count);
        for (index, (arg, &declared)) in args.iter().zip(&stmt.param_types).enumerate() {
            arg.put_binary(declared, index, b)?;
        }

        b.put_i16(column_count);
        for _ in 0..column_count {
            b.put_i16(Format::Binary as i16);
        }
        Ok(())
    })?;

    ExecuteMessage {
        portal: "",
        max_rows: 0,
    }
    .encode(&mut buf);
    SyncMessage.encode(&mut buf);

    Ok(buf.freeze())
}

fn estimate_len(stmt: &PreparedStatement, args: &[PgValue]) -> usize {
    let values: usize = args
        .iter()
        .map(|a| match a {
            PgValue::Text(s) => s.len(),
            PgValue::Bytea(b) | PgValue::Raw { data: b, .. } => b.len(),
            _ => 8,
        })
        .sum();
    // Bind header + names + formats + values, Execute (10), Sync (5)
    5 + 2 + stmt.name.len() + 6 + args.len() * 6 + values + stmt.columns.len() * 2 + 10 + 5
}
