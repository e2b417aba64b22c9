use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tracing_subscriber::EnvFilter;

use pgbaseline::harness::{
    BenchContext, SELECT_MULTIPLE_PEOPLE, SELECT_PERSON, SELECT_PERSON_NAME,
};
use pgbaseline::pg::{PgConfig, ScanStrategy};

const LARGE_TEXT_SIZES: [i32; 5] = [1024, 8 * 1024, 64 * 1024, 512 * 1024, 4096 * 1024];

fn context(strategy: ScanStrategy) -> BenchContext {
    let config = PgConfig::from_env().expect("PG* environment");
    BenchContext::setup_with(&config, strategy).expect("benchmark setup (is PostgreSQL running?)")
}

fn bench_prepared(c: &mut Criterion, ctx: &mut BenchContext, group_name: &str) {
    let mut group = c.benchmark_group(group_name);

    for (label, stmt) in [
        ("single_short_value", SELECT_PERSON_NAME),
        ("single_row", SELECT_PERSON),
        ("multiple_rows", SELECT_MULTIPLE_PEOPLE),
    ] {
        let bufs = ctx.query_bufs(stmt).expect("query buffers");
        let mut i = 0;
        group.bench_function(label, |b| {
            b.iter(|| {
                let buf = &bufs[i % bufs.len()];
                i += 1;
                ctx.round_trip(buf).expect("round trip")
            })
        });
    }

    for size in LARGE_TEXT_SIZES {
        let buf = ctx.large_text_buf(size).expect("large text buffer");
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("large_text", size), &buf, |b, buf| {
            b.iter(|| ctx.round_trip(buf).expect("round trip"))
        });
    }

    group.finish();
}

fn bench_raw_select(c: &mut Criterion) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    for (name, strategy) in [
        ("raw_framed", ScanStrategy::Framed),
        ("raw_tail_match", ScanStrategy::TailMatch),
    ] {
        let mut ctx = context(strategy);
        bench_prepared(c, &mut ctx, name);
        ctx.teardown().expect("teardown");
    }
}

criterion_group!(benches, bench_raw_select);
criterion_main!(benches);
