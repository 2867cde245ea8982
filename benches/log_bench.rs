//! Replicated log merge overhead benchmarking.

use std::fmt;
use std::time::Duration;

use metasync::{FileMetaData, LogEntry, MetasyncError, RaftLog};

use rand::distributions::Alphanumeric;
use rand::Rng;

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

use lazy_static::lazy_static;

static LOG_LENS: [usize; 3] = [100, 1000, 10000];
static BATCHES: [usize; 3] = [1, 16, 256];

const MAX_ENTRIES: usize = 10000 + 256;

struct BenchId(pub usize, pub usize);

impl fmt::Display for BenchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+{}", self.0, self.1)
    }
}

lazy_static!(
    /// Pre-generated update entries of term 1 with random filenames and
    /// block hash lists.
    static ref MOM_ENTRIES: Vec<LogEntry> = {
        let mut rng = rand::thread_rng();
        (0..MAX_ENTRIES)
            .map(|i| {
                let filename: String = (&mut rng)
                    .sample_iter(&Alphanumeric)
                    .take(16)
                    .map(char::from)
                    .collect();
                let hashes = (0..4)
                    .map(|_| format!("{:064x}", rng.gen::<u128>()))
                    .collect();
                LogEntry {
                    term: 1,
                    operation: Some(FileMetaData::new(
                        filename, i as i32, hashes,
                    )),
                }
            })
            .collect()
    };
);

fn base_log(len: usize) -> Result<RaftLog, MetasyncError> {
    let mut log = RaftLog::new();
    log.merge(-1, MOM_ENTRIES[..len].to_vec())?;
    Ok(log)
}

/// Appends a fresh batch at the log end.
fn merge_append(
    log: &RaftLog,
    len: usize,
    batch: usize,
) -> Result<(), MetasyncError> {
    let mut log = log.clone();
    let incoming = MOM_ENTRIES[len..len + batch].to_vec();
    let matched = log.merge(len as i64 - 1, incoming)?;
    black_box(matched);
    Ok(())
}

/// Re-delivers the tail the log already holds plus nothing new.
fn merge_duplicate(
    log: &RaftLog,
    len: usize,
    batch: usize,
) -> Result<(), MetasyncError> {
    let mut log = log.clone();
    let start = len - batch;
    let incoming = MOM_ENTRIES[start..len].to_vec();
    let matched = log.merge(start as i64 - 1, incoming)?;
    black_box(matched);
    Ok(())
}

/// Overwrites the log's uncommitted tail with entries of a newer term.
fn merge_conflict(
    log: &RaftLog,
    len: usize,
    batch: usize,
) -> Result<(), MetasyncError> {
    let mut log = log.clone();
    let start = len - batch;
    let newer = (0..batch).map(|_| LogEntry::noop(2)).collect();
    let matched = log.merge(start as i64 - 1, newer)?;
    black_box(matched);
    Ok(())
}

fn log_bench_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_bench");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(3));

    for len in LOG_LENS {
        let log = base_log(len).unwrap();
        for batch in BATCHES {
            let id = BenchId(len, batch);
            group.bench_with_input(
                BenchmarkId::new("append", &id),
                &id,
                |b, id| b.iter(|| merge_append(&log, id.0, id.1)),
            );
            group.bench_with_input(
                BenchmarkId::new("duplicate", &id),
                &id,
                |b, id| b.iter(|| merge_duplicate(&log, id.0, id.1)),
            );
            group.bench_with_input(
                BenchmarkId::new("conflict", &id),
                &id,
                |b, id| b.iter(|| merge_conflict(&log, id.0, id.1)),
            );
        }
    }

    group.finish();
}

criterion_group!(benches, log_bench_group);
criterion_main!(benches);
