//! Benchmarks of hoth-traces.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bursty::BurstyBuilder;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fxhash::FxHashSet;

use hoth_traces::{CallFrame, TraceStorage};

criterion_main!(control, single_threaded, multi_threaded,);

criterion_group!(control, control_all, control_unique,);

//  Time to insert every trace of the synthetic capture (8,192) in a pre-sized FxHashSet.
//
//  This benchmark represents the performance goal: deduplication without the overhead of atomic operations, of
//  copying the frames, or of hashing with MurmurHash64A.
fn control_all(c: &mut Criterion) {
    control_impl(c, "control all", corpus::get_traces());
}

//  Time to insert every unique trace of the synthetic capture (~1,024) in a pre-sized FxHashSet.
fn control_unique(c: &mut Criterion) {
    control_impl(c, "control unique", corpus::get_unique());
}

fn control_impl(c: &mut Criterion, root: &str, traces: &'static [Vec<CallFrame>]) {
    let name = format!("{root} ({})", traces.len());
    let unique = corpus::get_unique().len();

    c.bench_function(&name, |b| {
        b.iter(|| {
            let mut set = FxHashSet::default();
            set.reserve(unique);

            for trace in traces {
                set.insert(&trace[..]);
            }

            black_box(set)
        })
    });
}

criterion_group!(single_threaded, single_threaded_all, single_threaded_unique);

//  Time to insert every trace of the synthetic capture (8,192) in a single thread.
fn single_threaded_all(c: &mut Criterion) {
    let traces = corpus::get_traces();
    let name = format!("single-threaded all ({})", traces.len());

    c.bench_function(&name, |b| b.iter(|| single_threaded_impl(traces)));
}

//  Time to insert every unique trace of the synthetic capture (~1,024) in a single thread.
fn single_threaded_unique(c: &mut Criterion) {
    let traces = corpus::get_unique();
    let name = format!("single-threaded unique ({})", traces.len());

    c.bench_function(&name, |b| b.iter(|| single_threaded_impl(traces)));
}

fn single_threaded_impl(traces: &[Vec<CallFrame>]) {
    let storage = TraceStorage::new().unwrap();

    for trace in traces {
        let result = storage.put(trace);

        let _ = black_box(result);
    }
}

criterion_group!(
    multi_threaded,
    multi_threaded_replicas_all,
    multi_threaded_replicas_unique,
    multi_threaded_coop_all,
    multi_threaded_coop_unique,
);

//  Worst time to insert every trace of the synthetic capture (8,192) by N threads in parallel.
//
//  Many collisions.
fn multi_threaded_replicas_all(c: &mut Criterion) {
    multi_threaded_replicas_impl(c, "multi-threaded replicas all", corpus::get_traces());
}

//  Worst time to insert every unique trace of the synthetic capture (~1,024) by N threads in parallel.
//
//  All collisions.
fn multi_threaded_replicas_unique(c: &mut Criterion) {
    multi_threaded_replicas_impl(c, "multi-threaded replicas unique", corpus::get_unique());
}

//  Worst time to insert 1/N of the traces of the synthetic capture (8,192) by N threads in parallel.
//
//  Collisions are occasional.
fn multi_threaded_coop_all(c: &mut Criterion) {
    multi_threaded_coop_impl(c, "multi-threaded coop all", corpus::get_traces());
}

//  Worst time to insert 1/N of the unique traces of the synthetic capture (~1,024) by N threads in parallel.
//
//  No true collisions, but hash collisions.
fn multi_threaded_coop_unique(c: &mut Criterion) {
    multi_threaded_coop_impl(c, "multi-threaded coop unique", corpus::get_unique());
}

const NUMBER_THREADS: [usize; 3] = [2, 4, 8];

fn multi_threaded_replicas_impl(c: &mut Criterion, root: &str, traces: &'static [Vec<CallFrame>]) {
    for threads in NUMBER_THREADS {
        let name = format!("{root} ({} each) {threads}T", traces.len());

        c.bench_function(&name, |b| {
            b.iter_custom(|n| {
                let mut elapsed = Duration::default();

                for _ in 0..n {
                    let locals: Vec<_> = vec![Duration::default(); threads];

                    let mut builder = BurstyBuilder::new(Arc::new(TraceStorage::new().unwrap()), locals);

                    builder.add_simple_step(|| {
                        move |storage: &Arc<TraceStorage>, local: &mut Duration| {
                            let start = Instant::now();

                            for trace in traces {
                                let result = storage.put(trace);

                                let _ = black_box(result);
                            }

                            *local = start.elapsed();
                        }
                    });

                    let bursty = builder.launch(1);
                    let locals = bursty.into_locals();

                    elapsed += locals.into_iter().max().unwrap();
                }

                elapsed
            })
        });
    }
}

fn multi_threaded_coop_impl(c: &mut Criterion, root: &str, traces: &'static [Vec<CallFrame>]) {
    for threads in NUMBER_THREADS {
        let name = format!("{root} ({} each) {threads}T", traces.len() / threads);

        c.bench_function(&name, |b| {
            b.iter_custom(|n| {
                let mut elapsed = Duration::default();

                for _ in 0..n {
                    let n_traces = traces.len() / threads;

                    let locals: Vec<_> = (0..threads)
                        .map(|i| {
                            let traces = &traces[(i * n_traces)..((i + 1) * n_traces)];

                            (Duration::default(), traces)
                        })
                        .collect();

                    let mut builder = BurstyBuilder::new(Arc::new(TraceStorage::new().unwrap()), locals);

                    builder.add_simple_step(|| {
                        move |storage: &Arc<TraceStorage>, local| {
                            let start = Instant::now();

                            for trace in local.1 {
                                let result = storage.put(trace);

                                let _ = black_box(result);
                            }

                            local.0 = start.elapsed();
                        }
                    });

                    let bursty = builder.launch(1);
                    let locals = bursty.into_locals();

                    elapsed += locals.into_iter().map(|t| t.0).max().unwrap();
                }

                elapsed
            })
        });
    }
}

//  A synthetic corpus of call traces, in two forms:
//  -   A sequence of traces, with the duplication profile of a real capture.
//  -   A sequence of _unique_ traces, in the same order as above, minus duplicates.
mod corpus {
    use std::{collections::HashSet, sync::OnceLock};

    use hoth_traces::CallFrame;

    static TRACES: OnceLock<Vec<Vec<CallFrame>>> = OnceLock::new();

    static UNIQUE: OnceLock<Vec<Vec<CallFrame>>> = OnceLock::new();

    const NUMBER_TRACES: usize = 8192;
    const NUMBER_HOT_SPOTS: u64 = 1024;

    pub(super) fn get_traces() -> &'static [Vec<CallFrame>] {
        TRACES.get_or_init(|| {
            let mut state = 0x243f_6a88_85a3_08d3u64;

            (0..NUMBER_TRACES)
                .map(|_| {
                    state = next(state);

                    trace_of(state % NUMBER_HOT_SPOTS)
                })
                .collect()
        })
    }

    pub(super) fn get_unique() -> &'static [Vec<CallFrame>] {
        UNIQUE.get_or_init(|| {
            let mut seen = HashSet::new();
            let mut dedup = Vec::new();

            for trace in get_traces() {
                if seen.insert(trace.clone()) {
                    dedup.push(trace.clone());
                }
            }

            dedup
        })
    }

    //  Generates the trace of one synthetic sample point; distinct seeds yield distinct traces.
    fn trace_of(seed: u64) -> Vec<CallFrame> {
        let mut state = next(seed.wrapping_add(0x9e37_79b9_7f4a_7c15));

        let depth = 1 + (state % 24) as usize;

        (0..depth)
            .map(|index| {
                state = next(state);

                CallFrame {
                    //  The first frame carries the seed, guaranteeing per-seed uniqueness.
                    function: if index == 0 { seed } else { state },
                    position: (state >> 48) as i32,
                    kind: (index == 0) as i32,
                }
            })
            .collect()
    }

    fn next(state: u64) -> u64 {
        state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407)
    }
} // mod corpus
