//! Per-worker latency-aware scheduler: ranks upstreams by a predicted
//! per-query delay and always dispatches to the fastest, while
//! opportunistically probing idle upstreams so a slow-when-busy server can
//! climb back up the ranking once it proves itself fast-when-idle.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use crate::query::QueryContext;
use crate::resolver::TlsResolver;

/// Samples kept per upstream for the least-squares slope estimate.
const RING_SIZE: usize = 16;
/// An idle-probe candidate is only used if its current load is at or below
/// this many outstanding queries.
const IDLE_PROBE_LOAD_THRESHOLD: usize = 3;
/// Applied to a latency sample recorded after the query had already
/// expired, so upstreams that blew a deadline lose rank faster.
const EXPIRED_PENALTY_NUMERATOR: u64 = 3; // x1.5 == 3/2
const EXPIRED_PENALTY_DENOMINATOR: u64 = 2;
/// Fixed-point scale applied to the slope before dividing, to keep
/// precision with integer millisecond latencies.
const FIXED_POINT_SCALE: i64 = 64;

/// Ring buffer of the last `RING_SIZE` round-trip latencies for one
/// upstream, plus the bookkeeping needed to rank it against its peers.
struct PerformanceRecord {
    samples: RefCell<Vec<u32>>, // milliseconds, oldest-first once full
    sum: Cell<u64>,
    load: Cell<usize>,
    estimated_delay: Cell<u64>,
}

impl PerformanceRecord {
    fn new() -> Self {
        Self {
            samples: RefCell::new(Vec::with_capacity(RING_SIZE)),
            sum: Cell::new(0),
            load: Cell::new(0),
            estimated_delay: Cell::new(0),
        }
    }

    fn record_latency(&self, latency_ms: u32, penalize: bool) {
        let latency_ms = if penalize {
            ((latency_ms as u64 * EXPIRED_PENALTY_NUMERATOR) / EXPIRED_PENALTY_DENOMINATOR) as u32
        } else {
            latency_ms
        };

        let mut samples = self.samples.borrow_mut();
        if samples.len() == RING_SIZE {
            let oldest = samples.remove(0);
            self.sum.set(self.sum.get() - oldest as u64);
        }
        samples.push(latency_ms);
        self.sum.set(self.sum.get() + latency_ms as u64);
        drop(samples);

        self.recompute_estimate();
    }

    fn set_load(&self, load: usize) {
        self.load.set(load);
        self.recompute_estimate();
    }

    fn average(&self) -> u64 {
        let samples = self.samples.borrow();
        if samples.is_empty() {
            0
        } else {
            self.sum.get() / samples.len() as u64
        }
    }

    /// `estimated_delay = average` while fewer than `RING_SIZE` samples have
    /// been collected; otherwise `average + slope * (load + 1)`, with the
    /// slope computed over the `RING_SIZE` most recent samples (x = 0..N-1
    /// in arrival order) and scaled by 64 before dividing to preserve
    /// precision in integer-millisecond arithmetic.
    fn recompute_estimate(&self) {
        let samples = self.samples.borrow();
        let average = self.average();
        if samples.len() < RING_SIZE {
            self.estimated_delay.set(average);
            return;
        }

        let slope_scaled = least_squares_slope_scaled(&samples);
        let load_factor = self.load.get() as i64 + 1;
        let adjustment = (slope_scaled * load_factor) / FIXED_POINT_SCALE;
        let estimate = average as i64 + adjustment;
        self.estimated_delay.set(estimate.max(0) as u64);
    }
}

/// Least-squares slope of `y` against `x = 0..n-1`, scaled by
/// [`FIXED_POINT_SCALE`] and rounded toward zero. Standard closed form:
/// `slope = (n*sum(xy) - sum(x)*sum(y)) / (n*sum(x^2) - sum(x)^2)`.
fn least_squares_slope_scaled(samples: &[u32]) -> i64 {
    let n = samples.len() as i64;
    if n < 2 {
        return 0;
    }
    let sum_x: i64 = (0..n).sum();
    let sum_x2: i64 = (0..n).map(|x| x * x).sum();
    let sum_y: i64 = samples.iter().map(|&y| y as i64).sum();
    let sum_xy: i64 = samples
        .iter()
        .enumerate()
        .map(|(x, &y)| x as i64 * y as i64)
        .sum();

    let denom = n * sum_x2 - sum_x * sum_x;
    if denom == 0 {
        return 0;
    }
    let numer = n * sum_xy - sum_x * sum_y;
    (numer * FIXED_POINT_SCALE) / denom
}

struct Upstream {
    resolver: TlsResolver,
    record: PerformanceRecord,
}

/// Owns every upstream for one I/O worker and ranks them by estimated
/// delay. Never shared across threads.
pub struct Dispatcher {
    upstreams: Vec<Upstream>,
    /// Indices into `upstreams`, kept sorted by estimated delay ascending
    /// (ties broken by index).
    ranking: RefCell<Vec<usize>>,
    idle_probe_cursor: Cell<usize>,
}

impl Dispatcher {
    pub fn new(resolvers: Vec<TlsResolver>) -> Self {
        let upstreams: Vec<Upstream> = resolvers
            .into_iter()
            .map(|resolver| Upstream {
                resolver,
                record: PerformanceRecord::new(),
            })
            .collect();
        let ranking = RefCell::new((0..upstreams.len()).collect());
        Self {
            upstreams,
            ranking,
            idle_probe_cursor: Cell::new(0),
        }
    }

    pub fn spawn_all(&self) {
        for upstream in &self.upstreams {
            upstream.resolver.spawn();
        }
    }

    /// Dispatch one query: primary goes to the lowest-estimated-delay
    /// upstream; if at least two upstreams exist, an idle-probe copy also
    /// goes to the next round-robin candidate whose load is at or below the
    /// threshold.
    pub fn dispatch(self: &Rc<Self>, query: &Rc<QueryContext>) {
        if self.upstreams.is_empty() {
            return;
        }
        let primary = self.ranking.borrow()[0];
        self.send_to(primary, query, Instant::now());

        if self.upstreams.len() >= 2 {
            if let Some(probe) = self.pick_idle_probe(primary) {
                self.send_to(probe, query, Instant::now());
            }
        }
    }

    fn pick_idle_probe(&self, primary: usize) -> Option<usize> {
        let count = self.upstreams.len();
        for offset in 0..count {
            let idx = (self.idle_probe_cursor.get() + offset) % count;
            self.idle_probe_cursor.set((idx + 1) % count);
            if idx == primary {
                continue;
            }
            if self.upstreams[idx].record.load.get() <= IDLE_PROBE_LOAD_THRESHOLD {
                return Some(idx);
            }
        }
        None
    }

    fn send_to(self: &Rc<Self>, idx: usize, query: &Rc<QueryContext>, started: Instant) {
        let upstream = &self.upstreams[idx];
        query.outstanding.set(query.outstanding.get() + 1);
        upstream.record.set_load(upstream.record.load.get() + 1);
        self.rerank();

        upstream.resolver.submit(Rc::clone(query));

        let dispatcher = Rc::clone(self);
        let query = Rc::clone(query);
        tokio::task::spawn_local(async move {
            query.wait_for_completion().await;
            dispatcher.complete(idx, &query, started);
        });
    }

    /// Record the measured latency for this upstream regardless of which
    /// resolver won the race (both still count toward ranking), apply the
    /// expired-penalty if this completion observed the query past its
    /// deadline, and re-rank.
    fn complete(&self, idx: usize, query: &Rc<QueryContext>, started: Instant) {
        let upstream = &self.upstreams[idx];
        let latency_ms = started.elapsed().as_millis().min(u32::MAX as u128) as u32;
        let penalize = query.status() == crate::query::QueryStatus::Expired;
        upstream.record.record_latency(latency_ms, penalize);
        upstream.record.set_load(upstream.record.load.get().saturating_sub(1));
        query.outstanding.set(query.outstanding.get().saturating_sub(1));
        self.rerank();
    }

    fn rerank(&self) {
        let mut ranking = self.ranking.borrow_mut();
        ranking.sort_by_key(|&idx| (self.upstreams[idx].record.estimated_delay.get(), idx));
    }
}

/// Exposes the ring-buffer recompute path to the criterion benchmark, which
/// lives outside this crate and cannot see [`PerformanceRecord`] directly.
#[doc(hidden)]
pub fn record_latency_sample_for_bench(latency_ms: u32) -> u64 {
    let record = PerformanceRecord::new();
    for i in 0..RING_SIZE - 1 {
        record.record_latency(10 + i as u32, false);
    }
    record.record_latency(latency_ms, false);
    record.estimated_delay.get()
}
