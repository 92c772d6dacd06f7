//! Turning per-worker traces into per-second throughput.

use std::time::Duration;

use crate::{Timestamp, TimestampTrace};

/// The throughput of a run, one bucket per second since zero time.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct AggregatedSeries {
    /// `per_worker[w][s]` is the number of operations worker `w` completed in second `s`.
    pub per_worker: Vec<Vec<u64>>,
    /// The number of operations across all workers, per second.
    pub sum: Vec<u64>,
    /// `sum` divided by the number of workers, per second.
    pub average: Vec<f64>,
}

impl AggregatedSeries {
    /// The number of one-second buckets.
    pub fn len(&self) -> usize {
        self.sum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sum.is_empty()
    }

    /// The number of operations across all workers and all seconds.
    pub fn total(&self) -> u64 {
        self.sum.iter().sum()
    }
}

/// Bucket every trace into whole seconds since `zero_time` and combine them across workers.
///
/// A timestamp `t` lands in bucket `floor(t - zero_time)`.  Timestamps before `zero_time` are
/// discarded.  The series covers every second from zero through the last one observed, with zeros
/// for seconds nobody was active in; a run that observed nothing is a single empty bucket.
/// Buckets past three burst durations are kept, but logged, because they point at stragglers.
pub fn aggregate(
    traces: &[TimestampTrace],
    zero_time: Timestamp,
    burst_duration: Duration,
) -> AggregatedSeries {
    let mut per_worker = traces
        .iter()
        .map(|trace| {
            let mut buckets: Vec<u64> = Vec::new();
            for ts in trace {
                let offset = (ts - zero_time).floor();
                if offset < 0.0 {
                    continue;
                }
                let sec = offset as usize;
                if buckets.len() <= sec {
                    buckets.resize(sec + 1, 0);
                }
                buckets[sec] += 1;
            }
            buckets
        })
        .collect::<Vec<_>>();
    let num_buckets = per_worker.iter().map(Vec::len).max().unwrap_or(0).max(1);
    for buckets in per_worker.iter_mut() {
        buckets.resize(num_buckets, 0);
    }
    let window = 3 * burst_duration.as_secs() as usize;
    if num_buckets > window {
        tracing::warn!(
            buckets = num_buckets,
            window,
            "operations observed long after the burst should have ended"
        );
    }
    let sum = (0..num_buckets)
        .map(|sec| per_worker.iter().map(|w| w[sec]).sum::<u64>())
        .collect::<Vec<_>>();
    let workers = traces.len().max(1) as f64;
    let average = sum.iter().map(|s| *s as f64 / workers).collect();
    AggregatedSeries {
        per_worker,
        sum,
        average,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const ZERO: Timestamp = 1_700_000_000.0;

    #[test]
    fn two_writers() {
        let traces = vec![
            vec![ZERO + 0.1, ZERO + 1.2],
            vec![ZERO + 0.3, ZERO + 1.4, ZERO + 2.9],
        ];
        let series = aggregate(&traces, ZERO, Duration::from_secs(3));
        assert_eq!(vec![2, 2, 1], series.sum);
        assert_eq!(vec![1.0, 1.0, 0.5], series.average);
        assert_eq!(vec![vec![1, 1, 0], vec![1, 1, 1]], series.per_worker);
        assert_eq!(5, series.total());
    }

    #[test]
    fn gaps_are_zero_filled() {
        let traces = vec![vec![ZERO + 0.5, ZERO + 3.5]];
        let series = aggregate(&traces, ZERO, Duration::from_secs(5));
        assert_eq!(vec![1, 0, 0, 1], series.sum);
    }

    #[test]
    fn early_timestamps_are_discarded() {
        let traces = vec![vec![ZERO - 0.5, ZERO + 0.5]];
        let series = aggregate(&traces, ZERO, Duration::from_secs(1));
        assert_eq!(vec![1], series.sum);
    }

    #[test]
    fn nothing_observed() {
        let series = aggregate(&[vec![], vec![]], ZERO, Duration::from_secs(1));
        assert_eq!(vec![0], series.sum);
        assert_eq!(vec![0.0], series.average);
        assert_eq!(vec![vec![0], vec![0]], series.per_worker);
        let series = aggregate(&[], ZERO, Duration::from_secs(1));
        assert_eq!(1, series.len());
    }

    #[test]
    fn stragglers_are_kept() {
        let traces = vec![vec![ZERO + 0.5, ZERO + 10.5]];
        let series = aggregate(&traces, ZERO, Duration::from_secs(1));
        assert_eq!(11, series.len());
        assert_eq!(1, series.sum[10]);
    }

    proptest! {
        #[test]
        fn deterministic(
            traces in proptest::collection::vec(
                proptest::collection::vec(0.0f64..30.0, 0..50), 1..8)
        ) {
            let traces = traces
                .into_iter()
                .map(|t| t.into_iter().map(|o| ZERO + o).collect::<Vec<_>>())
                .collect::<Vec<_>>();
            let a = aggregate(&traces, ZERO, Duration::from_secs(10));
            let b = aggregate(&traces, ZERO, Duration::from_secs(10));
            prop_assert_eq!(a, b);
        }

        #[test]
        fn bucket_completeness(
            offsets in proptest::collection::vec(0.0f64..20.0, 1..100),
            workers in 1usize..6,
        ) {
            let trace = offsets.iter().map(|o| ZERO + o).collect::<Vec<_>>();
            let k = trace.iter().map(|t| (t - ZERO).floor() as usize).max().unwrap();
            let mut traces = vec![trace];
            traces.resize(workers, vec![]);
            let series = aggregate(&traces, ZERO, Duration::from_secs(20));
            prop_assert_eq!(k + 1, series.len());
            prop_assert_eq!(offsets.len() as u64, series.total());
            for w in &series.per_worker {
                prop_assert_eq!(k + 1, w.len());
            }
            for (s, a) in series.sum.iter().zip(series.average.iter()) {
                prop_assert!((*s as f64 / workers as f64 - a).abs() < 1e-9);
            }
        }
    }
}
