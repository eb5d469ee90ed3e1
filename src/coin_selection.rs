use crate::constants::{CLOSE, HIGH, LOW};
use crate::error::BacktestError;
use crate::ledger::SymbolSet;
use ndarray::{Array2, ArrayView2, ArrayView3};
use std::cmp::Ordering;

/// Active set for one side: every symbol holding a position, topped up from the ranking while
/// free slots remain.
pub fn select_active_symbols(
    open_positions: &SymbolSet,
    ranking_row: impl IntoIterator<Item = usize>,
    n_positions: usize,
    eligible: impl Fn(usize) -> bool,
) -> SymbolSet {
    let mut actives = open_positions.clone();
    let mut n_active = actives.len();
    for idx in ranking_row {
        if n_active >= n_positions {
            break;
        }
        if eligible(idx) && actives.insert(idx) {
            n_active += 1;
        }
    }
    actives
}

fn compare_desc(value_a: f64, value_b: f64, idx_a: usize, idx_b: usize) -> Ordering {
    match value_b.partial_cmp(&value_a).unwrap_or(Ordering::Equal) {
        Ordering::Equal => idx_a.cmp(&idx_b),
        ordering => ordering,
    }
}

/// Rolling mean normalized relative range `(high - low) / close` per bucket, shape
/// `(n_buckets, n_symbols)`.
///
/// Bars without data are left out of their bucket; a bucket with no data scores 0.
pub fn calc_noisiness(
    hlcs: ArrayView3<'_, f64>,
    bucket_size: usize,
    rolling_window: usize,
) -> Array2<f64> {
    let (n_symbols, n_minutes) = (hlcs.shape()[0], hlcs.shape()[1]);
    let bucket_size = bucket_size.max(1);
    let rolling_window = rolling_window.max(1);
    let n_buckets = (n_minutes + bucket_size - 1) / bucket_size;

    let mut nrr = Array2::<f64>::zeros((n_buckets, n_symbols));
    for idx in 0..n_symbols {
        for b in 0..n_buckets {
            let start = b * bucket_size;
            let end = usize::min(start + bucket_size, n_minutes);
            let mut high = f64::MIN;
            let mut low = f64::MAX;
            let mut close = 0.0;
            for k in start..end {
                if hlcs[[idx, k, HIGH]] == 0.0 {
                    continue;
                }
                high = high.max(hlcs[[idx, k, HIGH]]);
                low = low.min(hlcs[[idx, k, LOW]]);
                close = hlcs[[idx, k, CLOSE]];
            }
            if close != 0.0 {
                nrr[[b, idx]] = (high - low) / close;
            }
        }
    }

    let mut rolling = Array2::<f64>::zeros((n_buckets, n_symbols));
    for idx in 0..n_symbols {
        let mut window_sum = 0.0;
        for b in 0..n_buckets {
            window_sum += nrr[[b, idx]];
            if b >= rolling_window {
                window_sum -= nrr[[b - rolling_window, idx]];
            }
            let count = usize::min(b + 1, rolling_window);
            rolling[[b, idx]] = window_sum / count as f64;
        }
    }
    rolling
}

/// Per-minute symbol priority, noisiest first, shape `(n_minutes, n_symbols)`.
///
/// Minute `k` ranks by the rolling noisiness of the last completed bucket; minutes in the
/// first bucket use the first bucket's value. Ties go to the lower symbol index.
pub fn calc_noisiness_ranking(
    hlcs: ArrayView3<'_, f64>,
    bucket_size: usize,
    rolling_window: usize,
) -> Array2<usize> {
    let (n_symbols, n_minutes) = (hlcs.shape()[0], hlcs.shape()[1]);
    let bucket_size = bucket_size.max(1);
    let noisiness = calc_noisiness(hlcs, bucket_size, rolling_window);

    let bucket_rankings: Vec<Vec<usize>> = noisiness
        .outer_iter()
        .map(|row| {
            let mut indices: Vec<usize> = (0..n_symbols).collect();
            indices.sort_by(|&a, &b| compare_desc(row[a], row[b], a, b));
            indices
        })
        .collect();

    let mut ranking = Array2::<usize>::zeros((n_minutes, n_symbols));
    for k in 0..n_minutes {
        let bucket = (k / bucket_size).max(1) - 1;
        for (rank, &idx) in bucket_rankings[bucket].iter().enumerate() {
            ranking[[k, rank]] = idx;
        }
    }
    ranking
}

pub fn validate_ranking(
    ranking: ArrayView2<'_, usize>,
    n_minutes: usize,
    n_symbols: usize,
) -> Result<(), BacktestError> {
    let (rows, cols) = (ranking.shape()[0], ranking.shape()[1]);
    if rows != n_minutes || cols > n_symbols {
        return Err(BacktestError::RankingShape {
            rows,
            cols,
            expected_rows: n_minutes,
            expected_cols: n_symbols,
        });
    }
    for ((minute, _), &symbol) in ranking.indexed_iter() {
        if symbol >= n_symbols {
            return Err(BacktestError::RankingIndex {
                minute,
                symbol,
                n_symbols,
            });
        }
    }
    Ok(())
}
