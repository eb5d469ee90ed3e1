use crate::constants::{CLOSE, HIGH, LOW, N_BAR_FIELDS};
use crate::error::BacktestError;
use ndarray::ArrayView3;

/// One minute of (high, low, close) for one symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bar {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Read-only view over the bar tensor, indexed `[symbol, minute, field]`.
///
/// A bar with a zero high marks a minute for which the symbol has no data.
#[derive(Clone, Copy)]
pub struct Candles<'a> {
    hlcs: ArrayView3<'a, f64>,
}

impl<'a> Candles<'a> {
    pub fn new(hlcs: ArrayView3<'a, f64>, n_symbols: usize) -> Result<Self, BacktestError> {
        let shape = hlcs.shape();
        if shape[0] != n_symbols {
            return Err(BacktestError::SymbolCountMismatch {
                expected: n_symbols,
                found: shape[0],
            });
        }
        if shape[2] != N_BAR_FIELDS {
            return Err(BacktestError::BarFieldCount {
                expected: N_BAR_FIELDS,
                found: shape[2],
            });
        }
        if shape[1] < 2 {
            return Err(BacktestError::EmptyBars);
        }
        Ok(Candles { hlcs })
    }

    pub fn n_symbols(&self) -> usize {
        self.hlcs.shape()[0]
    }

    pub fn n_minutes(&self) -> usize {
        self.hlcs.shape()[1]
    }

    #[inline(always)]
    pub fn high(&self, k: usize, idx: usize) -> f64 {
        self.hlcs[[idx, k, HIGH]]
    }

    #[inline(always)]
    pub fn low(&self, k: usize, idx: usize) -> f64 {
        self.hlcs[[idx, k, LOW]]
    }

    #[inline(always)]
    pub fn close(&self, k: usize, idx: usize) -> f64 {
        self.hlcs[[idx, k, CLOSE]]
    }

    #[inline(always)]
    pub fn bar(&self, k: usize, idx: usize) -> Bar {
        Bar {
            high: self.high(k, idx),
            low: self.low(k, idx),
            close: self.close(k, idx),
        }
    }

    #[inline(always)]
    pub fn has_data(&self, k: usize, idx: usize) -> bool {
        self.high(k, idx) != 0.0
    }

    pub fn closes(&self, k: usize) -> Vec<f64> {
        (0..self.n_symbols()).map(|idx| self.close(k, idx)).collect()
    }

    /// First non-zero close of a symbol, 0.0 if it never trades.
    pub fn first_close(&self, idx: usize) -> f64 {
        (0..self.n_minutes())
            .map(|k| self.close(k, idx))
            .find(|&c| c != 0.0)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_shape_checks() {
        let data = Array3::<f64>::zeros((2, 5, 3));
        assert!(Candles::new(data.view(), 2).is_ok());
        assert!(matches!(
            Candles::new(data.view(), 3),
            Err(BacktestError::SymbolCountMismatch {
                expected: 3,
                found: 2
            })
        ));
        let bad_fields = Array3::<f64>::zeros((2, 5, 4));
        assert!(matches!(
            Candles::new(bad_fields.view(), 2),
            Err(BacktestError::BarFieldCount { found: 4, .. })
        ));
        let one_minute = Array3::<f64>::zeros((2, 1, 3));
        assert!(matches!(
            Candles::new(one_minute.view(), 2),
            Err(BacktestError::EmptyBars)
        ));
    }

    #[test]
    fn test_first_close_skips_missing_data() {
        let mut data = Array3::<f64>::zeros((1, 4, 3));
        data[[0, 2, CLOSE]] = 7.0;
        data[[0, 3, CLOSE]] = 8.0;
        let candles = Candles::new(data.view(), 1).unwrap();
        assert_eq!(candles.first_close(0), 7.0);
        assert!(!candles.has_data(1, 0));
    }
}
