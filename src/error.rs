use thiserror::Error;

/// Precondition failures detected before the first simulated minute.
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("bar tensor holds {found} symbols but {expected} were configured")]
    SymbolCountMismatch { expected: usize, found: usize },

    #[error("bar tensor must carry {expected} fields per bar (high, low, close), got {found}")]
    BarFieldCount { expected: usize, found: usize },

    #[error("bar tensor holds fewer than two minutes")]
    EmptyBars,

    #[error("{kind} vector has {found} fields, expected {expected}")]
    ConfigFieldCount {
        kind: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("got bot params for {found} symbols, expected {expected}")]
    BotParamsCount { expected: usize, found: usize },

    #[error("got exchange params for {found} symbols, expected {expected}")]
    ExchangeParamsCount { expected: usize, found: usize },

    #[error("ranking has shape ({rows}, {cols}), expected ({expected_rows}, {expected_cols})")]
    RankingShape {
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },

    #[error("ranking at minute {minute} references symbol {symbol}, universe size is {n_symbols}")]
    RankingIndex {
        minute: usize,
        symbol: usize,
        n_symbols: usize,
    },

    #[error("starting balance must be positive, got {0}")]
    InvalidStartingBalance(f64),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}
