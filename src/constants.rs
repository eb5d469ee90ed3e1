pub const LONG: usize = 0;
pub const SHORT: usize = 1;

pub const HIGH: usize = 0;
pub const LOW: usize = 1;
pub const CLOSE: usize = 2;
pub const N_BAR_FIELDS: usize = 3;

/// Minutes between two stats snapshots.
pub const STATS_INTERVAL_MINUTES: usize = 60;
/// equity / balance below this flags the run bankrupt.
pub const BANKRUPTCY_EQUITY_RATIO: f64 = 0.1;
/// Balance never drops below this fraction of itself on a single mutation.
pub const BALANCE_FLOOR_RATIO: f64 = 1e-6;
pub const BANKRUPT_EQUITY_FACTOR: f64 = 1e-12;
/// Upper bound on recursive entry fills processed for one symbol within one bar.
pub const MAX_ENTRY_FILLS_PER_BAR: usize = 1000;

pub const NOISINESS_BUCKET_MINUTES: usize = 15;
pub const NOISINESS_ROLLING_WINDOW: usize = 100;
