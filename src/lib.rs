pub mod backtest;
pub mod candles;
pub mod closes;
pub mod coin_selection;
pub mod config;
pub mod constants;
pub mod entries;
pub mod error;
pub mod fills;
pub mod ledger;
pub mod probe;
pub mod risk;
pub mod types;
pub mod utils;

#[cfg(feature = "python")]
mod python;

pub use backtest::{Backtest, BacktestResult, FixedUniverse, Forager};
pub use config::{BacktestConfig, ForagerConfig};
pub use error::BacktestError;

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// A Python module implemented in Rust.
#[cfg(feature = "python")]
#[pymodule]
fn dca_backtest(m: &Bound<'_, PyModule>) -> PyResult<()> {
    use python::*;
    use utils::*;

    m.add_function(wrap_pyfunction!(round_, m)?)?;
    m.add_function(wrap_pyfunction!(round_up, m)?)?;
    m.add_function(wrap_pyfunction!(round_dn, m)?)?;
    m.add_function(wrap_pyfunction!(calc_diff, m)?)?;
    m.add_function(wrap_pyfunction!(qty_to_cost, m)?)?;
    m.add_function(wrap_pyfunction!(cost_to_qty, m)?)?;
    m.add_function(wrap_pyfunction!(calc_pnl_long, m)?)?;
    m.add_function(wrap_pyfunction!(calc_pnl_short, m)?)?;
    m.add_function(wrap_pyfunction!(calc_bankruptcy_price, m)?)?;
    m.add_function(wrap_pyfunction!(run_backtest_multisymbol, m)?)?;
    m.add_function(wrap_pyfunction!(run_backtest_forager, m)?)?;
    m.add_function(wrap_pyfunction!(run_backtest_fast_recursive, m)?)?;
    m.add_function(wrap_pyfunction!(calc_noisiness_ranking_py, m)?)?;

    Ok(())
}
