use crate::backtest::BacktestResult;
use crate::coin_selection::calc_noisiness_ranking;
use crate::config::{BacktestConfig, ForagerConfig};
use crate::constants::{NOISINESS_BUCKET_MINUTES, NOISINESS_ROLLING_WINDOW};
use crate::error::BacktestError;
use crate::probe::{run_fast_recursive, ProbeParams};
use crate::types::{ExchangeParams, Fill};
use ndarray::{Array1, Array2};
use numpy::{IntoPyArray, PyArray1, PyArray2, PyReadonlyArray2, PyReadonlyArray3};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyString;
use serde::Serialize;

const N_FILL_COLUMNS: usize = 12;

impl From<BacktestError> for PyErr {
    fn from(err: BacktestError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

type BacktestOutput = (Py<PyArray2<PyObject>>, Py<PyArray1<f64>>, PyObject, bool);

/// Runs a fixed-universe backtest.
///
/// `config` is either a JSON string or a dict with the same layout. Returns
/// `(fills, equities, stats, bankrupt)`.
#[pyfunction]
pub fn run_backtest_multisymbol(
    py: Python<'_>,
    hlcs: PyReadonlyArray3<'_, f64>,
    config: &Bound<'_, PyAny>,
) -> PyResult<BacktestOutput> {
    let config = BacktestConfig::from_json_str(&config_to_json(py, config)?)?;
    let hlcs = hlcs.as_array();
    let result = py.allow_threads(|| -> Result<BacktestResult, BacktestError> {
        Ok(config.build_backtest(hlcs)?.run())
    })?;
    result_to_py(py, &result)
}

/// Runs a forager backtest over a precomputed per-minute ranking.
#[pyfunction]
pub fn run_backtest_forager(
    py: Python<'_>,
    hlcs: PyReadonlyArray3<'_, f64>,
    ranking: PyReadonlyArray2<'_, i64>,
    config: &Bound<'_, PyAny>,
) -> PyResult<BacktestOutput> {
    let config = ForagerConfig::from_json_str(&config_to_json(py, config)?)?;
    let ranking = ranking_from_py(&ranking)?;
    let hlcs = hlcs.as_array();
    let result = py.allow_threads(|| -> Result<BacktestResult, BacktestError> {
        Ok(config.build_backtest(hlcs, ranking.view())?.run())
    })?;
    result_to_py(py, &result)
}

#[pyfunction]
#[pyo3(signature = (
    hlcs,
    bucket_size = NOISINESS_BUCKET_MINUTES,
    rolling_window = NOISINESS_ROLLING_WINDOW
))]
pub fn calc_noisiness_ranking_py(
    py: Python<'_>,
    hlcs: PyReadonlyArray3<'_, f64>,
    bucket_size: usize,
    rolling_window: usize,
) -> Py<PyArray2<i64>> {
    calc_noisiness_ranking(hlcs.as_array(), bucket_size, rolling_window)
        .mapv(|idx| idx as i64)
        .into_pyarray_bound(py)
        .unbind()
}

/// Returns a list of `(index, pnl, bankruptcy_price, qty, price, kind)`.
#[pyfunction]
#[allow(clippy::too_many_arguments)]
pub fn run_backtest_fast_recursive(
    bars: PyReadonlyArray2<'_, f64>,
    starting_balance: f64,
    qty_step: f64,
    price_step: f64,
    min_qty: f64,
    min_cost: f64,
    c_mult: f64,
    inverse: bool,
    initial_qty_pct: f64,
    wallet_exposure_limit: f64,
    ddown_factor: f64,
    rentry_pprice_dist: f64,
    rentry_pprice_dist_wallet_exposure_weighting: f64,
    min_markup: f64,
) -> PyResult<Vec<(usize, f64, f64, f64, f64, String)>> {
    let exchange_params = ExchangeParams {
        qty_step,
        price_step,
        min_qty,
        min_cost,
        c_mult,
        inverse,
    };
    let probe_params = ProbeParams {
        initial_qty_pct,
        wallet_exposure_limit,
        ddown_factor,
        rentry_pprice_dist,
        rentry_pprice_dist_wallet_exposure_weighting,
        min_markup,
    };
    let events = run_fast_recursive(
        bars.as_array(),
        starting_balance,
        &exchange_params,
        &probe_params,
    )?;
    Ok(events
        .into_iter()
        .map(|e| {
            (
                e.index,
                e.pnl,
                e.bankruptcy_price,
                e.qty,
                e.price,
                e.kind.to_string(),
            )
        })
        .collect())
}

fn config_to_json(py: Python<'_>, config: &Bound<'_, PyAny>) -> PyResult<String> {
    if let Ok(s) = config.downcast::<PyString>() {
        return s.extract();
    }
    let json = py.import_bound("json")?;
    json.call_method1("dumps", (config,))?.extract()
}

fn ranking_from_py(ranking: &PyReadonlyArray2<'_, i64>) -> PyResult<Array2<usize>> {
    let view = ranking.as_array();
    if let Some(((minute, _), &symbol)) = view.indexed_iter().find(|(_, v)| **v < 0) {
        return Err(PyValueError::new_err(format!(
            "ranking at minute {} holds negative symbol index {}",
            minute, symbol
        )));
    }
    Ok(view.mapv(|v| v as usize))
}

fn result_to_py(py: Python<'_>, result: &BacktestResult) -> PyResult<BacktestOutput> {
    let equities: Array1<f64> = result.stats.iter().map(|s| s.equity).collect();
    Ok((
        fills_to_py(py, &result.fills).into_pyarray_bound(py).unbind(),
        equities.into_pyarray_bound(py).unbind(),
        to_py_object(py, &result.stats)?.unbind(),
        result.bankrupt,
    ))
}

fn fills_to_py(py: Python<'_>, fills: &[Fill]) -> Array2<PyObject> {
    let mut py_fills = Array2::from_elem((fills.len(), N_FILL_COLUMNS), py.None());
    for (i, fill) in fills.iter().enumerate() {
        py_fills[(i, 0)] = fill.index.into_py(py);
        py_fills[(i, 1)] = fill.symbol.clone().into_py(py);
        py_fills[(i, 2)] = fill.pnl.into_py(py);
        py_fills[(i, 3)] = fill.fee_paid.into_py(py);
        py_fills[(i, 4)] = fill.balance.into_py(py);
        py_fills[(i, 5)] = fill.equity.into_py(py);
        py_fills[(i, 6)] = fill.fill_qty.into_py(py);
        py_fills[(i, 7)] = fill.fill_price.into_py(py);
        py_fills[(i, 8)] = fill.position_size.into_py(py);
        py_fills[(i, 9)] = fill.position_price.into_py(py);
        py_fills[(i, 10)] = fill.order_type.to_string().into_py(py);
        py_fills[(i, 11)] = fill.stuckness.into_py(py);
    }
    py_fills
}

fn to_py_object<'py, T: Serialize + ?Sized>(
    py: Python<'py>,
    obj: &T,
) -> PyResult<Bound<'py, PyAny>> {
    let json_str = serde_json::to_string(obj)
        .map_err(|e| PyValueError::new_err(format!("JSON serialization error: {}", e)))?;
    let json = py.import_bound("json")?;
    json.call_method1("loads", (json_str,))
}
