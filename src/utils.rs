use crate::constants::{LONG, SHORT};
use crate::types::ExchangeParams;
#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Rounds a number to the specified number of decimal places.
fn round_to_decimal_places(value: f64, decimal_places: usize) -> f64 {
    let multiplier = 10f64.powi(decimal_places as i32);
    (value * multiplier).round() / multiplier
}

/// Rounds up a number to the nearest multiple of the given step.
#[cfg_attr(feature = "python", pyfunction)]
pub fn round_up(n: f64, step: f64) -> f64 {
    let result = (n / step).ceil() * step;
    round_to_decimal_places(result, 14)
}

/// Rounds a number to the nearest multiple of the given step.
#[cfg_attr(feature = "python", pyfunction)]
pub fn round_(n: f64, step: f64) -> f64 {
    let result = (n / step).round() * step;
    round_to_decimal_places(result, 14)
}

/// Rounds down a number to the nearest multiple of the given step.
#[cfg_attr(feature = "python", pyfunction)]
pub fn round_dn(n: f64, step: f64) -> f64 {
    let result = (n / step).floor() * step;
    round_to_decimal_places(result, 14)
}

/// Relative difference of `x` from `y`.
#[cfg_attr(feature = "python", pyfunction)]
pub fn calc_diff(x: f64, y: f64) -> f64 {
    if y == 0.0 {
        if x == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        (x - y).abs() / y.abs()
    }
}

#[cfg_attr(feature = "python", pyfunction)]
pub fn cost_to_qty(cost: f64, price: f64, inverse: bool, c_mult: f64) -> f64 {
    if inverse {
        (cost * price) / c_mult
    } else if price > 0.0 {
        (cost / price) / c_mult
    } else {
        0.0
    }
}

#[cfg_attr(feature = "python", pyfunction)]
pub fn qty_to_cost(qty: f64, price: f64, inverse: bool, c_mult: f64) -> f64 {
    if inverse {
        if price > 0.0 {
            (qty.abs() / price) * c_mult
        } else {
            0.0
        }
    } else {
        (qty.abs() * price) * c_mult
    }
}

#[cfg_attr(feature = "python", pyfunction)]
pub fn calc_pnl_long(
    entry_price: f64,
    close_price: f64,
    qty: f64,
    inverse: bool,
    c_mult: f64,
) -> f64 {
    if inverse {
        if entry_price == 0.0 || close_price == 0.0 {
            return 0.0;
        }
        qty.abs() * c_mult * (1.0 / entry_price - 1.0 / close_price)
    } else {
        qty.abs() * c_mult * (close_price - entry_price)
    }
}

#[cfg_attr(feature = "python", pyfunction)]
pub fn calc_pnl_short(
    entry_price: f64,
    close_price: f64,
    qty: f64,
    inverse: bool,
    c_mult: f64,
) -> f64 {
    if inverse {
        if entry_price == 0.0 || close_price == 0.0 {
            return 0.0;
        }
        qty.abs() * c_mult * (1.0 / close_price - 1.0 / entry_price)
    } else {
        qty.abs() * c_mult * (entry_price - close_price)
    }
}

pub fn calc_pnl(
    pside: usize,
    entry_price: f64,
    close_price: f64,
    qty: f64,
    exchange_params: &ExchangeParams,
) -> f64 {
    match pside {
        LONG => calc_pnl_long(
            entry_price,
            close_price,
            qty,
            exchange_params.inverse,
            exchange_params.c_mult,
        ),
        SHORT => calc_pnl_short(
            entry_price,
            close_price,
            qty,
            exchange_params.inverse,
            exchange_params.c_mult,
        ),
        _ => unreachable!(),
    }
}

pub fn calc_min_entry_qty(initial_entry_price: f64, exchange_params: &ExchangeParams) -> f64 {
    if exchange_params.inverse {
        return exchange_params.min_qty;
    }
    f64::max(
        exchange_params.min_qty,
        round_up(
            cost_to_qty(
                exchange_params.min_cost,
                initial_entry_price,
                false,
                exchange_params.c_mult,
            ),
            exchange_params.qty_step,
        ),
    )
}

pub fn calc_wallet_exposure(
    c_mult: f64,
    balance: f64,
    position_size: f64,
    position_price: f64,
    inverse: bool,
) -> f64 {
    if balance <= 0.0 || position_size == 0.0 {
        return 0.0;
    }
    qty_to_cost(position_size, position_price, inverse, c_mult) / balance
}

pub fn calc_wallet_exposure_if_filled(
    balance: f64,
    psize: f64,
    pprice: f64,
    qty: f64,
    price: f64,
    exchange_params: &ExchangeParams,
) -> f64 {
    let psize = round_(psize.abs(), exchange_params.qty_step);
    let qty = round_(qty.abs(), exchange_params.qty_step);
    let (new_psize, new_pprice) =
        calc_new_psize_pprice(psize, pprice, qty, price, exchange_params.qty_step);
    qty_to_cost(
        new_psize,
        new_pprice,
        exchange_params.inverse,
        exchange_params.c_mult,
    ) / balance
}

/// Weighted average merge of an entry fill into a position.
pub fn calc_new_psize_pprice(
    psize: f64,
    pprice: f64,
    qty: f64,
    price: f64,
    qty_step: f64,
) -> (f64, f64) {
    if qty == 0.0 {
        return (psize, pprice);
    }
    if psize == 0.0 {
        return (qty, price);
    }
    let new_psize = round_(psize + qty, qty_step);
    if new_psize == 0.0 {
        return (0.0, 0.0);
    }
    (
        new_psize,
        nan_to_0(pprice) * (psize / new_psize) + price * (qty / new_psize),
    )
}

fn nan_to_0(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value
    }
}

/// Price at which the combined long and short positions exhaust `balance`.
#[cfg_attr(feature = "python", pyfunction)]
pub fn calc_bankruptcy_price(
    balance: f64,
    psize_long: f64,
    pprice_long: f64,
    psize_short: f64,
    pprice_short: f64,
    inverse: bool,
    c_mult: f64,
) -> f64 {
    let pprice_long = nan_to_0(pprice_long);
    let pprice_short = nan_to_0(pprice_short);
    let psize_short = psize_short.abs();
    let bankruptcy_price = if inverse {
        let short_cost = if pprice_short > 0.0 {
            psize_short / pprice_short
        } else {
            0.0
        };
        let long_cost = if pprice_long > 0.0 {
            psize_long / pprice_long
        } else {
            0.0
        };
        let denominator = short_cost - long_cost - balance / c_mult;
        if denominator == 0.0 {
            return 0.0;
        }
        (psize_short - psize_long) / denominator
    } else {
        let denominator = psize_long * c_mult - psize_short * c_mult;
        if denominator == 0.0 {
            return 0.0;
        }
        (-balance + psize_long * pprice_long * c_mult - psize_short * pprice_short * c_mult)
            / denominator
    };
    bankruptcy_price.max(0.0)
}

/// One EMA step: `prev * alpha_ + value * alpha`, with `alpha_ == 1 - alpha`.
#[inline(always)]
pub fn calc_ema(alpha: f64, alpha_: f64, prev: f64, value: f64) -> f64 {
    prev * alpha_ + value * alpha
}

/// Smoothing factors for the three EMAs spanning `span_0 .. span_1`, ascending span.
pub fn calc_ema_alphas(span_0: f64, span_1: f64) -> [f64; 3] {
    let mut spans = [span_0, (span_0 * span_1).sqrt(), span_1];
    spans.sort_by(|a, b| a.total_cmp(b));
    spans.map(|span| 2.0 / (span.max(1.0) + 1.0))
}

/// Distance of `price` from `pprice`, positive while the position is underwater.
pub fn calc_pprice_diff_int(pside: usize, pprice: f64, price: f64) -> f64 {
    if pprice <= 0.0 {
        return 0.0;
    }
    match pside {
        LONG => 1.0 - price / pprice,
        SHORT => price / pprice - 1.0,
        _ => unreachable!(),
    }
}

/// Loss budget for a forced close, shrinking with drawdown from the realized PnL peak.
pub fn calc_auto_unstuck_allowance(
    balance: f64,
    loss_allowance_pct: f64,
    pnl_cumsum_max: f64,
    pnl_cumsum_last: f64,
) -> f64 {
    let balance_peak = balance + (pnl_cumsum_max - pnl_cumsum_last);
    if balance_peak <= 0.0 {
        return 0.0;
    }
    let drop_since_peak_pct = balance / balance_peak - 1.0;
    f64::max(0.0, balance_peak * (loss_allowance_pct + drop_since_peak_pct))
}

/// Lagrange interpolation through the points (xs[i], ys[i]), evaluated at `x`.
pub fn interpolate(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    debug_assert_eq!(xs.len(), ys.len(), "xs and ys must have the same length");
    let mut result = 0.0;
    for i in 0..xs.len() {
        let mut term = ys[i];
        for j in 0..xs.len() {
            if i != j {
                term *= (x - xs[j]) / (xs[i] - xs[j]);
            }
        }
        result += term;
    }
    result
}

/// Entry qty at `entry_price` after which wallet exposure lands on `wallet_exposure_target`.
///
/// Secant search on the exposure curve; returns the closest guess after at most 15 refinements.
pub fn find_entry_qty_bringing_wallet_exposure_to_target(
    balance: f64,
    psize: f64,
    pprice: f64,
    wallet_exposure_target: f64,
    entry_price: f64,
    exchange_params: &ExchangeParams,
) -> f64 {
    if wallet_exposure_target == 0.0 || balance <= 0.0 {
        return 0.0;
    }
    let psize = psize.abs();
    let qty_step = exchange_params.qty_step;
    let wallet_exposure = calc_wallet_exposure(
        exchange_params.c_mult,
        balance,
        psize,
        pprice,
        exchange_params.inverse,
    );
    if wallet_exposure >= wallet_exposure_target * 0.99 {
        return 0.0;
    }
    let eval = |qty: f64| -> (f64, f64) {
        let val = calc_wallet_exposure_if_filled(
            balance,
            psize,
            pprice,
            qty,
            entry_price,
            exchange_params,
        );
        (val, (val - wallet_exposure_target).abs() / wallet_exposure_target)
    };
    let first_guess = if wallet_exposure > 0.0 {
        round_(
            psize * (wallet_exposure_target / wallet_exposure) - psize,
            qty_step,
        )
    } else {
        round_(
            cost_to_qty(
                balance * wallet_exposure_target,
                entry_price,
                exchange_params.inverse,
                exchange_params.c_mult,
            ),
            qty_step,
        )
    }
    .max(qty_step);
    let second_guess = round_(f64::max(first_guess * 1.2, first_guess + qty_step), qty_step);

    let mut guesses = vec![first_guess, second_guess];
    let mut vals = Vec::with_capacity(17);
    let mut evals = Vec::with_capacity(17);
    for &guess in &guesses {
        let (val, err) = eval(guess);
        vals.push(val);
        evals.push(err);
    }
    for _ in 0..15 {
        let n = guesses.len();
        if evals[n - 1] < 0.01 {
            break;
        }
        if vals[n - 1] == vals[n - 2] {
            break;
        }
        let guess = round_(
            interpolate(
                wallet_exposure_target,
                &vals[n - 2..],
                &guesses[n - 2..],
            ),
            qty_step,
        )
        .max(0.0);
        if guess == guesses[n - 1] {
            break;
        }
        let (val, err) = eval(guess);
        guesses.push(guess);
        vals.push(val);
        evals.push(err);
    }
    let mut best = 0;
    for i in 1..guesses.len() {
        if evals[i] < evals[best] || (evals[i] == evals[best] && guesses[i] < guesses[best]) {
            best = i;
        }
    }
    guesses[best]
}
