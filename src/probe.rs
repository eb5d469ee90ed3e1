//! Single-symbol, long-only replay of one DCA ladder, used to screen ladder shapes cheaply.
//!
//! The probe opens at the first close and stops at the first close fill, liquidation or
//! excessive distance from the position price. Balance stays fixed at the starting value.

use crate::constants::{CLOSE, HIGH, LOW, N_BAR_FIELDS};
use crate::entries::calc_recursive_entry_long;
use crate::error::BacktestError;
use crate::types::{BotParams, EMABands, ExchangeParams, Order, OrderBook, Position, StateParams};
use crate::utils::{
    calc_bankruptcy_price, calc_new_psize_pprice, calc_pnl_long, cost_to_qty, round_, round_up,
};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Stop once the low falls this far below the position price.
const PPRICE_DIFF_THRESHOLD_PCT: f64 = 0.25;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeParams {
    pub initial_qty_pct: f64,
    pub wallet_exposure_limit: f64,
    pub ddown_factor: f64,
    pub rentry_pprice_dist: f64,
    pub rentry_pprice_dist_wallet_exposure_weighting: f64,
    pub min_markup: f64,
}

impl ProbeParams {
    fn to_bot_params(self) -> BotParams {
        BotParams {
            ddown_factor: self.ddown_factor,
            enabled: true,
            initial_qty_pct: self.initial_qty_pct,
            min_markup: self.min_markup,
            n_close_orders: 1,
            rentry_pprice_dist: self.rentry_pprice_dist,
            rentry_pprice_dist_wallet_exposure_weighting: self
                .rentry_pprice_dist_wallet_exposure_weighting,
            wallet_exposure_limit: self.wallet_exposure_limit,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProbeEventKind {
    InitialEntry,
    Reentry,
    Close,
    Liquidation,
    PpriceDiffBreak,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbeEvent {
    pub index: usize,
    pub pnl: f64,
    pub bankruptcy_price: f64,
    pub qty: f64,
    pub price: f64,
    pub kind: ProbeEventKind,
}

fn next_entry(
    balance: f64,
    exchange_params: &ExchangeParams,
    bot_params: &BotParams,
    position: &Position,
) -> Order {
    let state_params = StateParams {
        balance,
        order_book: OrderBook {
            bid: position.price,
            ask: position.price,
        },
        ema_bands: EMABands {
            upper: position.price,
            lower: position.price,
        },
    };
    calc_recursive_entry_long(exchange_params, &state_params, bot_params, position)
}

/// `bars` is indexed `[minute, field]` with fields (high, low, close).
pub fn run_fast_recursive(
    bars: ArrayView2<'_, f64>,
    starting_balance: f64,
    exchange_params: &ExchangeParams,
    probe_params: &ProbeParams,
) -> Result<Vec<ProbeEvent>, BacktestError> {
    if bars.shape()[1] != N_BAR_FIELDS {
        return Err(BacktestError::BarFieldCount {
            expected: N_BAR_FIELDS,
            found: bars.shape()[1],
        });
    }
    if bars.shape()[0] == 0 {
        return Err(BacktestError::EmptyBars);
    }
    if !(starting_balance > 0.0) {
        return Err(BacktestError::InvalidStartingBalance(starting_balance));
    }
    let ep = exchange_params;
    let bot_params = probe_params.to_bot_params();
    let bankruptcy_price = |position: &Position| {
        calc_bankruptcy_price(
            starting_balance,
            position.size,
            position.price,
            0.0,
            0.0,
            ep.inverse,
            ep.c_mult,
        )
    };

    let first_close = bars[[0, CLOSE]];
    let initial_qty = round_(
        cost_to_qty(
            starting_balance * probe_params.wallet_exposure_limit * probe_params.initial_qty_pct,
            first_close,
            ep.inverse,
            ep.c_mult,
        ),
        ep.qty_step,
    );
    if initial_qty <= 0.0 {
        return Ok(Vec::new());
    }
    let mut position = Position {
        size: initial_qty,
        price: first_close,
    };
    let mut entry = next_entry(starting_balance, ep, &bot_params, &position);
    let mut close_price =
        round_up(position.price * (1.0 + probe_params.min_markup), ep.price_step);
    let mut bkr_price = bankruptcy_price(&position);
    let mut pprice_diff_threshold = position.price * (1.0 - PPRICE_DIFF_THRESHOLD_PCT);
    let mut events = vec![ProbeEvent {
        index: 0,
        pnl: 0.0,
        bankruptcy_price: bkr_price,
        qty: position.size,
        price: position.price,
        kind: ProbeEventKind::InitialEntry,
    }];

    for k in 1..bars.shape()[0] {
        let (high, low) = (bars[[k, HIGH]], bars[[k, LOW]]);
        if high > close_price {
            events.push(ProbeEvent {
                index: k,
                pnl: calc_pnl_long(
                    position.price,
                    close_price,
                    position.size,
                    ep.inverse,
                    ep.c_mult,
                ),
                bankruptcy_price: 0.0,
                qty: position.size,
                price: close_price,
                kind: ProbeEventKind::Close,
            });
            return Ok(events);
        }
        if entry.qty != 0.0 && low < entry.price {
            let (size, price) = calc_new_psize_pprice(
                position.size,
                position.price,
                entry.qty,
                entry.price,
                ep.qty_step,
            );
            position = Position { size, price };
            bkr_price = bankruptcy_price(&position);
            events.push(ProbeEvent {
                index: k,
                pnl: 0.0,
                bankruptcy_price: bkr_price,
                qty: entry.qty,
                price: entry.price,
                kind: ProbeEventKind::Reentry,
            });
            entry = next_entry(starting_balance, ep, &bot_params, &position);
            close_price =
                round_up(position.price * (1.0 + probe_params.min_markup), ep.price_step);
            pprice_diff_threshold = position.price * (1.0 - PPRICE_DIFF_THRESHOLD_PCT);
        }
        if low <= bkr_price {
            events.push(ProbeEvent {
                index: k,
                pnl: -starting_balance,
                bankruptcy_price: 0.0,
                qty: position.size,
                price: low,
                kind: ProbeEventKind::Liquidation,
            });
            return Ok(events);
        }
        if low <= pprice_diff_threshold {
            events.push(ProbeEvent {
                index: k,
                pnl: 0.0,
                bankruptcy_price: bkr_price,
                qty: 0.0,
                price: low,
                kind: ProbeEventKind::PpriceDiffBreak,
            });
            return Ok(events);
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn exchange_params() -> ExchangeParams {
        ExchangeParams {
            qty_step: 0.001,
            price_step: 0.01,
            min_qty: 0.001,
            min_cost: 1.0,
            c_mult: 1.0,
            inverse: false,
        }
    }

    fn probe_params(wallet_exposure_limit: f64, initial_qty_pct: f64) -> ProbeParams {
        ProbeParams {
            initial_qty_pct,
            wallet_exposure_limit,
            ddown_factor: 1.0,
            rentry_pprice_dist: 0.02,
            rentry_pprice_dist_wallet_exposure_weighting: 0.0,
            min_markup: 0.01,
        }
    }

    #[test]
    fn stops_at_first_close() {
        let bars = array![[100.0, 100.0, 100.0], [100.5, 99.5, 100.0], [102.0, 100.0, 101.5]];
        let events =
            run_fast_recursive(bars.view(), 1000.0, &exchange_params(), &probe_params(1.0, 0.1))
                .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ProbeEventKind::InitialEntry);
        assert_eq!(events[0].qty, 1.0);
        let close = &events[1];
        assert_eq!(close.kind, ProbeEventKind::Close);
        assert_eq!(close.index, 2);
        assert_eq!(close.price, 101.0);
        assert_eq!(close.pnl, 1.0);
    }

    #[test]
    fn liquidates_below_bankruptcy_price() {
        let bars = array![[100.0, 100.0, 100.0], [60.0, 49.0, 55.0]];
        let events =
            run_fast_recursive(bars.view(), 1000.0, &exchange_params(), &probe_params(2.0, 1.0))
                .unwrap();
        assert_eq!(events[0].bankruptcy_price, 50.0);
        let last = events.last().unwrap();
        assert_eq!(last.kind, ProbeEventKind::Liquidation);
        assert_eq!(last.pnl, -1000.0);
        assert_eq!(last.price, 49.0);
    }

    #[test]
    fn breaks_on_large_pprice_distance_after_reentry() {
        let bars = array![[100.0, 100.0, 100.0], [99.0, 70.0, 70.0]];
        let events =
            run_fast_recursive(bars.view(), 1000.0, &exchange_params(), &probe_params(1.0, 0.1))
                .unwrap();
        let kinds: Vec<ProbeEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ProbeEventKind::InitialEntry,
                ProbeEventKind::Reentry,
                ProbeEventKind::PpriceDiffBreak
            ]
        );
        assert_eq!(events[1].price, 98.0);
        assert_eq!(events[2].price, 70.0);
    }

    #[test]
    fn runs_to_end_of_data_without_events() {
        let bars = Array2::from_elem((10, 3), 100.0);
        let events =
            run_fast_recursive(bars.view(), 1000.0, &exchange_params(), &probe_params(1.0, 0.1))
                .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(ProbeEventKind::PpriceDiffBreak.to_string(), "pprice_diff_break");
    }

    #[test]
    fn rejects_malformed_bars() {
        let bars = Array2::<f64>::zeros((4, 2));
        assert!(matches!(
            run_fast_recursive(bars.view(), 1000.0, &exchange_params(), &probe_params(1.0, 0.1)),
            Err(BacktestError::BarFieldCount { found: 2, .. })
        ));
    }
}
