use crate::constants::{LONG, SHORT};
use crate::types::{
    EMABands, ExchangeParams, Order, OrderType, Position, UnstuckOrder, UnstuckParams,
    UnstuckParamsPair,
};
use crate::utils::{
    calc_auto_unstuck_allowance, calc_min_entry_qty, calc_pnl, calc_pprice_diff_int, cost_to_qty,
    round_, round_dn, round_up,
};
use std::cmp::Ordering;

/// A position counts as stuck once its exposure ratio passes the threshold, provided a loss
/// budget exists to unstick it with.
#[inline(always)]
pub fn is_stuck(stuckness: f64, unstuck_params: &UnstuckParams) -> bool {
    unstuck_params.loss_allowance_pct > 0.0 && stuckness > unstuck_params.stuck_threshold
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnstuckPositionInput {
    pub idx: usize,
    pub pside: usize,
    pub position: Position,
    pub current_price: f64,
    pub ema_bands: EMABands,
    pub exchange_params: ExchangeParams,
    pub wallet_exposure_limit: f64,
}

/// Stuck position closest to breaking even, ties broken by (side, idx).
///
/// Positions whose price has moved past the position price in the profitable direction are
/// skipped; their regular take-profit ladder handles them. Break-even positions stay eligible.
pub fn select_unstuck_candidate(
    inputs: &[UnstuckPositionInput],
) -> Option<(&UnstuckPositionInput, f64)> {
    inputs
        .iter()
        .filter(|input| input.position.size != 0.0 && input.position.price > 0.0)
        .map(|input| {
            (
                input,
                calc_pprice_diff_int(input.pside, input.position.price, input.current_price),
            )
        })
        .filter(|(_, pprice_diff)| pprice_diff.is_finite() && *pprice_diff >= 0.0)
        .min_by(|(a, a_diff), (b, b_diff)| {
            match a_diff.partial_cmp(b_diff).unwrap_or(Ordering::Equal) {
                Ordering::Equal => (a.pside, a.idx).cmp(&(b.pside, b.idx)),
                other => other,
            }
        })
}

/// Sizes the forced close for one stuck position given the loss allowance.
pub fn calc_unstuck_close(
    balance: f64,
    allowance: f64,
    input: &UnstuckPositionInput,
    unstuck_params: &UnstuckParams,
) -> Order {
    let ep = &input.exchange_params;
    let psize_abs = input.position.size.abs();
    let (close_price, order_type) = match input.pside {
        LONG => (
            f64::max(
                input.current_price,
                round_up(
                    input.ema_bands.upper * (1.0 + unstuck_params.ema_dist),
                    ep.price_step,
                ),
            ),
            OrderType::CloseUnstuckLong,
        ),
        SHORT => (
            f64::min(
                input.current_price,
                round_dn(
                    input.ema_bands.lower * (1.0 - unstuck_params.ema_dist),
                    ep.price_step,
                ),
            ),
            OrderType::CloseUnstuckShort,
        ),
        _ => unreachable!(),
    };
    let upnl = calc_pnl(
        input.pside,
        input.position.price,
        input.current_price,
        psize_abs,
        ep,
    );
    let allowance_pct = if upnl >= 0.0 {
        1.0
    } else {
        f64::min(1.0, allowance / upnl.abs())
    };
    let allowance_qty = round_(psize_abs * allowance_pct, ep.qty_step);
    let budget_qty = round_(
        cost_to_qty(
            balance * input.wallet_exposure_limit * unstuck_params.close_pct,
            close_price,
            ep.inverse,
            ep.c_mult,
        ),
        ep.qty_step,
    );
    let close_qty = f64::max(
        calc_min_entry_qty(close_price, ep),
        f64::min(allowance_qty, budget_qty),
    );
    let close_qty = f64::min(close_qty, psize_abs);
    Order {
        qty: if input.pside == LONG {
            -close_qty
        } else {
            close_qty
        },
        price: close_price,
        order_type,
    }
}

/// Picks at most one stuck position and the forced close that partially unsticks it.
///
/// Returns `None` when nothing qualifies or when the drawdown-adjusted allowance on the chosen
/// position's side is exhausted.
pub fn calc_unstucking_action(
    balance: f64,
    pnl_cumsum_max: f64,
    pnl_cumsum_running: f64,
    unstuck_params: &UnstuckParamsPair,
    inputs: &[UnstuckPositionInput],
) -> Option<UnstuckOrder> {
    if balance <= 0.0 {
        return None;
    }
    let (input, _) = select_unstuck_candidate(inputs)?;
    let params = unstuck_params.get(input.pside);
    let allowance = calc_auto_unstuck_allowance(
        balance,
        params.loss_allowance_pct,
        pnl_cumsum_max,
        pnl_cumsum_running,
    );
    if allowance <= 0.0 {
        return None;
    }
    let order = calc_unstuck_close(balance, allowance, input, params);
    if order.qty == 0.0 {
        return None;
    }
    Some(UnstuckOrder {
        pside: input.pside,
        idx: input.idx,
        order,
    })
}
