use crate::constants::{LONG, SHORT};
use crate::types::{BotParams, ExchangeParams, Order, OrderType, Position, StateParams};
use crate::utils::{
    calc_min_entry_qty, calc_wallet_exposure, cost_to_qty, round_, round_dn, round_up,
};

/// Take-profit prices in walk order: ascending for long, descending for short.
///
/// Prices on the wrong side of the book are dropped.
fn calc_close_grid_prices(
    pside: usize,
    position_price: f64,
    limit_price: f64,
    exchange_params: &ExchangeParams,
    bot_params: &BotParams,
) -> Vec<f64> {
    let n = bot_params.n_close_orders.max(1);
    let (start, end) = match pside {
        LONG => (
            position_price * (1.0 + bot_params.min_markup),
            position_price * (1.0 + bot_params.min_markup + bot_params.markup_range),
        ),
        SHORT => (
            position_price * (1.0 - bot_params.min_markup),
            position_price * (1.0 - bot_params.min_markup - bot_params.markup_range),
        ),
        _ => unreachable!(),
    };
    let mut prices: Vec<f64> = Vec::with_capacity(n);
    for i in 0..n {
        let raw = if n == 1 {
            start
        } else {
            start + (end - start) * (i as f64 / (n - 1) as f64)
        };
        let price = match pside {
            LONG => round_up(raw, exchange_params.price_step),
            _ => round_dn(raw, exchange_params.price_step),
        };
        let on_book_side = match pside {
            LONG => price >= limit_price,
            _ => price <= limit_price,
        };
        if on_book_side && prices.last() != Some(&price) {
            prices.push(price);
        }
    }
    prices
}

/// Evenly split `psize` over the prices, nearest price first.
fn distribute_frontwards(
    psize: f64,
    prices: &[f64],
    exchange_params: &ExchangeParams,
) -> Vec<(f64, f64)> {
    if prices.len() == 1 {
        return vec![(psize, prices[0])];
    }
    let default_qty = round_dn(psize / prices.len() as f64, exchange_params.qty_step);
    let mut closes = Vec::with_capacity(prices.len());
    let mut remaining = psize;
    for &price in &prices[..prices.len() - 1] {
        let min_close_qty = calc_min_entry_qty(price, exchange_params);
        if remaining < min_close_qty {
            break;
        }
        let qty = f64::min(remaining, f64::max(default_qty, min_close_qty));
        closes.push((qty, price));
        remaining = round_(remaining - qty, exchange_params.qty_step);
        if remaining <= 0.0 {
            break;
        }
    }
    if remaining > 0.0 {
        closes.push((remaining, prices[prices.len() - 1]));
    }
    closes
}

/// Fill the ladder from the farthest price inward, each slice sized off a full position.
fn distribute_backwards(
    psize: f64,
    position_price: f64,
    balance: f64,
    prices: &[f64],
    exchange_params: &ExchangeParams,
    bot_params: &BotParams,
) -> Vec<(f64, f64)> {
    let full_psize = cost_to_qty(
        balance * bot_params.wallet_exposure_limit,
        position_price,
        exchange_params.inverse,
        exchange_params.c_mult,
    );
    let qty_per_close = f64::max(
        calc_min_entry_qty(position_price, exchange_params),
        round_up(full_psize / prices.len() as f64, exchange_params.qty_step),
    );
    let mut closes: Vec<(f64, f64)> = Vec::with_capacity(prices.len());
    let mut remaining = psize;
    for &price in prices.iter().rev() {
        if remaining <= 0.0 {
            break;
        }
        let min_close_qty = calc_min_entry_qty(price, exchange_params);
        if remaining < min_close_qty {
            if let Some(last) = closes.last_mut() {
                last.0 = round_(last.0 + remaining, exchange_params.qty_step);
                remaining = 0.0;
                break;
            }
        }
        let qty = f64::min(remaining, f64::max(qty_per_close, min_close_qty));
        closes.push((qty, price));
        remaining = round_(remaining - qty, exchange_params.qty_step);
    }
    if remaining > 0.0 {
        if let Some(last) = closes.last_mut() {
            last.0 = round_(last.0 + remaining, exchange_params.qty_step);
        }
    }
    closes.reverse();
    closes
}

fn calc_close_grid(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
) -> Vec<Order> {
    let mut psize = round_dn(position.size.abs(), exchange_params.qty_step);
    if psize == 0.0 {
        return Vec::new();
    }
    let (limit_price, grid_type, unstuck_type) = match pside {
        LONG => (
            state_params.order_book.ask,
            OrderType::CloseGridLong,
            OrderType::CloseUnstuckLong,
        ),
        SHORT => (
            state_params.order_book.bid,
            OrderType::CloseGridShort,
            OrderType::CloseUnstuckShort,
        ),
        _ => unreachable!(),
    };
    let sign = if pside == LONG { -1.0 } else { 1.0 };
    let mut closes: Vec<Order> = Vec::with_capacity(bot_params.n_close_orders + 1);

    if bot_params.auto_unstuck_wallet_exposure_threshold != 0.0 {
        let wallet_exposure = calc_wallet_exposure(
            exchange_params.c_mult,
            state_params.balance,
            psize,
            position.price,
            exchange_params.inverse,
        );
        let threshold = bot_params.wallet_exposure_limit
            * (1.0 - bot_params.auto_unstuck_wallet_exposure_threshold);
        if wallet_exposure > threshold {
            let price = match pside {
                LONG => f64::max(
                    limit_price,
                    round_up(
                        state_params.ema_bands.upper * (1.0 + bot_params.auto_unstuck_ema_dist),
                        exchange_params.price_step,
                    ),
                ),
                _ => f64::min(
                    limit_price,
                    round_dn(
                        state_params.ema_bands.lower * (1.0 - bot_params.auto_unstuck_ema_dist),
                        exchange_params.price_step,
                    ),
                ),
            };
            let qty = f64::min(
                psize,
                f64::max(
                    calc_min_entry_qty(price, exchange_params),
                    round_(
                        cost_to_qty(
                            state_params.balance
                                * bot_params.wallet_exposure_limit
                                * bot_params.auto_unstuck_qty_pct,
                            price,
                            exchange_params.inverse,
                            exchange_params.c_mult,
                        ),
                        exchange_params.qty_step,
                    ),
                ),
            );
            closes.push(Order {
                qty: sign * qty,
                price,
                order_type: unstuck_type,
            });
            psize = round_(psize - qty, exchange_params.qty_step);
        }
    }

    if psize > 0.0 {
        let prices = calc_close_grid_prices(
            pside,
            position.price,
            limit_price,
            exchange_params,
            bot_params,
        );
        let slices = if prices.is_empty() {
            vec![(psize, limit_price)]
        } else if bot_params.backwards_tp {
            distribute_backwards(
                psize,
                position.price,
                state_params.balance,
                &prices,
                exchange_params,
                bot_params,
            )
        } else {
            distribute_frontwards(psize, &prices, exchange_params)
        };
        closes.extend(slices.into_iter().map(|(qty, price)| Order {
            qty: sign * qty,
            price,
            order_type: grid_type,
        }));
    }

    sort_closes(pside, &mut closes);
    closes
}

/// Stable sort into walk order: ascending price for long, descending for short.
pub fn sort_closes(pside: usize, closes: &mut [Order]) {
    match pside {
        LONG => closes.sort_by(|a, b| a.price.total_cmp(&b.price)),
        SHORT => closes.sort_by(|a, b| b.price.total_cmp(&a.price)),
        _ => unreachable!(),
    }
}

/// Take-profit ladder for a long position, ascending by price.
pub fn calc_close_grid_long(
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
) -> Vec<Order> {
    calc_close_grid(LONG, exchange_params, state_params, bot_params, position)
}

/// Take-profit ladder for a short position, descending by price.
pub fn calc_close_grid_short(
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
) -> Vec<Order> {
    calc_close_grid(SHORT, exchange_params, state_params, bot_params, position)
}
