use crate::types::{BotParams, ExchangeParams, Order, OrderType, Position, StateParams};
use crate::utils::{
    calc_min_entry_qty, calc_wallet_exposure, calc_wallet_exposure_if_filled, cost_to_qty,
    find_entry_qty_bringing_wallet_exposure_to_target, interpolate, round_, round_dn, round_up,
};

pub fn calc_ema_price_bid(
    price_step: f64,
    order_book_bid: f64,
    ema_bands_lower: f64,
    ema_dist: f64,
) -> f64 {
    f64::min(
        order_book_bid,
        round_dn(ema_bands_lower * (1.0 - ema_dist), price_step),
    )
}

pub fn calc_ema_price_ask(
    price_step: f64,
    order_book_ask: f64,
    ema_bands_upper: f64,
    ema_dist: f64,
) -> f64 {
    f64::max(
        order_book_ask,
        round_up(ema_bands_upper * (1.0 + ema_dist), price_step),
    )
}

pub fn calc_initial_entry_qty(
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
    initial_entry_price: f64,
) -> (f64, bool) {
    // returns qty: float, is_partial: bool
    let min_entry_qty = calc_min_entry_qty(initial_entry_price, exchange_params);
    let initial_entry_qty = f64::max(
        min_entry_qty,
        round_(
            cost_to_qty(
                state_params.balance,
                initial_entry_price,
                exchange_params.inverse,
                exchange_params.c_mult,
            ) * bot_params.wallet_exposure_limit
                * bot_params.initial_qty_pct,
            exchange_params.qty_step,
        ),
    );
    let position_size_abs = position.size.abs();
    if position.size == 0.0 {
        (initial_entry_qty, false)
    } else if position_size_abs < initial_entry_qty * 0.8 {
        (
            f64::max(
                min_entry_qty,
                round_dn(
                    initial_entry_qty - position_size_abs,
                    exchange_params.qty_step,
                ),
            ),
            true,
        )
    } else {
        (0.0, false)
    }
}

pub fn calc_reentry_qty(
    entry_price: f64,
    balance: f64,
    position_size: f64,
    exchange_params: &ExchangeParams,
    bot_params: &BotParams,
) -> f64 {
    f64::max(
        calc_min_entry_qty(entry_price, exchange_params),
        round_(
            f64::max(
                position_size.abs() * bot_params.ddown_factor,
                cost_to_qty(
                    balance,
                    entry_price,
                    exchange_params.inverse,
                    exchange_params.c_mult,
                ) * bot_params.wallet_exposure_limit
                    * bot_params.initial_qty_pct,
            ),
            exchange_params.qty_step,
        ),
    )
}

/// Distance multiplier widening the ladder as exposure approaches the limit.
fn calc_rentry_dist(wallet_exposure: f64, bot_params: &BotParams) -> f64 {
    let multiplier = (wallet_exposure / bot_params.wallet_exposure_limit)
        * bot_params.rentry_pprice_dist_wallet_exposure_weighting;
    bot_params.rentry_pprice_dist * (1.0 + multiplier)
}

/// Sizes a re-entry at `entry_price`, cropping it to the exposure limit when it would overshoot.
fn calc_reentry_order(
    exchange_params: &ExchangeParams,
    bot_params: &BotParams,
    position: &Position,
    balance: f64,
    wallet_exposure: f64,
    entry_price: f64,
    (normal, cropped): (OrderType, OrderType),
) -> Order {
    let psize_abs = position.size.abs();
    let entry_qty = calc_reentry_qty(
        entry_price,
        balance,
        psize_abs,
        exchange_params,
        bot_params,
    );
    let wallet_exposure_if_filled = calc_wallet_exposure_if_filled(
        balance,
        psize_abs,
        position.price,
        entry_qty,
        entry_price,
        exchange_params,
    );
    if wallet_exposure_if_filled > bot_params.wallet_exposure_limit * 1.01 {
        let cropped_qty = interpolate(
            bot_params.wallet_exposure_limit,
            &[wallet_exposure, wallet_exposure_if_filled],
            &[psize_abs, psize_abs + entry_qty],
        ) - psize_abs;
        Order {
            qty: f64::max(
                calc_min_entry_qty(entry_price, exchange_params),
                round_(cropped_qty, exchange_params.qty_step),
            ),
            price: entry_price,
            order_type: cropped,
        }
    } else {
        Order {
            qty: entry_qty,
            price: entry_price,
            order_type: normal,
        }
    }
}

/// Next step of the long DCA ladder given the current position and market state.
///
/// Returns the initial entry while flat or under-filled, an auto-unstuck entry when the
/// auto-unstuck threshold is configured and exposure sits near the limit, and otherwise a
/// re-entry below the position price. An empty order means the ladder is exhausted.
pub fn calc_recursive_entry_long(
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
) -> Order {
    if bot_params.wallet_exposure_limit == 0.0 || state_params.balance <= 0.0 {
        return Order::default();
    }
    let initial_entry_price = f64::max(
        exchange_params.price_step,
        calc_ema_price_bid(
            exchange_params.price_step,
            state_params.order_book.bid,
            state_params.ema_bands.lower,
            bot_params.initial_eprice_ema_dist,
        ),
    );
    let (initial_entry_qty, is_partial) = calc_initial_entry_qty(
        exchange_params,
        state_params,
        bot_params,
        position,
        initial_entry_price,
    );
    if initial_entry_qty > 0.0 {
        return Order {
            qty: initial_entry_qty,
            price: initial_entry_price,
            order_type: if is_partial {
                OrderType::EntryInitialPartialLong
            } else {
                OrderType::EntryInitialNormalLong
            },
        };
    }

    let wallet_exposure = calc_wallet_exposure(
        exchange_params.c_mult,
        state_params.balance,
        position.size,
        position.price,
        exchange_params.inverse,
    );
    if wallet_exposure >= bot_params.wallet_exposure_limit * 0.999 {
        return Order::default();
    }

    if bot_params.auto_unstuck_wallet_exposure_threshold != 0.0 {
        let threshold = bot_params.wallet_exposure_limit
            * (1.0 - bot_params.auto_unstuck_wallet_exposure_threshold)
            * 0.99;
        if wallet_exposure > threshold {
            let entry_price = calc_ema_price_bid(
                exchange_params.price_step,
                state_params.order_book.bid,
                state_params.ema_bands.lower,
                bot_params.auto_unstuck_ema_dist,
            );
            let entry_qty = find_entry_qty_bringing_wallet_exposure_to_target(
                state_params.balance,
                position.size,
                position.price,
                bot_params.wallet_exposure_limit,
                entry_price,
                exchange_params,
            );
            return Order {
                qty: f64::max(
                    calc_min_entry_qty(entry_price, exchange_params),
                    entry_qty,
                ),
                price: entry_price,
                order_type: OrderType::EntryUnstuckLong,
            };
        }
    }

    let entry_price = f64::min(
        state_params.order_book.bid,
        round_dn(
            position.price * (1.0 - calc_rentry_dist(wallet_exposure, bot_params)),
            exchange_params.price_step,
        ),
    );
    if entry_price <= exchange_params.price_step {
        return Order::default();
    }
    calc_reentry_order(
        exchange_params,
        bot_params,
        position,
        state_params.balance,
        wallet_exposure,
        entry_price,
        (
            OrderType::EntryGridNormalLong,
            OrderType::EntryGridCroppedLong,
        ),
    )
}

/// Short mirror of [`calc_recursive_entry_long`]; quantities are negative.
pub fn calc_recursive_entry_short(
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
) -> Order {
    if bot_params.wallet_exposure_limit == 0.0 || state_params.balance <= 0.0 {
        return Order::default();
    }
    let initial_entry_price = calc_ema_price_ask(
        exchange_params.price_step,
        state_params.order_book.ask,
        state_params.ema_bands.upper,
        bot_params.initial_eprice_ema_dist,
    );
    let (initial_entry_qty, is_partial) = calc_initial_entry_qty(
        exchange_params,
        state_params,
        bot_params,
        position,
        initial_entry_price,
    );
    if initial_entry_qty > 0.0 {
        return Order {
            qty: -initial_entry_qty,
            price: initial_entry_price,
            order_type: if is_partial {
                OrderType::EntryInitialPartialShort
            } else {
                OrderType::EntryInitialNormalShort
            },
        };
    }

    let wallet_exposure = calc_wallet_exposure(
        exchange_params.c_mult,
        state_params.balance,
        position.size.abs(),
        position.price,
        exchange_params.inverse,
    );
    if wallet_exposure >= bot_params.wallet_exposure_limit * 0.999 {
        return Order::default();
    }

    if bot_params.auto_unstuck_wallet_exposure_threshold != 0.0 {
        let threshold = bot_params.wallet_exposure_limit
            * (1.0 - bot_params.auto_unstuck_wallet_exposure_threshold)
            * 0.99;
        if wallet_exposure > threshold {
            let entry_price = calc_ema_price_ask(
                exchange_params.price_step,
                state_params.order_book.ask,
                state_params.ema_bands.upper,
                bot_params.auto_unstuck_ema_dist,
            );
            let entry_qty = find_entry_qty_bringing_wallet_exposure_to_target(
                state_params.balance,
                position.size,
                position.price,
                bot_params.wallet_exposure_limit,
                entry_price,
                exchange_params,
            );
            return Order {
                qty: -f64::max(
                    calc_min_entry_qty(entry_price, exchange_params),
                    entry_qty,
                ),
                price: entry_price,
                order_type: OrderType::EntryUnstuckShort,
            };
        }
    }

    let entry_price = f64::max(
        state_params.order_book.ask,
        round_up(
            position.price * (1.0 + calc_rentry_dist(wallet_exposure, bot_params)),
            exchange_params.price_step,
        ),
    );
    let order = calc_reentry_order(
        exchange_params,
        bot_params,
        position,
        state_params.balance,
        wallet_exposure,
        entry_price,
        (
            OrderType::EntryGridNormalShort,
            OrderType::EntryGridCroppedShort,
        ),
    );
    Order {
        qty: -order.qty,
        ..order
    }
}
