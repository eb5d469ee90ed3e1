//! Fill matching against a single minute bar.
//!
//! [`calc_fills`] is pure: it takes the pending orders and state for one symbol and side
//! and returns the fills plus the resulting position and balance. Committing them to the
//! ledger is the caller's job.

use crate::candles::Bar;
use crate::constants::{BALANCE_FLOOR_RATIO, LONG, MAX_ENTRY_FILLS_PER_BAR, SHORT};
use crate::entries::{calc_recursive_entry_long, calc_recursive_entry_short};
use crate::types::{
    BotParams, EMABands, ExchangeParams, Fill, Order, OrderBook, Position, StateParams,
};
use crate::utils::{calc_new_psize_pprice, calc_pnl, calc_wallet_exposure, qty_to_cost, round_};

pub struct FillContext<'a> {
    pub k: usize,
    pub idx: usize,
    pub pside: usize,
    pub symbol: &'a str,
    pub bar: Bar,
    pub balance: f64,
    pub position: Position,
    pub entry: Order,
    pub closes: &'a [Order],
    pub exchange_params: &'a ExchangeParams,
    pub bot_params: &'a BotParams,
    pub maker_fee: f64,
    /// Unrealized PnL of every other open position at this bar.
    pub upnl_others: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillOutcome {
    pub fills: Vec<Fill>,
    pub position: Position,
    pub balance: f64,
    pub equity: f64,
}

/// Applies a balance change, never dropping below the floor fraction of the prior balance.
#[inline(always)]
pub fn apply_balance_delta(balance: f64, delta: f64) -> f64 {
    f64::max(balance * BALANCE_FLOOR_RATIO, balance + delta)
}

/// Unrealized PnL at the adverse extreme of the bar: lows for long, highs for short.
#[inline(always)]
pub fn calc_upnl(
    pside: usize,
    position: &Position,
    bar: &Bar,
    exchange_params: &ExchangeParams,
) -> f64 {
    if position.size == 0.0 {
        return 0.0;
    }
    let mark_price = match pside {
        LONG => bar.low,
        SHORT => bar.high,
        _ => unreachable!(),
    };
    calc_pnl(
        pside,
        position.price,
        mark_price,
        position.size,
        exchange_params,
    )
}

#[inline(always)]
pub fn entry_touched(pside: usize, bar: &Bar, entry: &Order) -> bool {
    match pside {
        LONG => bar.low < entry.price,
        SHORT => bar.high > entry.price,
        _ => unreachable!(),
    }
}

#[inline(always)]
pub fn close_touched(pside: usize, bar: &Bar, close: &Order) -> bool {
    match pside {
        LONG => bar.high > close.price,
        SHORT => bar.low < close.price,
        _ => unreachable!(),
    }
}

/// Cheap pre-check: does the bar reach the pending entry or the nearest close?
pub fn fill_triggered(
    pside: usize,
    bar: &Bar,
    position: &Position,
    entry: &Order,
    closes: &[Order],
) -> bool {
    if entry.qty != 0.0 && entry_touched(pside, bar, entry) {
        return true;
    }
    match closes.first() {
        Some(close) => position.size != 0.0 && close.qty != 0.0 && close_touched(pside, bar, close),
        None => false,
    }
}

/// Wallet exposure relative to the configured limit.
pub fn calc_stuckness(
    balance: f64,
    position: &Position,
    exchange_params: &ExchangeParams,
    bot_params: &BotParams,
) -> f64 {
    if bot_params.wallet_exposure_limit <= 0.0 {
        return 0.0;
    }
    calc_wallet_exposure(
        exchange_params.c_mult,
        balance,
        position.size,
        position.price,
        exchange_params.inverse,
    ) / bot_params.wallet_exposure_limit
}

fn next_entry(
    pside: usize,
    exchange_params: &ExchangeParams,
    bot_params: &BotParams,
    balance: f64,
    reference_price: f64,
    position: &Position,
) -> Order {
    let state_params = StateParams {
        balance,
        order_book: OrderBook {
            bid: reference_price,
            ask: reference_price,
        },
        ema_bands: EMABands {
            upper: reference_price,
            lower: reference_price,
        },
    };
    match pside {
        LONG => calc_recursive_entry_long(exchange_params, &state_params, bot_params, position),
        SHORT => calc_recursive_entry_short(exchange_params, &state_params, bot_params, position),
        _ => unreachable!(),
    }
}

pub fn calc_fills(ctx: &FillContext) -> FillOutcome {
    calc_fills_capped(ctx, MAX_ENTRY_FILLS_PER_BAR)
}

/// [`calc_fills`] with an explicit bound on recursive entry fills within the bar.
fn calc_fills_capped(ctx: &FillContext, max_entry_fills: usize) -> FillOutcome {
    let ep = ctx.exchange_params;
    let mut fills = Vec::new();
    let mut balance = ctx.balance;
    let mut position = ctx.position;

    let make_fill = |balance: f64, position: &Position, order: &Order, pnl: f64, fee_paid: f64| {
        Fill {
            index: ctx.k,
            symbol: ctx.symbol.to_string(),
            pnl,
            fee_paid,
            balance,
            equity: balance + ctx.upnl_others + calc_upnl(ctx.pside, position, &ctx.bar, ep),
            fill_qty: order.qty,
            fill_price: order.price,
            position_size: position.size,
            position_price: position.price,
            order_type: order.order_type,
            stuckness: calc_stuckness(balance, position, ep, ctx.bot_params),
        }
    };

    let mut entry = ctx.entry;
    let mut n_entry_fills = 0;
    while entry.qty != 0.0 && entry_touched(ctx.pside, &ctx.bar, &entry) {
        if n_entry_fills >= max_entry_fills {
            log::warn!(
                "{} {} minute {}: entry loop stopped after {} fills at price {}",
                ctx.symbol,
                side_name(ctx.pside),
                ctx.k,
                n_entry_fills,
                entry.price
            );
            break;
        }
        n_entry_fills += 1;
        let (size, price) = calc_new_psize_pprice(
            position.size,
            position.price,
            entry.qty,
            entry.price,
            ep.qty_step,
        );
        position = Position { size, price };
        let fee_paid = -qty_to_cost(entry.qty, entry.price, ep.inverse, ep.c_mult) * ctx.maker_fee;
        balance = apply_balance_delta(balance, fee_paid);
        fills.push(make_fill(balance, &position, &entry, 0.0, fee_paid));
        if entry.order_type.is_initial_entry() {
            break;
        }
        let next = next_entry(
            ctx.pside,
            ep,
            ctx.bot_params,
            balance,
            entry.price,
            &position,
        );
        if next.price == entry.price {
            break;
        }
        entry = next;
    }

    for close in ctx.closes {
        if close.qty == 0.0 || position.size == 0.0 {
            break;
        }
        if !close_touched(ctx.pside, &ctx.bar, close) {
            break;
        }
        let mut close_qty = close.qty;
        let mut new_size = round_(position.size + close_qty, ep.qty_step);
        let flipped = match ctx.pside {
            LONG => new_size < 0.0,
            _ => new_size > 0.0,
        };
        if flipped {
            log::warn!(
                "{} {} minute {}: close qty {} exceeds position size {}, clamping",
                ctx.symbol,
                side_name(ctx.pside),
                ctx.k,
                close.qty,
                position.size
            );
            close_qty = -position.size;
            new_size = 0.0;
        }
        let fee_paid = -qty_to_cost(close_qty, close.price, ep.inverse, ep.c_mult) * ctx.maker_fee;
        let pnl = calc_pnl(ctx.pside, position.price, close.price, close_qty, ep);
        balance = apply_balance_delta(balance, fee_paid + pnl);
        position = if new_size == 0.0 {
            Position::default()
        } else {
            Position {
                size: new_size,
                price: position.price,
            }
        };
        let filled = Order {
            qty: close_qty,
            ..*close
        };
        fills.push(make_fill(balance, &position, &filled, pnl, fee_paid));
    }

    let equity = balance + ctx.upnl_others + calc_upnl(ctx.pside, &position, &ctx.bar, ep);
    FillOutcome {
        fills,
        position,
        balance,
        equity,
    }
}

pub fn side_name(pside: usize) -> &'static str {
    match pside {
        LONG => "long",
        SHORT => "short",
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderType;
    use crate::utils::calc_pnl_long;

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

    fn bot_params() -> BotParams {
        BotParams {
            ddown_factor: 1.0,
            enabled: true,
            initial_eprice_ema_dist: 0.0,
            initial_qty_pct: 0.1,
            markup_range: 0.0,
            min_markup: 0.01,
            n_close_orders: 1,
            rentry_pprice_dist: 0.02,
            wallet_exposure_limit: 1.0,
            ..Default::default()
        }
    }

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar { high, low, close }
    }

    fn ctx<'a>(
        pside: usize,
        bar: Bar,
        position: Position,
        entry: Order,
        closes: &'a [Order],
        ep: &'a ExchangeParams,
        bp: &'a BotParams,
    ) -> FillContext<'a> {
        FillContext {
            k: 7,
            idx: 0,
            pside,
            symbol: "AAA",
            bar,
            balance: 1000.0,
            position,
            entry,
            closes,
            exchange_params: ep,
            bot_params: bp,
            maker_fee: 0.0002,
            upnl_others: 0.0,
        }
    }

    #[test]
    fn test_entry_then_close_round_trip() {
        let ep = exchange_params();
        let bp = bot_params();
        let entry = Order {
            qty: 1.5,
            price: 100.0,
            order_type: OrderType::EntryInitialNormalLong,
        };
        let closes = [Order {
            qty: -1.5,
            price: 102.0,
            order_type: OrderType::CloseGridLong,
        }];
        let outcome = calc_fills(&ctx(
            LONG,
            bar(102.5, 99.5, 102.0),
            Position::default(),
            entry,
            &closes,
            &ep,
            &bp,
        ));
        assert_eq!(outcome.fills.len(), 2);
        let fee_entry = 1.5 * 100.0 * 0.0002;
        let fee_close = 1.5 * 102.0 * 0.0002;
        let pnl = calc_pnl_long(100.0, 102.0, -1.5, false, 1.0);
        assert!((pnl - 3.0).abs() < 1e-12);
        let expected = (1000.0 - fee_entry) + (-fee_close + pnl);
        assert_eq!(outcome.balance, expected);
        assert_eq!(outcome.position, Position::default());
        assert_eq!(outcome.fills[1].pnl, pnl);
        assert_eq!(outcome.fills[1].order_type, OrderType::CloseGridLong);
        assert_eq!(outcome.equity, outcome.balance);
    }

    #[test]
    fn test_initial_entry_does_not_recurse() {
        let ep = exchange_params();
        let bp = bot_params();
        let entry = Order {
            qty: 1.0,
            price: 100.0,
            order_type: OrderType::EntryInitialNormalLong,
        };
        let outcome = calc_fills(&ctx(
            LONG,
            bar(101.0, 50.0, 60.0),
            Position::default(),
            entry,
            &[],
            &ep,
            &bp,
        ));
        assert_eq!(outcome.fills.len(), 1);
        assert_eq!(
            outcome.position,
            Position {
                size: 1.0,
                price: 100.0
            }
        );
        // equity marks the new long at the bar low
        let expected_equity = outcome.balance + calc_pnl_long(100.0, 50.0, 1.0, false, 1.0);
        assert_eq!(outcome.equity, expected_equity);
        assert!((outcome.fills[0].stuckness - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_reentries_recurse_down_the_ladder() {
        let ep = exchange_params();
        let bp = bot_params();
        let entry = Order {
            qty: 1.0,
            price: 98.0,
            order_type: OrderType::EntryGridNormalLong,
        };
        let position = Position {
            size: 1.0,
            price: 100.0,
        };
        let outcome = calc_fills(&ctx(
            LONG,
            bar(99.0, 90.0, 91.0),
            position,
            entry,
            &[],
            &ep,
            &bp,
        ));
        assert!(outcome.fills.len() >= 2, "fills {:?}", outcome.fills);
        for pair in outcome.fills.windows(2) {
            assert!(pair[1].fill_price < pair[0].fill_price);
        }
        assert!(outcome.fills.iter().all(|f| f.fill_price > 90.0));
        let total_qty: f64 = 1.0 + outcome.fills.iter().map(|f| f.fill_qty).sum::<f64>();
        assert!((outcome.position.size - total_qty).abs() < 1e-9);
    }

    #[test]
    fn test_entry_loop_stops_at_fill_cap() {
        let ep = exchange_params();
        let bp = bot_params();
        let entry = Order {
            qty: 1.0,
            price: 98.0,
            order_type: OrderType::EntryGridNormalLong,
        };
        let position = Position {
            size: 1.0,
            price: 100.0,
        };
        let fill_ctx = ctx(
            LONG,
            bar(99.0, 90.0, 91.0),
            position,
            entry,
            &[],
            &ep,
            &bp,
        );
        let uncapped = calc_fills(&fill_ctx);
        assert!(uncapped.fills.len() >= 2);

        let capped = calc_fills_capped(&fill_ctx, 1);
        assert_eq!(capped.fills.len(), 1);
        assert_eq!(capped.fills[0], uncapped.fills[0]);
        assert_eq!(capped.position.size, 2.0);
        assert_eq!(capped.position.price, 99.0);
        assert_eq!(capped.balance, 1000.0 - 98.0 * 0.0002);
    }

    #[test]
    fn test_close_overflow_is_clamped() {
        let ep = exchange_params();
        let bp = bot_params();
        let closes = [
            Order {
                qty: -0.6,
                price: 101.0,
                order_type: OrderType::CloseGridLong,
            },
            Order {
                qty: -0.6,
                price: 102.0,
                order_type: OrderType::CloseGridLong,
            },
        ];
        let outcome = calc_fills(&ctx(
            LONG,
            bar(103.0, 100.5, 102.5),
            Position {
                size: 1.0,
                price: 100.0,
            },
            Order::default(),
            &closes,
            &ep,
            &bp,
        ));
        assert_eq!(outcome.fills.len(), 2);
        assert!((outcome.fills[1].fill_qty + 0.4).abs() < 1e-9);
        assert_eq!(outcome.position, Position::default());
    }

    #[test]
    fn test_short_closes_stop_at_untouched_price() {
        let ep = exchange_params();
        let bp = bot_params();
        let closes = [
            Order {
                qty: 1.0,
                price: 99.0,
                order_type: OrderType::CloseGridShort,
            },
            Order {
                qty: 1.0,
                price: 98.0,
                order_type: OrderType::CloseGridShort,
            },
        ];
        let position = Position {
            size: -2.0,
            price: 100.0,
        };
        let outcome = calc_fills(&ctx(
            SHORT,
            bar(99.5, 98.5, 99.0),
            position,
            Order::default(),
            &closes,
            &ep,
            &bp,
        ));
        assert_eq!(outcome.fills.len(), 1);
        assert_eq!(outcome.position.size, -1.0);
        assert_eq!(outcome.position.price, 100.0);
        assert!((outcome.fills[0].pnl - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fill_triggered() {
        let position = Position {
            size: 1.0,
            price: 100.0,
        };
        let entry = Order {
            qty: 1.0,
            price: 98.0,
            order_type: OrderType::EntryGridNormalLong,
        };
        let closes = [Order {
            qty: -1.0,
            price: 101.0,
            order_type: OrderType::CloseGridLong,
        }];
        assert!(!fill_triggered(LONG, &bar(100.5, 98.5, 99.0), &position, &entry, &closes));
        assert!(fill_triggered(LONG, &bar(101.5, 98.5, 99.0), &position, &entry, &closes));
        assert!(fill_triggered(LONG, &bar(100.5, 97.5, 99.0), &position, &entry, &closes));
        assert!(!fill_triggered(
            LONG,
            &bar(101.5, 98.5, 99.0),
            &Position::default(),
            &Order::default(),
            &closes
        ));
    }

    #[test]
    fn test_balance_floor() {
        assert_eq!(apply_balance_delta(100.0, -500.0), 100.0 * BALANCE_FLOOR_RATIO);
        assert_eq!(apply_balance_delta(100.0, 5.0), 105.0);
    }
}
