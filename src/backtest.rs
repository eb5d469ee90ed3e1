use crate::candles::Candles;
use crate::closes::{calc_close_grid_long, calc_close_grid_short, sort_closes};
use crate::coin_selection::{select_active_symbols, validate_ranking};
use crate::constants::{
    BANKRUPTCY_EQUITY_RATIO, BANKRUPT_EQUITY_FACTOR, LONG, SHORT, STATS_INTERVAL_MINUTES,
};
use crate::entries::{calc_recursive_entry_long, calc_recursive_entry_short};
use crate::error::BacktestError;
use crate::fills::{calc_fills, calc_stuckness, calc_upnl, fill_triggered, side_name, FillContext};
use crate::ledger::{Ledger, StuckSets, SymbolSet};
use crate::risk::{calc_unstucking_action, is_stuck, UnstuckPositionInput};
use crate::types::{
    BacktestParams, BotParamsPair, EMABands, ExchangeParams, Fill, ForagerParamsPair, Order,
    OrderBook, Position, StateParams, StatsSnapshot, UnstuckOrder, UnstuckParamsPair,
};
use crate::utils::{calc_ema, calc_ema_alphas, round_};
use ndarray::{ArrayView2, ArrayView3};
use serde::Serialize;

#[derive(Clone, Default, Copy, Debug)]
pub struct EmaAlphas {
    pub long: [f64; 3],
    pub short: [f64; 3],
}

#[derive(Clone, Default, Copy, Debug)]
pub struct EMAs {
    pub long: [f64; 3],
    pub short: [f64; 3],
}

impl EMAs {
    pub fn compute_bands(&self, pside: usize) -> EMABands {
        let emas = match pside {
            LONG => &self.long,
            SHORT => &self.short,
            _ => unreachable!(),
        };
        EMABands {
            upper: emas.iter().fold(f64::MIN, |acc, &x| acc.max(x)),
            lower: emas.iter().fold(f64::MAX, |acc, &x| acc.min(x)),
        }
    }
}

/// Pending entry plus close ladder for one symbol and side, closes in walk order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenOrderBundle {
    pub entry: Order,
    pub closes: Vec<Order>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenOrders {
    pub long: Vec<OpenOrderBundle>,
    pub short: Vec<OpenOrderBundle>,
}

impl OpenOrders {
    fn new(n_symbols: usize) -> Self {
        OpenOrders {
            long: vec![OpenOrderBundle::default(); n_symbols],
            short: vec![OpenOrderBundle::default(); n_symbols],
        }
    }

    pub fn get(&self, pside: usize, idx: usize) -> &OpenOrderBundle {
        match pside {
            LONG => &self.long[idx],
            SHORT => &self.short[idx],
            _ => unreachable!(),
        }
    }

    fn get_mut(&mut self, pside: usize, idx: usize) -> &mut OpenOrderBundle {
        match pside {
            LONG => &mut self.long[idx],
            SHORT => &mut self.short[idx],
            _ => unreachable!(),
        }
    }
}

/// Decides which symbols may hold orders on a side, and how widely a fill triggers a refresh.
pub trait ActivationPolicy {
    /// Active symbols for `pside` at minute `k`. `eligible` tells whether a symbol can be
    /// activated this minute.
    fn update_actives(
        &mut self,
        k: usize,
        pside: usize,
        open_positions: &SymbolSet,
        eligible: impl Fn(usize) -> bool,
    ) -> &SymbolSet;

    /// Whether a fill anywhere refreshes every active symbol, or only the filled ones.
    fn refresh_all_on_fill(&self) -> bool;
}

/// Every enabled symbol is always active.
#[derive(Debug, Clone)]
pub struct FixedUniverse {
    tradeable: [SymbolSet; 2],
}

impl FixedUniverse {
    pub fn new(bot_params: &[BotParamsPair]) -> Self {
        let side = |pside: usize| {
            let mut set = SymbolSet::with_capacity(bot_params.len());
            for (idx, bp) in bot_params.iter().enumerate() {
                set.set(idx, bp.get(pside).is_tradeable());
            }
            set
        };
        FixedUniverse {
            tradeable: [side(LONG), side(SHORT)],
        }
    }
}

impl ActivationPolicy for FixedUniverse {
    fn update_actives(
        &mut self,
        _k: usize,
        pside: usize,
        _open_positions: &SymbolSet,
        _eligible: impl Fn(usize) -> bool,
    ) -> &SymbolSet {
        &self.tradeable[pside]
    }

    fn refresh_all_on_fill(&self) -> bool {
        true
    }
}

/// Rotates a limited number of slots through the universe by a per-minute ranking.
#[derive(Debug, Clone)]
pub struct Forager<'a> {
    ranking: ArrayView2<'a, usize>,
    n_positions: [usize; 2],
    actives: [SymbolSet; 2],
}

impl<'a> Forager<'a> {
    pub fn new(ranking: ArrayView2<'a, usize>, n_symbols: usize, n_positions: [usize; 2]) -> Self {
        Forager {
            ranking,
            n_positions,
            actives: [
                SymbolSet::with_capacity(n_symbols),
                SymbolSet::with_capacity(n_symbols),
            ],
        }
    }
}

impl<'a> ActivationPolicy for Forager<'a> {
    fn update_actives(
        &mut self,
        k: usize,
        pside: usize,
        open_positions: &SymbolSet,
        eligible: impl Fn(usize) -> bool,
    ) -> &SymbolSet {
        self.actives[pside] = select_active_symbols(
            open_positions,
            self.ranking.row(k).iter().copied(),
            self.n_positions[pside],
            eligible,
        );
        &self.actives[pside]
    }

    fn refresh_all_on_fill(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BacktestResult {
    pub fills: Vec<Fill>,
    pub stats: Vec<StatsSnapshot>,
    pub bankrupt: bool,
}

pub struct Backtest<'a, P: ActivationPolicy> {
    candles: Candles<'a>,
    bot_params: Vec<BotParamsPair>,
    exchange_params_list: Vec<ExchangeParams>,
    unstuck_params: UnstuckParamsPair,
    backtest_params: BacktestParams,
    policy: P,
    balance: f64,
    ledger: Ledger,
    open_orders: OpenOrders,
    ema_alphas: Vec<EmaAlphas>,
    emas: Vec<EMAs>,
    stuck: StuckSets,
    did_fill: [SymbolSet; 2],
    prev_unstuck: Option<(usize, usize)>,
    pnl_cumsum_running: f64,
    pnl_cumsum_max: f64,
    fills: Vec<Fill>,
    stats: Vec<StatsSnapshot>,
    bankrupt: bool,
}

impl<'a> Backtest<'a, FixedUniverse> {
    /// Fixed-universe run: every symbol trades with its own config for the whole range.
    pub fn new(
        hlcs: ArrayView3<'a, f64>,
        bot_params: Vec<BotParamsPair>,
        exchange_params_list: Vec<ExchangeParams>,
        backtest_params: &BacktestParams,
        unstuck_params: UnstuckParamsPair,
    ) -> Result<Self, BacktestError> {
        let bot_params: Vec<BotParamsPair> = bot_params
            .iter()
            .map(|bp| BotParamsPair {
                long: bp.long.without_auto_unstuck(),
                short: bp.short.without_auto_unstuck(),
            })
            .collect();
        let policy = FixedUniverse::new(&bot_params);
        Backtest::build(
            hlcs,
            bot_params,
            exchange_params_list,
            backtest_params,
            unstuck_params,
            policy,
        )
    }
}

impl<'a> Backtest<'a, Forager<'a>> {
    /// Forager run: one shared config per side, slots filled from `ranking`, shape
    /// `(n_minutes, <= n_symbols)`.
    pub fn new_forager(
        hlcs: ArrayView3<'a, f64>,
        ranking: ArrayView2<'a, usize>,
        forager_params: &ForagerParamsPair,
        exchange_params_list: Vec<ExchangeParams>,
        backtest_params: &BacktestParams,
    ) -> Result<Self, BacktestError> {
        let n_symbols = backtest_params.symbols.len();
        validate_ranking(ranking, hlcs.shape()[1], n_symbols)?;
        let bot_params = vec![
            BotParamsPair {
                long: forager_params.long.to_bot_params(),
                short: forager_params.short.to_bot_params(),
            };
            n_symbols
        ];
        let unstuck_params = UnstuckParamsPair {
            long: forager_params.long.to_unstuck_params(),
            short: forager_params.short.to_unstuck_params(),
        };
        let policy = Forager::new(
            ranking,
            n_symbols,
            [
                forager_params.long.n_positions,
                forager_params.short.n_positions,
            ],
        );
        Backtest::build(
            hlcs,
            bot_params,
            exchange_params_list,
            backtest_params,
            unstuck_params,
            policy,
        )
    }
}

impl<'a, P: ActivationPolicy> Backtest<'a, P> {
    fn build(
        hlcs: ArrayView3<'a, f64>,
        bot_params: Vec<BotParamsPair>,
        exchange_params_list: Vec<ExchangeParams>,
        backtest_params: &BacktestParams,
        unstuck_params: UnstuckParamsPair,
        policy: P,
    ) -> Result<Self, BacktestError> {
        let n_symbols = backtest_params.symbols.len();
        let candles = Candles::new(hlcs, n_symbols)?;
        if bot_params.len() != n_symbols {
            return Err(BacktestError::BotParamsCount {
                expected: n_symbols,
                found: bot_params.len(),
            });
        }
        if exchange_params_list.len() != n_symbols {
            return Err(BacktestError::ExchangeParamsCount {
                expected: n_symbols,
                found: exchange_params_list.len(),
            });
        }
        let starting_balance = backtest_params.starting_balance;
        if !(starting_balance > 0.0 && starting_balance.is_finite()) {
            return Err(BacktestError::InvalidStartingBalance(starting_balance));
        }

        let ema_alphas: Vec<EmaAlphas> = bot_params
            .iter()
            .map(|bp| EmaAlphas {
                long: calc_ema_alphas(bp.long.ema_span_0, bp.long.ema_span_1),
                short: calc_ema_alphas(bp.short.ema_span_0, bp.short.ema_span_1),
            })
            .collect();
        let emas: Vec<EMAs> = (0..n_symbols)
            .map(|idx| {
                let first_close = candles.first_close(idx);
                EMAs {
                    long: [first_close; 3],
                    short: [first_close; 3],
                }
            })
            .collect();

        Ok(Backtest {
            candles,
            bot_params,
            exchange_params_list,
            unstuck_params,
            backtest_params: backtest_params.clone(),
            policy,
            balance: starting_balance,
            ledger: Ledger::new(n_symbols),
            open_orders: OpenOrders::new(n_symbols),
            ema_alphas,
            emas,
            stuck: StuckSets::new(n_symbols),
            did_fill: [
                SymbolSet::with_capacity(n_symbols),
                SymbolSet::with_capacity(n_symbols),
            ],
            prev_unstuck: None,
            pnl_cumsum_running: 0.0,
            pnl_cumsum_max: 0.0,
            fills: Vec::new(),
            stats: Vec::new(),
            bankrupt: false,
        })
    }

    pub fn open_orders(&self, pside: usize, idx: usize) -> &OpenOrderBundle {
        self.open_orders.get(pside, idx)
    }

    pub fn position(&self, pside: usize, idx: usize) -> Position {
        self.ledger.get(pside, idx)
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn run(&mut self) -> BacktestResult {
        let n_minutes = self.candles.n_minutes();
        log::info!(
            "starting backtest: {} symbols, {} minutes, starting balance {}",
            self.candles.n_symbols(),
            n_minutes,
            self.backtest_params.starting_balance
        );
        self.start();
        let mut k_last = n_minutes - 1;
        for k in 1..n_minutes {
            self.step(k);
            if self.bankrupt {
                k_last = k;
                break;
            }
        }
        self.finish(k_last);
        log::info!(
            "backtest finished at minute {}: {} fills, balance {}, bankrupt: {}",
            k_last,
            self.fills.len(),
            self.balance,
            self.bankrupt
        );
        BacktestResult {
            fills: std::mem::take(&mut self.fills),
            stats: std::mem::take(&mut self.stats),
            bankrupt: self.bankrupt,
        }
    }

    fn start(&mut self) {
        self.update_open_orders(0, false, None);
        self.record_stats(0);
    }

    fn step(&mut self, k: usize) {
        let any_fill = self.check_for_fills(k);
        self.update_emas(k);
        let unstuck = self.calc_unstuck_order(k);
        self.update_open_orders(k, any_fill, unstuck);
        if k % STATS_INTERVAL_MINUTES == 0 {
            self.record_stats(k);
        }
    }

    fn finish(&mut self, k: usize) {
        let equity = self.calc_equity(k);
        if self.bankrupt {
            let equity = f64::min(
                self.backtest_params.starting_balance * BANKRUPT_EQUITY_FACTOR,
                equity,
            );
            let recorded = self.stats.last().map(|last| last.index) == Some(k);
            if recorded {
                if let Some(last) = self.stats.last_mut() {
                    last.equity = equity;
                }
            } else {
                let snapshot = self.snapshot(k, equity);
                self.stats.push(snapshot);
            }
        } else if self.stats.last().map_or(true, |last| last.index != k) {
            let snapshot = self.snapshot(k, equity);
            self.stats.push(snapshot);
        }
    }

    /// Sum of unrealized PnL over open positions with data at `k`, optionally leaving one out.
    fn calc_upnl_sum(&self, k: usize, exclude: Option<(usize, usize)>) -> f64 {
        let mut upnl = 0.0;
        for pside in [LONG, SHORT] {
            for idx in self.ledger.open_positions(pside).iter() {
                if exclude == Some((pside, idx)) || !self.candles.has_data(k, idx) {
                    continue;
                }
                upnl += calc_upnl(
                    pside,
                    &self.ledger.get(pside, idx),
                    &self.candles.bar(k, idx),
                    &self.exchange_params_list[idx],
                );
            }
        }
        upnl
    }

    fn calc_equity(&self, k: usize) -> f64 {
        self.balance + self.calc_upnl_sum(k, None)
    }

    fn snapshot(&self, k: usize, equity: f64) -> StatsSnapshot {
        StatsSnapshot {
            index: k,
            positions_long: self.ledger.positions(LONG).to_vec(),
            positions_short: self.ledger.positions(SHORT).to_vec(),
            closes: self.candles.closes(k),
            balance: self.balance,
            equity,
        }
    }

    fn record_stats(&mut self, k: usize) {
        let equity = self.calc_equity(k);
        if equity / self.balance < BANKRUPTCY_EQUITY_RATIO {
            self.bankrupt = true;
        }
        let snapshot = self.snapshot(k, equity);
        self.stats.push(snapshot);
    }

    /// Matches every symbol's pending orders against bar `k`, long side first.
    fn check_for_fills(&mut self, k: usize) -> bool {
        let mut any_fill = false;
        for pside in [LONG, SHORT] {
            self.did_fill[pside].clear();
            for idx in 0..self.candles.n_symbols() {
                if !self.candles.has_data(k, idx) {
                    continue;
                }
                let bar = self.candles.bar(k, idx);
                let position = self.ledger.get(pside, idx);
                let bundle = self.open_orders.get(pside, idx);
                if !fill_triggered(pside, &bar, &position, &bundle.entry, &bundle.closes) {
                    continue;
                }
                let outcome = calc_fills(&FillContext {
                    k,
                    idx,
                    pside,
                    symbol: &self.backtest_params.symbols[idx],
                    bar,
                    balance: self.balance,
                    position,
                    entry: bundle.entry,
                    closes: &bundle.closes,
                    exchange_params: &self.exchange_params_list[idx],
                    bot_params: self.bot_params[idx].get(pside),
                    maker_fee: self.backtest_params.maker_fee,
                    upnl_others: self.calc_upnl_sum(k, Some((pside, idx))),
                });
                if outcome.fills.is_empty() {
                    continue;
                }
                any_fill = true;
                self.did_fill[pside].insert(idx);
                self.balance = outcome.balance;
                self.ledger.set(pside, idx, outcome.position);
                for fill in &outcome.fills {
                    self.pnl_cumsum_running += fill.pnl;
                    self.pnl_cumsum_max = self.pnl_cumsum_max.max(self.pnl_cumsum_running);
                }
                if outcome.equity / self.balance < BANKRUPTCY_EQUITY_RATIO {
                    self.bankrupt = true;
                }
                let stuckness = calc_stuckness(
                    self.balance,
                    &outcome.position,
                    &self.exchange_params_list[idx],
                    self.bot_params[idx].get(pside),
                );
                self.stuck.set(
                    pside,
                    idx,
                    outcome.position.is_open()
                        && is_stuck(stuckness, self.unstuck_params.get(pside)),
                );
                self.fills.extend(outcome.fills);
            }
        }
        any_fill
    }

    fn update_emas(&mut self, k: usize) {
        for idx in 0..self.candles.n_symbols() {
            if !self.candles.has_data(k, idx) {
                continue;
            }
            let close = self.candles.close(k, idx);
            let alphas = &self.ema_alphas[idx];
            let emas = &mut self.emas[idx];
            for i in 0..3 {
                emas.long[i] = calc_ema(alphas.long[i], 1.0 - alphas.long[i], emas.long[i], close);
                emas.short[i] =
                    calc_ema(alphas.short[i], 1.0 - alphas.short[i], emas.short[i], close);
            }
        }
    }

    fn calc_unstuck_order(&self, k: usize) -> Option<UnstuckOrder> {
        if !self.stuck.any() {
            return None;
        }
        let mut inputs = Vec::new();
        for pside in [LONG, SHORT] {
            for idx in self.stuck.get(pside).iter() {
                if !self.candles.has_data(k, idx) {
                    continue;
                }
                inputs.push(UnstuckPositionInput {
                    idx,
                    pside,
                    position: self.ledger.get(pside, idx),
                    current_price: self.candles.close(k, idx),
                    ema_bands: self.emas[idx].compute_bands(pside),
                    exchange_params: self.exchange_params_list[idx],
                    wallet_exposure_limit: self.bot_params[idx].get(pside).wallet_exposure_limit,
                });
            }
        }
        let action = calc_unstucking_action(
            self.balance,
            self.pnl_cumsum_max,
            self.pnl_cumsum_running,
            &self.unstuck_params,
            &inputs,
        );
        if let Some(action) = &action {
            log::debug!(
                "minute {}: unstucking {} {} with {:?}",
                k,
                self.backtest_params.symbols[action.idx],
                side_name(action.pside),
                action.order
            );
        }
        action
    }

    fn update_open_orders(&mut self, k: usize, any_fill: bool, unstuck: Option<UnstuckOrder>) {
        let unstuck_target = unstuck.map(|u| (u.pside, u.idx));
        let refresh_all = any_fill && self.policy.refresh_all_on_fill();
        for pside in [LONG, SHORT] {
            let candles = self.candles;
            let bot_params = &self.bot_params;
            let actives = self
                .policy
                .update_actives(k, pside, self.ledger.open_positions(pside), |idx| {
                    candles.has_data(k, idx) && bot_params[idx].get(pside).is_tradeable()
                })
                .clone();

            for idx in 0..candles.n_symbols() {
                if !actives.contains(idx) && !self.ledger.get(pside, idx).is_open() {
                    let bundle = self.open_orders.get_mut(pside, idx);
                    if bundle.entry.qty != 0.0 || !bundle.closes.is_empty() {
                        *bundle = OpenOrderBundle::default();
                    }
                }
            }

            for idx in actives.iter() {
                if !candles.has_data(k, idx) {
                    continue;
                }
                let is_target = unstuck_target == Some((pside, idx));
                let refresh = refresh_all
                    || self.did_fill[pside].contains(idx)
                    || !self.ledger.get(pside, idx).is_open()
                    || is_target
                    || self.prev_unstuck == Some((pside, idx));
                if refresh {
                    let unstuck_order = match unstuck {
                        Some(u) if is_target => Some(u.order),
                        _ => None,
                    };
                    self.refresh_orders(k, pside, idx, unstuck_order);
                }
            }
        }
        self.prev_unstuck = unstuck_target;
    }

    /// Rebuilds the entry and close ladder of one symbol from bar `k`, putting an unstuck
    /// close in front of the regular ladder when given.
    fn refresh_orders(&mut self, k: usize, pside: usize, idx: usize, unstuck: Option<Order>) {
        let exchange_params = &self.exchange_params_list[idx];
        let bot_params = self.bot_params[idx].get(pside);
        let close = self.candles.close(k, idx);
        let state_params = StateParams {
            balance: self.balance,
            order_book: OrderBook {
                bid: close,
                ask: close,
            },
            ema_bands: self.emas[idx].compute_bands(pside),
        };
        let position = self.ledger.get(pside, idx);
        let calc_closes = |position: &Position| match pside {
            LONG => calc_close_grid_long(exchange_params, &state_params, bot_params, position),
            SHORT => calc_close_grid_short(exchange_params, &state_params, bot_params, position),
            _ => unreachable!(),
        };
        let entry = match pside {
            LONG => {
                calc_recursive_entry_long(exchange_params, &state_params, bot_params, &position)
            }
            SHORT => {
                calc_recursive_entry_short(exchange_params, &state_params, bot_params, &position)
            }
            _ => unreachable!(),
        };
        let closes = match unstuck {
            Some(order) => {
                let remaining = Position {
                    size: round_(position.size + order.qty, exchange_params.qty_step),
                    price: position.price,
                };
                let mut closes = vec![order];
                closes.extend(calc_closes(&remaining));
                sort_closes(pside, &mut closes);
                closes
            }
            None => calc_closes(&position),
        };
        *self.open_orders.get_mut(pside, idx) = OpenOrderBundle { entry, closes };
    }
}
