use crate::constants::{LONG, SHORT};
use crate::error::BacktestError;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExchangeParams {
    pub qty_step: f64,
    pub price_step: f64,
    pub min_qty: f64,
    pub min_cost: f64,
    pub c_mult: f64,
    #[serde(default)]
    pub inverse: bool,
}

impl Default for ExchangeParams {
    fn default() -> Self {
        ExchangeParams {
            qty_step: 0.00001,
            price_step: 0.00001,
            min_qty: 0.00001,
            min_cost: 1.0,
            c_mult: 1.0,
            inverse: false,
        }
    }
}

/// Signed size (long >= 0, short <= 0) and average entry price.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub size: f64,
    pub price: f64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.size != 0.0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct EMABands {
    pub upper: f64,
    pub lower: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Order {
    pub qty: f64,
    pub price: f64,
    pub order_type: OrderType,
}

impl Default for Order {
    fn default() -> Self {
        Order {
            qty: 0.0,
            price: 0.0,
            order_type: OrderType::Empty,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct OrderBook {
    pub bid: f64,
    pub ask: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct StateParams {
    pub balance: f64,
    pub order_book: OrderBook,
    pub ema_bands: EMABands,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderType {
    EntryInitialNormalLong,
    EntryInitialPartialLong,
    EntryGridNormalLong,
    EntryGridCroppedLong,
    EntryUnstuckLong,

    CloseGridLong,
    CloseUnstuckLong,

    EntryInitialNormalShort,
    EntryInitialPartialShort,
    EntryGridNormalShort,
    EntryGridCroppedShort,
    EntryUnstuckShort,

    CloseGridShort,
    CloseUnstuckShort,

    Empty,
}

impl OrderType {
    pub fn is_initial_entry(&self) -> bool {
        matches!(
            self,
            OrderType::EntryInitialNormalLong
                | OrderType::EntryInitialPartialLong
                | OrderType::EntryInitialNormalShort
                | OrderType::EntryInitialPartialShort
        )
    }

    pub fn is_entry(&self) -> bool {
        matches!(
            self,
            OrderType::EntryInitialNormalLong
                | OrderType::EntryInitialPartialLong
                | OrderType::EntryGridNormalLong
                | OrderType::EntryGridCroppedLong
                | OrderType::EntryUnstuckLong
                | OrderType::EntryInitialNormalShort
                | OrderType::EntryInitialPartialShort
                | OrderType::EntryGridNormalShort
                | OrderType::EntryGridCroppedShort
                | OrderType::EntryUnstuckShort
        )
    }

    pub fn is_close(&self) -> bool {
        matches!(
            self,
            OrderType::CloseGridLong
                | OrderType::CloseUnstuckLong
                | OrderType::CloseGridShort
                | OrderType::CloseUnstuckShort
        )
    }
}

pub const BOT_PARAMS_N_FIELDS: usize = 17;

/// Per symbol, per side strategy config.
///
/// Field order matches the positional layout accepted by [`BotParams::from_slice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BotParams {
    pub auto_unstuck_delay_minutes: f64,
    pub auto_unstuck_ema_dist: f64,
    pub auto_unstuck_qty_pct: f64,
    pub auto_unstuck_wallet_exposure_threshold: f64,
    pub backwards_tp: bool,
    pub ddown_factor: f64,
    pub ema_span_0: f64,
    pub ema_span_1: f64,
    pub enabled: bool,
    pub initial_eprice_ema_dist: f64,
    pub initial_qty_pct: f64,
    pub markup_range: f64,
    pub min_markup: f64,
    pub n_close_orders: usize,
    pub rentry_pprice_dist: f64,
    pub rentry_pprice_dist_wallet_exposure_weighting: f64,
    pub wallet_exposure_limit: f64,
}

impl BotParams {
    pub fn from_slice(values: &[f64]) -> Result<Self, BacktestError> {
        if values.len() != BOT_PARAMS_N_FIELDS {
            return Err(BacktestError::ConfigFieldCount {
                kind: "bot params",
                expected: BOT_PARAMS_N_FIELDS,
                found: values.len(),
            });
        }
        Ok(BotParams {
            auto_unstuck_delay_minutes: values[0],
            auto_unstuck_ema_dist: values[1],
            auto_unstuck_qty_pct: values[2],
            auto_unstuck_wallet_exposure_threshold: values[3],
            backwards_tp: values[4] != 0.0,
            ddown_factor: values[5],
            ema_span_0: values[6],
            ema_span_1: values[7],
            enabled: values[8] != 0.0,
            initial_eprice_ema_dist: values[9],
            initial_qty_pct: values[10],
            markup_range: values[11],
            min_markup: values[12],
            n_close_orders: values[13].round().max(0.0) as usize,
            rentry_pprice_dist: values[14],
            rentry_pprice_dist_wallet_exposure_weighting: values[15],
            wallet_exposure_limit: values[16],
        })
    }

    /// Copy with the auto-unstuck fields zeroed; unsticking in simulation is
    /// handled by the central allocator instead.
    pub fn without_auto_unstuck(&self) -> Self {
        BotParams {
            auto_unstuck_delay_minutes: 0.0,
            auto_unstuck_ema_dist: 0.0,
            auto_unstuck_qty_pct: 0.0,
            auto_unstuck_wallet_exposure_threshold: 0.0,
            ..*self
        }
    }

    pub fn is_tradeable(&self) -> bool {
        self.enabled && self.wallet_exposure_limit > 0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BotParamsPair {
    pub long: BotParams,
    pub short: BotParams,
}

impl BotParamsPair {
    #[inline(always)]
    pub fn get(&self, pside: usize) -> &BotParams {
        match pside {
            LONG => &self.long,
            SHORT => &self.short,
            _ => unreachable!(),
        }
    }
}

pub const FORAGER_PARAMS_N_FIELDS: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ForagerParams {
    pub ddown_factor: f64,
    pub ema_span_0: f64,
    pub ema_span_1: f64,
    pub initial_eprice_ema_dist: f64,
    pub initial_qty_pct: f64,
    pub markup_range: f64,
    pub min_markup: f64,
    pub n_close_orders: usize,
    pub n_positions: usize,
    pub rentry_pprice_dist: f64,
    pub rentry_pprice_dist_wallet_exposure_weighting: f64,
    pub total_wallet_exposure_limit: f64,
    pub unstuck_close_pct: f64,
    pub unstuck_ema_dist: f64,
    pub unstuck_loss_allowance_pct: f64,
    pub unstuck_threshold: f64,
}

impl ForagerParams {
    pub fn from_slice(values: &[f64]) -> Result<Self, BacktestError> {
        if values.len() != FORAGER_PARAMS_N_FIELDS {
            return Err(BacktestError::ConfigFieldCount {
                kind: "forager params",
                expected: FORAGER_PARAMS_N_FIELDS,
                found: values.len(),
            });
        }
        Ok(ForagerParams {
            ddown_factor: values[0],
            ema_span_0: values[1],
            ema_span_1: values[2],
            initial_eprice_ema_dist: values[3],
            initial_qty_pct: values[4],
            markup_range: values[5],
            min_markup: values[6],
            n_close_orders: values[7].round().max(0.0) as usize,
            n_positions: values[8].round().max(0.0) as usize,
            rentry_pprice_dist: values[9],
            rentry_pprice_dist_wallet_exposure_weighting: values[10],
            total_wallet_exposure_limit: values[11],
            unstuck_close_pct: values[12],
            unstuck_ema_dist: values[13],
            unstuck_loss_allowance_pct: values[14],
            unstuck_threshold: values[15],
        })
    }

    pub fn wallet_exposure_limit(&self) -> f64 {
        if self.n_positions == 0 {
            0.0
        } else {
            self.total_wallet_exposure_limit / self.n_positions as f64
        }
    }

    /// Per symbol ladder config shared by every symbol in the universe.
    pub fn to_bot_params(&self) -> BotParams {
        BotParams {
            auto_unstuck_delay_minutes: 0.0,
            auto_unstuck_ema_dist: 0.0,
            auto_unstuck_qty_pct: 0.0,
            auto_unstuck_wallet_exposure_threshold: 0.0,
            backwards_tp: true,
            ddown_factor: self.ddown_factor,
            ema_span_0: self.ema_span_0,
            ema_span_1: self.ema_span_1,
            enabled: self.n_positions > 0,
            initial_eprice_ema_dist: self.initial_eprice_ema_dist,
            initial_qty_pct: self.initial_qty_pct,
            markup_range: self.markup_range,
            min_markup: self.min_markup,
            n_close_orders: self.n_close_orders,
            rentry_pprice_dist: self.rentry_pprice_dist,
            rentry_pprice_dist_wallet_exposure_weighting: self
                .rentry_pprice_dist_wallet_exposure_weighting,
            wallet_exposure_limit: self.wallet_exposure_limit(),
        }
    }

    pub fn to_unstuck_params(&self) -> UnstuckParams {
        UnstuckParams {
            loss_allowance_pct: self.unstuck_loss_allowance_pct,
            stuck_threshold: self.unstuck_threshold,
            close_pct: self.unstuck_close_pct,
            ema_dist: self.unstuck_ema_dist,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ForagerParamsPair {
    pub long: ForagerParams,
    pub short: ForagerParams,
}

impl ForagerParamsPair {
    pub fn get(&self, pside: usize) -> &ForagerParams {
        match pside {
            LONG => &self.long,
            SHORT => &self.short,
            _ => unreachable!(),
        }
    }
}

/// Risk budget driving stuck detection and forced unstuck closes on one side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UnstuckParams {
    pub loss_allowance_pct: f64,
    pub stuck_threshold: f64,
    pub close_pct: f64,
    pub ema_dist: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UnstuckParamsPair {
    pub long: UnstuckParams,
    pub short: UnstuckParams,
}

impl UnstuckParamsPair {
    /// Same budget on both sides, no EMA distance.
    pub fn uniform(loss_allowance_pct: f64, stuck_threshold: f64, close_pct: f64) -> Self {
        let params = UnstuckParams {
            loss_allowance_pct,
            stuck_threshold,
            close_pct,
            ema_dist: 0.0,
        };
        UnstuckParamsPair {
            long: params,
            short: params,
        }
    }

    #[inline(always)]
    pub fn get(&self, pside: usize) -> &UnstuckParams {
        match pside {
            LONG => &self.long,
            SHORT => &self.short,
            _ => unreachable!(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestParams {
    pub starting_balance: f64,
    pub maker_fee: f64,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fill {
    pub index: usize,
    pub symbol: String,
    pub pnl: f64,
    pub fee_paid: f64,
    pub balance: f64,
    pub equity: f64,
    pub fill_qty: f64,
    pub fill_price: f64,
    pub position_size: f64,
    pub position_price: f64,
    pub order_type: OrderType,
    pub stuckness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub index: usize,
    pub positions_long: Vec<Position>,
    pub positions_short: Vec<Position>,
    pub closes: Vec<f64>,
    pub balance: f64,
    pub equity: f64,
}

/// Forced close chosen for one minute's refresh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnstuckOrder {
    pub pside: usize,
    pub idx: usize,
    pub order: Order,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    fn bot_params_vec() -> Vec<f64> {
        vec![
            0.0, 0.0, 0.0, 0.0, 1.0, 0.8, 100.0, 1000.0, 1.0, 0.002, 0.01, 0.02, 0.003, 5.0,
            0.015, 1.5, 0.5,
        ]
    }

    #[test]
    fn test_bot_params_from_slice_maps_positional_fields() {
        let bp = BotParams::from_slice(&bot_params_vec()).unwrap();
        assert!(bp.backwards_tp);
        assert!(bp.enabled);
        assert_eq!(bp.ddown_factor, 0.8);
        assert_eq!(bp.ema_span_0, 100.0);
        assert_eq!(bp.ema_span_1, 1000.0);
        assert_eq!(bp.n_close_orders, 5);
        assert_eq!(bp.rentry_pprice_dist_wallet_exposure_weighting, 1.5);
        assert_eq!(bp.wallet_exposure_limit, 0.5);
    }

    #[test]
    fn test_bot_params_rejects_wrong_length() {
        let mut values = bot_params_vec();
        values.pop();
        match BotParams::from_slice(&values) {
            Err(BacktestError::ConfigFieldCount {
                expected, found, ..
            }) => {
                assert_eq!(expected, 17);
                assert_eq!(found, 16);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_without_auto_unstuck_zeroes_timer_fields() {
        let mut values = bot_params_vec();
        values[0] = 60.0;
        values[1] = 0.01;
        values[2] = 0.05;
        values[3] = 0.1;
        let bp = BotParams::from_slice(&values).unwrap().without_auto_unstuck();
        assert_eq!(bp.auto_unstuck_delay_minutes, 0.0);
        assert_eq!(bp.auto_unstuck_ema_dist, 0.0);
        assert_eq!(bp.auto_unstuck_qty_pct, 0.0);
        assert_eq!(bp.auto_unstuck_wallet_exposure_threshold, 0.0);
        assert_eq!(bp.ddown_factor, 0.8);
    }

    #[test]
    fn test_forager_params_split_total_exposure() {
        let values = [
            0.8, 100.0, 1000.0, 0.002, 0.01, 0.02, 0.003, 5.0, 4.0, 0.015, 1.5, 2.0, 0.01, 0.002,
            0.01, 0.9,
        ];
        let fp = ForagerParams::from_slice(&values).unwrap();
        assert_eq!(fp.n_positions, 4);
        assert_eq!(fp.wallet_exposure_limit(), 0.5);
        let bp = fp.to_bot_params();
        assert!(bp.backwards_tp);
        assert!(bp.enabled);
        assert_eq!(bp.wallet_exposure_limit, 0.5);
        let up = fp.to_unstuck_params();
        assert_eq!(up.stuck_threshold, 0.9);
        assert_eq!(up.ema_dist, 0.002);
        assert!(ForagerParams::from_slice(&values[..15]).is_err());
    }

    #[test]
    fn test_order_type_names_round_trip() {
        for order_type in OrderType::iter() {
            let name = order_type.to_string();
            assert_eq!(OrderType::from_str(&name).unwrap(), order_type);
            assert!(
                !(order_type.is_entry() && order_type.is_close()),
                "{} classified as both entry and close",
                name
            );
        }
        assert_eq!(
            OrderType::CloseUnstuckShort.to_string(),
            "close_unstuck_short"
        );
        assert!(OrderType::EntryInitialPartialLong.is_initial_entry());
        assert!(!OrderType::EntryGridCroppedShort.is_initial_entry());
    }
}
