//! JSON configuration for both backtest variants.
//!
//! Strategy blocks are accepted either as named-field objects or as the positional vectors
//! understood by [`BotParams::from_slice`] and [`ForagerParams::from_slice`].

use crate::backtest::{Backtest, FixedUniverse, Forager};
use crate::error::BacktestError;
use crate::types::{
    BacktestParams, BotParams, BotParamsPair, ExchangeParams, ForagerParams, ForagerParamsPair,
    UnstuckParamsPair,
};
use ndarray::{ArrayView2, ArrayView3};
use serde::Deserialize;
use std::collections::HashSet;

fn default_maker_fee() -> f64 {
    0.0002
}

fn default_loss_allowance_pct() -> f64 {
    0.01
}

fn default_stuck_threshold() -> f64 {
    0.9
}

fn default_unstuck_close_pct() -> f64 {
    0.01
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BotParamsSource {
    Named(BotParams),
    Positional(Vec<f64>),
}

impl BotParamsSource {
    pub fn resolve(&self) -> Result<BotParams, BacktestError> {
        match self {
            BotParamsSource::Named(bp) => Ok(*bp),
            BotParamsSource::Positional(values) => BotParams::from_slice(values),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ForagerParamsSource {
    Named(ForagerParams),
    Positional(Vec<f64>),
}

impl ForagerParamsSource {
    pub fn resolve(&self) -> Result<ForagerParams, BacktestError> {
        match self {
            ForagerParamsSource::Named(fp) => Ok(*fp),
            ForagerParamsSource::Positional(values) => ForagerParams::from_slice(values),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    pub exchange_params: ExchangeParams,
    pub long: BotParamsSource,
    pub short: BotParamsSource,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BacktestConfig {
    pub starting_balance: f64,
    #[serde(default = "default_maker_fee")]
    pub maker_fee: f64,
    #[serde(default = "default_loss_allowance_pct")]
    pub loss_allowance_pct: f64,
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: f64,
    #[serde(default = "default_unstuck_close_pct")]
    pub unstuck_close_pct: f64,
    pub symbols: Vec<SymbolConfig>,
}

impl BacktestConfig {
    pub fn from_json_str(json: &str) -> Result<Self, BacktestError> {
        let config: BacktestConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BacktestError> {
        validate_common(
            self.starting_balance,
            self.maker_fee,
            self.symbols
                .iter()
                .map(|s| (s.symbol.as_str(), &s.exchange_params)),
        )?;
        if self.stuck_threshold < 0.0 || self.loss_allowance_pct < 0.0 {
            return Err(BacktestError::InvalidConfig(
                "unstuck parameters must be non-negative".to_string(),
            ));
        }
        self.bot_params().map(|_| ())
    }

    pub fn backtest_params(&self) -> BacktestParams {
        BacktestParams {
            starting_balance: self.starting_balance,
            maker_fee: self.maker_fee,
            symbols: self.symbols.iter().map(|s| s.symbol.clone()).collect(),
        }
    }

    pub fn bot_params(&self) -> Result<Vec<BotParamsPair>, BacktestError> {
        self.symbols
            .iter()
            .map(|s| {
                Ok(BotParamsPair {
                    long: s.long.resolve()?,
                    short: s.short.resolve()?,
                })
            })
            .collect()
    }

    pub fn exchange_params_list(&self) -> Vec<ExchangeParams> {
        self.symbols.iter().map(|s| s.exchange_params).collect()
    }

    pub fn unstuck_params(&self) -> UnstuckParamsPair {
        UnstuckParamsPair::uniform(
            self.loss_allowance_pct,
            self.stuck_threshold,
            self.unstuck_close_pct,
        )
    }

    pub fn build_backtest<'a>(
        &self,
        hlcs: ArrayView3<'a, f64>,
    ) -> Result<Backtest<'a, FixedUniverse>, BacktestError> {
        Backtest::new(
            hlcs,
            self.bot_params()?,
            self.exchange_params_list(),
            &self.backtest_params(),
            self.unstuck_params(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ForagerSymbolConfig {
    pub symbol: String,
    pub exchange_params: ExchangeParams,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ForagerConfig {
    pub starting_balance: f64,
    #[serde(default = "default_maker_fee")]
    pub maker_fee: f64,
    pub symbols: Vec<ForagerSymbolConfig>,
    pub long: ForagerParamsSource,
    pub short: ForagerParamsSource,
}

impl ForagerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, BacktestError> {
        let config: ForagerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BacktestError> {
        validate_common(
            self.starting_balance,
            self.maker_fee,
            self.symbols
                .iter()
                .map(|s| (s.symbol.as_str(), &s.exchange_params)),
        )?;
        let params = self.forager_params()?;
        for (side, fp) in [("long", &params.long), ("short", &params.short)] {
            if fp.n_positions > self.symbols.len() {
                return Err(BacktestError::InvalidConfig(format!(
                    "{} n_positions {} exceeds universe size {}",
                    side,
                    fp.n_positions,
                    self.symbols.len()
                )));
            }
        }
        Ok(())
    }

    pub fn backtest_params(&self) -> BacktestParams {
        BacktestParams {
            starting_balance: self.starting_balance,
            maker_fee: self.maker_fee,
            symbols: self.symbols.iter().map(|s| s.symbol.clone()).collect(),
        }
    }

    pub fn forager_params(&self) -> Result<ForagerParamsPair, BacktestError> {
        Ok(ForagerParamsPair {
            long: self.long.resolve()?,
            short: self.short.resolve()?,
        })
    }

    pub fn exchange_params_list(&self) -> Vec<ExchangeParams> {
        self.symbols.iter().map(|s| s.exchange_params).collect()
    }

    pub fn build_backtest<'a>(
        &self,
        hlcs: ArrayView3<'a, f64>,
        ranking: ArrayView2<'a, usize>,
    ) -> Result<Backtest<'a, Forager<'a>>, BacktestError> {
        Backtest::new_forager(
            hlcs,
            ranking,
            &self.forager_params()?,
            self.exchange_params_list(),
            &self.backtest_params(),
        )
    }
}

fn validate_common<'c>(
    starting_balance: f64,
    maker_fee: f64,
    symbols: impl Iterator<Item = (&'c str, &'c ExchangeParams)>,
) -> Result<(), BacktestError> {
    if !(starting_balance > 0.0 && starting_balance.is_finite()) {
        return Err(BacktestError::InvalidStartingBalance(starting_balance));
    }
    if !maker_fee.is_finite() {
        return Err(BacktestError::InvalidConfig(format!(
            "maker fee must be finite, got {}",
            maker_fee
        )));
    }
    let mut seen = HashSet::new();
    for (symbol, ep) in symbols {
        if !seen.insert(symbol) {
            return Err(BacktestError::InvalidConfig(format!(
                "duplicate symbol {}",
                symbol
            )));
        }
        if ep.qty_step <= 0.0 || ep.price_step <= 0.0 || ep.c_mult <= 0.0 {
            return Err(BacktestError::InvalidConfig(format!(
                "{}: qty_step, price_step and c_mult must be positive",
                symbol
            )));
        }
    }
    if seen.is_empty() {
        return Err(BacktestError::InvalidConfig("no symbols configured".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    const EXCHANGE: &str = r#"{"qty_step": 0.001, "price_step": 0.01, "min_qty": 0.001, "min_cost": 1.0, "c_mult": 1.0}"#;

    fn named_long() -> String {
        r#"{
            "auto_unstuck_delay_minutes": 0.0,
            "auto_unstuck_ema_dist": 0.0,
            "auto_unstuck_qty_pct": 0.0,
            "auto_unstuck_wallet_exposure_threshold": 0.0,
            "backwards_tp": true,
            "ddown_factor": 0.8,
            "ema_span_0": 60.0,
            "ema_span_1": 240.0,
            "enabled": true,
            "initial_eprice_ema_dist": 0.001,
            "initial_qty_pct": 0.02,
            "markup_range": 0.01,
            "min_markup": 0.003,
            "n_close_orders": 4,
            "rentry_pprice_dist": 0.015,
            "rentry_pprice_dist_wallet_exposure_weighting": 1.0,
            "wallet_exposure_limit": 0.5
        }"#
        .to_string()
    }

    fn config_json(long: &str, extra: &str) -> String {
        format!(
            r#"{{
                "starting_balance": 1000.0,
                {}
                "symbols": [
                    {{"symbol": "AAAUSDT", "exchange_params": {}, "long": {}, "short": [0,0,0,0,0,1,10,20,0,0,0.01,0,0.002,1,0.01,0,0]}}
                ]
            }}"#,
            extra, EXCHANGE, long
        )
    }

    #[test]
    fn parses_named_and_positional_blocks_with_defaults() {
        let config = BacktestConfig::from_json_str(&config_json(&named_long(), "")).unwrap();
        assert_eq!(config.maker_fee, 0.0002);
        assert_eq!(config.stuck_threshold, 0.9);
        assert_eq!(config.loss_allowance_pct, 0.01);
        assert_eq!(config.unstuck_close_pct, 0.01);
        let bot_params = config.bot_params().unwrap();
        assert_eq!(bot_params[0].long.n_close_orders, 4);
        assert!(bot_params[0].long.backwards_tp);
        assert!(!bot_params[0].short.enabled);
        assert_eq!(bot_params[0].short.ema_span_1, 20.0);
        assert!(!config.exchange_params_list()[0].inverse);
        assert_eq!(config.backtest_params().symbols, vec!["AAAUSDT".to_string()]);
    }

    #[test]
    fn overrides_defaults() {
        let config =
            BacktestConfig::from_json_str(&config_json(&named_long(), r#""maker_fee": 0.0,"#))
                .unwrap();
        assert_eq!(config.maker_fee, 0.0);
    }

    #[test]
    fn rejects_short_positional_vector() {
        let json = config_json("[0,0,0]", "");
        match BacktestConfig::from_json_str(&json) {
            Err(BacktestError::ConfigFieldCount { found, .. }) => assert_eq!(found, 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_balance_and_malformed_json() {
        let json = config_json(&named_long(), "").replace("1000.0", "-1.0");
        assert!(matches!(
            BacktestConfig::from_json_str(&json),
            Err(BacktestError::InvalidStartingBalance(_))
        ));
        assert!(matches!(
            BacktestConfig::from_json_str("{\"starting_balance\": "),
            Err(BacktestError::Json(_))
        ));
    }

    #[test]
    fn builds_a_runnable_backtest() {
        let config = BacktestConfig::from_json_str(&config_json(&named_long(), "")).unwrap();
        let mut bars = Array3::<f64>::zeros((1, 3, 3));
        for k in 0..3 {
            bars[[0, k, 0]] = 101.0;
            bars[[0, k, 1]] = 99.0;
            bars[[0, k, 2]] = 100.0;
        }
        let result = config.build_backtest(bars.view()).unwrap().run();
        assert_eq!(result.stats.first().map(|s| s.index), Some(0));
        assert_eq!(result.stats.last().map(|s| s.index), Some(2));
    }

    #[test]
    fn forager_config_checks_slot_count() {
        let block = "[1,60,240,0.001,0.02,0.01,0.003,4,2,0.015,1,1.5,0.01,0.002,0.01,0.9]";
        let json = format!(
            r#"{{
                "starting_balance": 500.0,
                "symbols": [
                    {{"symbol": "AAA", "exchange_params": {e}}},
                    {{"symbol": "BBB", "exchange_params": {e}}}
                ],
                "long": {b},
                "short": {b}
            }}"#,
            e = EXCHANGE,
            b = block
        );
        let config = ForagerConfig::from_json_str(&json).unwrap();
        let fp = config.forager_params().unwrap();
        assert_eq!(fp.long.n_positions, 2);
        assert_eq!(fp.long.wallet_exposure_limit(), 0.75);

        let too_many = json.replacen(",4,2,", ",4,3,", 1);
        assert!(matches!(
            ForagerConfig::from_json_str(&too_many),
            Err(BacktestError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_duplicate_symbols() {
        let json = format!(
            r#"{{
                "starting_balance": 500.0,
                "symbols": [
                    {{"symbol": "AAA", "exchange_params": {e}}},
                    {{"symbol": "AAA", "exchange_params": {e}}}
                ],
                "long": [1,60,240,0.001,0.02,0.01,0.003,4,1,0.015,1,1.5,0.01,0.002,0.01,0.9],
                "short": [1,60,240,0.001,0.02,0.01,0.003,4,0,0.015,1,1.5,0.01,0.002,0.01,0.9]
            }}"#,
            e = EXCHANGE
        );
        assert!(matches!(
            ForagerConfig::from_json_str(&json),
            Err(BacktestError::InvalidConfig(_))
        ));
    }
}
