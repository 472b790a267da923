use std::{
    env,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{ensure, Result};
use rust_decimal::Decimal;

const DEFAULT_API_URL: &str = "https://mainnet.zklighter.elliot.ai";
const DEFAULT_WS_URL: &str = "wss://mainnet.zklighter.elliot.ai/stream";

/// Runtime configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub ws_url: String,
    pub account_index: i64,
    pub api_key_index: i32,
    pub market_symbol: String,
    pub close_long_on_startup: bool,
    pub params_dir: PathBuf,
    pub log_dir: PathBuf,
    pub require_params: bool,
    pub static_spread: Decimal,
    pub static_order_size: Decimal,
    pub dynamic_sizing: bool,
    pub capital_usage: Decimal,
    pub safety_margin: Decimal,
    pub min_notional: Decimal,
    pub order_timeout: Duration,
    pub params_refresh: Duration,
    pub dry_run: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            api_url: env::var("LIGHTER_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            ws_url: env::var("LIGHTER_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string()),
            account_index: parse_env("LIGHTER_ACCOUNT_INDEX", 0),
            api_key_index: parse_env("LIGHTER_API_KEY_INDEX", 0),
            market_symbol: env::var("MARKET_SYMBOL").unwrap_or_else(|_| "PAXG".to_string()),
            close_long_on_startup: bool_env("CLOSE_LONG_ON_STARTUP", false),
            params_dir: PathBuf::from(
                env::var("PARAMS_DIR").unwrap_or_else(|_| "params".to_string()),
            ),
            log_dir: PathBuf::from(env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string())),
            require_params: bool_env("REQUIRE_PARAMS", false),
            static_spread: decimal_env("QUOTER_SPREAD", Decimal::new(35, 5)),
            static_order_size: decimal_env("QUOTER_BASE_AMOUNT", Decimal::new(47, 3)),
            dynamic_sizing: bool_env("QUOTER_DYNAMIC_SIZING", true),
            capital_usage: decimal_env("QUOTER_CAPITAL_USAGE", Decimal::new(99, 2)),
            safety_margin: decimal_env("QUOTER_SAFETY_MARGIN", Decimal::new(1, 2)),
            min_notional: decimal_env("QUOTER_MIN_NOTIONAL", Decimal::from(15)),
            order_timeout: Duration::from_secs(parse_env("QUOTER_ORDER_TIMEOUT_SECS", 90)),
            params_refresh: Duration::from_secs(parse_env("QUOTER_PARAMS_REFRESH_SECS", 900)),
            dry_run: bool_env("QUOTER_DRY_RUN", true),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.account_index >= 0, "account index must be non-negative");
        ensure!(
            self.static_spread >= Decimal::ZERO,
            "static spread must be non-negative"
        );
        ensure!(
            self.static_order_size >= Decimal::ZERO,
            "static order size must be non-negative"
        );
        ensure!(
            self.capital_usage > Decimal::ZERO && self.capital_usage <= Decimal::ONE,
            "capital usage must be within (0, 1]"
        );
        ensure!(
            self.safety_margin >= Decimal::ZERO && self.safety_margin < Decimal::ONE,
            "safety margin must be within [0, 1)"
        );
        ensure!(
            self.min_notional >= Decimal::ZERO,
            "minimum notional must be non-negative"
        );
        ensure!(
            !self.order_timeout.is_zero(),
            "order timeout must be greater than zero"
        );
        Ok(())
    }
}

fn parse_env<T: FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn decimal_env(name: &str, default: Decimal) -> Decimal {
    env::var(name)
        .ok()
        .and_then(|value| Decimal::from_str(&value).ok())
        .unwrap_or(default)
}

fn bool_env(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
