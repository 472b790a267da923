//! Quote pricing: externally computed limit-order offsets when a valid
//! parameter file exists, a static symmetric spread otherwise. Corrupt
//! parameters invalidate the whole cache and are treated as "no parameters" —
//! the engine would rather skip a cycle than quote off garbage.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::exchange::Side;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuoteParameters {
    pub delta_a: Decimal,
    pub delta_b: Decimal,
}

#[derive(Debug, Deserialize)]
struct ParamsFile {
    #[serde(default)]
    limit_orders: Option<LimitOrdersBlock>,
}

#[derive(Debug, Deserialize)]
struct LimitOrdersBlock {
    #[serde(default)]
    delta_a: Option<crate::wire::JsonNumber>,
    #[serde(default)]
    delta_b: Option<crate::wire::JsonNumber>,
}

/// Parameter files are searched in order; the first readable and valid file
/// wins.
pub fn candidate_paths(params_dir: &Path, symbol: &str) -> Vec<PathBuf> {
    let file_name = format!("avellaneda_parameters_{symbol}.json");
    vec![
        params_dir.join(&file_name),
        PathBuf::from("params").join(&file_name),
        PathBuf::from(&file_name),
    ]
}

pub struct QuotePricer {
    candidates: Vec<PathBuf>,
    static_spread: Decimal,
    require_params: bool,
    refresh_interval: Duration,
    cached: Option<QuoteParameters>,
    loaded_at: Option<Instant>,
}

impl QuotePricer {
    pub fn new(
        candidates: Vec<PathBuf>,
        static_spread: Decimal,
        require_params: bool,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            candidates,
            static_spread,
            require_params,
            refresh_interval,
            cached: None,
            loaded_at: None,
        }
    }

    /// Limit price for quoting `side` around `mid`. `None` means skip this
    /// cycle: strict mode is on and no valid parameters exist.
    pub fn quote(&mut self, mid: Decimal, side: Side) -> Option<Decimal> {
        if let Some(params) = self.load_parameters() {
            return Some(match side {
                Side::Buy => mid - params.delta_b,
                Side::Sell => mid + params.delta_a,
            });
        }

        if self.require_params {
            info!("no valid quote parameters and strict mode is on; skipping quote");
            return None;
        }

        Some(match side {
            Side::Buy => mid * (Decimal::ONE - self.static_spread),
            Side::Sell => mid * (Decimal::ONE + self.static_spread),
        })
    }

    fn load_parameters(&mut self) -> Option<QuoteParameters> {
        if let (Some(cached), Some(loaded_at)) = (self.cached, self.loaded_at) {
            if loaded_at.elapsed() < self.refresh_interval {
                return Some(cached);
            }
        }

        self.cached = None;
        let (path, contents) = self.read_first_candidate()?;
        let parsed: ParamsFile = match serde_json::from_str(&contents) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), ?err, "invalid JSON in parameter file");
                return None;
            }
        };
        let params = match validate(parsed) {
            Some(params) => params,
            None => {
                warn!(path = %path.display(), "parameter file failed validation");
                return None;
            }
        };

        info!(
            path = %path.display(),
            delta_a = %params.delta_a,
            delta_b = %params.delta_b,
            "loaded quote parameters"
        );
        self.cached = Some(params);
        self.loaded_at = Some(Instant::now());
        Some(params)
    }

    fn read_first_candidate(&self) -> Option<(PathBuf, String)> {
        for path in &self.candidates {
            match fs::read_to_string(path) {
                Ok(contents) => return Some((path.clone(), contents)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(path = %path.display(), ?err, "could not read parameter file");
                    return None;
                }
            }
        }
        warn!("no parameter file found");
        None
    }
}

/// Offsets must be numeric, finite, and non-negative; anything else rejects
/// the file wholesale so partial parameters are never applied.
fn validate(parsed: ParamsFile) -> Option<QuoteParameters> {
    let block = parsed.limit_orders?;
    let delta_a = block.delta_a?.as_f64()?;
    let delta_b = block.delta_b?.as_f64()?;
    if !delta_a.is_finite() || !delta_b.is_finite() || delta_a < 0.0 || delta_b < 0.0 {
        return None;
    }
    Some(QuoteParameters {
        delta_a: Decimal::from_f64(delta_a)?,
        delta_b: Decimal::from_f64(delta_b)?,
    })
}
