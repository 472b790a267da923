//! Periodic portfolio-value logger. Writes one timestamped line per interval
//! while the account is flat; snapshots taken mid-position would just record
//! unrealized noise.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info};

use crate::account::{CapitalState, PositionState};

const BALANCE_LOG_INTERVAL: Duration = Duration::from_secs(300);

pub fn spawn(
    log_dir: PathBuf,
    capital_rx: watch::Receiver<Option<CapitalState>>,
    position_rx: watch::Receiver<Option<PositionState>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path = log_dir.join("balance_log.txt");
        loop {
            let flat = position_rx
                .borrow()
                .as_ref()
                .map(|position| position.is_flat())
                .unwrap_or(true);
            let portfolio_value = capital_rx
                .borrow()
                .as_ref()
                .map(|capital| capital.portfolio_value);

            match (flat, portfolio_value) {
                (true, Some(value)) => match append_line(&path, value) {
                    Ok(()) => info!(portfolio_value = %value, path = %path.display(), "logged portfolio value"),
                    Err(err) => error!(?err, path = %path.display(), "failed to write balance log"),
                },
                (false, _) => info!("skipping balance log, position is open"),
                (true, None) => info!("skipping balance log, no portfolio value yet"),
            }

            time::sleep(BALANCE_LOG_INTERVAL).await;
        }
    })
}

fn append_line(path: &Path, portfolio_value: Decimal) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        "[{timestamp}] Portfolio Value: ${}",
        portfolio_value.round_dp(2)
    )
}
