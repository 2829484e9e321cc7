//! Periodic expiry of silent devices.
//!
//! A device that stops broadcasting must disappear from the scrape output
//! instead of serving its last reading forever. The sweeper calls
//! [`DeviceRegistry::expire`] once per tick until shutdown; both the tick
//! period and the freshness window default to one minute at the CLI.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::metrics::DeviceRegistry;

/// Timing configuration for the sweep task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    /// Time between sweeps
    pub period: Duration,
    /// Maximum silence before a device's metrics are dropped
    pub freshness: Duration,
}

/// Sweep the registry on a fixed period until `shutdown` fires.
///
/// Ticks never overlap; a sweep is a short in-memory scan and the next tick
/// waits for it. Shutdown is honored between ticks, never mid-sweep.
pub async fn run(
    registry: Arc<DeviceRegistry>,
    config: SweepConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    // interval panics on a zero period
    let mut ticks = time::interval(config.period.max(Duration::from_millis(1)));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; wait a full period instead.
    ticks.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticks.tick() => {
                let dropped = registry.expire(Instant::now(), config.freshness);
                if dropped > 0 {
                    debug!(dropped, live = registry.device_count(), "expired silent devices");
                }
            }
        }
    }
    debug!("expiry sweeper stopped");
}

/// Parse a command-line duration such as `90s`, `5m`, `2h`, or `500ms`.
///
/// A bare number is read as seconds. The `String` error type lets clap use
/// this directly as a `value_parser`.
///
/// # Examples
/// ```
/// use ruuvi_prometheus::sweeper::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration".to_string());
    }

    // "ms" before "m" and "s", or "500ms" would strip the wrong suffix.
    let (digits, unit, unit_millis): (&str, &str, u64) = if let Some(n) = src.strip_suffix("ms") {
        (n, "milliseconds", 1)
    } else if let Some(n) = src.strip_suffix('h') {
        (n, "hours", 3_600_000)
    } else if let Some(n) = src.strip_suffix('m') {
        (n, "minutes", 60_000)
    } else if let Some(n) = src.strip_suffix('s') {
        (n, "seconds", 1000)
    } else {
        (src, "duration", 1000)
    };

    let count: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid {unit}: {src}"))?;
    Ok(Duration::from_millis(count * unit_millis))
}
