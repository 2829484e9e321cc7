//! Process supervision for `ruuvi-prometheus`.
//!
//! Wires the scanner into the device registry, runs the expiry sweeper and
//! the scrape endpoint as background tasks, and broadcasts one shutdown
//! signal to all of them. Kept free of CLI parsing and process exit codes
//! so the whole run loop is testable with fake scanners.

use crate::metrics::{DeviceRegistry, exporter};
use crate::reading::SensorReading;
use crate::scanner::{Backend, ScanError};
use crate::sweeper::{self, SweepConfig};
use clap::Parser;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Runtime configuration, parsed from the command line.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Bluetooth device to listen on.
    #[arg(long, default_value = "hci0")]
    pub device: String,

    /// Listen address for the Prometheus scrape endpoint.
    #[arg(long, default_value = "0.0.0.0:9521")]
    pub listen: SocketAddr,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,

    /// Drop a device's metrics after this long without a frame.
    /// Takes a duration like 90s, 2m, 1h or 500ms; a bare number means seconds.
    #[arg(long, default_value = "1m", value_parser = crate::sweeper::parse_duration)]
    pub expire_after: Duration,

    /// How often to sweep for expired devices.
    #[arg(long, default_value = "1m", value_parser = crate::sweeper::parse_duration)]
    pub sweep_interval: Duration,

    /// Advertisement transport to scan with.
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,
}

/// Failures that abort the run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Source of sensor readings, a seam so the run loop can be driven without
/// Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan<'a>(
        &'a self,
        backend: Backend,
        device: &'a str,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<SensorReading>, ScanError>> + Send + 'a>,
    >;
}

/// Production scanner, dispatching to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan<'a>(
        &'a self,
        backend: Backend,
        device: &'a str,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<SensorReading>, ScanError>> + Send + 'a>,
    > {
        Box::pin(async move { crate::scanner::start_scan(backend, device).await })
    }
}

/// Broadcast shutdown and wait for the background tasks to finish.
///
/// Safe to reach from any exit path; the tasks also treat a dropped sender
/// as a shutdown signal.
async fn stop_background(
    shutdown: watch::Sender<bool>,
    sweeper: JoinHandle<()>,
    exporter: JoinHandle<()>,
) {
    let _ = shutdown.send(true);
    let _ = sweeper.await;
    let _ = exporter.await;
}

/// Run the exporter until the reading stream ends or an interrupt arrives.
///
/// Binds the scrape endpoint, spawns the exporter and sweeper tasks, starts
/// the scan, and feeds every delivered reading into the registry. Readings
/// without a device id are logged and dropped. On shutdown the in-flight
/// registry call finishes before the background tasks are joined.
pub async fn run(
    options: Options,
    scanner: &dyn Scanner,
    registry: Arc<DeviceRegistry>,
) -> Result<(), RunError> {
    let listener = TcpListener::bind(options.listen).await?;
    info!(listen = %options.listen, "metrics endpoint ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let exporter_task = tokio::spawn(exporter::serve(
        listener,
        Arc::clone(&registry),
        shutdown_rx.clone(),
    ));
    let sweeper_task = tokio::spawn(sweeper::run(
        Arc::clone(&registry),
        SweepConfig {
            period: options.sweep_interval,
            freshness: options.expire_after,
        },
        shutdown_rx,
    ));

    let mut readings = match scanner.start_scan(options.backend, &options.device).await {
        Ok(readings) => readings,
        Err(e) => {
            stop_background(shutdown_tx, sweeper_task, exporter_task).await;
            return Err(e.into());
        }
    };
    info!(device = %options.device, backend = %options.backend, "scanning for RuuviTag frames");

    let interrupt = signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("interrupt received, shutting down");
                break;
            }
            reading = readings.recv() => {
                match reading {
                    Some(reading) => {
                        if let Err(e) = registry.observe(&reading) {
                            warn!(error = %e, "dropped reading");
                        }
                    }
                    None => {
                        info!("reading stream ended, shutting down");
                        break;
                    }
                }
            }
        }
    }

    stop_background(shutdown_tx, sweeper_task, exporter_task).await;
    Ok(())
}
