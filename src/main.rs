use clap::Parser;
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ruuvi_prometheus::app::{self, Options, RealScanner};
use ruuvi_prometheus::metrics::DeviceRegistry;

// Exit codes reported to the supervising process.
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Initialize stderr logging, honoring `RUST_LOG` when set.
fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Process managers like systemd key restart policy off the exit
    // status; a panic must not look like a clean exit.
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("panic: {info}");
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.debug);
    info!(version = env!("CARGO_PKG_VERSION"), "ruuvi-prometheus starting");

    let registry = Arc::new(DeviceRegistry::new());

    match app::run(options, &RealScanner, registry).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!(error = %why, "exiting");
            std::process::exit(EXIT_ERROR);
        }
    }
}
