//! spibridged - SoC-side daemon for the spibridge channel-multiplexed SPI link
//!
//! Owns the spidev master device, the SYNC/IRQ handshake GPIO lines, and
//! one Unix domain socket per channel, and runs the transaction loop from
//! `spibridge-daemon` until a fatal error. Recovery from fatal errors is an
//! external supervisor's job; the MCU side resynchronizes on its own.

mod cli;

use clap::Parser;
use cli::Cli;

use spibridge_daemon::{
    BridgeDaemon, DaemonConfig, DaemonError, IrqGpio, Spidev, SpidevConfig, SyncGpio,
};

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    if let Err(e) = run(&cli) {
        log::error!("{}", e);
        std::process::exit(exit_code(&e));
    }
}

fn run(cli: &Cli) -> spibridge_daemon::Result<()> {
    let spi_config = SpidevConfig::new(&cli.spi)
        .with_speed(cli.spi_speed * 1000)
        .with_mode(cli.spi_mode);
    let spi = Spidev::open(&spi_config)?;

    let (sync_chip, sync_line) = &cli.sync;
    let sync = SyncGpio::open(sync_chip, *sync_line)?;

    let irq = match &cli.irq {
        Some((chip, line)) => Some(IrqGpio::open(chip, *line)?),
        None => None,
    };

    let config = DaemonConfig::new(&cli.socket_dir).with_max_retries(cli.max_retries);
    let mut daemon = BridgeDaemon::new(spi, sync, irq, config)?;
    daemon.run()
}

/// Exit codes follow the failure taxonomy so the supervisor can tell setup
/// problems from runtime ones.
fn exit_code(err: &DaemonError) -> i32 {
    match err {
        DaemonError::Poll(_) => 2,
        DaemonError::Spi(_) => 3,
        DaemonError::ExcessiveRetries { .. } => 4,
        _ => 1,
    }
}
