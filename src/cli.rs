//! CLI argument parsing

use clap::Parser;
use std::path::PathBuf;

/// Parse a "chip:line" GPIO specifier, e.g. "/dev/gpiochip0:12"
fn parse_gpio_spec(s: &str) -> Result<(String, u32), String> {
    let (chip, line) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("Expected CHIP:LINE, got '{}'", s))?;
    if chip.is_empty() {
        return Err(format!("Expected CHIP:LINE, got '{}'", s));
    }
    let line = line
        .parse::<u32>()
        .map_err(|e| format!("Invalid line number: {}", e))?;
    Ok((chip.to_string(), line))
}

#[derive(Parser)]
#[command(name = "spibridged")]
#[command(author, version, about = "Channel-multiplexing SPI bridge daemon", long_about = None)]
pub struct Cli {
    /// spidev device connected to the MCU
    #[arg(long, default_value = "/dev/spidev0.1")]
    pub spi: String,

    /// SPI clock speed in kHz
    #[arg(long, default_value_t = 2000)]
    pub spi_speed: u32,

    /// SPI mode
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub spi_mode: u8,

    /// SYNC output line as CHIP:LINE (e.g. /dev/gpiochip0:12)
    #[arg(long, value_parser = parse_gpio_spec)]
    pub sync: (String, u32),

    /// IRQ input line as CHIP:LINE; omit to rely on the polling cadence alone
    #[arg(long, value_parser = parse_gpio_spec)]
    pub irq: Option<(String, u32)>,

    /// Directory for the per-channel Unix domain sockets
    #[arg(default_value = "/var/run/spibridge")]
    pub socket_dir: PathBuf,

    /// Consecutive desynchronized cycles tolerated before exiting
    #[arg(long, default_value_t = 500)]
    pub max_retries: u32,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpio_spec_parses() {
        assert_eq!(
            parse_gpio_spec("/dev/gpiochip0:12"),
            Ok(("/dev/gpiochip0".to_string(), 12))
        );
        assert!(parse_gpio_spec("12").is_err());
        assert!(parse_gpio_spec(":12").is_err());
        assert!(parse_gpio_spec("/dev/gpiochip0:x").is_err());
    }

    #[test]
    fn args_parse() {
        let cli = Cli::parse_from([
            "spibridged",
            "--spi",
            "/dev/spidev1.0",
            "--sync",
            "/dev/gpiochip1:7",
            "--irq",
            "/dev/gpiochip1:8",
            "/tmp/bridge",
        ]);
        assert_eq!(cli.spi, "/dev/spidev1.0");
        assert_eq!(cli.sync, ("/dev/gpiochip1".to_string(), 7));
        assert_eq!(cli.irq, Some(("/dev/gpiochip1".to_string(), 8)));
        assert_eq!(cli.socket_dir, PathBuf::from("/tmp/bridge"));
        assert_eq!(cli.max_retries, 500);
    }
}
