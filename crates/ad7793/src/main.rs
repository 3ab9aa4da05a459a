use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use ad7793::{load_config, mock_hal, AdcConfig, Ad7793Driver, SpiTransport};
use clap::Parser;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Read voltages from an AD7793", long_about = None)]
struct Args {
    /// Run against a simulated chip instead of real hardware
    #[arg(long)]
    mock: bool,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of conversions to run
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Pause between conversions in milliseconds
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// GPIO used as chip select
    #[arg(long, default_value_t = 24)]
    cs_pin: u8,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => AdcConfig::default(),
    };

    if args.mock {
        info!("Using mock AD7793");
        let mut transport = mock_hal::create_transport(50);
        // Three quarters of full-scale
        transport.set_conversion_result(0xC0_0000);
        run(transport, &config, &args)
    } else {
        run_hardware(&config, &args)
    }
}

#[cfg(feature = "pi-hardware")]
fn run_hardware(config: &AdcConfig, args: &Args) -> anyhow::Result<()> {
    info!("Using AD7793 on SPI0, CS on GPIO {}", args.cs_pin);
    let transport = ad7793::rppal_hal::create_transport(args.cs_pin)?;
    run(transport, config, args)
}

#[cfg(not(feature = "pi-hardware"))]
fn run_hardware(_config: &AdcConfig, _args: &Args) -> anyhow::Result<()> {
    anyhow::bail!("built without the `pi-hardware` feature; use --mock")
}

fn run<T: SpiTransport>(transport: T, config: &AdcConfig, args: &Args) -> anyhow::Result<()> {
    let mut adc = Ad7793Driver::new(transport, config.external_reference_mv)?;

    adc.reset()?;
    adc.init()?;
    adc.apply_config(config)?;
    info!(
        "Sampling {:?} at {} Hz, gain x{}",
        adc.channel(),
        adc.rate().update_rate_hz(),
        adc.gain().multiplier()
    );

    for i in 0..args.count {
        match adc.single_conversion() {
            Ok(mv) => println!(
                "{:?}: raw=0x{:06X} {:.4} mV",
                adc.channel(),
                adc.last_raw_code(),
                mv
            ),
            Err(e) => error!("Conversion {} failed: {}", i + 1, e),
        }
        if i + 1 < args.count {
            thread::sleep(Duration::from_millis(args.interval_ms));
        }
    }

    Ok(())
}
