use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use diode::{config, DaemonBuilder, SenderLayout};

/// Watches a source tree and transfers new files across the serial link.
#[derive(Parser, Debug)]
#[command(name = "diode-send", version, about)]
struct Args {
    /// Serial port device
    #[arg(long, default_value = "/dev/ttyAMA0")]
    port: String,

    /// Line rate in baud
    #[arg(long, default_value_t = config::DEFAULT_BAUD)]
    baud: u32,

    /// Root holding the incoming/, transferred/, and failed/ trees
    #[arg(long)]
    root: PathBuf,

    /// Cache directory for in-flight copies
    #[arg(long)]
    cache: PathBuf,
}

fn main() -> diode::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let daemon = DaemonBuilder::new()
        .with_port(&args.port)
        .baud(args.baud)
        .sending(SenderLayout::under(&args.root, &args.cache))
        .build()?;
    daemon.run(&shutdown)
}
