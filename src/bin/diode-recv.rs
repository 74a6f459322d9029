use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use diode::{config, DaemonBuilder, ReceiverLayout};

/// Receives files from the serial link, verifies them, and hands them to
/// the downstream uploader's output tree.
#[derive(Parser, Debug)]
#[command(name = "diode-recv", version, about)]
struct Args {
    /// Serial port device
    #[arg(long, default_value = "/dev/ttyAMA0")]
    port: String,

    /// Line rate in baud
    #[arg(long, default_value_t = config::DEFAULT_BAUD)]
    baud: u32,

    /// Staging directory for partially received files
    #[arg(long)]
    staging: PathBuf,

    /// Output directory owned by the uploader service
    #[arg(long)]
    output: PathBuf,
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
        .receiving(ReceiverLayout::new(&args.staging, &args.output))
        .build()?;
    daemon.run(&shutdown)
}
