use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use conduit::driver::{DriverConfig, MediaDriver};
use conduit::layout::DriverLayout;
use conduit::wait::IdleStrategy;

static RUNNING: AtomicBool = AtomicBool::new(true);

#[derive(Parser, Debug)]
#[command(name = "conduit-driver")]
#[command(about = "Standalone Conduit media driver", long_about = None)]
struct Args {
    /// Driver directory (defaults to $CONDUIT_DIR or the shared-memory dir)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Default term length in bytes (power of two)
    #[arg(long, default_value_t = 1 << 20)]
    term_length: usize,

    /// Maximum datagram payload on network channels
    #[arg(long, default_value_t = 1408)]
    mtu: usize,

    /// Idle strategy: spin, yield, or sleep
    #[arg(long, default_value = "yield")]
    idle: String,

    /// Linger seconds before closed buffers are reclaimed
    #[arg(long, default_value_t = 5)]
    linger_secs: u64,

    /// CPU core to pin the duty-cycle thread to
    #[arg(long)]
    core_id: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(core_id) = args.core_id {
        let core_ids = core_affinity::get_core_ids().context("Failed to get core IDs")?;
        if core_id < core_ids.len() {
            info!("Pinning driver to core {}", core_id);
            core_affinity::set_for_current(core_ids[core_id]);
        } else {
            anyhow::bail!(
                "Core ID {} out of range ({} cores available)",
                core_id,
                core_ids.len()
            );
        }
    }

    let idle = match args.idle.as_str() {
        "spin" => IdleStrategy::BusySpin,
        "yield" => IdleStrategy::SpinThenYield { spins: 100 },
        "sleep" => IdleStrategy::Sleep(Duration::from_millis(1)),
        other => anyhow::bail!("unknown idle strategy: {other}"),
    };

    let dir = args
        .dir
        .unwrap_or_else(|| DriverLayout::default_dir().root().to_path_buf());
    let config = DriverConfig {
        term_length: args.term_length,
        mtu: args.mtu,
        linger: Duration::from_secs(args.linger_secs),
        idle,
        ..DriverConfig::with_dir(&dir)
    };

    info!("Starting media driver in {}", dir.display());
    let driver = MediaDriver::launch(config).context("Failed to launch media driver")?;
    install_sigint_handler()?;

    while RUNNING.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("Shutting down");
    driver.shutdown();
    Ok(())
}

/// One flag flip on SIGINT; avoids pulling in a signal crate.
fn install_sigint_handler() -> Result<()> {
    #[cfg(unix)]
    {
        extern "C" fn on_signal(_: libc::c_int) {
            RUNNING.store(false, Ordering::Release);
        }
        let result = unsafe { libc::signal(libc::SIGINT, on_signal as libc::sighandler_t) };
        if result == libc::SIG_ERR {
            anyhow::bail!("failed to install SIGINT handler");
        }
    }
    Ok(())
}
