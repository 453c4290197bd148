//! The `logrouted` daemon binary.

use anyhow::Context;
use logrouted::{session_factory, NvConfig, Router, SessionServer, StaticConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    // Safety: on_signal only touches an atomic.
    unsafe {
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
    }
}

struct Args {
    config: PathBuf,
    channel_dir: PathBuf,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config = PathBuf::from("/etc/logrouted.json");
    let mut channel_dir = PathBuf::from("/tmp");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config = args.next().context("--config needs a path")?.into();
            }
            "--channel-dir" => {
                channel_dir = args.next().context("--channel-dir needs a path")?.into();
            }
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    Ok(Args {
        config,
        channel_dir,
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = parse_args()?;
    let config = StaticConfig::load(&args.config)
        .with_context(|| format!("loading config {:?}", args.config))?;

    let period = Duration::from_secs(config.statistics_period_secs.max(1));
    let nv_config = Arc::new(NvConfig::new(config.nonverbose_messages.clone()));
    let router = Router::from_config(&config).context("opening channels")?;

    let server = SessionServer::start(
        &args.channel_dir,
        session_factory(Arc::clone(&router), nv_config, &args.channel_dir),
    )
    .context("binding control channel")?;

    install_signal_handlers();
    info!(channel_dir = ?args.channel_dir, channels = router.channels().len(), "logrouted up");

    logrouted::stats::run_stats_loop(&router, &server, period, &SHUTDOWN);

    info!("shutting down");
    drop(server);
    router.flush_all();
    Ok(())
}
