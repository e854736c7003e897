use std::{
    path::PathBuf,
    process,
    sync::Arc,
};

use busbar::{Broker, BrokerConfig, BrokerError, DEFAULT_PORT};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "busbard", version, about = "message bus broker")]
struct Args {
    /// TCP port to listen on.
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Keep running even when no clients are registered.
    #[arg(long)]
    persist: bool,

    /// Write logs to busbard.log next to the executable instead of stderr.
    #[arg(long)]
    log_file: bool,
}

fn default_log_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("busbard.log")
}

fn init_logging(to_file: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if to_file {
        let path = default_log_path();
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .init();
                return;
            }
            Err(err) => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
                warn!(?err, path = %path.display(), "busbard: log file unusable, using stderr");
                return;
            }
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.log_file);

    let cfg = BrokerConfig {
        port: args.port,
        idle_quit: !args.persist,
        ..BrokerConfig::default()
    };

    let broker = match Broker::start(cfg) {
        Ok(broker) => broker,
        Err(BrokerError::Bind(port, err)) => {
            warn!(port, ?err, "busbard: bind failed");
            process::exit(1);
        }
        Err(err @ BrokerError::Pool(_)) => {
            error!(?err, "busbard: worker thread creation failed");
            process::exit(-1);
        }
        Err(err) => {
            error!(?err, "busbard: startup failed");
            process::exit(1);
        }
    };

    let flag = broker.terminate_flag();
    for sig in [SIGINT, SIGTERM] {
        if let Err(err) = signal_hook::flag::register(sig, Arc::clone(&flag)) {
            warn!(sig, ?err, "busbard: signal handler registration failed");
        }
    }

    info!(port = broker.local_addr().port(), "busbard up");
    broker.run();
    info!("busbard is down");
}
