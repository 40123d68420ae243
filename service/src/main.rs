use clap::Parser;
use sediment_core::Bus;
use sediment_service::Router;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(about = "Writer service for the sediment configuration store")]
struct Opts {
    /// Serve system databases on the system bus instead of the session
    /// bus.
    #[arg(long)]
    system: bool,
}

fn main() -> anyhow::Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    fmt()
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    let bus = if opts.system {
        Bus::system()
    } else {
        Bus::session()
    };
    let router = Router::attach(&bus);
    info!(
        "serving {} bus writers as {}",
        if opts.system { "system" } else { "session" },
        router.unique_name()
    );
    if router.blame().is_enabled() {
        info!("blame mode is enabled");
    }

    loop {
        std::thread::park();
    }
}
