use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;
use zfsmon::*;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // configuration errors and fatal startup failures exit with code 2;
    // a signal-driven shutdown exits normally
    let app_config = match config::AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: configuration error: {e:#}", version::NAME);
            std::process::exit(2);
        }
    };

    if let Err(e) = watcher::run(app_config).await {
        tracing::error!("exiting: {:#}", e);
        std::process::exit(2);
    }
}
