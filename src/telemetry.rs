use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber. Filter from `PAYRECON_LOG` (default
/// `info`); `PAYRECON_LOG_FORMAT=json` switches to JSON lines. Output goes to
/// stderr so CSV reports on stdout stay clean.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("PAYRECON_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PAYRECON_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
