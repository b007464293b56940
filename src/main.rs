use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use adfleet::config::{Config, LogConfig};
use adfleet::error::Error;

fn init_tracing(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NEW);

    if config.json {
        subscriber.json().init();
    } else {
        subscriber.compact().init();
    }
}

#[actix_web::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(&config.log);

    adfleet::run(config).await
}
