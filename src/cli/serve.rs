use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::config::read_config;
use crate::die;
use crate::registry::populate::populated_resolver;
use crate::server::{self, AppState};
use crate::ServeArgs;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("modelgate={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

pub(crate) async fn serve_cmd(storage_root: &Path, args: &ServeArgs) {
    init_logging(&args.log_level);

    let config = match read_config(storage_root) {
        Ok(config) => config,
        Err(err) => die!("{}", err),
    };

    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| config.server.listen.clone());

    let resolver = populated_resolver(storage_root, &config);

    if let Err(err) = server::run(&listen, AppState::new(resolver)).await {
        die!("failed to serve on {}: {}", listen, err);
    }
}
