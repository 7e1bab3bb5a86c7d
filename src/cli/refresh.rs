use std::path::Path;

use crate::config::read_config;
use crate::registry::populate::populated_resolver;
use crate::{die, RefreshArgs};

pub(crate) async fn refresh_cmd(storage_root: &Path, args: &RefreshArgs) {
    let config = match read_config(storage_root) {
        Ok(config) => config,
        Err(err) => die!("{}", err),
    };

    let resolver = populated_resolver(storage_root, &config);

    match resolver.forget(&args.model).await {
        Ok(true) => println!("forgot the route for \"{}\"", args.model),
        Ok(false) => die!("no route is persisted for \"{}\"", args.model),
        Err(err) => die!("failed to refresh \"{}\": {}", args.model, err),
    }
}
