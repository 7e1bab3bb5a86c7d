use std::path::Path;

use table::{IntoTable, Table};
mod table;

use crate::{
    config::{read_config, Config},
    registry::{ModelRoute, RouteStore},
    ListArgs, ListObject, ListingFormat,
};

use crate::{die, warn};

#[derive(serde::Serialize)]
struct Route {
    model: String,
    provider: Option<String>,
    api_base: Option<String>,
    weights: Option<String>,
}

impl Route {
    fn new(model: String, route: ModelRoute) -> Route {
        Route {
            model,
            provider: route.provider,
            api_base: route.api_base,
            weights: route.weights.map(|w| w.path.display().to_string()),
        }
    }
}

fn or_dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

impl From<Vec<Route>> for Table {
    fn from(value: Vec<Route>) -> Self {
        let mut tab = Table::new();

        tab.set_header(vec!["MODEL", "PROVIDER", "API_BASE", "WEIGHTS"]);

        for route in value {
            tab.add_row(vec![
                route.model,
                or_dash(route.provider),
                or_dash(route.api_base),
                or_dash(route.weights),
            ]);
        }

        tab
    }
}

#[derive(serde::Serialize)]
struct Provider {
    name: String,
    discovery_type: &'static str,
    api_base: Option<String>,
}

impl From<Vec<Provider>> for Table {
    fn from(value: Vec<Provider>) -> Self {
        let mut tab = Table::new();

        tab.set_header(vec!["PROVIDER", "DISCOVERY_TYPE", "API_BASE"]);

        for provider in value {
            tab.add_row(vec![
                provider.name,
                provider.discovery_type.to_string(),
                or_dash(provider.api_base),
            ]);
        }

        tab
    }
}

fn get_providers(config: &Config) -> Vec<Provider> {
    config
        .providers
        .iter()
        .map(|p| Provider {
            name: p.name.clone(),
            discovery_type: p.provider.discovery_type(),
            api_base: p.provider.api_base().map(str::to_string),
        })
        .collect()
}

async fn get_routes(storage_root: &Path, config: &Config) -> Vec<Route> {
    let store = RouteStore::new(storage_root, &config.models_dir(storage_root));

    let models = match store.list().await {
        Ok(models) => models,
        Err(err) => die!("failed to list routes: {}", err),
    };

    let mut routes = Vec::with_capacity(models.len());

    for model in models {
        match store.load(&model).await {
            Ok(Some(route)) => routes.push(Route::new(model, route)),
            Ok(None) => {}
            Err(err) => warn!("skipping \"{}\": {}", model, err),
        }
    }

    routes
}

fn format_output<O: IntoTable + serde::Serialize>(object: O, format: ListingFormat) {
    match format {
        ListingFormat::Json => match serde_json::to_string_pretty(&object) {
            Ok(output) => println!("{}", output),
            Err(err) => die!("failed to serialize listing: {}", err),
        },
        ListingFormat::Table => {
            let tab = object.into_table();

            print!("{}", tab);
        }
        ListingFormat::HeaderlessTable => {
            let mut tab = object.into_table();

            tab.print_header(false);

            print!("{}", tab);
        }
    }
}

pub(crate) async fn list_cmd(storage_root: &Path, args: &ListArgs) {
    let format = args.format;

    let config = match read_config(storage_root) {
        Ok(config) => config,
        Err(err) => die!("{}", err),
    };

    match &args.object {
        ListObject::Routes => {
            let routes = get_routes(storage_root, &config).await;
            format_output(routes, format);
        }
        ListObject::Providers => {
            let providers = get_providers(&config);
            format_output(providers, format);
        }
    }
}
