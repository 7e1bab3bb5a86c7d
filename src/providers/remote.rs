//! Discovery against an OpenAI-compatible model listing.

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::apireq::{build_headers, error_for_status, join_endpoint};
use super::{DiscoveryOutcome, Error, ErrorKind};
use crate::config::RemoteProvider;
use crate::registry::ModelRoute;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub(crate) struct ListedModel {
    pub id: String,
    /// Some services (OpenRouter, for one) publish the hub repository
    /// their model was built from.
    #[serde(default)]
    pub hugging_face_id: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ListedModel>,
}

pub(crate) async fn list_models(
    client: &Client,
    provider: &RemoteProvider,
) -> Result<Vec<ListedModel>, Error> {
    let url = join_endpoint(&provider.api_base, "/v1/models")
        .map_err(|e| Error::from_source(ErrorKind::BadRequest, Box::new(e)))?;

    let headers = build_headers(&provider.headers, provider.api_key.as_deref())?;

    let res = client.get(url).headers(headers).send().await?;

    let status = res.status();

    if !status.is_success() {
        let detail = res.text().await.unwrap_or_default();
        return Err(error_for_status(status, detail));
    }

    let list: ModelList = res.json().await?;

    Ok(list.data)
}

/// The first listed model whose id or hub id equals `model`, ignoring case.
pub(crate) fn find_model<'a>(models: &'a [ListedModel], model: &str) -> Option<&'a ListedModel> {
    models.iter().find(|listed| {
        listed.id.eq_ignore_ascii_case(model)
            || listed
                .hugging_face_id
                .as_deref()
                .is_some_and(|hf| hf.eq_ignore_ascii_case(model))
    })
}

pub(crate) async fn discover(
    client: &Client,
    provider_name: &str,
    provider: &RemoteProvider,
    model: &str,
) -> DiscoveryOutcome {
    let models = match list_models(client, provider).await {
        Ok(models) => models,
        Err(err) => {
            warn!(provider = provider_name, error = %err, "model listing failed");
            return DiscoveryOutcome::TransientFailure(err.to_string());
        }
    };

    debug!(
        provider = provider_name,
        count = models.len(),
        "fetched model listing"
    );

    match find_model(&models, model) {
        Some(listed) => {
            let mut body = serde_json::Map::new();
            body.insert(
                "model".to_string(),
                serde_json::Value::String(listed.id.clone()),
            );

            DiscoveryOutcome::Matched(ModelRoute {
                provider: Some(provider_name.to_string()),
                body,
                ..ModelRoute::default()
            })
        }
        None => DiscoveryOutcome::NoMatch(format!("\"{}\" is not listed", model)),
    }
}
