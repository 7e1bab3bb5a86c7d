use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::locks::KeyedLocks;
use super::{Attempt, Error, ModelRoute, ResolvedConfig, RouteStore};
use crate::config::{load_config, Config, Provider, ProviderConfig};
use crate::pool::ProcessPool;
use crate::providers::hub::ModelHub;
use crate::providers::local::{self, LocalDiscovery};
use crate::providers::{remote, DiscoveryOutcome};
use crate::proxy::merge_json;

/// Asks each provider in turn, stopping at the first match. Returns every
/// provider's reason for declining otherwise.
pub(crate) async fn try_in_order<'a, I, F, Fut>(
    providers: I,
    mut attempt: F,
) -> Result<(String, ModelRoute), Vec<Attempt>>
where
    I: IntoIterator<Item = &'a ProviderConfig>,
    F: FnMut(&'a ProviderConfig) -> Fut,
    Fut: Future<Output = DiscoveryOutcome>,
{
    let mut attempted = Vec::new();

    for provider in providers {
        match attempt(provider).await {
            DiscoveryOutcome::Matched(route) => return Ok((provider.name.clone(), route)),
            DiscoveryOutcome::NoMatch(reason) => {
                debug!(provider = %provider.name, reason = %reason, "provider declined");

                attempted.push(Attempt {
                    provider: provider.name.clone(),
                    reason,
                });
            }
            DiscoveryOutcome::TransientFailure(detail) => {
                warn!(provider = %provider.name, detail = %detail, "provider failed");

                attempted.push(Attempt {
                    provider: provider.name.clone(),
                    reason: detail,
                });
            }
        }
    }

    Err(attempted)
}

/// Headers from `base` not overridden (ignoring case) by `overrides`, plus
/// `overrides`.
fn merge_headers(
    base: &BTreeMap<String, String>,
    overrides: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = base
        .iter()
        .filter(|(name, _)| !overrides.keys().any(|o| o.eq_ignore_ascii_case(name)))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    merged.extend(overrides);

    merged
}

struct Inner {
    storage_root: PathBuf,
    hub: Arc<dyn ModelHub>,
    pool: Arc<ProcessPool>,
    client: Client,
    locks: KeyedLocks,
}

impl Inner {
    async fn discover_one(
        &self,
        config: &Config,
        provider: &ProviderConfig,
        model: &str,
    ) -> DiscoveryOutcome {
        debug!(provider = %provider.name, kind = provider.provider.discovery_type(), model, "asking provider");

        match &provider.provider {
            Provider::RemoteListing(listing) => {
                remote::discover(&self.client, &provider.name, listing, model).await
            }
            Provider::LocalQuantized(local) => {
                let models_dir = config.models_dir(&self.storage_root);

                LocalDiscovery::new(self.hub.as_ref(), &self.pool, &models_dir, None)
                    .discover(&provider.name, local, model)
                    .await
            }
        }
    }

    /// Runs discovery for `model` unless a concurrent caller already did.
    async fn discover_and_persist(&self, config: &Config, model: &str) -> Result<ModelRoute, Error> {
        let store = RouteStore::new(&self.storage_root, &config.models_dir(&self.storage_root));

        let _guard = self.locks.lock(model).await;

        if let Some(route) = store.load(model).await? {
            debug!(model, "route was discovered concurrently");
            return Ok(route);
        }

        let found = try_in_order(&config.providers, |provider| {
            self.discover_one(config, provider, model)
        })
        .await;

        let (provider, route) = match found {
            Ok(found) => found,
            Err(attempted) => {
                return Err(Error::NotFound {
                    model: model.to_string(),
                    attempted,
                })
            }
        };

        info!(model, provider = %provider, "discovered route");

        store.save(model, &route).await?;

        store
            .load(model)
            .await?
            .ok_or_else(|| Error::Persistence(format!("route for \"{}\" vanished", model)))
    }
}

/// Resolves model names to upstreams, discovering and persisting routes for
/// models seen for the first time.
#[derive(Clone)]
pub(crate) struct Resolver {
    inner: Arc<Inner>,
}

impl Resolver {
    pub(crate) fn new(
        storage_root: &Path,
        hub: Arc<dyn ModelHub>,
        pool: Arc<ProcessPool>,
    ) -> Resolver {
        Resolver {
            inner: Arc::new(Inner {
                storage_root: storage_root.to_path_buf(),
                hub,
                pool,
                client: Client::new(),
                locks: KeyedLocks::new(),
            }),
        }
    }

    pub(crate) fn pool(&self) -> &Arc<ProcessPool> {
        &self.inner.pool
    }

    async fn store(&self) -> Result<(Config, RouteStore), Error> {
        let config = load_config(&self.inner.storage_root).await?;
        let store = RouteStore::new(
            &self.inner.storage_root,
            &config.models_dir(&self.inner.storage_root),
        );

        Ok((config, store))
    }

    pub(crate) async fn resolve(&self, model: &str) -> Result<ResolvedConfig, Error> {
        let (config, store) = self.store().await?;

        store.route_path(model)?;

        if let Some(route) = store.load(model).await? {
            return self.finish(&config, model, route).await;
        }

        // Detached so that a client going away does not abandon a download
        // or a half-started backend
        let inner = self.inner.clone();
        let task_config = config.clone();
        let task_model = model.to_string();

        let route = tokio::spawn(async move {
            inner
                .discover_and_persist(&task_config, &task_model)
                .await
        })
        .await
        .map_err(|err| Error::Backend(format!("discovery task failed: {}", err)))??;

        self.finish(&config, model, route).await
    }

    /// Completes a persisted route with the live provider configuration.
    async fn finish(
        &self,
        config: &Config,
        model: &str,
        route: ModelRoute,
    ) -> Result<ResolvedConfig, Error> {
        let invalid = |reason: String| Error::InvalidPersistedState {
            model: model.to_string(),
            reason,
        };

        let ModelRoute {
            provider,
            mut api_base,
            mut api_key,
            mut headers,
            mut body,
            weights,
        } = route;

        if let Some(name) = &provider {
            let live = config
                .provider(name)
                .ok_or_else(|| invalid(format!("provider \"{}\" is not configured", name)))?;

            headers = merge_headers(live.provider.headers(), headers);

            let mut merged = Value::Object(live.provider.body().clone());
            merge_json(&mut merged, Value::Object(body));
            body = match merged {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };

            if api_key.is_none() {
                api_key = live.provider.api_key().map(str::to_string);
            }

            match &live.provider {
                Provider::RemoteListing(listing) => {
                    if api_base.is_none() {
                        api_base = Some(listing.api_base.clone());
                    }
                }
                Provider::LocalQuantized(local_provider) => {
                    if let Some(weights) = &weights {
                        let models_dir = config.models_dir(&self.inner.storage_root);

                        // One re-download and spawn per model, however many
                        // requests find its backend gone
                        let _guard = self.inner.locks.lock(model).await;

                        let port = local::provision(
                            self.inner.hub.as_ref(),
                            &self.inner.pool,
                            &models_dir,
                            model,
                            local_provider,
                            weights,
                        )
                        .await
                        .map_err(|err| Error::Backend(err.to_string()))?;

                        api_base = Some(format!("http://127.0.0.1:{}", port));
                    }
                }
            }
        }

        let api_base = api_base.ok_or_else(|| invalid("no api_base".to_string()))?;

        url::Url::parse(&api_base)
            .map_err(|err| invalid(format!("api_base \"{}\": {}", api_base, err)))?;

        Ok(ResolvedConfig {
            provider,
            api_base,
            api_key,
            headers,
            body,
        })
    }

    /// Deletes the persisted route of `model` so the next request rediscovers
    /// it. Returns false if there was none.
    pub(crate) async fn forget(&self, model: &str) -> Result<bool, Error> {
        let (_, store) = self.store().await?;

        store.route_path(model)?;

        let _guard = self.inner.locks.lock(model).await;

        let removed = store.remove(model).await?;

        if removed {
            info!(model, "forgot route");
        }

        Ok(removed)
    }

    /// Models with a persisted route.
    pub(crate) async fn models(&self) -> Result<Vec<String>, Error> {
        let (_, store) = self.store().await?;

        store.list().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;
    use crate::config::CONFIG_FILE_NAME;
    use crate::pool::tests::FakeMemory;
    use crate::providers::local::tests::FakeHub;

    struct Upstream {
        base: String,
        calls: Arc<AtomicUsize>,
    }

    /// An OpenAI-compatible listing that counts how often it is fetched.
    async fn spawn_listing(ids: &'static [&'static str]) -> Upstream {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let app = Router::new().route(
            "/v1/models",
            get(move |_headers: HeaderMap| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);

                    // Gives concurrent resolutions a chance to pile up
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

                    let data: Vec<Value> = ids.iter().map(|id| json!({"id": id})).collect();
                    Json(json!({"object": "list", "data": data}))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Upstream {
            base: format!("http://{}", addr),
            calls,
        }
    }

    fn write_config(root: &Path, config: &str) {
        std::fs::write(root.join(CONFIG_FILE_NAME), config).unwrap();
    }

    fn resolver(root: &Path, hub: FakeHub, port: u16) -> Resolver {
        let pool = ProcessPool::new(port, None, Box::new(FakeMemory::new(1_000_000)));

        Resolver::new(root, Arc::new(hub), Arc::new(pool))
    }

    fn remote_config(name: &str, upstream: &Upstream) -> String {
        format!(
            r#"
[[providers]]
name = "{}"
discovery_type = "remote_listing"
api_base = "{}"
api_key = "sk-{}"
headers = {{ "X-Title" = "modelgate" }}
body = {{ max_tokens = 64, model = "placeholder" }}
"#,
            name, upstream.base, name
        )
    }

    #[test]
    fn test_merge_headers_ignores_case() {
        let mut base = BTreeMap::new();
        base.insert("authorization".to_string(), "Bearer live".to_string());
        base.insert("X-Title".to_string(), "gate".to_string());

        let mut overrides = BTreeMap::new();
        overrides.insert("Authorization".to_string(), "Basic route".to_string());

        let merged = merge_headers(&base, overrides);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged["Authorization"], "Basic route");
        assert_eq!(merged["X-Title"], "gate");
    }

    #[tokio::test]
    async fn test_try_in_order_stops_at_first_match() {
        let config = crate::config::parse_config(
            r#"
[[providers]]
name = "a"
discovery_type = "remote_listing"
api_base = "http://127.0.0.1:1"

[[providers]]
name = "b"
discovery_type = "remote_listing"
api_base = "http://127.0.0.1:2"

[[providers]]
name = "c"
discovery_type = "remote_listing"
api_base = "http://127.0.0.1:3"
"#,
        )
        .unwrap();

        let asked = std::sync::Mutex::new(Vec::new());

        let found = try_in_order(&config.providers, |provider| {
            asked.lock().unwrap().push(provider.name.clone());
            let name = provider.name.clone();

            async move {
                match name.as_str() {
                    "a" => DiscoveryOutcome::TransientFailure("down".to_string()),
                    _ => DiscoveryOutcome::Matched(ModelRoute::default()),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(found.0, "b");
        assert_eq!(*asked.lock().unwrap(), vec!["a", "b"]);

        let failed = try_in_order(&config.providers, |provider| {
            let name = provider.name.clone();
            async move { DiscoveryOutcome::NoMatch(format!("{} declined", name)) }
        })
        .await
        .unwrap_err();

        assert_eq!(
            failed.iter().map(|a| a.reason.as_str()).collect::<Vec<_>>(),
            vec!["a declined", "b declined", "c declined"]
        );
    }

    #[tokio::test]
    async fn test_resolve_persists_and_takes_fast_path() {
        let upstream = spawn_listing(&["gpt-4o-mini", "Meta-Llama/Llama-3.1-8B"]).await;
        let dir = tempfile::tempdir().unwrap();

        write_config(dir.path(), &remote_config("openrouter", &upstream));

        let resolver = resolver(dir.path(), FakeHub::default(), 10000);

        let resolved = resolver.resolve("meta-llama/llama-3.1-8b").await.unwrap();

        assert_eq!(resolved.provider.as_deref(), Some("openrouter"));
        assert_eq!(resolved.api_base, upstream.base);
        assert_eq!(resolved.api_key.as_deref(), Some("sk-openrouter"));
        assert_eq!(resolved.headers["X-Title"], "modelgate");
        assert_eq!(
            Value::Object(resolved.body.clone()),
            json!({"max_tokens": 64, "model": "Meta-Llama/Llama-3.1-8B"})
        );

        assert!(dir.path().join("meta-llama/llama-3.1-8b.toml").is_file());

        let again = resolver.resolve("meta-llama/llama-3.1-8b").await.unwrap();
        assert_eq!(again, resolved);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            resolver.models().await.unwrap(),
            vec!["meta-llama/llama-3.1-8b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_discover_once() {
        let upstream = spawn_listing(&["gpt-4o-mini"]).await;
        let dir = tempfile::tempdir().unwrap();

        write_config(dir.path(), &remote_config("openrouter", &upstream));

        let resolver = resolver(dir.path(), FakeHub::default(), 10100);

        let mut tasks = Vec::new();

        for _ in 0..16 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(
                async move { resolver.resolve("gpt-4o-mini").await },
            ));
        }

        for task in tasks {
            let resolved = task.await.unwrap().unwrap();
            assert_eq!(resolved.body["model"], json!("gpt-4o-mini"));
        }

        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.inner.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_in_declared_order() {
        let first = spawn_listing(&["gpt-4o"]).await;
        let second = spawn_listing(&["mistralai/Mistral-7B-Instruct"]).await;
        let dir = tempfile::tempdir().unwrap();

        write_config(
            dir.path(),
            &format!(
                "{}\n{}",
                remote_config("first", &first),
                remote_config("second", &second)
            ),
        );

        let resolver = resolver(dir.path(), FakeHub::default(), 10200);

        let resolved = resolver
            .resolve("mistralai/mistral-7b-instruct")
            .await
            .unwrap();

        assert_eq!(resolved.provider.as_deref(), Some("second"));
        assert_eq!(resolved.api_key.as_deref(), Some("sk-second"));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);

        // The first provider is preferred when both can serve a model
        let resolved = resolver.resolve("gpt-4o").await.unwrap();
        assert_eq!(resolved.provider.as_deref(), Some("first"));
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_lists_every_provider() {
        let upstream = spawn_listing(&["gpt-4o"]).await;
        let dir = tempfile::tempdir().unwrap();

        write_config(
            dir.path(),
            &format!(
                "{}\n{}",
                remote_config("listing", &upstream),
                r#"
[[providers]]
name = "down"
discovery_type = "remote_listing"
api_base = "http://127.0.0.1:1"
"#
            ),
        );

        let resolver = resolver(dir.path(), FakeHub::default(), 10300);

        match resolver.resolve("claude-9").await {
            Err(Error::NotFound { model, attempted }) => {
                assert_eq!(model, "claude-9");
                assert_eq!(
                    attempted
                        .iter()
                        .map(|a| a.provider.as_str())
                        .collect::<Vec<_>>(),
                    vec!["listing", "down"]
                );
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(!dir.path().join("claude-9.toml").exists());
    }

    #[tokio::test]
    async fn test_rejects_hostile_and_reserved_names() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path(), FakeHub::default(), 10400);

        for name in ["../../etc/passwd", "/etc/passwd", "", "a/./b", "a\0b"] {
            assert!(
                matches!(resolver.resolve(name).await, Err(Error::SecurityRejection)),
                "{:?} was not rejected",
                name
            );
        }

        assert!(matches!(
            resolver.resolve("config").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_persisted_routes() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path(), FakeHub::default(), 10500);

        std::fs::write(dir.path().join("orphan.toml"), "provider = \"gone\"\n").unwrap();
        std::fs::write(dir.path().join("nowhere.toml"), "api_key = \"sk\"\n").unwrap();
        std::fs::write(dir.path().join("broken.toml"), "api_base = \"not a url\"\n").unwrap();

        for model in ["orphan", "nowhere", "broken"] {
            assert!(
                matches!(
                    resolver.resolve(model).await,
                    Err(Error::InvalidPersistedState { .. })
                ),
                "{} was accepted",
                model
            );
        }

        // A hand-written route without a provider is used as is
        std::fs::write(
            dir.path().join("pinned.toml"),
            "api_base = \"http://10.0.0.2:8000\"\n[body]\nmodel = \"pinned-id\"\n",
        )
        .unwrap();

        let resolved = resolver.resolve("pinned").await.unwrap();
        assert_eq!(resolved.api_base, "http://10.0.0.2:8000");
        assert_eq!(resolved.body["model"], json!("pinned-id"));
    }

    #[tokio::test]
    async fn test_forget_triggers_rediscovery() {
        let upstream = spawn_listing(&["gpt-4o"]).await;
        let dir = tempfile::tempdir().unwrap();

        write_config(dir.path(), &remote_config("openrouter", &upstream));

        let resolver = resolver(dir.path(), FakeHub::default(), 10600);

        resolver.resolve("gpt-4o").await.unwrap();
        assert!(resolver.forget("gpt-4o").await.unwrap());
        assert!(!resolver.forget("gpt-4o").await.unwrap());

        resolver.resolve("gpt-4o").await.unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_local_route_is_reprovisioned_after_eviction() {
        let hub = FakeHub::default().with_repo(
            "bartowski/Llama-3.1-8B-GGUF",
            900,
            &[("Llama-3.1-8B-Q6_K.gguf", 64)],
        );
        let listing_calls = hub.listing_calls.clone();
        let downloads = hub.downloads.clone();

        let dir = tempfile::tempdir().unwrap();

        write_config(
            dir.path(),
            r#"
[[providers]]
name = "local"
discovery_type = "local_quantized"
binary_path = "sh"
args = ["-c", "exec sleep 30", "backend"]
body = { cache_prompt = true }
"#,
        );

        let resolver = resolver(dir.path(), hub, 10700);

        let resolved = resolver.resolve("meta-llama/Llama-3.1-8B").await.unwrap();
        assert_eq!(resolved.api_base, "http://127.0.0.1:10700");
        assert_eq!(resolved.body["cache_prompt"], json!(true));

        assert!(resolver.pool().evict_one_lru().await);

        let resolved = resolver.resolve("meta-llama/Llama-3.1-8B").await.unwrap();
        assert_eq!(resolved.api_base, "http://127.0.0.1:10701");

        assert_eq!(listing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(downloads.load(Ordering::SeqCst), 1);

        resolver.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_reprovisioning_downloads_once() {
        let hub = FakeHub::default().with_repo(
            "bartowski/Qwen2.5-7B-GGUF",
            900,
            &[("Qwen2.5-7B-Q6_K.gguf", 64)],
        );
        let downloads = hub.downloads.clone();

        let dir = tempfile::tempdir().unwrap();

        write_config(
            dir.path(),
            r#"
[[providers]]
name = "local"
discovery_type = "local_quantized"
binary_path = "sh"
args = ["-c", "exec sleep 30", "backend"]
"#,
        );

        let resolver = resolver(dir.path(), hub, 10800);

        resolver.resolve("Qwen/Qwen2.5-7B").await.unwrap();
        assert_eq!(downloads.load(Ordering::SeqCst), 1);

        // Backend evicted and weights deleted
        assert!(resolver.pool().evict_one_lru().await);
        let weights = local::local_path(
            &dir.path().join("models"),
            "bartowski/Qwen2.5-7B-GGUF",
            "Qwen2.5-7B-Q6_K.gguf",
        )
        .unwrap();
        std::fs::remove_file(&weights).unwrap();

        let mut tasks = Vec::new();

        for _ in 0..8 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(
                async move { resolver.resolve("Qwen/Qwen2.5-7B").await },
            ));
        }

        for task in tasks {
            let resolved = task.await.unwrap().unwrap();
            assert_eq!(resolved.api_base, "http://127.0.0.1:10801");
        }

        assert_eq!(downloads.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.pool().running().await.len(), 1);
        assert!(weights.is_file());

        resolver.pool().shutdown().await;
    }
}
