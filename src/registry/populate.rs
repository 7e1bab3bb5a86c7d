use std::path::Path;
use std::sync::Arc;

use tracing::info;

use super::Resolver;
use crate::config::Config;
use crate::pool::memory::SystemMemory;
use crate::pool::ProcessPool;
use crate::providers::hub::HuggingFaceHub;

/// Builds a resolver backed by the Hugging Face hub and a process pool
/// sized by `config`.
pub(crate) fn populated_resolver(storage_root: &Path, config: &Config) -> Resolver {
    let hub = HuggingFaceHub::from_settings(&config.hub);

    let pool = ProcessPool::new(
        config.server.backend_base_port,
        config.server.memory_budget,
        Box::new(SystemMemory),
    );

    info!(
        storage_root = %storage_root.display(),
        providers = config.providers.len(),
        backend_base_port = config.server.backend_base_port,
        memory_budget = ?config.server.memory_budget,
        "registry ready"
    );

    Resolver::new(storage_root, Arc::new(hub), Arc::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_populated_resolver_lists_routes() {
        let dir = tempfile::tempdir().unwrap();

        std::fs::write(
            dir.path().join("gpt-4o.toml"),
            "api_base = \"https://api.openai.com\"\n",
        )
        .unwrap();

        let resolver = populated_resolver(dir.path(), &Config::default());

        assert_eq!(resolver.models().await.unwrap(), vec!["gpt-4o".to_string()]);
        assert!(resolver.pool().running().await.is_empty());

        let resolved = resolver.resolve("gpt-4o").await.unwrap();
        assert_eq!(resolved.api_base, "https://api.openai.com");
        assert_eq!(resolved.provider, None);
    }
}
