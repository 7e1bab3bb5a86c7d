//! Discovery of quantized weights on the model hub, served by a local
//! inference binary.
//!
//! A requested model name is read as a hub repository (`owner/repo`), with an
//! optional quantization suffix (`owner/repo/Q4_K_M`) overriding the
//! configured precision. Every repository tagged as a quantization of that
//! base model is inspected, each `.gguf` file in it is scored, and the winner
//! is downloaded into the models directory and handed to the process pool.

pub(crate) mod gguf;
pub(crate) mod scorer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures_util::{stream, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::hub::{HubFile, HubRepo, ModelHub};
use super::{DiscoveryOutcome, Error, ErrorKind};
use crate::config::LocalProvider;
use crate::pool::{LaunchSpec, PoolError, ProcessPool};
use crate::registry::{LocalWeights, ModelRoute, WeightsFile};
use crate::utils::paths::flatten_file_name;
use crate::utils::tempfile::PendingFile;
use scorer::{QuantCandidate, RepoFeatures};

/// How many weights headers are fetched at once.
const PROBE_CONCURRENCY: usize = 8;

/// The llama.cpp runtime cannot load these formats.
const UNSUPPORTED_FORMATS: [&str; 2] = ["mlx", "onnx"];

#[derive(Error, Debug)]
pub(crate) enum ProvisionError {
    #[error("failed to fetch weights: {0}")]
    Weights(#[from] Error),
    #[error("{required} bytes of memory cannot be freed")]
    Infeasible { required: u64 },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// A model name read as a request for quantized weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QuantRequest {
    pub base_model: String,
    pub precision: Option<String>,
}

impl QuantRequest {
    pub(crate) fn parse(model: &str) -> Option<QuantRequest> {
        let parts: Vec<&str> = model.split('/').collect();

        if parts.iter().any(|p| p.trim().is_empty()) {
            return None;
        }

        match parts.as_slice() {
            [owner, repo] => Some(QuantRequest {
                base_model: format!("{}/{}", owner, repo),
                precision: None,
            }),
            [owner, repo, quant] => Some(QuantRequest {
                base_model: format!("{}/{}", owner, repo),
                precision: Some(quant.to_ascii_uppercase()),
            }),
            _ => None,
        }
    }
}

/// Splits `*-00001-of-00003.gguf` into its prefix, shard index and shard
/// count.
fn split_shard(path: &str) -> Option<(&str, u32, u32)> {
    if !is_gguf(path) {
        return None;
    }

    let stem = &path[..path.len() - ".gguf".len()];

    let (head, count) = stem.rsplit_once("-of-")?;
    let (prefix, index) = head.rsplit_once('-')?;

    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    if !all_digits(index) || !all_digits(count) {
        return None;
    }

    Some((prefix, index.parse().ok()?, count.parse().ok()?))
}

/// The files making up a candidate: either a single file or every shard of a
/// split model, in order. Only the first shard of a split model yields a
/// candidate.
fn candidate_files(first: &HubFile, files: &[HubFile]) -> Option<Vec<HubFile>> {
    let (prefix, index, count) = match split_shard(&first.path) {
        Some(split) => split,
        None => return Some(vec![first.clone()]),
    };

    if index != 1 {
        return None;
    }

    let mut shards: Vec<HubFile> = files
        .iter()
        .filter(|f| matches!(split_shard(&f.path), Some((p, _, c)) if p == prefix && c == count))
        .cloned()
        .collect();

    shards.sort_by(|a, b| a.path.cmp(&b.path));
    shards.dedup_by(|a, b| a.path == b.path);

    // An incomplete listing cannot be loaded
    if shards.len() != count as usize {
        return None;
    }

    Some(shards)
}

fn is_gguf(path: &str) -> bool {
    path.to_ascii_lowercase().ends_with(".gguf")
}

fn is_supported_repo(repo_id: &str) -> bool {
    let lower = repo_id.to_ascii_lowercase();

    !UNSUPPORTED_FORMATS.iter().any(|f| lower.contains(f))
}

async fn probe_quant_level(hub: &dyn ModelHub, repo_id: &str, file: &HubFile) -> String {
    match hub
        .file_prefix(repo_id, &file.path, gguf::HEADER_PROBE_BYTES)
        .await
    {
        Ok(header) => match gguf::read_file_type(&header) {
            Ok(Some(file_type)) => {
                if let Some(name) = gguf::quant_name(file_type) {
                    return name.to_string();
                }
            }
            Ok(None) => {}
            Err(err) => {
                debug!(repo = repo_id, file = %file.path, error = %err, "unreadable GGUF header")
            }
        },
        Err(err) => {
            debug!(repo = repo_id, file = %file.path, error = %err, "failed to fetch GGUF header")
        }
    }

    gguf::quant_from_file_name(&file.path)
        .unwrap_or("unknown")
        .to_string()
}

/// Where a hub file is stored locally.
pub(crate) fn local_path(models_dir: &Path, repo_id: &str, file: &str) -> Result<PathBuf, Error> {
    let name = flatten_file_name(&format!("{}/{}", repo_id, file))
        .ok_or_else(|| Error::from_kind(ErrorKind::BadRequest))?;

    Ok(models_dir.join(name))
}

/// Downloads the files of `weights` that are not present yet and returns the
/// path of the first one.
pub(crate) async fn ensure_weights(
    hub: &dyn ModelHub,
    models_dir: &Path,
    repo_id: &str,
    files: &[WeightsFile],
) -> Result<PathBuf, Error> {
    tokio::fs::create_dir_all(models_dir).await?;

    let mut first = None;

    for file in files {
        let dest = local_path(models_dir, repo_id, &file.file)?;

        let present = match tokio::fs::metadata(&dest).await {
            Ok(meta) => file.size_bytes == 0 || meta.len() == file.size_bytes,
            Err(_) => false,
        };

        if !present {
            info!(repo = repo_id, file = %file.file, size = file.size_bytes, "downloading weights");

            let mut pending = PendingFile::beside(&dest, ".part")?;

            let std_file = pending
                .take_file()
                .ok_or_else(|| Error::from_kind(ErrorKind::Io))?;
            let mut async_file = tokio::fs::File::from_std(std_file);

            let written = hub.download(repo_id, &file.file, &mut async_file).await?;

            async_file.sync_all().await?;
            drop(async_file);

            if file.size_bytes != 0 && written != file.size_bytes {
                warn!(
                    repo = repo_id,
                    file = %file.file,
                    expected = file.size_bytes,
                    written,
                    "download size mismatch"
                );

                return Err(Error::from_kind(ErrorKind::UnexpectedResponse));
            }

            pending.persist(&dest)?;
        }

        first.get_or_insert(dest);
    }

    first.ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
}

/// Makes sure the backend for `model` is running, fetching its weights again
/// if they went missing. Returns its port.
pub(crate) async fn provision(
    hub: &dyn ModelHub,
    pool: &ProcessPool,
    models_dir: &Path,
    model: &str,
    provider: &LocalProvider,
    weights: &LocalWeights,
) -> Result<u16, ProvisionError> {
    let running = pool.touch(model).await.is_some();

    if !running && !pool.can_admit(weights.size_bytes).await {
        return Err(ProvisionError::Infeasible {
            required: weights.size_bytes,
        });
    }

    let path = ensure_weights(hub, models_dir, &weights.repo_id, &weights.files).await?;

    Ok(pool
        .provision(model, &launch_spec(provider, &path), weights.size_bytes)
        .await?)
}

fn launch_spec(provider: &LocalProvider, weights_path: &Path) -> LaunchSpec {
    LaunchSpec {
        binary_path: provider.binary_path.clone(),
        args: provider.args.clone(),
        weights_path: weights_path.to_path_buf(),
    }
}

pub(crate) struct LocalDiscovery<'a> {
    hub: &'a dyn ModelHub,
    pool: &'a ProcessPool,
    models_dir: &'a Path,
    rng: StdRng,
}

impl<'a> LocalDiscovery<'a> {
    pub(crate) fn new(
        hub: &'a dyn ModelHub,
        pool: &'a ProcessPool,
        models_dir: &'a Path,
        seed: Option<u64>,
    ) -> LocalDiscovery<'a> {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        LocalDiscovery {
            hub,
            pool,
            models_dir,
            rng,
        }
    }

    async fn repo_listings(&self, repos: Vec<HubRepo>) -> Vec<(HubRepo, Vec<HubFile>)> {
        let hub = self.hub;

        stream::iter(repos)
            .map(|repo| async move {
                match hub.repo_files(&repo.id).await {
                    Ok(files) => Some((repo, files)),
                    Err(err) => {
                        warn!(repo = %repo.id, error = %err, "skipping repository");
                        None
                    }
                }
            })
            .buffered(PROBE_CONCURRENCY)
            .filter_map(|listing| async move { listing })
            .collect()
            .await
    }

    /// Scores every loadable weights file. Also returns the files behind
    /// each candidate, keyed by `(repo_id, file_path)`.
    async fn candidates(
        &self,
        request: &QuantRequest,
        precision: &str,
        provider: &LocalProvider,
        listings: Vec<(HubRepo, Vec<HubFile>)>,
    ) -> (Vec<QuantCandidate>, HashMap<(String, String), Vec<HubFile>>) {
        let mut probes = Vec::new();

        for (repo, files) in &listings {
            let features = RepoFeatures::inspect(&repo.id, files, &request.base_model);

            for file in files.iter().filter(|f| is_gguf(&f.path)) {
                if let Some(parts) = candidate_files(file, files) {
                    probes.push((repo.clone(), features, file.clone(), parts));
                }
            }
        }

        let hub = self.hub;

        let probed: Vec<_> = stream::iter(probes)
            .map(|(repo, features, file, parts)| async move {
                let level = probe_quant_level(hub, &repo.id, &file).await;
                (repo, features, file, parts, level)
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;

        let mut candidates = Vec::new();
        let mut parts_by_candidate = HashMap::new();

        for (repo, features, file, parts, level) in probed {
            let preference_score = scorer::score(
                &features.with_quant_level(&level, precision),
                &provider.quantization,
            );

            candidates.push(QuantCandidate {
                repo_id: repo.id.clone(),
                file_path: file.path.clone(),
                preference_score,
                quant_level: level,
                file_size_bytes: parts.iter().map(|p| p.size).sum(),
                downloads: repo.downloads,
                likes: repo.likes,
            });

            parts_by_candidate.insert((repo.id, file.path), parts);
        }

        (candidates, parts_by_candidate)
    }

    pub(crate) async fn discover(
        &mut self,
        provider_name: &str,
        provider: &LocalProvider,
        model: &str,
    ) -> DiscoveryOutcome {
        let request = match QuantRequest::parse(model) {
            Some(request) => request,
            None => {
                return DiscoveryOutcome::NoMatch(format!(
                    "\"{}\" does not name a hub repository",
                    model
                ))
            }
        };

        let precision = request
            .precision
            .clone()
            .unwrap_or_else(|| provider.quantization.precision.clone());

        let repos = match self.hub.quantized_repos(&request.base_model).await {
            Ok(repos) => repos,
            Err(err) => {
                warn!(provider = provider_name, base_model = %request.base_model, error = %err, "hub listing failed");
                return DiscoveryOutcome::TransientFailure(err.to_string());
            }
        };

        let repos: Vec<HubRepo> = repos
            .into_iter()
            .filter(|repo| is_supported_repo(&repo.id))
            .collect();

        if repos.is_empty() {
            return DiscoveryOutcome::NoMatch(format!(
                "no quantizations of \"{}\" found",
                request.base_model
            ));
        }

        let listings = self.repo_listings(repos).await;

        let (candidates, mut parts) = self
            .candidates(&request, &precision, provider, listings)
            .await;

        debug!(
            provider = provider_name,
            model,
            candidates = candidates.len(),
            "scored weights"
        );

        let winner = match scorer::select(
            candidates,
            provider.quantization.tiebreak_strategy,
            &mut self.rng,
        ) {
            Some(winner) => winner,
            None => {
                return DiscoveryOutcome::NoMatch(format!(
                    "no GGUF weights found for \"{}\"",
                    request.base_model
                ))
            }
        };

        info!(
            provider = provider_name,
            model,
            repo = %winner.repo_id,
            file = %winner.file_path,
            quant = %winner.quant_level,
            score = winner.preference_score,
            "selected weights"
        );

        if !self.pool.can_admit(winner.file_size_bytes).await {
            return DiscoveryOutcome::NoMatch(format!(
                "{} needs {} bytes of memory, which cannot be freed",
                winner.file_path, winner.file_size_bytes
            ));
        }

        let files: Vec<WeightsFile> = parts
            .remove(&(winner.repo_id.clone(), winner.file_path.clone()))
            .unwrap_or_default()
            .into_iter()
            .map(|f| WeightsFile {
                file: f.path,
                size_bytes: f.size,
            })
            .collect();

        let path = match ensure_weights(self.hub, self.models_dir, &winner.repo_id, &files).await
        {
            Ok(path) => path,
            Err(err) => {
                warn!(provider = provider_name, repo = %winner.repo_id, error = %err, "weights download failed");
                return DiscoveryOutcome::TransientFailure(err.to_string());
            }
        };

        let launch = launch_spec(provider, &path);

        let port = match self
            .pool
            .provision(model, &launch, winner.file_size_bytes)
            .await
        {
            Ok(port) => port,
            Err(err @ PoolError::InsufficientMemory { .. }) => {
                return DiscoveryOutcome::NoMatch(err.to_string())
            }
            Err(err) => {
                warn!(provider = provider_name, error = %err, "failed to start backend");
                return DiscoveryOutcome::TransientFailure(err.to_string());
            }
        };

        DiscoveryOutcome::Matched(ModelRoute {
            provider: Some(provider_name.to_string()),
            api_base: Some(format!("http://127.0.0.1:{}", port)),
            weights: Some(LocalWeights {
                repo_id: winner.repo_id,
                files,
                path,
                size_bytes: winner.file_size_bytes,
            }),
            ..ModelRoute::default()
        })
    }
}
