//! Scoring and selection of quantized weights files.

use std::cmp::Ordering;

use rand::Rng;

use crate::config::{QuantizationPreferences, TiebreakStrategy};
use crate::providers::hub::HubFile;

/// A `.gguf` file from one of the quantized repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QuantCandidate {
    pub repo_id: String,
    pub file_path: String,
    pub preference_score: i64,
    pub quant_level: String,
    pub file_size_bytes: u64,
    pub downloads: u64,
    pub likes: u64,
}

/// The boolean features the preference score is made of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Features {
    pub has_imatrix: bool,
    pub same_owner: bool,
    pub correct_precision: bool,
}

/// Features shared by every file of a repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RepoFeatures {
    pub has_imatrix: bool,
    pub same_owner: bool,
}

fn owner(repo_id: &str) -> &str {
    repo_id.split('/').next().unwrap_or(repo_id)
}

impl RepoFeatures {
    pub(crate) fn inspect(repo_id: &str, files: &[HubFile], base_model: &str) -> RepoFeatures {
        let has_imatrix = files.iter().any(|f| {
            f.path
                .split('/')
                .any(|segment| segment.to_ascii_lowercase().contains("imatrix"))
        });

        let same_owner = owner(repo_id).eq_ignore_ascii_case(owner(base_model));

        RepoFeatures {
            has_imatrix,
            same_owner,
        }
    }

    pub(crate) fn with_quant_level(self, quant_level: &str, precision: &str) -> Features {
        Features {
            has_imatrix: self.has_imatrix,
            same_owner: self.same_owner,
            correct_precision: quant_level == precision,
        }
    }
}

pub(crate) fn score(features: &Features, prefs: &QuantizationPreferences) -> i64 {
    let mut total = 0;

    if features.has_imatrix {
        total += prefs.prefer_imatrix;
    }

    if features.same_owner {
        total += prefs.prefer_same_owner;
    }

    if features.correct_precision {
        total += prefs.prefer_correct_precision;
    }

    total
}

fn popularity(a: &QuantCandidate, b: &QuantCandidate) -> Ordering {
    b.downloads
        .cmp(&a.downloads)
        .then(b.likes.cmp(&a.likes))
        .then_with(|| a.repo_id.cmp(&b.repo_id))
        .then_with(|| a.file_path.cmp(&b.file_path))
}

/// Picks the winner among the highest scoring candidates.
pub(crate) fn select<R: Rng + ?Sized>(
    candidates: Vec<QuantCandidate>,
    strategy: TiebreakStrategy,
    rng: &mut R,
) -> Option<QuantCandidate> {
    let best = candidates.iter().map(|c| c.preference_score).max()?;

    let mut tied: Vec<QuantCandidate> = candidates
        .into_iter()
        .filter(|c| c.preference_score == best)
        .collect();

    match strategy {
        TiebreakStrategy::Random => {
            let idx = rng.gen_range(0..tied.len());
            Some(tied.swap_remove(idx))
        }
        TiebreakStrategy::Popular => {
            tied.sort_by(popularity);
            tied.into_iter().next()
        }
    }
}
