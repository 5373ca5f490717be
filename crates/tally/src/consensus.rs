//! Majority-vote solution consensus.
//!
//! Pure functions: no store access, no clock. The solutions task feeds them a
//! dataset plus its commitments and persists whatever comes back.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tally_common::{CaptchaSolution, CommitmentRecord, CommitmentStatus, Dataset};

use crate::config::CaptchaSolutionsConfig;
use crate::dataset::refresh_content_id;

/// Classification of the answers submitted for one captcha
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Leading answer holds the required share
    Solved {
        solution: CaptchaSolution,
        votes: usize,
        sample: usize,
    },
    /// Fewer answers than `required_number_of_solutions`
    InsufficientSample { sample: usize },
    /// Two or more answers share the lead
    Tied { votes: usize, sample: usize },
    /// Leading answer is below the winning percentage
    NoMajority { votes: usize, sample: usize },
}

/// Count the answers and classify the result
pub fn tally<'a, I>(answers: I, config: &CaptchaSolutionsConfig) -> Verdict
where
    I: IntoIterator<Item = &'a CaptchaSolution>,
{
    // BTreeMap keeps the leader pick independent of input order
    let mut counts: BTreeMap<&CaptchaSolution, usize> = BTreeMap::new();
    let mut sample = 0;
    for answer in answers {
        *counts.entry(answer).or_default() += 1;
        sample += 1;
    }

    if sample < config.required_number_of_solutions {
        return Verdict::InsufficientSample { sample };
    }

    let mut ranked: Vec<(&CaptchaSolution, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    let Some(&(leader, votes)) = ranked.first() else {
        return Verdict::InsufficientSample { sample };
    };
    if ranked.get(1).is_some_and(|(_, runner_up)| *runner_up == votes) {
        return Verdict::Tied { votes, sample };
    }

    if (votes as f64) * 100.0 < config.solution_winning_percentage * sample as f64 {
        return Verdict::NoMajority { votes, sample };
    }

    Verdict::Solved {
        solution: leader.clone(),
        votes,
        sample,
    }
}

/// A captcha that moved from unsolved to solved
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedCaptcha {
    pub captcha_id: String,
    pub solution: CaptchaSolution,
    pub votes: usize,
    pub sample: usize,
}

#[derive(Debug, Clone)]
pub struct ConsensusOutcome {
    /// Input dataset with resolved solutions applied
    pub dataset: Dataset,
    pub resolved: Vec<ResolvedCaptcha>,
    /// Commitments whose answers decided a resolved captcha
    pub counted_commitments: Vec<String>,
    /// Ledger height the recency window was measured from
    pub reference_block: Option<u64>,
    pub content_changed: bool,
}

/// Resolve every unsolved captcha of `dataset` that has a clear majority.
///
/// Counted commitments: made against this dataset, not Disapproved, first
/// occurrence per id, and requested within `captcha_block_recency` blocks of
/// `reference_block` (default: the newest such commitment).
pub fn recalculate(
    dataset: &Dataset,
    commitments: &[CommitmentRecord],
    config: &CaptchaSolutionsConfig,
    reference_block: Option<u64>,
) -> ConsensusOutcome {
    let mut seen = HashSet::new();
    let candidates: Vec<&CommitmentRecord> = commitments
        .iter()
        .filter(|c| c.dataset_id == dataset.dataset_id)
        .filter(|c| c.status != CommitmentStatus::Disapproved)
        .filter(|c| seen.insert(c.id.as_str()))
        .collect();

    let reference_block =
        reference_block.or_else(|| candidates.iter().map(|c| c.requested_at_block).max());

    let eligible: Vec<&CommitmentRecord> = match reference_block {
        Some(reference) => candidates
            .into_iter()
            .filter(|c| {
                reference.saturating_sub(c.requested_at_block) < config.captcha_block_recency
            })
            .collect(),
        None => Vec::new(),
    };

    let mut updated = dataset.clone();
    let mut resolved = Vec::new();
    let mut counted = Vec::new();

    for captcha in updated.captchas.iter_mut().filter(|c| c.solution.is_none()) {
        let voters: Vec<(&str, &CaptchaSolution)> = eligible
            .iter()
            .filter_map(|c| c.answer_for(&captcha.captcha_id).map(|s| (c.id.as_str(), s)))
            .collect();

        let verdict = tally(voters.iter().map(|(_, solution)| *solution), config);
        match verdict {
            Verdict::Solved {
                solution,
                votes,
                sample,
            } => {
                tracing::debug!(
                    captcha_id = %captcha.captcha_id,
                    votes,
                    sample,
                    "Captcha resolved"
                );
                captcha.solution = Some(solution.clone());
                counted.extend(voters.iter().map(|(id, _)| id.to_string()));
                resolved.push(ResolvedCaptcha {
                    captcha_id: captcha.captcha_id.clone(),
                    solution,
                    votes,
                    sample,
                });
            }
            other => {
                tracing::trace!(
                    captcha_id = %captcha.captcha_id,
                    verdict = ?other,
                    "Captcha left unsolved"
                );
            }
        }
    }

    counted.sort();
    counted.dedup();

    let content_changed = !resolved.is_empty() && refresh_content_id(&mut updated);

    ConsensusOutcome {
        dataset: updated,
        resolved,
        counted_commitments: counted,
        reference_block,
        content_changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptchaCount, CaptchaThresholds};
    use crate::dataset::ingest;
    use crate::testing::{commitment, raw_dataset};

    fn config(required: usize, pct: f64, recency: u64) -> CaptchaSolutionsConfig {
        CaptchaSolutionsConfig {
            required_number_of_solutions: required,
            solution_winning_percentage: pct,
            captcha_block_recency: recency,
        }
    }

    fn solutions(answers: &[&[&str]]) -> Vec<CaptchaSolution> {
        answers
            .iter()
            .map(|items| CaptchaSolution::new(items.iter().copied()))
            .collect()
    }

    /// One solved and one unsolved captcha
    fn dataset() -> Dataset {
        let thresholds = CaptchaThresholds {
            solved: CaptchaCount { count: 1 },
            unsolved: CaptchaCount { count: 1 },
        };
        ingest(raw_dataset(1, 1), &thresholds).unwrap()
    }

    fn votes(dataset: &Dataset, answers: &[&[&str]]) -> Vec<CommitmentRecord> {
        let unsolved = &dataset.captchas[1].captcha_id;
        answers
            .iter()
            .enumerate()
            .map(|(i, items)| {
                commitment(
                    &format!("c{i}"),
                    &dataset.dataset_id,
                    &[(unsolved.as_str(), *items)],
                    100,
                )
            })
            .collect()
    }

    #[test]
    fn test_tally_sixty_percent_majority() {
        let answers = solutions(&[&["a"], &["a"], &["a"], &["b"], &["b"]]);
        let verdict = tally(&answers, &config(2, 60.0, 10));
        assert_eq!(
            verdict,
            Verdict::Solved {
                solution: CaptchaSolution::new(["a"]),
                votes: 3,
                sample: 5
            }
        );
    }

    #[test]
    fn test_tally_split_vote_stays_unsolved() {
        let answers = solutions(&[&["a"], &["a"], &["b"], &["b"], &["c"]]);
        let verdict = tally(&answers, &config(2, 60.0, 10));
        assert!(matches!(verdict, Verdict::Tied { votes: 2, sample: 5 }));
    }

    #[test]
    fn test_tally_below_threshold() {
        let answers = solutions(&[&["a"], &["a"], &["b"], &["c"]]);
        let verdict = tally(&answers, &config(2, 60.0, 10));
        assert_eq!(verdict, Verdict::NoMajority { votes: 2, sample: 4 });
    }

    #[test]
    fn test_tally_minimum_sample() {
        let answers = solutions(&[&["a"]]);
        assert_eq!(
            tally(&answers, &config(2, 50.0, 10)),
            Verdict::InsufficientSample { sample: 1 }
        );
    }

    #[test]
    fn test_tally_tie_at_low_threshold() {
        let answers = solutions(&[&["a"], &["a"], &["b"], &["b"]]);
        let verdict = tally(&answers, &config(2, 50.0, 10));
        assert!(matches!(verdict, Verdict::Tied { .. }));
    }

    #[test]
    fn test_tally_ignores_selection_order() {
        let answers = solutions(&[&["a", "b"], &["b", "a"], &["b", "a", "a"]]);
        let verdict = tally(&answers, &config(3, 100.0, 10));
        assert!(matches!(verdict, Verdict::Solved { votes: 3, .. }));
    }

    #[test]
    fn test_recalculate_resolves_and_changes_content_id() {
        let dataset = dataset();
        let commitments = votes(&dataset, &[&["a"], &["a"], &["a"], &["b"], &["b"]]);

        let outcome = recalculate(&dataset, &commitments, &config(2, 60.0, 10), None);

        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].captcha_id, dataset.captchas[1].captcha_id);
        assert_eq!(
            outcome.dataset.captchas[1].solution,
            Some(CaptchaSolution::new(["a"]))
        );
        assert_eq!(outcome.dataset.dataset_id, dataset.dataset_id);
        assert_ne!(outcome.dataset.dataset_content_id, dataset.dataset_content_id);
        assert!(outcome.content_changed);
        assert_eq!(outcome.counted_commitments, vec!["c0", "c1", "c2", "c3", "c4"]);
        assert_eq!(outcome.reference_block, Some(100));
    }

    #[test]
    fn test_recalculate_without_majority_changes_nothing() {
        let dataset = dataset();
        let commitments = votes(&dataset, &[&["a"], &["a"], &["b"], &["b"], &["c"]]);

        let outcome = recalculate(&dataset, &commitments, &config(2, 60.0, 10), None);

        assert!(outcome.resolved.is_empty());
        assert!(outcome.counted_commitments.is_empty());
        assert!(!outcome.content_changed);
        assert_eq!(outcome.dataset, dataset);
    }

    #[test]
    fn test_recalculate_single_commitment_stays_unsolved() {
        let dataset = dataset();
        let commitments = votes(&dataset, &[&["a"]]);
        let outcome = recalculate(&dataset, &commitments, &config(2, 60.0, 10), None);
        assert!(outcome.resolved.is_empty());
    }

    #[test]
    fn test_recalculate_skips_stale_commitments() {
        let dataset = dataset();
        let mut commitments = votes(&dataset, &[&["a"], &["a"], &["b"], &["b"], &["b"]]);
        // The three "b" votes are older than the window
        for c in commitments.iter_mut().skip(2) {
            c.requested_at_block = 50;
        }

        let outcome = recalculate(&dataset, &commitments, &config(2, 60.0, 10), None);
        assert_eq!(
            outcome.dataset.captchas[1].solution,
            Some(CaptchaSolution::new(["a"]))
        );
        assert_eq!(outcome.counted_commitments, vec!["c0", "c1"]);

        // An explicit reference far in the future excludes everything
        let outcome =
            recalculate(&dataset, &commitments, &config(2, 60.0, 10), Some(1_000));
        assert!(outcome.resolved.is_empty());
    }

    #[test]
    fn test_recalculate_ignores_disapproved_and_duplicates() {
        let dataset = dataset();
        let mut commitments = votes(&dataset, &[&["a"], &["b"], &["b"], &["b"]]);
        commitments[1].status = CommitmentStatus::Disapproved;
        commitments[2].status = CommitmentStatus::Disapproved;
        // Same commitment delivered twice
        commitments.push(commitments[0].clone());

        // Counting either the duplicate or the disapproved votes would resolve it
        let outcome = recalculate(&dataset, &commitments, &config(2, 60.0, 10), None);
        assert!(outcome.resolved.is_empty());

        let outcome = recalculate(&dataset, &commitments, &config(2, 50.0, 10), None);
        assert!(outcome.resolved.is_empty());
    }

    #[test]
    fn test_recalculate_ignores_other_datasets_and_solved_captchas() {
        let dataset = dataset();
        let solved_id = dataset.captchas[0].captcha_id.as_str();
        let unsolved_id = dataset.captchas[1].captcha_id.as_str();
        let d: &[&str] = &["d"];
        let b: &[&str] = &["b"];

        let mut commitments = Vec::new();
        for i in 0..3 {
            let other = commitment(&format!("x{i}"), "other-dataset", &[(unsolved_id, d)], 100);
            let solved = commitment(&format!("s{i}"), &dataset.dataset_id, &[(solved_id, b)], 100);
            commitments.push(other);
            commitments.push(solved);
        }

        let outcome = recalculate(&dataset, &commitments, &config(2, 60.0, 10), None);
        assert!(outcome.resolved.is_empty());
        assert_eq!(outcome.dataset.captchas[0].solution, dataset.captchas[0].solution);
    }
}
