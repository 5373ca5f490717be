//! Dataset validation, fingerprinting and ingestion.
//!
//! Fingerprints are `0x`-prefixed SHA-256 digests over length-prefixed parts:
//! - `captcha_id`: target, salt and items (never the solution)
//! - `dataset_id`: format plus captcha ids in order
//! - `dataset_content_id`: format plus each captcha id and its solution
//!
//! Resolving a captcha therefore moves `dataset_content_id` and leaves
//! `dataset_id` alone.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tally_common::{
    Captcha, CaptchaCategory, CaptchaFormat, CaptchaSolution, Dataset, RawCaptcha, RawDataset,
    TallyError,
};

use crate::config::CaptchaThresholds;
use crate::store::CommitmentStore;

const SOLVED_MARKER: &[u8] = b"solved";
const UNSOLVED_MARKER: &[u8] = b"unsolved";

/// Incremental digest over length-prefixed parts
struct Fingerprint(Sha256);

impl Fingerprint {
    fn new() -> Self {
        Self(Sha256::new())
    }

    fn part(mut self, bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        self.0.update((bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    fn finish(self) -> String {
        format!("0x{}", hex::encode(self.0.finalize()))
    }
}

fn format_tag(format: CaptchaFormat) -> &'static str {
    match format {
        CaptchaFormat::SelectAll => "SelectAll",
    }
}

/// Structural identity of a captcha
pub fn captcha_id(raw: &RawCaptcha) -> String {
    let mut fp = Fingerprint::new().part(&raw.target).part(&raw.salt);
    for item in &raw.items {
        fp = fp.part(&item.id).part(&item.data);
    }
    fp.finish()
}

pub fn dataset_id(format: CaptchaFormat, captchas: &[Captcha]) -> String {
    captchas
        .iter()
        .fold(Fingerprint::new().part(format_tag(format)), |fp, c| {
            fp.part(&c.captcha_id)
        })
        .finish()
}

pub fn dataset_content_id(format: CaptchaFormat, captchas: &[Captcha]) -> String {
    let mut fp = Fingerprint::new().part(format_tag(format));
    for captcha in captchas {
        fp = fp.part(&captcha.captcha_id);
        fp = match &captcha.solution {
            Some(solution) => solution
                .items()
                .iter()
                .fold(fp.part(SOLVED_MARKER), |fp, item| fp.part(item)),
            None => fp.part(UNSOLVED_MARKER),
        };
    }
    fp.finish()
}

/// Recompute `dataset_content_id` after solutions changed. Returns true if it moved.
pub fn refresh_content_id(dataset: &mut Dataset) -> bool {
    let content_id = dataset_content_id(dataset.format, &dataset.captchas);
    if content_id == dataset.dataset_content_id {
        return false;
    }
    dataset.dataset_content_id = content_id;
    true
}

/// Validate a raw dataset against the thresholds and fingerprint it
pub fn ingest(raw: RawDataset, thresholds: &CaptchaThresholds) -> Result<Dataset, TallyError> {
    if raw.captchas.is_empty() {
        return Err(TallyError::InvalidDataset("dataset has no captchas".into()));
    }

    let mut seen = HashSet::new();
    let mut captchas = Vec::with_capacity(raw.captchas.len());

    for (index, raw_captcha) in raw.captchas.into_iter().enumerate() {
        let captcha = build_captcha(index, raw_captcha)?;
        if !seen.insert(captcha.captcha_id.clone()) {
            return Err(TallyError::InvalidDataset(format!(
                "captcha {index} duplicates {}",
                captcha.captcha_id
            )));
        }
        captchas.push(captcha);
    }

    let dataset = Dataset {
        dataset_id: dataset_id(raw.format, &captchas),
        dataset_content_id: dataset_content_id(raw.format, &captchas),
        format: raw.format,
        captchas,
    };

    check_threshold(&dataset, CaptchaCategory::Solved, thresholds.solved.count)?;
    check_threshold(&dataset, CaptchaCategory::Unsolved, thresholds.unsolved.count)?;

    Ok(dataset)
}

fn build_captcha(index: usize, raw: RawCaptcha) -> Result<Captcha, TallyError> {
    if raw.items.is_empty() {
        return Err(TallyError::InvalidDataset(format!("captcha {index} has no items")));
    }

    let mut item_ids = HashSet::new();
    for item in &raw.items {
        if !item_ids.insert(item.id.as_str()) {
            return Err(TallyError::InvalidDataset(format!(
                "captcha {index} repeats item {}",
                item.id
            )));
        }
    }

    if let Some(solution) = &raw.solution {
        if let Some(unknown) = solution.iter().find(|id| !item_ids.contains(id.as_str())) {
            return Err(TallyError::InvalidDataset(format!(
                "captcha {index} solution references unknown item {unknown}"
            )));
        }
    }

    let captcha_id = captcha_id(&raw);
    Ok(Captcha {
        captcha_id,
        target: raw.target,
        items: raw.items,
        salt: raw.salt,
        solution: raw.solution.map(CaptchaSolution::new),
    })
}

fn check_threshold(
    dataset: &Dataset,
    category: CaptchaCategory,
    required: usize,
) -> Result<(), TallyError> {
    let found = dataset.count(category);
    if found < required {
        return Err(TallyError::DatasetValidation {
            category,
            required,
            found,
        });
    }
    Ok(())
}

/// Loads raw datasets and makes them the provider dataset
pub struct DatasetManager {
    store: Arc<dyn CommitmentStore>,
    thresholds: CaptchaThresholds,
}

impl DatasetManager {
    pub fn new(store: Arc<dyn CommitmentStore>, thresholds: CaptchaThresholds) -> Self {
        Self { store, thresholds }
    }

    /// Ingest and store. Nothing is written if validation fails.
    pub async fn set_dataset(&self, raw: RawDataset) -> Result<Dataset, TallyError> {
        let dataset = ingest(raw, &self.thresholds)?;
        self.store.store_dataset(&dataset).await?;

        tracing::info!(
            dataset_id = %dataset.dataset_id,
            dataset_content_id = %dataset.dataset_content_id,
            solved = dataset.count(CaptchaCategory::Solved),
            unsolved = dataset.count(CaptchaCategory::Unsolved),
            "Dataset stored"
        );
        Ok(dataset)
    }

    /// Read a JSON dataset file, then [`Self::set_dataset`]
    pub async fn set_dataset_from_file(&self, path: &Path) -> Result<Dataset, TallyError> {
        let contents = tokio::fs::read(path).await.map_err(|e| {
            TallyError::InvalidDataset(format!("cannot read {}: {e}", path.display()))
        })?;
        let raw: RawDataset = serde_json::from_slice(&contents).map_err(|e| {
            TallyError::InvalidDataset(format!("cannot parse {}: {e}", path.display()))
        })?;
        self.set_dataset(raw).await
    }

    pub async fn current(&self) -> Result<Option<Dataset>, TallyError> {
        self.store.get_dataset().await
    }
}
