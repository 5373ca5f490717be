//! Core types shared across Tally components.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::POW_CHALLENGE_SEPARATOR;
use crate::error::TallyError;

/// Recurring tasks run by the provider.
///
/// Each name owns its own single-flight lock and watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskName {
    /// Majority-vote recalculation of unsolved captchas
    RecalculateSolutions,
    /// Export of unstored commitments to the external sink
    StoreCommitmentsExternal,
}

impl TaskName {
    pub const ALL: [TaskName; 2] = [Self::RecalculateSolutions, Self::StoreCommitmentsExternal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecalculateSolutions => "RecalculateSolutions",
            Self::StoreCommitmentsExternal => "StoreCommitmentsExternal",
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskName {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TallyError::InvalidInput(format!("unknown task name: {s}")))
    }
}

/// Status of a single scheduled task run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    /// Completed and Failed records are final
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Running, Self::Completed, Self::Failed]
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TallyError::StoreRead(format!("unknown task status: {s}")))
    }
}

/// One run of a scheduled task. Append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTaskRecord {
    /// Unique run identifier
    pub id: String,

    pub task_name: TaskName,

    pub status: TaskStatus,

    /// Run start (Unix epoch milliseconds)
    pub started: i64,

    /// Last status transition (Unix epoch milliseconds)
    pub updated: i64,

    /// Result or error summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ScheduledTaskRecord {
    pub fn running(id: String, task_name: TaskName, now: i64) -> Self {
        Self {
            id,
            task_name,
            status: TaskStatus::Running,
            started: now,
            updated: now,
            data: None,
        }
    }
}

/// Review status of a user commitment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitmentStatus {
    /// Awaiting verification
    #[default]
    Pending,
    /// User answered the known-solution captchas correctly
    Approved,
    /// User failed the known-solution captchas
    Disapproved,
}

/// A captcha answer: the set of selected item ids.
///
/// Stored sorted and de-duplicated so that two users selecting the same items
/// in a different order vote for the same answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct CaptchaSolution(Vec<String>);

impl CaptchaSolution {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut items: Vec<String> = items.into_iter().map(Into::into).collect();
        items.sort();
        items.dedup();
        Self(items)
    }

    pub fn items(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for CaptchaSolution {
    fn from(items: Vec<String>) -> Self {
        Self::new(items)
    }
}

impl From<CaptchaSolution> for Vec<String> {
    fn from(solution: CaptchaSolution) -> Self {
        solution.0
    }
}

/// A user's answer to one captcha inside a commitment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptchaAnswer {
    pub captcha_id: String,
    pub solution: CaptchaSolution,
}

/// Human-solved commitment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitmentRecord {
    /// Unique commitment identifier
    pub id: String,

    /// Account of the user who solved the captchas
    pub user: String,

    /// Account of the dapp the user was accessing
    pub dapp: String,

    /// Dataset the captchas were served from
    pub dataset_id: String,

    /// Submitted answers
    pub captchas: Vec<CaptchaAnswer>,

    #[serde(default)]
    pub status: CommitmentStatus,

    /// Answers have taken part in a solution recalculation
    #[serde(default)]
    pub resolved: bool,

    /// Ledger height the captchas were requested at
    pub requested_at_block: u64,

    /// Unix epoch milliseconds, non-decreasing
    pub last_updated_timestamp: i64,

    /// Exported to the external sink
    #[serde(default)]
    pub stored: bool,
}

impl CommitmentRecord {
    /// The solution this commitment submitted for a captcha, if any
    pub fn answer_for(&self, captcha_id: &str) -> Option<&CaptchaSolution> {
        self.captchas
            .iter()
            .find(|answer| answer.captcha_id == captcha_id)
            .map(|answer| &answer.solution)
    }
}

/// Parsed form of a PoW challenge string: `{timestamp}___{user}___{dapp}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoWChallenge {
    pub timestamp: i64,
    pub user: String,
    pub dapp: String,
}

impl fmt::Display for PoWChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.timestamp,
            self.user,
            self.dapp,
            sep = POW_CHALLENGE_SEPARATOR
        )
    }
}

impl FromStr for PoWChallenge {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TallyError::InvalidInput(format!("malformed PoW challenge: {s}"));

        let mut parts = s.split(POW_CHALLENGE_SEPARATOR);
        let (Some(timestamp), Some(user), Some(dapp), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        if user.is_empty() || dapp.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            timestamp: timestamp.parse().map_err(|_| invalid())?,
            user: user.to_string(),
            dapp: dapp.to_string(),
        })
    }
}

/// Proof-of-work commitment. Exported as-is, never resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoWCommitmentRecord {
    /// Challenge string, also the record identity
    pub challenge: String,

    /// Required leading-zero difficulty
    pub difficulty: u32,

    /// The submitted nonce was verified
    #[serde(default)]
    pub checked: bool,

    /// Unix epoch milliseconds, non-decreasing
    pub last_updated_timestamp: i64,

    /// Exported to the external sink
    #[serde(default)]
    pub stored: bool,
}

impl PoWCommitmentRecord {
    pub fn new(challenge: &PoWChallenge, difficulty: u32, now: i64) -> Self {
        Self {
            challenge: challenge.to_string(),
            difficulty,
            checked: false,
            last_updated_timestamp: now,
            stored: false,
        }
    }

    pub fn parse_challenge(&self) -> Result<PoWChallenge, TallyError> {
        self.challenge.parse()
    }
}

/// Dataset captcha format descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptchaFormat {
    /// Select every item matching the target
    #[default]
    SelectAll,
}

/// Whether a captcha has a known solution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptchaCategory {
    Solved,
    Unsolved,
}

impl fmt::Display for CaptchaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Solved => f.write_str("solved"),
            Self::Unsolved => f.write_str("unsolved"),
        }
    }
}

/// A selectable captcha item (image hash, URL or text)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaItem {
    pub id: String,
    pub data: String,
}

/// Captcha as it appears in a raw dataset file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCaptcha {
    pub target: String,
    pub items: Vec<CaptchaItem>,
    #[serde(default)]
    pub salt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<Vec<String>>,
}

/// Dataset as it appears in a raw dataset file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDataset {
    #[serde(default)]
    pub format: CaptchaFormat,
    pub captchas: Vec<RawCaptcha>,
}

/// Captcha with its structural identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Captcha {
    /// Fingerprint of target, items and salt (excludes the solution)
    pub captcha_id: String,
    pub target: String,
    pub items: Vec<CaptchaItem>,
    pub salt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<CaptchaSolution>,
}

impl Captcha {
    pub fn category(&self) -> CaptchaCategory {
        if self.solution.is_some() {
            CaptchaCategory::Solved
        } else {
            CaptchaCategory::Unsolved
        }
    }
}

/// Provider dataset with structure and content fingerprints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Fingerprint of captcha identities and order
    pub dataset_id: String,

    /// Fingerprint of identities plus current solutions
    pub dataset_content_id: String,

    pub format: CaptchaFormat,

    pub captchas: Vec<Captcha>,
}

impl Dataset {
    pub fn count(&self, category: CaptchaCategory) -> usize {
        self.captchas
            .iter()
            .filter(|captcha| captcha.category() == category)
            .count()
    }
}
