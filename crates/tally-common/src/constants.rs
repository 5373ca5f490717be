//! Shared constants for Tally components.

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default ops HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9229";

/// Minimum distinct commitments before a captcha solution is accepted
pub const DEFAULT_REQUIRED_NUMBER_OF_SOLUTIONS: usize = 3;

/// Share of the qualifying sample the leading answer must hold (percent)
pub const DEFAULT_SOLUTION_WINNING_PERCENTAGE: f64 = 80.0;

/// Number of most recent blocks whose commitments take part in consensus
pub const DEFAULT_CAPTCHA_BLOCK_RECENCY: u64 = 10;

/// Solution recalculation interval (1 hour)
pub const DEFAULT_RECALCULATE_INTERVAL_SECS: u64 = 3600;

/// Commitment export interval (5 minutes)
pub const DEFAULT_EXPORT_INTERVAL_SECS: u64 = 300;

/// Watermark used when a task has never completed
pub const WATERMARK_ORIGIN: i64 = 0;

/// Separator between the fields of a PoW challenge string
pub const POW_CHALLENGE_SEPARATOR: &str = "___";

/// Redis key layout
pub mod redis_keys {
    /// Commitment hash: commitment:{id}
    pub const COMMITMENT_PREFIX: &str = "commitment:";

    /// Set of commitment ids not yet exported
    pub const UNSTORED_COMMITMENTS: &str = "tally:commitments:unstored";

    /// Set of commitment ids per dataset: dataset:commitments:{dataset_id}
    pub const DATASET_COMMITMENTS_PREFIX: &str = "dataset:commitments:";

    /// PoW commitment: pow:{challenge}
    pub const POW_PREFIX: &str = "pow:";

    /// Set of PoW challenges not yet exported
    pub const UNSTORED_POW: &str = "tally:pow:unstored";

    /// Scheduled task record: task:{id}
    pub const TASK_PREFIX: &str = "task:";

    /// Task history sorted by start time: task:history:{name}
    pub const TASK_HISTORY_PREFIX: &str = "task:history:";

    /// Id of the Running record for a task: task:running:{name}
    pub const TASK_RUNNING_PREFIX: &str = "task:running:";

    /// Id of the newest record per task and status: task:last:{name}:{status}
    pub const TASK_LAST_PREFIX: &str = "task:last:";

    /// Current provider dataset
    pub const DATASET: &str = "tally:dataset";

    /// Exported commitments at the sink: export:commitment:{id}
    pub const EXPORT_COMMITMENT_PREFIX: &str = "export:commitment:";

    /// Exported PoW commitments at the sink: export:pow:{challenge}
    pub const EXPORT_POW_PREFIX: &str = "export:pow:";
}
