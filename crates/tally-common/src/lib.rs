//! # Tally Common
//!
//! Shared types, errors, and constants used across Tally components.
//!
//! ## Modules
//! - `types` - Records (commitments, scheduled tasks, datasets)
//! - `error` - Common error type
//! - `constants` - Shared defaults and Redis key layout

pub mod constants;
pub mod error;
pub mod types;

pub use error::TallyError;
pub use types::*;
