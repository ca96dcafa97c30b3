//! A/B Test Executor - Recipient splitting, variant tracking, winner selection

mod executor;
mod split;

pub use executor::{AbTestError, AbTestExecutor, AbTestResults, QueueAbTestOptions, VariantResult};
pub use split::{split_recipients, SplitPlan};
