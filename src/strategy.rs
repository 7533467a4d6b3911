//! Policy layer: what runs next, how it is grouped, and whether a failure
//! runs again.
//!
//! Every strategy is a closed enum deserialized from the `[strategies]`
//! section of the configuration:
//!
//! ```toml
//! [strategies.pooling]
//! type = "operating-system"
//!
//! [strategies.batching]
//! type = "fixed-size"
//! size = 5
//!
//! [strategies.retry]
//! type = "fixed-quota"
//! retry_per_test_quota = 2
//! ```

pub mod batching;
pub mod flakiness;
pub mod pooling;
pub mod retry;
pub mod sharding;
pub mod sorting;

pub use batching::BatchingStrategy;
pub use flakiness::FlakinessStrategy;
pub use pooling::PoolingStrategy;
pub use retry::{RetryBudget, RetryPolicy, RetryStrategy, TestMatcher, TestMatcherConfig};
pub use sharding::ShardingStrategy;
pub use sorting::{Rank, SortingStrategy};
