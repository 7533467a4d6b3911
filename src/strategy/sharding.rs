//! Construction of the base shard from the full test list.

use serde::{Deserialize, Serialize};

use crate::test::{Test, TestShard};

/// How the full test list becomes a pool's shard.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ShardingStrategy {
    /// Every pool runs every test once.
    #[default]
    Parallel,

    /// Every pool runs every test `count` times.
    Count { count: usize },
}

impl ShardingStrategy {
    pub fn create_shard(&self, tests: Vec<Test>) -> TestShard {
        match self {
            ShardingStrategy::Parallel => TestShard::new(tests),
            ShardingStrategy::Count { count } => {
                let repeated = (0..(*count).max(1))
                    .flat_map(|_| tests.iter().cloned())
                    .collect();
                TestShard::new(repeated)
            }
        }
    }
}
