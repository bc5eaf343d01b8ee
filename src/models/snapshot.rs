// Shared snapshot of the latest parsed pool state

use std::collections::BTreeMap;

use super::{IostatTable, Pool, PoolUsage};

/// The most recent parse results, shared between the watcher loop and
/// the web view under a single read-write lock.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub pools: Vec<Pool>,
    pub usage: BTreeMap<String, PoolUsage>,
    pub iostat: Option<IostatTable>,
}
