// I/O statistics table model

use std::collections::BTreeMap;

use serde::Serialize;

/// One row of `zpool iostat -v` output, nicenum-decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IostatRow {
    pub dev: String,
    pub capacity_alloc: i64,
    pub capacity_free: i64,
    pub operations_read: i64,
    pub operations_write: i64,
    pub bandwidth_read: i64,
    pub bandwidth_write: i64,
}

/// Rows of one pool, keyed by device name (the pool itself included).
pub type IostatEntry = BTreeMap<String, IostatRow>;

/// All pools of one iostat interval, keyed by pool name.
pub type IostatTable = BTreeMap<String, IostatEntry>;
