// Pool disk usage model

use serde::Serialize;

/// Space accounting for one pool. Byte counts are -1 when unreported.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolUsage {
    pub name: String,
    pub avail: i64,
    pub used: i64,
    pub usedsnap: i64,
    pub usedds: i64,
    pub usedrefreserv: i64,
    pub usedchild: i64,
    pub refer: i64,
    pub mountpoint: String,
}

impl PoolUsage {
    // Integer percentages, computed one way everywhere so that threshold
    // comparisons stay consistent.
    pub fn used_percent(&self) -> i64 {
        (self.used as f64 * 100.0 / (self.avail + self.used) as f64 + 0.5) as i64
    }

    pub fn avail_percent(&self) -> i64 {
        (self.avail as f64 * 100.0 / (self.avail + self.used) as f64 + 0.5) as i64
    }
}
