// Domain models: pools, device trees, usage and iostat tables

mod iostat;
mod pool;
mod snapshot;
mod usage;

pub use iostat::{IostatEntry, IostatRow, IostatTable};
pub use pool::{Dev, Pool, legal_pool_name};
pub use snapshot::Snapshot;
pub use usage::PoolUsage;
