// Parsers for the pool management commands' textual output

pub mod iostat;
pub mod list;
pub mod nicenum;
pub mod status;

pub use list::{parse_list, parse_list_notified};
pub use status::{StatusError, parse_status, parse_status_notified};
