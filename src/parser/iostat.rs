// Parser for the continuously updating `zpool iostat -v` table stream

use std::sync::{Arc, RwLock};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;

use crate::models::{IostatEntry, IostatRow, IostatTable, Snapshot};

use super::nicenum::decode;

fn parse_row(line: &str) -> Option<IostatRow> {
    let f: Vec<&str> = line.split_whitespace().collect();
    if f.len() != 7 {
        return None;
    }
    Some(IostatRow {
        dev: f[0].to_string(),
        capacity_alloc: decode(f[1]),
        capacity_free: decode(f[2]),
        operations_read: decode(f[3]),
        operations_write: decode(f[4]),
        bandwidth_read: decode(f[5]),
        bandwidth_write: decode(f[6]),
    })
}

#[derive(PartialEq)]
enum RowState {
    Start,
    Pool,
    Dev,
}

/// Parses one iostat interval: pools framed by `----` separator rows,
/// the first row of each frame naming the pool. Returns `None` when a
/// row does not have the expected seven columns.
pub fn parse_table(input: &str) -> Option<IostatTable> {
    let mut table = IostatTable::new();
    let mut current = String::new();
    let mut state = RowState::Start;

    for row in input.split('\n') {
        if row.is_empty() {
            break;
        }
        if row.starts_with('-') {
            state = RowState::Pool;
            continue;
        }
        match state {
            RowState::Start => {} // header rows before the first separator
            RowState::Pool => {
                let parsed = parse_row(row)?;
                current = parsed.dev.clone();
                let mut entry = IostatEntry::new();
                entry.insert(parsed.dev.clone(), parsed);
                table.insert(current.clone(), entry);
                state = RowState::Dev;
            }
            RowState::Dev => {
                let parsed = parse_row(row)?;
                table.get_mut(&current)?.insert(parsed.dev.clone(), parsed);
            }
        }
    }
    Some(table)
}

/// Reads the iostat subprocess stream: intervals are separated by a
/// blank line; each complete interval replaces the table in the shared
/// snapshot.
pub async fn run_stream(out: ChildStdout, snapshot: Arc<RwLock<Snapshot>>) {
    let mut lines = BufReader::new(out).lines();
    let mut chunk = String::new();

    while let Ok(Some(line)) = lines.next_line().await {
        if !line.is_empty() {
            chunk.push_str(&line);
            chunk.push('\n');
            continue;
        }
        if chunk.is_empty() {
            continue;
        }
        match parse_table(&chunk) {
            Some(table) => match snapshot.write() {
                Ok(mut s) => s.iostat = Some(table),
                Err(e) => tracing::error!("snapshot lock poisoned: {}", e),
            },
            None => tracing::warn!("unparseable iostat entry, skipping"),
        }
        chunk.clear();
    }
    tracing::debug!("iostat stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = concat!(
        "                             capacity     operations    bandwidth\n",
        "pool                      alloc   free   read  write   read  write\n",
        "------------------------  -----  -----  -----  -----  -----  -----\n",
        "tank                      1.72T  8.03T     18     72   303K  6.43M\n",
        "  raidz2                   586G  2.68T      7     24   102K  2.14M\n",
        "    sdi                       -      -      2      7  16.8K   550K\n",
        "------------------------  -----  -----  -----  -----  -----  -----\n",
        "vmstore                   17.5G  50.5G      0      0     14      1\n",
        "  scsi-3500000e0158fea80  17.5G  50.5G      0      0     14      1\n",
        "------------------------  -----  -----  -----  -----  -----  -----\n",
    );

    #[test]
    fn parses_pools_framed_by_separators() {
        let table = parse_table(SAMPLE).unwrap();
        assert_eq!(table.len(), 2);
        let tank = &table["tank"];
        assert_eq!(tank.len(), 3);
        assert_eq!(tank["tank"].operations_read, 18);
        assert_eq!(tank["sdi"].capacity_alloc, -1);
        assert_eq!(tank["sdi"].bandwidth_write, (550.0 * 1024.0) as i64);
        let vmstore = &table["vmstore"];
        assert!(vmstore.contains_key("scsi-3500000e0158fea80"));
    }

    #[test]
    fn wrong_column_count_fails_the_whole_table() {
        let input = "----\ntank 1 2 3\n";
        assert!(parse_table(input).is_none());
    }
}
