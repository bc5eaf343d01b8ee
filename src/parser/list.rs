// Usage parser for the tab-separated `zfs list -H` dump

use std::collections::BTreeMap;

use crate::models::PoolUsage;
use crate::notifier::{Notifier, Severity};

use super::nicenum::decode;

#[derive(Debug)]
pub struct ListOutput {
    pub usage: BTreeMap<String, PoolUsage>,
    /// Lines that did not have exactly nine fields, with their numbers.
    pub bad_lines: Vec<(usize, String)>,
}

/// Parses `zfs list -H -o name,avail,used,usedsnap,usedds,usedrefreserv,
/// usedchild,refer,mountpoint` output: one pool per line, nine
/// tab-separated fields, no header.
pub fn parse_list(input: &str) -> ListOutput {
    let mut usage = BTreeMap::new();
    let mut bad_lines = Vec::new();

    for (idx, line) in input.split('\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let f: Vec<&str> = line.split('\t').collect();
        if f.len() != 9 {
            bad_lines.push((idx + 1, line.to_string()));
            continue;
        }
        usage.insert(
            f[0].to_string(),
            PoolUsage {
                name: f[0].to_string(),
                avail: decode(f[1]),
                used: decode(f[2]),
                usedsnap: decode(f[3]),
                usedds: decode(f[4]),
                usedrefreserv: decode(f[5]),
                usedchild: decode(f[6]),
                refer: decode(f[7]),
                mountpoint: f[8].to_string(),
            },
        );
    }
    ListOutput { usage, bad_lines }
}

/// Runs the usage parser and reports malformed lines at CRIT with the
/// full dump attached; those lines are skipped, the rest is returned.
pub async fn parse_list_notified(
    notify: &Notifier,
    output: &str,
) -> anyhow::Result<BTreeMap<String, PoolUsage>> {
    let parsed = parse_list(output);
    for (lineno, line) in &parsed.bad_lines {
        notify
            .send(
                Severity::Crit,
                format!("invalid line {lineno} in ZFS usage output: {line}"),
            )
            .await?;
        notify.attach(Severity::Crit, output.to_string()).await?;
    }
    Ok(parsed.usage)
}
