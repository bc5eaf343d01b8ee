// Status parser: a single forward pass over `zpool status` output with
// an explicit state variable, plus the indented device-tree parser for
// the config block.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use anyhow::bail;

use crate::models::{Dev, Pool};
use crate::notifier::{Notifier, Severity};

use super::nicenum;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Start,
    Pool,
    State,
    Status,
    Action,
    See,
    Scan,
    Config,
    Errors,
}

/// Fatal status-parse failures. Per-pool device-tree problems are soft
/// and reported separately in [`StatusOutput::soft_errors`].
#[derive(Debug)]
pub enum StatusError {
    InvalidLine { lineno: usize, line: String },
    Panic { detail: String },
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusError::InvalidLine { lineno, line } => {
                write!(f, "invalid line {lineno} in status output: {line}")
            }
            StatusError::Panic { detail } => {
                write!(f, "panic parsing status output: {detail}")
            }
        }
    }
}

impl std::error::Error for StatusError {}

/// A device tree that could not be recovered for one pool.
#[derive(Debug, PartialEq)]
pub struct ConfigError {
    pub detail: String,
    pub config_text: String,
}

#[derive(Debug)]
pub struct StatusOutput {
    pub pools: Vec<Pool>,
    pub soft_errors: Vec<ConfigError>,
}

/// Parses the full `zpool status` text. Any panic inside the parser is
/// caught and converted into a parse failure so that unexpected command
/// output can never take the daemon down.
pub fn parse_status(input: &str) -> Result<StatusOutput, StatusError> {
    match catch_unwind(AssertUnwindSafe(|| parse_status_inner(input))) {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(StatusError::Panic { detail })
        }
    }
}

fn parse_status_inner(input: &str) -> Result<StatusOutput, StatusError> {
    let mut pools = Vec::new();
    let mut soft_errors = Vec::new();
    let mut cur: Option<Pool> = None;
    let mut confstr = String::new();
    let mut raw = String::new();
    let mut state = ParserState::Start;

    // The state machine asserts that a current pool exists outside the
    // Start state; a violation is a parser bug caught by the panic guard.
    macro_rules! pool {
        () => {
            cur.as_mut().expect("no current pool")
        };
    }

    use ParserState as S;
    for (idx, line) in input.split('\n').enumerate() {
        raw.push_str(line);
        raw.push('\n');

        if state == S::Start && line == "no pools available" {
            return Ok(StatusOutput { pools, soft_errors });
        } else if state == S::Start && line.is_empty() {
            // blank separator between pools, or a trailing newline
        } else if state == S::Start && let Some(name) = line.strip_prefix("  pool: ") {
            cur = Some(Pool { name: name.to_string(), ..Pool::default() });
            state = S::Pool;
        } else if state == S::Pool && let Some(v) = line.strip_prefix(" state: ") {
            pool!().state = v.to_string();
            state = S::State;
        } else if state == S::State && let Some(v) = line.strip_prefix("status: ") {
            pool!().status = v.to_string();
            state = S::Status;
        } else if state == S::Status && let Some(cont) = line.strip_prefix('\t') {
            let p = pool!();
            p.status.push('\n');
            p.status.push_str(cont);
        } else if (state == S::Status || state == S::State)
            && let Some(v) = line.strip_prefix("action: ")
        {
            pool!().action = v.to_string();
            state = S::Action;
        } else if state == S::Action && let Some(cont) = line.strip_prefix('\t') {
            let p = pool!();
            p.action.push('\n');
            p.action.push_str(cont);
        } else if (state == S::State || state == S::Action)
            && let Some(v) = line.strip_prefix("   see: ")
        {
            pool!().see = v.to_string();
            state = S::See;
        } else if (state == S::State || state == S::Action || state == S::See)
            // " scan: " is the old prefix; "  scan: " appeared in a
            // later upstream release and is tolerated alongside it
            && let Some(v) = line
                .strip_prefix(" scan: ")
                .or_else(|| line.strip_prefix("  scan: "))
        {
            pool!().scan = v.to_string();
            state = S::Scan;
        } else if state == S::Scan && let Some(cont) = line.strip_prefix('\t') {
            let p = pool!();
            p.scan.push('\n');
            p.scan.push_str(cont);
        } else if state == S::Scan && let Some(cont) = line.strip_prefix("    ") {
            let p = pool!();
            p.scan.push('\n');
            p.scan.push_str(cont);
        } else if (state == S::Scan || state == S::State || state == S::Action || state == S::See)
            && let Some(rest) = line.strip_prefix("config:")
        {
            state = S::Config;
            if !rest.is_empty() {
                confstr.push_str(rest);
            }
        } else if state == S::Config && line.is_empty() {
            // skip
        } else if state == S::Config && let Some(cont) = line.strip_prefix('\t') {
            confstr.push('\n');
            confstr.push_str(cont);
        } else if state == S::Config && let Some(v) = line.strip_prefix("errors: ") {
            pool!().errors = v.to_string();
            state = S::Errors;
        } else if state == S::Errors && line.is_empty() {
            // end of this pool's section
            let mut done = cur.take().expect("no current pool");
            match parse_config(&confstr) {
                Ok(devs) => done.devs = devs,
                Err(detail) => soft_errors.push(ConfigError {
                    detail,
                    config_text: std::mem::take(&mut confstr),
                }),
            }
            confstr.clear();
            done.raw_text = std::mem::take(&mut raw);
            pools.push(done);
            state = S::Start;
        } else {
            return Err(StatusError::InvalidLine {
                lineno: idx + 1,
                line: line.to_string(),
            });
        }
    }
    Ok(StatusOutput { pools, soft_errors })
}

/// Parses the indented device tree of one config block. Two leading
/// spaces equal one level; missing counter columns become -1 instead of
/// refusing the line.
fn parse_config(confstr: &str) -> Result<Vec<Dev>, String> {
    if confstr.trim() == "The configuration cannot be determined." {
        return Err("configuration can not be determined".to_string());
    }

    let mut devs: Vec<Dev> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut prev_indent = 0usize;

    for line in confstr.split('\n') {
        if line.is_empty() {
            continue;
        }
        let trimmed = line.trim_start_matches(' ');
        let indent = (line.len() - trimmed.len()) / 2;
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() >= 5 && fields[..5] == ["NAME", "STATE", "READ", "WRITE", "CKSUM"] {
            continue;
        }

        let mut dev = Dev {
            name: fields[0].to_string(),
            state: String::new(),
            read: -1,
            write: -1,
            cksum: -1,
            rest: String::new(),
            sub_devs: Vec::new(),
            parent_dev: None,
        };
        if let Some(s) = fields.get(1) {
            dev.state = s.to_string();
        }
        if let Some(s) = fields.get(2) {
            dev.read = nicenum::decode(s);
        }
        if let Some(s) = fields.get(3) {
            dev.write = nicenum::decode(s);
        }
        if let Some(s) = fields.get(4) {
            dev.cksum = nicenum::decode(s);
        }
        if fields.len() > 5 {
            dev.rest = fields[5..].join(" ");
        }

        if indent == 0 {
            devs.push(dev);
            stack = vec![devs.len() - 1];
        } else {
            // same level pops one frame, a dedent pops one per level
            // plus one; deeper indentation pops nothing
            let pops = if indent > prev_indent { 0 } else { prev_indent - indent + 1 };
            stack.truncate(stack.len() - pops);
            let parent = *stack.last().expect("indent without parent");
            dev.parent_dev = Some(parent);
            devs.push(dev);
            let this = devs.len() - 1;
            devs[parent].sub_devs.push(this);
            stack.push(this);
        }
        prev_indent = indent;
    }
    Ok(devs)
}

/// Runs the status parser and routes its failure modes through the
/// notifier: fatal errors at CRIT with the full input attached, soft
/// device-tree errors at ERR with the config block attached.
pub async fn parse_status_notified(notify: &Notifier, output: &str) -> anyhow::Result<Vec<Pool>> {
    match parse_status(output) {
        Ok(parsed) => {
            for e in &parsed.soft_errors {
                notify
                    .send(
                        Severity::Err,
                        format!("device configuration parse error: {}", e.detail),
                    )
                    .await?;
                notify.attach(Severity::Err, e.config_text.clone()).await?;
            }
            Ok(parsed.pools)
        }
        Err(e) => {
            notify.send(Severity::Crit, e.to_string()).await?;
            notify.attach(Severity::Crit, output.to_string()).await?;
            bail!("status parser error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "  pool: tank\n state: ONLINE\nconfig:\n\n\tNAME STATE READ WRITE CKSUM\n\ttank ONLINE 0 0 0\n\t  sda ONLINE 0 0 0\n\nerrors: No known data errors\n\n";

    #[test]
    fn parses_a_minimal_pool_with_a_two_node_tree() {
        let out = parse_status(SIMPLE).unwrap();
        assert!(out.soft_errors.is_empty());
        assert_eq!(out.pools.len(), 1);
        let pool = &out.pools[0];
        assert_eq!(pool.name, "tank");
        assert_eq!(pool.state, "ONLINE");
        assert_eq!(pool.errors, "No known data errors");
        assert_eq!(pool.devs.len(), 2);
        assert_eq!(pool.devs[0].name, "tank");
        assert_eq!(pool.devs[0].sub_devs, vec![1]);
        assert_eq!(pool.devs[0].parent_dev, None);
        assert_eq!(pool.devs[1].name, "sda");
        assert_eq!(pool.devs[1].parent_dev, Some(0));
        assert!(pool.raw_text.starts_with("  pool: tank\n"));
        assert!(pool.raw_text.contains("errors: No known data errors"));
    }

    #[test]
    fn no_pools_available_yields_an_empty_list() {
        let out = parse_status("no pools available\n").unwrap();
        assert!(out.pools.is_empty());
    }

    #[test]
    fn unknown_lines_fail_with_their_line_number() {
        let input = "  pool: tank\nbogus line here\n";
        match parse_status(input) {
            Err(StatusError::InvalidLine { lineno, line }) => {
                assert_eq!(lineno, 2);
                assert_eq!(line, "bogus line here");
            }
            other => panic!("expected invalid line, got {other:?}"),
        }
    }

    #[test]
    fn full_section_with_status_action_see_scan() {
        let input = concat!(
            "  pool: tank\n",
            " state: DEGRADED\n",
            "status: One or more devices has been taken offline.\n",
            "\tSufficient replicas exist.\n",
            "action: Online the device using 'zpool online'.\n",
            "   see: http://zfsonlinux.org/msg/ZFS-8000-2Q\n",
            "  scan: resilvered 0 in 0h0m with 0 errors\n",
            "    on Mon Jan  6 11:22:33 2026\n",
            "config:\n",
            "\n",
            "\tNAME STATE READ WRITE CKSUM\n",
            "\ttank DEGRADED 0 0 0\n",
            "\t  mirror-0 DEGRADED 0 0 0\n",
            "\t    sda ONLINE 0 0 0\n",
            "\t    sdb OFFLINE 0 0 0\n",
            "\nerrors: No known data errors\n\n",
        );
        let out = parse_status(input).unwrap();
        let pool = &out.pools[0];
        assert_eq!(pool.state, "DEGRADED");
        assert!(pool.status.contains("Sufficient replicas exist."));
        assert_eq!(pool.action, "Online the device using 'zpool online'.");
        assert_eq!(pool.see, "http://zfsonlinux.org/msg/ZFS-8000-2Q");
        assert!(pool.scan.contains("resilvered"));
        assert!(pool.scan.contains("on Mon Jan  6 11:22:33 2026"));
        assert_eq!(pool.devs.len(), 4);
        let mirror = &pool.devs[1];
        assert_eq!(mirror.name, "mirror-0");
        assert!(mirror.is_container());
        assert_eq!(mirror.sub_devs, vec![2, 3]);
        assert_eq!(pool.devs[3].parent_dev, Some(1));
    }

    #[test]
    fn both_scan_prefix_variants_are_tolerated() {
        for prefix in [" scan: ", "  scan: "] {
            let input = format!(
                "  pool: tank\n state: ONLINE\n{prefix}none requested\nconfig:\n\n\ttank ONLINE 0 0 0\n\nerrors: No known data errors\n\n"
            );
            let out = parse_status(&input).unwrap();
            assert_eq!(out.pools[0].scan, "none requested", "prefix {prefix:?}");
        }
    }

    #[test]
    fn multiple_pools_get_their_own_raw_text() {
        let input = concat!(
            "  pool: alpha\n state: ONLINE\nconfig:\n\n\talpha ONLINE 0 0 0\n\nerrors: No known data errors\n\n",
            "  pool: beta\n state: ONLINE\nconfig:\n\n\tbeta ONLINE 0 0 0\n\nerrors: No known data errors\n\n",
        );
        let out = parse_status(input).unwrap();
        assert_eq!(out.pools.len(), 2);
        assert!(out.pools[0].raw_text.contains("pool: alpha"));
        assert!(!out.pools[0].raw_text.contains("pool: beta"));
        assert!(out.pools[1].raw_text.contains("pool: beta"));
    }

    #[test]
    fn missing_counter_columns_become_unreported() {
        let input =
            "  pool: tank\n state: ONLINE\nconfig:\n\n\ttank ONLINE\n\nerrors: No known data errors\n\n";
        let out = parse_status(input).unwrap();
        let dev = &out.pools[0].devs[0];
        assert_eq!(dev.state, "ONLINE");
        assert_eq!((dev.read, dev.write, dev.cksum), (-1, -1, -1));
    }

    #[test]
    fn trailing_tokens_land_in_rest() {
        let input = "  pool: tank\n state: ONLINE\nconfig:\n\n\ttank ONLINE 0 0 0\n\t  sda UNAVAIL 0 0 0 cannot open\n\nerrors: No known data errors\n\n";
        let out = parse_status(input).unwrap();
        assert_eq!(out.pools[0].devs[1].rest, "cannot open");
    }

    #[test]
    fn undeterminable_configuration_is_a_soft_error() {
        let input = "  pool: tank\n state: FAULTED\nconfig:\n\n\tThe configuration cannot be determined.\n\nerrors: No known data errors\n\n";
        let out = parse_status(input).unwrap();
        assert_eq!(out.pools.len(), 1);
        assert!(out.pools[0].devs.is_empty());
        assert_eq!(out.soft_errors.len(), 1);
        assert_eq!(out.soft_errors[0].detail, "configuration can not be determined");
    }

    #[test]
    fn counters_decode_suffixed_numbers() {
        let input = "  pool: tank\n state: ONLINE\nconfig:\n\n\ttank ONLINE 1.5K 0 2M\n\nerrors: No known data errors\n\n";
        let out = parse_status(input).unwrap();
        let dev = &out.pools[0].devs[0];
        assert_eq!(dev.read, 1536);
        assert_eq!(dev.write, 0);
        assert_eq!(dev.cksum, 2 * 1024 * 1024);
    }

    #[test]
    fn dedent_walks_back_up_the_tree() {
        let input = concat!(
            "  pool: tank\n state: ONLINE\nconfig:\n\n",
            "\tNAME STATE READ WRITE CKSUM\n",
            "\ttank ONLINE 0 0 0\n",
            "\t  raidz2-0 ONLINE 0 0 0\n",
            "\t    sda ONLINE 0 0 0\n",
            "\t    sdb ONLINE 0 0 0\n",
            "\t  raidz2-1 ONLINE 0 0 0\n",
            "\t    sdc ONLINE 0 0 0\n",
            "\nerrors: No known data errors\n\n",
        );
        let out = parse_status(input).unwrap();
        let devs = &out.pools[0].devs;
        assert_eq!(devs[0].sub_devs, vec![1, 4]);
        assert_eq!(devs[4].name, "raidz2-1");
        assert_eq!(devs[4].parent_dev, Some(0));
        assert_eq!(devs[4].sub_devs, vec![5]);
        assert_eq!(devs[5].parent_dev, Some(4));
    }

    #[test]
    fn malformed_indentation_is_caught_by_the_guard() {
        // first config line already indented: there is no parent to
        // attach to, which must surface as a parse failure, not a crash
        let input = "  pool: tank\n state: ONLINE\nconfig:\n\n\t  sda ONLINE 0 0 0\n\nerrors: none\n\n";
        match parse_status(input) {
            Err(StatusError::Panic { .. }) => {}
            other => panic!("expected guarded panic, got {other:?}"),
        }
    }
}
