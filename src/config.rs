// Daemon configuration: TOML file mapped onto typed sections

use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use serde::{Deserialize, Deserializer};

use crate::leds::LedIndicator;
use crate::notifier::{Severity, SyslogFacility};

/// Default configuration file path, overridable with `CONFIG_FILE`.
const DEFAULT_CONFIG_FILE: &str = "/etc/zfsmon.toml";

const DEFAULT_LIST_CMD: &str = "zfs list -H -o name,avail,used,usedsnap,usedds,usedrefreserv,usedchild,refer,mountpoint -d 0";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub main: MainConfig,
    #[serde(default)]
    pub severity: SeverityConfig,
    #[serde(default)]
    pub leds: LedsConfig,
    #[serde(default)]
    pub logfile: HashMap<String, LogfileProfile>,
    #[serde(default)]
    pub syslog: HashMap<String, SyslogProfile>,
    #[serde(default)]
    pub email: HashMap<String, EmailProfile>,
    #[serde(default)]
    pub www: WwwConfig,
    #[serde(default)]
    pub wwwuser: HashMap<String, WwwUser>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MainConfig {
    /// Seconds between pool status refreshes.
    pub zpool_status_refresh: u64,
    pub zpool_status_cmd: String,
    /// Seconds between disk usage refreshes.
    pub zfs_list_refresh: u64,
    pub zfs_list_cmd: String,
    /// Streaming iostat command; empty disables the stream.
    pub zpool_iostat_cmd: String,
    pub pidfile: String,
    /// When set, log messages at this level and above are also printed
    /// to stdout.
    pub console_level: Option<Severity>,
}

impl Default for MainConfig {
    fn default() -> Self {
        MainConfig {
            zpool_status_refresh: 10,
            zpool_status_cmd: "zpool status".to_string(),
            zfs_list_refresh: 60,
            zfs_list_cmd: DEFAULT_LIST_CMD.to_string(),
            zpool_iostat_cmd: String::new(),
            pidfile: String::new(),
            console_level: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SeverityConfig {
    /// Pool state token to notification severity; unmapped states fall
    /// back to `info`.
    pub pool_state_map: HashMap<String, Severity>,
    pub pool_added: Severity,
    pub pool_removed: Severity,
    pub pool_status_changed: Severity,
    pub pool_status_cleared: Severity,
    pub pool_errors_changed: Severity,
    /// Device state token to notification severity; unmapped states
    /// fall back to `info`.
    pub dev_state_map: HashMap<String, Severity>,
    pub dev_added: Severity,
    pub dev_removed: Severity,
    pub dev_read_errors_increased: Severity,
    pub dev_write_errors_increased: Severity,
    pub dev_cksum_errors_increased: Severity,
    pub dev_additional_info_changed: Severity,
    pub dev_additional_info_cleared: Severity,
    /// Usage thresholds: percentage (1-99, `%` suffix accepted) to the
    /// severity reported when the threshold is crossed upwards.
    #[serde(deserialize_with = "de_percent_map")]
    pub used_space: BTreeMap<u8, Severity>,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        SeverityConfig {
            pool_state_map: HashMap::new(),
            pool_added: Severity::Info,
            pool_removed: Severity::Info,
            pool_status_changed: Severity::Info,
            pool_status_cleared: Severity::Info,
            pool_errors_changed: Severity::Info,
            dev_state_map: HashMap::new(),
            dev_added: Severity::Info,
            dev_removed: Severity::Info,
            dev_read_errors_increased: Severity::Info,
            dev_write_errors_increased: Severity::Info,
            dev_cksum_errors_increased: Severity::Info,
            dev_additional_info_changed: Severity::Info,
            dev_additional_info_cleared: Severity::Info,
            used_space: BTreeMap::new(),
        }
    }
}

fn de_percent_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<u8, Severity>, D::Error> {
    let raw: HashMap<String, Severity> = HashMap::deserialize(deserializer)?;
    let mut map = BTreeMap::new();
    for (key, severity) in raw {
        let digits = key.strip_suffix('%').unwrap_or(&key);
        let pct: u8 = digits.parse().map_err(|_| {
            serde::de::Error::custom(format!(r#"invalid percentage entry "{key}""#))
        })?;
        if !(1..=99).contains(&pct) {
            return Err(serde::de::Error::custom(format!(
                r#"percentage "{key}" out of range 1-99"#
            )));
        }
        map.insert(pct, severity);
    }
    Ok(map)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LedsConfig {
    pub enable: bool,
    pub ledctl_cmd: String,
    /// Device state token to LED indicator; unmapped states fall back
    /// to `normal`.
    pub dev_state_map: HashMap<String, LedIndicator>,
}

impl Default for LedsConfig {
    fn default() -> Self {
        LedsConfig {
            enable: false,
            ledctl_cmd: "ledctl".to_string(),
            dev_state_map: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LogfileProfile {
    pub enable: bool,
    pub level: Severity,
    pub file: String,
}

impl Default for LogfileProfile {
    fn default() -> Self {
        LogfileProfile {
            enable: false,
            level: Severity::Info,
            file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyslogProfile {
    pub enable: bool,
    pub level: Severity,
    pub server: String,
    pub facility: SyslogFacility,
}

impl Default for SyslogProfile {
    fn default() -> Self {
        SyslogProfile {
            enable: false,
            level: Severity::Info,
            server: String::new(),
            facility: SyslogFacility::Daemon,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EmailProfile {
    pub enable: bool,
    pub level: Severity,
    pub server: String,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    /// Minimum seconds between two mails from this profile.
    pub throttle: u64,
}

impl Default for EmailProfile {
    fn default() -> Self {
        EmailProfile {
            enable: false,
            level: Severity::Info,
            server: String::new(),
            username: String::new(),
            password: String::new(),
            from: String::new(),
            to: String::new(),
            subject: String::new(),
            throttle: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WwwConfig {
    pub enable: bool,
    /// Minimum severity collected into the web log ring.
    pub level: Severity,
    /// Number of recent log entries kept for the web view.
    pub logbuffer: usize,
    pub bind: String,
}

impl Default for WwwConfig {
    fn default() -> Self {
        WwwConfig {
            enable: false,
            level: Severity::Info,
            logbuffer: 256,
            bind: "localhost:8990".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WwwUser {
    pub enable: bool,
    pub password: String,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        let s = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        Self::load_from_str(&s).with_context(|| format!("in {path}"))
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.main.zpool_status_refresh > 0,
            "main.zpool_status_refresh must be > 0, got {}",
            self.main.zpool_status_refresh
        );
        anyhow::ensure!(
            self.main.zfs_list_refresh > 0,
            "main.zfs_list_refresh must be > 0, got {}",
            self.main.zfs_list_refresh
        );
        anyhow::ensure!(
            !self.main.zpool_status_cmd.is_empty(),
            "main.zpool_status_cmd must be non-empty"
        );
        anyhow::ensure!(
            !self.main.zfs_list_cmd.is_empty(),
            "main.zfs_list_cmd must be non-empty"
        );
        if self.leds.enable {
            anyhow::ensure!(
                !self.leds.ledctl_cmd.is_empty(),
                "leds.ledctl_cmd must be non-empty when leds.enable is set"
            );
        }
        if self.www.enable {
            anyhow::ensure!(!self.www.bind.is_empty(), "www.bind must be non-empty");
        }
        for (profile, p) in &self.logfile {
            if p.enable {
                anyhow::ensure!(
                    !p.file.is_empty(),
                    r#"[logfile "{profile}"] file must be non-empty"#
                );
            }
        }
        for (profile, p) in &self.syslog {
            if p.enable {
                anyhow::ensure!(
                    !p.server.is_empty(),
                    r#"[syslog "{profile}"] server must be non-empty"#
                );
            }
        }
        for (profile, p) in &self.email {
            if p.enable {
                for (field, value) in [
                    ("server", &p.server),
                    ("from", &p.from),
                    ("to", &p.to),
                    ("subject", &p.subject),
                ] {
                    anyhow::ensure!(
                        !value.is_empty(),
                        r#"[email "{profile}"] {field} must be non-empty"#
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[main]
zpool_status_refresh = 10
zpool_status_cmd = "zpool status"
zfs_list_refresh = 60
pidfile = "/run/zfsmon.pid"
console_level = "debug"

[severity]
pool_state_map = { ONLINE = "info", DEGRADED = "warning", FAULTED = "crit" }
dev_state_map = { DEGRADED = "warning", FAULTED = "err" }
dev_read_errors_increased = "err"
used_space = { "80" = "warning", "90%" = "crit", "95" = "alert" }

[leds]
enable = true
ledctl_cmd = "ledctl"
dev_state_map = { ONLINE = "normal", FAULTED = "fail", OFFLINE = "locate" }

[logfile.default]
enable = true
level = "info"
file = "/var/log/zfsmon.log"

[syslog.default]
enable = true
level = "warning"
server = "loghost:514"
facility = "daemon"

[email.oncall]
enable = true
level = "err"
server = "mail.example.net:587"
username = "zfsmon"
password = "hunter2"
from = "zfsmon@example.net"
to = "ops@example.net oncall@example.net"
subject = "zfsmon alert"
throttle = 600

[www]
enable = true
level = "debug"
logbuffer = 128
bind = "0.0.0.0:8990"

[wwwuser.admin]
enable = true
password = "secret"
"#;

    #[test]
    fn full_configuration_parses() {
        let cfg = AppConfig::load_from_str(FULL).unwrap();
        assert_eq!(cfg.main.zpool_status_refresh, 10);
        assert_eq!(cfg.main.console_level, Some(Severity::Debug));
        assert_eq!(cfg.severity.pool_state_map["DEGRADED"], Severity::Warning);
        assert_eq!(cfg.severity.dev_read_errors_increased, Severity::Err);
        assert_eq!(cfg.severity.used_space[&90], Severity::Crit);
        assert_eq!(cfg.leds.dev_state_map["FAULTED"], LedIndicator::Fail);
        assert_eq!(cfg.syslog["default"].facility, SyslogFacility::Daemon);
        assert_eq!(cfg.email["oncall"].throttle, 600);
        assert!(cfg.wwwuser["admin"].enable);
    }

    #[test]
    fn defaults_cover_an_empty_file() {
        let cfg = AppConfig::load_from_str("").unwrap();
        assert_eq!(cfg.main.zpool_status_refresh, 10);
        assert_eq!(cfg.main.zpool_status_cmd, "zpool status");
        assert_eq!(cfg.main.zfs_list_refresh, 60);
        assert_eq!(cfg.severity.pool_added, Severity::Info);
        assert!(!cfg.leds.enable);
        assert!(!cfg.www.enable);
    }

    #[test]
    fn unknown_sections_are_rejected() {
        assert!(AppConfig::load_from_str("[nonsense]\nx = 1\n").is_err());
        assert!(AppConfig::load_from_str("[main]\nbogus_key = 1\n").is_err());
    }

    #[test]
    fn unknown_severity_tokens_fail_parsing() {
        let err = AppConfig::load_from_str("[severity]\npool_added = \"loud\"\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("invalid severity"), "got {err}");
    }

    #[test]
    fn usage_thresholds_must_be_in_range() {
        assert!(AppConfig::load_from_str("[severity]\nused_space = { \"0\" = \"info\" }\n").is_err());
        assert!(
            AppConfig::load_from_str("[severity]\nused_space = { \"100\" = \"info\" }\n").is_err()
        );
        assert!(AppConfig::load_from_str("[severity]\nused_space = { \"abc\" = \"info\" }\n").is_err());
    }

    #[test]
    fn enabled_profiles_require_their_fields() {
        assert!(AppConfig::load_from_str("[logfile.x]\nenable = true\n").is_err());
        assert!(AppConfig::load_from_str("[syslog.x]\nenable = true\n").is_err());
        assert!(AppConfig::load_from_str("[email.x]\nenable = true\nserver = \"m:25\"\n").is_err());
        // disabled profiles may stay incomplete
        assert!(AppConfig::load_from_str("[logfile.x]\nenable = false\n").is_ok());
    }

    #[test]
    fn zero_refresh_intervals_are_rejected() {
        assert!(AppConfig::load_from_str("[main]\nzpool_status_refresh = 0\n").is_err());
    }
}
