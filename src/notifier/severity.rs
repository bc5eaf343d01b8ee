// Message severity levels and syslog facilities

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Notification severity, aligned with the traditional syslog levels.
/// Lower numeric value means more urgent. `None` is a discard sentinel:
/// messages sent with it are silently dropped and sinks refuse it as a
/// minimum level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Emerg,
    Alert,
    Crit,
    Err,
    Warning,
    Notice,
    Info,
    Debug,
    None,
}

impl Severity {
    /// Numeric syslog code (emerg = 0 ... debug = 7).
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Emerg => "emerg",
            Severity::Alert => "alert",
            Severity::Crit => "crit",
            Severity::Err => "err",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
            Severity::Info => "info",
            Severity::Debug => "debug",
            Severity::None => "none",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, anyhow::Error> {
        Ok(match s {
            "emerg" => Severity::Emerg,
            "alert" => Severity::Alert,
            "crit" => Severity::Crit,
            "err" | "error" => Severity::Err,
            "warn" | "warning" => Severity::Warning,
            "notice" => Severity::Notice,
            "info" => Severity::Info,
            "debug" => Severity::Debug,
            "none" => Severity::None,
            _ => anyhow::bail!(r#"invalid severity "{s}""#),
        })
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// BSD syslog facility codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyslogFacility {
    Kern = 0,
    User = 1,
    Mail = 2,
    Daemon = 3,
    Auth = 4,
    Syslog = 5,
    Lpr = 6,
    News = 7,
    Uucp = 8,
    Cron = 9,
    Authpriv = 10,
    Ftp = 11,
    Local0 = 16,
    Local1 = 17,
    Local2 = 18,
    Local3 = 19,
    Local4 = 20,
    Local5 = 21,
    Local6 = 22,
    Local7 = 23,
}

impl SyslogFacility {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for SyslogFacility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyslogFacility::Kern => "kern",
            SyslogFacility::User => "user",
            SyslogFacility::Mail => "mail",
            SyslogFacility::Daemon => "daemon",
            SyslogFacility::Auth => "auth",
            SyslogFacility::Syslog => "syslog",
            SyslogFacility::Lpr => "lpr",
            SyslogFacility::News => "news",
            SyslogFacility::Uucp => "uucp",
            SyslogFacility::Cron => "cron",
            SyslogFacility::Authpriv => "authpriv",
            SyslogFacility::Ftp => "ftp",
            SyslogFacility::Local0 => "local0",
            SyslogFacility::Local1 => "local1",
            SyslogFacility::Local2 => "local2",
            SyslogFacility::Local3 => "local3",
            SyslogFacility::Local4 => "local4",
            SyslogFacility::Local5 => "local5",
            SyslogFacility::Local6 => "local6",
            SyslogFacility::Local7 => "local7",
        };
        f.write_str(s)
    }
}

impl FromStr for SyslogFacility {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, anyhow::Error> {
        Ok(match s {
            "kern" => SyslogFacility::Kern,
            "user" => SyslogFacility::User,
            "mail" => SyslogFacility::Mail,
            "daemon" => SyslogFacility::Daemon,
            "auth" => SyslogFacility::Auth,
            "syslog" => SyslogFacility::Syslog,
            "lpr" => SyslogFacility::Lpr,
            "news" => SyslogFacility::News,
            "uucp" => SyslogFacility::Uucp,
            "cron" => SyslogFacility::Cron,
            "authpriv" => SyslogFacility::Authpriv,
            "ftp" => SyslogFacility::Ftp,
            "local0" => SyslogFacility::Local0,
            "local1" => SyslogFacility::Local1,
            "local2" => SyslogFacility::Local2,
            "local3" => SyslogFacility::Local3,
            "local4" => SyslogFacility::Local4,
            "local5" => SyslogFacility::Local5,
            "local6" => SyslogFacility::Local6,
            "local7" => SyslogFacility::Local7,
            _ => anyhow::bail!(r#"invalid syslog facility "{s}""#),
        })
    }
}

impl<'de> Deserialize<'de> for SyslogFacility {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
