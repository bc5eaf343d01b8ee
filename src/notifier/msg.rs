// Notification messages and their wire/text renderings

use chrono::{DateTime, Local};

use super::severity::{Severity, SyslogFacility};

pub(crate) const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TIME_FORMAT: &str = "%H:%M:%S";
const SYSLOG_STAMP_FORMAT: &str = "%b %e %H:%M:%S";

/// What a queued message means to a sink. Flush and Reopen are control
/// markers and carry no semantic severity; sinks dispatch on the kind,
/// not the severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Normal log message.
    Message,
    /// Additional multi-line output bound to the preceding message.
    Attachment,
    /// Ask delayed sinks (e-mail) to deliver buffered output now.
    Flush,
    /// Ask file/socket sinks to reinitialise their underlying handle.
    Reopen,
}

/// A single notification travelling through the pipeline.
#[derive(Debug, Clone)]
pub struct Msg {
    pub time: DateTime<Local>,
    pub kind: MsgKind,
    pub severity: Severity,
    pub text: String,
}

impl Msg {
    pub(crate) fn marker(kind: MsgKind) -> Self {
        Msg {
            time: Local::now(),
            kind,
            severity: Severity::None,
            text: String::new(),
        }
    }

    /// Full human readable form: `YYYY-MM-DD HH:MM:SS [severity] text`.
    pub fn format_line(&self) -> String {
        format!(
            "{} [{}] {}",
            self.time.format(DATE_TIME_FORMAT),
            self.severity,
            self.text
        )
    }

    /// Like [`Msg::format_line`] but without the date part.
    pub fn format_time_line(&self) -> String {
        format!(
            "{} [{}] {}",
            self.time.format(TIME_FORMAT),
            self.severity,
            self.text
        )
    }

    /// BSD syslog datagram payload: `<priority>stamp tag: text` where
    /// priority is `severity | facility << 3`.
    pub fn syslog_line(&self, facility: SyslogFacility, tag: &str) -> String {
        format!(
            "<{}>{} {}: {}",
            self.severity.code() | (facility.code() << 3),
            self.time.format(SYSLOG_STAMP_FORMAT),
            tag,
            self.text
        )
    }
}

/// Renders an attachment for text sinks: trailing newlines trimmed,
/// every line prefixed with ">".
pub fn quote_attachment(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 16);
    quoted.push('>');
    quoted.push_str(&text.trim_end_matches('\n').replace('\n', "\n>"));
    quoted
}
