// Multi-destination notification pipeline: one inbound queue, a
// dispatcher task, and per-sink buffered workers.

mod callback;
mod file;
mod msg;
mod severity;
mod smtp;
mod stdout;
mod syslog;

pub use callback::LogCallback;
pub use msg::{Msg, MsgKind, quote_attachment};
pub use severity::{Severity, SyslogFacility};
pub use smtp::EmailSinkConfig;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, ensure};
use chrono::Local;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Capacity of the inbound queue and of every sink queue.
const QUEUE_SIZE: usize = 32;

/// Pause between retries of transient sink I/O failures.
pub(crate) const RETRY_SLEEP: Duration = Duration::from_millis(500);

/// Last-resort diagnostic for failures inside the pipeline itself.
/// Writes to stderr and must never fail or re-enter the notifier.
pub(crate) fn internal_error(context: &str, err: &dyn fmt::Display) {
    eprintln!(
        "{} [NOTIFIER] {}: {}",
        Local::now().format(msg::DATE_TIME_FORMAT),
        context,
        err
    );
}

struct SinkOutput {
    min_severity: Severity,
    tx: mpsc::Sender<Arc<Msg>>,
    attachments: bool,
    flush: bool,
}

type SinkList = Arc<Mutex<Vec<SinkOutput>>>;

/// Forwards each inbound message to every sink whose filter admits it.
/// A full sink queue never blocks delivery to the others: the message is
/// dropped for that sink alone and the drop is reported on stderr.
async fn dispatch(mut rx: mpsc::Receiver<Msg>, sinks: SinkList) {
    while let Some(msg) = rx.recv().await {
        let msg = Arc::new(msg);
        let outs = sinks.lock().unwrap_or_else(|e| e.into_inner());
        for out in outs.iter() {
            let admit = match msg.kind {
                MsgKind::Message => msg.severity <= out.min_severity,
                MsgKind::Attachment => out.attachments && msg.severity <= out.min_severity,
                MsgKind::Flush => out.flush,
                MsgKind::Reopen => true,
            };
            if !admit {
                continue;
            }
            if let Err(e) = out.tx.try_send(Arc::clone(&msg)) {
                let reason = match e {
                    TrySendError::Full(_) => "channel full",
                    TrySendError::Closed(_) => "channel closed",
                };
                internal_error("dispatcher error", &reason);
            }
        }
    }
    // Inbound queue closed: dropping the senders lets every worker drain
    // its queue and exit.
    sinks.lock().unwrap_or_else(|e| e.into_inner()).clear();
}

/// A notification fan-out instance. Register sinks at setup, then feed it
/// messages; each sink runs its own worker with its own bounded queue.
/// Replaced wholesale on reconfigure: the old instance is closed and
/// drained while the new one starts accepting.
pub struct Notifier {
    tx: mpsc::Sender<Msg>,
    sinks: SinkList,
    tasks: Vec<JoinHandle<()>>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let sinks: SinkList = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = tokio::spawn(dispatch(rx, Arc::clone(&sinks)));
        Notifier {
            tx,
            sinks,
            tasks: vec![dispatcher],
        }
    }

    async fn enqueue(&self, kind: MsgKind, severity: Severity, text: String) -> Result<()> {
        if severity == Severity::None {
            return Ok(()); // discard
        }
        self.tx
            .send(Msg {
                time: Local::now(),
                kind,
                severity,
                text,
            })
            .await
            .map_err(|_| anyhow!("notifier is closed"))
    }

    /// Queue a log message. Newlines are flattened to spaces; a severity
    /// of `none` silently discards the message.
    pub async fn send(&self, severity: Severity, text: impl Into<String>) -> Result<()> {
        let sanitized = text.into().replace('\n', " ");
        self.enqueue(MsgKind::Message, severity, sanitized).await
    }

    /// Queue a multi-line attachment for the preceding message. The text
    /// is kept verbatim; sinks that accept attachments render it quoted.
    pub async fn attach(&self, severity: Severity, text: impl Into<String>) -> Result<()> {
        self.enqueue(MsgKind::Attachment, severity, text.into()).await
    }

    /// Ask delayed sinks (e-mail) to deliver any buffered output now.
    pub async fn flush(&self) {
        let _ = self.tx.send(Msg::marker(MsgKind::Flush)).await;
    }

    /// Ask file and socket sinks to reinitialise their handles, e.g.
    /// after log rotation.
    pub async fn reopen(&self) {
        let _ = self.tx.send(Msg::marker(MsgKind::Reopen)).await;
    }

    fn register(
        &mut self,
        min_severity: Severity,
        attachments: bool,
        flush: bool,
    ) -> mpsc::Receiver<Arc<Msg>> {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SinkOutput {
                min_severity,
                tx,
                attachments,
                flush,
            });
        rx
    }

    /// Add a sink printing to the process stdout.
    pub fn add_stdout(&mut self, severity: Severity) -> Result<()> {
        ensure!(severity != Severity::None, r#"invalid "severity""#);
        let rx = self.register(severity, true, false);
        self.tasks.push(tokio::spawn(stdout::run(rx)));
        Ok(())
    }

    /// Add a sink appending to a log file. The file is reopened on
    /// [`Notifier::reopen`] so rotation never kills the daemon.
    pub fn add_file(&mut self, severity: Severity, file: &str) -> Result<()> {
        ensure!(severity != Severity::None, r#"invalid "severity""#);
        ensure!(!file.is_empty(), r#""file" not defined"#);
        let rx = self.register(severity, true, false);
        self.tasks.push(tokio::spawn(file::run(rx, file.into())));
        Ok(())
    }

    /// Add a BSD syslog sink. `address` is `host:port` for UDP or a
    /// filesystem path (contains `/`) for a local datagram socket.
    pub fn add_syslog(
        &mut self,
        severity: Severity,
        address: &str,
        facility: SyslogFacility,
    ) -> Result<()> {
        ensure!(severity != Severity::None, r#"invalid "severity""#);
        ensure!(!address.is_empty(), r#""address" not defined"#);
        let rx = self.register(severity, false, false);
        self.tasks
            .push(tokio::spawn(syslog::run(rx, address.into(), facility)));
        Ok(())
    }

    /// Add a batching e-mail sink delivered over SMTP on every flush.
    pub fn add_email(&mut self, severity: Severity, config: EmailSinkConfig) -> Result<()> {
        ensure!(severity != Severity::None, r#"invalid "severity""#);
        config.validate()?;
        let rx = self.register(severity, true, true);
        self.tasks.push(tokio::spawn(smtp::run(rx, config)));
        Ok(())
    }

    /// Add a sink invoking a handler for every admitted message; used by
    /// the web view to keep its recent-log ring.
    pub fn add_callback(&mut self, severity: Severity, handler: LogCallback) -> Result<()> {
        ensure!(severity != Severity::None, r#"invalid "severity""#);
        let rx = self.register(severity, true, false);
        self.tasks.push(tokio::spawn(callback::run(rx, handler)));
        Ok(())
    }

    /// Shut the pipeline down: the dispatcher drains the inbound queue,
    /// closes every sink queue and each worker releases its resources
    /// (final throttled e-mail included). The returned receiver resolves
    /// once all of that has finished; the caller may wait on it with a
    /// timeout.
    pub fn close(self) -> oneshot::Receiver<()> {
        let Notifier { tx, sinks: _, tasks } = self;
        drop(tx);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            for task in tasks {
                let _ = task.await;
            }
            let _ = done_tx.send(());
        });
        done_rx
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
