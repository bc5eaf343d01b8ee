// File sink: append-create log file, reopened on demand for rotation

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::internal_error;
use super::msg::{Msg, MsgKind, quote_attachment};

async fn open_log(path: &Path) -> Option<File> {
    match OpenOptions::new().append(true).create(true).open(path).await {
        Ok(f) => Some(f),
        Err(e) => {
            internal_error("error opening log file", &e);
            None
        }
    }
}

async fn write_line(file: &mut Option<File>, line: String) {
    let Some(f) = file else { return };
    if let Err(e) = f.write_all(format!("{line}\n").as_bytes()).await {
        internal_error("error writing log file", &e);
    }
}

pub(super) async fn run(mut rx: mpsc::Receiver<Arc<Msg>>, path: PathBuf) {
    let mut file = open_log(&path).await;

    while let Some(m) = rx.recv().await {
        match m.kind {
            MsgKind::Message => write_line(&mut file, m.format_line()).await,
            MsgKind::Attachment => write_line(&mut file, quote_attachment(&m.text)).await,
            MsgKind::Reopen => {
                drop(file.take());
                file = open_log(&path).await;
            }
            MsgKind::Flush => {}
        }
    }

    if let Some(mut f) = file
        && let Err(e) = f.flush().await
    {
        internal_error("error closing log file", &e);
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Notifier, Severity};

    #[tokio::test]
    async fn file_sink_writes_messages_and_quoted_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zfsmon.log");

        let mut notify = Notifier::new();
        notify.add_file(Severity::Debug, path.to_str().unwrap()).unwrap();
        notify.send(Severity::Err, "disk trouble").await.unwrap();
        notify.attach(Severity::Err, "raw\ndump\n").await.unwrap();
        notify.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("[err] disk trouble"), "got {:?}", lines[0]);
        assert_eq!(lines[1], ">raw");
        assert_eq!(lines[2], ">dump");
    }

    #[tokio::test]
    async fn reopen_switches_to_the_rotated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zfsmon.log");

        let mut notify = Notifier::new();
        notify.add_file(Severity::Debug, path.to_str().unwrap()).unwrap();
        notify.send(Severity::Info, "before rotation").await.unwrap();
        notify.flush().await;

        // Simulate logrotate: move the file aside, then ask for a reopen.
        // Brief pause so the worker has drained the first message.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let rotated = dir.path().join("zfsmon.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        notify.reopen().await;
        notify.send(Severity::Info, "after rotation").await.unwrap();
        notify.close().await.unwrap();

        let old = std::fs::read_to_string(&rotated).unwrap();
        let new = std::fs::read_to_string(&path).unwrap();
        assert!(old.contains("before rotation"));
        assert!(new.contains("after rotation"));
        assert!(!new.contains("before rotation"));
    }

    #[tokio::test]
    async fn registration_rejects_empty_file_name() {
        let mut notify = Notifier::new();
        assert!(notify.add_file(Severity::Info, "").is_err());
        assert!(notify.add_file(Severity::None, "/tmp/x").is_err());
        notify.close().await.unwrap();
    }
}
