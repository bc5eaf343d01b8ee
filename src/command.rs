// External command execution: one-shot capture and background streams

use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tokio::process::{Child, ChildStdout, Command};

use crate::notifier::{Notifier, Severity};

fn build_command(cmdline: &str) -> Result<Command> {
    let mut parts = cmdline.split_whitespace();
    let program = parts.next().context("empty command line")?;
    let mut cmd = Command::new(program);
    // keep the pool tools from localising their output
    cmd.args(parts).env("LC_ALL", "C");
    Ok(cmd)
}

/// Runs a command to completion and returns its combined stdout+stderr.
/// Spawn failures and non-zero exits are reported through the notifier
/// at CRIT, with any captured output attached.
pub async fn run_command(notify: &Notifier, cmdline: &str) -> Result<String> {
    let output = match build_command(cmdline)?.output().await {
        Ok(out) => out,
        Err(e) => {
            notify
                .send(Severity::Crit, format!(r#"running "{cmdline}" failed: {e}"#))
                .await?;
            return Err(e).with_context(|| format!(r#"running "{cmdline}""#));
        }
    };
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        notify
            .send(
                Severity::Crit,
                format!(r#"running "{cmdline}" failed: {}"#, output.status),
            )
            .await?;
        if !text.is_empty() {
            notify.attach(Severity::Crit, text).await?;
        }
        bail!(r#"running "{cmdline}" failed"#);
    }
    Ok(text)
}

/// A long-running subprocess whose stdout is consumed by a reader task.
/// The child is killed on drop so no exit path leaks it.
pub struct BackgroundProcess {
    cmdline: String,
    child: Child,
}

impl BackgroundProcess {
    pub fn spawn(cmdline: &str) -> Result<(Self, ChildStdout)> {
        let mut child = build_command(cmdline)?
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!(r#"starting "{cmdline}" failed"#))?;
        let stdout = child.stdout.take().context("no stdout pipe")?;
        Ok((
            BackgroundProcess {
                cmdline: cmdline.to_string(),
                child,
            },
            stdout,
        ))
    }

    /// Kills the subprocess and reaps it.
    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(r#"stopping "{}" failed: {}"#, self.cmdline, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Notifier;

    #[tokio::test]
    async fn captures_combined_output() {
        let notify = Notifier::new();
        let out = run_command(&notify, "echo hello world").await.unwrap();
        assert_eq!(out, "hello world\n");
        notify.close().await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let notify = Notifier::new();
        assert!(run_command(&notify, "false").await.is_err());
        notify.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let notify = Notifier::new();
        assert!(run_command(&notify, "definitely-no-such-binary-a7f3").await.is_err());
        assert!(run_command(&notify, "   ").await.is_err());
        notify.close().await.unwrap();
    }

    #[tokio::test]
    async fn background_process_spawns_and_stops() {
        let (proc, stdout) = BackgroundProcess::spawn("cat /dev/zero").unwrap();
        drop(stdout);
        proc.stop().await;
    }
}
