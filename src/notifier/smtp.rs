// E-mail sink: batches messages and delivers them over SMTP on flush,
// rate-limited by a configurable throttle interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Local};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::internal_error;
use super::msg::{Msg, MsgKind, quote_attachment};
use super::severity::Severity;
use super::RETRY_SLEEP;

/// Settings for one e-mail sink. `to` holds whitespace-separated
/// recipient addresses; a zero `throttle` sends on every flush.
#[derive(Debug, Clone)]
pub struct EmailSinkConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub throttle: Duration,
}

impl EmailSinkConfig {
    pub(super) fn validate(&self) -> Result<()> {
        ensure!(!self.server.is_empty(), r#""server" not defined"#);
        ensure!(!self.from.is_empty(), r#""from" not defined"#);
        ensure!(!self.to.is_empty(), r#""to" not defined"#);
        ensure!(!self.subject.is_empty(), r#""subject" not defined"#);
        Ok(())
    }
}

/// How long a flush must still wait, or `None` when it may send now.
fn throttle_remaining(throttle: Duration, since_last: Option<Duration>) -> Option<Duration> {
    match since_last {
        Some(elapsed) if !throttle.is_zero() && elapsed < throttle => Some(throttle - elapsed),
        _ => None,
    }
}

/// Joins the buffered message and attachment lines into one mail body.
/// Empty when there is nothing to send.
fn compose_body(messages: &[String], attachments: &[String]) -> String {
    let mut body = String::new();
    if !messages.is_empty() {
        body.push_str(&messages.join("\n"));
        body.push('\n');
    }
    if !attachments.is_empty() {
        body.push_str(&attachments.join("\n"));
        body.push('\n');
    }
    body
}

/// Full RFC message: headers, blank line, CRLF body.
fn compose_message(
    config: &EmailSinkConfig,
    subject: &str,
    body: &str,
    date: DateTime<Local>,
) -> String {
    let recipients = config.to.split_whitespace().collect::<Vec<_>>().join(", ");
    format!(
        "From: {}\r\nTo: {}\r\nDate: {}\r\nSubject: {}\r\n\r\n{}\r\n",
        config.from,
        recipients,
        date.format("%a, %d %b %Y %H:%M:%S %z"),
        subject,
        body.replace('\n', "\r\n"),
    )
}

/// SMTP requires lines beginning with "." to be doubled inside DATA.
fn dot_stuff(data: &str) -> String {
    let stuffed = data.replace("\r\n.", "\r\n..");
    if let Some(rest) = stuffed.strip_prefix('.') {
        format!("..{rest}")
    } else {
        stuffed
    }
}

async fn read_reply(reader: &mut BufReader<OwnedReadHalf>) -> Result<(u16, String)> {
    let mut text = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        ensure!(n > 0, "SMTP connection closed mid-reply");
        text.push_str(&line);
        // A continuation line has "-" after the code; the final line has
        // a space (or nothing but CRLF).
        if line.len() < 4 || line.as_bytes()[3] != b'-' {
            let code: u16 = line.get(..3).and_then(|c| c.parse().ok()).context("malformed SMTP reply")?;
            return Ok((code, text));
        }
    }
}

async fn expect_class(reader: &mut BufReader<OwnedReadHalf>, class: u16) -> Result<()> {
    let (code, text) = read_reply(reader).await?;
    ensure!(code / 100 == class, "unexpected SMTP reply: {}", text.trim_end());
    Ok(())
}

async fn write_cmd(writer: &mut OwnedWriteHalf, cmd: &str) -> Result<()> {
    writer.write_all(format!("{cmd}\r\n").as_bytes()).await?;
    Ok(())
}

/// One SMTP submission: EHLO, optional AUTH PLAIN, envelope, DATA, QUIT.
async fn submit(config: &EmailSinkConfig, message: &str) -> Result<()> {
    let stream = TcpStream::connect(&config.server).await?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    expect_class(&mut reader, 2).await?;
    write_cmd(&mut writer, "EHLO localhost").await?;
    expect_class(&mut reader, 2).await?;

    if !config.username.is_empty() {
        let token = BASE64.encode(format!("\0{}\0{}", config.username, config.password));
        write_cmd(&mut writer, &format!("AUTH PLAIN {token}")).await?;
        expect_class(&mut reader, 2).await?;
    }

    write_cmd(&mut writer, &format!("MAIL FROM:<{}>", config.from)).await?;
    expect_class(&mut reader, 2).await?;
    for rcpt in config.to.split_whitespace() {
        write_cmd(&mut writer, &format!("RCPT TO:<{rcpt}>")).await?;
        expect_class(&mut reader, 2).await?;
    }

    write_cmd(&mut writer, "DATA").await?;
    expect_class(&mut reader, 3).await?;
    writer.write_all(dot_stuff(message).as_bytes()).await?;
    writer.write_all(b".\r\n").await?;
    expect_class(&mut reader, 2).await?;

    write_cmd(&mut writer, "QUIT").await?;
    Ok(())
}

async fn send_with_retry(config: &EmailSinkConfig, subject: &str, body: &str) {
    let message = compose_message(config, subject, body, Local::now());
    let mut attempt = 0;
    loop {
        match submit(config, &message).await {
            Ok(()) => return,
            Err(e) if attempt < 3 => {
                internal_error("error sending mail (retrying)", &format!("{e:#}"));
                tokio::time::sleep(RETRY_SLEEP).await;
                attempt += 1;
            }
            Err(e) => {
                internal_error("error sending mail (giving up)", &format!("{e:#}"));
                return;
            }
        }
    }
}

enum Event {
    Incoming(Arc<Msg>),
    TimerFlush,
    Closed,
}

pub(super) async fn run(mut rx: mpsc::Receiver<Arc<Msg>>, config: EmailSinkConfig) {
    let mut messages: Vec<String> = Vec::new();
    let mut attachments: Vec<String> = Vec::new();
    let mut worst = Severity::Debug;
    let mut last_send: Option<Instant> = None;
    let mut deferred: Option<Instant> = None;

    loop {
        let event = match deferred {
            Some(deadline) => tokio::select! {
                m = rx.recv() => m.map_or(Event::Closed, Event::Incoming),
                _ = tokio::time::sleep_until(deadline) => Event::TimerFlush,
            },
            None => rx.recv().await.map_or(Event::Closed, Event::Incoming),
        };

        let flush = match event {
            Event::Closed => break,
            Event::TimerFlush => {
                deferred = None;
                true
            }
            Event::Incoming(m) => match m.kind {
                MsgKind::Message => {
                    messages.push(m.format_time_line());
                    worst = worst.min(m.severity);
                    false
                }
                MsgKind::Attachment => {
                    attachments.push(format!("{}\n", quote_attachment(&m.text)));
                    false
                }
                MsgKind::Flush => true,
                MsgKind::Reopen => false,
            },
        };
        if !flush {
            continue;
        }

        let body = compose_body(&messages, &attachments);
        if body.is_empty() {
            continue;
        }
        let now = Instant::now();
        if let Some(wait) = throttle_remaining(config.throttle, last_send.map(|t| now - t)) {
            if deferred.is_none() {
                deferred = Some(now + wait);
            }
            continue;
        }

        messages.clear();
        attachments.clear();
        let subject = format!("{} [{}]", config.subject, worst);
        worst = Severity::Debug;
        last_send = Some(now);
        deferred = None;
        send_with_retry(&config, &subject, &body).await;
    }

    // Closing: deliver whatever is still buffered, throttle or not.
    let body = compose_body(&messages, &attachments);
    if !body.is_empty() {
        let subject = format!("{} [{}]", config.subject, worst);
        send_with_retry(&config, &subject, &body).await;
    }
}
