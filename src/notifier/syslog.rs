// BSD syslog sink over UDP or a local datagram socket

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{UdpSocket, UnixDatagram};
use tokio::sync::mpsc;

use super::internal_error;
use super::msg::{Msg, MsgKind};
use super::severity::SyslogFacility;
use super::RETRY_SLEEP;

/// Each outgoing packet is capped at the classic syslog datagram size.
const MAX_DATAGRAM: usize = 1024;

enum Transport {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl Transport {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Udp(s) => s.send(buf).await,
            Transport::Unix(s) => s.send(buf).await,
        }
    }
}

async fn connect(address: &str) -> io::Result<Transport> {
    // An address with a path separator is a local datagram socket,
    // anything else is host:port over UDP.
    if address.contains('/') {
        let sock = UnixDatagram::unbound()?;
        sock.connect(address)?;
        Ok(Transport::Unix(sock))
    } else {
        let sock = UdpSocket::bind("0.0.0.0:0").await?;
        sock.connect(address).await?;
        Ok(Transport::Udp(sock))
    }
}

async fn connect_with_retry(address: &str) -> Option<Transport> {
    let mut attempt = 0;
    loop {
        match connect(address).await {
            Ok(t) => return Some(t),
            Err(e) if attempt < 3 => {
                internal_error("error connecting syslog socket (retrying)", &e);
                tokio::time::sleep(RETRY_SLEEP).await;
                attempt += 1;
            }
            Err(e) => {
                internal_error("error connecting syslog socket (giving up)", &e);
                return None;
            }
        }
    }
}

fn process_tag() -> String {
    let prog = std::env::args()
        .next()
        .as_deref()
        .and_then(|a| Path::new(a).file_name().map(|f| f.to_string_lossy().into_owned()))
        .unwrap_or_else(|| crate::version::NAME.to_string());
    format!("{}[{}]", prog, std::process::id())
}

pub(super) async fn run(
    mut rx: mpsc::Receiver<Arc<Msg>>,
    address: String,
    facility: SyslogFacility,
) {
    let tag = process_tag();
    let mut conn = connect_with_retry(&address).await;

    while let Some(m) = rx.recv().await {
        match m.kind {
            MsgKind::Message => {
                let mut buf = m.syslog_line(facility, &tag).into_bytes();
                buf.truncate(MAX_DATAGRAM);
                for _ in 0..2 {
                    if let Some(c) = conn.as_ref() {
                        match c.send(&buf).await {
                            Ok(_) => break,
                            Err(e) => {
                                internal_error("error writing to syslog socket", &e);
                                conn = None;
                            }
                        }
                    }
                    if conn.is_none() {
                        conn = connect_with_retry(&address).await;
                    }
                }
            }
            MsgKind::Reopen => {
                drop(conn.take());
                conn = connect_with_retry(&address).await;
            }
            MsgKind::Attachment | MsgKind::Flush => {}
        }
    }
}
