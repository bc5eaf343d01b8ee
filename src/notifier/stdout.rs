// Stdout sink

use std::sync::Arc;

use tokio::sync::mpsc;

use super::msg::{Msg, MsgKind, quote_attachment};

pub(super) async fn run(mut rx: mpsc::Receiver<Arc<Msg>>) {
    while let Some(m) = rx.recv().await {
        match m.kind {
            MsgKind::Message => println!("{}", m.format_line()),
            MsgKind::Attachment => println!("{}", quote_attachment(&m.text)),
            MsgKind::Flush | MsgKind::Reopen => {}
        }
    }
}
