// Callback sink: hands every admitted message to a user-supplied handler

use std::sync::Arc;

use tokio::sync::mpsc;

use super::msg::Msg;

/// Handler invoked by a callback sink for every admitted message.
pub type LogCallback = Box<dyn Fn(&Msg) + Send + Sync>;

pub(super) async fn run(mut rx: mpsc::Receiver<Arc<Msg>>, handler: LogCallback) {
    while let Some(m) = rx.recv().await {
        handler(&m);
    }
}
