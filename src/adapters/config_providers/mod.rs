pub mod file;
pub mod http;

pub use file::FileConfigProvider;
pub use http::HttpConfigProvider;

use std::sync::Mutex;

use tokio::sync::mpsc;

/// Hands the change receiver out once; later callers get a closed channel.
pub(crate) fn take_receiver(slot: &Mutex<Option<mpsc::Receiver<()>>>) -> mpsc::Receiver<()> {
    match slot.lock().ok().and_then(|mut rx| rx.take()) {
        Some(rx) => rx,
        None => {
            tracing::warn!("Config watch receiver already taken");
            mpsc::channel(1).1
        }
    }
}
