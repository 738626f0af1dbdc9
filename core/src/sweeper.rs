//! Background expiry sweeps owned by a store.
//!
//! RULE: A sweeper lives exactly as long as the store that spawned it.
//! `stop()` (or drop) closes the channel and joins the thread, so no
//! sweep outlives a closed store.

use crate::error::{StoreError, StoreResult};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub(crate) struct Sweeper {
    stop:   Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Run `sweep` every `interval` on a dedicated thread.
    pub(crate) fn spawn<F>(name: &str, interval: Duration, mut sweep: F) -> StoreResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("{name}-sweeper"))
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => sweep(),
                    // Explicit stop or the owning store went away.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(StoreError::Spawn)?;

        Ok(Self { stop: Some(tx), handle: Some(handle) })
    }

    pub(crate) fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("sweeper thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
