//! # Debounced File-Change Watcher
//!
//! The writer never notifies the live monitor directly; the monitor observes
//! the tenant's storage files changing instead. This keeps the wake path
//! identical whether a commit came from this process or from an external
//! tool touching the database.
//!
//! `notify` provides the edge-triggered OS notification; a small thread in
//! front of the callback coalesces bursts with a trailing-edge debounce so a
//! batch of commits produces one wake.

use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::Result;

/// Default debounce window for storage-change wakes.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watches one directory and invokes the callback at most once per debounce
/// window after changes settle. Dropping the watcher stops both the OS watch
/// and the debounce thread.
pub struct DebouncedWatcher {
    _watcher: RecommendedWatcher,
}

impl DebouncedWatcher {
    pub fn new(
        dir: &Path,
        debounce: Duration,
        on_change: impl Fn() + Send + 'static,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();

        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<notify::Event, notify::Error>| {
                if res.is_ok() {
                    let _ = tx.send(());
                }
            })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        thread::Builder::new()
            .name("db-watch-debounce".to_string())
            .spawn(move || {
                while rx.recv().is_ok() {
                    loop {
                        match rx.recv_timeout(debounce) {
                            Ok(()) => continue,
                            Err(RecvTimeoutError::Timeout) => break,
                            Err(RecvTimeoutError::Disconnected) => return,
                        }
                    }
                    on_change();
                }
            })
            .expect("failed to spawn debounce thread");

        Ok(Self { _watcher: watcher })
    }
}
