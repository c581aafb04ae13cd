//! File system watcher for detecting project changes.
//!
//! Wraps `notify-debouncer-full` and forwards debounced create / modify /
//! remove events for watched paths into the service's change channel. The
//! service applies its own per-path collapse window on top, so a burst of
//! editor writes produces a single re-index.

use notify_debouncer_full::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, error, warn};

pub struct FileWatcher {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl FileWatcher {
    pub fn new(
        event_tx: tokio_mpsc::Sender<PathBuf>,
        debounce: Duration,
    ) -> Result<Self, notify_debouncer_full::notify::Error> {
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            while let Ok(result) = rx.recv() {
                forward_events(result, &event_tx);
            }
        });

        let debouncer = new_debouncer(debounce, None, move |result| {
            let _ = tx.send(result);
        })?;

        Ok(Self { debouncer })
    }

    pub fn watch(&mut self, path: &Path) -> Result<(), notify_debouncer_full::notify::Error> {
        debug!(path = %path.display(), "watching");
        self.debouncer.watch(path, RecursiveMode::Recursive)?;
        Ok(())
    }
}

fn forward_events(result: DebounceEventResult, event_tx: &tokio_mpsc::Sender<PathBuf>) {
    use notify_debouncer_full::notify::EventKind;

    match result {
        Ok(events) => {
            for event in events {
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    continue;
                }
                for path in &event.paths {
                    if is_hidden(path) {
                        continue;
                    }
                    if event_tx.blocking_send(path.clone()).is_err() {
                        warn!("watch channel closed");
                        return;
                    }
                }
            }
        }
        Err(errors) => {
            for e in errors {
                error!(error = %e, "watch error");
            }
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}
