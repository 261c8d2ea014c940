//! Waiting for the kubelet to remove a plugin socket.

use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use notify::event::ModifyKind;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tracing::debug;

use crate::framework::FrameworkError;

/// Resolves once `path` has been deleted or renamed away.
#[async_trait]
pub trait SocketWatch: Send + Sync + 'static {
    async fn wait_removed(&self, path: &Path) -> Result<(), Report<FrameworkError>>;
}

/// [`SocketWatch`] backed by inotify on the socket's parent directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSocketWatch;

#[async_trait]
impl SocketWatch for FsSocketWatch {
    async fn wait_removed(&self, path: &Path) -> Result<(), Report<FrameworkError>> {
        let watch_error = || FrameworkError::SocketWatch {
            path: path.display().to_string(),
        };
        let dir = path.parent().ok_or_else(|| Report::new(watch_error()))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // receiver gone means nobody waits anymore
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .change_context_lazy(watch_error)?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .change_context_lazy(watch_error)?;

        // removal may have happened before the watch was installed
        if !path.exists() {
            return Ok(());
        }

        while let Some(res) = rx.recv().await {
            let event = res.change_context_lazy(watch_error)?;
            if is_removal(&event, path) {
                debug!(path = %path.display(), "Socket removed");
                return Ok(());
            }
        }

        Err(Report::new(watch_error()).attach_printable("watcher stopped unexpectedly"))
    }
}

fn is_removal(event: &Event, path: &Path) -> bool {
    matches!(
        event.kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    ) && event.paths.iter().any(|p| p == path)
}

/// Watches that only ever fire when told to, for tests.
#[derive(Debug, Clone)]
pub struct ManualSocketWatch {
    removed_tx: tokio::sync::broadcast::Sender<PathBuf>,
}

impl Default for ManualSocketWatch {
    fn default() -> Self {
        let (removed_tx, _) = tokio::sync::broadcast::channel(16);
        Self { removed_tx }
    }
}

impl ManualSocketWatch {
    /// Report `path` as removed to every current waiter.
    pub fn remove(&self, path: impl Into<PathBuf>) {
        let _ = self.removed_tx.send(path.into());
    }
}

#[async_trait]
impl SocketWatch for ManualSocketWatch {
    async fn wait_removed(&self, path: &Path) -> Result<(), Report<FrameworkError>> {
        let mut removed_rx = self.removed_tx.subscribe();
        loop {
            match removed_rx.recv().await {
                Ok(removed) if removed == path => return Ok(()),
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(Report::new(FrameworkError::SocketWatch {
                        path: path.display().to_string(),
                    }));
                }
            }
        }
    }
}
