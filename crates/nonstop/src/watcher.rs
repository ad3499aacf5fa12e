//! Configuration file watcher: reloads the config into the running service.

use camino::{Utf8Path, Utf8PathBuf};
use miette::{IntoDiagnostic, Result};
use nonstop_config::{Config, UserLookup};
use nonstop_server::Nonstop;
use nonstop_slurm::Scheduler;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;

/// Editors tend to write a file in several steps; wait this long after the
/// first change before reloading.
const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Load the configuration and drop hot-spare entries for partitions the
/// scheduler does not know.
pub async fn load_config(
    path: &Utf8Path,
    users: &dyn UserLookup,
    scheduler: &dyn Scheduler,
) -> Result<Config> {
    let config = Config::load(path, users).into_diagnostic()?;
    Ok(known_partitions_only(config, scheduler).await)
}

pub async fn known_partitions_only(mut config: Config, scheduler: &dyn Scheduler) -> Config {
    if !config.hot_spare_count.is_empty() {
        match scheduler.partitions().await {
            Ok(known) => config.retain_known_partitions(&known),
            Err(e) => tracing::warn!("Failed to list partitions: {}", e),
        }
    }
    config
}

/// Watches the configuration file and swaps in each valid new version.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    receiver: UnboundedReceiver<()>,
    path: Utf8PathBuf,
}

impl ConfigWatcher {
    /// Watch `path`. The parent directory is watched so that files replaced
    /// by rename are still seen.
    pub fn new(path: &Utf8Path) -> Result<Self> {
        let (tx, rx) = unbounded_channel();
        let watcher = create_watcher(tx, path.to_path_buf())?;
        Ok(Self {
            _watcher: watcher,
            receiver: rx,
            path: path.to_path_buf(),
        })
    }

    /// Reload on every change until cancelled.
    pub async fn run(
        mut self,
        svc: Arc<Nonstop>,
        users: Arc<dyn UserLookup>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = self.receiver.recv() => {
                    if changed.is_none() {
                        break;
                    }
                    tokio::time::sleep(SETTLE_DELAY).await;
                    while self.receiver.try_recv().is_ok() {}
                    reload(&self.path, &svc, users.as_ref()).await;
                }
            }
        }
    }
}

/// Replace the service configuration with the file's current contents.
/// An invalid file leaves the running configuration in place.
pub async fn reload(path: &Utf8Path, svc: &Nonstop, users: &dyn UserLookup) -> bool {
    match load_config(path, users, svc.scheduler()).await {
        Ok(config) => {
            tracing::info!("Reloaded configuration from {}", path);
            svc.set_config(config);
            true
        }
        Err(e) => {
            tracing::error!("Keeping previous configuration: {:?}", e);
            false
        }
    }
}

fn create_watcher(tx: UnboundedSender<()>, path: Utf8PathBuf) -> Result<RecommendedWatcher> {
    let dir = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."))
        .to_path_buf();
    let file_name = path.file_name().map(str::to_string);

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_change(&event, file_name.as_deref()) {
                    let _ = tx.send(());
                }
            }
            Err(e) => tracing::warn!("Config watcher error: {}", e),
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
    )
    .into_diagnostic()?;

    watcher
        .watch(dir.as_std_path(), RecursiveMode::NonRecursive)
        .into_diagnostic()?;
    Ok(watcher)
}

fn is_change(event: &Event, file_name: Option<&str>) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|p| p.file_name().and_then(|n| n.to_str()) == file_name)
}
