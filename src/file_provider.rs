//! Routes from a TOML file, reloaded when the file changes

use crate::error::ProviderError;
use crate::events::{Event, EventAction, EventKind};
use crate::provider::{ProviderImpl, ProviderWatch, RouteCandidate};
use crate::route::RouteConfig;
use async_trait::async_trait;
use notify::{EventKind as FsEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
struct RouteFile {
    #[serde(default)]
    routes: BTreeMap<String, toml::Value>,
}

pub struct FileProvider {
    path: PathBuf,
    name: String,
    short_name: String,
}

impl FileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let short_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name: format!("file:{}", short_name),
            short_name,
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse a route file. Each route is decoded on its own so one bad entry
    /// does not hide the others.
    pub fn parse(&self, content: &str) -> Result<Vec<RouteCandidate>, ProviderError> {
        let file: RouteFile = toml::from_str(content).map_err(|e| ProviderError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        Ok(file
            .routes
            .into_iter()
            .map(|(alias, value)| {
                let config = RouteConfig::deserialize(value).map_err(|e| e.to_string());
                (alias, config)
            })
            .collect())
    }
}

fn to_action(kind: &FsEventKind) -> Option<EventAction> {
    match kind {
        FsEventKind::Create(_) => Some(EventAction::Create),
        FsEventKind::Modify(_) => Some(EventAction::Modify),
        FsEventKind::Remove(_) => Some(EventAction::Remove),
        _ => None,
    }
}

#[async_trait]
impl ProviderImpl for FileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn short_name(&self) -> &str {
        &self.short_name
    }

    fn kind(&self) -> EventKind {
        EventKind::File
    }

    async fn load_routes(&self) -> Result<Vec<RouteCandidate>, ProviderError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ProviderError::Read {
                path: self.path.clone(),
                source,
            })?;
        self.parse(&content)
    }

    /// Watches the parent directory, so editors that replace the file and
    /// files created after startup are both picked up.
    fn watch(&self, cancel: CancellationToken) -> ProviderWatch {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();

        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let watched = self.path.display().to_string();

        let handler_err_tx = err_tx.clone();
        let handler = move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let Some(action) = to_action(&event.kind) else {
                    return;
                };
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if ours {
                    let _ = event_tx.send(Event::file(action, watched.clone()));
                }
            }
            Err(e) => {
                let _ = handler_err_tx.send(ProviderError::Watch(e.to_string()));
            }
        };

        let mut watcher = match RecommendedWatcher::new(handler, notify::Config::default()) {
            Ok(w) => w,
            Err(e) => {
                let _ = err_tx.send(ProviderError::Watch(e.to_string()));
                return (event_rx, err_rx);
            }
        };
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            let _ = err_tx.send(ProviderError::Watch(format!("{}: {}", dir.display(), e)));
            return (event_rx, err_rx);
        }

        info!(path = %self.path.display(), "Watching route file");
        let path = self.path.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            drop(watcher);
            debug!(path = %path.display(), "Stopped watching route file");
        });

        (event_rx, err_rx)
    }
}
