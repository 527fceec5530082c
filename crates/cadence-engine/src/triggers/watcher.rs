// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem source for file-watch triggers.
//!
//! One `notify` watcher covers every enabled file-watch trigger. Matching
//! changes are pushed into the trigger inbox from the watcher's own thread.
//! The watcher is rebuilt whenever the trigger set changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cadence_core::persistence::TriggerRecord;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use super::{InboundEvent, TriggerService};
use crate::error::{Error, Result};

/// What one file-watch trigger listens for.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    /// Trigger invoked on a match.
    pub trigger_id: String,
    /// Watched directory.
    pub path: PathBuf,
    /// Glob over file names; `None` matches every file.
    pub pattern: Option<glob::Pattern>,
    /// Accepted event names; empty accepts all.
    pub events: Vec<String>,
}

impl WatchTarget {
    /// Build a target from a trigger. Returns `None` for triggers without a
    /// watch path or with an unparsable pattern.
    pub fn from_trigger(trigger: &TriggerRecord) -> Option<Self> {
        let path = PathBuf::from(trigger.watch_path.as_deref()?);
        let pattern = match trigger.watch_pattern.as_deref() {
            Some(raw) => Some(glob::Pattern::new(raw).ok()?),
            None => None,
        };
        Some(Self {
            trigger_id: trigger.id.clone(),
            path,
            pattern,
            events: trigger.watch_events.0.clone(),
        })
    }

    /// Whether a change of `event` kind to `path` concerns this trigger.
    pub fn matches(&self, path: &Path, event: &str) -> bool {
        if !path.starts_with(&self.path) {
            return false;
        }
        if !self.events.is_empty() && !self.events.iter().any(|e| e == event) {
            return false;
        }
        match &self.pattern {
            None => true,
            Some(pattern) => path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| pattern.matches(name)),
        }
    }
}

/// Event name for a `notify` event kind; `None` for kinds triggers ignore.
pub fn event_name(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::Create(_) => Some("created"),
        EventKind::Modify(_) => Some("modified"),
        EventKind::Remove(_) => Some("removed"),
        _ => None,
    }
}

/// Live `notify` watcher feeding the inbox. Dropping it stops watching.
pub struct FileWatchSource {
    _watcher: Option<RecommendedWatcher>,
    targets: usize,
}

impl FileWatchSource {
    /// Watch every target directory. Directories that cannot be watched are
    /// logged and skipped.
    pub fn start(targets: Vec<WatchTarget>, inbox: mpsc::Sender<InboundEvent>) -> Result<Self> {
        if targets.is_empty() {
            return Ok(Self {
                _watcher: None,
                targets: 0,
            });
        }

        let routes = targets.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "File watch error");
                    return;
                }
            };
            let Some(name) = event_name(&event.kind) else {
                return;
            };
            for path in &event.paths {
                for target in routes.iter().filter(|t| t.matches(path, name)) {
                    let inbound = InboundEvent::FileChanged {
                        trigger_id: target.trigger_id.clone(),
                        path: path.to_string_lossy().into_owned(),
                        event: name.to_string(),
                    };
                    if inbox.blocking_send(inbound).is_err() {
                        debug!("Trigger inbox closed, dropping file event");
                        return;
                    }
                }
            }
        })
        .map_err(|e| Error::Other(format!("failed to create file watcher: {}", e)))?;

        let mut watched = 0;
        for target in &targets {
            match watcher.watch(&target.path, RecursiveMode::NonRecursive) {
                Ok(()) => watched += 1,
                Err(e) => warn!(
                    trigger_id = %target.trigger_id,
                    path = %target.path.display(),
                    error = %e,
                    "Cannot watch path"
                ),
            }
        }

        Ok(Self {
            _watcher: Some(watcher),
            targets: watched,
        })
    }

    /// Number of directories being watched.
    pub fn watched(&self) -> usize {
        self.targets
    }
}

/// Keep a watcher over the enabled file-watch triggers until shutdown,
/// rebuilding it whenever a trigger changes.
pub async fn run_file_watch(
    service: Arc<TriggerService>,
    inbox: mpsc::Sender<InboundEvent>,
    shutdown: Arc<Notify>,
) {
    let changed = service.changed();
    info!("File watch source started");

    loop {
        let _source = match service.file_watch_triggers().await {
            Ok(triggers) => {
                let targets: Vec<WatchTarget> =
                    triggers.iter().filter_map(WatchTarget::from_trigger).collect();
                match FileWatchSource::start(targets, inbox.clone()) {
                    Ok(source) => {
                        debug!(watched = source.watched(), "File watcher rebuilt");
                        Some(source)
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to start file watcher");
                        None
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to load file-watch triggers");
                None
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                info!("File watch source received shutdown signal");
                break;
            }
            _ = changed.notified() => {}
        }
    }
}
