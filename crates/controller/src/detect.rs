//! Change detection: push (one watch per configmap) or diff (periodic compare).

use std::sync::Arc;
use std::time::Duration;

use cfgwatch_core::{ConfigContent, ConfigStream, ResourceRef, ResourceStore, StoreError};
use cfgwatch_ops::Dispatcher;
use cfgwatch_store::{DependencyIndex, Detection, Subscription};
use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives the id of every configmap whose content changed.
pub type ChangeSink = mpsc::Sender<ResourceRef>;

const REOPEN_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[async_trait::async_trait]
pub trait ChangeDetector: Send + Sync {
    /// Start detecting changes for a newly tracked object whose content was just read.
    async fn establish(&self, id: &ResourceRef, current: ConfigContent) -> Result<Detection, StoreError>;
}

/// Push variant: a listener task per configmap feeding a [`ChangeSink`].
pub struct PushDetector {
    store: Arc<dyn ResourceStore>,
    sink: ChangeSink,
    shutdown: CancellationToken,
}

impl PushDetector {
    pub fn new(store: Arc<dyn ResourceStore>, sink: ChangeSink, shutdown: CancellationToken) -> Self {
        Self { store, sink, shutdown }
    }

    /// Watch `id`; only states differing from the last known content (initially `baseline`) are reported.
    pub async fn subscribe(&self, id: &ResourceRef, baseline: ConfigContent) -> Result<Subscription, StoreError> {
        let stream = self.store.watch_config(id).await?;
        let token = self.shutdown.child_token();
        tokio::spawn(listen(self.store.clone(), id.clone(), baseline, stream, self.sink.clone(), token.clone()));
        Ok(Subscription::new(id.clone(), token))
    }
}

#[async_trait::async_trait]
impl ChangeDetector for PushDetector {
    async fn establish(&self, id: &ResourceRef, current: ConfigContent) -> Result<Detection, StoreError> {
        Ok(Detection::Push(self.subscribe(id, current).await?))
    }
}

async fn listen(
    store: Arc<dyn ResourceStore>,
    id: ResourceRef,
    mut last: ConfigContent,
    mut stream: ConfigStream,
    sink: ChangeSink,
    token: CancellationToken,
) {
    debug!(configmap = %id, "configmap listener started");
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(content)) => {
                if content == last {
                    debug!(configmap = %id, "configmap update without content change");
                    continue;
                }
                last = content;
                counter!("cfgwatch_changes_total", 1, "mode" => "push");
                info!(configmap = %id, "configmap content changed");
                let sent = tokio::select! {
                    _ = token.cancelled() => break,
                    res = sink.send(id.clone()) => res,
                };
                if sent.is_err() {
                    debug!(configmap = %id, "change sink closed");
                    break;
                }
            }
            Some(Err(e)) => warn!(configmap = %id, error = %e, "configmap watch error"),
            None => {
                warn!(configmap = %id, "configmap watch ended; reopening");
                match reopen(store.as_ref(), &id, &token).await {
                    Some(s) => stream = s,
                    None => break,
                }
            }
        }
    }
    // dropping the stream releases the watch
    drop(stream);
    debug!(configmap = %id, "configmap listener stopped");
}

async fn reopen(store: &dyn ResourceStore, id: &ResourceRef, token: &CancellationToken) -> Option<ConfigStream> {
    let mut delay = Duration::from_millis(500);
    loop {
        tokio::select! {
            _ = token.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match store.watch_config(id).await {
            Ok(s) => return Some(s),
            Err(e) => {
                warn!(configmap = %id, error = %e, retry_in = ?delay, "unable to reopen configmap watch");
                delay = (delay * 2).min(REOPEN_BACKOFF_MAX);
            }
        }
    }
}

/// Result of one diff pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub checked: usize,
    pub changed: Vec<ResourceRef>,
    pub failed: usize,
}

/// Diff variant: compares fresh content with the snapshot held in the index.
pub struct DiffDetector {
    store: Arc<dyn ResourceStore>,
    index: Arc<DependencyIndex>,
    dispatcher: Arc<Dispatcher>,
}

impl DiffDetector {
    pub fn new(store: Arc<dyn ResourceStore>, index: Arc<DependencyIndex>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, index, dispatcher }
    }

    pub async fn check_all(&self) -> CheckReport {
        let mut report = CheckReport::default();
        for (id, snapshot) in self.index.diff_snapshots() {
            report.checked += 1;
            let fresh = match self.store.get_config(&id).await {
                Ok(c) => c,
                Err(e) => {
                    // a failed read is never a change
                    warn!(configmap = %id, error = %e, "unable to read configmap; skipping this pass");
                    report.failed += 1;
                    continue;
                }
            };
            if fresh == snapshot {
                continue;
            }
            counter!("cfgwatch_changes_total", 1, "mode" => "diff");
            info!(configmap = %id, "configmap content changed");
            self.dispatcher.restart_dependents(&id).await;
            self.index.refresh_snapshot(&id, fresh);
            report.changed.push(id);
        }
        report
    }
}

#[async_trait::async_trait]
impl ChangeDetector for DiffDetector {
    async fn establish(&self, _id: &ResourceRef, current: ConfigContent) -> Result<Detection, StoreError> {
        Ok(Detection::Diff(current))
    }
}
