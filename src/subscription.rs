//! Watch subscriptions: follow another user's filter/sort state.
//!
//! A watcher subscribes to a (project, watched user) pair, either scoped to
//! one view or unscoped across all views. Scoped watchers attach to the
//! fine-grained per-view channel; unscoped watchers attach to the watched
//! user's per-user channel. Either way, one listener task per distinct
//! (project, scope, watched) group relays preference changes to every
//! watcher in the group, refcounted so the listener stops with its last
//! watcher.
//!
//! On subscribe, the watcher is immediately sent the watched user's stored
//! preference (all stored views when unscoped) so it starts from the
//! current state rather than the next change.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{prefs_channel, user_prefs_channel, MemoryBus};
use crate::error::CollabError;
use crate::prefs::PrefStore;
use crate::protocol::ServerEvent;
use crate::UserId;

/// One listener group: same project, same scope, same watched user.
type GroupKey = (Uuid, Option<Uuid>, UserId);

struct Group {
    watchers: HashMap<UserId, mpsc::Sender<String>>,
    listener: JoinHandle<()>,
}

/// Refcounted watch registry with one relay task per group.
pub struct SubscriptionManager {
    bus: Arc<MemoryBus>,
    prefs: Arc<PrefStore>,
    groups: Arc<Mutex<HashMap<GroupKey, Group>>>,
}

impl SubscriptionManager {
    pub fn new(bus: Arc<MemoryBus>, prefs: Arc<PrefStore>) -> Self {
        Self {
            bus,
            prefs,
            groups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a watcher on a (project, scope, watched) group.
    ///
    /// Rejects a second registration of the same watcher on the same group
    /// with [`CollabError::AlreadySubscribed`]. The stored preference is
    /// delivered to `tx` before any live change.
    pub async fn subscribe(
        &self,
        project_id: Uuid,
        view_id: Option<Uuid>,
        watcher_id: UserId,
        watched_id: UserId,
        tx: mpsc::Sender<String>,
    ) -> Result<(), CollabError> {
        let key = (project_id, view_id, watched_id);
        {
            let mut groups = self.groups.lock().await;
            match groups.get_mut(&key) {
                Some(group) => {
                    if group.watchers.contains_key(&watcher_id) {
                        return Err(CollabError::AlreadySubscribed);
                    }
                    group.watchers.insert(watcher_id, tx.clone());
                }
                None => {
                    let listener = self.spawn_listener(key).await;
                    let mut watchers = HashMap::new();
                    watchers.insert(watcher_id, tx.clone());
                    groups.insert(key, Group { watchers, listener });
                }
            }
        }
        log::info!(
            "user {watcher_id} watching user {watched_id} in {project_id} (view {view_id:?})"
        );
        self.bootstrap(project_id, view_id, watched_id, &tx).await?;
        Ok(())
    }

    /// Remove a watcher; stops the group's listener when it was the last.
    pub async fn unsubscribe(
        &self,
        project_id: Uuid,
        view_id: Option<Uuid>,
        watcher_id: UserId,
        watched_id: UserId,
    ) {
        let key = (project_id, view_id, watched_id);
        let drained = {
            let mut groups = self.groups.lock().await;
            let Some(group) = groups.get_mut(&key) else {
                return;
            };
            group.watchers.remove(&watcher_id);
            if group.watchers.is_empty() {
                groups.remove(&key).map(|group| group.listener)
            } else {
                None
            }
        };
        if let Some(handle) = drained {
            handle.abort();
            // The receiver is released only once the cancelled task drops.
            let _ = handle.await;
            self.bus.remove_if_idle(&channel_for(key)).await;
        }
        log::info!(
            "user {watcher_id} stopped watching user {watched_id} in {project_id} (view {view_id:?})"
        );
    }

    /// Send the watched user's current stored preference to a new watcher.
    async fn bootstrap(
        &self,
        project_id: Uuid,
        view_id: Option<Uuid>,
        watched_id: UserId,
        tx: &mpsc::Sender<String>,
    ) -> Result<(), CollabError> {
        let stored = match view_id {
            Some(view) => self
                .prefs
                .get(project_id, view, watched_id)
                .await
                .map(|pref| vec![(view, pref)])
                .unwrap_or_default(),
            None => self.prefs.get_all_views(project_id, watched_id).await,
        };
        for (view, pref) in stored {
            let event = ServerEvent::FilterSortUpdate {
                view_id: Some(view),
                filter_model: pref.filter_model,
                sort_model: pref.sort_model,
            };
            if tx.send(event.encode()?).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Deliver a preference change to every watcher of (project, watched).
    ///
    /// Process-local narrowcast: reaches the group scoped to exactly this
    /// view plus the unscoped group, without a round-trip through the bus.
    pub async fn notify_watchers(
        &self,
        project_id: Uuid,
        watched_id: UserId,
        view_id: Uuid,
        filter_model: serde_json::Value,
        sort_model: Vec<crate::protocol::SortModelItem>,
    ) -> Result<(), CollabError> {
        let payload = ServerEvent::FilterSortUpdate {
            view_id: Some(view_id),
            filter_model,
            sort_model,
        }
        .encode()?;
        let targets: Vec<mpsc::Sender<String>> = {
            let groups = self.groups.lock().await;
            [Some(view_id), None]
                .into_iter()
                .filter_map(|scope| groups.get(&(project_id, scope, watched_id)))
                .flat_map(|g| g.watchers.values().cloned())
                .collect()
        };
        for tx in targets {
            if let Err(err) = tx.try_send(payload.clone()) {
                log::warn!("dropping watch notification: {err}");
            }
        }
        Ok(())
    }

    /// One relay task per group, forwarding preference changes to watchers.
    async fn spawn_listener(&self, key: GroupKey) -> JoinHandle<()> {
        let mut events = self.bus.subscribe(&channel_for(key)).await;
        let groups = self.groups.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(payload) => {
                        if let Err(err) = ServerEvent::decode(&payload) {
                            log::warn!("dropping invalid watch payload: {err}");
                            continue;
                        }
                        let targets: Vec<mpsc::Sender<String>> = {
                            let groups = groups.lock().await;
                            groups
                                .get(&key)
                                .map(|g| g.watchers.values().cloned().collect())
                                .unwrap_or_default()
                        };
                        for tx in targets {
                            if let Err(err) = tx.try_send(payload.clone()) {
                                log::warn!("dropping watch event for a watcher: {err}");
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("watch listener lagged, {missed} events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Number of watchers in a group.
    pub async fn watcher_count(
        &self,
        project_id: Uuid,
        view_id: Option<Uuid>,
        watched_id: UserId,
    ) -> usize {
        self.groups
            .lock()
            .await
            .get(&(project_id, view_id, watched_id))
            .map_or(0, |g| g.watchers.len())
    }
}

fn channel_for((project_id, view_id, watched_id): GroupKey) -> String {
    match view_id {
        Some(view) => prefs_channel(project_id, view, watched_id),
        None => user_prefs_channel(project_id, watched_id),
    }
}
