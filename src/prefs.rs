//! Per-(project, view, user) filter/sort preference storage.
//!
//! Saving a preference both stores it (so new watchers can be bootstrapped
//! with the current state) and publishes a `filter_sort_update` on the
//! fine-grained channel scoped to exactly that project, view and user, so
//! only interested listeners wake up.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bus::{prefs_channel, user_prefs_channel, MemoryBus};
use crate::error::CollabError;
use crate::protocol::{ServerEvent, SortModelItem};
use crate::UserId;

/// A user's filter and sort state for one view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterSortPreference {
    pub filter_model: serde_json::Value,
    pub sort_model: Vec<SortModelItem>,
}

/// Preference store with publish-on-save.
pub struct PrefStore {
    bus: Arc<MemoryBus>,
    prefs: Mutex<HashMap<(Uuid, Uuid, UserId), FilterSortPreference>>,
}

impl PrefStore {
    pub fn new(bus: Arc<MemoryBus>) -> Self {
        Self {
            bus,
            prefs: Mutex::new(HashMap::new()),
        }
    }

    /// Store a preference and announce it on the fine-grained channel.
    pub async fn save(
        &self,
        project_id: Uuid,
        view_id: Uuid,
        user_id: UserId,
        pref: FilterSortPreference,
    ) -> Result<(), CollabError> {
        let event = ServerEvent::FilterSortUpdate {
            view_id: Some(view_id),
            filter_model: pref.filter_model.clone(),
            sort_model: pref.sort_model.clone(),
        };
        {
            let mut prefs = self.prefs.lock().await;
            prefs.insert((project_id, view_id, user_id), pref);
        }
        let payload = event.encode()?;
        self.bus
            .publish(&prefs_channel(project_id, view_id, user_id), payload.clone())
            .await?;
        // Watchers of "all views" listen on the per-user channel instead.
        self.bus
            .publish(&user_prefs_channel(project_id, user_id), payload)
            .await?;
        Ok(())
    }

    /// Every view the user has a saved preference on within a project.
    pub async fn get_all_views(
        &self,
        project_id: Uuid,
        user_id: UserId,
    ) -> Vec<(Uuid, FilterSortPreference)> {
        self.prefs
            .lock()
            .await
            .iter()
            .filter(|((p, _, u), _)| *p == project_id && *u == user_id)
            .map(|((_, v, _), pref)| (*v, pref.clone()))
            .collect()
    }

    /// Current preference, if the user ever saved one for this view.
    pub async fn get(
        &self,
        project_id: Uuid,
        view_id: Uuid,
        user_id: UserId,
    ) -> Option<FilterSortPreference> {
        self.prefs
            .lock()
            .await
            .get(&(project_id, view_id, user_id))
            .cloned()
    }
}
