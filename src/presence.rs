//! Per-project user presence with sliding TTL and palette colors.
//!
//! A presence entry exists while the user has at least one live connection
//! somewhere, within TTL slack. Entries are never actively deleted on missed
//! heartbeats by any one process; they carry a deadline and every read path
//! evicts what has expired, so all processes converge on the same view of
//! who is present.
//!
//! ```text
//! connect ──► join ──► user_joined ─┐
//! heartbeat ─► refresh (TTL only)   ├─► project channel
//! navigate ──► update_view ─────────┤
//! focus ─────► update_focus ────────┤
//! disconnect ► leave ──► user_left ─┘
//! ```
//!
//! Colors come from a fixed six-entry palette and are unique within a
//! project; when the palette is exhausted the join is rejected, which caps
//! concurrent users per project at the palette size.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::bus::{project_channel, MemoryBus};
use crate::error::CollabError;
use crate::protocol::{PresenceUser, ServerEvent};
use crate::UserId;

/// Sliding TTL; a presence entry not refreshed within this window expires.
pub const PRESENCE_TTL: Duration = Duration::from_secs(30);

/// Catppuccin latte accents. Palette size doubles as the per-project cap.
pub const USER_COLORS: [&str; 6] = [
    "#e64553", // maroon
    "#04a5e5", // sky
    "#40a02b", // green
    "#8839ef", // mauve
    "#fe640b", // peach
    "#dc8a78", // rosewater
];

/// Maximum concurrent users per project.
pub const MAX_USERS: usize = USER_COLORS.len();

struct Entry {
    user: PresenceUser,
    deadline: Instant,
}

/// Presence store: who is in which project, with what color, looking where.
pub struct PresenceStore {
    bus: std::sync::Arc<MemoryBus>,
    ttl: Duration,
    projects: Mutex<HashMap<Uuid, HashMap<UserId, Entry>>>,
}

impl PresenceStore {
    pub fn new(bus: std::sync::Arc<MemoryBus>) -> Self {
        Self::with_ttl(bus, PRESENCE_TTL)
    }

    /// Custom TTL, for tests exercising expiry.
    pub fn with_ttl(bus: std::sync::Arc<MemoryBus>, ttl: Duration) -> Self {
        Self {
            bus,
            ttl,
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Add a user to a project's presence and announce the join.
    ///
    /// Returns the assigned color. Idempotent: a user already present keeps
    /// their color, gets their TTL extended, and no duplicate `user_joined`
    /// is published. Rejects with [`CollabError::CapacityExceeded`] when the
    /// palette has no free color left.
    pub async fn join(
        &self,
        project_id: Uuid,
        user_id: UserId,
        username: &str,
    ) -> Result<String, CollabError> {
        let deadline = Instant::now() + self.ttl;
        let (color, event) = {
            let mut projects = self.projects.lock().await;
            let users = projects.entry(project_id).or_default();
            evict_expired(users);

            if let Some(entry) = users.get_mut(&user_id) {
                entry.deadline = deadline;
                return Ok(entry.user.color.clone());
            }

            if users.len() >= MAX_USERS {
                return Err(CollabError::CapacityExceeded { max: MAX_USERS });
            }
            let color = USER_COLORS
                .iter()
                .find(|c| users.values().all(|e| e.user.color != **c))
                .copied()
                .ok_or(CollabError::CapacityExceeded { max: MAX_USERS })?;

            let user = PresenceUser {
                id: user_id,
                username: username.to_owned(),
                color: color.to_owned(),
                joined_at: Utc::now().timestamp(),
                current_view_id: None,
                focused_row_id: None,
            };
            let event = ServerEvent::UserJoined {
                id: user_id,
                username: user.username.clone(),
                color: user.color.clone(),
            };
            users.insert(user_id, Entry { user, deadline });
            (color.to_owned(), event)
        };

        self.publish(project_id, &event).await?;
        log::info!("user {user_id} joined project {project_id} with color {color}");
        Ok(color)
    }

    /// Extend the TTL of an existing entry. Heartbeats are not
    /// collaboration-visible, so nothing is published.
    pub async fn refresh(&self, project_id: Uuid, user_id: UserId) -> Result<(), CollabError> {
        let deadline = Instant::now() + self.ttl;
        let mut projects = self.projects.lock().await;
        if let Some(users) = projects.get_mut(&project_id) {
            evict_expired(users);
            if let Some(entry) = users.get_mut(&user_id) {
                entry.deadline = deadline;
            }
        }
        Ok(())
    }

    /// Remove a user from a project's presence and announce the leave.
    pub async fn leave(&self, project_id: Uuid, user_id: UserId) -> Result<(), CollabError> {
        {
            let mut projects = self.projects.lock().await;
            if let Some(users) = projects.get_mut(&project_id) {
                users.remove(&user_id);
                if users.is_empty() {
                    projects.remove(&project_id);
                }
            }
        }
        self.publish(project_id, &ServerEvent::UserLeft { id: user_id })
            .await?;
        log::info!("user {user_id} left project {project_id}");
        Ok(())
    }

    /// All live presence entries for a project.
    pub async fn list(&self, project_id: Uuid) -> Vec<PresenceUser> {
        let mut projects = self.projects.lock().await;
        match projects.get_mut(&project_id) {
            Some(users) => {
                evict_expired(users);
                users.values().map(|e| e.user.clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Record which view a user is looking at and announce the change.
    ///
    /// A user with no presence entry is silently ignored.
    pub async fn update_view(
        &self,
        project_id: Uuid,
        user_id: UserId,
        view_id: Option<Uuid>,
    ) -> Result<(), CollabError> {
        let updated = self
            .update_entry(project_id, user_id, |user| user.current_view_id = view_id)
            .await;
        if updated {
            self.publish(
                project_id,
                &ServerEvent::UserViewChanged {
                    id: user_id,
                    current_view_id: view_id,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Record which row a user has focused and announce the change.
    pub async fn update_focus(
        &self,
        project_id: Uuid,
        user_id: UserId,
        row_id: Option<Uuid>,
    ) -> Result<(), CollabError> {
        let updated = self
            .update_entry(project_id, user_id, |user| user.focused_row_id = row_id)
            .await;
        if updated {
            self.publish(
                project_id,
                &ServerEvent::UserFocusChanged {
                    id: user_id,
                    focused_row_id: row_id,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Whether a live presence entry exists.
    pub async fn contains(&self, project_id: Uuid, user_id: UserId) -> bool {
        let mut projects = self.projects.lock().await;
        projects.get_mut(&project_id).is_some_and(|users| {
            evict_expired(users);
            users.contains_key(&user_id)
        })
    }

    /// Mutate an existing entry and extend its TTL; false if absent.
    async fn update_entry(
        &self,
        project_id: Uuid,
        user_id: UserId,
        apply: impl FnOnce(&mut PresenceUser),
    ) -> bool {
        let deadline = Instant::now() + self.ttl;
        let mut projects = self.projects.lock().await;
        let Some(users) = projects.get_mut(&project_id) else {
            return false;
        };
        evict_expired(users);
        match users.get_mut(&user_id) {
            Some(entry) => {
                apply(&mut entry.user);
                entry.deadline = deadline;
                true
            }
            None => false,
        }
    }

    async fn publish(&self, project_id: Uuid, event: &ServerEvent) -> Result<(), CollabError> {
        let payload = event.encode()?;
        self.bus.publish(&project_channel(project_id), payload).await?;
        Ok(())
    }
}

fn evict_expired(users: &mut HashMap<UserId, Entry>) {
    let now = Instant::now();
    users.retain(|_, entry| entry.deadline > now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> PresenceStore {
        PresenceStore::new(Arc::new(MemoryBus::default()))
    }

    #[tokio::test]
    async fn test_join_assigns_palette_color() {
        let store = store();
        let project = Uuid::new_v4();
        let color = store.join(project, 1, "alice").await.unwrap();
        assert!(USER_COLORS.contains(&color.as_str()));
        assert_eq!(store.list(project).await.len(), 1);
    }

    #[tokio::test]
    async fn test_colors_are_unique_within_project() {
        let store = store();
        let project = Uuid::new_v4();
        let mut seen = std::collections::HashSet::new();
        for user in 0..MAX_USERS as i64 {
            let color = store.join(project, user, &format!("u{user}")).await.unwrap();
            assert!(seen.insert(color), "duplicate color handed out");
        }
    }

    #[tokio::test]
    async fn test_join_rejects_when_palette_exhausted() {
        let store = store();
        let project = Uuid::new_v4();
        for user in 0..MAX_USERS as i64 {
            store.join(project, user, "u").await.unwrap();
        }
        let err = store.join(project, 99, "late").await.unwrap_err();
        assert!(matches!(err, CollabError::CapacityExceeded { max } if max == MAX_USERS));
        assert_eq!(store.list(project).await.len(), MAX_USERS);
    }

    #[tokio::test]
    async fn test_capacity_is_per_project() {
        let store = store();
        let full = Uuid::new_v4();
        for user in 0..MAX_USERS as i64 {
            store.join(full, user, "u").await.unwrap();
        }
        // A different project is unaffected.
        store.join(Uuid::new_v4(), 99, "late").await.unwrap();
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let store = store();
        let project = Uuid::new_v4();
        let bus = store.bus.clone();
        let mut rx = bus.subscribe(&project_channel(project)).await;

        let first = store.join(project, 1, "alice").await.unwrap();
        let again = store.join(project, 1, "alice").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.list(project).await.len(), 1);

        // Exactly one user_joined published.
        assert!(rx.recv().await.unwrap().contains("user_joined"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_publishes_and_leave_publishes() {
        let bus = Arc::new(MemoryBus::default());
        let store = PresenceStore::new(bus.clone());
        let project = Uuid::new_v4();
        let mut rx = bus.subscribe(&project_channel(project)).await;

        store.join(project, 1, "alice").await.unwrap();
        let joined = ServerEvent::decode(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(joined, ServerEvent::UserJoined { id: 1, .. }));

        store.leave(project, 1).await.unwrap();
        let left = ServerEvent::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(left, ServerEvent::UserLeft { id: 1 });
        assert!(store.list(project).await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_does_not_publish() {
        let bus = Arc::new(MemoryBus::default());
        let store = PresenceStore::new(bus.clone());
        let project = Uuid::new_v4();
        store.join(project, 1, "alice").await.unwrap();

        let mut rx = bus.subscribe(&project_channel(project)).await;
        store.refresh(project, 1).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_entry_expires_without_refresh() {
        let bus = Arc::new(MemoryBus::default());
        let store = PresenceStore::with_ttl(bus, Duration::from_millis(20));
        let project = Uuid::new_v4();
        store.join(project, 1, "alice").await.unwrap();
        assert!(store.contains(project, 1).await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.contains(project, 1).await);
        assert!(store.list(project).await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_extends_ttl() {
        let bus = Arc::new(MemoryBus::default());
        let store = PresenceStore::with_ttl(bus, Duration::from_millis(50));
        let project = Uuid::new_v4();
        store.join(project, 1, "alice").await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            store.refresh(project, 1).await.unwrap();
        }
        assert!(store.contains(project, 1).await);
    }

    #[tokio::test]
    async fn test_expired_color_becomes_available_again() {
        let bus = Arc::new(MemoryBus::default());
        let store = PresenceStore::with_ttl(bus, Duration::from_millis(20));
        let project = Uuid::new_v4();
        for user in 0..MAX_USERS as i64 {
            store.join(project, user, "u").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        // All expired; a new join succeeds.
        store.join(project, 99, "late").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_view_publishes_and_sets_field() {
        let bus = Arc::new(MemoryBus::default());
        let store = PresenceStore::new(bus.clone());
        let project = Uuid::new_v4();
        let view = Uuid::new_v4();
        store.join(project, 1, "alice").await.unwrap();

        let mut rx = bus.subscribe(&project_channel(project)).await;
        store.update_view(project, 1, Some(view)).await.unwrap();

        let event = ServerEvent::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            event,
            ServerEvent::UserViewChanged { id: 1, current_view_id: Some(view) }
        );
        assert_eq!(store.list(project).await[0].current_view_id, Some(view));
    }

    #[tokio::test]
    async fn test_update_focus_publishes() {
        let bus = Arc::new(MemoryBus::default());
        let store = PresenceStore::new(bus.clone());
        let project = Uuid::new_v4();
        let row = Uuid::new_v4();
        store.join(project, 1, "alice").await.unwrap();

        let mut rx = bus.subscribe(&project_channel(project)).await;
        store.update_focus(project, 1, Some(row)).await.unwrap();
        let event = ServerEvent::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            event,
            ServerEvent::UserFocusChanged { id: 1, focused_row_id: Some(row) }
        );
    }

    #[tokio::test]
    async fn test_update_view_for_unknown_user_is_silent() {
        let bus = Arc::new(MemoryBus::default());
        let store = PresenceStore::new(bus.clone());
        let project = Uuid::new_v4();

        let mut rx = bus.subscribe(&project_channel(project)).await;
        store.update_view(project, 42, Some(Uuid::new_v4())).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_never_exceeds_palette() {
        let store = store();
        let project = Uuid::new_v4();
        for user in 0..20i64 {
            let _ = store.join(project, user, "u").await;
        }
        assert!(store.list(project).await.len() <= MAX_USERS);
    }
}
