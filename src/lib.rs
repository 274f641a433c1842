//! # grid-collab — Real-time collaboration core for tabular editors
//!
//! Presence, pub/sub fan-out, watch subscriptions and optimistic row
//! versioning for multi-user dataset editing over WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌──────────────────┐
//! │ editor tab  │ ◄───────────────► │  CollabServer    │
//! │ (per user)  │    JSON lines     │                  │
//! └─────────────┘                   └────────┬─────────┘
//!                                            │
//!                     ┌──────────────────────┼──────────────────────┐
//!                     ▼                      ▼                      ▼
//!              ┌─────────────┐       ┌──────────────┐       ┌──────────────┐
//!              │ Presence    │       │ Connection   │       │ Subscription │
//!              │ Store (TTL) │       │ Manager      │       │ Manager      │
//!              └──────┬──────┘       └──────┬───────┘       └──────┬───────┘
//!                     │                     │                      │
//!                     └──────────► MemoryBus (named channels) ◄────┘
//!                                           ▲
//!                            ┌──────────────┴─────────────┐
//!                            │ RowStore (version-checked) │
//!                            └────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (`event`-discriminated messages)
//! - [`bus`] — Named-channel publish/subscribe event bus
//! - [`presence`] — Per-project presence with TTL and palette colors
//! - [`prefs`] — Per-(project, view, user) filter/sort preferences
//! - [`rows`] — Row storage with optimistic concurrency control
//! - [`connection`] — Multi-tab connection lifecycle and fan-out
//! - [`subscription`] — Watch another user's filter/sort state
//! - [`handlers`] — Inbound message dispatch
//! - [`server`] — WebSocket collaboration server

pub mod bus;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod prefs;
pub mod presence;
pub mod protocol;
pub mod rows;
pub mod server;
pub mod subscription;

/// Application-level user identifier.
pub type UserId = i64;

// Re-exports for convenience
pub use bus::{project_channel, MemoryBus};
pub use connection::{ConnectionManager, HEARTBEAT_INTERVAL};
pub use error::CollabError;
pub use handlers::MessageHandler;
pub use prefs::{FilterSortPreference, PrefStore};
pub use presence::{PresenceStore, MAX_USERS, PRESENCE_TTL, USER_COLORS};
pub use protocol::{ClientEvent, PresenceUser, ProtocolError, ServerEvent, SortModelItem};
pub use rows::{ColumnType, Row, RowStore};
pub use server::{AccessControl, AllowAll, CollabServer, ProjectAccess, ServerConfig};
pub use subscription::SubscriptionManager;
