//! Inbound message dispatch for an established collaboration socket.
//!
//! Decodes each JSON line off the socket and routes it to the store that
//! owns the state it touches. Unknown event kinds and malformed payloads
//! are logged and dropped; neither tears down the connection.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::{project_channel, MemoryBus};
use crate::error::CollabError;
use crate::prefs::{FilterSortPreference, PrefStore};
use crate::presence::PresenceStore;
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};
use crate::UserId;

/// Routes decoded client events to presence, preferences and chat.
pub struct MessageHandler {
    bus: Arc<MemoryBus>,
    presence: Arc<PresenceStore>,
    prefs: Arc<PrefStore>,
}

impl MessageHandler {
    pub fn new(bus: Arc<MemoryBus>, presence: Arc<PresenceStore>, prefs: Arc<PrefStore>) -> Self {
        Self { bus, presence, prefs }
    }

    /// Handle one raw message from a client.
    ///
    /// `reply` is the sending connection's own outbound queue; only
    /// `heartbeat_ack` goes there directly, everything else reaches clients
    /// through the event bus.
    pub async fn handle(
        &self,
        project_id: Uuid,
        user_id: UserId,
        username: &str,
        raw: &str,
        reply: &mpsc::Sender<String>,
    ) -> Result<(), CollabError> {
        let event = match ClientEvent::decode(raw) {
            Ok(event) => event,
            Err(ProtocolError::UnknownEvent(kind)) => {
                log::warn!("ignoring unknown event '{kind}' from user {user_id}");
                return Ok(());
            }
            Err(err) => {
                log::warn!("ignoring malformed message from user {user_id}: {err}");
                return Ok(());
            }
        };

        match event {
            ClientEvent::Heartbeat => {
                self.presence.refresh(project_id, user_id).await?;
                let ack = ServerEvent::HeartbeatAck.encode()?;
                if let Err(err) = reply.try_send(ack) {
                    log::warn!("dropping heartbeat_ack for user {user_id}: {err}");
                }
            }
            ClientEvent::ViewChange { view_id } => {
                self.presence.update_view(project_id, user_id, view_id).await?;
            }
            ClientEvent::FocusChange { row_id } => {
                self.presence.update_focus(project_id, user_id, row_id).await?;
            }
            ClientEvent::FilterSortUpdate { view_id, filter_model, sort_model } => {
                self.prefs
                    .save(
                        project_id,
                        view_id,
                        user_id,
                        FilterSortPreference { filter_model, sort_model },
                    )
                    .await?;
            }
            ClientEvent::ChatMessage { content, view_id } => {
                let event = ServerEvent::ChatMessage {
                    message_id: Uuid::new_v4(),
                    content,
                    user_id,
                    user_username: username.to_owned(),
                    view_id,
                    created_at: Utc::now(),
                };
                self.bus
                    .publish(&project_channel(project_id), event.encode()?)
                    .await?;
            }
        }
        Ok(())
    }
}
