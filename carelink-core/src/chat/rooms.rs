use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::connection::ConnectionHandle;
use crate::error::{ChatError, ChatResult};
use crate::models::{ConversationContext, Participant, RoomKey, Role};
use crate::protocol::OutboundEvent;

/// Join events for `room`, one per naming convention the backend listens to.
///
/// Fails without emitting anything when an identifier the room needs is
/// missing.
pub fn join_events(
    me: &Participant,
    context: &ConversationContext,
    room: &RoomKey,
) -> ChatResult<Vec<OutboundEvent>> {
    let mut events = Vec::new();
    if me.role == Role::Patient {
        events.push(OutboundEvent::JoinPatientRoom {
            user_id: me.id.clone(),
        });
    }

    match room {
        RoomKey::Order(order_id) => {
            let pharmacy_id = context
                .pharmacy()
                .ok_or_else(|| ChatError::MissingIdentifier("pharmacyId".to_string()))?;
            let patient_id = match me.role {
                Role::Patient => Some(me.id.clone()),
                _ => context.patient().map(str::to_string),
            };
            events.push(OutboundEvent::JoinOrderChatRoom {
                order_id: order_id.clone(),
            });
            events.push(OutboundEvent::JoinPharmacyChatRoom {
                pharmacy_id: pharmacy_id.to_string(),
                medical_request_id: Some(order_id.clone()),
                patient_id,
                order_id: Some(order_id.clone()),
            });
        }
        RoomKey::PharmacyPatient {
            pharmacy_id,
            patient_id,
        } => events.push(OutboundEvent::JoinPharmacyChatRoom {
            pharmacy_id: pharmacy_id.clone(),
            medical_request_id: None,
            patient_id: Some(patient_id.clone()),
            order_id: None,
        }),
        RoomKey::Direct { .. } => {}
    }
    Ok(events)
}

/// Tracks which rooms the current socket is subscribed to.
#[derive(Debug, Default)]
pub struct RoomJoiner {
    joined: Mutex<HashSet<RoomKey>>,
}

impl RoomJoiner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the room described by `context`. Joining a room twice is a no-op.
    pub async fn join_room(
        &self,
        connection: &ConnectionHandle,
        me: &Participant,
        context: &ConversationContext,
    ) -> ChatResult<RoomKey> {
        let room = context.room_key(me)?;
        let events = join_events(me, context, &room)?;

        if !connection.is_authenticated() {
            return Err(ChatError::NotConnected);
        }
        if self.is_joined(&room) {
            debug!(room = %room, "Room already joined");
            return Ok(room);
        }

        for event in &events {
            connection.emit(event).await?;
        }

        self.lock_joined().insert(room.clone());
        info!(room = %room, events = events.len(), "Joined chat room");
        Ok(room)
    }

    /// Forget a room locally. The backend has no leave event.
    pub fn leave_room(&self, room: &RoomKey) -> bool {
        self.lock_joined().remove(room)
    }

    pub fn is_joined(&self, room: &RoomKey) -> bool {
        self.lock_joined().contains(room)
    }

    pub fn joined(&self) -> Vec<RoomKey> {
        self.lock_joined().iter().cloned().collect()
    }

    /// Drop every subscription, e.g. after the socket went away.
    pub fn clear(&self) {
        self.lock_joined().clear();
    }

    fn lock_joined(&self) -> MutexGuard<'_, HashSet<RoomKey>> {
        self.joined.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
