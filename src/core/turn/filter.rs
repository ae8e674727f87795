//! Event staleness filter.
//!
//! Every turn-scoped event passes through [`ConnectionState::admit`] before
//! reaching the client. Events from unknown, suppressed or superseded turns
//! are dropped; survivors are stamped with the turn's index, epoch and the
//! next per-turn event index.

use tracing::debug;

use super::messages::{EventStamp, ServerMessage};
use super::state::ConnectionState;
use crate::core::processor::{TurnEvent, TurnPayload};

impl ConnectionState {
    /// Decide whether `event` may be delivered, stamping it if so.
    pub fn admit(&mut self, event: TurnEvent) -> Option<ServerMessage> {
        let TurnEvent {
            turn_id,
            mut payload,
        } = event;

        let Some(registered) = self.turns.get(&turn_id).copied() else {
            debug!(turn_id = %turn_id, event = payload.event_type(), "Dropping event from unknown turn");
            return None;
        };

        if let Some(suppression) = self.suppression.as_mut()
            && suppression.turn_id == turn_id
        {
            let passthrough = suppression.allow_cancelled_passthrough
                && !suppression.cancelled_delivered
                && matches!(payload, TurnPayload::Cancelled { .. });
            if !passthrough {
                debug!(turn_id = %turn_id, event = payload.event_type(), "Suppressing event from cancelled turn");
                return None;
            }
            suppression.cancelled_delivered = true;
            payload = TurnPayload::Cancelled {
                reason: Some(suppression.reason.as_str().to_string()),
            };
        }

        let current = self.active().is_some_and(|active| {
            active.turn_id == turn_id
                && active.epoch == registered.epoch
                && active.turn_index == registered.turn_index
        });
        if !current {
            debug!(
                turn_id = %turn_id,
                turn_index = registered.turn_index,
                epoch = registered.epoch,
                event = payload.event_type(),
                "Dropping event from superseded turn"
            );
            return None;
        }

        self.record_side_effects(&turn_id, registered.turn_index, &payload);

        let counter = self.event_counters.entry(turn_id.clone()).or_insert(0);
        let stamp = EventStamp {
            stream_epoch: registered.epoch,
            event_index: *counter,
        };
        *counter += 1;

        Some(ServerMessage::from_turn_event(
            turn_id,
            registered.turn_index,
            payload,
            stamp,
        ))
    }

    fn record_side_effects(&mut self, turn_id: &str, turn_index: u64, payload: &TurnPayload) {
        match payload {
            TurnPayload::AssistantTextDelta { text } => {
                if let Some(fragments) = self.accumulated_text.get_mut(turn_id) {
                    fragments.push(text.clone());
                }
            }
            TurnPayload::AssistantTextFinal { text } => {
                if let Some(fragments) = self.accumulated_text.get_mut(turn_id)
                    && fragments.is_empty()
                {
                    fragments.push(text.clone());
                }
            }
            TurnPayload::Completed { .. } => {
                self.mark_completed(turn_index);
                if let Some(fragments) = self.accumulated_text.get_mut(turn_id) {
                    fragments.clear();
                }
            }
            _ => {}
        }
    }
}
