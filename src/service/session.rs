//! Client sessions and the event side channel.
//!
//! A session is the unit of ownership for replicated services. Events
//! published to a session during command application are buffered and only
//! handed to the subscriber once the command has fully applied, so they
//! always trail the response to the triggering command.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Active,
    Expired,
    Closed,
}

impl SessionState {
    pub fn active(&self) -> bool {
        matches!(self, SessionState::Active)
    }
}

/// An event published by a service to one client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub session: u64,
    pub service: String,
    pub payload: Vec<u8>,
}

/// Registry of known sessions plus the event outbox.
#[derive(Default)]
pub struct Sessions {
    states: BTreeMap<u64, SessionState>,
    outbox: Vec<ServiceEvent>,
    delivered: Vec<ServiceEvent>,
    subscriber: Option<mpsc::UnboundedSender<ServiceEvent>>,
}

impl Sessions {
    pub fn new() -> Sessions {
        Sessions::default()
    }

    /// Registers a session if it is not already known.
    pub fn ensure_open(&mut self, session: u64) {
        self.states.entry(session).or_insert(SessionState::Active);
    }

    pub fn state(&self, session: u64) -> Option<SessionState> {
        self.states.get(&session).copied()
    }

    pub fn is_active(&self, session: u64) -> bool {
        self.states.get(&session).map_or(false, |s| s.active())
    }

    /// Marks the session expired. Returns whether it was active.
    pub fn expire(&mut self, session: u64) -> bool {
        self.transition(session, SessionState::Expired)
    }

    /// Marks the session closed. Returns whether it was active.
    pub fn close(&mut self, session: u64) -> bool {
        self.transition(session, SessionState::Closed)
    }

    fn transition(&mut self, session: u64, to: SessionState) -> bool {
        match self.states.get_mut(&session) {
            Some(state) if state.active() => {
                *state = to;
                true
            }
            Some(_) => false,
            None => false,
        }
    }

    /// Queues an event; it stays invisible until `flush`.
    pub fn publish(&mut self, event: ServiceEvent) {
        self.outbox.push(event);
    }

    /// Releases buffered events to the subscriber, or to the delivered
    /// queue when nobody subscribed.
    pub fn flush(&mut self) {
        for event in self.outbox.drain(..) {
            match &self.subscriber {
                Some(tx) => {
                    if tx.send(event.clone()).is_err() {
                        self.delivered.push(event);
                    }
                }
                None => self.delivered.push(event),
            }
        }
    }

    /// Attaches the event subscriber, replacing any previous one.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ServiceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    /// Drains events that were flushed without a subscriber.
    pub fn take_delivered(&mut self) -> Vec<ServiceEvent> {
        std::mem::take(&mut self.delivered)
    }

    pub fn states(&self) -> BTreeMap<u64, SessionState> {
        self.states.clone()
    }

    /// Replaces the session table from restored state. Buffered events and
    /// the subscriber are left alone.
    pub fn restore(&mut self, states: BTreeMap<u64, SessionState>) {
        self.states = states;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let mut sessions = Sessions::new();
        sessions.ensure_open(7);
        assert!(sessions.is_active(7));

        assert!(sessions.expire(7));
        assert!(!sessions.is_active(7));
        assert_eq!(sessions.state(7), Some(SessionState::Expired));

        // a dead session stays dead
        assert!(!sessions.close(7));
        assert!(!sessions.is_active(8));
    }

    #[test]
    fn events_are_held_until_flush() {
        let mut sessions = Sessions::new();
        sessions.ensure_open(1);
        sessions.publish(ServiceEvent {
            session: 1,
            service: "LOCK".into(),
            payload: vec![1],
        });

        assert!(sessions.take_delivered().is_empty());
        sessions.flush();
        let delivered = sessions.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].session, 1);
    }

    #[tokio::test]
    async fn subscriber_receives_flushed_events_in_order() {
        let mut sessions = Sessions::new();
        let mut rx = sessions.subscribe();
        sessions.ensure_open(1);

        sessions.publish(ServiceEvent {
            session: 1,
            service: "LOCK".into(),
            payload: vec![1],
        });
        sessions.publish(ServiceEvent {
            session: 1,
            service: "LOCK".into(),
            payload: vec![2],
        });
        sessions.flush();

        assert_eq!(rx.recv().await.unwrap().payload, vec![1]);
        assert_eq!(rx.recv().await.unwrap().payload, vec![2]);
    }
}
