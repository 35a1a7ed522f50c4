//! Producer session state: identity, sequence cursor and lifecycle phase
//!
//! ```text
//! Created -> Connecting -> AwaitingRegistration -> Active -> Closing -> Closed
//!                                ^                    |
//!                                +--- Reconnecting <--+
//! ```
//!
//! All transitions go through [`SessionState`]; the producer keeps it behind a
//! lock that is never held across an await.

use crate::connection::Connection;
use crate::error::PulsarFlexError;
use crate::protocol::SequenceId;
use crate::sequence::{start_after, SequenceAllocator};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Connecting,
    AwaitingRegistration,
    Active,
    Reconnecting,
    Closing,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a successful registration related to the previous identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First registration of this session
    First,
    /// Re-registration under the same producer name; cursor kept
    Resumed,
    /// The broker issued a different producer name; cursor reset
    Renamed,
}

#[derive(Debug)]
pub struct SessionState {
    phase: Phase,
    requested_name: Option<String>,
    producer_name: Option<String>,
    sequence: SequenceAllocator,
    connection: Option<Arc<Connection>>,
    hooked_connection: Option<u64>,
    reconnect_error: Option<String>,
    /// Unfinished sends, flagged once written under the current registration
    outstanding: BTreeMap<SequenceId, bool>,
}

impl SessionState {
    pub fn new(requested_name: Option<String>) -> Self {
        Self {
            phase: Phase::Created,
            requested_name,
            producer_name: None,
            sequence: SequenceAllocator::default(),
            connection: None,
            hooked_connection: None,
            reconnect_error: None,
            outstanding: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn producer_name(&self) -> Option<&str> {
        self.producer_name.as_deref()
    }

    /// Name to send in the Producer command: the broker-assigned one once
    /// known, else whatever the caller configured
    pub fn name_to_request(&self) -> Option<String> {
        self.producer_name
            .clone()
            .or_else(|| self.requested_name.clone())
    }

    pub fn next_sequence_id(&self) -> SequenceId {
        self.sequence.current()
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    pub fn reconnect_error(&self) -> Option<&str> {
        self.reconnect_error.as_deref()
    }

    /// Start a registration handshake. Returns the phase to fall back to if
    /// the handshake fails.
    pub fn begin_connect(&mut self) -> Result<Phase, PulsarFlexError> {
        let fallback = match self.phase {
            Phase::Created | Phase::Closed | Phase::Reconnecting => self.phase,
            Phase::Active => Phase::Reconnecting,
            Phase::Connecting | Phase::AwaitingRegistration | Phase::Closing => {
                return Err(PulsarFlexError::protocol(format!(
                    "Cannot register while {}",
                    self.phase
                )))
            }
        };
        self.phase = Phase::Connecting;
        Ok(fallback)
    }

    /// The transport is ready. Returns true if this connection has not had
    /// the reconnect hooks installed yet.
    pub fn connected(&mut self, connection: Arc<Connection>) -> bool {
        let id = connection.id();
        self.connection = Some(connection);
        self.phase = Phase::AwaitingRegistration;

        if self.hooked_connection == Some(id) {
            false
        } else {
            self.hooked_connection = Some(id);
            true
        }
    }

    /// The broker accepted the registration
    pub fn registered(&mut self, producer_name: String, last_sequence_id: i64) -> Registration {
        let start = start_after(last_sequence_id);
        let registration = match self.producer_name.as_deref() {
            None => Registration::First,
            Some(previous) if previous == producer_name => Registration::Resumed,
            Some(_) => Registration::Renamed,
        };

        match registration {
            Registration::Resumed => self.sequence.advance_to(start),
            Registration::First | Registration::Renamed => self.sequence.reset(start),
        }

        // Every unfinished send has to go out again, oldest first
        for written in self.outstanding.values_mut() {
            *written = false;
        }

        self.producer_name = Some(producer_name);
        self.reconnect_error = None;
        self.phase = Phase::Active;
        registration
    }

    pub fn registration_failed(&mut self, fallback: Phase) {
        self.phase = fallback;
        if matches!(fallback, Phase::Created | Phase::Closed) {
            self.connection = None;
        }
    }

    /// Leave `Active` because the registration was lost. `lost_connection`
    /// restricts the transition to losses of the current connection.
    pub fn begin_reconnect(&mut self, lost_connection: Option<u64>) -> bool {
        if self.phase != Phase::Active {
            return false;
        }
        let current = self.connection.as_ref().map(|c| c.id());
        if lost_connection.is_some() && lost_connection != current {
            return false;
        }

        self.phase = Phase::Reconnecting;
        self.connection = None;
        true
    }

    pub fn reconnect_failed(&mut self, reason: String) {
        self.phase = Phase::Reconnecting;
        self.connection = None;
        self.reconnect_error = Some(reason);
    }

    /// Start retiring the producer. Returns the connection to send the
    /// CloseProducer on, if the producer is currently registered.
    pub fn begin_close(&mut self) -> Option<Arc<Connection>> {
        let connection = match self.phase {
            Phase::Active => self.connection.clone(),
            _ => None,
        };
        self.phase = Phase::Closing;
        connection
    }

    pub fn closed(&mut self) {
        self.phase = Phase::Closed;
        self.connection = None;
        self.hooked_connection = None;
    }

    fn usable(&self) -> Result<(), PulsarFlexError> {
        match self.phase {
            Phase::Created => Err(PulsarFlexError::NotRegistered),
            Phase::Closing | Phase::Closed => Err(PulsarFlexError::ProducerClosed),
            Phase::Reconnecting => match &self.reconnect_error {
                Some(reason) => Err(PulsarFlexError::reconnect_failed(reason.clone())),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Assign the sequence id of a new logical send and track it until
    /// [`SessionState::finish`]
    pub fn allocate_sequence(&mut self) -> Result<SequenceId, PulsarFlexError> {
        self.usable()?;
        let sequence_id = self.sequence.next();
        self.outstanding.insert(sequence_id, false);
        Ok(sequence_id)
    }

    /// Connection and producer name for writing `sequence_id`, or `None` while
    /// it has to wait: the producer is not active on a live connection, or an
    /// older send has not been written under the current registration yet.
    pub fn send_turn(
        &self,
        sequence_id: SequenceId,
    ) -> Result<Option<(Arc<Connection>, String)>, PulsarFlexError> {
        self.usable()?;

        let (connection, name) = match (&self.phase, &self.connection, &self.producer_name) {
            (Phase::Active, Some(connection), Some(name)) if connection.is_healthy() => {
                (connection, name)
            }
            _ => return Ok(None),
        };
        if self
            .outstanding
            .range(..sequence_id)
            .any(|(_, written)| !written)
        {
            return Ok(None);
        }

        Ok(Some((connection.clone(), name.clone())))
    }

    pub fn mark_written(&mut self, sequence_id: SequenceId) {
        if let Some(written) = self.outstanding.get_mut(&sequence_id) {
            *written = true;
        }
    }

    /// A failed write has to go out again before anything newer
    pub fn mark_unwritten(&mut self, sequence_id: SequenceId) {
        if let Some(written) = self.outstanding.get_mut(&sequence_id) {
            *written = false;
        }
    }

    /// Stop tracking a send that succeeded or gave up
    pub fn finish(&mut self, sequence_id: SequenceId) {
        self.outstanding.remove(&sequence_id);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(name: &str, last_sequence_id: i64) -> SessionState {
        let mut state = SessionState::new(None);
        state.begin_connect().unwrap();
        state.phase = Phase::AwaitingRegistration;
        state.registered(name.to_string(), last_sequence_id);
        state
    }

    #[test]
    fn test_sends_rejected_before_create() {
        let mut state = SessionState::new(None);
        assert!(matches!(
            state.allocate_sequence(),
            Err(PulsarFlexError::NotRegistered)
        ));
        assert_eq!(state.producer_name(), None);
    }

    #[test]
    fn test_registration_sets_cursor() {
        let mut state = active("p-1", 41);
        assert_eq!(state.phase(), Phase::Active);
        assert_eq!(state.producer_name(), Some("p-1"));
        assert_eq!(state.allocate_sequence().unwrap(), 42);
        assert_eq!(state.allocate_sequence().unwrap(), 43);
    }

    #[test]
    fn test_resumed_registration_keeps_cursor() {
        let mut state = active("p-1", 41);
        state.allocate_sequence().unwrap();
        state.allocate_sequence().unwrap();

        state.phase = Phase::Reconnecting;
        state.begin_connect().unwrap();
        // Broker only persisted 42 before the outage
        assert_eq!(state.registered("p-1".to_string(), 42), Registration::Resumed);
        assert_eq!(state.next_sequence_id(), 44);
    }

    #[test]
    fn test_renamed_registration_resets_cursor() {
        let mut state = active("p-1", 41);
        state.allocate_sequence().unwrap();

        state.phase = Phase::Reconnecting;
        state.begin_connect().unwrap();
        assert_eq!(state.registered("p-2".to_string(), -1), Registration::Renamed);
        assert_eq!(state.next_sequence_id(), 0);
        assert_eq!(state.name_to_request(), Some("p-2".to_string()));
    }

    #[test]
    fn test_requested_name_used_until_assigned() {
        let state = SessionState::new(Some("orders".to_string()));
        assert_eq!(state.name_to_request(), Some("orders".to_string()));
    }

    #[test]
    fn test_reconnect_only_from_active() {
        let mut state = SessionState::new(None);
        assert!(!state.begin_reconnect(None));

        let mut state = active("p-1", -1);
        assert!(state.begin_reconnect(None));
        assert_eq!(state.phase(), Phase::Reconnecting);
        assert!(!state.begin_reconnect(None));

        // Sends park rather than fail while reconnecting
        assert_eq!(state.allocate_sequence().unwrap(), 0);
        assert!(state.send_turn(0).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sends_written_oldest_first() {
        let (connection, _broker) = crate::connection::tests::connected_pair().await;
        let mut state = SessionState::new(None);
        state.begin_connect().unwrap();
        state.connected(Arc::new(connection));
        state.registered("p-1".to_string(), -1);

        let first = state.allocate_sequence().unwrap();
        let second = state.allocate_sequence().unwrap();

        assert!(state.send_turn(second).unwrap().is_none());
        let (_, name) = state.send_turn(first).unwrap().unwrap();
        assert_eq!(name, "p-1");
        state.mark_written(first);
        assert!(state.send_turn(second).unwrap().is_some());
        state.mark_written(second);

        // A re-registration puts everything unfinished back in line
        state.registered("p-1".to_string(), -1);
        assert!(state.send_turn(second).unwrap().is_none());

        // Finishing the older send unblocks the newer one
        state.finish(first);
        assert!(state.send_turn(second).unwrap().is_some());
        state.finish(second);
        assert_eq!(state.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_blocks_newer_sends() {
        let (connection, _broker) = crate::connection::tests::connected_pair().await;
        let mut state = SessionState::new(None);
        state.begin_connect().unwrap();
        state.connected(Arc::new(connection));
        state.registered("p-1".to_string(), -1);

        let first = state.allocate_sequence().unwrap();
        let second = state.allocate_sequence().unwrap();
        state.mark_written(first);
        state.mark_unwritten(first);

        assert!(state.send_turn(second).unwrap().is_none());
        assert!(state.send_turn(first).unwrap().is_some());
    }

    #[test]
    fn test_failed_reconnect_surfaces_on_next_send() {
        let mut state = active("p-1", -1);
        state.begin_reconnect(None);
        state.reconnect_failed("ProducerFenced".to_string());

        assert!(matches!(
            state.allocate_sequence(),
            Err(PulsarFlexError::ReconnectFailed { .. })
        ));
        assert_eq!(state.reconnect_error(), Some("ProducerFenced"));
    }

    #[test]
    fn test_close_without_registration_needs_no_round_trip() {
        let mut state = SessionState::new(None);
        assert!(state.begin_close().is_none());
        state.closed();
        assert_eq!(state.phase(), Phase::Closed);
        assert!(matches!(
            state.allocate_sequence(),
            Err(PulsarFlexError::ProducerClosed)
        ));

        // A fresh create is allowed after close
        assert_eq!(state.begin_connect().unwrap(), Phase::Closed);
    }

    #[test]
    fn test_failed_first_registration_falls_back() {
        let mut state = SessionState::new(None);
        let fallback = state.begin_connect().unwrap();
        state.registration_failed(fallback);
        assert_eq!(state.phase(), Phase::Created);

        state.begin_connect().unwrap();
        assert!(state.begin_connect().is_err());
    }
}
