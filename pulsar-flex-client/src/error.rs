//! Error types for the pulsar-flex client library

/// Main error type for producer and transport operations
#[derive(Debug, thiserror::Error)]
pub enum PulsarFlexError {
    /// A message was submitted without a payload
    #[error("Message payload is missing")]
    PayloadMissing,

    /// A batch was submitted without any message
    #[error("Batch contains no messages")]
    EmptyBatch,

    /// The broker answered a create/close request with an error command
    #[error("Broker rejected request: {code:?}: {message}")]
    BrokerRejected { code: ServerError, message: String },

    /// The broker answered a send with a send error
    #[error("Broker rejected send {sequence_id}: {code:?}: {message}")]
    SendRejected {
        sequence_id: u64,
        code: ServerError,
        message: String,
    },

    /// The producer was never registered with the broker
    #[error("Producer has not been created")]
    NotRegistered,

    /// The producer was closed
    #[error("Producer is closed")]
    ProducerClosed,

    /// Re-registration after a lost connection failed for good
    #[error("Producer reconnect failed: {message}")]
    ReconnectFailed { message: String },

    /// The send retry budget ran out
    #[error("Send failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: Box<PulsarFlexError>,
    },

    /// Connection-related errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The connection carrying a pending request went away
    #[error("Connection lost")]
    ConnectionLost,

    /// None of the discovery servers could be reached
    #[error("No available brokers")]
    NoBrokersAvailable,

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Protocol-related errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl PulsarFlexError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a reconnect failure carrying the cause's description
    pub fn reconnect_failed<S: Into<String>>(message: S) -> Self {
        Self::ReconnectFailed {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Whether a send that failed with this error may be re-issued once the
    /// producer is registered again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionLost
                | Self::NoBrokersAvailable
                | Self::Io(_)
                | Self::SendRejected { .. }
        )
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionLost | Self::NoBrokersAvailable | Self::Io(_)
        )
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Broker error code, if the broker reported one
    pub fn server_error(&self) -> Option<ServerError> {
        match self {
            Self::BrokerRejected { code, .. } | Self::SendRejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Broker error codes carried by `Error` and `SendError` commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerError {
    UnknownError = 0,
    MetadataError = 1,
    PersistenceError = 2,
    AuthenticationError = 3,
    AuthorizationError = 4,
    ConsumerBusy = 5,
    ServiceNotReady = 6,
    ProducerBlockedQuotaExceededError = 7,
    ProducerBlockedQuotaExceededException = 8,
    ChecksumError = 9,
    UnsupportedVersionError = 10,
    TopicNotFound = 11,
    SubscriptionNotFound = 12,
    ConsumerNotFound = 13,
    TooManyRequests = 14,
    TopicTerminatedError = 15,
    ProducerBusy = 16,
    InvalidTopicName = 17,
    IncompatibleSchema = 18,
    ConsumerAssignError = 19,
    TransactionCoordinatorNotFound = 20,
    InvalidTxnStatus = 21,
    NotAllowedError = 22,
    TransactionConflict = 23,
    TransactionNotFound = 24,
    ProducerFenced = 25,
}

impl ServerError {
    /// Whether the broker condition is expected to clear on its own
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ServerError::ServiceNotReady
                | ServerError::TooManyRequests
                | ServerError::PersistenceError
                | ServerError::MetadataError
        )
    }

    /// Whether this code means another producer took over the topic
    pub fn is_fencing(self) -> bool {
        matches!(self, ServerError::ProducerFenced | ServerError::ProducerBusy)
    }
}

impl From<u8> for ServerError {
    fn from(code: u8) -> Self {
        match code {
            1 => ServerError::MetadataError,
            2 => ServerError::PersistenceError,
            3 => ServerError::AuthenticationError,
            4 => ServerError::AuthorizationError,
            5 => ServerError::ConsumerBusy,
            6 => ServerError::ServiceNotReady,
            7 => ServerError::ProducerBlockedQuotaExceededError,
            8 => ServerError::ProducerBlockedQuotaExceededException,
            9 => ServerError::ChecksumError,
            10 => ServerError::UnsupportedVersionError,
            11 => ServerError::TopicNotFound,
            12 => ServerError::SubscriptionNotFound,
            13 => ServerError::ConsumerNotFound,
            14 => ServerError::TooManyRequests,
            15 => ServerError::TopicTerminatedError,
            16 => ServerError::ProducerBusy,
            17 => ServerError::InvalidTopicName,
            18 => ServerError::IncompatibleSchema,
            19 => ServerError::ConsumerAssignError,
            20 => ServerError::TransactionCoordinatorNotFound,
            21 => ServerError::InvalidTxnStatus,
            22 => ServerError::NotAllowedError,
            23 => ServerError::TransactionConflict,
            24 => ServerError::TransactionNotFound,
            25 => ServerError::ProducerFenced,
            _ => ServerError::UnknownError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PulsarFlexError::ConnectionLost.is_transient());
        assert!(PulsarFlexError::SendRejected {
            sequence_id: 3,
            code: ServerError::PersistenceError,
            message: "bookie down".to_string(),
        }
        .is_transient());

        assert!(!PulsarFlexError::PayloadMissing.is_transient());
        assert!(!PulsarFlexError::timeout(100).is_transient());
        assert!(!PulsarFlexError::reconnect_failed("fenced").is_transient());
        assert!(!PulsarFlexError::BrokerRejected {
            code: ServerError::ProducerBusy,
            message: "busy".to_string(),
        }
        .is_transient());
    }

    #[test]
    fn test_server_error_codes() {
        assert_eq!(ServerError::from(25), ServerError::ProducerFenced);
        assert_eq!(ServerError::from(6), ServerError::ServiceNotReady);
        assert_eq!(ServerError::from(200), ServerError::UnknownError);
        assert_eq!(ServerError::ProducerFenced as u8, 25);

        assert!(ServerError::ProducerFenced.is_fencing());
        assert!(!ServerError::ProducerFenced.is_retryable());
        assert!(ServerError::ServiceNotReady.is_retryable());
    }

    #[test]
    fn test_server_error_accessor() {
        let err = PulsarFlexError::BrokerRejected {
            code: ServerError::TopicNotFound,
            message: "no such topic".to_string(),
        };
        assert_eq!(err.server_error(), Some(ServerError::TopicNotFound));
        assert_eq!(PulsarFlexError::ConnectionLost.server_error(), None);
        assert!(PulsarFlexError::ConnectionLost.is_connection_error());
        assert!(PulsarFlexError::timeout(5).is_timeout());
    }
}
