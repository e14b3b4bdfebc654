use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::services::cdc::LifecycleState;

pub type Result<T> = std::result::Result<T, CdcError>;

#[derive(Debug, Error)]
pub enum CdcError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transient broker error: {0}")]
    TransientBroker(String),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Fatal connection error: {0}")]
    FatalConnection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CdcError {
    /// Check if error is transient (should retry)
    pub fn is_transient(&self) -> bool {
        match self {
            CdcError::TransientBroker(_) => true,
            CdcError::Kafka(e) => is_transient_kafka_error(e),
            _ => false,
        }
    }

    /// Map a broker error to the taxonomy used by the reader: fatal errors abort,
    /// everything else is retried with backoff.
    pub fn from_broker(err: KafkaError) -> Self {
        if is_fatal_kafka_error(&err) {
            CdcError::FatalConnection(err.to_string())
        } else {
            CdcError::TransientBroker(err.to_string())
        }
    }
}

/// Broker conditions that clear up on their own (timeouts, leader moves, transport hiccups).
pub fn is_transient_kafka_error(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::CoordinatorLoadInProgress
                | RDKafkaErrorCode::NotCoordinator
        )
    )
}

/// Broker conditions that retrying cannot fix.
pub fn is_fatal_kafka_error(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::Fatal
                | RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
        )
    )
}

/// A permanently malformed change envelope. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' has the wrong type: {reason}")]
    WrongType { field: &'static str, reason: String },

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

/// Failure reported by a single change handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_classification() {
        let timeout = KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut);
        assert!(is_transient_kafka_error(&timeout));
        assert!(matches!(
            CdcError::from_broker(timeout),
            CdcError::TransientBroker(_)
        ));

        let auth = KafkaError::MessageConsumption(RDKafkaErrorCode::SaslAuthenticationFailed);
        assert!(is_fatal_kafka_error(&auth));
        assert!(matches!(
            CdcError::from_broker(auth),
            CdcError::FatalConnection(_)
        ));
    }

    #[test]
    fn test_only_broker_errors_are_transient() {
        assert!(CdcError::TransientBroker("leader moved".into()).is_transient());
        assert!(!CdcError::Decode(DecodeError::NotAnObject).is_transient());
        assert!(!CdcError::FatalConnection("down".into()).is_transient());
        assert!(!CdcError::Handler(HandlerError::failed("boom")).is_transient());
    }

    #[test]
    fn test_decode_error_messages() {
        assert_eq!(
            DecodeError::MissingField("op").to_string(),
            "missing required field 'op'"
        );
        assert_eq!(
            DecodeError::TooLarge {
                size: 10,
                limit: 5
            }
            .to_string(),
            "payload of 10 bytes exceeds the 5 byte limit"
        );
    }
}
