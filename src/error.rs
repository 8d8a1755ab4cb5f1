//! Error types for RpcRoutines
//!
//! This module provides error handling types used throughout the library.

use thiserror::Error;

/// Main error type for RpcRoutines operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A destination did not answer before the request's timeout fired
    #[error("RPC response not returned within the timeout")]
    DeliveryTimeout,

    /// A request named a function identity that is not registered
    #[error("Function {id} is not registered")]
    UnknownFunction {
        /// Function identity carried by the request header
        id: u16,
    },

    /// The scheduler refused a commit because shutdown has begun
    #[error("Service has been stopped")]
    ServiceStopped,

    /// A message does not fit in the buffer reserved for it
    #[error("Encoding needs {needed} bytes but only {available} are available")]
    EncodingRange {
        /// Bytes required by the message
        needed: usize,
        /// Bytes available in the target buffer
        available: usize,
    },

    /// Payload encoding or decoding failed
    #[error("Codec error: {reason}")]
    Codec {
        /// Reason for the codec failure
        reason: String,
    },

    /// A received wire header is malformed
    #[error("Malformed wire header: {reason}")]
    BadHeader {
        /// Reason the header was rejected
        reason: String,
    },

    /// Transport setup failed
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for the transport failure
        reason: String,
    },

    /// Runtime error
    #[error("Runtime error: {reason}")]
    RuntimeError {
        /// Reason for the runtime error
        reason: String,
    },
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Codec {
            reason: err.to_string(),
        }
    }
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::UnknownFunction { id: 7 }.to_string(),
            "Function 7 is not registered"
        );
        assert_eq!(
            Error::EncodingRange { needed: 40, available: 32 }.to_string(),
            "Encoding needs 40 bytes but only 32 are available"
        );
    }

    #[test]
    fn test_bincode_error_maps_to_codec() {
        let err = bincode::deserialize::<u64>(&[1, 2]).unwrap_err();
        assert!(matches!(Error::from(err), Error::Codec { .. }));
    }
}
