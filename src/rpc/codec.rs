//! Payload codec and message framing
//!
//! Arguments and results travel as bincode. A message is a [`WireHeader`]
//! followed by exactly `payload_len` payload bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use crate::error::{Error, Result};
use super::header::{WireHeader, HEADER_LEN};

/// Default upper bound on one encoded message, header included
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Serialize a value into a payload
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize a payload
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(payload)?)
}

/// Frame a payload behind its header. Fails without producing any bytes when
/// the message would exceed `max_len`.
pub fn encode_message(mut header: WireHeader, payload: &[u8], max_len: usize) -> Result<Vec<u8>> {
    let needed = HEADER_LEN + payload.len();
    if needed > max_len {
        return Err(Error::EncodingRange {
            needed,
            available: max_len,
        });
    }

    header.payload_len = payload.len() as u64;
    let mut message = vec![0u8; needed];
    header.encode_into(&mut message[..HEADER_LEN])?;
    message[HEADER_LEN..].copy_from_slice(payload);
    Ok(message)
}

/// Split a received message into its header and payload
pub fn split_message(message: &[u8]) -> Result<(WireHeader, &[u8])> {
    let header = WireHeader::decode(message)?;
    let body = &message[HEADER_LEN..];
    let len = usize::try_from(header.payload_len).map_err(|_| Error::BadHeader {
        reason: format!("payload length {} does not fit in memory", header.payload_len),
    })?;
    if body.len() < len {
        return Err(Error::BadHeader {
            reason: format!("payload truncated: expected {} bytes, got {}", len, body.len()),
        });
    }
    Ok((header, &body[..len]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::header::MessageType;

    fn header() -> WireHeader {
        WireHeader::new(MessageType::Request, 42, 7, 9000, 0)
    }

    #[test]
    fn test_message_framing() {
        let payload = encode(&(3u32, "three".to_string())).unwrap();
        let message = encode_message(header(), &payload, DEFAULT_MAX_MESSAGE_LEN).unwrap();
        assert_eq!(message.len(), HEADER_LEN + payload.len());

        let (decoded, body) = split_message(&message).unwrap();
        assert_eq!(decoded.payload_len as usize, payload.len());
        assert_eq!(decoded.correlation_id, 42);
        let value: (u32, String) = decode(body).unwrap();
        assert_eq!(value, (3, "three".to_string()));
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let payload = vec![0u8; 100];
        assert_eq!(
            encode_message(header(), &payload, 64),
            Err(Error::EncodingRange { needed: 132, available: 64 })
        );
    }

    #[test]
    fn test_truncated_payload() {
        let message = encode_message(header(), &[1, 2, 3, 4], DEFAULT_MAX_MESSAGE_LEN).unwrap();
        assert!(matches!(
            split_message(&message[..HEADER_LEN + 2]),
            Err(Error::BadHeader { .. })
        ));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode::<String>(&[0xff]), Err(Error::Codec { .. })));
    }
}
