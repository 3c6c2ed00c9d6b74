//! Minimal DNS wire-format helpers
//!
//! The forwarder relays client messages verbatim; nothing in this service
//! rewrites a query or a response on the forwarding path. This module covers
//! the few places that genuinely need to look at wire bytes:
//!
//! - building the synthetic test query and the bootstrap lookups
//! - peeking at the header of an upstream reply (RCODE, ANCOUNT)
//! - extracting A records from a bootstrap answer
//!
//! Message construction and full parsing go through `hickory-proto`; the
//! header peeks read raw big-endian fields so the hot path never pays for a
//! full decode.
//!
//! # Example
//!
//! ```
//! use sdfw::dns::wire;
//! use hickory_proto::rr::RecordType;
//!
//! let query = wire::build_query("example.com", RecordType::A).unwrap();
//! assert!(query.len() > wire::MIN_MESSAGE_SIZE);
//! assert_eq!(wire::answer_count(&query), Some(0));
//! ```

use std::net::Ipv4Addr;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};

use super::error::{DnsError, DnsResult};

/// Minimum length of a DNS message (header only)
pub const MIN_MESSAGE_SIZE: usize = 12;

/// Maximum DNS message size over TCP (RFC 1035 two-byte length prefix)
pub const MAX_TCP_MESSAGE_SIZE: usize = 65535;

/// Maximum UDP datagram the forwarder will read (EDNS0-sized)
pub const MAX_UDP_DATAGRAM_SIZE: usize = 4096;

/// RCODE value for a successful response
pub const RCODE_NO_ERROR: u8 = 0;

/// Build a standard recursive query for `domain`
///
/// The message carries a random 16-bit ID, the RD flag, and a single IN
/// question of the given record type.
///
/// # Errors
///
/// Returns `DnsError::ConfigError` if the domain is not a valid DNS name,
/// or `DnsError::SerializeError` if encoding fails.
pub fn build_query(domain: &str, rtype: RecordType) -> DnsResult<Vec<u8>> {
    let name = Name::from_utf8(domain)
        .map_err(|e| DnsError::config(format!("invalid query domain '{domain}': {e}")))?;

    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, rtype));

    message
        .to_vec()
        .map_err(|e| DnsError::serialize(format!("failed to encode query for '{domain}': {e}")))
}

/// Read the 16-bit transaction ID from a raw message
///
/// Returns `None` if the buffer is shorter than a DNS header.
#[must_use]
pub fn message_id(message: &[u8]) -> Option<u16> {
    if message.len() < MIN_MESSAGE_SIZE {
        return None;
    }
    Some(u16::from_be_bytes([message[0], message[1]]))
}

/// Check whether the QR bit marks this message as a response
#[must_use]
pub fn is_response(message: &[u8]) -> Option<bool> {
    if message.len() < MIN_MESSAGE_SIZE {
        return None;
    }
    Some(message[2] & 0x80 != 0)
}

/// Extract the 4-bit RCODE from a raw message header
///
/// Returns `None` if the buffer is shorter than a DNS header.
#[must_use]
pub fn response_code(message: &[u8]) -> Option<u8> {
    if message.len() < MIN_MESSAGE_SIZE {
        return None;
    }
    Some(message[3] & 0x0F)
}

/// Extract ANCOUNT from a raw message header
#[must_use]
pub fn answer_count(message: &[u8]) -> Option<u16> {
    if message.len() < MIN_MESSAGE_SIZE {
        return None;
    }
    Some(u16::from_be_bytes([message[6], message[7]]))
}

/// Check that a raw response signals success and carries at least one answer
///
/// This is the acceptance test applied to synthetic probe replies.
#[must_use]
pub fn is_positive_answer(message: &[u8]) -> bool {
    is_response(message) == Some(true)
        && response_code(message) == Some(RCODE_NO_ERROR)
        && answer_count(message).is_some_and(|c| c > 0)
}

/// Extract all IPv4 addresses from the answer section of a response
///
/// Used by the bootstrap resolver only; compression pointers are handled by
/// the full decoder.
///
/// # Errors
///
/// Returns `DnsError::ParseError` if the message cannot be decoded.
pub fn parse_ipv4_answers(message: &[u8]) -> DnsResult<Vec<Ipv4Addr>> {
    let decoded = Message::from_vec(message)
        .map_err(|e| DnsError::parse(format!("failed to decode response: {e}")))?;

    Ok(decoded
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
        .collect())
}
