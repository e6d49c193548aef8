//! DNS message helpers
//!
//! This proxy never hands IPv6 records to clients, synthesizes SERVFAIL
//! when the upstream cannot be reached, and keeps UDP replies inside the
//! client's advertised payload size.

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{Name, Record, RecordType};

/// Classic UDP payload limit for clients without EDNS
pub const MIN_UDP_PAYLOAD: u16 = 512;

/// Normalize a domain name: lowercase without the trailing root dot
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Normalize a wire-format [`Name`]
pub fn normalize(name: &Name) -> String {
    normalize_name(&name.to_ascii())
}

/// Copy header fields, questions and EDNS from `message` into a new message
fn copy_envelope(message: &Message) -> Message {
    let mut new_message = Message::new();
    new_message.set_id(message.id());
    new_message.set_message_type(message.message_type());
    new_message.set_op_code(message.op_code());
    new_message.set_authoritative(message.authoritative());
    new_message.set_truncated(message.truncated());
    new_message.set_recursion_desired(message.recursion_desired());
    new_message.set_recursion_available(message.recursion_available());
    new_message.set_authentic_data(message.authentic_data());
    new_message.set_checking_disabled(message.checking_disabled());
    new_message.set_response_code(message.response_code());

    for query in message.queries() {
        new_message.add_query(query.clone());
    }
    if let Some(edns) = message.extensions().clone() {
        new_message.set_edns(edns);
    }

    new_message
}

fn without_aaaa(records: &[Record]) -> impl Iterator<Item = Record> + '_ {
    records
        .iter()
        .filter(|r| r.record_type() != RecordType::AAAA)
        .cloned()
}

fn count_aaaa(records: &[Record]) -> usize {
    records
        .iter()
        .filter(|r| r.record_type() == RecordType::AAAA)
        .count()
}

/// Remove every AAAA record from the answer, authority and additional sections
///
/// Remaining records keep their relative order. Returns `None` when the
/// message carries no AAAA records, so callers can relay the upstream bytes
/// untouched.
pub fn strip_ipv6(message: &Message) -> Option<Message> {
    let removed = count_aaaa(message.answers())
        + count_aaaa(message.name_servers())
        + count_aaaa(message.additionals());
    if removed == 0 {
        return None;
    }

    log::debug!("Stripping {} AAAA record(s) from response {}", removed, message.id());

    let mut new_message = copy_envelope(message);
    for answer in without_aaaa(message.answers()) {
        new_message.add_answer(answer);
    }
    for ns in without_aaaa(message.name_servers()) {
        new_message.add_name_server(ns);
    }
    for additional in without_aaaa(message.additionals()) {
        new_message.add_additional(additional);
    }

    Some(new_message)
}

/// Build a SERVFAIL response for `query`
///
/// Keeps the id, opcode, question and RD flag; carries no records and no
/// detail about the failure.
pub fn servfail(query: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(ResponseCode::ServFail);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response
}

/// Largest UDP reply the client who sent `query` accepts
pub fn udp_payload_limit(query: &Message) -> usize {
    query
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload().max(MIN_UDP_PAYLOAD))
        .unwrap_or(MIN_UDP_PAYLOAD) as usize
}

/// Shrink an oversized UDP reply to header and question with TC set
///
/// Returns `None` when `response` already fits the client's limit. The
/// client is expected to retry over TCP.
pub fn truncate_for_udp(query: &Message, response: &[u8]) -> Option<Vec<u8>> {
    if response.len() <= udp_payload_limit(query) {
        return None;
    }

    let mut truncated = match Message::from_vec(response) {
        Ok(parsed) => copy_envelope(&parsed),
        Err(e) => {
            log::debug!("Oversized response does not parse, truncating from query: {}", e);
            let mut m = copy_envelope(query);
            m.set_message_type(MessageType::Response);
            m.set_recursion_available(true);
            m
        }
    };
    truncated.set_truncated(true);

    match truncated.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::warn!("Failed to serialize truncated response: {}", e);
            None
        }
    }
}
