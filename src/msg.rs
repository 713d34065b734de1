//! Helpers for assembling and inspecting [`Message`]s.

use std::net::IpAddr;

use hickory_proto::{
    op::{Edns, Message, MessageType, OpCode, Query},
    rr::{RData, Record, RecordType},
};
use hickory_proto::rr::Name;

use crate::error::Error;

/// EDNS advertised UDP payload size for queries built by the core.
pub(crate) const DEFAULT_UDP_PAYLOAD_SIZE: u16 = 4096;

/// A fresh, nonzero 16-bit transaction id.
pub(crate) fn fresh_id() -> u16 {
    loop {
        let id = rand::random::<u16>();
        if id != 0 {
            return id;
        }
    }
}

/// Canonicalize an already-parsed name: lowercase, fully qualified.
pub(crate) fn canonicalize(name: Name) -> Name {
    let mut name = name.to_lowercase();
    name.set_fqdn(true);
    name
}

/// Parse and canonicalize a host name from text.
///
/// Accepts both presentation format and UTF-8 (IDNA-mapped) input; the
/// result is lowercase and fully qualified.
pub fn canonical_name(host: &str) -> Result<Name, Error> {
    let name = Name::from_str_relaxed(host)?;
    Ok(canonicalize(name))
}

/// Build an iterative-mode request around a single query.
///
/// Fresh transaction id, recursion-desired off, and an EDNS0 OPT at the
/// given payload size with DO unset.
pub(crate) fn new_request(query: Query, udp_payload_size: u16) -> Message {
    let mut request = Message::new();
    request
        .set_id(fresh_id())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false)
        .add_query(query);

    let mut edns = Edns::new();
    edns.set_max_payload(udp_payload_size)
        .set_version(0)
        .set_dnssec_ok(false);
    request.set_edns(edns);

    request
}

/// Build a lookup request for `Exchanger::lookup`'s default body.
pub(crate) fn query_message(name: Name, rtype: RecordType) -> Message {
    new_request(Query::query(name, rtype), DEFAULT_UDP_PAYLOAD_SIZE)
}

/// Synthesize an empty reply to a request, echoing its id and questions.
pub(crate) fn reply_to(request: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .add_queries(request.queries().iter().cloned());
    reply
}

/// Does the answer section contain a record of this type?
pub(crate) fn has_answer_type(msg: &Message, rtype: RecordType) -> bool {
    msg.answers().iter().any(|rr| rr.record_type() == rtype)
}

/// Does the authority section contain a record of this type?
pub(crate) fn has_ns_type(msg: &Message, rtype: RecordType) -> bool {
    msg.name_servers()
        .iter()
        .any(|rr| rr.record_type() == rtype)
}

/// The first answer record of the given type, if any.
pub(crate) fn first_answer_of(msg: &Message, rtype: RecordType) -> Option<&Record> {
    msg.answers().iter().find(|rr| rr.record_type() == rtype)
}

/// The address carried by an A or AAAA record, if it is one.
pub(crate) fn record_ip(record: &Record) -> Option<IpAddr> {
    match record.data() {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

/// Drop AAAA records from every section of a response.
pub(crate) fn strip_aaaa(msg: &mut Message) {
    msg.answers_mut()
        .retain(|rr| rr.record_type() != RecordType::AAAA);
    msg.name_servers_mut()
        .retain(|rr| rr.record_type() != RecordType::AAAA);
    msg.additionals_mut()
        .retain(|rr| rr.record_type() != RecordType::AAAA);
}
