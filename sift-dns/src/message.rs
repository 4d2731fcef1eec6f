//! DNS message construction and validation helpers
//!
//! Replies are either synthesized here (NXDOMAIN for blocked domains and
//! failed lookups, single-A answers for overrides, SERVFAIL) or rebuilt
//! from a stored message with only the request-specific parts replaced.

use std::net::Ipv4Addr;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};

use crate::name::normalize;

/// TTL for synthesized override answers.
pub const OVERRIDE_TTL: u32 = 300;

/// Response shell mirroring a request: same ID, opcode, question, and RD
/// flag, with the response bit set.
fn reply_shell(request: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(request.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(request.op_code());
    msg.set_recursion_desired(request.recursion_desired());
    msg.set_recursion_available(true);
    for query in request.queries() {
        msg.add_query(query.clone());
    }
    msg
}

/// NXDOMAIN reply with AA set, used for blocked domains and total upstream
/// failure.
pub fn nxdomain_reply(request: &Message) -> Message {
    let mut msg = reply_shell(request);
    msg.set_authoritative(true);
    msg.set_response_code(ResponseCode::NXDomain);
    msg
}

/// SERVFAIL reply for requests that cannot be answered at all.
pub fn servfail_reply(request: &Message) -> Message {
    let mut msg = reply_shell(request);
    msg.set_response_code(ResponseCode::ServFail);
    msg
}

/// Synthesized answer for an override entry: a single A record carrying the
/// configured address, TTL 300, AA set.
pub fn override_reply(request: &Message, ip: Ipv4Addr) -> Message {
    let mut msg = reply_shell(request);
    msg.set_authoritative(true);
    msg.set_response_code(ResponseCode::NoError);
    if let Some(query) = request.queries().first() {
        msg.add_answer(Record::from_rdata(
            query.name().clone(),
            OVERRIDE_TTL,
            RData::A(A(ip)),
        ));
    }
    msg
}

/// Rebuild a stored reply for a new request.
///
/// Only the transaction ID, question section, RD, and CD are taken from the
/// request; RCODE, all flags, and the answer/authority/additional sections
/// are preserved exactly as stored.
pub fn restamp(stored: &Message, request: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(request.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(stored.op_code());
    msg.set_authoritative(stored.authoritative());
    msg.set_truncated(stored.truncated());
    msg.set_recursion_desired(request.recursion_desired());
    msg.set_recursion_available(stored.recursion_available());
    msg.set_authentic_data(stored.authentic_data());
    msg.set_checking_disabled(request.checking_disabled());
    msg.set_response_code(stored.response_code());
    for query in request.queries() {
        msg.add_query(query.clone());
    }
    for answer in stored.answers() {
        msg.add_answer(answer.clone());
    }
    for ns in stored.name_servers() {
        msg.add_name_server(ns.clone());
    }
    for additional in stored.additionals() {
        msg.add_additional(additional.clone());
    }
    msg
}

/// A response is negative when its RCODE signals failure, or when NOERROR
/// carries no answers.
pub fn is_negative(resp: &Message) -> bool {
    match resp.response_code() {
        ResponseCode::NXDomain
        | ResponseCode::ServFail
        | ResponseCode::Refused
        | ResponseCode::NotImp => true,
        ResponseCode::NoError => resp.answers().is_empty(),
        _ => false,
    }
}

/// Check that a response actually answers the request: both carry a
/// question and the (normalized QNAME, QTYPE, QCLASS) triples agree.
pub fn response_matches(request: &Message, resp: &Message) -> bool {
    let req_q = match request.queries().first() {
        Some(q) => q,
        None => return false,
    };
    let resp_q = match resp.queries().first() {
        Some(q) => q,
        None => return false,
    };
    normalize(&req_q.name().to_string()) == normalize(&resp_q.name().to_string())
        && req_q.query_type() == resp_q.query_type()
        && req_q.query_class() == resp_q.query_class()
}
