//! Captive-portal DNS answers: every A query resolves to the portal address.

use std::net::Ipv4Addr;

pub const DNS_PORT: u16 = 53;
pub const CAPTIVE_TTL_SECS: u32 = 60;

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;
const FLAG_RECURSION_AVAILABLE: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;

/// Builds the reply for one query datagram. Returns `None` for anything that
/// is not a well-formed standard query; those are dropped without an answer.
/// Non-A questions get an empty NOERROR reply.
pub fn captive_reply(query: &[u8], answer: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let flags = read_u16(query, 2);
    if flags & FLAG_RESPONSE != 0 || flags & OPCODE_MASK != 0 {
        return None;
    }
    if read_u16(query, 4) == 0 {
        return None;
    }

    let question_end = question_end(query)?;
    let qtype = read_u16(query, question_end - 4);
    let qclass = read_u16(query, question_end - 2);
    let answers = u16::from(matches!(qtype, TYPE_A | TYPE_ANY) && qclass == CLASS_IN);

    let mut reply = Vec::with_capacity(question_end + 16);
    reply.extend_from_slice(&query[0..2]);
    let reply_flags = FLAG_RESPONSE
        | FLAG_AUTHORITATIVE
        | FLAG_RECURSION_AVAILABLE
        | (flags & FLAG_RECURSION_DESIRED);
    reply.extend_from_slice(&reply_flags.to_be_bytes());
    reply.extend_from_slice(&1_u16.to_be_bytes());
    reply.extend_from_slice(&answers.to_be_bytes());
    reply.extend_from_slice(&[0, 0, 0, 0]);
    reply.extend_from_slice(&query[HEADER_LEN..question_end]);

    if answers == 1 {
        // Name is a pointer back to the question.
        reply.extend_from_slice(&[0xC0, HEADER_LEN as u8]);
        reply.extend_from_slice(&TYPE_A.to_be_bytes());
        reply.extend_from_slice(&CLASS_IN.to_be_bytes());
        reply.extend_from_slice(&CAPTIVE_TTL_SECS.to_be_bytes());
        reply.extend_from_slice(&4_u16.to_be_bytes());
        reply.extend_from_slice(&answer.octets());
    }
    Some(reply)
}

/// Decoded name of the first question, for logging.
pub fn query_name(query: &[u8]) -> Option<String> {
    let end = question_end(query)?;
    let mut labels = Vec::new();
    let mut pos = HEADER_LEN;
    while pos < end - 4 {
        let len = usize::from(query[pos]);
        if len == 0 {
            break;
        }
        labels.push(String::from_utf8_lossy(&query[pos + 1..pos + 1 + len]).into_owned());
        pos += 1 + len;
    }
    Some(labels.join("."))
}

/// Offset just past QTYPE/QCLASS of the first question.
fn question_end(query: &[u8]) -> Option<usize> {
    let mut pos = HEADER_LEN;
    loop {
        let len = usize::from(*query.get(pos)?);
        if len == 0 {
            pos += 1;
            break;
        }
        // Queries never carry compression pointers; reject them with other
        // oversized labels.
        if len > 63 {
            return None;
        }
        pos += 1 + len;
    }
    let end = pos + 4;
    (end <= query.len()).then_some(end)
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}
