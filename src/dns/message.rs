//! RFC 1035 message types.
//!
//! The forwarder is transparent (RFC 5625): TYPE/CLASS/RCODE/OPCODE values
//! are carried through unexamined, so these are plain `u16`/`u8` fields
//! rather than enums.

use super::header::Header;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

/// A structural summary of an encoded buffer, produced without materializing
/// names or RDATA. Used by the truncator to drop trailing sections without a
/// full decode/re-encode round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    /// Total size of the message, in bytes, not including any framing prefix.
    pub size: usize,
    pub id: u16,
    pub answer_count: u16,
    pub authority_count: u16,
    pub additional_count: u16,
    /// Start offset of each question, in arrival order.
    pub question_offsets: Vec<usize>,
    /// Start offset of each RR spanning answer, authority, then additional,
    /// in that order.
    pub resource_record_offsets: Vec<usize>,
}
