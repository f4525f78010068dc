//! Streaming structural view and size-limited truncation.
//!
//! The view never materializes names or RDATA; it only records where each
//! question and resource record begins, so the truncator can drop sections
//! from the tail without a full decode/re-encode round trip.

use super::codec::CodecError;
use super::header::{Header, HEADER_LEN};
use super::message::MessageView;
use super::name::{scan_name, NameScan};

/// Accumulates bytes across `feed` calls until a complete message has been
/// seen, then yields its `MessageView` and resets for the next message.
///
/// Callers are not required to hand this a single contiguous buffer for the
/// whole message up front; chunks of any size, in any split, are accepted.
#[derive(Default)]
pub struct ViewDecoder {
    pending: Vec<u8>,
}

pub enum ViewOutcome {
    Incomplete,
    Good(MessageView),
}

impl ViewDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<ViewOutcome, CodecError> {
        self.pending.extend_from_slice(chunk);
        match compute_view(&self.pending)? {
            Some(view) => {
                self.pending.clear();
                Ok(ViewOutcome::Good(view))
            }
            None => Ok(ViewOutcome::Incomplete),
        }
    }
}

/// Compute the structural view of a complete, already-assembled buffer.
pub fn structural_view(buf: &[u8]) -> Result<MessageView, CodecError> {
    compute_view(buf)?.ok_or(CodecError::Incomplete)
}

fn compute_view(buf: &[u8]) -> Result<Option<MessageView>, CodecError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);
    let nscount = u16::from_be_bytes([buf[8], buf[9]]);
    let arcount = u16::from_be_bytes([buf[10], buf[11]]);

    let mut offset = HEADER_LEN;
    let mut question_offsets = Vec::with_capacity(qdcount as usize);
    for _ in 0..qdcount {
        question_offsets.push(offset);
        let after_name = match scan_name(buf, offset, false, None)? {
            NameScan::Complete { end } => end,
            NameScan::NeedMoreData => return Ok(None),
        };
        let after_fields = after_name + 4; // QTYPE + QCLASS
        if after_fields > buf.len() {
            return Ok(None);
        }
        offset = after_fields;
    }

    let total_rrs = ancount as usize + nscount as usize + arcount as usize;
    let mut resource_record_offsets = Vec::with_capacity(total_rrs);
    for _ in 0..total_rrs {
        resource_record_offsets.push(offset);
        let after_name = match scan_name(buf, offset, false, None)? {
            NameScan::Complete { end } => end,
            NameScan::NeedMoreData => return Ok(None),
        };
        if after_name + 10 > buf.len() {
            return Ok(None);
        }
        let rdlength = u16::from_be_bytes([buf[after_name + 8], buf[after_name + 9]]) as usize;
        let rdata_end = after_name + 10 + rdlength;
        if rdata_end > buf.len() {
            return Ok(None);
        }
        offset = rdata_end;
    }

    Ok(Some(MessageView {
        size: offset,
        id,
        answer_count: ancount,
        authority_count: nscount,
        additional_count: arcount,
        question_offsets,
        resource_record_offsets,
    }))
}

fn pop_while_over_limit(new_size: &mut usize, count: &mut u16, offsets: &mut Vec<usize>, limit: usize) {
    while *count > 0 {
        *count -= 1;
        *new_size = offsets.pop().expect("count tracks offsets.len()");
        if *new_size < limit {
            return;
        }
    }
}

/// Truncate an encoded message in place to fit within `limit` bytes,
/// dropping whole RRs/questions from the tail (additional, then authority,
/// then answer, then questions) and setting the TC bit. `buf` holds the raw
/// message (no framing prefix).
pub fn truncate_message(buf: &mut Vec<u8>, limit: usize) -> Result<(), CodecError> {
    if limit <= HEADER_LEN {
        return Err(CodecError::Malformed("limit too small to hold a header"));
    }
    let view = structural_view(buf)?;
    if view.size <= limit {
        return Ok(());
    }

    let mut resource_record_offsets = view.resource_record_offsets;
    let mut question_offsets = view.question_offsets;
    let mut additional_count = view.additional_count;
    let mut authority_count = view.authority_count;
    let mut answer_count = view.answer_count;
    let mut question_count: u16 = question_offsets
        .len()
        .try_into()
        .map_err(|_| CodecError::Malformed("question count overflows u16"))?;
    let mut new_size = view.size;

    pop_while_over_limit(&mut new_size, &mut additional_count, &mut resource_record_offsets, limit);
    if new_size >= limit {
        pop_while_over_limit(&mut new_size, &mut authority_count, &mut resource_record_offsets, limit);
    }
    if new_size >= limit {
        pop_while_over_limit(&mut new_size, &mut answer_count, &mut resource_record_offsets, limit);
    }
    if new_size >= limit {
        pop_while_over_limit(&mut new_size, &mut question_count, &mut question_offsets, limit);
    }
    if new_size >= limit {
        return Err(CodecError::Malformed(
            "message cannot be truncated under the limit (impossible unless the view is wrong)",
        ));
    }

    buf.truncate(new_size);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    let flags = Header::set_truncated_flag(flags, true);
    buf[2..4].copy_from_slice(&flags.to_be_bytes());
    buf[4..6].copy_from_slice(&question_count.to_be_bytes());
    buf[6..8].copy_from_slice(&answer_count.to_be_bytes());
    buf[8..10].copy_from_slice(&authority_count.to_be_bytes());
    buf[10..12].copy_from_slice(&additional_count.to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::codec::encode_message;
    use crate::dns::header::Header;
    use crate::dns::message::{Message, Question, ResourceRecord};

    fn message_with_answers(n: usize) -> Message {
        Message {
            header: Header {
                id: 7,
                is_response: true,
                opcode: 0,
                authoritative: false,
                truncated: false,
                recursion_desired: true,
                recursion_available: true,
                z: 0,
                rcode: 0,
                qdcount: 1,
                ancount: n as u16,
                nscount: 0,
                arcount: 0,
            },
            questions: vec![Question {
                name: "example.com".into(),
                qtype: 1,
                qclass: 1,
            }],
            answers: (0..n)
                .map(|i| ResourceRecord {
                    name: "example.com".into(),
                    rtype: 1,
                    class: 1,
                    ttl: 300,
                    rdata: vec![10, 0, 0, i as u8],
                })
                .collect(),
            authorities: vec![],
            additional: vec![],
        }
    }

    #[test]
    fn view_size_matches_encoded_length() {
        let message = message_with_answers(3);
        let mut buf = Vec::new();
        encode_message(&message, &mut buf).unwrap();
        let view = structural_view(&buf).unwrap();
        assert_eq!(view.size, buf.len());
        assert_eq!(view.question_offsets.len(), 1);
        assert_eq!(view.resource_record_offsets.len(), 3);
    }

    #[test]
    fn feed_in_arbitrary_chunks_reports_incomplete_then_good() {
        let message = message_with_answers(1);
        let mut buf = Vec::new();
        encode_message(&message, &mut buf).unwrap();

        let mut decoder = ViewDecoder::new();
        for chunk in buf.chunks(3) {
            match decoder.feed(chunk).unwrap() {
                ViewOutcome::Incomplete => {}
                ViewOutcome::Good(view) => {
                    assert_eq!(view.size, buf.len());
                    return;
                }
            }
        }
        panic!("expected a Good outcome before running out of chunks");
    }

    #[test]
    fn truncate_sets_tc_bit_and_shrinks_counts() {
        let message = message_with_answers(50);
        let mut buf = Vec::new();
        encode_message(&message, &mut buf).unwrap();
        let original_len = buf.len();

        truncate_message(&mut buf, 100).unwrap();

        assert!(buf.len() <= 100);
        assert!(buf.len() < original_len);
        let flags = u16::from_be_bytes([buf[2], buf[3]]);
        let (.., truncated, _, _, _, _) = Header::decode_flags(flags);
        assert!(truncated);
        let view = structural_view(&buf).unwrap();
        assert_eq!(view.size, buf.len());
    }

    #[test]
    fn truncate_is_noop_when_already_within_limit() {
        let message = message_with_answers(1);
        let mut buf = Vec::new();
        encode_message(&message, &mut buf).unwrap();
        let before = buf.clone();
        truncate_message(&mut buf, 4096).unwrap();
        assert_eq!(buf, before);
    }

    #[test]
    fn truncate_fails_when_limit_smaller_than_header() {
        let message = message_with_answers(1);
        let mut buf = Vec::new();
        encode_message(&message, &mut buf).unwrap();
        assert!(truncate_message(&mut buf, 8).is_err());
    }
}
