//! Full decode and encode of RFC 1035 messages.

use rustc_hash::FxHashMap;

use super::header::{Header, HEADER_LEN};
use super::message::{Message, Question, ResourceRecord};
use super::name::{encode_name, scan_name, NameScan};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed dns message: {0}")]
    Malformed(&'static str),
    /// Only produced by the streaming structural view; the full decoder
    /// treats a short buffer as `Malformed`.
    #[error("incomplete dns message")]
    Incomplete,
}

/// Decode a complete message buffer (no framing prefix).
pub fn decode_message(buf: &[u8]) -> Result<Message, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::Malformed("buffer shorter than header"));
    }
    let raw_id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);
    let nscount = u16::from_be_bytes([buf[8], buf[9]]);
    let arcount = u16::from_be_bytes([buf[10], buf[11]]);

    let (is_response, opcode, authoritative, truncated, recursion_desired, recursion_available, z, rcode) =
        Header::decode_flags(flags);

    let header = Header {
        id: raw_id,
        is_response,
        opcode,
        authoritative,
        truncated,
        recursion_desired,
        recursion_available,
        z,
        rcode,
        qdcount,
        ancount,
        nscount,
        arcount,
    };

    let mut offset = HEADER_LEN;
    let mut questions = Vec::with_capacity(qdcount as usize);
    for _ in 0..qdcount {
        let (question, next) = decode_question(buf, offset)?;
        questions.push(question);
        offset = next;
    }

    let mut answers = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        let (record, next) = decode_resource_record(buf, offset)?;
        answers.push(record);
        offset = next;
    }

    let mut authorities = Vec::with_capacity(nscount as usize);
    for _ in 0..nscount {
        let (record, next) = decode_resource_record(buf, offset)?;
        authorities.push(record);
        offset = next;
    }

    let mut additional = Vec::with_capacity(arcount as usize);
    for _ in 0..arcount {
        let (record, next) = decode_resource_record(buf, offset)?;
        additional.push(record);
        offset = next;
    }

    Ok(Message {
        header,
        questions,
        answers,
        authorities,
        additional,
    })
}

fn need_more_to_malformed(scan: NameScan) -> Result<usize, CodecError> {
    match scan {
        NameScan::Complete { end } => Ok(end),
        NameScan::NeedMoreData => Err(CodecError::Malformed("name extends past buffer")),
    }
}

fn decode_question(buf: &[u8], offset: usize) -> Result<(Question, usize), CodecError> {
    let mut name = String::new();
    let scan = scan_name(buf, offset, true, Some(&mut name))?;
    let after_name = need_more_to_malformed(scan)?;

    if after_name + 4 > buf.len() {
        return Err(CodecError::Malformed("question fields extend past buffer"));
    }
    let qtype = u16::from_be_bytes([buf[after_name], buf[after_name + 1]]);
    let qclass = u16::from_be_bytes([buf[after_name + 2], buf[after_name + 3]]);
    Ok((
        Question {
            name,
            qtype,
            qclass,
        },
        after_name + 4,
    ))
}

fn decode_resource_record(buf: &[u8], offset: usize) -> Result<(ResourceRecord, usize), CodecError> {
    let mut name = String::new();
    let scan = scan_name(buf, offset, true, Some(&mut name))?;
    let after_name = need_more_to_malformed(scan)?;

    if after_name + 10 > buf.len() {
        return Err(CodecError::Malformed(
            "resource record fields extend past buffer",
        ));
    }
    let rtype = u16::from_be_bytes([buf[after_name], buf[after_name + 1]]);
    let class = u16::from_be_bytes([buf[after_name + 2], buf[after_name + 3]]);
    let ttl = u32::from_be_bytes([
        buf[after_name + 4],
        buf[after_name + 5],
        buf[after_name + 6],
        buf[after_name + 7],
    ]);
    let rdlength = u16::from_be_bytes([buf[after_name + 8], buf[after_name + 9]]) as usize;
    let rdata_start = after_name + 10;
    let rdata_end = rdata_start + rdlength;
    if rdata_end > buf.len() {
        return Err(CodecError::Malformed("rdata extends past buffer"));
    }
    let rdata = buf[rdata_start..rdata_end].to_vec();
    Ok((
        ResourceRecord {
            name,
            rtype,
            class,
            ttl,
            rdata,
        },
        rdata_end,
    ))
}

/// Encode `message` into `buf`, appending starting at `buf.len()`.
///
/// The caller is expected to have already reserved any framing prefix (the
/// TCP 2-byte length) in `buf` before calling this.
pub fn encode_message(message: &Message, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    let header = &message.header;
    let qdcount: u16 = message
        .questions
        .len()
        .try_into()
        .map_err(|_| CodecError::Malformed("question count overflows u16"))?;
    let ancount: u16 = message
        .answers
        .len()
        .try_into()
        .map_err(|_| CodecError::Malformed("answer count overflows u16"))?;
    let nscount: u16 = message
        .authorities
        .len()
        .try_into()
        .map_err(|_| CodecError::Malformed("authority count overflows u16"))?;
    let arcount: u16 = message
        .additional
        .len()
        .try_into()
        .map_err(|_| CodecError::Malformed("additional count overflows u16"))?;

    buf.extend_from_slice(&header.id.to_be_bytes());
    buf.extend_from_slice(&header.encode_flags().to_be_bytes());
    buf.extend_from_slice(&qdcount.to_be_bytes());
    buf.extend_from_slice(&ancount.to_be_bytes());
    buf.extend_from_slice(&nscount.to_be_bytes());
    buf.extend_from_slice(&arcount.to_be_bytes());

    let mut compression_table: FxHashMap<String, u16> = FxHashMap::default();

    for question in &message.questions {
        encode_name(buf, &question.name, &mut compression_table)?;
        buf.extend_from_slice(&question.qtype.to_be_bytes());
        buf.extend_from_slice(&question.qclass.to_be_bytes());
    }

    for record in message
        .answers
        .iter()
        .chain(&message.authorities)
        .chain(&message.additional)
    {
        encode_resource_record(buf, record, &mut compression_table)?;
    }

    Ok(())
}

fn encode_resource_record(
    buf: &mut Vec<u8>,
    record: &ResourceRecord,
    table: &mut FxHashMap<String, u16>,
) -> Result<(), CodecError> {
    encode_name(buf, &record.name, table)?;
    buf.extend_from_slice(&record.rtype.to_be_bytes());
    buf.extend_from_slice(&record.class.to_be_bytes());
    buf.extend_from_slice(&record.ttl.to_be_bytes());
    let rdlength: u16 = record
        .rdata
        .len()
        .try_into()
        .map_err(|_| CodecError::Malformed("rdata length overflows u16"))?;
    buf.extend_from_slice(&rdlength.to_be_bytes());
    buf.extend_from_slice(&record.rdata);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message {
            header: Header {
                id: 0xABCD,
                is_response: true,
                opcode: 0,
                authoritative: false,
                truncated: false,
                recursion_desired: true,
                recursion_available: true,
                z: 0,
                rcode: 0,
                qdcount: 1,
                ancount: 1,
                nscount: 0,
                arcount: 0,
            },
            questions: vec![Question {
                name: "example.com".into(),
                qtype: 1,
                qclass: 1,
            }],
            answers: vec![ResourceRecord {
                name: "example.com".into(),
                rtype: 1,
                class: 1,
                ttl: 300,
                rdata: vec![93, 184, 216, 34],
            }],
            authorities: vec![],
            additional: vec![],
        }
    }

    #[test]
    fn decode_of_encode_is_value_equal() {
        let message = sample_message();
        let mut buf = Vec::new();
        encode_message(&message, &mut buf).unwrap();
        let decoded = decode_message(&buf).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn encode_uses_compression_pointer_for_repeated_name() {
        let message = sample_message();
        let mut buf = Vec::new();
        encode_message(&message, &mut buf).unwrap();
        // answer name should be a 2-byte pointer back to the question's name.
        // question name starts right after the 12-byte header.
        let question_name_end = HEADER_LEN + "example.com".len() + 2 /* labels */ + 1 /* root */;
        let answer_name_offset = question_name_end + 4; // qtype+qclass
        assert_eq!(buf[answer_name_offset] & 0b1100_0000, 0b1100_0000);
    }

    #[test]
    fn label_over_255_bytes_fails_encode() {
        let mut message = sample_message();
        message.questions[0].name = "a".repeat(300);
        let mut buf = Vec::new();
        let result = encode_message(&message, &mut buf);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn truncated_buffer_fails_full_decode() {
        let message = sample_message();
        let mut buf = Vec::new();
        encode_message(&message, &mut buf).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(decode_message(&buf).is_err());
    }

    #[test]
    fn pointer_to_later_offset_fails_decode() {
        // Header claims one question; its name is a pointer to offset 20
        // which is itself (still within the 12-byte header, so "later" by
        // any measure that matters once we're past the header).
        let mut buf = vec![0u8; HEADER_LEN];
        buf[5] = 1; // QDCOUNT = 1
        buf.extend_from_slice(&[0xC0, 0x0F]); // pointer to offset 15 >= 12
        buf.extend_from_slice(&[0, 1, 0, 1]); // qtype/qclass, unreachable if rejected
        assert!(matches!(
            decode_message(&buf),
            Err(CodecError::Malformed(_))
        ));
    }
}
