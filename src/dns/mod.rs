//! RFC 1035 wire format: header/message types, name compression, full
//! codec, streaming structural view, and transaction-ID access.

mod codec;
mod header;
mod id;
mod message;
mod name;
mod view;

pub use codec::{decode_message, encode_message, CodecError};
pub use header::{Header, HEADER_LEN};
pub use id::{read_id, rewrite_id};
pub use message::{Message, MessageView, Question, ResourceRecord};
pub use view::{structural_view, truncate_message, ViewDecoder, ViewOutcome};
