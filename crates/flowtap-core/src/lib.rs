pub mod key;
pub mod record;

pub use key::{ConnectionKey, KeyParseError, KEY_SEPARATOR};
pub use record::{
    decode_chunk, DecodeReport, RecordError, TraceRecord, DEFAULT_MAX_RECORD_BYTES,
};
