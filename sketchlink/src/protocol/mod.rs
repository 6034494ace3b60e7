//! Upload wire protocol: packet framing, reply decoding and checksums.

pub mod crc;
pub mod packet;
pub mod reply;

// Re-export common types
pub use packet::{Control, flash_start_packet, page_write_packet, start_packet};
pub use reply::{FrameReplyDecoder, LineReplyDecoder, ReplyCode, ReplyDecoder};
