//! Protocol Module
//!
//! ASCII line protocol: CRLF-terminated frames, one command or response per
//! frame (REGX responses stream multiple frames).

mod codec;
mod command;
mod response;

pub use codec::LineCodec;
pub use command::Command;
pub use response::Response;
