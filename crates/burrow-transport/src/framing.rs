//! Length-prefixed framing.
//!
//! Every tunnel payload travels as `len_hi len_lo payload[len]` with
//! `len` in `1..=65535`, big-endian. The codec reassembles frames across
//! short reads; zero-length frames are a protocol violation handled one
//! layer up, in [`crate::transmission`].

use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{BoxedIo, MAX_FRAME_LEN};

/// Codec for the 2-byte big-endian length prefix.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(2)
        .length_adjustment(0)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Wrap a byte stream with the tunnel framing.
pub fn framed(io: BoxedIo) -> Framed<BoxedIo, LengthDelimitedCodec> {
    Framed::new(io, frame_codec())
}
