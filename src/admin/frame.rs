//! Admin frame layout: one tag byte naming the message kind, followed by
//! the prost-encoded payload, carried inside a length-delimited frame.

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use prost::Message;
use tokio_util::codec::LengthDelimitedCodec;

use crate::NetworkError;
use crate::Result;

pub(crate) const TAG_MUTATION_TOPIC: u8 = 0x01;
pub(crate) const TAG_RESTART_VBUCKETS: u8 = 0x02;
pub(crate) const TAG_SHUTDOWN_VBUCKETS: u8 = 0x03;
pub(crate) const TAG_ADD_BUCKETS: u8 = 0x04;
pub(crate) const TAG_DEL_BUCKETS: u8 = 0x05;
pub(crate) const TAG_ADD_INSTANCES: u8 = 0x06;
pub(crate) const TAG_DEL_INSTANCES: u8 = 0x07;
pub(crate) const TAG_REPAIR_ENDPOINTS: u8 = 0x08;
pub(crate) const TAG_SHUTDOWN_TOPIC: u8 = 0x09;
pub(crate) const TAG_VBMAP: u8 = 0x0A;
pub(crate) const TAG_FAILOVER_LOG: u8 = 0x0B;

/// Codec for the outer length-delimited frame.
pub(crate) fn admin_codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_len)
        .new_codec()
}

/// `[tag][payload]` for one message.
pub(crate) fn encode_frame<M: Message>(
    tag: u8,
    msg: &M,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + msg.encoded_len());
    buf.put_u8(tag);
    msg.encode(&mut buf).expect("BytesMut grows on demand");
    buf.freeze()
}

/// Split a received frame into its tag and payload.
pub(crate) fn split_frame(mut frame: BytesMut) -> Result<(u8, Bytes)> {
    if frame.is_empty() {
        return Err(NetworkError::ConnectionError("empty admin frame".into()).into());
    }
    let tag = frame.split_to(1)[0];
    Ok((tag, frame.freeze()))
}

/// Decode the payload half of a frame.
pub(crate) fn decode_payload<M: Message + Default>(payload: Bytes) -> Result<M> {
    M::decode(payload).map_err(|err| NetworkError::FrameDecode(err).into())
}
