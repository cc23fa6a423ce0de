use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_SIZE: usize = 4 + 1 + 4; // stream_id, kind, payload_len
const MAX_PAYLOAD: u32 = 1 << 20; // 1 MiB per frame; streams send as many frames as needed

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Open,
    Data,
    Close,
}

impl FrameKind {
    fn tag(self) -> u8 {
        match self {
            FrameKind::Open => 0,
            FrameKind::Data => 1,
            FrameKind::Close => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FrameKind::Open),
            1 => Some(FrameKind::Data),
            2 => Some(FrameKind::Close),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MuxFrame {
    pub(crate) stream_id: u32,
    pub(crate) kind: FrameKind,
    pub(crate) payload: Bytes,
}

impl MuxFrame {
    pub(crate) fn open(stream_id: u32) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open,
            payload: Bytes::new(),
        }
    }

    pub(crate) fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data,
            payload,
        }
    }

    pub(crate) fn close(stream_id: u32) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
            payload: Bytes::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum MuxCodecError {
    #[error("frame payload of {0} bytes exceeds the {MAX_PAYLOAD} byte ceiling")]
    TooLarge(u32),
    #[error("unknown frame kind tag {0}")]
    UnknownKind(u8),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) struct MuxFrameCodec;

impl Decoder for MuxFrameCodec {
    type Item = MuxFrame;
    type Error = MuxCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let stream_id = u32::from_be_bytes(src[0..4].try_into().expect("checked length above"));
        let tag = src[4];
        let payload_len = u32::from_be_bytes(src[5..9].try_into().expect("checked length above"));

        if payload_len > MAX_PAYLOAD {
            return Err(MuxCodecError::TooLarge(payload_len));
        }

        let total = HEADER_SIZE + payload_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let kind = FrameKind::from_tag(tag).ok_or(MuxCodecError::UnknownKind(tag))?;

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len as usize).freeze();

        Ok(Some(MuxFrame { stream_id, kind, payload }))
    }
}

impl Encoder<MuxFrame> for MuxFrameCodec {
    type Error = MuxCodecError;

    fn encode(&mut self, item: MuxFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = u32::try_from(item.payload.len()).map_err(|_| MuxCodecError::TooLarge(u32::MAX))?;
        if payload_len > MAX_PAYLOAD {
            return Err(MuxCodecError::TooLarge(payload_len));
        }

        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_u32(item.stream_id);
        dst.put_u8(item.kind.tag());
        dst.put_u32(payload_len);
        dst.extend_from_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_data_frame() {
        let mut codec = MuxFrameCodec;
        let mut buf = BytesMut::new();

        codec.encode(MuxFrame::data(7, Bytes::from_static(b"Hello, Portal!")), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.kind, FrameKind::Data);
        assert_eq!(&decoded.payload[..], b"Hello, Portal!");
    }

    #[test]
    fn waits_for_more_data_on_partial_frame() {
        let mut codec = MuxFrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(MuxFrame::close(1), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
