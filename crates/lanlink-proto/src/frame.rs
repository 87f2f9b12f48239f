//! Wire framing
//!
//! Every unit on the wire is `magic(2) | length(2, big-endian) | payload`.
//! The payload may be encrypted with a length-preserving cipher; the header
//! never is. [`FrameCodec`] implements the tokio-util codec traits for
//! reliable streams and offers datagram helpers for one-frame-per-packet
//! transports.

use crate::cipher::BlockCrypt;
use crate::control::{self, ControlMessage, CONTROL_HEADER_SIZE};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Fixed frame marker
pub const MAGIC: [u8; 2] = [0xff, 0xff];

/// Magic plus length
pub const HEADER_SIZE: usize = 4;

/// Largest buffer a single frame may occupy on the wire
pub const MAX_BUF: usize = 4096;

/// Default upper bound for a payload
pub const DEFAULT_MAX_PAYLOAD: usize = MAX_BUF - HEADER_SIZE;

/// Default lower bound for a payload: an empty control message
pub const DEFAULT_MIN_PAYLOAD: usize = CONTROL_HEADER_SIZE;

/// One decoded wire unit, either a control message or a raw Ethernet frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn control(message: &ControlMessage) -> Self {
        Self::new(message.encode())
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// A frame is control when its first six payload bytes are zero
    pub fn is_control(&self) -> bool {
        control::is_control(&self.payload)
    }

    pub fn to_control(&self) -> Result<ControlMessage, ProtocolError> {
        ControlMessage::decode(&self.payload)
    }
}

impl From<ControlMessage> for Frame {
    fn from(message: ControlMessage) -> Self {
        Frame::control(&message)
    }
}

/// Frame encoder/decoder with size bounds and an optional payload cipher
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_size: usize,
    min_size: usize,
    cipher: Option<Arc<BlockCrypt>>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_size: DEFAULT_MAX_PAYLOAD,
            min_size: DEFAULT_MIN_PAYLOAD,
            cipher: None,
        }
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size.min(u16::MAX as usize);
        self
    }

    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub fn with_cipher(mut self, cipher: Option<Arc<BlockCrypt>>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn cipher(&self) -> Option<&Arc<BlockCrypt>> {
        self.cipher.as_ref()
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_size || size < self.min_size {
            return Err(ProtocolError::SizeOutOfRange {
                size,
                min: self.min_size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    /// Append the wire form of `frame` to `dst`
    pub fn encode_frame(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let size = frame.len();
        self.check_size(size)?;

        dst.reserve(HEADER_SIZE + size);
        dst.put_slice(&MAGIC);
        dst.put_u16(size as u16);
        let start = dst.len();
        dst.put_slice(frame.payload());
        if let Some(cipher) = &self.cipher {
            cipher.encrypt(&mut dst[start..]);
        }
        Ok(())
    }

    /// Wire form of `frame` as one datagram
    pub fn encode_datagram(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + frame.len());
        self.encode_frame(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse exactly one frame out of a received datagram.
    ///
    /// Bytes past the advertised length are ignored.
    pub fn decode_datagram(&self, datagram: &[u8]) -> Result<Frame, ProtocolError> {
        if datagram.len() <= HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                expected: HEADER_SIZE + 1,
                actual: datagram.len(),
            });
        }
        let size = self.parse_header(datagram)?;
        let end = HEADER_SIZE + size;
        if datagram.len() < end {
            return Err(ProtocolError::Truncated {
                expected: end,
                actual: datagram.len(),
            });
        }
        Ok(self.open(BytesMut::from(&datagram[HEADER_SIZE..end])))
    }

    fn parse_header(&self, header: &[u8]) -> Result<usize, ProtocolError> {
        if header[..2] != MAGIC {
            return Err(ProtocolError::BadMagic([header[0], header[1]]));
        }
        let size = u16::from_be_bytes([header[2], header[3]]) as usize;
        self.check_size(size)?;
        Ok(size)
    }

    fn open(&self, mut payload: BytesMut) -> Frame {
        if let Some(cipher) = &self.cipher {
            cipher.decrypt(&mut payload);
        }
        Frame::new(payload.freeze())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let size = self.parse_header(&src[..HEADER_SIZE])?;
        if src.len() < HEADER_SIZE + size {
            src.reserve(HEADER_SIZE + size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(size);
        Ok(Some(self.open(payload)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.encode_frame(&frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherAlgorithm;
    use crate::control::Action;

    fn ethernet_payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8 + 1).collect::<Vec<u8>>().into()
    }

    #[test]
    fn test_frame_encode_decode() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(ethernet_payload(60));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..2], &MAGIC);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 60);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_encode_decode_with_cipher() {
        for algorithm in [
            CipherAlgorithm::Xor,
            CipherAlgorithm::Aes128,
            CipherAlgorithm::Aes192,
            CipherAlgorithm::Aes256,
        ] {
            let cipher = Arc::new(BlockCrypt::new(algorithm, "s3cret"));
            let mut codec = FrameCodec::new().with_cipher(Some(cipher));
            let frame = Frame::new(ethernet_payload(1500));

            let mut buf = BytesMut::new();
            codec.encode(frame.clone(), &mut buf).unwrap();
            assert_eq!(buf.len(), HEADER_SIZE + 1500);
            assert_ne!(&buf[HEADER_SIZE..], &frame.payload()[..], "{algorithm}");

            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame, "{algorithm}");
        }
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0xfe, 0xff, 0x00, 0x20][..]);
        buf.extend_from_slice(&[0u8; 32]);

        match codec.decode(&mut buf) {
            Err(ProtocolError::BadMagic(magic)) => assert_eq!(magic, [0xfe, 0xff]),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_size_out_of_range() {
        let mut codec = FrameCodec::new().with_max_size(1514).with_min_size(15);

        let mut too_big = BytesMut::from(&[0xff, 0xff][..]);
        too_big.put_u16(1515);
        assert!(matches!(
            codec.decode(&mut too_big),
            Err(ProtocolError::SizeOutOfRange { size: 1515, .. })
        ));

        let mut too_small = BytesMut::from(&[0xff, 0xff][..]);
        too_small.put_u16(14);
        too_small.extend_from_slice(&[1u8; 14]);
        assert!(matches!(
            codec.decode(&mut too_small),
            Err(ProtocolError::SizeOutOfRange { size: 14, .. })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::new().with_max_size(100);
        let mut buf = BytesMut::new();
        let result = codec.encode(Frame::new(ethernet_payload(101)), &mut buf);
        assert!(matches!(result, Err(ProtocolError::SizeOutOfRange { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_reads_only_advertised_length() {
        let mut codec = FrameCodec::new();
        let first = Frame::new(ethernet_payload(40));
        let second = Frame::new(ethernet_payload(80));

        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();
        // partial third frame header
        buf.extend_from_slice(&[0xff, 0xff, 0x00]);

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_waits_for_full_payload() {
        let mut codec = FrameCodec::new();
        let mut wire = BytesMut::new();
        codec
            .encode(Frame::new(ethernet_payload(64)), &mut wire)
            .unwrap();

        let mut partial = wire.split_to(30);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(wire);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap().len(), 64);
    }

    #[test]
    fn test_datagram_discipline() {
        let codec = FrameCodec::new();
        let frame = Frame::control(&ControlMessage::request(Action::Ping, "{}"));

        let datagram = codec.encode_datagram(&frame).unwrap();
        assert_eq!(codec.decode_datagram(&datagram).unwrap(), frame);

        assert!(matches!(
            codec.decode_datagram(&datagram[..4]),
            Err(ProtocolError::Truncated { actual: 4, .. })
        ));
        assert!(matches!(
            codec.decode_datagram(&datagram[..10]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_control_frame_classification() {
        let control = Frame::control(&ControlMessage::response(Action::Login, "okay"));
        assert!(control.is_control());

        let data = Frame::new(ethernet_payload(60));
        assert!(!data.is_control());
        assert!(data.to_control().is_err());
    }
}
