//! Frame encoding
//!
//! The bridge does not own a term codec. Whatever encodes frames for the peer
//! runtime implements [`FrameCodec`]; [`BincodeCodec`] is the built-in one,
//! used between bridge-aware peers and in tests.

use bytes::Bytes;

use crate::error::{BridgeError, Result};
use crate::node::Frame;

pub trait FrameCodec: Send + Sync + 'static {
    fn encode(&self, frame: &Frame) -> Result<Bytes>;
    fn decode(&self, data: &[u8]) -> Result<Frame>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl FrameCodec for BincodeCodec {
    fn encode(&self, frame: &Frame) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(frame)?))
    }

    fn decode(&self, data: &[u8]) -> Result<Frame> {
        if data.is_empty() {
            return Err(BridgeError::codec("empty frame"));
        }
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ControlMessage;
    use crate::term::{Pid, Term};

    #[test]
    fn test_garbage_is_a_codec_error() {
        let codec = BincodeCodec;
        assert!(matches!(codec.decode(&[]), Err(BridgeError::Codec(_))));
        assert!(matches!(codec.decode(&[0xff, 0xff, 0xff, 0xff, 0xff]), Err(BridgeError::Codec(_))));
    }

    #[test]
    fn test_nested_message_survives() {
        let codec = BincodeCodec;
        let frame = Frame::Control(ControlMessage::Send {
            from: Pid::new("a@h", 1, 0, 1),
            to: Pid::new("b@h", 2, 0, 1),
            message: Term::tuple(vec![
                Term::atom("api"),
                Term::atom("status"),
                Term::list(vec![Term::Binary(b"x".to_vec()), Term::Float(1.5)]),
            ]),
        });
        let bytes = codec.encode(&frame).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), frame);
    }
}
