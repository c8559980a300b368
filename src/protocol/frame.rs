//! Authenticated mesh frames
//!
//! Layout: `HMAC-SHA256 tag (32 bytes) | envelope JSON`. The key is the
//! SHA-256 digest of the shared mesh secret. Frames are authenticated, not
//! encrypted.

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::Envelope;

type HmacSha256 = Hmac<Sha256>;

const TAG_LEN: usize = 32;

/// Seals outbound envelopes and opens inbound frames
#[derive(Clone)]
pub struct FrameSealer {
    key: [u8; 32],
}

impl FrameSealer {
    pub fn new(secret: &str) -> Self {
        Self {
            key: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, FrameError> {
        HmacSha256::new_from_slice(&self.key).map_err(|_| FrameError::Key)
    }

    pub fn seal(&self, envelope: &Envelope) -> Result<Bytes, FrameError> {
        let body = serde_json::to_vec(envelope).map_err(FrameError::Encode)?;

        let mut mac = self.mac()?;
        mac.update(&body);
        let tag = mac.finalize().into_bytes();

        let mut frame = BytesMut::with_capacity(TAG_LEN + body.len());
        frame.put_slice(&tag);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    pub fn open(&self, frame: &[u8]) -> Result<Envelope, FrameError> {
        if frame.len() <= TAG_LEN {
            return Err(FrameError::TooShort);
        }
        let (tag, body) = frame.split_at(TAG_LEN);

        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(tag).map_err(|_| FrameError::BadTag)?;

        Envelope::decode_slice(body).map_err(FrameError::Decode)
    }
}

/// Frame errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid frame key")]
    Key,

    #[error("Frame too short")]
    TooShort,

    #[error("Frame authentication failed")]
    BadTag,

    #[error("Failed to encode envelope: {0}")]
    Encode(serde_json::Error),

    #[error("Failed to decode envelope: {0}")]
    Decode(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PingPayload;
    use chrono::Utc;

    fn ping() -> Envelope {
        Envelope::Ping(PingPayload { ts: Utc::now() })
    }

    #[test]
    fn sealed_frame_opens_with_same_secret() {
        let sealer = FrameSealer::new("alpha");
        let frame = sealer.seal(&ping()).unwrap();
        assert!(matches!(sealer.open(&frame), Ok(Envelope::Ping(_))));
    }

    #[test]
    fn other_secret_is_rejected() {
        let frame = FrameSealer::new("alpha").seal(&ping()).unwrap();
        let result = FrameSealer::new("beta").open(&frame);
        assert!(matches!(result, Err(FrameError::BadTag)));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let sealer = FrameSealer::new("alpha");
        let mut frame = sealer.seal(&ping()).unwrap().to_vec();
        let last = frame.len() - 2;
        frame[last] ^= 0x01;
        assert!(matches!(sealer.open(&frame), Err(FrameError::BadTag)));
    }

    #[test]
    fn short_frame_is_rejected() {
        let sealer = FrameSealer::new("alpha");
        assert!(matches!(sealer.open(&[0u8; 8]), Err(FrameError::TooShort)));
    }
}
