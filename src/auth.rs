//! CHAP for the initiator side of security negotiation
//!
//! RFC 3720 Section 11.1.4. Responses are computed as in RFC 1994:
//! `MD5(identifier || secret || challenge)`.

use crate::error::{IscsiError, IscsiResult};
use rand::Rng;

/// `CHAP_A` values we understand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapAlgorithm {
    Md5 = 5,
}

impl ChapAlgorithm {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim() {
            "5" => Some(ChapAlgorithm::Md5),
            _ => None,
        }
    }
}

/// User name and secret for one direction of CHAP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapCredentials {
    pub username: String,
    pub secret: String,
}

impl ChapCredentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        ChapCredentials {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

/// Where the CHAP exchange is during security negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChapPhase {
    /// Offer `AuthMethod=CHAP,None`
    #[default]
    OfferChap,
    /// Target picked CHAP, send `CHAP_A`
    SelectAlgorithm,
    /// Target sent its challenge, send `CHAP_N`/`CHAP_R`
    SendResponse,
}

/// Challenge received from the target
#[derive(Debug, Clone, Default)]
pub struct ChapChallenge {
    pub algorithm: Option<ChapAlgorithm>,
    pub identifier: u8,
    pub challenge: Vec<u8>,
}

impl ChapChallenge {
    pub fn response(&self, secret: &str) -> Vec<u8> {
        chap_md5(self.identifier, secret, &self.challenge)
    }

    /// `CHAP_R` value in the form the target expects
    pub fn response_hex(&self, secret: &str) -> String {
        format!("0x{}", hex::encode_upper(self.response(secret)))
    }
}

/// Challenge the initiator issues so the target proves it knows the
/// target secret (mutual CHAP)
#[derive(Debug, Clone)]
pub struct MutualChallenge {
    identifier: u8,
    challenge: Vec<u8>,
}

impl MutualChallenge {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut challenge = vec![0u8; 16];
        rng.fill(&mut challenge[..]);
        MutualChallenge {
            identifier: rng.gen(),
            challenge,
        }
    }

    /// `CHAP_I` key value
    pub fn identifier_value(&self) -> String {
        self.identifier.to_string()
    }

    /// `CHAP_C` key value
    pub fn challenge_value(&self) -> String {
        format!("0x{}", hex::encode(&self.challenge))
    }

    /// Check the target's `CHAP_R` against `secret`.
    ///
    /// The comparison does not stop at the first differing byte.
    pub fn verify(&self, chap_r: &str, secret: &str) -> IscsiResult<bool> {
        let received = parse_chap_hex(chap_r)?;
        let expected = chap_md5(self.identifier, secret, &self.challenge);
        if received.len() != expected.len() {
            return Ok(false);
        }
        let diff = received.iter().zip(&expected).fold(0u8, |acc, (a, b)| acc | (a ^ b));
        Ok(diff == 0)
    }
}

fn chap_md5(identifier: u8, secret: &str, challenge: &[u8]) -> Vec<u8> {
    let mut ctx = md5::Context::new();
    ctx.consume([identifier]);
    ctx.consume(secret.as_bytes());
    ctx.consume(challenge);
    ctx.compute().0.to_vec()
}

/// Decode a CHAP binary value, with or without the `0x` prefix
pub fn parse_chap_hex(value: &str) -> IscsiResult<Vec<u8>> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    hex::decode(digits).map_err(|e| IscsiError::Auth(format!("Invalid CHAP hex value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chap_response_known_value() {
        let challenge = ChapChallenge {
            algorithm: Some(ChapAlgorithm::Md5),
            identifier: 1,
            challenge: vec![0x01, 0x02, 0x03, 0x04],
        };
        let mut data = vec![1u8];
        data.extend_from_slice(b"secret");
        data.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(challenge.response("secret"), md5::compute(&data).0.to_vec());

        let value = challenge.response_hex("secret");
        assert!(value.starts_with("0x"));
        assert_eq!(value.len(), 2 + 32);
        assert_eq!(value[2..], value[2..].to_uppercase());
    }

    #[test]
    fn test_mutual_challenge_verifies_target() {
        let ours = MutualChallenge::generate();
        let target_view = ChapChallenge {
            algorithm: Some(ChapAlgorithm::Md5),
            identifier: ours.identifier_value().parse().unwrap(),
            challenge: parse_chap_hex(&ours.challenge_value()).unwrap(),
        };

        let good = target_view.response_hex("targetsecret");
        assert!(ours.verify(&good, "targetsecret").unwrap());
        assert!(!ours.verify(&good, "othersecret").unwrap());
        assert!(!ours.verify("0x00", "targetsecret").unwrap());
        assert!(ours.verify("0xnothex", "targetsecret").is_err());
    }

    #[test]
    fn test_parse_chap_hex() {
        assert_eq!(parse_chap_hex("0xA1b2").unwrap(), vec![0xa1, 0xb2]);
        assert_eq!(parse_chap_hex("0X00ff").unwrap(), vec![0x00, 0xff]);
        assert_eq!(parse_chap_hex("00ff").unwrap(), vec![0x00, 0xff]);
        assert!(parse_chap_hex("0xzz").is_err());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!(ChapAlgorithm::from_str("5"), Some(ChapAlgorithm::Md5));
        assert_eq!(ChapAlgorithm::from_str("7"), None);
    }
}
