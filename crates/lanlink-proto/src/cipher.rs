//! Length-preserving payload ciphers

use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Fixed CFB initialization vector shared by both ends
const CFB_IV: [u8; 16] = [
    167, 115, 79, 156, 18, 172, 27, 1, 164, 21, 242, 193, 252, 120, 230, 107,
];

/// Names are matched case-insensitively, with or without the dash
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum CipherAlgorithm {
    #[default]
    #[serde(rename = "xor")]
    Xor,
    #[serde(rename = "aes-128")]
    Aes128,
    #[serde(rename = "aes-192")]
    Aes192,
    #[serde(rename = "aes-256")]
    Aes256,
}

impl CipherAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherAlgorithm::Xor => "xor",
            CipherAlgorithm::Aes128 => "aes-128",
            CipherAlgorithm::Aes192 => "aes-192",
            CipherAlgorithm::Aes256 => "aes-256",
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "xor" => Ok(CipherAlgorithm::Xor),
            "aes-128" | "aes128" => Ok(CipherAlgorithm::Aes128),
            "aes-192" | "aes192" => Ok(CipherAlgorithm::Aes192),
            "aes-256" | "aes256" => Ok(CipherAlgorithm::Aes256),
            other => Err(format!("unsupported cipher algorithm: {}", other)),
        }
    }
}

impl TryFrom<String> for CipherAlgorithm {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Cipher settings as they appear in configuration files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptConfig {
    #[serde(default)]
    pub algorithm: CipherAlgorithm,
    #[serde(default)]
    pub secret: String,
}

impl CryptConfig {
    pub fn new(algorithm: CipherAlgorithm, secret: impl Into<String>) -> Self {
        Self {
            algorithm,
            secret: secret.into(),
        }
    }

    /// Build the cipher, or `None` when no secret is configured
    pub fn build(&self) -> Option<BlockCrypt> {
        if self.secret.is_empty() {
            return None;
        }
        Some(BlockCrypt::new(self.algorithm, &self.secret))
    }
}

/// A keyed payload cipher. Output length always equals input length.
#[derive(Clone)]
pub enum BlockCrypt {
    Xor([u8; 32]),
    Aes128([u8; 16]),
    Aes192([u8; 24]),
    Aes256([u8; 32]),
}

impl fmt::Debug for BlockCrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCrypt")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

impl BlockCrypt {
    pub fn new(algorithm: CipherAlgorithm, secret: &str) -> Self {
        match algorithm {
            CipherAlgorithm::Xor => BlockCrypt::Xor(Sha256::digest(secret.as_bytes()).into()),
            CipherAlgorithm::Aes128 => BlockCrypt::Aes128(padded_key(secret)),
            CipherAlgorithm::Aes192 => BlockCrypt::Aes192(padded_key(secret)),
            CipherAlgorithm::Aes256 => BlockCrypt::Aes256(padded_key(secret)),
        }
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        match self {
            BlockCrypt::Xor(_) => CipherAlgorithm::Xor,
            BlockCrypt::Aes128(_) => CipherAlgorithm::Aes128,
            BlockCrypt::Aes192(_) => CipherAlgorithm::Aes192,
            BlockCrypt::Aes256(_) => CipherAlgorithm::Aes256,
        }
    }

    pub fn encrypt(&self, buf: &mut [u8]) {
        match self {
            BlockCrypt::Xor(key) => xor_in_place(key, buf),
            BlockCrypt::Aes128(key) => {
                Encryptor::<Aes128>::new(&(*key).into(), &CFB_IV.into()).encrypt(buf)
            }
            BlockCrypt::Aes192(key) => {
                Encryptor::<Aes192>::new(&(*key).into(), &CFB_IV.into()).encrypt(buf)
            }
            BlockCrypt::Aes256(key) => {
                Encryptor::<Aes256>::new(&(*key).into(), &CFB_IV.into()).encrypt(buf)
            }
        }
    }

    pub fn decrypt(&self, buf: &mut [u8]) {
        match self {
            BlockCrypt::Xor(key) => xor_in_place(key, buf),
            BlockCrypt::Aes128(key) => {
                Decryptor::<Aes128>::new(&(*key).into(), &CFB_IV.into()).decrypt(buf)
            }
            BlockCrypt::Aes192(key) => {
                Decryptor::<Aes192>::new(&(*key).into(), &CFB_IV.into()).decrypt(buf)
            }
            BlockCrypt::Aes256(key) => {
                Decryptor::<Aes256>::new(&(*key).into(), &CFB_IV.into()).decrypt(buf)
            }
        }
    }
}

/// Secret bytes zero-padded (or truncated) to the key size
fn padded_key<const N: usize>(secret: &str) -> [u8; N] {
    let mut key = [0u8; N];
    let bytes = secret.as_bytes();
    let len = bytes.len().min(N);
    key[..len].copy_from_slice(&bytes[..len]);
    key
}

fn xor_in_place(key: &[u8; 32], buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % key.len()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("AES-128".parse::<CipherAlgorithm>().unwrap(), CipherAlgorithm::Aes128);
        assert_eq!("".parse::<CipherAlgorithm>().unwrap(), CipherAlgorithm::Xor);
        assert!("tea".parse::<CipherAlgorithm>().is_err());
    }

    #[test]
    fn test_empty_secret_disables_cipher() {
        assert!(CryptConfig::default().build().is_none());
        let crypt = CryptConfig::new(CipherAlgorithm::Aes256, "key").build().unwrap();
        assert_eq!(crypt.algorithm(), CipherAlgorithm::Aes256);
    }

    #[test]
    fn test_partial_block_roundtrip() {
        let crypt = BlockCrypt::new(CipherAlgorithm::Aes192, "partial");
        let plain: Vec<u8> = (0..37u8).collect();
        let mut buf = plain.clone();

        crypt.encrypt(&mut buf);
        assert_eq!(buf.len(), plain.len());
        assert_ne!(buf, plain);

        crypt.decrypt(&mut buf);
        assert_eq!(buf, plain);
    }

    #[test]
    fn test_different_secrets_differ() {
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        BlockCrypt::new(CipherAlgorithm::Xor, "one").encrypt(&mut a);
        BlockCrypt::new(CipherAlgorithm::Xor, "two").encrypt(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_config_deserialize() {
        let config: CryptConfig =
            serde_json::from_str(r#"{"algorithm": "aes-128", "secret": "abc"}"#).unwrap();
        assert_eq!(config.algorithm, CipherAlgorithm::Aes128);
        assert_eq!(config.secret, "abc");
    }

    #[test]
    fn test_config_algorithm_any_case() {
        for (name, expected) in [
            ("Xor", CipherAlgorithm::Xor),
            ("Aes-256", CipherAlgorithm::Aes256),
            ("aes256", CipherAlgorithm::Aes256),
            ("AES192", CipherAlgorithm::Aes192),
        ] {
            let json = format!(r#"{{"algorithm": "{}", "secret": "s"}}"#, name);
            let config: CryptConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(config.algorithm, expected, "{}", name);
        }

        let err = serde_json::from_str::<CryptConfig>(r#"{"algorithm": "tea", "secret": "s"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unsupported cipher algorithm"));
        assert_eq!(
            serde_json::to_string(&CipherAlgorithm::Aes128).unwrap(),
            r#""aes-128""#
        );
    }
}
