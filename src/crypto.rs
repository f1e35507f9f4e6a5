//! At-rest sealing of OAuth tokens stored on integration rows.

use anyhow::{anyhow, Context, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedEnvelope {
    version: u8,
    nonce_hex: String,
    ciphertext_hex: String,
}

/// AES-256-GCM cipher for token columns.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; KEY_BYTES],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

impl TokenCipher {
    pub fn from_hex(raw: &str) -> Result<Self> {
        let decoded = hex_decode(raw).context("decode token key hex")?;
        let key: [u8; KEY_BYTES] = decoded
            .try_into()
            .map_err(|_| anyhow!("token key must be 32 bytes (64 hex characters)"))?;
        Ok(Self { key })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut buffer = plaintext.as_bytes().to_vec();
        let key = self.aead_key()?;

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow!("generate random nonce for token sealing"))?;

        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut buffer,
        )
        .map_err(|_| anyhow!("seal token"))?;

        let envelope = SealedEnvelope {
            version: ENVELOPE_VERSION,
            nonce_hex: hex_encode(&nonce_bytes),
            ciphertext_hex: hex_encode(&buffer),
        };
        serde_json::to_string(&envelope).context("serialize sealed token envelope")
    }

    /// Opens a sealed value. Values that are not envelopes were written before
    /// sealing was enabled and are returned as-is.
    pub fn open(&self, stored: &str) -> Result<String> {
        let Ok(envelope) = serde_json::from_str::<SealedEnvelope>(stored) else {
            return Ok(stored.to_string());
        };

        if envelope.version != ENVELOPE_VERSION {
            return Err(anyhow!(
                "unsupported token envelope version {}",
                envelope.version
            ));
        }

        let nonce_bytes: [u8; NONCE_BYTES] = hex_decode(&envelope.nonce_hex)
            .context("decode envelope nonce")?
            .try_into()
            .map_err(|_| anyhow!("invalid nonce length in token envelope"))?;
        let mut ciphertext =
            hex_decode(&envelope.ciphertext_hex).context("decode envelope ciphertext")?;

        let plaintext = self
            .aead_key()?
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut ciphertext,
            )
            .map_err(|_| anyhow!("open sealed token (wrong key?)"))?;

        String::from_utf8(plaintext.to_vec()).context("utf8 decode opened token")
    }

    fn aead_key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| anyhow!("construct AES-256-GCM key"))?;
        Ok(LessSafeKey::new(unbound))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>> {
    let value = raw.trim();
    if value.len() % 2 != 0 {
        return Err(anyhow!("hex string length must be even"));
    }

    value
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = decode_hex_nibble(pair[0]).ok_or_else(|| anyhow!("invalid hex digit"))?;
            let lo = decode_hex_nibble(pair[1]).ok_or_else(|| anyhow!("invalid hex digit"))?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn decode_hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
