//! Signer capability (spec §4.C): opaque to the connection state machine —
//! it only ever calls `sign` and `public_key_blob`. `RsaSigner` is the
//! shipped implementation, grounded on the PKCS1v15-over-SHA1 prehash
//! pattern in `examples/other_examples/…j-hc-adb-sink…adb_usb.rs`
//! (`SigningKey::<Sha1>::new(priv_key)` + `sign_prehash`).

use std::path::Path;
use std::sync::Arc;

use num_bigint::BigUint;
use pkcs8::DecodePrivateKey;
use rsa::signature::hazmat::PrehashSigner as _;
use rsa::signature::SignatureEncoding as _;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha1::Sha1;

use crate::error::{AdbError, Result};

/// Length of the random token `adbd` challenges the host with.
pub const TOKEN_LEN: usize = 20;

/// Dynamic extension point (spec §9): signing backends can vary (different
/// key stores, hardware-backed keys, …), so this stays a trait object rather
/// than a sum type, unlike the transport.
pub trait Signer: Send + Sync {
    /// Sign a 20-byte auth token, returning the raw PKCS1v15 signature.
    fn sign(&self, token: &[u8; TOKEN_LEN]) -> Result<Vec<u8>>;

    /// The ADB wire-format public key blob: base64(`RSAPublicKey` mincrypt
    /// struct) followed by a space and a `user@host` comment.
    fn public_key_blob(&self) -> Result<Vec<u8>>;
}

pub struct RsaSigner {
    private_key: RsaPrivateKey,
    comment: String,
}

impl RsaSigner {
    pub fn from_pkcs8_pem(pem: &str, comment: impl Into<String>) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| AdbError::InvalidResponse(format!("parsing PKCS8 private key: {e}")))?;
        Ok(RsaSigner {
            private_key,
            comment: comment.into(),
        })
    }

    pub fn load_from_file(path: &Path, comment: impl Into<String>) -> Result<Self> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pkcs8_pem(&pem, comment)
    }

    pub fn into_arc(self) -> Arc<dyn Signer> {
        Arc::new(self)
    }
}

impl Signer for RsaSigner {
    fn sign(&self, token: &[u8; TOKEN_LEN]) -> Result<Vec<u8>> {
        let signing_key = rsa::pkcs1v15::SigningKey::<Sha1>::new(self.private_key.clone());
        let signature = signing_key
            .sign_prehash(token)
            .map_err(|e| AdbError::AuthenticationFailed(format!("signing auth token: {e}")))?;
        Ok(signature.to_bytes().to_vec())
    }

    fn public_key_blob(&self) -> Result<Vec<u8>> {
        let public_key = self.private_key.to_public_key();
        let struct_bytes = encode_mincrypt_rsa_public_key(&public_key)?;
        use base64::Engine as _;
        let mut blob = base64::engine::general_purpose::STANDARD.encode(struct_bytes).into_bytes();
        blob.push(b' ');
        blob.extend_from_slice(self.comment.as_bytes());
        Ok(blob)
    }
}

/// Encode an RSA public key as the mincrypt `RSAPublicKey` struct `adbd`
/// expects in `AUTH(RSAPUBLICKEY, …)`:
///
/// ```text
/// struct RSAPublicKey {
///     uint32_t len;       // number of 32-bit words in n[]/rr[]
///     uint32_t n0inv;     // -1 / n[0] mod 2^32
///     uint32_t n[len];    // modulus, little-endian words
///     uint32_t rr[len];   // R^2 mod n, little-endian words
///     uint32_t exponent;  // public exponent
/// }
/// ```
fn encode_mincrypt_rsa_public_key(public_key: &rsa::RsaPublicKey) -> Result<Vec<u8>> {
    let n = public_key.n();
    let n_bytes_be = n.to_bytes_be();
    if n_bytes_be.len() % 4 != 0 {
        return Err(AdbError::InvalidResponse(
            "RSA modulus is not a whole number of 32-bit words".into(),
        ));
    }
    let num_words = n_bytes_be.len() / 4;

    let n_words = words_le_from_bytes_be(&n_bytes_be);
    let n0inv = modinv_mod_2_32(n_words[0]);

    let n_big = BigUint::from_bytes_be(&n_bytes_be);
    let r_squared_bits = 64 * num_words as u32;
    let rr = (BigUint::from(1u32) << r_squared_bits) % &n_big;
    let mut rr_words = vec![0u32; num_words];
    let rr_bytes = rr.to_bytes_le();
    for (i, chunk) in rr_bytes.chunks(4).enumerate() {
        if i >= num_words {
            break;
        }
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        rr_words[i] = u32::from_le_bytes(word);
    }

    let exponent_bytes = public_key.e().to_bytes_be();
    let exponent = exponent_bytes
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | b as u32);

    let mut out = Vec::with_capacity(8 + num_words * 4 * 2 + 4);
    out.extend_from_slice(&(num_words as u32).to_le_bytes());
    out.extend_from_slice(&n0inv.to_le_bytes());
    for w in &n_words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    for w in &rr_words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out.extend_from_slice(&exponent.to_le_bytes());
    Ok(out)
}

/// Reinterpret a big-endian modulus as little-endian 32-bit words (word 0 is
/// the least-significant word, as the mincrypt struct expects).
fn words_le_from_bytes_be(bytes_be: &[u8]) -> Vec<u32> {
    bytes_be
        .rchunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[4 - chunk.len()..].copy_from_slice(chunk);
            u32::from_be_bytes(word)
        })
        .collect()
}

/// Modular inverse of an odd `n` modulo 2^32, via Newton's iteration for
/// 2-adic inverses: each pass doubles the number of correct bits, so five
/// passes from a 1-bit seed comfortably covers all 32 bits.
fn modinv_mod_2_32(n: u32) -> u32 {
    debug_assert!(n & 1 == 1, "modulus word must be odd");
    let mut inv: u32 = n;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(n.wrapping_mul(inv)));
    }
    0u32.wrapping_sub(inv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modinv_mod_2_32_matches_definition() {
        for n in [1u32, 3, 5, 0xFFFF_FFFF, 0x1234_5679] {
            let neg_inv = modinv_mod_2_32(n);
            let inv = 0u32.wrapping_sub(neg_inv);
            assert_eq!(n.wrapping_mul(inv), 1, "n={n:#x}");
        }
    }

    #[test]
    fn rsa_signer_round_trips_and_signs() {
        use rsa::pkcs8::EncodePrivateKey;
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pem = key
            .to_pkcs8_pem(pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        let signer = RsaSigner::from_pkcs8_pem(&pem, "test@host").unwrap();
        let token = [7u8; TOKEN_LEN];
        let sig = signer.sign(&token).unwrap();
        assert_eq!(sig.len(), 256); // 2048-bit modulus -> 256-byte signature

        let blob = signer.public_key_blob().unwrap();
        let text = String::from_utf8(blob).unwrap();
        assert!(text.ends_with("test@host"));
        assert!(text.contains(' '));
    }
}
