//! SECP256K1 keypairs, deterministic ECDSA signatures and the textual key
//! encodings used on the wire and in the key files.

use std::fs;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::EncodedPoint;
use rand::rngs::OsRng;
use thiserror::Error;

pub const PUBLIC_KEY_FILE: &str = "key.pub";
pub const SECRET_KEY_FILE: &str = "key.sk";

/// Hex length of one padded curve coordinate.
const COORD_HEX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("r or s is out of the [1, N-1] range")]
    BadRange,
    #[error("malformed public key")]
    BadKey,
    #[error("message hash is not valid hex")]
    BadHash,
    #[error("malformed key file: {0}")]
    BadKeyFile(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// An ECDSA signature as the pair of hex-encoded scalars sent on the wire.
pub type SigPair = (String, String);

/// A SECP256K1 keypair. The public side travels as base64-wrapped hex; the
/// secret never leaves the key file.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim_start_matches("0x"))
            .map_err(|_| CryptoError::BadKeyFile("secret is not hex".into()))?;
        let signing = SigningKey::from_slice(&bytes)
            .map_err(|_| CryptoError::BadKeyFile("secret out of range".into()))?;
        Ok(Self { signing })
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// Public key as the hex concatenation x‖y, each coordinate padded to
    /// the curve byte length.
    pub fn public_hex(&self) -> String {
        let point = self.signing.verifying_key().to_encoded_point(false);
        let x = point.x().expect("uncompressed point has x");
        let y = point.y().expect("uncompressed point has y");
        format!("{}{}", hex::encode(x), hex::encode(y))
    }

    /// Wire form of the public key: base64 wrapping of [`Self::public_hex`].
    pub fn public_wire(&self) -> String {
        BASE64.encode(self.public_hex())
    }

    /// Sign a hex-encoded message hash. Signing is deterministic (RFC6979)
    /// and both scalars are non-zero by construction.
    pub fn sign(&self, msg_hash: &str) -> Result<SigPair> {
        let digest = hex::decode(msg_hash).map_err(|_| CryptoError::BadHash)?;
        let sig: Signature = self
            .signing
            .sign_prehash(&digest)
            .map_err(|_| CryptoError::BadHash)?;
        let (r, s) = sig.split_bytes();
        Ok((hex::encode(r), hex::encode(s)))
    }

    /// Write `key.pub` / `key.sk` under `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(PUBLIC_KEY_FILE), BASE64.encode(self.public_hex()))?;
        fs::write(dir.join(SECRET_KEY_FILE), BASE64.encode(self.secret_hex()))?;
        Ok(())
    }

    /// Load the secret from `key.sk` under `dir` and re-derive the public key.
    pub fn load(dir: &Path) -> Result<Self> {
        let encoded = fs::read_to_string(dir.join(SECRET_KEY_FILE))?;
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|_| CryptoError::BadKeyFile("secret is not base64".into()))?;
        let secret = String::from_utf8(raw)
            .map_err(|_| CryptoError::BadKeyFile("secret is not utf-8 hex".into()))?;
        Self::from_secret_hex(&secret)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_hex())
            .finish()
    }
}

/// Decode a public key from either the bare hex form or its base64 wrapping.
pub fn decode_public(public: &str) -> Result<VerifyingKey> {
    let hex_form = if public.len() == 2 * COORD_HEX_LEN && public.chars().all(|c| c.is_ascii_hexdigit()) {
        public.to_owned()
    } else {
        let raw = BASE64.decode(public.trim()).map_err(|_| CryptoError::BadKey)?;
        String::from_utf8(raw).map_err(|_| CryptoError::BadKey)?
    };
    if hex_form.len() != 2 * COORD_HEX_LEN {
        return Err(CryptoError::BadKey);
    }
    let x = hex::decode(&hex_form[..COORD_HEX_LEN]).map_err(|_| CryptoError::BadKey)?;
    let y = hex::decode(&hex_form[COORD_HEX_LEN..]).map_err(|_| CryptoError::BadKey)?;
    let point = EncodedPoint::from_affine_coordinates(
        x.as_slice().into(),
        y.as_slice().into(),
        false,
    );
    VerifyingKey::from_encoded_point(&point).map_err(|_| CryptoError::BadKey)
}

/// Verify `sig` over a hex-encoded message hash against `public` (hex or
/// base64 form). `BadRange` is reported when either scalar falls outside
/// [1, N-1]; an honest mismatch is `Ok(false)`.
pub fn verify(msg_hash: &str, sig: &SigPair, public: &str) -> Result<bool> {
    let key = decode_public(public)?;
    let digest = hex::decode(msg_hash).map_err(|_| CryptoError::BadHash)?;
    let mut bytes = [0u8; 64];
    write_scalar(&sig.0, &mut bytes[..32])?;
    write_scalar(&sig.1, &mut bytes[32..])?;
    let sig = Signature::from_slice(&bytes).map_err(|_| CryptoError::BadRange)?;
    Ok(key.verify_prehash(&digest, &sig).is_ok())
}

fn write_scalar(hex_scalar: &str, out: &mut [u8]) -> Result<()> {
    let raw = hex::decode(hex_scalar).map_err(|_| CryptoError::BadRange)?;
    if raw.len() > out.len() {
        return Err(CryptoError::BadRange);
    }
    // left-pad short scalars
    let offset = out.len() - raw.len();
    out[offset..].copy_from_slice(&raw);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn hash_of(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[test]
    fn sign_and_verify() {
        let pair = KeyPair::generate();
        let msg = hash_of(b"hello world");
        let sig = pair.sign(&msg).unwrap();
        assert!(verify(&msg, &sig, &pair.public_wire()).unwrap());
        assert!(verify(&msg, &sig, &pair.public_hex()).unwrap());
    }

    #[test]
    fn tampered_hash_fails() {
        let pair = KeyPair::generate();
        let sig = pair.sign(&hash_of(b"original")).unwrap();
        assert!(!verify(&hash_of(b"tampered"), &sig, &pair.public_wire()).unwrap());
    }

    #[test]
    fn zero_scalar_is_bad_range() {
        let pair = KeyPair::generate();
        let msg = hash_of(b"payload");
        let sig = (String::from("00"), pair.sign(&msg).unwrap().1);
        assert!(matches!(
            verify(&msg, &sig, &pair.public_wire()),
            Err(CryptoError::BadRange)
        ));
    }

    #[test]
    fn signing_is_deterministic() {
        let pair = KeyPair::generate();
        let msg = hash_of(b"same input");
        assert_eq!(pair.sign(&msg).unwrap(), pair.sign(&msg).unwrap());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("galena-keys-{}", std::process::id()));
        let pair = KeyPair::generate();
        pair.save(&dir).unwrap();
        let loaded = KeyPair::load(&dir).unwrap();
        assert_eq!(pair.public_hex(), loaded.public_hex());
        let on_disk = std::fs::read_to_string(dir.join(PUBLIC_KEY_FILE)).unwrap();
        assert_eq!(on_disk, BASE64.encode(pair.public_hex()));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn public_hex_is_padded() {
        for _ in 0..4 {
            let pair = KeyPair::generate();
            assert_eq!(pair.public_hex().len(), 128);
        }
    }
}
