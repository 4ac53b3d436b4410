//! Recoverable ECDSA key pairs on secp256k1.
//!
//! Signatures carry `{v, r, s}` so the signer's public key (and therefore
//! its [`Address`]) can be recovered from the signature and the signed hash
//! alone. Transactions carry no public key.

use crate::info;
use crate::types::address::Address;
use crate::types::hash::Hash;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use powchain_derive::{BinaryCodec, Error};
use rand_core::OsRng;
use std::fs;
use std::io;
use std::path::Path;
use zeroize::Zeroizing;

/// Added to the recovery id to form `v`, so valid values are 27 and 28.
pub const RECOVERY_ID_OFFSET: u8 = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("bytes are not a valid secp256k1 private key")]
    InvalidKey,
    #[error("invalid recovery id in v = {0}")]
    InvalidRecoveryId(u8),
    #[error("signature s value is not canonical")]
    NonCanonicalSignature,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("public key recovery failed")]
    RecoveryFailed,
    #[error("signing failed")]
    Signing,
}

/// Node or wallet signing key. Never encoded onto the wire.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey {
    key: VerifyingKey,
    address: Address,
}

/// Recoverable signature. `r` and `s` are big-endian scalars.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BinaryCodec)]
pub struct RecoverableSignature {
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl PrivateKey {
    pub fn new() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        SigningKey::from_slice(bytes)
            .map(|key| Self { key })
            .map_err(|_| CryptoError::InvalidKey)
    }

    fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.key.to_bytes().into())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(*self.key.verifying_key())
    }

    pub fn address(&self) -> Address {
        self.public_key().address
    }

    /// Signs a 32-byte digest. `k256` always emits low-S signatures.
    pub fn sign_prehash(&self, digest: &Hash) -> Result<RecoverableSignature, CryptoError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(|_| CryptoError::Signing)?;

        let raw = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&raw[..32]);
        s.copy_from_slice(&raw[32..]);

        Ok(RecoverableSignature {
            v: RECOVERY_ID_OFFSET + recovery_id.to_byte(),
            r,
            s,
        })
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl PublicKey {
    fn from_verifying_key(key: VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        // Uncompressed SEC1 is 0x04 || x || y.
        let address = Address::from_public_key_bytes(&point.as_bytes()[1..]);
        Self { key, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

impl RecoverableSignature {
    /// Recovers the signer of `digest`.
    ///
    /// Rejects `v` outside 27..=28 and high-S signatures, so every
    /// (message, key) pair has exactly one accepted encoding.
    pub fn recover(&self, digest: &Hash) -> Result<PublicKey, CryptoError> {
        let recovery_byte = self
            .v
            .checked_sub(RECOVERY_ID_OFFSET)
            .filter(|id| *id <= 1)
            .ok_or(CryptoError::InvalidRecoveryId(self.v))?;
        let recovery_id =
            RecoveryId::from_byte(recovery_byte).ok_or(CryptoError::InvalidRecoveryId(self.v))?;

        let mut raw = [0u8; 64];
        raw[..32].copy_from_slice(&self.r);
        raw[32..].copy_from_slice(&self.s);
        let signature = Signature::from_slice(&raw).map_err(|_| CryptoError::MalformedSignature)?;
        if signature.normalize_s().is_some() {
            return Err(CryptoError::NonCanonicalSignature);
        }

        VerifyingKey::recover_from_prehash(digest.as_slice(), &signature, recovery_id)
            .map(PublicKey::from_verifying_key)
            .map_err(|_| CryptoError::RecoveryFailed)
    }
}

/// Reads a key file holding the private key as 64 hex digits, with an
/// optional `0x` prefix and surrounding whitespace.
pub fn load_key_file(path: &Path) -> io::Result<PrivateKey> {
    let text = Zeroizing::new(fs::read_to_string(path)?);
    let digits = text.trim();
    let digits = digits.strip_prefix("0x").unwrap_or(digits);

    let mut raw = Zeroizing::new([0u8; 32]);
    hex::decode_to_slice(digits, &mut raw[..])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("key file: {e}")))?;

    PrivateKey::from_bytes(&raw)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("key file: {e}")))
}

/// Writes the key as hex. On unix the file is created owner-only.
pub fn save_key_file(key: &PrivateKey, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = Zeroizing::new(format!("{}\n", hex::encode(&key.to_bytes()[..])));
    fs::write(path, text.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Loads the key at `path`, generating and saving a fresh one if the file
/// does not exist yet.
pub fn load_or_generate_key(path: &Path) -> io::Result<PrivateKey> {
    if path.exists() {
        info!("Loading node key from {}", path.display());
        return load_key_file(path);
    }

    let key = PrivateKey::new();
    save_key_file(&key, path)?;
    info!(
        "Generated node key {} at {}",
        key.address(),
        path.display()
    );
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(data: &[u8]) -> Hash {
        let mut h = Hash::sha3();
        h.update(data);
        h.finalize()
    }

    #[test]
    fn recover_returns_signer_address() {
        let key = PrivateKey::new();
        let msg = digest(b"transfer");
        let sig = key.sign_prehash(&msg).unwrap();

        assert!(sig.v == 27 || sig.v == 28);
        assert_eq!(sig.recover(&msg).unwrap().address(), key.address());
    }

    #[test]
    fn recover_over_other_digest_yields_other_address() {
        let key = PrivateKey::new();
        let sig = key.sign_prehash(&digest(b"a")).unwrap();
        let recovered = sig.recover(&digest(b"b"));
        assert!(recovered.map(|pk| pk.address() != key.address()).unwrap_or(true));
    }

    #[test]
    fn out_of_range_v_is_rejected() {
        let key = PrivateKey::new();
        let msg = digest(b"v");
        let mut sig = key.sign_prehash(&msg).unwrap();
        for v in [0u8, 1, 26, 29, 255] {
            sig.v = v;
            assert_eq!(sig.recover(&msg), Err(CryptoError::InvalidRecoveryId(v)));
        }
    }

    #[test]
    fn high_s_is_rejected() {
        let key = PrivateKey::new();
        let msg = digest(b"malleable");
        let sig = key.sign_prehash(&msg).unwrap();

        let mut raw = [0u8; 64];
        raw[..32].copy_from_slice(&sig.r);
        raw[32..].copy_from_slice(&sig.s);
        let low = Signature::from_slice(&raw).unwrap();
        // (r, n - s) verifies for the flipped recovery id but must not be accepted.
        let high = Signature::from_scalars(low.r(), -*low.s()).unwrap();
        let mut flipped = sig;
        flipped.s.copy_from_slice(&high.to_bytes()[32..]);
        flipped.v = if sig.v == 27 { 28 } else { 27 };

        assert_eq!(flipped.recover(&msg), Err(CryptoError::NonCanonicalSignature));
    }

    #[test]
    fn zero_key_is_invalid() {
        assert!(matches!(
            PrivateKey::from_bytes(&[0u8; 32]),
            Err(CryptoError::InvalidKey)
        ));
    }

    #[test]
    fn address_is_deterministic_per_key() {
        let a = PrivateKey::from_bytes(&[3u8; 32]).unwrap();
        let b = PrivateKey::from_bytes(&[3u8; 32]).unwrap();
        let c = PrivateKey::from_bytes(&[4u8; 32]).unwrap();
        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), c.address());
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.key");
        let key = PrivateKey::new();

        save_key_file(&key, &path).unwrap();
        assert_eq!(load_key_file(&path).unwrap().address(), key.address());
    }

    #[test]
    fn key_file_accepts_prefix_and_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        fs::write(&path, format!("  0x{}\n", "11".repeat(32))).unwrap();

        let expected = PrivateKey::from_bytes(&[0x11; 32]).unwrap();
        assert_eq!(load_key_file(&path).unwrap().address(), expected.address());
    }

    #[test]
    fn key_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        fs::write(&path, "not a key").unwrap();
        assert_eq!(
            load_key_file(&path).err().map(|e| e.kind()),
            Some(io::ErrorKind::InvalidData)
        );
    }

    #[test]
    fn load_or_generate_persists_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");

        let first = load_or_generate_key(&path).unwrap();
        let second = load_or_generate_key(&path).unwrap();
        assert_eq!(first.address(), second.address());
    }
}
