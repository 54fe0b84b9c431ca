//! Immutable and mutable stored values from [BEP-0044].
//!
//! Immutable items are content-addressed: the target is the SHA-1 of the
//! bencoded value. Mutable items live under SHA-1(public key ‖ optional
//! salt) and carry an ed25519 signature over their salt, sequence number
//! and value.
//!
//! [BEP-0044]: http://www.bittorrent.org/beps/bep_0044.html

use crate::errors::{ErrorKind, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use krpc_encoding::NodeID;
use sha1::{Digest, Sha1};

pub const MAX_VALUE_LEN: usize = 1000;
pub const MAX_SALT_LEN: usize = 64;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// A value held in the storage extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageItem {
    Immutable { value: Vec<u8> },
    Mutable(MutableItem),
}

impl StorageItem {
    pub fn value(&self) -> &[u8] {
        match self {
            StorageItem::Immutable { value } => value,
            StorageItem::Mutable(item) => &item.value,
        }
    }
}

/// What a mutable put writes: the next value and sequence number, chosen
/// by the caller after seeing the current record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableUpdate {
    pub value: Vec<u8>,
    pub seq: i64,
}

/// A signed, sequenced, optionally salted mutable record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableItem {
    pub key: [u8; PUBLIC_KEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],
    pub seq: i64,
    pub value: Vec<u8>,
    pub salt: Option<Vec<u8>>,
}

impl MutableItem {
    /// Builds and signs a mutable item.
    pub fn sign(
        signing_key: &SigningKey,
        value: Vec<u8>,
        seq: i64,
        salt: Option<Vec<u8>>,
    ) -> Result<MutableItem> {
        check_value(&value)?;
        check_salt(salt.as_deref())?;

        let payload = signable(salt.as_deref(), seq, &value);
        let signature = signing_key.sign(&payload);

        Ok(MutableItem {
            key: signing_key.verifying_key().to_bytes(),
            signature: signature.to_bytes(),
            seq,
            value,
            salt,
        })
    }

    /// Verifies the signature and, when given, that the item lives at
    /// `target`.
    pub fn verify(&self, target: Option<&NodeID>) -> Result<()> {
        check_value(&self.value)?;
        check_salt(self.salt.as_deref())?;

        let key =
            VerifyingKey::from_bytes(&self.key).map_err(|_| ErrorKind::InvalidPublicKey)?;
        let signature = Signature::from_bytes(&self.signature);
        let payload = signable(self.salt.as_deref(), self.seq, &self.value);

        key.verify(&payload, &signature)
            .map_err(|_| ErrorKind::InvalidSignature)?;

        if let Some(target) = target {
            if mutable_target(&self.key, self.salt.as_deref()) != *target {
                Err(ErrorKind::InvalidSignature)?;
            }
        }

        Ok(())
    }

    pub fn target(&self) -> NodeID {
        mutable_target(&self.key, self.salt.as_deref())
    }
}

/// The byte string a mutable item's signature covers: the bencoded
/// dictionary `{salt?, seq, v}` without its outer delimiters, built as the
/// ordered key sequence directly so it is byte-exact across codecs.
pub fn signable(salt: Option<&[u8]>, seq: i64, value: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();

    if let Some(salt) = salt {
        payload.extend_from_slice(b"4:salt");
        payload.extend_from_slice(&bencode_bytes(salt));
    }

    payload.extend_from_slice(b"3:seq");
    payload.extend_from_slice(format!("i{}e", seq).as_bytes());
    payload.extend_from_slice(b"1:v");
    payload.extend_from_slice(&bencode_bytes(value));

    payload
}

/// Bencodes a byte string.
pub fn bencode_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut encoded = bytes.len().to_string().into_bytes();
    encoded.push(b':');
    encoded.extend_from_slice(bytes);
    encoded
}

/// Target of an immutable value: SHA-1 of its bencoding.
pub fn immutable_target(value: &[u8]) -> NodeID {
    sha1(&bencode_bytes(value))
}

/// Target of a mutable item: SHA-1 of the public key followed by the salt,
/// when there is one.
pub fn mutable_target(key: &[u8; PUBLIC_KEY_LEN], salt: Option<&[u8]>) -> NodeID {
    let mut hasher = Sha1::new();
    hasher.update(key);
    if let Some(salt) = salt {
        hasher.update(salt);
    }

    let digest = hasher.finalize();
    NodeID::from_bytes(&digest).expect("SHA-1 digests are 20 bytes")
}

/// Checks an immutable value against its claimed target.
pub fn validate_immutable(value: &[u8], target: &NodeID) -> bool {
    value.len() <= MAX_VALUE_LEN && immutable_target(value) == *target
}

pub fn sha1(bytes: &[u8]) -> NodeID {
    let digest = Sha1::digest(bytes);
    NodeID::from_bytes(&digest).expect("SHA-1 digests are 20 bytes")
}

pub(crate) fn check_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_LEN {
        Err(ErrorKind::ValueTooLarge {
            length: value.len(),
        })?;
    }

    Ok(())
}

pub(crate) fn check_salt(salt: Option<&[u8]>) -> Result<()> {
    if let Some(salt) = salt {
        if salt.len() > MAX_SALT_LEN {
            Err(ErrorKind::SaltTooLarge {
                length: salt.len(),
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[0x42; 32])
    }

    #[test]
    fn signable_matches_the_reference_layout() {
        assert_eq!(
            signable(None, 1, b"Hello World!"),
            b"3:seqi1e1:v12:Hello World!".to_vec()
        );

        assert_eq!(
            signable(Some(b"foobar"), 1, b"Hello World!"),
            b"4:salt6:foobar3:seqi1e1:v12:Hello World!".to_vec()
        );
    }

    #[test]
    fn signable_handles_negative_sequence_numbers() {
        assert_eq!(signable(None, -7, b"x"), b"3:seqi-7e1:v1:x".to_vec());
    }

    #[test]
    fn bencode_bytes_prefixes_the_length() {
        assert_eq!(bencode_bytes(b"test-immutable"), b"14:test-immutable".to_vec());
        assert_eq!(bencode_bytes(b""), b"0:".to_vec());
    }

    #[test]
    fn immutable_target_hashes_the_bencoding() {
        assert_eq!(
            immutable_target(b"test-immutable"),
            sha1(b"14:test-immutable")
        );
    }

    #[test]
    fn sign_then_verify() {
        let item = MutableItem::sign(&signing_key(), b"test-mutable".to_vec(), 0, None).unwrap();

        assert!(item.verify(Some(&item.target())).is_ok());
    }

    #[test]
    fn tampered_value_fails_verification() {
        let mut item =
            MutableItem::sign(&signing_key(), b"test-mutable".to_vec(), 0, None).unwrap();
        item.value = b"tampered".to_vec();

        assert!(item.verify(None).is_err());
    }

    #[test]
    fn salted_and_unsalted_targets_differ() {
        let key = signing_key().verifying_key().to_bytes();

        assert_ne!(
            mutable_target(&key, None),
            mutable_target(&key, Some(b"foobar"))
        );
    }

    #[test]
    fn wrong_target_fails_verification() {
        let item = MutableItem::sign(&signing_key(), b"v".to_vec(), 0, Some(b"salt".to_vec()))
            .unwrap();
        let wrong = mutable_target(&item.key, None);

        assert!(item.verify(Some(&wrong)).is_err());
    }

    #[test]
    fn oversize_value_is_rejected_locally() {
        let result = MutableItem::sign(&signing_key(), vec![0u8; 1001], 0, None);

        assert!(matches!(
            result.unwrap_err().kind(),
            ErrorKind::ValueTooLarge { length: 1001 }
        ));
    }

    #[test]
    fn oversize_salt_is_rejected_locally() {
        let result =
            MutableItem::sign(&signing_key(), b"v".to_vec(), 0, Some(vec![0u8; 65]));

        assert!(matches!(
            result.unwrap_err().kind(),
            ErrorKind::SaltTooLarge { length: 65 }
        ));
    }
}
