//! Cryptographic primitives and secret handling.
//!
//! The card keeps no plaintext PINs.  A PIN is turned into a
//! *keystring*, its SHA-1 digest, right after it crosses the APDU
//! boundary; the keystring is what unlocks the wrapped private keys
//! in the data-object store and what the stored verification records
//! are compared against.
//!
//! The RSA primitives themselves live behind the [`Asymmetric`]
//! trait; the card core only decides *when* they run.

use sha1collisiondetection::{Digest, Sha1CD};

pub mod mem;
pub use mem::{Protected, secure_eq};

pub(crate) mod backend;
pub use backend::{Asymmetric, Unsupported};

/// A keystring, the SHA-1 image of a PIN.
///
/// Keystrings wrap the card's private keys: each role that may unlock
/// a key wraps it under that role's keystring.  The digest lives in
/// [`Protected`] memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keystring(Protected);

impl Keystring {
    /// The size of a keystring in bytes.
    pub const SIZE: usize = 20;

    /// Derives the keystring of the given PIN.
    pub fn derive(pin: &[u8]) -> Self {
        let mut md = Protected::new(Keystring::SIZE);
        md.copy_from_slice(&sha1(pin));
        Keystring(md)
    }

    /// Reconstructs a keystring from a stored digest.
    ///
    /// Returns `None` unless `md` is exactly [`Keystring::SIZE`]
    /// bytes.
    pub fn from_digest(md: &[u8]) -> Option<Self> {
        if md.len() == Keystring::SIZE {
            Some(Keystring(md.into()))
        } else {
            None
        }
    }

    /// Returns the digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Computes a SHA-1 digest.
pub(crate) fn sha1(data: &[u8]) -> [u8; 20] {
    let mut h = Sha1CD::new();
    h.update(data);
    let mut md = [0; 20];
    md.copy_from_slice(&h.finalize());
    md
}

/// Unwrapped private-key material.
///
/// The card treats key material as an opaque blob: the data-object
/// store produces it when a keystring unwraps a key slot, and the
/// [`Asymmetric`] backend consumes it.  The blob is held in
/// [`Protected`] memory and zeroed when the operation is done.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyMaterial(Protected);

impl KeyMaterial {
    /// Wraps raw key material.
    pub fn new<B: Into<Protected>>(blob: B) -> Self {
        KeyMaterial(blob.into())
    }

    /// Returns the raw key material.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}
