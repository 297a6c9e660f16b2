//! The crypto-backend abstraction.

use crate::{Error, Result};
use crate::crypto::KeyMaterial;

/// Public-key cryptography interface.
///
/// The card core never computes RSA itself; it loads key material
/// from the store, checks the authorization state, and hands the
/// operation to an implementation of this trait.  On a token, this is
/// the hardware-tuned primitive; on a host, any software RSA will do.
pub trait Asymmetric {
    /// Produces a raw RSA signature over a DigestInfo structure.
    ///
    /// `digest_info` is the ASN.1 DigestInfo the host submitted with
    /// PSO:COMPUTE DIGITAL SIGNATURE; the implementation applies the
    /// PKCS#1 v1.5 padding.
    fn rsa_sign(&self, key: &KeyMaterial, digest_info: &[u8])
                -> Result<Vec<u8>>;

    /// Decrypts an RSA ciphertext, returning the unpadded plaintext.
    fn rsa_decrypt(&self, key: &KeyMaterial, cipher: &[u8])
                   -> Result<Vec<u8>>;
}

/// A backend without asymmetric support.
///
/// Useful while bringing up a transport: SELECT FILE, VERIFY, and the
/// data-object commands work, and the cryptographic commands fail
/// cleanly.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

impl Asymmetric for Unsupported {
    fn rsa_sign(&self, _: &KeyMaterial, _: &[u8]) -> Result<Vec<u8>> {
        Err(Error::InvalidOperation("no asymmetric backend".into())
            .into())
    }

    fn rsa_decrypt(&self, _: &KeyMaterial, _: &[u8]) -> Result<Vec<u8>> {
        Err(Error::InvalidOperation("no asymmetric backend".into())
            .into())
    }
}
