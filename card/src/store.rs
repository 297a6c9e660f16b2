//! The persistent data-object store abstraction.
//!
//! An OpenPGP card stores everything as *data objects*: tag-indexed
//! records holding cardholder data, key fingerprints, status bytes,
//! and -- behind dedicated interfaces -- the wrapped private keys and
//! the PIN verification records.  The store is flash-backed on a
//! token and presents atomic tag writes; this crate only consumes it
//! through the [`DataObjectStore`] trait.
//!
//! Private keys never leave the store in wrapped form.  A key slot is
//! unlocked by presenting a role and that role's keystring:
//! [`DataObjectStore::load_private_key`] either produces the unwrapped
//! [`KeyMaterial`], reports the slot as empty, or fails because the
//! keystring does not fit.  When a password changes,
//! [`DataObjectStore::rewrap_private_key`] re-encrypts a slot's
//! wrapping from one (role, keystring) pair to another.
//!
//! [`MemoryStore`] is a volatile reference implementation used by the
//! test suite and host-side embeddings.

use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result, Role};
use crate::crypto::{self, KeyMaterial, Keystring, secure_eq};

/// A tag addressing a data object, `P1 || P2` of GET DATA and PUT
/// DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u16);

impl Tag {
    /// The PW status bytes, byte 0 of which is the PW1 lifetime.
    pub const PW_STATUS: Tag = Tag(0x00c4);
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// The private-key slots of the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    /// The signature key, used by PSO:COMPUTE DIGITAL SIGNATURE.
    Signing,
    /// The decryption key, used by PSO:DECIPHER.
    Decryption,
    /// The authentication key, used by INTERNAL AUTHENTICATE.
    Authentication,
}

impl KeySlot {
    /// All slots, in fixed order.
    pub const ALL: [KeySlot; 3] =
        [KeySlot::Signing, KeySlot::Decryption, KeySlot::Authentication];

    pub(crate) fn index(self) -> usize {
        match self {
            KeySlot::Signing => 0,
            KeySlot::Decryption => 1,
            KeySlot::Authentication => 2,
        }
    }
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeySlot::Signing => f.write_str("signing"),
            KeySlot::Decryption => f.write_str("decryption"),
            KeySlot::Authentication => f.write_str("authentication"),
        }
    }
}

/// Simple records living outside the tag-addressed space.
///
/// These hold the PIN verification records: `[len | SHA-1(pw)]`, or
/// just the length byte for PW1 while private keys carry the digest
/// implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleDo {
    /// The PW1 (user PIN) keystring record.
    KeystringPw1,
    /// The reset-code keystring record.
    KeystringRc,
    /// The PW3 (admin PIN) keystring record.
    KeystringPw3,
}

/// Outcome of unwrapping a private-key slot.
#[derive(Debug, Clone)]
pub enum KeyLoad {
    /// The slot holds no key.
    Missing,
    /// The keystring unwrapped the slot.
    Loaded(KeyMaterial),
}

/// Whether PW1's signing authorization survives a signature.
///
/// Byte 0 of the PW status data object; `00` (and an absent object)
/// means the authorization is spent by one PSO:CDS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pw1Lifetime {
    /// PW1 is valid for a single signature.
    SingleUse,
    /// PW1 stays valid until reset or power-down.
    ValidSeveral,
}

/// The store interface the card core runs against.
pub trait DataObjectStore {
    /// Returns the data object under `tag`.
    fn get_data(&self, tag: Tag) -> Option<Vec<u8>>;

    /// Stores a data object under `tag`.
    ///
    /// An error signals a persistent-memory failure.
    fn put_data(&mut self, tag: Tag, data: &[u8]) -> Result<()>;

    /// Returns the stored public-key data object for a key slot.
    fn public_key(&self, slot: KeySlot) -> Option<Vec<u8>>;

    /// Returns a simple record.
    fn read_simple(&self, id: SimpleDo) -> Option<Vec<u8>>;

    /// Writes a simple record.
    fn write_simple(&mut self, id: SimpleDo, data: &[u8]) -> Result<()>;

    /// Unwraps a private-key slot with `role`'s keystring.
    ///
    /// An error means the slot holds a key, but the keystring does
    /// not unwrap it.
    fn load_private_key(&self, slot: KeySlot, role: Role, ks: &Keystring)
                        -> Result<KeyLoad>;

    /// Re-encrypts a slot's wrapping from one (role, keystring) pair
    /// to another.
    ///
    /// A slot holding no key is a successful no-op.  An error signals
    /// a persistent-memory failure; a wrong `ks_old` is *not*
    /// detected here (callers unwrap the slot first) and yields a
    /// wrapping that no longer unwraps.
    fn rewrap_private_key(&mut self, slot: KeySlot,
                          role_old: Role, ks_old: &Keystring,
                          role_new: Role, ks_new: &Keystring)
                          -> Result<()>;

    /// Returns the digital-signature counter.
    fn signature_counter(&self) -> u32;

    /// Increments the digital-signature counter.
    fn increment_signature_counter(&mut self) -> Result<()>;

    /// Returns the PW1 lifetime per the PW status data object.
    fn pw1_lifetime(&self) -> Pw1Lifetime {
        match self.get_data(Tag::PW_STATUS).as_ref().and_then(|d| d.first()) {
            Some(&b) if b != 0 => Pw1Lifetime::ValidSeveral,
            _ => Pw1Lifetime::SingleUse,
        }
    }

    /// Returns the total size of the stored data objects in bytes.
    ///
    /// SELECT FILE reports this in the master-file descriptor.
    fn data_len(&self) -> usize;
}

/// A wrapped private key.
///
/// The material is encrypted under a data-encryption key, and the DEK
/// in turn is wrapped once per role that may unlock the slot.  This
/// volatile model keeps the material directly and tags it with a
/// check value standing in for the DEK; a wrap made with the wrong
/// keystring produces a wrapping that fails to unwrap later, just
/// like the real thing.
#[derive(Clone)]
struct WrappedKey {
    material: KeyMaterial,
    dek: [u8; Keystring::SIZE],
    wraps: [Option<[u8; Keystring::SIZE]>; 3],
}

fn xor(a: &[u8; Keystring::SIZE], b: &[u8]) -> [u8; Keystring::SIZE] {
    let mut out = [0; Keystring::SIZE];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// A volatile, in-memory data-object store.
#[derive(Default, Clone)]
pub struct MemoryStore {
    objects: BTreeMap<u16, Vec<u8>>,
    keystring_pw1: Option<Vec<u8>>,
    keystring_rc: Option<Vec<u8>>,
    keystring_pw3: Option<Vec<u8>>,
    keys: [Option<WrappedKey>; 3],
    public_keys: [Option<Vec<u8>>; 3],
    signatures: u32,
}

impl MemoryStore {
    /// Returns an empty store.
    pub fn new() -> Self {
        Default::default()
    }

    /// Installs a private key wrapped for the given roles.
    pub fn install_private_key(&mut self, slot: KeySlot,
                               material: KeyMaterial,
                               wrapped_for: &[(Role, &Keystring)]) {
        let dek = crypto::sha1(material.as_bytes());
        let mut wraps = [None; 3];
        for (role, ks) in wrapped_for {
            wraps[role.index()] = Some(xor(&dek, ks.as_bytes()));
        }
        self.keys[slot.index()] = Some(WrappedKey { material, dek, wraps });
    }

    /// Stores the public-key data object for a key slot.
    pub fn set_public_key(&mut self, slot: KeySlot, data: Vec<u8>) {
        self.public_keys[slot.index()] = Some(data);
    }
}

impl DataObjectStore for MemoryStore {
    fn get_data(&self, tag: Tag) -> Option<Vec<u8>> {
        self.objects.get(&tag.0).cloned()
    }

    fn put_data(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        self.objects.insert(tag.0, data.to_vec());
        Ok(())
    }

    fn public_key(&self, slot: KeySlot) -> Option<Vec<u8>> {
        self.public_keys[slot.index()].clone()
    }

    fn read_simple(&self, id: SimpleDo) -> Option<Vec<u8>> {
        match id {
            SimpleDo::KeystringPw1 => self.keystring_pw1.clone(),
            SimpleDo::KeystringRc => self.keystring_rc.clone(),
            SimpleDo::KeystringPw3 => self.keystring_pw3.clone(),
        }
    }

    fn write_simple(&mut self, id: SimpleDo, data: &[u8]) -> Result<()> {
        let record = Some(data.to_vec());
        match id {
            SimpleDo::KeystringPw1 => self.keystring_pw1 = record,
            SimpleDo::KeystringRc => self.keystring_rc = record,
            SimpleDo::KeystringPw3 => self.keystring_pw3 = record,
        }
        Ok(())
    }

    fn load_private_key(&self, slot: KeySlot, role: Role, ks: &Keystring)
                        -> Result<KeyLoad> {
        let key = match &self.keys[slot.index()] {
            None => return Ok(KeyLoad::Missing),
            Some(key) => key,
        };

        let wrap = key.wraps[role.index()].as_ref()
            .ok_or(Error::SecurityStatus)?;
        if secure_eq(&xor(wrap, ks.as_bytes()), &key.dek) {
            Ok(KeyLoad::Loaded(key.material.clone()))
        } else {
            Err(Error::SecurityStatus.into())
        }
    }

    fn rewrap_private_key(&mut self, slot: KeySlot,
                          role_old: Role, ks_old: &Keystring,
                          role_new: Role, ks_new: &Keystring)
                          -> Result<()> {
        let key = match &mut self.keys[slot.index()] {
            None => return Ok(()),
            Some(key) => key,
        };

        let wrap = key.wraps[role_old.index()]
            .ok_or_else(|| Error::MemoryFailure(
                format!("{} key has no {} wrapping", slot, role_old)))?;
        // Unwrap with the old keystring, wrap with the new one.  A
        // wrong old keystring propagates garbage, as it would with a
        // real DEK.
        let dek = xor(&wrap, ks_old.as_bytes());
        key.wraps[role_new.index()] = Some(xor(&dek, ks_new.as_bytes()));
        Ok(())
    }

    fn signature_counter(&self) -> u32 {
        self.signatures
    }

    fn increment_signature_counter(&mut self) -> Result<()> {
        self.signatures += 1;
        Ok(())
    }

    fn data_len(&self) -> usize {
        self.objects.values().map(|v| v.len()).sum()
    }
}
