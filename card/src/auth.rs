//! PIN verification and authorization state.
//!
//! Three credentials gate the card: the user PIN (PW1), the admin PIN
//! (PW3), and the reset code.  Each has a retry counter; three
//! consecutive mismatches block the credential until an authorized
//! reset.  Successful verification raises capability flags that the
//! cryptographic commands check, and caches the keystring so those
//! commands can unwrap their key slot.
//!
//! PW1 is special: while private keys exist, the PIN is verified by
//! attempting to unwrap a key with the derived keystring, and the
//! stored verification record shrinks to a bare length byte.  Only a
//! key-less card verifies PW1 against the full stored record, or,
//! before one is written, against the factory default.

use crate::{Error, Result};
use crate::card::Options;
use crate::crypto::{Keystring, secure_eq};
use crate::store::{DataObjectStore, KeyLoad, KeySlot, SimpleDo};

const TRACE: bool = false;

/// The role presenting a credential.
///
/// Each role may wrap each private-key slot under its own keystring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The cardholder, authenticated by PW1.
    User,
    /// The bearer of the reset code.
    ResetCode,
    /// The administrator, authenticated by PW3.
    Admin,
}

impl Role {
    pub(crate) fn index(self) -> usize {
        match self {
            Role::User => 0,
            Role::ResetCode => 1,
            Role::Admin => 2,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::ResetCode => f.write_str("reset code"),
            Role::Admin => f.write_str("admin"),
        }
    }
}

/// A PIN retry counter.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RetryCounter(u8);

impl RetryCounter {
    const MAX: u8 = 3;

    pub(crate) fn is_locked(&self) -> bool {
        self.0 >= RetryCounter::MAX
    }

    pub(crate) fn increment(&mut self) {
        if self.0 < RetryCounter::MAX {
            self.0 += 1;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Outcome of a PIN verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerifyOutcome {
    /// The PIN matched; the counter was reset.
    Verified,
    /// The PIN did not match; the counter was incremented.
    Mismatch,
    /// The credential is blocked; the PIN was not looked at.
    Blocked,
}

/// Outcome of the low-level admin check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdminVerify {
    /// Matched; carries the byte length of the admin PIN consumed
    /// from the front of the buffer.
    Verified(usize),
    /// Mismatch; the counter was incremented.
    Mismatch,
    /// PW3 is blocked.
    Blocked,
}

/// The card's volatile authorization state.
///
/// The capability flags and cached keystrings are cleared by a card
/// reset; the retry counters survive it.
#[derive(Debug, Default)]
pub(crate) struct AuthState {
    cds: bool,
    other: bool,
    admin: bool,

    pw1_errors: RetryCounter,
    rc_errors: RetryCounter,
    pw3_errors: RetryCounter,

    // Live while a PW1-gated operation may still run; scrubbed when
    // the last PW1 capability falls.
    pw1_keystring: Option<Keystring>,
    // Live while the admin is authorized.
    pw3_keystring: Option<Keystring>,
}

impl AuthState {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Clears the volatile state on card reset.  Retry counters
    /// persist.
    pub(crate) fn reset(&mut self) {
        self.cds = false;
        self.other = false;
        self.admin = false;
        self.pw1_keystring = None;
        self.pw3_keystring = None;
    }

    pub(crate) fn cds_authorized(&self) -> bool {
        self.cds
    }

    pub(crate) fn other_authorized(&self) -> bool {
        self.other
    }

    pub(crate) fn admin_authorized(&self) -> bool {
        self.admin
    }

    pub(crate) fn pw1_locked(&self) -> bool {
        self.pw1_errors.is_locked()
    }

    pub(crate) fn rc_locked(&self) -> bool {
        self.rc_errors.is_locked()
    }

    pub(crate) fn pw1_keystring(&self) -> Option<&Keystring> {
        self.pw1_keystring.as_ref()
    }

    pub(crate) fn pw3_keystring(&self) -> Option<&Keystring> {
        self.pw3_keystring.as_ref()
    }

    /// Replaces the cached admin keystring, e.g. after PW3 changed.
    pub(crate) fn cache_pw3_keystring(&mut self, ks: Keystring) {
        self.pw3_keystring = Some(ks);
    }

    /// Revokes the signing capability.
    pub(crate) fn reset_pso_cds(&mut self) {
        self.cds = false;
        self.scrub_pw1();
    }

    /// Revokes the decryption and authentication capability.
    pub(crate) fn reset_pso_other(&mut self) {
        self.other = false;
        self.scrub_pw1();
    }

    fn scrub_pw1(&mut self) {
        if !self.cds && !self.other {
            self.pw1_keystring = None;
        }
    }

    pub(crate) fn increment_pw1_errors(&mut self) {
        self.pw1_errors.increment();
    }

    pub(crate) fn reset_pw1_errors(&mut self) {
        self.pw1_errors.reset();
    }

    pub(crate) fn increment_rc_errors(&mut self) {
        self.rc_errors.increment();
    }

    pub(crate) fn reset_rc_errors(&mut self) {
        self.rc_errors.reset();
    }

    pub(crate) fn reset_pw3_errors(&mut self) {
        self.pw3_errors.reset();
    }

    /// Verifies PW1 for signing (VERIFY P2=81).
    pub(crate) fn verify_pso_cds<S>(&mut self, store: &S, opts: &Options,
                                    pin: &[u8]) -> VerifyOutcome
    where S: DataObjectStore,
    {
        match self.verify_pw1(store, opts, pin, KeySlot::Signing) {
            VerifyOutcome::Verified => {
                self.cds = true;
                VerifyOutcome::Verified
            }
            other => other,
        }
    }

    /// Verifies PW1 for decryption and authentication (VERIFY P2=82).
    pub(crate) fn verify_pso_other<S>(&mut self, store: &S, opts: &Options,
                                      pin: &[u8]) -> VerifyOutcome
    where S: DataObjectStore,
    {
        match self.verify_pw1(store, opts, pin, KeySlot::Decryption) {
            VerifyOutcome::Verified => {
                self.other = true;
                VerifyOutcome::Verified
            }
            other => other,
        }
    }

    fn verify_pw1<S>(&mut self, store: &S, opts: &Options, pin: &[u8],
                     primary: KeySlot) -> VerifyOutcome
    where S: DataObjectStore,
    {

        if self.pw1_errors.is_locked() {
            t!(TRACE, "verify_pw1", "blocked");
            return VerifyOutcome::Blocked;
        }

        let ks = Keystring::derive(pin);
        if check_pw1(store, opts, pin, &ks, primary) {
            t!(TRACE, "verify_pw1", "good");
            self.pw1_errors.reset();
            self.pw1_keystring = Some(ks);
            VerifyOutcome::Verified
        } else {
            t!(TRACE, "verify_pw1", "failed");
            self.pw1_errors.increment();
            VerifyOutcome::Mismatch
        }
    }

    /// Verifies PW3 (VERIFY P2=83).
    pub(crate) fn verify_admin<S>(&mut self, store: &S, opts: &Options,
                                  pin: &[u8]) -> VerifyOutcome
    where S: DataObjectStore,
    {
        match self.verify_admin_0(store, opts, pin, Some(pin.len())) {
            AdminVerify::Verified(_) => {
                self.admin = true;
                VerifyOutcome::Verified
            }
            AdminVerify::Mismatch => VerifyOutcome::Mismatch,
            AdminVerify::Blocked => VerifyOutcome::Blocked,
        }
    }

    /// Checks the admin PIN at the front of `buf`.
    ///
    /// The length of the admin PIN is not delimited in the command
    /// data; it is taken from the stored PW3 record (or the factory
    /// default).  Pass `expected_len` to additionally require a
    /// specific length, as plain VERIFY does.  On success the admin
    /// keystring is cached for later key operations.
    pub(crate) fn verify_admin_0<S>(&mut self, store: &S, opts: &Options,
                                    buf: &[u8], expected_len: Option<usize>)
                                    -> AdminVerify
    where S: DataObjectStore,
    {

        if self.pw3_errors.is_locked() {
            t!(TRACE, "verify_admin_0", "blocked");
            return AdminVerify::Blocked;
        }

        let (len, stored) = match store.read_simple(SimpleDo::KeystringPw3) {
            Some(rec) if rec.len() == 1 + Keystring::SIZE =>
                (rec[0] as usize, Some(Vec::from(&rec[1..]))),
            _ => (opts.initial_pw3().len(), None),
        };

        let matches = expected_len.map(|n| n == len).unwrap_or(true)
            && buf.len() >= len
            && match &stored {
                Some(md) =>
                    secure_eq(md, Keystring::derive(&buf[..len]).as_bytes()),
                None => secure_eq(&buf[..len], opts.initial_pw3()),
            };

        if matches {
            t!(TRACE, "verify_admin_0", "good, {} bytes consumed", len);
            self.pw3_errors.reset();
            self.pw3_keystring = Some(Keystring::derive(&buf[..len]));
            AdminVerify::Verified(len)
        } else {
            t!(TRACE, "verify_admin_0", "failed");
            self.pw3_errors.increment();
            AdminVerify::Mismatch
        }
    }
}

/// Checks a PW1 candidate against the card's verification material.
///
/// Any private key wrapped for the user is authoritative; the stored
/// record and the factory default only matter while no key exists.
fn check_pw1<S>(store: &S, opts: &Options, pin: &[u8], ks: &Keystring,
                primary: KeySlot) -> bool
where S: DataObjectStore,
{
    let others = KeySlot::ALL.iter().copied().filter(|s| *s != primary);
    for slot in std::iter::once(primary).chain(others) {
        match store.load_private_key(slot, Role::User, ks) {
            Ok(KeyLoad::Loaded(_)) => return true,
            Ok(KeyLoad::Missing) => continue,
            Err(_) => return false,
        }
    }

    match store.read_simple(SimpleDo::KeystringPw1) {
        Some(rec) if rec.len() == 1 + Keystring::SIZE =>
            rec[0] as usize == pin.len()
                && secure_eq(&rec[1..], ks.as_bytes()),
        // A bare length byte means the digest lives in the wrapped
        // keys, and we just found none: unverifiable.
        Some(_) => false,
        None => secure_eq(pin, opts.initial_pw1()),
    }
}

/// Builds a stored keystring record, `[len | digest]`.
pub(crate) fn keystring_record(pin_len: usize, ks: &Keystring) -> Vec<u8> {
    let mut rec = Vec::with_capacity(1 + Keystring::SIZE);
    rec.push(pin_len as u8);
    rec.extend_from_slice(ks.as_bytes());
    rec
}

/// How a keystring change affected the private keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rewrap {
    /// No slot held a key; nothing was re-encrypted.
    NoKeys,
    /// This many keys were re-encrypted under the new keystring.
    Rewrapped(usize),
}

/// Re-encrypts every populated key slot from one (role, keystring)
/// pair to another.
///
/// Fails with [`Error::SecurityStatus`] if a populated slot does not
/// unwrap under `old`, and with [`Error::MemoryFailure`] if the store
/// cannot record a new wrapping.  Slots already re-encrypted when a
/// later slot fails keep the new wrapping; both keystrings still
/// unwrap them, so no key is lost.
pub(crate) fn change_keystring<S>(store: &mut S,
                                  role_old: Role, old: &Keystring,
                                  role_new: Role, new: &Keystring)
                                  -> Result<Rewrap>
where S: DataObjectStore,
{

    let mut rewrapped = 0;
    for slot in KeySlot::ALL {
        match store.load_private_key(slot, role_old, old) {
            Ok(KeyLoad::Missing) => continue,
            Ok(KeyLoad::Loaded(_)) => {
                store.rewrap_private_key(slot, role_old, old, role_new, new)
                    .map_err(|e| Error::MemoryFailure(e.to_string()))?;
                t!(TRACE, "change_keystring", "rewrapped the {} key", slot);
                rewrapped += 1;
            }
            Err(_) => return Err(Error::SecurityStatus.into()),
        }
    }

    Ok(match rewrapped {
        0 => Rewrap::NoKeys,
        n => Rewrap::Rewrapped(n),
    })
}
