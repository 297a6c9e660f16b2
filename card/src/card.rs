//! The card session: dispatcher and command handlers.
//!
//! A [`Card`] owns everything a single card session touches: the
//! data-object store, the asymmetric backend, the file-selection
//! state, and the authorization state.  The transport hands it one
//! complete command APDU at a time; [`Card::handle`] dispatches on
//! the instruction byte and always produces a response ending in a
//! status word.

use std::convert::TryFrom;

use crate::{Error, Result, Role};
use crate::apdu::{Command, Instruction, Response, Status};
use crate::auth::{self, AdminVerify, AuthState, Rewrap, VerifyOutcome,
                  keystring_record};
use crate::crypto::{Asymmetric, KeyMaterial, Keystring, secure_eq};
use crate::store::{DataObjectStore, KeyLoad, KeySlot, Pw1Lifetime, SimpleDo,
                   Tag};

const TRACE: bool = false;

/// The application identifier of the OpenPGP card application.
///
/// `D2 76 00 01 24` is the registered RID, `01` the OpenPGP
/// application, followed by version, manufacturer, and serial number
/// fields.
pub const OPENPGP_AID: [u8; 16] = [
    0xd2, 0x76, 0x00, 0x01, 0x24, 0x01,
    0x02, 0x00,             // Version 2.0.
    0xf5, 0x17,             // Manufacturer.
    0x00, 0x00, 0x00, 0x01, // Serial number.
    0x00, 0x00,             // Reserved.
];

/// The master-file descriptor returned by SELECT FILE `3F 00`.
///
/// Bytes 2 and 3 are patched with the low and high byte of the
/// data-object store's total size.
const MF_DESCRIPTOR: [u8; 20] = [
    0x00, 0x00,             // Unused.
    0x00, 0x00,             // Number of bytes in this directory.
    0x3f, 0x00,             // Identifier of the selected file: MF.
    0x38,                   // It's a DF.
    0xff,                   // Unused.
    0xff, 0x44, 0x44,       // Access conditions.
    0x01,                   // Status of the selected file: OK, unblocked.
    0x05,                   // Number of data bytes that follow.
    0x03,                   // Features.
    0x01,                   // Number of subdirectories (OpenPGP).
    0x01,                   // Number of elementary files (serial number).
    0x00, 0x00,             // Number of secret codes, unused.
    0x00, 0x00,             // PIN status: OK, not blocked.
];

/// Card personalization.
#[derive(Debug, Clone)]
pub struct Options {
    aid: Vec<u8>,
    initial_pw1: Vec<u8>,
    initial_pw3: Vec<u8>,
    rsa_bits: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            aid: OPENPGP_AID.to_vec(),
            initial_pw1: b"123456".to_vec(),
            initial_pw3: b"12345678".to_vec(),
            rsa_bits: 2048,
        }
    }
}

impl Options {
    /// Returns the default personalization.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the application identifier.
    pub fn set_aid(mut self, aid: Vec<u8>) -> Self {
        self.aid = aid;
        self
    }

    /// Sets the factory default user PIN.
    pub fn set_initial_pw1(mut self, pin: Vec<u8>) -> Self {
        self.initial_pw1 = pin;
        self
    }

    /// Sets the factory default admin PIN.
    pub fn set_initial_pw3(mut self, pin: Vec<u8>) -> Self {
        self.initial_pw3 = pin;
        self
    }

    /// Sets the RSA modulus size the card is personalized for.
    pub fn set_rsa_bits(mut self, bits: usize) -> Self {
        self.rsa_bits = bits;
        self
    }

    pub(crate) fn aid(&self) -> &[u8] {
        &self.aid
    }

    pub(crate) fn initial_pw1(&self) -> &[u8] {
        &self.initial_pw1
    }

    pub(crate) fn initial_pw3(&self) -> &[u8] {
        &self.initial_pw3
    }

    /// The exact DigestInfo length PSO:CDS accepts.
    ///
    /// The card signs SHA-1 DigestInfo structures: a 15-byte ASN.1
    /// prefix plus the 20-byte digest.  The PKCS#1 padding must still
    /// fit the configured modulus.
    pub(crate) fn digest_info_len(&self) -> usize {
        let len = 15 + 20;
        debug_assert!(len + 11 <= self.rsa_bits / 8);
        len
    }
}

/// The currently selected file.
///
/// Only SELECT FILE moves this; power-up and card reset return it to
/// [`CurrentFile::Unselected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentFile {
    /// Nothing selected.
    Unselected,
    /// The master file.
    Mf,
    /// EF.DIR, the application directory.  Reserved; SELECT FILE
    /// cannot reach it yet.
    EfDir,
    /// MF.EF-GDO, serial number and cardholder name.
    EfSerial,
    /// The OpenPGP application DF.
    DfOpenpgp,
}

/// A card session.
///
/// One instance models one card: volatile session state plus the
/// persistent store.  Commands are strictly serialized; the single
/// mutable borrow of [`Card::handle`] is the Rust spelling of that.
pub struct Card<S, A> {
    store: S,
    rsa: A,
    opts: Options,
    file: CurrentFile,
    auth: AuthState,
}

impl<S, A> Card<S, A>
where S: DataObjectStore,
      A: Asymmetric,
{
    /// Creates a card over the given store and asymmetric backend.
    pub fn new(store: S, rsa: A, opts: Options) -> Self {
        Card {
            store,
            rsa,
            opts,
            file: CurrentFile::Unselected,
            auth: AuthState::new(),
        }
    }

    /// Resets the card, as a power cycle or USB reset does.
    ///
    /// File selection, the authorization flags, and the cached
    /// keystrings are cleared.  The store and the retry counters
    /// persist.
    pub fn reset(&mut self) {
        self.file = CurrentFile::Unselected;
        self.auth.reset();
    }

    /// Returns the currently selected file.
    pub fn current_file(&self) -> CurrentFile {
        self.file
    }

    /// Returns the data-object store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the data-object store, mutably.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Processes one command APDU, returning the complete response
    /// APDU.
    ///
    /// This is total: whatever the command, the response ends in a
    /// status word.
    pub fn handle(&mut self, buf: &[u8]) -> Vec<u8> {

        match self.process(buf) {
            Ok(response) => response.to_bytes(),
            Err(e) => {
                t!(TRACE, "Card::handle", "command failed: {}", e);
                let status = e.downcast_ref::<Error>().map(Error::status)
                    .unwrap_or(Status::GeneralError);
                Response::status(status).to_bytes()
            }
        }
    }

    fn process(&mut self, buf: &[u8]) -> Result<Response> {
        // Dispatch before parsing the body: an instruction we don't
        // know is `6D 00` no matter how it is framed.
        let ins = *buf.get(1)
            .ok_or_else(|| Error::WrongData("missing header".into()))?;
        let ins = Instruction::try_from(ins)?;
        let apdu = Command::parse(buf)?;

        use Instruction::*;
        match ins {
            Verify => self.cmd_verify(&apdu),
            ChangeReferenceData => self.cmd_change_password(&apdu),
            PerformSecurityOperation => self.cmd_pso(&apdu),
            ResetRetryCounter => self.cmd_reset_user_password(&apdu),
            GenerateAsymmetricKeyPair => self.cmd_generate_keypair(&apdu, buf),
            InternalAuthenticate => self.cmd_internal_authenticate(&apdu),
            SelectFile => self.cmd_select_file(&apdu),
            ReadBinary => self.cmd_read_binary(&apdu),
            GetData => self.cmd_get_data(&apdu),
            PutData | PutDataOdd => self.cmd_put_data(&apdu),
        }
    }

    fn cmd_select_file(&mut self, apdu: &Command) -> Result<Response> {

        if apdu.p1 == 0x04 {
            // Selection by DF name.  The only DF on this card is the
            // OpenPGP application; accept the name without looking.
            t!(TRACE, "cmd_select_file", "select DF by name");
            self.file = CurrentFile::DfOpenpgp;
            Ok(Response::success())
        } else if apdu.data == [0x2f, 0x02] {
            // MF.EF-GDO, serial number and owner name.
            t!(TRACE, "cmd_select_file", "select EF 2F02");
            self.file = CurrentFile::EfSerial;
            Ok(Response::success())
        } else if apdu.data == [0x3f, 0x00] {
            t!(TRACE, "cmd_select_file", "select MF");
            self.file = CurrentFile::Mf;
            if apdu.p2 == 0x0c {
                Ok(Response::success())
            } else {
                let mut fci = Vec::from(&MF_DESCRIPTOR[..]);
                let len = self.store.data_len();
                fci[2] = (len & 0xff) as u8;
                fci[3] = ((len >> 8) & 0xff) as u8;
                Ok(Response::with_data(fci))
            }
        } else {
            t!(TRACE, "cmd_select_file", "no such file");
            self.file = CurrentFile::Unselected;
            Err(Error::FileNotFound.into())
        }
    }

    fn cmd_verify(&mut self, apdu: &Command) -> Result<Response> {
        t!(TRACE, "cmd_verify", "P2 = {:02x}", apdu.p2);

        let outcome = match apdu.p2 {
            0x81 => self.auth.verify_pso_cds(&self.store, &self.opts,
                                             apdu.data),
            0x82 => self.auth.verify_pso_other(&self.store, &self.opts,
                                               apdu.data),
            0x83 => self.auth.verify_admin(&self.store, &self.opts,
                                           apdu.data),
            _ => return Err(Error::WrongParameters.into()),
        };

        match outcome {
            VerifyOutcome::Verified => Ok(Response::success()),
            VerifyOutcome::Mismatch => Err(Error::SecurityStatus.into()),
            VerifyOutcome::Blocked =>
                Err(Error::AuthenticationBlocked.into()),
        }
    }

    fn cmd_change_password(&mut self, apdu: &Command) -> Result<Response> {
        t!(TRACE, "cmd_change_password", "P2 = {:02x}", apdu.p2);

        match apdu.p2 {
            0x81 => self.change_pw1(apdu.data),
            0x83 => self.change_pw3(apdu.data),
            _ => Err(Error::WrongParameters.into()),
        }
    }

    /// CHANGE REFERENCE DATA for PW1, `old || new` in the data.
    fn change_pw1(&mut self, data: &[u8]) -> Result<Response> {

        // The split between old and new PIN is the stored PW1 length,
        // or the factory default's before a record exists.
        let pw_len = match self.store.read_simple(SimpleDo::KeystringPw1) {
            Some(rec) if !rec.is_empty() => rec[0] as usize,
            _ => self.opts.initial_pw1().len(),
        };
        if data.len() < pw_len {
            t!(TRACE, "change_pw1", "data too short for the old PIN");
            return Err(Error::SecurityStatus.into());
        }
        let (old_pin, new_pin) = data.split_at(pw_len);
        let old_ks = Keystring::derive(old_pin);
        let new_ks = Keystring::derive(new_pin);

        let rewrap = auth::change_keystring(&mut self.store,
                                            Role::User, &old_ks,
                                            Role::User, &new_ks)?;
        self.finish_pw1_change(new_pin.len(), &new_ks, rewrap)?;
        t!(TRACE, "change_pw1", "PW1 changed");
        Ok(Response::success())
    }

    /// CHANGE REFERENCE DATA for PW3, `old || new` in the data.
    fn change_pw3(&mut self, data: &[u8]) -> Result<Response> {

        let consumed = match self.auth.verify_admin_0(&self.store,
                                                      &self.opts,
                                                      data, None) {
            AdminVerify::Verified(n) => n,
            AdminVerify::Mismatch =>
                return Err(Error::SecurityStatus.into()),
            AdminVerify::Blocked =>
                return Err(Error::AuthenticationBlocked.into()),
        };
        let (old_pin, new_pin) = data.split_at(consumed);
        let old_ks = Keystring::derive(old_pin);
        let new_ks = Keystring::derive(new_pin);

        // The new PW3 record is installed right away; the keys are
        // re-encrypted below.
        self.store.write_simple(
            SimpleDo::KeystringPw3,
            &keystring_record(new_pin.len(), &new_ks))
            .map_err(|e| Error::MemoryFailure(e.to_string()))?;

        auth::change_keystring(&mut self.store,
                               Role::Admin, &old_ks,
                               Role::Admin, &new_ks)?;
        self.auth.cache_pw3_keystring(new_ks);
        self.auth.reset_pw3_errors();
        t!(TRACE, "change_pw3", "PW3 changed");
        Ok(Response::success())
    }

    fn cmd_reset_user_password(&mut self, apdu: &Command) -> Result<Response> {
        t!(TRACE, "cmd_reset_user_password", "P1 = {:02x}", apdu.p1);

        match apdu.p1 {
            0x00 => self.reset_pw1_by_resetcode(apdu.data),
            0x02 => self.reset_pw1_by_admin(apdu.data),
            _ => Err(Error::WrongParameters.into()),
        }
    }

    /// RESET RETRY COUNTER with the reset code, `rc || newPW1`.
    fn reset_pw1_by_resetcode(&mut self, data: &[u8]) -> Result<Response> {

        if self.auth.rc_locked() {
            return Err(Error::AuthenticationBlocked.into());
        }
        let rec = self.store.read_simple(SimpleDo::KeystringRc)
            .filter(|rec| rec.len() == 1 + Keystring::SIZE)
            .ok_or(Error::SecurityStatus)?;

        let rc_len = rec[0] as usize;
        if data.len() < rc_len {
            self.auth.increment_rc_errors();
            return Err(Error::SecurityStatus.into());
        }
        let (rc, new_pin) = data.split_at(rc_len);
        let old_ks = Keystring::derive(rc);
        let new_ks = Keystring::derive(new_pin);

        let rewrap = match auth::change_keystring(&mut self.store,
                                                  Role::ResetCode, &old_ks,
                                                  Role::User, &new_ks) {
            Ok(rewrap) => rewrap,
            Err(e) => {
                if matches!(e.downcast_ref::<Error>(),
                            Some(Error::SecurityStatus)) {
                    self.auth.increment_rc_errors();
                }
                return Err(e);
            }
        };
        if rewrap == Rewrap::NoKeys
            && ! secure_eq(&rec[1..], old_ks.as_bytes())
        {
            // No key proved the reset code; the stored record must.
            self.auth.increment_rc_errors();
            return Err(Error::SecurityStatus.into());
        }

        self.finish_pw1_change(new_pin.len(), &new_ks, rewrap)?;
        self.auth.reset_rc_errors();
        t!(TRACE, "reset_pw1_by_resetcode", "PW1 reset with the reset code");
        Ok(Response::success())
    }

    /// RESET RETRY COUNTER by the admin, the data is the new PW1.
    fn reset_pw1_by_admin(&mut self, data: &[u8]) -> Result<Response> {

        if !self.auth.admin_authorized() {
            return Err(Error::SecurityStatus.into());
        }
        let old_ks = self.auth.pw3_keystring().cloned()
            .ok_or(Error::SecurityStatus)?;
        let new_ks = Keystring::derive(data);

        let rewrap = auth::change_keystring(&mut self.store,
                                            Role::Admin, &old_ks,
                                            Role::User, &new_ks)?;
        self.finish_pw1_change(data.len(), &new_ks, rewrap)?;
        t!(TRACE, "reset_pw1_by_admin", "PW1 reset by the admin");
        Ok(Response::success())
    }

    /// Stores the new PW1 record and resets the PW1 state.
    ///
    /// While private keys exist they carry the keystring digest, and
    /// the record shrinks to the bare length byte.
    fn finish_pw1_change(&mut self, pin_len: usize, new_ks: &Keystring,
                         rewrap: Rewrap) -> Result<()> {
        let record = match rewrap {
            Rewrap::NoKeys => keystring_record(pin_len, new_ks),
            Rewrap::Rewrapped(_) => vec![pin_len as u8],
        };
        self.store.write_simple(SimpleDo::KeystringPw1, &record)
            .map_err(|e| Error::MemoryFailure(e.to_string()))?;
        self.auth.reset_pso_cds();
        self.auth.reset_pw1_errors();
        Ok(())
    }

    fn cmd_pso(&mut self, apdu: &Command) -> Result<Response> {
        t!(TRACE, "cmd_pso", "P1 = {:02x}, P2 = {:02x}, {} data bytes",
           apdu.p1, apdu.p2, apdu.data.len());

        match (apdu.p1, apdu.p2) {
            (0x9e, 0x9a) => self.pso_compute_signature(apdu.data),
            (0x80, 0x86) => self.pso_decipher(apdu.data),
            (p1, p2) => Err(Error::InvalidOperation(
                format!("PSO {:02x}/{:02x}", p1, p2)).into()),
        }
    }

    /// PSO:COMPUTE DIGITAL SIGNATURE.
    fn pso_compute_signature(&mut self, data: &[u8]) -> Result<Response> {

        if !self.auth.cds_authorized() {
            return Err(Error::SecurityStatus.into());
        }
        if data.len() != self.opts.digest_info_len() {
            t!(TRACE, "pso_compute_signature", "wrong DigestInfo length: {}", data.len());
            return Err(Error::WrongData(
                format!("DigestInfo must be {} bytes",
                        self.opts.digest_info_len())).into());
        }

        let ks = self.auth.pw1_keystring().cloned()
            .ok_or(Error::SecurityStatus)?;
        let signature = self.user_key(KeySlot::Signing, &ks)
            .and_then(|key| self.rsa.rsa_sign(&key, data));
        match signature {
            Ok(sig) => {
                self.store.increment_signature_counter()
                    .map_err(|e| Error::MemoryFailure(e.to_string()))?;
                if self.store.pw1_lifetime() == Pw1Lifetime::SingleUse {
                    self.auth.reset_pso_cds();
                }
                t!(TRACE, "pso_compute_signature", "signature made, counter = {}",
                   self.store.signature_counter());
                Ok(Response::with_data(sig))
            }
            Err(e) => {
                t!(TRACE, "pso_compute_signature", "signature failed: {}", e);
                // Force re-verification.
                self.auth.reset_pso_cds();
                Err(Error::InvalidOperation("signature failed".into())
                    .into())
            }
        }
    }

    /// PSO:DECIPHER.
    fn pso_decipher(&mut self, data: &[u8]) -> Result<Response> {

        if self.auth.pw1_locked() || !self.auth.other_authorized() {
            return Err(Error::SecurityStatus.into());
        }
        let key = self.reload_user_key(KeySlot::Decryption)?;

        // The leading data byte is the padding indicator; skip it.
        let cipher = match data.split_first() {
            Some((_, cipher)) => cipher,
            None => return Err(Error::WrongData(
                "empty cryptogram".into()).into()),
        };
        let plain = self.rsa.rsa_decrypt(&key, cipher)
            .map_err(|e| Error::InvalidOperation(
                format!("decryption failed: {}", e)))?;
        Ok(Response::with_data(plain))
    }

    /// INTERNAL AUTHENTICATE.
    fn cmd_internal_authenticate(&mut self, apdu: &Command)
                                 -> Result<Response> {

        if apdu.p1 != 0x00 || apdu.p2 != 0x00 {
            return Err(Error::InvalidOperation(
                format!("authenticate {:02x}/{:02x}",
                        apdu.p1, apdu.p2)).into());
        }
        if self.auth.pw1_locked() || !self.auth.other_authorized() {
            return Err(Error::SecurityStatus.into());
        }
        let key = self.reload_user_key(KeySlot::Authentication)?;

        let sig = self.rsa.rsa_sign(&key, apdu.data)
            .map_err(|e| Error::InvalidOperation(
                format!("authentication failed: {}", e)))?;
        Ok(Response::with_data(sig))
    }

    /// Loads a PW1-gated key for a one-shot operation.
    ///
    /// Spends the authorization: the PSO:OTHER capability falls, and
    /// an unwrap failure counts against PW1.
    fn reload_user_key(&mut self, slot: KeySlot) -> Result<KeyMaterial> {
        let ks = self.auth.pw1_keystring().cloned()
            .ok_or(Error::SecurityStatus)?;
        match self.store.load_private_key(slot, Role::User, &ks) {
            Ok(KeyLoad::Loaded(key)) => {
                self.auth.reset_pw1_errors();
                self.auth.reset_pso_other();
                Ok(key)
            }
            Ok(KeyLoad::Missing) => {
                self.auth.reset_pw1_errors();
                self.auth.reset_pso_other();
                Err(Error::InvalidOperation(
                    format!("no {} key", slot)).into())
            }
            Err(_) => {
                self.auth.increment_pw1_errors();
                Err(Error::SecurityStatus.into())
            }
        }
    }

    fn user_key(&self, slot: KeySlot, ks: &Keystring) -> Result<KeyMaterial> {
        match self.store.load_private_key(slot, Role::User, ks)? {
            KeyLoad::Loaded(key) => Ok(key),
            KeyLoad::Missing =>
                Err(Error::InvalidOperation(format!("no {} key", slot))
                    .into()),
        }
    }

    /// GENERATE ASYMMETRIC KEY PAIR.
    ///
    /// This command does not follow the generic body decoding: the
    /// CRT byte naming the key slot sits at raw offset 7, where the
    /// extended framing the transport uses puts the first data byte.
    fn cmd_generate_keypair(&mut self, apdu: &Command, buf: &[u8])
                            -> Result<Response> {
        t!(TRACE, "cmd_generate_keypair", "P1 = {:02x}", apdu.p1);

        match apdu.p1 {
            // Read the public key; the CRT names the slot.
            0x81 => {
                let slot = match buf.get(7) {
                    Some(0xb6) => KeySlot::Signing,
                    Some(0xb8) => KeySlot::Decryption,
                    Some(0xa4) => KeySlot::Authentication,
                    _ => return Err(Error::WrongData(
                        "missing or unknown CRT".into()).into()),
                };
                self.store.public_key(slot)
                    .map(Response::with_data)
                    .ok_or_else(|| Error::ReferencedDataNotFound.into())
            }
            0x80 => {
                if !self.auth.admin_authorized() {
                    return Err(Error::SecurityStatus.into());
                }
                // On-card generation is not implemented; keys are
                // imported through PUT DATA.
                Err(Error::InvalidOperation(
                    "key generation is not supported".into()).into())
            }
            _ => Err(Error::WrongParameters.into()),
        }
    }

    fn cmd_get_data(&mut self, apdu: &Command) -> Result<Response> {

        if self.file != CurrentFile::DfOpenpgp {
            return Err(Error::ReferencedDataNotFound.into());
        }
        let tag = Tag(apdu.tag());
        t!(TRACE, "cmd_get_data", "tag {}", tag);
        self.store.get_data(tag)
            .map(Response::with_data)
            .ok_or_else(|| Error::ReferencedDataNotFound.into())
    }

    fn cmd_put_data(&mut self, apdu: &Command) -> Result<Response> {

        if self.file != CurrentFile::DfOpenpgp {
            return Err(Error::ReferencedDataNotFound.into());
        }
        let tag = Tag(apdu.tag());
        t!(TRACE, "cmd_put_data", "tag {}, {} bytes", tag, apdu.data.len());
        self.store.put_data(tag, apdu.data)
            .map_err(|e| Error::MemoryFailure(e.to_string()))?;
        Ok(Response::success())
    }

    fn cmd_read_binary(&mut self, apdu: &Command) -> Result<Response> {

        if self.file != CurrentFile::EfSerial {
            return Err(Error::ReferencedDataNotFound.into());
        }
        if apdu.p2 >= 6 {
            return Err(Error::WrongParameters.into());
        }
        let aid = self.opts.aid();
        let mut data = Vec::with_capacity(2 + aid.len());
        data.push(0x5a);
        data.push(aid.len() as u8);
        data.extend_from_slice(aid);
        Ok(Response::with_data(data))
    }
}
