//! End-to-end command sequences against a live card.

use sequoia_card::{Card, Options, Result, Role};
use sequoia_card::crypto::{Asymmetric, KeyMaterial, Keystring};
use sequoia_card::store::{DataObjectStore, KeySlot, MemoryStore, SimpleDo,
                          Tag};

/// Deterministic stand-in for the RSA primitives.
struct SoftRsa;

impl Asymmetric for SoftRsa {
    fn rsa_sign(&self, key: &KeyMaterial, digest_info: &[u8])
                -> Result<Vec<u8>> {
        let mut sig = key.as_bytes().to_vec();
        sig.extend_from_slice(digest_info);
        Ok(sig)
    }

    fn rsa_decrypt(&self, _: &KeyMaterial, cipher: &[u8])
                   -> Result<Vec<u8>> {
        Ok(cipher.to_vec())
    }
}

const SELECT_DF: &[u8] =
    &[0x00, 0xa4, 0x04, 0x00, 0x06, 0xd2, 0x76, 0x00, 0x01, 0x24, 0x01];

/// SHA-1 DigestInfo skeleton: 15-byte ASN.1 prefix, 20-byte digest.
const DIGEST_INFO: [u8; 35] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02,
    0x1a, 0x05, 0x00, 0x04, 0x14,
    0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00, 0x11, 0x22, 0x33,
    0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
];

fn fresh_card() -> Card<MemoryStore, SoftRsa> {
    Card::new(MemoryStore::new(), SoftRsa, Options::default())
}

fn short_apdu(ins: u8, p1: u8, p2: u8, data: &[u8]) -> Vec<u8> {
    assert!(data.len() <= 255);
    let mut cmd = vec![0x00, ins, p1, p2];
    if !data.is_empty() {
        cmd.push(data.len() as u8);
        cmd.extend_from_slice(data);
    }
    cmd
}

fn verify(p2: u8, pin: &[u8]) -> Vec<u8> {
    short_apdu(0x20, 0x00, p2, pin)
}

fn keystring_record(pin: &[u8]) -> Vec<u8> {
    let mut rec = vec![pin.len() as u8];
    rec.extend_from_slice(Keystring::derive(pin).as_bytes());
    rec
}

fn install_keys(card: &mut Card<MemoryStore, SoftRsa>, slots: &[KeySlot],
                pw1: &[u8], pw3: Option<&[u8]>) {
    let user = Keystring::derive(pw1);
    let admin = pw3.map(Keystring::derive);
    for slot in slots {
        let material = KeyMaterial::new(format!("{:?}-key", slot).as_bytes());
        let mut wrapped: Vec<(Role, &Keystring)> = vec![(Role::User, &user)];
        if let Some(admin) = admin.as_ref() {
            wrapped.push((Role::Admin, admin));
        }
        card.store_mut().install_private_key(*slot, material, &wrapped);
    }
    // With keys on card, the PW1 record shrinks to the length byte.
    card.store_mut()
        .write_simple(SimpleDo::KeystringPw1, &[pw1.len() as u8])
        .unwrap();
}

// Scenario A: first boot, set PW1 with no keys on card.
#[test]
fn first_boot_pw1_change() {
    let mut card = fresh_card();
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);

    // CHANGE REFERENCE DATA, "123456" || "newpw1".
    assert_eq!(card.handle(&[0x00, 0x24, 0x00, 0x81, 0x0c,
                             0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
                             0x6e, 0x65, 0x77, 0x70, 0x77, 0x31]),
               [0x90, 0x00]);

    assert_eq!(card.handle(&verify(0x81, b"newpw1")), [0x90, 0x00]);
    // The factory default is gone.
    assert_eq!(card.handle(&verify(0x82, b"123456")), [0x69, 0x82]);
}

// Scenario B: three failures block PW1, the fourth attempt is not
// even looked at.
#[test]
fn pw1_blocks_after_three_failures() {
    let mut card = fresh_card();
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);

    for _ in 0..3 {
        assert_eq!(card.handle(&[0x00, 0x20, 0x00, 0x81, 0x03,
                                 0x00, 0x00, 0x00]),
                   [0x69, 0x82]);
    }
    assert_eq!(card.handle(&[0x00, 0x20, 0x00, 0x81, 0x03,
                             0x00, 0x00, 0x00]),
               [0x69, 0x83]);
    // The correct PIN is refused, too.
    assert_eq!(card.handle(&verify(0x81, b"123456")), [0x69, 0x83]);
}

// Scenario C: the signature path increments the counter and, with the
// default single-use lifetime, spends the authorization.
#[test]
fn signature_path() {
    let mut card = fresh_card();
    install_keys(&mut card, &[KeySlot::Signing], b"123456", None);
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);
    assert_eq!(card.handle(&verify(0x81, b"123456")), [0x90, 0x00]);

    let cds = short_apdu(0x2a, 0x9e, 0x9a, &DIGEST_INFO);
    let res = card.handle(&cds);
    assert!(res.len() > 2);
    assert_eq!(&res[res.len() - 2..], [0x90, 0x00]);
    assert_eq!(card.store().signature_counter(), 1);

    // Single use: a second signature needs a fresh VERIFY.
    assert_eq!(card.handle(&cds), [0x69, 0x82]);
    assert_eq!(card.store().signature_counter(), 1);
}

#[test]
fn signature_rejects_malformed_digest_info() {
    let mut card = fresh_card();
    install_keys(&mut card, &[KeySlot::Signing], b"123456", None);
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);
    assert_eq!(card.handle(&verify(0x81, b"123456")), [0x90, 0x00]);

    let res = card.handle(&short_apdu(0x2a, 0x9e, 0x9a,
                                      &DIGEST_INFO[..34]));
    assert_eq!(res, [0x6a, 0x80]);
}

#[test]
fn pw1_lifetime_allows_several_signatures() {
    let mut card = fresh_card();
    install_keys(&mut card, &[KeySlot::Signing], b"123456", None);
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);
    // PW status byte 1: PW1 stays valid.
    assert_eq!(card.handle(&short_apdu(0xda, 0x00, 0xc4, &[0x01])),
               [0x90, 0x00]);
    assert_eq!(card.handle(&verify(0x81, b"123456")), [0x90, 0x00]);

    let cds = short_apdu(0x2a, 0x9e, 0x9a, &DIGEST_INFO);
    for expected in 1..=3 {
        let res = card.handle(&cds);
        assert_eq!(&res[res.len() - 2..], [0x90, 0x00]);
        assert_eq!(card.store().signature_counter(), expected);
    }
}

// Scenario D: GET DATA is gated on the application DF.
#[test]
fn get_data_requires_selection() {
    let mut card = fresh_card();
    card.store_mut().put_data(Tag(0x005e), b"alice").unwrap();

    assert_eq!(card.handle(&[0x00, 0xca, 0x00, 0x5e, 0x00]),
               [0x6a, 0x88]);
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);
    assert_eq!(card.handle(&[0x00, 0xca, 0x00, 0x5e, 0x00]),
               b"alice\x90\x00");
}

// Scenario E: an unknown instruction.
#[test]
fn unknown_instruction() {
    let mut card = fresh_card();
    assert_eq!(card.handle(&[0x00, 0x11, 0x00, 0x00, 0x00]),
               [0x6d, 0x00]);
}

// Scenario F: the admin resets a blocked PW1.
#[test]
fn admin_resets_blocked_pw1() {
    let mut card = fresh_card();
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);

    for _ in 0..3 {
        card.handle(&verify(0x81, b"000000"));
    }
    assert_eq!(card.handle(&verify(0x81, b"123456")), [0x69, 0x83]);

    assert_eq!(card.handle(&verify(0x83, b"12345678")), [0x90, 0x00]);
    assert_eq!(card.handle(&short_apdu(0x2c, 0x02, 0x00, b"newpw1")),
               [0x90, 0x00]);
    // The counter is clear again and the new PIN verifies.
    assert_eq!(card.handle(&verify(0x81, b"newpw1")), [0x90, 0x00]);
}

// An admin verification never raises the PW1 capabilities, nor the
// other way around.
#[test]
fn roles_are_separate() {
    let mut card = fresh_card();
    install_keys(&mut card, &[KeySlot::Signing], b"123456",
                 Some(b"12345678"));
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);

    assert_eq!(card.handle(&verify(0x83, b"12345678")), [0x90, 0x00]);
    // PW3 alone does not allow signing.
    assert_eq!(card.handle(&short_apdu(0x2a, 0x9e, 0x9a, &DIGEST_INFO)),
               [0x69, 0x82]);

    let mut card = fresh_card();
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);
    assert_eq!(card.handle(&verify(0x81, b"123456")), [0x90, 0x00]);
    // PW1 alone does not allow an admin reset.
    assert_eq!(card.handle(&short_apdu(0x2c, 0x02, 0x00, b"newpw1")),
               [0x69, 0x82]);
}

// Every key that existed before a password change must unwrap under
// the new keystring afterwards.
#[test]
fn password_changes_keep_keys_unlockable() {
    let mut card = fresh_card();
    install_keys(&mut card,
                 &[KeySlot::Signing, KeySlot::Decryption,
                   KeySlot::Authentication],
                 b"123456", Some(b"12345678"));
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);

    // Change PW1; the keys follow.
    let mut change = b"123456".to_vec();
    change.extend_from_slice(b"newpw1");
    assert_eq!(card.handle(&short_apdu(0x24, 0x00, 0x81, &change)),
               [0x90, 0x00]);
    assert_eq!(card.handle(&verify(0x81, b"newpw1")), [0x90, 0x00]);
    assert_eq!(card.handle(&verify(0x81, b"123456")), [0x69, 0x82]);

    // The wrapped keys still work: sign and decrypt.
    assert_eq!(card.handle(&verify(0x81, b"newpw1")), [0x90, 0x00]);
    let res = card.handle(&short_apdu(0x2a, 0x9e, 0x9a, &DIGEST_INFO));
    assert_eq!(&res[res.len() - 2..], [0x90, 0x00]);

    assert_eq!(card.handle(&verify(0x82, b"newpw1")), [0x90, 0x00]);
    let mut cryptogram = vec![0x00];
    cryptogram.extend_from_slice(b"secret");
    let res = card.handle(&short_apdu(0x2a, 0x80, 0x86, &cryptogram));
    assert_eq!(res, b"secret\x90\x00");

    // The admin moves PW1 once more; the keys still follow.
    assert_eq!(card.handle(&verify(0x83, b"12345678")), [0x90, 0x00]);
    assert_eq!(card.handle(&short_apdu(0x2c, 0x02, 0x00, b"pw1again")),
               [0x90, 0x00]);
    assert_eq!(card.handle(&verify(0x81, b"pw1again")), [0x90, 0x00]);
    let res = card.handle(&short_apdu(0x2a, 0x9e, 0x9a, &DIGEST_INFO));
    assert_eq!(&res[res.len() - 2..], [0x90, 0x00]);
}

#[test]
fn admin_password_change_rewraps_admin_side() {
    let mut card = fresh_card();
    install_keys(&mut card, &[KeySlot::Signing], b"123456",
                 Some(b"12345678"));
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);

    let mut change = b"12345678".to_vec();
    change.extend_from_slice(b"adminpin");
    assert_eq!(card.handle(&short_apdu(0x24, 0x00, 0x83, &change)),
               [0x90, 0x00]);
    assert_eq!(card.handle(&verify(0x83, b"12345678")), [0x69, 0x82]);
    assert_eq!(card.handle(&verify(0x83, b"adminpin")), [0x90, 0x00]);

    // The fresh admin keystring can still move PW1.
    assert_eq!(card.handle(&short_apdu(0x2c, 0x02, 0x00, b"newpw1")),
               [0x90, 0x00]);
    assert_eq!(card.handle(&verify(0x81, b"newpw1")), [0x90, 0x00]);
}

#[test]
fn reset_code_resets_pw1() {
    let mut card = fresh_card();
    card.store_mut()
        .write_simple(SimpleDo::KeystringRc, &keystring_record(b"resetme1"))
        .unwrap();
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);

    for _ in 0..3 {
        card.handle(&verify(0x81, b"000000"));
    }
    assert_eq!(card.handle(&verify(0x81, b"123456")), [0x69, 0x83]);

    let mut data = b"resetme1".to_vec();
    data.extend_from_slice(b"newpw1");
    assert_eq!(card.handle(&short_apdu(0x2c, 0x00, 0x00, &data)),
               [0x90, 0x00]);
    assert_eq!(card.handle(&verify(0x81, b"newpw1")), [0x90, 0x00]);
}

#[test]
fn reset_code_failures_block_the_reset_code() {
    let mut card = fresh_card();
    card.store_mut()
        .write_simple(SimpleDo::KeystringRc, &keystring_record(b"resetme1"))
        .unwrap();
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);

    let mut data = b"wrong!!!".to_vec();
    data.extend_from_slice(b"newpw1");
    let rrc = short_apdu(0x2c, 0x00, 0x00, &data);
    for _ in 0..3 {
        assert_eq!(card.handle(&rrc), [0x69, 0x82]);
    }
    assert_eq!(card.handle(&rrc), [0x69, 0x83]);

    // Blocked even with the right code.
    let mut data = b"resetme1".to_vec();
    data.extend_from_slice(b"newpw1");
    assert_eq!(card.handle(&short_apdu(0x2c, 0x00, 0x00, &data)),
               [0x69, 0x83]);
}

#[test]
fn internal_authenticate_spends_the_authorization() {
    let mut card = fresh_card();
    install_keys(&mut card, &[KeySlot::Authentication], b"123456", None);
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);
    assert_eq!(card.handle(&verify(0x82, b"123456")), [0x90, 0x00]);

    let challenge = short_apdu(0x88, 0x00, 0x00, &[0xde, 0xad, 0xbe, 0xef]);
    let res = card.handle(&challenge);
    assert_eq!(&res[res.len() - 2..], [0x90, 0x00]);
    assert!(res.ends_with(&[0xde, 0xad, 0xbe, 0xef, 0x90, 0x00]));

    // One shot: the capability fell with the first operation.
    assert_eq!(card.handle(&challenge), [0x69, 0x82]);
}

// PUT DATA then GET DATA returns the stored bytes, including through
// the extended-length form.
#[test]
fn data_object_roundtrip() {
    let mut card = fresh_card();
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);

    assert_eq!(card.handle(&short_apdu(0xda, 0x00, 0x5e, b"alice")),
               [0x90, 0x00]);
    assert_eq!(card.handle(&[0x00, 0xca, 0x00, 0x5e, 0x00]),
               b"alice\x90\x00");

    // 300 bytes force the extended form.
    let url = vec![0x61; 300];
    let mut put = vec![0x00, 0xda, 0x5f, 0x50, 0x00, 0x01, 0x2c];
    put.extend_from_slice(&url);
    assert_eq!(card.handle(&put), [0x90, 0x00]);

    let mut expected = url;
    expected.extend_from_slice(&[0x90, 0x00]);
    assert_eq!(card.handle(&[0x00, 0xca, 0x5f, 0x50, 0x00]), expected);
}

#[test]
fn put_data_requires_selection() {
    let mut card = fresh_card();
    assert_eq!(card.handle(&short_apdu(0xda, 0x00, 0x5e, b"alice")),
               [0x6a, 0x88]);
}

// A power cycle drops the authorizations but not the counters.
#[test]
fn reset_preserves_the_retry_counters() {
    let mut card = fresh_card();
    assert_eq!(card.handle(SELECT_DF), [0x90, 0x00]);
    card.handle(&verify(0x81, b"000000"));
    card.handle(&verify(0x81, b"000000"));

    card.reset();
    assert_eq!(card.handle(&verify(0x81, b"000000")), [0x69, 0x82]);
    assert_eq!(card.handle(&verify(0x81, b"123456")), [0x69, 0x83]);
}

quickcheck::quickcheck! {
    // Whatever the host sends, the card answers with a framed
    // response: data plus a status word.
    fn every_command_gets_a_status(cmd: Vec<u8>) -> bool {
        let mut card = fresh_card();
        let res = card.handle(&cmd);
        res.len() >= 2
    }
}
