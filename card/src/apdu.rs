//! Command and response APDUs.
//!
//! An APDU (Application Protocol Data Unit) is the message unit of
//! the ISO 7816-4 card protocol.  A command APDU starts with the four
//! header bytes CLA, INS, P1, P2, optionally followed by a body that
//! carries command data and an expected response length.  The body
//! comes in two encodings: the short form (one-byte Lc and Le) and
//! the extended form (Lc of `0x00` followed by a two-byte length, and
//! a two-byte Le).  A response APDU is the response data followed by
//! the two status bytes SW1 and SW2.
//!
//! [`Command::parse`] decodes both body forms into a uniform view, so
//! the command handlers never touch raw offsets.

use std::convert::TryFrom;
use std::fmt;

use crate::{Error, Result};

/// A parsed command APDU.
///
/// Borrows the transport's command buffer; the command data slice
/// points into it.
#[derive(Debug, Clone, Copy)]
pub struct Command<'a> {
    /// The class byte.  This layer ignores it.
    pub cla: u8,
    /// The instruction byte.
    pub ins: u8,
    /// The first parameter byte.
    pub p1: u8,
    /// The second parameter byte.
    pub p2: u8,
    /// The command data (empty if the command has none).
    pub data: &'a [u8],
    /// The expected response length, if the command carried an Le
    /// field.
    pub le: Option<usize>,
}

impl<'a> Command<'a> {
    /// Parses a complete command APDU.
    ///
    /// Decodes both the short and the extended body form.  A
    /// five-byte APDU is always a case-2 command (the fifth byte is
    /// Le); in longer APDUs the fifth byte is Lc, with `0x00`
    /// selecting the extended form where the real Lc follows in two
    /// bytes and the data begins at offset 7.
    pub fn parse(buf: &'a [u8]) -> Result<Command<'a>> {
        if buf.len() < 4 {
            return Err(Error::WrongData(
                format!("truncated header: {} bytes", buf.len())).into());
        }

        let (cla, ins, p1, p2) = (buf[0], buf[1], buf[2], buf[3]);
        let body = &buf[4..];

        let (data, le): (&[u8], Option<usize>) = match body.len() {
            0 => (&[], None),

            // Case 2, short: the single body byte is Le.
            1 => (&[], Some(decode_le_short(body[0]))),

            _ if body[0] != 0 => {
                // Short Lc.
                let lc = body[0] as usize;
                let rest = &body[1..];
                if rest.len() < lc {
                    return Err(Error::WrongData(
                        format!("Lc {} exceeds body", lc)).into());
                }
                let data = &rest[..lc];
                let le = match rest.len() - lc {
                    0 => None,
                    1 => Some(decode_le_short(rest[lc])),
                    n => return Err(Error::WrongData(
                        format!("{} trailing bytes after Le", n - 1)).into()),
                };
                (data, le)
            }

            _ => {
                // Extended form.
                if body.len() < 3 {
                    return Err(Error::WrongData(
                        "truncated extended length".into()).into());
                }
                let lc = (body[1] as usize) << 8 | body[2] as usize;
                let rest = &body[3..];
                if rest.is_empty() && lc > 0 {
                    // Case 2, extended: the two bytes were Le.
                    (&[][..], Some(lc))
                } else if rest.len() < lc {
                    return Err(Error::WrongData(
                        format!("extended Lc {} exceeds body", lc)).into());
                } else {
                    let data = &rest[..lc];
                    let le = match rest.len() - lc {
                        0 => None,
                        2 => {
                            let le = (rest[lc] as usize) << 8
                                | rest[lc + 1] as usize;
                            Some(if le == 0 { 65536 } else { le })
                        }
                        n => return Err(Error::WrongData(
                            format!("{} stray bytes after data", n)).into()),
                    };
                    (data, le)
                }
            }
        };

        Ok(Command { cla, ins, p1, p2, data, le })
    }

    /// Returns P1 and P2 combined into a 16-bit data-object tag.
    pub fn tag(&self) -> u16 {
        (self.p1 as u16) << 8 | self.p2 as u16
    }
}

fn decode_le_short(b: u8) -> usize {
    if b == 0 { 256 } else { b as usize }
}

/// The instructions this card implements.
///
/// Anything else is answered with `6D 00`, instruction not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// VERIFY, PIN presentation.
    Verify,
    /// CHANGE REFERENCE DATA, password change.
    ChangeReferenceData,
    /// PERFORM SECURITY OPERATION, signing and decryption.
    PerformSecurityOperation,
    /// RESET RETRY COUNTER, PW1 reset by reset code or admin.
    ResetRetryCounter,
    /// GENERATE ASYMMETRIC KEY PAIR, also reads public keys.
    GenerateAsymmetricKeyPair,
    /// INTERNAL AUTHENTICATE, client authentication.
    InternalAuthenticate,
    /// SELECT FILE.
    SelectFile,
    /// READ BINARY.
    ReadBinary,
    /// GET DATA, data-object retrieval.
    GetData,
    /// PUT DATA, data-object storage.
    PutData,
    /// PUT DATA with odd INS, used for key import.
    PutDataOdd,
}

impl TryFrom<u8> for Instruction {
    type Error = crate::Error;

    fn try_from(ins: u8) -> std::result::Result<Self, crate::Error> {
        use Instruction::*;
        Ok(match ins {
            0x20 => Verify,
            0x24 => ChangeReferenceData,
            0x2a => PerformSecurityOperation,
            0x2c => ResetRetryCounter,
            0x47 => GenerateAsymmetricKeyPair,
            0x88 => InternalAuthenticate,
            0xa4 => SelectFile,
            0xb0 => ReadBinary,
            0xca => GetData,
            0xda => PutData,
            0xdb => PutDataOdd,
            _ => return Err(Error::InstructionNotSupported(ins)),
        })
    }
}

/// A status word, the SW1/SW2 pair concluding every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `90 00`, normal completion.
    Success,
    /// `65 81`, persistent memory failure.
    MemoryFailure,
    /// `69 82`, security status not satisfied.
    SecurityStatusNotSatisfied,
    /// `69 83`, authentication method blocked.
    AuthenticationBlocked,
    /// `6A 80`, incorrect command data.
    WrongData,
    /// `6A 82`, file not found.
    FileNotFound,
    /// `6A 88`, referenced data not found.
    ReferencedDataNotFound,
    /// `6B 00`, wrong parameters P1-P2.
    WrongParameters,
    /// `6D 00`, instruction not supported.
    InstructionNotSupported,
    /// `6F 00`, no precise diagnosis.
    GeneralError,
}

impl Status {
    /// Returns the SW1/SW2 encoding.
    pub fn bytes(&self) -> [u8; 2] {
        use Status::*;
        match self {
            Success => [0x90, 0x00],
            MemoryFailure => [0x65, 0x81],
            SecurityStatusNotSatisfied => [0x69, 0x82],
            AuthenticationBlocked => [0x69, 0x83],
            WrongData => [0x6a, 0x80],
            FileNotFound => [0x6a, 0x82],
            ReferencedDataNotFound => [0x6a, 0x88],
            WrongParameters => [0x6b, 0x00],
            InstructionNotSupported => [0x6d, 0x00],
            GeneralError => [0x6f, 0x00],
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sw = self.bytes();
        write!(f, "{:02X} {:02X}", sw[0], sw[1])
    }
}

/// A response APDU under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    data: Vec<u8>,
    status: Status,
}

impl Response {
    /// Returns an empty response with status `90 00`.
    pub fn success() -> Self {
        Response { data: Vec::new(), status: Status::Success }
    }

    /// Returns a response carrying `data` and status `90 00`.
    pub fn with_data(data: Vec<u8>) -> Self {
        Response { data, status: Status::Success }
    }

    /// Returns an empty response with the given status.
    pub fn status(status: Status) -> Self {
        Response { data: Vec::new(), status }
    }

    /// Returns the response data, without the status bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes the response: the data followed by SW1/SW2.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 2);
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&self.status.bytes());
        buf
    }
}

impl From<Status> for Response {
    fn from(status: Status) -> Self {
        Response::status(status)
    }
}
