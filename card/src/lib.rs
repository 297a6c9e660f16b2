//! OpenPGP card command processing.
//!
//! This crate implements the command-processing core of an [OpenPGP
//! card] application: the ISO 7816-4 APDU dispatcher and the
//! per-command handlers for SELECT FILE, VERIFY, CHANGE REFERENCE
//! DATA, RESET RETRY COUNTER, PSO, INTERNAL AUTHENTICATE, GENERATE
//! ASYMMETRIC KEY PAIR, GET DATA, PUT DATA, and READ BINARY, together
//! with the PIN and keystring authentication model that gates the
//! private-key operations.
//!
//! [OpenPGP card]: https://gnupg.org/ftp/specs/OpenPGP-smart-card-application-2.0.pdf
//!
//! The crate deliberately stops at two seams.  The USB/CCID transport
//! that frames APDUs is expected to drive a [`Card`] (directly, or
//! through the [`worker`] module's threaded session), and the
//! persistent tag-indexed data-object store as well as the RSA
//! primitives are abstracted as the [`store::DataObjectStore`] and
//! [`crypto::Asymmetric`] traits.  Everything between those seams --
//! command decoding, file selection, retry counters, keystring
//! handling, and the coupling of authentication state to the
//! cryptographic commands -- lives here.
//!
//! # Examples
//!
//! ```
//! use sequoia_card::{Card, Options};
//! use sequoia_card::crypto::Unsupported;
//! use sequoia_card::store::MemoryStore;
//!
//! let mut card = Card::new(MemoryStore::default(), Unsupported,
//!                          Options::default());
//!
//! // SELECT FILE, DF OpenPGP by AID prefix.
//! let res = card.handle(&[0x00, 0xa4, 0x04, 0x00, 0x06,
//!                         0xd2, 0x76, 0x00, 0x01, 0x24, 0x01]);
//! assert_eq!(res, [0x90, 0x00]);
//! ```

#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod apdu;
pub mod crypto;
pub mod store;
mod auth;
pub use auth::Role;
mod card;
pub use card::{Card, CurrentFile, Options, OPENPGP_AID};
pub mod worker;

/// Crate result specialization.
pub type Result<T> = ::std::result::Result<T, anyhow::Error>;

#[derive(thiserror::Error, Debug, Clone)]
/// Errors returned by this crate.
///
/// Every variant corresponds to a status word of the card protocol;
/// the dispatcher turns an `Error` escaping a handler into the
/// matching SW1/SW2 pair (see [`Error::status`]).
///
/// Note: This enum cannot be exhaustively matched to allow future
/// extensions.
#[non_exhaustive]
pub enum Error {
    /// A reference data (PIN) comparison failed, or an operation
    /// requires an authorization that has not been established.
    #[error("Security status not satisfied")]
    SecurityStatus,

    /// The referenced PIN's retry counter is exhausted.
    #[error("Authentication method blocked")]
    AuthenticationBlocked,

    /// The persistent store failed to record a change.
    #[error("Memory failure: {0}")]
    MemoryFailure(String),

    /// The command carried data the handler cannot accept.
    #[error("Wrong data: {0}")]
    WrongData(String),

    /// The P1/P2 parameter bytes are invalid for this command.
    #[error("Incorrect parameters P1-P2")]
    WrongParameters,

    /// SELECT FILE did not match any file.
    #[error("File not found")]
    FileNotFound,

    /// A referenced record or data object does not exist, or the
    /// command requires a file that is not currently selected.
    #[error("Referenced data not found")]
    ReferencedDataNotFound,

    /// The instruction byte is not in the command table.
    #[error("Instruction not supported: {0:02x}")]
    InstructionNotSupported(u8),

    /// Invalid operation: the command is recognized, but the
    /// requested function is not available or failed without a more
    /// precise diagnosis.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Returns the status word corresponding to this error.
    pub fn status(&self) -> apdu::Status {
        use apdu::Status;
        match self {
            Error::SecurityStatus => Status::SecurityStatusNotSatisfied,
            Error::AuthenticationBlocked => Status::AuthenticationBlocked,
            Error::MemoryFailure(_) => Status::MemoryFailure,
            Error::WrongData(_) => Status::WrongData,
            Error::WrongParameters => Status::WrongParameters,
            Error::FileNotFound => Status::FileNotFound,
            Error::ReferencedDataNotFound => Status::ReferencedDataNotFound,
            Error::InstructionNotSupported(_) =>
                Status::InstructionNotSupported,
            Error::InvalidOperation(_) => Status::GeneralError,
        }
    }
}
