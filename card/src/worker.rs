//! Threaded card sessions.
//!
//! On a token, the card core is its own cooperatively scheduled
//! task: the transport assembles a complete command APDU in a shared
//! buffer, wakes the card task, and blocks until the card signals
//! that execution finished.  This module is the host-side rendition
//! of that loop.  The card runs on a dedicated thread; the transport
//! side holds a [`Session`] and exchanges complete APDUs with it over
//! channels.  Delivering the response doubles as the
//! execution-finished signal, so commands are strictly serialized.

use std::sync::mpsc;
use std::thread;

use crate::{Card, Result};
use crate::crypto::Asymmetric;
use crate::store::DataObjectStore;

const TRACE: bool = false;

/// A handle to a card running on its own thread.
pub struct Session<S, A> {
    commands: mpsc::Sender<Vec<u8>>,
    responses: mpsc::Receiver<Vec<u8>>,
    thread: thread::JoinHandle<Card<S, A>>,
}

impl<S, A> Session<S, A>
where S: DataObjectStore + Send + 'static,
      A: Asymmetric + Send + 'static,
{
    /// Spawns the card on its own thread.
    pub fn spawn(mut card: Card<S, A>) -> Session<S, A> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Vec<u8>>();
        let (res_tx, res_rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            while let Ok(cmd) = cmd_rx.recv() {
                t!(TRACE, "card thread", "{} byte command", cmd.len());
                let res = card.handle(&cmd);
                if res_tx.send(res).is_err() {
                    break;
                }
            }
            t!(TRACE, "card thread", "transport gone, shutting down");
            card
        });

        Session { commands: cmd_tx, responses: res_rx, thread }
    }

    /// Executes one command APDU, blocking until the response is
    /// ready.
    pub fn transact(&self, cmd: &[u8]) -> Result<Vec<u8>> {
        self.commands.send(cmd.to_vec())
            .map_err(|_| anyhow::anyhow!("card session terminated"))?;
        self.responses.recv()
            .map_err(|_| anyhow::anyhow!("card session terminated"))
    }

    /// Shuts the session down, returning the card.
    pub fn close(self) -> Card<S, A> {
        drop(self.commands);
        match self.thread.join() {
            Ok(card) => card,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CurrentFile, Options};
    use crate::crypto::backend::test::Mock;
    use crate::store::MemoryStore;

    #[test]
    fn session_roundtrip() {
        let card = Card::new(MemoryStore::new(), Mock, Options::default());
        let session = Session::spawn(card);

        let res = session.transact(
            &[0x00, 0xa4, 0x04, 0x00, 0x06,
              0xd2, 0x76, 0x00, 0x01, 0x24, 0x01]).unwrap();
        assert_eq!(res, [0x90, 0x00]);
        let res = session.transact(&[0x00, 0x11, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(res, [0x6d, 0x00]);

        // The session state survives until the session is closed.
        let card = session.close();
        assert_eq!(card.current_file(), CurrentFile::DfOpenpgp);
    }
}
