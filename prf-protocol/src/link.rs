//! Half-duplex transaction discipline.
//!
//! Every transaction is a write phase (`[opcode] ++ payload`) followed, for
//! reads, by one or more read phases on the same channel. The channel sits
//! behind a mutex held for the whole transaction, so phases of concurrent
//! callers never interleave.
//!
//! Channels may be full duplex (SPI shifts both directions at once). The
//! direction that carries nothing is always zero-filled.

use std::io;

use log::{debug, trace};
use parking_lot::{Mutex, MutexGuard};

use crate::catalog::{Access, Command, TransportKind};
use crate::codec;
use crate::error::ProtocolError;
use crate::mask;
use crate::types::{Mask, ProtocolVersion};

/// A byte-level transport to the device.
pub trait Channel {
    fn kind(&self) -> TransportKind;

    /// Shift `tx` out while filling `rx` (same length). Returns the number
    /// of bytes moved; anything less than `tx.len()` is a short transfer.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<usize>;
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<usize> {
        (**self).transfer(tx, rx)
    }
}

fn map_io(err: io::Error, expected: usize) -> ProtocolError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof | io::ErrorKind::WouldBlock => {
            ProtocolError::ShortTransfer {
                expected,
                actual: 0,
            }
        }
        _ => ProtocolError::Transport(err.to_string()),
    }
}

/// Shared, serialized access to one channel.
pub struct Link<C: Channel> {
    channel: Mutex<Option<C>>,
    version: ProtocolVersion,
}

impl<C: Channel> Link<C> {
    /// Create a link over an already opened channel.
    pub fn new(channel: C, version: ProtocolVersion) -> Self {
        Self {
            channel: Mutex::new(Some(channel)),
            version,
        }
    }

    /// Create a link with no channel; transactions fail with `ChannelNotOpen`
    /// until [`Link::open`] is called.
    pub fn closed(version: ProtocolVersion) -> Self {
        Self {
            channel: Mutex::new(None),
            version,
        }
    }

    /// Install a channel, replacing (and returning) any previous one.
    /// Waits for an in-flight transaction to finish.
    pub fn open(&self, channel: C) -> Option<C> {
        self.channel.lock().replace(channel)
    }

    /// Remove the channel. Reopening is how a caller resynchronizes after a
    /// timed-out transfer.
    pub fn close(&self) -> Option<C> {
        self.channel.lock().take()
    }

    pub fn is_open(&self) -> bool {
        self.channel.lock().is_some()
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Transport kind of the open channel.
    pub fn transport(&self) -> Result<TransportKind, ProtocolError> {
        self.channel
            .lock()
            .as_ref()
            .map(|c| c.kind())
            .ok_or(ProtocolError::ChannelNotOpen)
    }

    /// Start a transaction for `command`, blocking until the channel is free.
    pub fn begin(&self, command: Command) -> Result<Transaction<'_, C>, ProtocolError> {
        let guard = self.channel.lock();
        let transport = guard
            .as_ref()
            .map(|c| c.kind())
            .ok_or(ProtocolError::ChannelNotOpen)?;
        command.check_transport(transport)?;
        Ok(Transaction {
            guard,
            command,
            written: false,
        })
    }

    /// Run one complete transaction and return the read-phase bytes.
    ///
    /// Full-record responses are checked for size and checksum before they
    /// are returned. For `GET_MASK_DATA` the result is the mask byte followed
    /// by the composite it describes, both read under the same lock.
    pub fn execute(&self, command: Command, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let request_size = command.request_size(self.version)?;
        if payload.len() != request_size {
            return Err(ProtocolError::FieldOutOfRange {
                field: "request payload",
                value: payload.len(),
                limit: request_size,
            });
        }
        let response_size = command.response_size(self.version)?;

        let mut txn = self.begin(command)?;
        debug!("{} request {} bytes, response {} bytes", command, payload.len(), response_size);
        txn.write(payload)?;

        let response = match command.access() {
            Access::Write => Vec::new(),
            Access::Read => {
                let response = txn.read(response_size)?;
                if let Some(kind) = command.record() {
                    codec::verify(kind, &response, self.version)?;
                }
                response
            }
            Access::ReadValue => {
                let mut response = txn.read(response_size)?;
                if command == Command::GetMaskData {
                    let mask = Mask::from_bits(response[0]);
                    let len = mask::composite_len(mask, self.version)?;
                    if len > 0 {
                        response.extend(txn.read(len)?);
                    }
                }
                response
            }
        };
        Ok(response)
    }
}

/// Exclusive use of the channel for one command.
///
/// Phases must be driven in order: one `write`, then any number of `read`s.
pub struct Transaction<'a, C: Channel> {
    guard: MutexGuard<'a, Option<C>>,
    command: Command,
    written: bool,
}

impl<'a, C: Channel> Transaction<'a, C> {
    pub fn command(&self) -> Command {
        self.command
    }

    fn channel(&mut self) -> Result<&mut C, ProtocolError> {
        self.guard.as_mut().ok_or(ProtocolError::ChannelNotOpen)
    }

    /// Write phase: opcode followed by `payload`. The receive side is zeroed
    /// and discarded.
    pub fn write(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        if self.written {
            return Err(ProtocolError::PhaseOrder("write phase already completed"));
        }
        let mut tx = Vec::with_capacity(1 + payload.len());
        tx.push(self.command.opcode());
        tx.extend_from_slice(payload);
        let mut rx = vec![0u8; tx.len()];

        trace!("write phase {:02X?}", &tx[..tx.len().min(16)]);
        let expected = tx.len();
        let moved = self
            .channel()?
            .transfer(&tx, &mut rx)
            .map_err(|e| map_io(e, expected))?;
        if moved < expected {
            return Err(ProtocolError::ShortTransfer {
                expected,
                actual: moved,
            });
        }
        self.written = true;
        Ok(())
    }

    /// Read phase: `len` bytes from the device while sending zeros.
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        if !self.written {
            return Err(ProtocolError::PhaseOrder("read phase before write phase"));
        }
        let tx = vec![0u8; len];
        let mut rx = vec![0u8; len];
        let moved = self
            .channel()?
            .transfer(&tx, &mut rx)
            .map_err(|e| map_io(e, len))?;
        trace!("read phase {} of {} bytes", moved, len);
        if moved < len {
            return Err(ProtocolError::ShortTransfer {
                expected: len,
                actual: moved,
            });
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::types::{PwsStatus, Tick};

    /// Records every phase and replies from a script.
    struct Scripted {
        kind: TransportKind,
        replies: Vec<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        error: Option<io::ErrorKind>,
    }

    impl Scripted {
        fn new(kind: TransportKind, replies: Vec<Vec<u8>>) -> Self {
            Self {
                kind,
                replies,
                sent: Vec::new(),
                error: None,
            }
        }
    }

    impl Channel for Scripted {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<usize> {
            assert_eq!(tx.len(), rx.len());
            assert!(rx.iter().all(|&b| b == 0), "receive buffer not zeroed");
            if let Some(kind) = self.error.take() {
                return Err(io::Error::new(kind, "scripted"));
            }
            self.sent.push(tx.to_vec());
            // Opcodes are never zero, so an all-zero tx is a read phase.
            if tx.iter().all(|&b| b == 0) {
                let reply = if self.replies.is_empty() {
                    Vec::new()
                } else {
                    self.replies.remove(0)
                };
                let n = reply.len().min(rx.len());
                rx[..n].copy_from_slice(&reply[..n]);
                return Ok(n);
            }
            Ok(tx.len())
        }
    }

    #[test]
    fn test_channel_not_open() {
        let link: Link<Scripted> = Link::closed(ProtocolVersion::V2);
        assert!(!link.is_open());
        assert_eq!(
            link.execute(Command::GetPwsStatus, &[]).unwrap_err(),
            ProtocolError::ChannelNotOpen
        );
        assert_eq!(link.transport(), Err(ProtocolError::ChannelNotOpen));
    }

    #[test]
    fn test_read_transaction_phases() {
        let record = encode(&PwsStatus { triggered: true }, ProtocolVersion::V2).unwrap();
        let link = Link::new(
            Scripted::new(TransportKind::Spi, vec![record.to_vec()]),
            ProtocolVersion::V2,
        );
        let response = link.execute(Command::GetPwsStatus, &[]).unwrap();
        assert_eq!(response, record.to_vec());

        let channel = link.close().unwrap();
        assert_eq!(channel.sent.len(), 2);
        assert_eq!(channel.sent[0], vec![0x88]);
        assert_eq!(channel.sent[1], vec![0u8; 5]);
    }

    #[test]
    fn test_write_transaction_single_phase() {
        let link = Link::new(Scripted::new(TransportKind::Spi, vec![]), ProtocolVersion::V2);
        let payload = encode(&crate::types::DabConfig { channel_idx: 4 }, ProtocolVersion::V2).unwrap();
        let response = link
            .execute(Command::SetDabConfigVolatile, &payload)
            .unwrap();
        assert!(response.is_empty());

        let channel = link.close().unwrap();
        assert_eq!(channel.sent.len(), 1);
        assert_eq!(channel.sent[0][0], 0x02);
        assert_eq!(&channel.sent[0][1..], &payload[..]);
    }

    #[test]
    fn test_short_transfer() {
        let link = Link::new(
            Scripted::new(TransportKind::Spi, vec![vec![1, 2]]),
            ProtocolVersion::V2,
        );
        assert_eq!(
            link.execute(Command::GetPwsStatus, &[]).unwrap_err(),
            ProtocolError::ShortTransfer {
                expected: 5,
                actual: 2,
            }
        );
        // The channel stays usable.
        assert!(link.is_open());
    }

    #[test]
    fn test_timeout_maps_to_short_transfer() {
        let mut channel = Scripted::new(TransportKind::Spi, vec![]);
        channel.error = Some(io::ErrorKind::TimedOut);
        let link = Link::new(channel, ProtocolVersion::V2);
        assert!(matches!(
            link.execute(Command::GetPwsStatus, &[]),
            Err(ProtocolError::ShortTransfer { .. })
        ));

        let mut channel = Scripted::new(TransportKind::Spi, vec![]);
        channel.error = Some(io::ErrorKind::PermissionDenied);
        let link = Link::new(channel, ProtocolVersion::V2);
        assert!(matches!(
            link.execute(Command::GetPwsStatus, &[]),
            Err(ProtocolError::Transport(_))
        ));
    }

    #[test]
    fn test_checksum_error_propagates() {
        let mut record = encode(&PwsStatus { triggered: true }, ProtocolVersion::V2)
            .unwrap()
            .to_vec();
        record[0] = 0;
        let link = Link::new(
            Scripted::new(TransportKind::Spi, vec![record]),
            ProtocolVersion::V2,
        );
        assert!(matches!(
            link.execute(Command::GetPwsStatus, &[]),
            Err(ProtocolError::ChecksumError { .. })
        ));
    }

    #[test]
    fn test_unsupported_on_transport() {
        let link = Link::new(Scripted::new(TransportKind::Spi, vec![]), ProtocolVersion::V2);
        assert_eq!(
            link.execute(Command::SetMask, &[0x41]).unwrap_err(),
            ProtocolError::UnsupportedOnTransport {
                opcode: 0x11,
                transport: TransportKind::Spi,
            }
        );
        assert!(link.close().unwrap().sent.is_empty());
    }

    #[test]
    fn test_mask_data_reads_composite() {
        let tick = encode(&Tick { update_counter: 3 }, ProtocolVersion::V2).unwrap();
        let link = Link::new(
            Scripted::new(TransportKind::UsbStream, vec![vec![0x40], tick.to_vec()]),
            ProtocolVersion::V2,
        );
        let response = link.execute(Command::GetMaskData, &[]).unwrap();
        assert_eq!(response[0], 0x40);
        assert_eq!(&response[1..], &tick[..]);
    }

    #[test]
    fn test_phase_order() {
        let link = Link::new(Scripted::new(TransportKind::Spi, vec![]), ProtocolVersion::V2);
        let mut txn = link.begin(Command::GetVersion).unwrap();
        assert!(matches!(txn.read(8), Err(ProtocolError::PhaseOrder(_))));
        txn.write(&[]).unwrap();
        assert!(matches!(txn.write(&[]), Err(ProtocolError::PhaseOrder(_))));
    }

    #[test]
    fn test_payload_size_checked() {
        let link = Link::new(Scripted::new(TransportKind::Spi, vec![]), ProtocolVersion::V2);
        assert!(matches!(
            link.execute(Command::SetDabConfigPersistent, &[1, 2]),
            Err(ProtocolError::FieldOutOfRange { .. })
        ));
    }
}
