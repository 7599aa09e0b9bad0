//! Device firmware update session.
//!
//! ```text
//! STOPPED -enter-> ENTER -start(n)-> STARTED -download-> DOWNLOAD
//!                                            -upload---> UPLOAD
//! DOWNLOAD/UPLOAD -(all n blocks done)-> STOPPED
//! any -exit-> STOPPED
//! STARTED/STOPPED -revert factory-> STOPPED
//! ```
//!
//! Mode changes are a SET_DFU_MODE write followed by a GET_DFU_ACK read; the
//! session moves only when the device acknowledges OK. A non-OK block or mode
//! acknowledgement is returned as data and leaves the state unchanged.
//!
//! A transaction failure outside STOPPED halts the session: every further
//! call fails with `DfuHalted` until [`DfuSession::abandon`] is called.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::catalog::Command;
use crate::codec::{decode, encode};
use crate::error::ProtocolError;
use crate::link::{Channel, Link};
use crate::types::{
    DfuAck, DfuBlock, DfuMode, DfuState, ProtocolVersion, RecordKind, DFU_BLOCK_SIZE,
};

pub struct DfuSession<C: Channel> {
    link: Arc<Link<C>>,
    state: DfuState,
    total_blocks: u32,
    completed_blocks: u32,
    halted: bool,
}

impl<C: Channel> DfuSession<C> {
    /// Create a session in STOPPED. DFU exists only from protocol V2 on.
    pub fn new(link: Arc<Link<C>>) -> Result<Self, ProtocolError> {
        let version = link.version();
        if version < ProtocolVersion::V2 {
            return Err(ProtocolError::UnsupportedInVersion {
                kind: RecordKind::DfuMode,
                version,
            });
        }
        Ok(Self {
            link,
            state: DfuState::Stopped,
            total_blocks: 0,
            completed_blocks: 0,
            halted: false,
        })
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Blocks acknowledged OK (download) or received (upload).
    pub fn completed_blocks(&self) -> u32 {
        self.completed_blocks
    }

    pub fn pending_blocks(&self) -> u32 {
        self.total_blocks.saturating_sub(self.completed_blocks)
    }

    /// Number of blocks needed for an image of `len` bytes.
    pub fn blocks_for(len: usize) -> u32 {
        len.div_ceil(DFU_BLOCK_SIZE) as u32
    }

    pub fn enter(&mut self) -> Result<DfuAck, ProtocolError> {
        self.require(&[DfuState::Stopped], DfuState::Enter)?;
        self.change_mode(DfuState::Enter, 0)
    }

    /// Declare the number of blocks the transfer will carry.
    pub fn start(&mut self, total_blocks: u32) -> Result<DfuAck, ProtocolError> {
        self.require(&[DfuState::Enter], DfuState::Started)?;
        let ack = self.change_mode(DfuState::Started, total_blocks)?;
        if ack.status.is_ok() {
            self.total_blocks = total_blocks;
            self.completed_blocks = 0;
        }
        Ok(ack)
    }

    pub fn begin_download(&mut self) -> Result<DfuAck, ProtocolError> {
        self.require(&[DfuState::Started], DfuState::Download)?;
        self.change_mode(DfuState::Download, self.total_blocks)
    }

    pub fn begin_upload(&mut self) -> Result<DfuAck, ProtocolError> {
        self.require(&[DfuState::Started], DfuState::Upload)?;
        self.change_mode(DfuState::Upload, self.total_blocks)
    }

    /// Write the next block. A non-OK acknowledgement does not advance; call
    /// again with the same data to retry.
    pub fn write_block(&mut self, data: &[u8]) -> Result<DfuAck, ProtocolError> {
        self.require(&[DfuState::Download], DfuState::Download)?;
        let version = self.link.version();
        let block = DfuBlock {
            sequence: self.completed_blocks,
            data: data.to_vec(),
        };
        let payload = encode(&block, version)?;

        let ack = self.guarded(|link| {
            link.execute(Command::SetDfuBlock, &payload)?;
            let response = link.execute(Command::GetDfuAck, &[])?;
            decode::<DfuAck>(&response, version)
        })?;

        if ack.status.is_ok() && ack.block == block.sequence {
            self.completed_blocks += 1;
            debug!("DFU block {}/{} acknowledged", self.completed_blocks, self.total_blocks);
            self.finish_if_complete();
        } else {
            warn!(
                "DFU block {} not accepted: {} (ack for block {})",
                block.sequence, ack.status, ack.block
            );
        }
        Ok(ack)
    }

    /// Read the next block of the device image.
    pub fn read_block(&mut self) -> Result<DfuBlock, ProtocolError> {
        self.require(&[DfuState::Upload], DfuState::Upload)?;
        let version = self.link.version();
        let block = self.guarded(|link| {
            let response = link.execute(Command::GetDfuBlock, &[])?;
            decode::<DfuBlock>(&response, version)
        })?;
        self.completed_blocks += 1;
        self.finish_if_complete();
        Ok(block)
    }

    /// Leave DFU from any state.
    pub fn exit(&mut self) -> Result<DfuAck, ProtocolError> {
        if self.halted {
            return Err(ProtocolError::DfuHalted);
        }
        self.change_mode(DfuState::Exit, 0)
    }

    /// Restore the factory image. Terminal for the session.
    pub fn revert_factory(&mut self) -> Result<DfuAck, ProtocolError> {
        self.require(
            &[DfuState::Started, DfuState::Stopped],
            DfuState::RevertFactory,
        )?;
        self.change_mode(DfuState::RevertFactory, 0)
    }

    /// Give up on a halted (or any) session. Tries to tell the device to
    /// exit, then resets to STOPPED regardless of the outcome.
    pub fn abandon(&mut self) {
        let exit = DfuMode {
            state: DfuState::Exit,
            total_blocks: 0,
        };
        let version = self.link.version();
        let result = encode(&exit, version).and_then(|payload| {
            self.link.execute(Command::SetDfuMode, &payload).map(|_| ())
        });
        if let Err(e) = result {
            warn!("DFU abandon: device exit failed: {}", e);
        }
        info!("DFU session abandoned in {:?}", self.state);
        self.state = DfuState::Stopped;
        self.total_blocks = 0;
        self.completed_blocks = 0;
        self.halted = false;
    }

    fn require(&self, allowed: &[DfuState], to: DfuState) -> Result<(), ProtocolError> {
        if self.halted {
            return Err(ProtocolError::DfuHalted);
        }
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidDfuTransition {
                from: self.state,
                to,
            })
        }
    }

    /// Run `f`, halting the session if it fails while not STOPPED.
    fn guarded<T>(
        &mut self,
        f: impl FnOnce(&Link<C>) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        match f(&self.link) {
            Ok(value) => Ok(value),
            Err(e) if self.state != DfuState::Stopped => {
                warn!("DFU halted in {:?}: {}", self.state, e);
                self.halted = true;
                Err(ProtocolError::DfuModeState(Box::new(e)))
            }
            Err(e) => Err(e),
        }
    }

    fn change_mode(&mut self, target: DfuState, total_blocks: u32) -> Result<DfuAck, ProtocolError> {
        let version = self.link.version();
        let payload = encode(
            &DfuMode {
                state: target,
                total_blocks,
            },
            version,
        )?;
        let ack = self.guarded(|link| {
            link.execute(Command::SetDfuMode, &payload)?;
            let response = link.execute(Command::GetDfuAck, &[])?;
            decode::<DfuAck>(&response, version)
        })?;

        if ack.status.is_ok() {
            let from = self.state;
            self.state = match target {
                DfuState::Exit | DfuState::RevertFactory => DfuState::Stopped,
                other => other,
            };
            debug!("DFU {:?} -> {:?}", from, self.state);
        } else {
            warn!("DFU mode {:?} refused: {}", target, ack.status);
        }
        Ok(ack)
    }

    fn finish_if_complete(&mut self) {
        if self.completed_blocks >= self.total_blocks {
            info!("DFU transfer of {} blocks complete", self.total_blocks);
            self.state = DfuState::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TransportKind;
    use crate::error::DfuStatus;
    use crate::sim::{Fault, SimHandle, SimulatedDevice};

    fn session() -> (DfuSession<SimulatedDevice>, SimHandle) {
        let device = SimulatedDevice::new(TransportKind::Spi, ProtocolVersion::V2);
        let handle = device.handle();
        let link = Arc::new(Link::new(device, ProtocolVersion::V2));
        (DfuSession::new(link).unwrap(), handle)
    }

    fn started(total: u32) -> (DfuSession<SimulatedDevice>, SimHandle) {
        let (mut dfu, handle) = session();
        assert!(dfu.enter().unwrap().status.is_ok());
        assert!(dfu.start(total).unwrap().status.is_ok());
        (dfu, handle)
    }

    #[test]
    fn test_download_with_retry() {
        let (mut dfu, handle) = started(3);
        dfu.begin_download().unwrap();
        assert_eq!(dfu.state(), DfuState::Download);

        let blocks = [vec![1u8; DFU_BLOCK_SIZE], vec![2u8; DFU_BLOCK_SIZE], vec![3u8; 10]];
        assert!(dfu.write_block(&blocks[0]).unwrap().status.is_ok());

        handle.fail_next_block_with(DfuStatus::CrcErr);
        let ack = dfu.write_block(&blocks[1]).unwrap();
        assert_eq!(ack.status, DfuStatus::CrcErr);
        assert_eq!(dfu.state(), DfuState::Download);
        assert_eq!(dfu.pending_blocks(), 2);

        assert!(dfu.write_block(&blocks[1]).unwrap().status.is_ok());
        assert!(dfu.write_block(&blocks[2]).unwrap().status.is_ok());
        assert_eq!(dfu.state(), DfuState::Stopped);
        assert_eq!(dfu.pending_blocks(), 0);
        assert_eq!(handle.dfu_state(), DfuState::Stopped);
        assert_eq!(handle.dfu_image(), blocks.concat());
    }

    #[test]
    fn test_transport_error_halts_session() {
        let (mut dfu, handle) = started(2);
        dfu.begin_download().unwrap();

        handle.inject_fault(Fault::Corrupt);
        let err = dfu.write_block(&[0xAA; 16]).unwrap_err();
        match err {
            ProtocolError::DfuModeState(inner) => {
                assert!(matches!(*inner, ProtocolError::ChecksumError { .. }))
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(dfu.is_halted());
        assert_eq!(dfu.state(), DfuState::Download);
        assert_eq!(dfu.write_block(&[0xAA; 16]), Err(ProtocolError::DfuHalted));
        assert_eq!(dfu.exit(), Err(ProtocolError::DfuHalted));

        dfu.abandon();
        assert!(!dfu.is_halted());
        assert_eq!(dfu.state(), DfuState::Stopped);
        assert_eq!(handle.dfu_state(), DfuState::Stopped);
    }

    #[test]
    fn test_error_while_stopped_does_not_halt() {
        let (mut dfu, handle) = session();
        handle.inject_fault(Fault::Short);
        assert!(matches!(
            dfu.enter(),
            Err(ProtocolError::ShortTransfer { .. })
        ));
        assert!(!dfu.is_halted());
        assert_eq!(dfu.state(), DfuState::Stopped);

        // The device did enter; the host cannot know, so it resynchronizes.
        assert!(dfu.exit().unwrap().status.is_ok());
        assert!(dfu.enter().unwrap().status.is_ok());
        assert_eq!(dfu.state(), DfuState::Enter);
    }

    #[test]
    fn test_invalid_transitions() {
        let (mut dfu, _) = session();
        assert_eq!(
            dfu.begin_download(),
            Err(ProtocolError::InvalidDfuTransition {
                from: DfuState::Stopped,
                to: DfuState::Download,
            })
        );
        assert!(matches!(
            dfu.write_block(&[1]),
            Err(ProtocolError::InvalidDfuTransition { .. })
        ));

        let (mut dfu, _) = started(1);
        dfu.begin_upload().unwrap();
        assert!(matches!(
            dfu.revert_factory(),
            Err(ProtocolError::InvalidDfuTransition { .. })
        ));
    }

    #[test]
    fn test_exit_and_revert() {
        let (mut dfu, handle) = started(4);
        assert!(dfu.exit().unwrap().status.is_ok());
        assert_eq!(dfu.state(), DfuState::Stopped);

        assert!(dfu.revert_factory().unwrap().status.is_ok());
        assert_eq!(dfu.state(), DfuState::Stopped);
        assert_eq!(handle.dfu_state(), DfuState::Stopped);
    }

    #[test]
    fn test_upload() {
        let (mut dfu, handle) = session();
        let image: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        handle.set_upload_image(image.clone());

        dfu.enter().unwrap();
        dfu.start(DfuSession::<SimulatedDevice>::blocks_for(image.len()))
            .unwrap();
        dfu.begin_upload().unwrap();
        let mut read = Vec::new();
        while dfu.state() == DfuState::Upload {
            let block = dfu.read_block().unwrap();
            read.extend(block.data);
        }
        assert_eq!(read, image);
        assert_eq!(dfu.completed_blocks(), 2);
    }

    #[test]
    fn test_requires_v2() {
        let device = SimulatedDevice::new(TransportKind::Spi, ProtocolVersion::V1);
        let link = Arc::new(Link::new(device, ProtocolVersion::V1));
        assert!(matches!(
            DfuSession::new(link),
            Err(ProtocolError::UnsupportedInVersion { .. })
        ));
    }
}
