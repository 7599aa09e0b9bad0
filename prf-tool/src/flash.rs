//! Firmware image transfer over a DFU session.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use prf_protocol::types::DFU_BLOCK_SIZE;
use prf_protocol::{Channel, DfuAck, DfuSession, DfuState, DfuStatus, Link, ProtocolError};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Image is empty")]
    EmptyImage,

    #[error("Device refused DFU mode {state:?}: {status}")]
    Rejected { state: DfuState, status: DfuStatus },

    #[error("Block {block} not accepted after {attempts} attempts: {status}")]
    RetriesExhausted {
        block: u32,
        attempts: u32,
        status: DfuStatus,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct FlashOptions {
    /// Extra attempts per block after a non-OK acknowledgement.
    pub max_block_retries: u32,
    pub show_progress: bool,
}

fn progress_bar(total: u32, show: bool, verb: &str) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(u64::from(total));
    if let Ok(style) =
        ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} blocks ({eta})")
    {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_message(verb.to_string());
    bar
}

fn expect_ok(state: DfuState, ack: DfuAck) -> Result<(), FlashError> {
    if ack.status.is_ok() {
        Ok(())
    } else {
        Err(FlashError::Rejected {
            state,
            status: ack.status,
        })
    }
}

/// Leave DFU after a refused request; the session is still healthy.
fn bail<C: Channel>(session: &mut DfuSession<C>, error: FlashError) -> FlashError {
    if let Err(e) = session.exit() {
        warn!("DFU exit after failure also failed: {}", e);
    }
    error
}

/// Walk STOPPED -> ENTER -> STARTED(total) -> `target`.
fn open_transfer<C: Channel>(
    session: &mut DfuSession<C>,
    total: u32,
    target: DfuState,
) -> Result<(), FlashError> {
    expect_ok(DfuState::Enter, session.enter()?)?;
    if let Err(e) = expect_ok(DfuState::Started, session.start(total)?) {
        return Err(bail(session, e));
    }
    let ack = match target {
        DfuState::Upload => session.begin_upload()?,
        _ => session.begin_download()?,
    };
    expect_ok(target, ack).map_err(|e| bail(session, e))
}

/// Download `image` to the device. Returns the number of blocks written.
///
/// A transport failure halts the session and is returned as is; the device
/// is left in DFU until the operator abandons it.
pub fn flash_image<C: Channel>(
    link: Arc<Link<C>>,
    image: &[u8],
    options: &FlashOptions,
) -> Result<u32, FlashError> {
    if image.is_empty() {
        return Err(FlashError::EmptyImage);
    }
    let total = DfuSession::<C>::blocks_for(image.len());
    let mut session = DfuSession::new(link)?;
    open_transfer(&mut session, total, DfuState::Download)?;
    info!("Flashing {} bytes in {} blocks", image.len(), total);

    let bar = progress_bar(total, options.show_progress, "Flashing");
    for chunk in image.chunks(DFU_BLOCK_SIZE) {
        let block = session.completed_blocks();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let ack = session.write_block(chunk)?;
            if session.completed_blocks() > block {
                break;
            }
            if attempts > options.max_block_retries {
                bar.abandon();
                return Err(bail(
                    &mut session,
                    FlashError::RetriesExhausted {
                        block,
                        attempts,
                        status: ack.status,
                    },
                ));
            }
            warn!("Retrying block {} (attempt {})", block, attempts + 1);
        }
        bar.inc(1);
    }
    bar.finish();

    info!("Flash complete; session is {:?}", session.state());
    Ok(total)
}

/// Read `size` bytes of the device image back.
pub fn dump_image<C: Channel>(
    link: Arc<Link<C>>,
    size: usize,
    options: &FlashOptions,
) -> Result<Vec<u8>, FlashError> {
    if size == 0 {
        return Err(FlashError::EmptyImage);
    }
    let total = DfuSession::<C>::blocks_for(size);
    let mut session = DfuSession::new(link)?;
    open_transfer(&mut session, total, DfuState::Upload)?;

    let bar = progress_bar(total, options.show_progress, "Reading");
    let mut image = Vec::with_capacity(size);
    while session.state() == DfuState::Upload {
        let expected = session.completed_blocks();
        let block = session.read_block()?;
        if block.sequence != expected {
            warn!("Expected block {}, device sent {}", expected, block.sequence);
        }
        image.extend_from_slice(&block.data);
        bar.inc(1);
    }
    bar.finish();

    image.truncate(size);
    info!("Read {} bytes in {} blocks", image.len(), total);
    Ok(image)
}

/// Restore the factory image.
pub fn revert_factory<C: Channel>(link: Arc<Link<C>>) -> Result<(), FlashError> {
    let mut session = DfuSession::new(link)?;
    expect_ok(DfuState::RevertFactory, session.revert_factory()?)?;
    info!("Factory image restored");
    Ok(())
}

/// Release a device left in DFU by a halted transfer.
pub fn abandon<C: Channel>(link: Arc<Link<C>>) -> Result<(), FlashError> {
    let mut session = DfuSession::new(link)?;
    session.abandon();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prf_protocol::sim::{Fault, SimHandle, SimulatedDevice};
    use prf_protocol::{ProtocolVersion, TransportKind};

    const OPTIONS: FlashOptions = FlashOptions {
        max_block_retries: 2,
        show_progress: false,
    };

    fn link() -> (Arc<Link<SimulatedDevice>>, SimHandle) {
        let device = SimulatedDevice::new(TransportKind::Spi, ProtocolVersion::V2);
        let handle = device.handle();
        (Arc::new(Link::new(device, ProtocolVersion::V2)), handle)
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7) as u8).collect()
    }

    #[test]
    fn test_flash_with_retries() {
        let (link, handle) = link();
        let image = image(2 * DFU_BLOCK_SIZE + 100);
        handle.fail_next_block_with(DfuStatus::CrcErr);
        handle.fail_next_block_with(DfuStatus::FlashErr);

        assert_eq!(flash_image(link, &image, &OPTIONS).unwrap(), 3);
        assert_eq!(handle.dfu_image(), image);
        assert_eq!(handle.dfu_state(), DfuState::Stopped);
    }

    #[test]
    fn test_retries_exhausted_exits_dfu() {
        let (link, handle) = link();
        for _ in 0..3 {
            handle.fail_next_block_with(DfuStatus::FlashErr);
        }
        let err = flash_image(link, &image(10), &OPTIONS).unwrap_err();
        assert!(matches!(
            err,
            FlashError::RetriesExhausted {
                block: 0,
                attempts: 3,
                status: DfuStatus::FlashErr
            }
        ));
        assert_eq!(handle.dfu_state(), DfuState::Stopped);
    }

    #[test]
    fn test_transport_error_leaves_device_in_dfu() {
        let (link, handle) = link();
        // The enter acknowledgement is lost after the device switched mode.
        handle.inject_fault(Fault::Corrupt);
        let err = flash_image(Arc::clone(&link), &image(10), &OPTIONS).unwrap_err();
        assert!(matches!(
            err,
            FlashError::Protocol(ProtocolError::ChecksumError { .. })
        ));
        assert_eq!(handle.dfu_state(), DfuState::Enter);

        abandon(link).unwrap();
        assert_eq!(handle.dfu_state(), DfuState::Stopped);
    }

    #[test]
    fn test_dump_image() {
        let (link, handle) = link();
        let image = image(DFU_BLOCK_SIZE + 1);
        handle.set_upload_image(image.clone());
        assert_eq!(dump_image(link, image.len(), &OPTIONS).unwrap(), image);
    }

    #[test]
    fn test_refused_mode() {
        let (link, _) = link();
        // A second session cannot enter while the device is already in ENTER.
        let mut other = DfuSession::new(Arc::clone(&link)).unwrap();
        other.enter().unwrap();
        assert!(matches!(
            flash_image(link, &image(10), &OPTIONS),
            Err(FlashError::Rejected {
                state: DfuState::Enter,
                status: DfuStatus::ModeStateError
            })
        ));
    }

    #[test]
    fn test_empty_image() {
        let (link, _) = link();
        assert!(matches!(
            flash_image(link, &[], &OPTIONS),
            Err(FlashError::EmptyImage)
        ));
    }

    #[test]
    fn test_revert_factory() {
        let (link, handle) = link();
        revert_factory(link).unwrap();
        assert_eq!(handle.dfu_state(), DfuState::Stopped);
    }
}
