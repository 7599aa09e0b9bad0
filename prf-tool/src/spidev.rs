//! Linux spidev channel.
//!
//! Each phase of a transaction is one `SPI_IOC_MESSAGE(1)` transfer. The
//! kernel shifts both directions at once; the link supplies the zero-filled
//! side.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::debug;
use nix::{ioctl_read, ioctl_write_buf, ioctl_write_ptr};
use prf_protocol::{Channel, TransportKind};

const SPI_IOC_MAGIC: u8 = b'k';

/// `struct spi_ioc_transfer` from `linux/spi/spidev.h`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

ioctl_write_buf!(spi_message, SPI_IOC_MAGIC, 0, SpiIocTransfer);
ioctl_write_ptr!(spi_write_mode, SPI_IOC_MAGIC, 1, u8);
ioctl_read!(spi_read_mode, SPI_IOC_MAGIC, 1, u8);
ioctl_write_ptr!(spi_write_bits_per_word, SPI_IOC_MAGIC, 3, u8);
ioctl_write_ptr!(spi_write_max_speed_hz, SPI_IOC_MAGIC, 4, u32);

/// Bus parameters.
#[derive(Debug, Clone)]
pub struct SpiSettings {
    pub mode: u8,
    pub bits_per_word: u8,
    pub speed_hz: u32,
}

pub struct SpiDev {
    file: File,
    settings: SpiSettings,
}

impl SpiDev {
    pub fn open(path: &Path, settings: SpiSettings) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let fd = file.as_raw_fd();

        // SAFETY: fd is an open spidev node; every pointer refers to a live
        // local of the type the request encodes.
        unsafe {
            spi_write_mode(fd, &settings.mode)?;
            let mut mode = 0u8;
            spi_read_mode(fd, &mut mode)?;
            spi_write_bits_per_word(fd, &settings.bits_per_word)?;
            spi_write_max_speed_hz(fd, &settings.speed_hz)?;
            debug!(
                "Opened {} (mode {}, {} bits, {} Hz)",
                path.display(),
                mode,
                settings.bits_per_word,
                settings.speed_hz
            );
        }

        Ok(Self { file, settings })
    }
}

impl Channel for SpiDev {
    fn kind(&self) -> TransportKind {
        TransportKind::Spi
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<usize> {
        if tx.len() != rx.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tx and rx lengths differ",
            ));
        }
        let len = u32::try_from(tx.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "transfer too long"))?;
        let transfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len,
            speed_hz: self.settings.speed_hz,
            bits_per_word: self.settings.bits_per_word,
            ..Default::default()
        };

        // SAFETY: both buffers outlive the call and are `len` bytes long.
        let moved = unsafe { spi_message(self.file.as_raw_fd(), &[transfer]) }?;
        Ok(moved.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_struct_layout() {
        // Must match the kernel's 32-byte spi_ioc_transfer.
        assert_eq!(std::mem::size_of::<SpiIocTransfer>(), 32);
    }

    #[test]
    fn test_open_missing_device() {
        let settings = SpiSettings {
            mode: 1,
            bits_per_word: 8,
            speed_hz: 1_000_000,
        };
        let err = SpiDev::open(Path::new("/nonexistent/spidev9.9"), settings)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
