//! Typed access to every catalog command.

use std::sync::Arc;

use log::{debug, info};

use crate::catalog::{Access, Command, TransportKind};
use crate::codec::{decode, encode, Record};
use crate::error::ProtocolError;
use crate::link::{Channel, Link};
use crate::mask::parse_composite;
use crate::types::*;

/// GPIO ports of tile 1 the host can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tile1Port {
    Port4B,
    Port4C,
}

impl Tile1Port {
    fn command(self) -> Command {
        match self {
            Tile1Port::Port4B => Command::SetTile1Port4B,
            Tile1Port::Port4C => Command::SetTile1Port4C,
        }
    }
}

/// One decoded GET_MASK_DATA response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskData {
    /// Mask the device used to build the composite.
    pub mask: Mask,
    /// One entry per enabled kind, in canonical order. Entries that failed
    /// their checksum are kept as errors so callers can skip them.
    pub records: Vec<Result<TelemetryRecord, ProtocolError>>,
}

impl MaskData {
    /// Successfully decoded records.
    pub fn valid(&self) -> impl Iterator<Item = &TelemetryRecord> {
        self.records.iter().filter_map(|r| r.as_ref().ok())
    }
}

/// PRF device client.
pub struct PrfClient<C: Channel> {
    link: Arc<Link<C>>,
}

impl<C: Channel> PrfClient<C> {
    /// Wrap a link without checking the device.
    pub fn new(link: Arc<Link<C>>) -> Self {
        Self { link }
    }

    /// Wrap a link after confirming the device speaks the link's protocol
    /// version.
    pub fn connect(link: Arc<Link<C>>) -> Result<Self, ProtocolError> {
        let client = Self::new(link);
        let version = client.get_version()?;
        let host = client.version().as_u8();
        if version.protocol != host {
            return Err(ProtocolError::VersionMismatch {
                device: version.protocol,
                host,
            });
        }
        info!("Connected to PRF {}", version);
        Ok(client)
    }

    pub fn link(&self) -> &Arc<Link<C>> {
        &self.link
    }

    pub fn version(&self) -> ProtocolVersion {
        self.link.version()
    }

    pub fn transport(&self) -> Result<TransportKind, ProtocolError> {
        self.link.transport()
    }

    fn get<R: Record>(&self, command: Command) -> Result<R, ProtocolError> {
        let response = self.link.execute(command, &[])?;
        decode(&response, self.version())
    }

    fn set<R: Record>(&self, command: Command, record: &R) -> Result<(), ProtocolError> {
        let payload = encode(record, self.version())?;
        self.link.execute(command, &payload)?;
        Ok(())
    }

    fn get_stored<R: Record>(&self, storage: Storage) -> Result<R, ProtocolError> {
        self.get(Command::resolve(Access::Read, R::KIND, Some(storage))?)
    }

    fn set_stored<R: Record>(&self, storage: Storage, record: &R) -> Result<(), ProtocolError> {
        self.set(Command::resolve(Access::Write, R::KIND, Some(storage))?, record)
    }

    pub fn get_dab_config(&self, storage: Storage) -> Result<DabConfig, ProtocolError> {
        self.get_stored(storage)
    }

    /// Changing the channel re-tunes the device.
    pub fn set_dab_config(&self, storage: Storage, config: &DabConfig) -> Result<(), ProtocolError> {
        self.set_stored(storage, config)
    }

    pub fn get_tuner_option(&self, storage: Storage) -> Result<TunerOption, ProtocolError> {
        self.get_stored(storage)
    }

    pub fn set_tuner_option(&self, storage: Storage, option: &TunerOption) -> Result<(), ProtocolError> {
        self.set_stored(storage, option)
    }

    pub fn get_process_option(&self, storage: Storage) -> Result<ProcessOption, ProtocolError> {
        self.get_stored(storage)
    }

    pub fn set_process_option(&self, storage: Storage, option: &ProcessOption) -> Result<(), ProtocolError> {
        self.set_stored(storage, option)
    }

    pub fn set_tile1_port(&self, port: Tile1Port, value: u8) -> Result<(), ProtocolError> {
        self.set(port.command(), &PortValue { value })
    }

    pub fn set_tuner_register(&self, register: &TunerRegister) -> Result<(), ProtocolError> {
        self.set(Command::SetTunerRegister, register)
    }

    pub fn get_pws_config(&self) -> Result<PwsConfig, ProtocolError> {
        self.get(Command::GetPwsConfig)
    }

    pub fn set_pws_config(&self, config: &PwsConfig) -> Result<(), ProtocolError> {
        self.set(Command::SetPwsConfig, config)
    }

    /// Current PWS status. Carries no event or zone; matching is against the
    /// last configuration written.
    pub fn poll_status(&self) -> Result<PwsStatus, ProtocolError> {
        self.get(Command::GetPwsStatus)
    }

    pub fn get_version(&self) -> Result<Version, ProtocolError> {
        self.get(Command::GetVersion)
    }

    pub fn get_serial_no(&self) -> Result<SerialNo, ProtocolError> {
        self.get(Command::GetSerialNo)
    }

    pub fn set_serial_no(&self, serial: &SerialNo) -> Result<(), ProtocolError> {
        self.set(Command::SetSerialNo, serial)
    }

    pub fn get_signal_info(&self) -> Result<SignalInfo, ProtocolError> {
        self.get(Command::GetSignalInfo)
    }

    /// Select the kinds multiplexed into mask data (streaming transport).
    pub fn set_mask(&self, mask: Mask) -> Result<(), ProtocolError> {
        mask.validate(self.version())?;
        debug!("Setting mask {}", mask);
        self.link.execute(Command::SetMask, &[mask.bits()])?;
        Ok(())
    }

    /// Read one composite telemetry buffer.
    pub fn read_mask_data(&self) -> Result<MaskData, ProtocolError> {
        let response = self.link.execute(Command::GetMaskData, &[])?;
        let (mask, composite) = match response.split_first() {
            Some((&bits, rest)) => (Mask::from_bits(bits), rest),
            None => {
                return Err(ProtocolError::ShortTransfer {
                    expected: 1,
                    actual: 0,
                })
            }
        };
        let records = parse_composite(composite, mask, self.version())?;
        Ok(MaskData { mask, records })
    }

    pub fn ping(&self) -> Result<u8, ProtocolError> {
        let response = self.link.execute(Command::Ping, &[])?;
        response.first().copied().ok_or(ProtocolError::ShortTransfer {
            expected: 1,
            actual: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Fault, SimulatedDevice, PING_ECHO};

    const V2: ProtocolVersion = ProtocolVersion::V2;

    fn client(transport: TransportKind) -> (PrfClient<SimulatedDevice>, crate::sim::SimHandle) {
        let device = SimulatedDevice::new(transport, V2);
        let handle = device.handle();
        let client = PrfClient::connect(Arc::new(Link::new(device, V2))).unwrap();
        (client, handle)
    }

    #[test]
    fn test_connect_version_mismatch() {
        let device = SimulatedDevice::new(TransportKind::Spi, V2);
        device.handle().set_firmware(Version {
            protocol: 1,
            fw_major: 0,
            fw_minor: 9,
            fw_patch: 0,
        });
        let result = PrfClient::connect(Arc::new(Link::new(device, V2)));
        assert!(matches!(
            result,
            Err(ProtocolError::VersionMismatch { device: 1, host: 2 })
        ));
    }

    #[test]
    fn test_configuration_roundtrip() {
        let (client, _) = client(TransportKind::Spi);

        client
            .set_dab_config(Storage::Volatile, &DabConfig { channel_idx: 21 })
            .unwrap();
        assert_eq!(client.get_dab_config(Storage::Volatile).unwrap().channel_idx, 21);
        assert_eq!(client.get_dab_config(Storage::Persistent).unwrap().channel_idx, 0);

        let option = TunerOption {
            use_digital_diode: true,
            use_bb_filter_770: true,
            fir: [3; FIR_TAPS],
        };
        client.set_tuner_option(Storage::Persistent, &option).unwrap();
        assert_eq!(client.get_tuner_option(Storage::Persistent).unwrap(), option);

        let mut process = client.get_process_option(Storage::Volatile).unwrap();
        process.fib_crc_trap_limit = 10;
        process.tii_opt = Some(TiiOption {
            enabled: true,
            threshold: 6,
        });
        client.set_process_option(Storage::Volatile, &process).unwrap();
        assert_eq!(client.get_process_option(Storage::Volatile).unwrap(), process);
    }

    #[test]
    fn test_misc_commands() {
        let (client, handle) = client(TransportKind::Spi);

        client.set_tile1_port(Tile1Port::Port4C, 0x3C).unwrap();
        assert_eq!(handle.port(Command::SetTile1Port4C), Some(0x3C));

        client
            .set_tuner_register(&TunerRegister {
                address: 0x0010,
                value: 0x8001,
            })
            .unwrap();
        assert_eq!(handle.tuner_register(0x0010), Some(0x8001));

        let serial = SerialNo::from_text("PRF042").unwrap();
        client.set_serial_no(&serial).unwrap();
        assert_eq!(client.get_serial_no().unwrap().as_text(), "PRF042");

        assert_eq!(client.ping().unwrap(), PING_ECHO);
    }

    #[test]
    fn test_pws_status_and_config() {
        let (client, handle) = client(TransportKind::Spi);
        assert!(!client.poll_status().unwrap().triggered);
        handle.set_pws_triggered(true);
        assert!(client.poll_status().unwrap().triggered);

        let config = PwsConfig {
            event_id_1: 1,
            event_id_2: 4,
            zone_id: 0x0102_0304,
        };
        client.set_pws_config(&config).unwrap();
        assert_eq!(client.get_pws_config().unwrap(), config);
    }

    #[test]
    fn test_mask_data_over_stream() {
        let (client, handle) = client(TransportKind::UsbStream);
        let mask = Mask::EMPTY
            .with(TelemetryKind::SignalInfo)
            .with(TelemetryKind::Tick);
        client.set_mask(mask).unwrap();
        assert_eq!(handle.mask(), mask);

        let data = client.read_mask_data().unwrap();
        assert_eq!(data.mask, mask);
        let kinds: Vec<_> = data.valid().map(|r| r.kind()).collect();
        assert_eq!(kinds, vec![TelemetryKind::SignalInfo, TelemetryKind::Tick]);
    }

    #[test]
    fn test_mask_requires_stream_transport() {
        let (client, _) = client(TransportKind::Spi);
        assert!(matches!(
            client.set_mask(Mask::EMPTY.with(TelemetryKind::Tick)),
            Err(ProtocolError::UnsupportedOnTransport { opcode: 0x11, .. })
        ));
    }

    #[test]
    fn test_poll_skips_corrupt_sample() {
        let (client, handle) = client(TransportKind::Spi);
        handle.inject_fault(Fault::Corrupt);
        let err = client.poll_status().unwrap_err();
        assert!(err.is_sample_error());
        // Next interval is fine.
        assert!(client.poll_status().is_ok());
    }
}
