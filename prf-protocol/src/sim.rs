//! In-memory PRF board.
//!
//! `SimulatedDevice` is a [`Channel`] that answers every catalog command the
//! way the firmware does: configuration is stored per storage class, status
//! and telemetry are synthesized, and the DFU state machine acknowledges
//! blocks. Faults can be injected through a [`SimHandle`] so error paths can
//! be exercised without hardware.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::catalog::{Access, Command, TransportKind};
use crate::codec::{decode_any, encode};
use crate::error::DfuStatus;
use crate::link::Channel;
use crate::mask::{build_composite, SampleSource};
use crate::types::*;

/// Value the device returns for PING: the opcode echoed back.
pub const PING_ECHO: u8 = 0xC1;

/// Upper bound of the recorded phase history.
const PHASE_LOG_CAPACITY: usize = 4096;

/// One transfer observed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Write { opcode: u8, len: usize },
    Read { len: usize },
}

/// A failure to inject into the next read phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Deliver only half of the requested bytes.
    Short,
    /// Fail the transfer with a timeout.
    Timeout,
    /// Flip one bit of the response.
    Corrupt,
}

#[derive(Debug, Clone, Copy, Default)]
struct Stored<T> {
    persistent: T,
    volatile: T,
}

impl<T> Stored<T> {
    fn get(&self, storage: Storage) -> &T {
        match storage {
            Storage::Persistent => &self.persistent,
            Storage::Volatile => &self.volatile,
        }
    }

    fn get_mut(&mut self, storage: Storage) -> &mut T {
        match storage {
            Storage::Persistent => &mut self.persistent,
            Storage::Volatile => &mut self.volatile,
        }
    }
}

#[derive(Debug)]
struct DeviceDfu {
    state: DfuState,
    total_blocks: u32,
    next_block: u32,
    image: Vec<u8>,
    upload_image: Vec<u8>,
    last_ack: DfuAck,
    forced: VecDeque<DfuStatus>,
}

impl Default for DeviceDfu {
    fn default() -> Self {
        Self {
            state: DfuState::Stopped,
            total_blocks: 0,
            next_block: 0,
            image: Vec::new(),
            upload_image: Vec::new(),
            last_ack: DfuAck {
                block: 0,
                status: DfuStatus::Ok,
            },
            forced: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    version: ProtocolVersion,
    firmware: Version,
    serial: SerialNo,
    dab: Stored<DabConfig>,
    tuner: Stored<TunerOption>,
    process: Stored<ProcessOption>,
    ports: [u8; 2],
    tuner_registers: HashMap<u16, u16>,
    pws_config: PwsConfig,
    pws_triggered: bool,
    pws_toggle_every: Option<u32>,
    pws_polls: u32,
    mask: Mask,
    interval: u32,
    dfu: DeviceDfu,
    pending: VecDeque<u8>,
    phases: VecDeque<Phase>,
    faults: VecDeque<Fault>,
    rejected_writes: usize,
    dirty_reads: usize,
}

impl DeviceState {
    fn new(version: ProtocolVersion) -> Self {
        let process = ProcessOption {
            tii_opt: (version >= ProtocolVersion::V2).then_some(TiiOption::default()),
            ..Default::default()
        };
        Self {
            version,
            firmware: Version {
                protocol: version.as_u8(),
                fw_major: 1,
                fw_minor: 0,
                fw_patch: 0,
            },
            serial: SerialNo {
                serial: *b"SIM001",
            },
            dab: Stored::default(),
            tuner: Stored::default(),
            process: Stored {
                persistent: process,
                volatile: process,
            },
            ports: [0; 2],
            tuner_registers: HashMap::new(),
            pws_config: PwsConfig::default(),
            pws_triggered: false,
            pws_toggle_every: None,
            pws_polls: 0,
            mask: Mask::EMPTY,
            interval: 0,
            dfu: DeviceDfu::default(),
            pending: VecDeque::new(),
            phases: VecDeque::new(),
            faults: VecDeque::new(),
            rejected_writes: 0,
            dirty_reads: 0,
        }
    }

    fn log_phase(&mut self, phase: Phase) {
        if self.phases.len() == PHASE_LOG_CAPACITY {
            self.phases.pop_front();
        }
        self.phases.push_back(phase);
    }

    fn respond<R: crate::codec::Record>(&mut self, record: &R) {
        match encode(record, self.version) {
            Ok(bytes) => self.pending.extend(bytes.iter()),
            Err(e) => debug!("sim: cannot encode {}: {}", R::KIND, e),
        }
    }

    fn handle_command(&mut self, opcode: u8, payload: &[u8], transport: TransportKind) {
        self.pending.clear();
        let command = match Command::from_opcode(opcode) {
            Ok(command) => command,
            Err(_) => {
                debug!("sim: ignoring unknown opcode 0x{:02X}", opcode);
                return;
            }
        };
        if !command.spec().transports.contains(transport) {
            debug!("sim: {} not served on {}", command, transport);
            return;
        }

        match command.access() {
            Access::Write => self.handle_write(command, payload),
            Access::Read => self.handle_read(command),
            Access::ReadValue => self.handle_value(command),
        }
    }

    fn handle_write(&mut self, command: Command, payload: &[u8]) {
        if command == Command::SetMask {
            let mask = Mask::from_bits(payload.first().copied().unwrap_or_default());
            if mask.validate(self.version).is_ok() {
                self.mask = mask;
            } else {
                self.rejected_writes += 1;
            }
            return;
        }
        let Some(kind) = command.record() else {
            return;
        };
        let record = match decode_any(kind, payload, self.version) {
            Ok(record) => record,
            Err(e) => {
                debug!("sim: rejecting {}: {}", command, e);
                self.rejected_writes += 1;
                return;
            }
        };
        let storage = command.spec().storage;

        match (record, storage) {
            (AnyRecord::DabConfig(r), Some(s)) => *self.dab.get_mut(s) = r,
            (AnyRecord::TunerOption(r), Some(s)) => *self.tuner.get_mut(s) = r,
            (AnyRecord::ProcessOption(r), Some(s)) => *self.process.get_mut(s) = r,
            (AnyRecord::PortValue(r), _) => {
                let port = if command == Command::SetTile1Port4B { 0 } else { 1 };
                self.ports[port] = r.value;
            }
            (AnyRecord::PwsConfig(r), _) => self.pws_config = r,
            (AnyRecord::TunerRegister(r), _) => {
                self.tuner_registers.insert(r.address, r.value);
            }
            (AnyRecord::SerialNo(r), _) => self.serial = r,
            (AnyRecord::DfuMode(r), _) => self.dfu_mode(r),
            (AnyRecord::DfuBlock(r), _) => self.dfu_block(r),
            (other, _) => debug!("sim: no handler for {:?}", other.kind()),
        }
    }

    fn handle_read(&mut self, command: Command) {
        let storage = command.spec().storage.unwrap_or(Storage::Volatile);
        match command {
            Command::GetDabConfigPersistent | Command::GetDabConfigVolatile => {
                let r = *self.dab.get(storage);
                self.respond(&r);
            }
            Command::GetTunerOptionPersistent | Command::GetTunerOptionVolatile => {
                let r = *self.tuner.get(storage);
                self.respond(&r);
            }
            Command::GetProcessOptionPersistent | Command::GetProcessOptionVolatile => {
                let r = *self.process.get(storage);
                self.respond(&r);
            }
            Command::GetPwsConfig => {
                let r = self.pws_config;
                self.respond(&r);
            }
            Command::GetPwsStatus => {
                self.pws_polls += 1;
                if let Some(every) = self.pws_toggle_every {
                    if every > 0 && self.pws_polls % every == 0 {
                        self.pws_triggered = !self.pws_triggered;
                    }
                }
                let r = PwsStatus {
                    triggered: self.pws_triggered,
                };
                self.respond(&r);
            }
            Command::GetVersion => {
                let r = self.firmware;
                self.respond(&r);
            }
            Command::GetSerialNo => {
                let r = self.serial;
                self.respond(&r);
            }
            Command::GetSignalInfo => {
                self.interval = self.interval.wrapping_add(1);
                if let TelemetryRecord::SignalInfo(r) = self.sample(TelemetryKind::SignalInfo) {
                    self.respond(&r);
                }
            }
            Command::GetDfuMode => {
                let r = DfuMode {
                    state: self.dfu.state,
                    total_blocks: self.dfu.total_blocks,
                };
                self.respond(&r);
            }
            Command::GetDfuAck => {
                let r = self.dfu.last_ack;
                self.respond(&r);
            }
            Command::GetDfuBlock => self.dfu_upload_block(),
            _ => {}
        }
    }

    fn handle_value(&mut self, command: Command) {
        match command {
            Command::GetMaskData => {
                self.interval = self.interval.wrapping_add(1);
                let mask = self.mask;
                let version = self.version;
                match build_composite(mask, &mut *self, version) {
                    Ok(composite) => {
                        self.pending.push_back(mask.bits());
                        self.pending.extend(composite.iter());
                    }
                    Err(e) => debug!("sim: cannot build composite: {}", e),
                }
            }
            Command::Ping => self.pending.push_back(PING_ECHO),
            _ => {}
        }
    }

    fn dfu_mode(&mut self, mode: DfuMode) {
        use DfuState::*;
        let from = self.dfu.state;
        let allowed = match mode.state {
            Enter => from == Stopped,
            Started => from == Enter,
            Download | Upload => from == Started,
            RevertFactory => matches!(from, Started | Stopped),
            Exit | Stopped => true,
        };
        let status = if allowed {
            DfuStatus::Ok
        } else {
            DfuStatus::ModeStateError
        };
        if allowed {
            self.dfu.state = match mode.state {
                Exit | Stopped | RevertFactory => Stopped,
                other => other,
            };
            match mode.state {
                Started => {
                    self.dfu.total_blocks = mode.total_blocks;
                    self.dfu.next_block = 0;
                    self.dfu.image.clear();
                }
                RevertFactory => {
                    self.firmware.fw_major = 1;
                    self.firmware.fw_minor = 0;
                    self.firmware.fw_patch = 0;
                }
                _ => {}
            }
        }
        trace!("sim: dfu {:?} -> {:?}: {}", from, mode.state, status);
        self.dfu.last_ack = DfuAck { block: 0, status };
    }

    fn dfu_block(&mut self, block: DfuBlock) {
        let status = if self.dfu.state != DfuState::Download {
            DfuStatus::ModeStateError
        } else if let Some(forced) = self.dfu.forced.pop_front() {
            forced
        } else if block.sequence != self.dfu.next_block {
            DfuStatus::BlockErr
        } else {
            self.dfu.image.extend_from_slice(&block.data);
            self.dfu.next_block += 1;
            if self.dfu.next_block == self.dfu.total_blocks {
                self.dfu.state = DfuState::Stopped;
            }
            DfuStatus::Ok
        };
        self.dfu.last_ack = DfuAck {
            block: block.sequence,
            status,
        };
    }

    fn dfu_upload_block(&mut self) {
        if self.dfu.state != DfuState::Upload {
            return;
        }
        let start = self.dfu.next_block as usize * DFU_BLOCK_SIZE;
        let end = (start + DFU_BLOCK_SIZE).min(self.dfu.upload_image.len());
        let data = self
            .dfu
            .upload_image
            .get(start..end)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        let block = DfuBlock {
            sequence: self.dfu.next_block,
            data,
        };
        self.dfu.next_block += 1;
        if self.dfu.next_block >= self.dfu.total_blocks {
            self.dfu.state = DfuState::Stopped;
        }
        self.respond(&block);
    }

    fn read_phase(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<usize> {
        if tx.iter().any(|&b| b != 0) {
            self.dirty_reads += 1;
        }
        self.log_phase(Phase::Read { len: rx.len() });

        let fault = self.faults.pop_front();
        if fault == Some(Fault::Timeout) {
            self.pending.clear();
            return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated timeout"));
        }
        let mut n = rx.len().min(self.pending.len());
        if fault == Some(Fault::Short) {
            n /= 2;
        }
        for (slot, byte) in rx.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        if fault == Some(Fault::Corrupt) && n > 0 {
            rx[0] ^= 0x01;
        }
        Ok(n)
    }
}

impl SampleSource for DeviceState {
    fn sample(&mut self, kind: TelemetryKind) -> TelemetryRecord {
        let counter = self.interval;
        let wave = (counter % 16) as i8;
        match kind {
            TelemetryKind::SignalInfo => TelemetryRecord::SignalInfo(SignalInfo {
                update_counter: counter,
                coarse_offset: -1200,
                fine_offset_accum: 35 + wave as i32,
                fine_offset: wave as i16 - 8,
                ratio: 180,
                is_tii: self.version >= ProtocolVersion::V2,
                power_in: -55 + wave,
                is_blocker: false,
                temperature: 412,
            }),
            TelemetryKind::FibInfo => {
                let mut fib = FibInfo {
                    update_counter: counter,
                    used_ber_bits: 3072,
                    bit_errors: (counter % 7) as u16,
                    ..Default::default()
                };
                fib.fib_data[0] = 0x05;
                TelemetryRecord::FibInfo(fib)
            }
            TelemetryKind::Subchannel => TelemetryRecord::Subchannel(Subchannel {
                update_counter: counter,
                address: (self.version >= ProtocolVersion::V2).then_some(SubchannelAddress {
                    format: SubchannelFormat::Processed,
                    subch_id: 1,
                    start_address: 84,
                    subch_size: 72,
                }),
                data: vec![0x5A; 72 * 8],
            }),
            TelemetryKind::Iq => {
                let data = (0..IQ_SAMPLES).map(|i| ((i % 64) as i8) - 32).collect();
                TelemetryRecord::Iq(Iq {
                    update_counter: counter,
                    data,
                })
            }
            TelemetryKind::Spectrum => {
                let data = (0..SPECTRUM_BINS).map(|i| (i / 16) as u8).collect();
                TelemetryRecord::Spectrum(Spectrum {
                    update_counter: counter,
                    data,
                })
            }
            TelemetryKind::ImpulseResponse => {
                let mut data = vec![0; IMPULSE_RESPONSE_LEN];
                data[IMPULSE_RESPONSE_LEN / 2] = 255;
                TelemetryRecord::ImpulseResponse(ImpulseResponse {
                    update_counter: counter,
                    data,
                })
            }
            TelemetryKind::Tii => TelemetryRecord::Tii(Tii {
                update_counter: counter,
                entries: vec![TiiEntry {
                    main_id: 12,
                    sub_id: 3,
                    level: -20 + wave as i16,
                }],
            }),
            TelemetryKind::Tick => TelemetryRecord::Tick(Tick {
                update_counter: counter,
            }),
        }
    }
}

/// Simulated PRF board on one transport.
pub struct SimulatedDevice {
    transport: TransportKind,
    latency: Option<Duration>,
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    pub fn new(transport: TransportKind, version: ProtocolVersion) -> Self {
        Self {
            transport,
            latency: None,
            state: Arc::new(Mutex::new(DeviceState::new(version))),
        }
    }

    /// Sleep this long inside every transfer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Handle for inspecting and steering the device after it has been
    /// moved into a link.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Channel for SimulatedDevice {
    fn kind(&self) -> TransportKind {
        self.transport
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<usize> {
        if tx.len() != rx.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tx and rx lengths differ",
            ));
        }
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let mut state = self.state.lock();
        match tx.first() {
            // Opcodes are never zero; a zero-filled transfer clocks out a
            // pending response.
            Some(&opcode) if opcode != 0 => {
                state.log_phase(Phase::Write {
                    opcode,
                    len: tx.len(),
                });
                state.handle_command(opcode, &tx[1..], self.transport);
                Ok(tx.len())
            }
            _ => state.read_phase(tx, rx),
        }
    }
}

/// Shared view of a [`SimulatedDevice`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<DeviceState>>,
}

impl SimHandle {
    pub fn set_pws_triggered(&self, triggered: bool) {
        self.state.lock().pws_triggered = triggered;
    }

    /// Flip the PWS status every `polls` status reads.
    pub fn set_pws_toggle_every(&self, polls: u32) {
        self.state.lock().pws_toggle_every = Some(polls);
    }

    pub fn pws_config(&self) -> PwsConfig {
        self.state.lock().pws_config
    }

    pub fn set_firmware(&self, firmware: Version) {
        self.state.lock().firmware = firmware;
    }

    /// Acknowledge the next written DFU block with `status` instead of OK.
    pub fn fail_next_block_with(&self, status: DfuStatus) {
        self.state.lock().dfu.forced.push_back(status);
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    pub fn set_upload_image(&self, image: Vec<u8>) {
        self.state.lock().dfu.upload_image = image;
    }

    /// Blocks accepted during the last download.
    pub fn dfu_image(&self) -> Vec<u8> {
        self.state.lock().dfu.image.clone()
    }

    pub fn dfu_state(&self) -> DfuState {
        self.state.lock().dfu.state
    }

    pub fn mask(&self) -> Mask {
        self.state.lock().mask
    }

    /// Skip `intervals` sampling intervals without reporting them.
    pub fn advance(&self, intervals: u32) {
        let mut state = self.state.lock();
        state.interval = state.interval.wrapping_add(intervals);
    }

    pub fn tuner_register(&self, address: u16) -> Option<u16> {
        self.state.lock().tuner_registers.get(&address).copied()
    }

    pub fn port(&self, command: Command) -> Option<u8> {
        let state = self.state.lock();
        match command {
            Command::SetTile1Port4B => Some(state.ports[0]),
            Command::SetTile1Port4C => Some(state.ports[1]),
            _ => None,
        }
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.state.lock().phases.iter().copied().collect()
    }

    pub fn clear_phases(&self) {
        self.state.lock().phases.clear();
    }

    /// Writes the device discarded (bad checksum, wrong layout, bad mask).
    pub fn rejected_writes(&self) -> usize {
        self.state.lock().rejected_writes
    }

    /// Read phases whose transmit side was not zero-filled.
    pub fn dirty_reads(&self) -> usize {
        self.state.lock().dirty_reads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::link::Link;

    const V2: ProtocolVersion = ProtocolVersion::V2;

    #[test]
    fn test_transactions_never_interleave() {
        let device = SimulatedDevice::new(TransportKind::Spi, V2)
            .with_latency(Duration::from_micros(50));
        let handle = device.handle();
        let link = Arc::new(Link::new(device, V2));

        let threads: Vec<_> = [Command::GetVersion, Command::GetPwsStatus]
            .into_iter()
            .map(|command| {
                let link = Arc::clone(&link);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        link.execute(command, &[]).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let phases = handle.phases();
        assert_eq!(phases.len(), 200);
        // Every write is immediately followed by its own read.
        for pair in phases.chunks(2) {
            match pair {
                [Phase::Write { opcode: 0x89, .. }, Phase::Read { len: 8 }] => {}
                [Phase::Write { opcode: 0x88, .. }, Phase::Read { len: 5 }] => {}
                other => panic!("interleaved phases: {:?}", other),
            }
        }
        assert_eq!(handle.dirty_reads(), 0);
    }

    #[test]
    fn test_configuration_storage_classes() {
        let device = SimulatedDevice::new(TransportKind::Spi, V2);
        let link = Link::new(device, V2);

        let persistent = encode(&DabConfig { channel_idx: 7 }, V2).unwrap();
        link.execute(Command::SetDabConfigPersistent, &persistent).unwrap();

        let read_back = link.execute(Command::GetDabConfigPersistent, &[]).unwrap();
        assert_eq!(read_back, persistent.to_vec());
        let volatile = link.execute(Command::GetDabConfigVolatile, &[]).unwrap();
        assert_ne!(volatile, persistent.to_vec());
    }

    #[test]
    fn test_corrupt_write_rejected() {
        let device = SimulatedDevice::new(TransportKind::Spi, V2);
        let handle = device.handle();
        let link = Link::new(device, V2);
        let mut payload = encode(&PwsConfig::default(), V2).unwrap().to_vec();
        payload[0] ^= 0xFF;
        link.execute(Command::SetPwsConfig, &payload).unwrap();
        assert_eq!(handle.rejected_writes(), 1);
    }

    #[test]
    fn test_injected_faults() {
        let device = SimulatedDevice::new(TransportKind::Spi, V2);
        let handle = device.handle();
        let link = Link::new(device, V2);

        handle.inject_fault(Fault::Short);
        assert!(matches!(
            link.execute(Command::GetVersion, &[]),
            Err(ProtocolError::ShortTransfer { expected: 8, actual: 4 })
        ));

        handle.inject_fault(Fault::Corrupt);
        assert!(matches!(
            link.execute(Command::GetVersion, &[]),
            Err(ProtocolError::ChecksumError { .. })
        ));

        handle.inject_fault(Fault::Timeout);
        assert!(matches!(
            link.execute(Command::GetVersion, &[]),
            Err(ProtocolError::ShortTransfer { .. })
        ));

        assert!(link.execute(Command::GetVersion, &[]).is_ok());
    }

    #[test]
    fn test_ping_echo() {
        let link = Link::new(SimulatedDevice::new(TransportKind::UsbStream, V2), V2);
        assert_eq!(link.execute(Command::Ping, &[]).unwrap(), vec![PING_ECHO]);
    }
}
