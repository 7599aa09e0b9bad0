//! PWS status poll loop.
//!
//! Registrations are collected before `start`; at start the monitor writes one
//! PWS config covering them and then polls the status flag, firing the
//! registered actions on every untriggered-to-triggered transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use prf_protocol::pws::{config_for, matches_config, Edge};
use prf_protocol::{Channel, EventKey, PrfClient, ProtocolError, TriggerTracker};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Consecutive short transfers tolerated before the loop gives up.
pub const DEFAULT_MAX_SHORT_TRANSFERS: u32 = 5;

/// Callback invoked with the key that rose.
pub type Action = Box<dyn FnMut(EventKey) + Send>;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Monitor already started; register events before start")]
    AlreadyStarted,

    #[error("No PWS events registered")]
    NoEvents,

    #[error("{0} consecutive short transfers; channel needs to be reopened")]
    ChannelLost(u32),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Status reads attempted.
    pub polls: u64,
    /// Reads discarded (checksum, selector, short transfer).
    pub skipped: u64,
    /// Actions invoked.
    pub fired: u64,
}

struct Registration {
    key: EventKey,
    label: String,
    action: Action,
    /// Covered by the config written at start.
    active: bool,
}

/// Clonable handle that stops a running monitor from another thread.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct PwsMonitor<C: Channel> {
    client: PrfClient<C>,
    interval: Duration,
    max_short_transfers: u32,
    registrations: Vec<Registration>,
    stop_requested: Arc<AtomicBool>,
    started: bool,
}

impl<C: Channel> PwsMonitor<C> {
    pub fn new(client: PrfClient<C>, interval: Duration) -> Self {
        Self {
            client,
            interval,
            max_short_transfers: DEFAULT_MAX_SHORT_TRANSFERS,
            registrations: Vec::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
            started: false,
        }
    }

    pub fn with_max_short_transfers(mut self, limit: u32) -> Self {
        self.max_short_transfers = limit.max(1);
        self
    }

    pub fn register_event(
        &mut self,
        event_id: u8,
        zone_id: u32,
        label: impl Into<String>,
        action: Action,
    ) -> Result<(), MonitorError> {
        if self.started {
            return Err(MonitorError::AlreadyStarted);
        }
        let key = EventKey::new(event_id, zone_id);
        let label = label.into();
        debug!("Registered PWS event {} zone {} ({})", event_id, zone_id, label);
        self.registrations.push(Registration {
            key,
            label,
            action,
            active: false,
        });
        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop_requested))
    }

    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Configure the device and poll until stopped.
    pub fn start(&mut self) -> Result<MonitorStats, MonitorError> {
        self.configure()?;
        self.poll_loop(None)
    }

    /// Configure the device and poll at most `polls` times.
    pub fn run_for(&mut self, polls: u64) -> Result<MonitorStats, MonitorError> {
        self.configure()?;
        self.poll_loop(Some(polls))
    }

    fn configure(&mut self) -> Result<(), MonitorError> {
        if self.started {
            return Err(MonitorError::AlreadyStarted);
        }
        let keys: Vec<EventKey> = self.registrations.iter().map(|r| r.key).collect();
        let (config, _rejected) = config_for(&keys).ok_or(MonitorError::NoEvents)?;

        self.client.set_pws_config(&config)?;
        for registration in &mut self.registrations {
            registration.active = matches_config(registration.key, &config);
        }
        self.started = true;

        info!(
            "Monitoring PWS zone {} events {}/{} every {:?}",
            config.zone_id, config.event_id_1, config.event_id_2, self.interval
        );
        Ok(())
    }

    fn poll_loop(&mut self, limit: Option<u64>) -> Result<MonitorStats, MonitorError> {
        let mut stats = MonitorStats::default();
        let mut tracker = TriggerTracker::new();
        let mut short_in_row = 0u32;

        while !self.stop_requested.load(Ordering::SeqCst) {
            if limit.is_some_and(|limit| stats.polls >= limit) {
                break;
            }
            stats.polls += 1;

            match self.client.poll_status() {
                Ok(status) => {
                    short_in_row = 0;
                    match tracker.observe(status) {
                        Edge::Rising => stats.fired += self.fire(),
                        Edge::Falling => info!("PWS warning cleared"),
                        Edge::Unchanged => {}
                    }
                }
                Err(e) if e.is_sample_error() => {
                    stats.skipped += 1;
                    warn!("Skipping PWS status sample: {}", e);
                }
                Err(ProtocolError::ShortTransfer { expected, actual }) => {
                    stats.skipped += 1;
                    short_in_row += 1;
                    warn!("Short PWS status read ({} of {} bytes)", actual, expected);
                    if short_in_row >= self.max_short_transfers {
                        return Err(MonitorError::ChannelLost(short_in_row));
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
        }

        info!(
            "PWS monitor stopped after {} polls ({} skipped, {} actions)",
            stats.polls, stats.skipped, stats.fired
        );
        Ok(stats)
    }

    fn fire(&mut self) -> u64 {
        let mut fired = 0;
        for registration in self.registrations.iter_mut().filter(|r| r.active) {
            warn!("PWS warning active: {}", registration.label);
            (registration.action)(registration.key);
            fired += 1;
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use prf_protocol::sim::{Fault, SimHandle, SimulatedDevice};
    use prf_protocol::{Link, ProtocolVersion, PwsConfig, TransportKind};

    fn monitor() -> (PwsMonitor<SimulatedDevice>, SimHandle) {
        let device = SimulatedDevice::new(TransportKind::Spi, ProtocolVersion::V2);
        let handle = device.handle();
        let link = Arc::new(Link::new(device, ProtocolVersion::V2));
        (PwsMonitor::new(PrfClient::new(link), Duration::ZERO), handle)
    }

    fn recorder() -> (Arc<Mutex<Vec<EventKey>>>, impl Fn() -> Action) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let make = move || -> Action {
            let sink = Arc::clone(&sink);
            Box::new(move |key| sink.lock().push(key))
        };
        (seen, make)
    }

    #[test]
    fn test_fires_on_rising_edges_only() {
        let (mut monitor, handle) = monitor();
        let (seen, action) = recorder();
        monitor.register_event(1, 100, "flood", action()).unwrap();
        // Triggered flag pattern: F T T F F T T F
        handle.set_pws_toggle_every(2);

        let stats = monitor.run_for(8).unwrap();
        assert_eq!(stats.polls, 8);
        assert_eq!(stats.fired, 2);
        assert_eq!(*seen.lock(), vec![EventKey::new(1, 100); 2]);
    }

    #[test]
    fn test_writes_config_and_ignores_unrepresentable() {
        let (mut monitor, handle) = monitor();
        let (seen, action) = recorder();
        monitor.register_event(1, 100, "a", action()).unwrap();
        monitor.register_event(4, 100, "b", action()).unwrap();
        monitor.register_event(1, 200, "c", action()).unwrap();
        handle.set_pws_triggered(true);

        let stats = monitor.run_for(2).unwrap();
        assert_eq!(
            handle.pws_config(),
            PwsConfig {
                event_id_1: 1,
                event_id_2: 4,
                zone_id: 100,
            }
        );
        assert_eq!(stats.fired, 2);
        assert_eq!(
            *seen.lock(),
            vec![EventKey::new(1, 100), EventKey::new(4, 100)]
        );
    }

    #[test]
    fn test_checksum_error_skips_sample() {
        let (mut monitor, handle) = monitor();
        let (_, action) = recorder();
        monitor.register_event(1, 1, "x", action()).unwrap();
        handle.set_pws_triggered(true);
        handle.inject_fault(Fault::Corrupt);

        let stats = monitor.run_for(3).unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.fired, 1);
    }

    #[test]
    fn test_repeated_short_transfers_end_loop() {
        let (monitor, handle) = monitor();
        let mut monitor = monitor.with_max_short_transfers(2);
        let (_, action) = recorder();
        monitor.register_event(1, 1, "x", action()).unwrap();
        handle.inject_fault(Fault::Timeout);
        handle.inject_fault(Fault::Timeout);

        assert!(matches!(
            monitor.run_for(10),
            Err(MonitorError::ChannelLost(2))
        ));
    }

    #[test]
    fn test_register_after_start_rejected() {
        let (mut monitor, _) = monitor();
        let (_, action) = recorder();
        monitor.register_event(1, 1, "x", action()).unwrap();
        monitor.run_for(1).unwrap();
        assert!(matches!(
            monitor.register_event(2, 1, "y", action()),
            Err(MonitorError::AlreadyStarted)
        ));
        assert!(matches!(monitor.run_for(1), Err(MonitorError::AlreadyStarted)));
    }

    #[test]
    fn test_no_events() {
        let (mut monitor, _) = monitor();
        assert!(matches!(monitor.run_for(1), Err(MonitorError::NoEvents)));
    }

    #[test]
    fn test_stop_from_other_thread() {
        let (monitor, _) = monitor();
        let mut monitor = PwsMonitor {
            interval: Duration::from_millis(1),
            ..monitor
        };
        let (_, action) = recorder();
        monitor.register_event(1, 1, "x", action()).unwrap();
        let stop = monitor.stop_handle();

        let worker = thread::spawn(move || monitor.start());
        thread::sleep(Duration::from_millis(20));
        stop.stop();
        let stats = worker.join().unwrap().unwrap();
        assert!(stats.polls > 0);
    }
}
