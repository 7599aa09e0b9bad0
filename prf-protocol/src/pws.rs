//! Public warning system matching.
//!
//! The device status record is a bare `triggered` flag with no event or zone.
//! Which events it stands for is decided by the config the host last wrote,
//! so callers register (event, zone) pairs, derive one config from them, and
//! fire actions on the false-to-true edge of successive polls.

use log::warn;

use crate::types::{PwsConfig, PwsStatus};

/// One registered warning: event id within a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub event_id: u8,
    pub zone_id: u32,
}

impl EventKey {
    pub fn new(event_id: u8, zone_id: u32) -> Self {
        Self { event_id, zone_id }
    }
}

/// Whether the device, configured with `config`, reports `key`.
pub fn matches_config(key: EventKey, config: &PwsConfig) -> bool {
    key.zone_id == config.zone_id
        && (key.event_id == config.event_id_1 || key.event_id == config.event_id_2)
}

/// Build the device config covering as many of `keys` as it can hold: the
/// zone of the first key and at most two event ids in that zone.
///
/// Returns the config and the keys it cannot represent; those never fire.
pub fn config_for(keys: &[EventKey]) -> Option<(PwsConfig, Vec<EventKey>)> {
    let first = keys.first()?;
    let mut config = PwsConfig {
        event_id_1: first.event_id,
        event_id_2: first.event_id,
        zone_id: first.zone_id,
    };
    let mut second_set = false;
    let mut rejected = Vec::new();

    for key in &keys[1..] {
        if matches_config(*key, &config) {
            continue;
        }
        if key.zone_id == config.zone_id && !second_set {
            config.event_id_2 = key.event_id;
            second_set = true;
            continue;
        }
        warn!(
            "PWS event {} in zone {} cannot be monitored alongside zone {}",
            key.event_id, key.zone_id, config.zone_id
        );
        rejected.push(*key);
    }
    Some((config, rejected))
}

/// Change of the triggered flag between two polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Unchanged,
}

/// Remembers the previous poll. Starts out untriggered, so a warning already
/// active at the first poll counts as a rising edge.
#[derive(Debug, Default)]
pub struct TriggerTracker {
    triggered: bool,
}

impl TriggerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, status: PwsStatus) -> Edge {
        let edge = match (self.triggered, status.triggered) {
            (false, true) => Edge::Rising,
            (true, false) => Edge::Falling,
            _ => Edge::Unchanged,
        };
        self.triggered = status.triggered;
        edge
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rising_edge_only() {
        let mut tracker = TriggerTracker::new();
        let polls = [false, true, true, false, true];
        let edges: Vec<_> = polls
            .iter()
            .map(|&triggered| tracker.observe(PwsStatus { triggered }))
            .collect();
        assert_eq!(
            edges,
            vec![
                Edge::Unchanged,
                Edge::Rising,
                Edge::Unchanged,
                Edge::Falling,
                Edge::Rising
            ]
        );
    }

    #[test]
    fn test_config_for_two_events() {
        let keys = [EventKey::new(1, 100), EventKey::new(3, 100)];
        let (config, rejected) = config_for(&keys).unwrap();
        assert_eq!(
            config,
            PwsConfig {
                event_id_1: 1,
                event_id_2: 3,
                zone_id: 100,
            }
        );
        assert!(rejected.is_empty());
        assert!(keys.iter().all(|k| matches_config(*k, &config)));
    }

    #[test]
    fn test_config_for_overflow() {
        let keys = [
            EventKey::new(1, 100),
            EventKey::new(1, 100),
            EventKey::new(2, 100),
            EventKey::new(5, 100),
            EventKey::new(1, 200),
        ];
        let (config, rejected) = config_for(&keys).unwrap();
        assert_eq!(config.event_id_2, 2);
        assert_eq!(rejected, vec![EventKey::new(5, 100), EventKey::new(1, 200)]);
        assert!(!matches_config(EventKey::new(1, 200), &config));
    }

    #[test]
    fn test_single_event() {
        let (config, _) = config_for(&[EventKey::new(7, 1)]).unwrap();
        assert_eq!(config.event_id_1, 7);
        assert_eq!(config.event_id_2, 7);
        assert!(config_for(&[]).is_none());
    }
}
