//! Construction options for the transfer supervisor.

use balance::{Strategy, Target};
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;

/// Default TCP listen port.
pub const DEFAULT_PORT: u16 = 1080;

/// Default health-check cadence, milliseconds (5 minutes).
pub const DEFAULT_HEARTBEAT_MS: u64 = 300_000;

/// Lowest accepted heartbeat entry. The floor is applied to the raw value
/// exactly as supplied; entries are milliseconds everywhere else.
pub const HEARTBEAT_FLOOR: u64 = 5;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_address() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

/// Health-check cadence: a single period, or a schedule whose prefix runs as
/// one-shot warm-up delays before the last entry repeats indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Heartbeat {
    Single(u64),
    Schedule(Vec<u64>),
}

impl Default for Heartbeat {
    fn default() -> Self {
        Heartbeat::Single(DEFAULT_HEARTBEAT_MS)
    }
}

impl Heartbeat {
    /// Flatten into the delay sequence the supervisor walks.
    pub fn schedule(&self) -> Vec<u64> {
        match self {
            Heartbeat::Single(value) => vec![*value],
            Heartbeat::Schedule(values) => values.clone(),
        }
    }

    /// Reject empty schedules and entries under the floor.
    pub fn validate(&self) -> Result<()> {
        let schedule = self.schedule();
        if schedule.is_empty() {
            return Err(Error::heartbeat("heartbeat schedule must not be empty"));
        }
        for value in &schedule {
            if *value < HEARTBEAT_FLOOR {
                return Err(Error::heartbeat(format!(
                    "heartbeat must be a number no less than 5, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Options accepted at supervisor construction.
///
/// Unknown keys are rejected when deserialized from configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferOptions {
    /// TCP listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// TCP bind address.
    #[serde(default = "default_address")]
    pub address: IpAddr,

    /// Outbound-dial host for target connections.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// Balancing strategy.
    #[serde(default)]
    pub strategy: Strategy,

    /// Initial target set.
    pub targets: Vec<Target>,

    /// Health-check cadence.
    #[serde(default)]
    pub heartbeat: Heartbeat,
}

impl TransferOptions {
    /// Options with every default and the given target set.
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            port: default_port(),
            address: default_address(),
            bind: default_bind(),
            strategy: Strategy::default(),
            targets,
            heartbeat: Heartbeat::default(),
        }
    }

    /// Validate the heartbeat and the initial target set.
    pub fn validate(&self) -> Result<()> {
        self.heartbeat.validate()?;

        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.id) {
                return Err(Error::config(format!(
                    "duplicate target id {} in initial target set",
                    target.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TransferOptions::new(vec![Target::new(1081)]);
        assert_eq!(options.port, 1080);
        assert_eq!(options.address, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(options.bind, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(options.strategy, Strategy::Polling);
        assert_eq!(options.heartbeat, Heartbeat::Single(300_000));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let yaml = r#"
targets:
  - id: 1081
turbo: true
"#;
        assert!(serde_yaml::from_str::<TransferOptions>(yaml).is_err());
    }

    #[test]
    fn test_heartbeat_accepts_number_or_sequence() {
        let yaml = r#"
targets:
  - id: 1081
heartbeat: 30000
"#;
        let options: TransferOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.heartbeat.schedule(), vec![30_000]);

        let yaml = r#"
targets:
  - id: 1081
heartbeat: [1000, 2000, 5000]
"#;
        let options: TransferOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.heartbeat.schedule(), vec![1000, 2000, 5000]);
    }

    #[test]
    fn test_heartbeat_floor_applies_to_raw_value() {
        assert!(Heartbeat::Single(5).validate().is_ok());
        assert!(Heartbeat::Single(4).validate().is_err());
        assert!(Heartbeat::Schedule(vec![1000, 4]).validate().is_err());
        assert!(Heartbeat::Schedule(vec![]).validate().is_err());
    }

    #[test]
    fn test_duplicate_target_ids_rejected() {
        let options = TransferOptions::new(vec![Target::new(1081), Target::new(1081)]);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_strategy_wire_tags() {
        let yaml = r#"
targets:
  - id: 1081
strategy: MINIMUM_CONNECTION
"#;
        let options: TransferOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.strategy, Strategy::MinimumConnection);
    }
}
