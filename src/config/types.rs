use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{
    CONFIG_SERVICE_UUID, CONFIG_VALUE_CHARACTERISTIC_UUID, DEFAULT_SCAN_TARGET, DEFAULT_SLOT_COUNT,
    OPERATION_TIMEOUT, PRIMING_BYTE, SETTLE_DELAY,
};
use crate::device::types::TargetCharacteristic;
use crate::error::ValidationError;

/// One labelled percentage, e.g. `A=20`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValue {
    pub label: String,
    pub value: i32,
}

impl ConfigValue {
    pub fn new(label: &str, value: i32) -> Self {
        ConfigValue {
            label: label.to_string(),
            value,
        }
    }

    pub fn placeholder() -> Self {
        ConfigValue::new("", 0)
    }
}

impl FromStr for ConfigValue {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ValidationError::Malformed { input: s.to_string() };
        let (label, value) = s.split_once('=').ok_or_else(malformed)?;
        let value = value.trim().parse::<i32>().map_err(|_| malformed())?;
        Ok(ConfigValue::new(label.trim(), value))
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}%", self.label, self.value)
    }
}

/// Parses `"A=20,B=30,C=50"`.
pub fn parse_value_list(input: &str) -> Result<Vec<ConfigValue>, ValidationError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ConfigValue::from_str)
        .collect()
}

/// Checks that the values are non-negative and add up to exactly 100, reporting the first
/// offending value. A total that stays below 100 is blamed on the last value.
pub fn validate_values(values: &[ConfigValue]) -> Result<(), ValidationError> {
    let mut total: i32 = 0;

    for (index, config_value) in values.iter().enumerate() {
        if config_value.value < 0 {
            return Err(ValidationError::Negative { index, value: config_value.value });
        }

        total = total.saturating_add(config_value.value);
        if total > 100 {
            return Err(ValidationError::OverHundred { index, total });
        }
    }

    if total < 100 {
        return Err(ValidationError::UnderHundred { index: values.len().saturating_sub(1), total });
    }

    Ok(())
}

/// Appends zero-value placeholders until there are `slot_count` values.
pub fn pad_values(mut values: Vec<ConfigValue>, slot_count: usize) -> Vec<ConfigValue> {
    while values.len() < slot_count {
        values.push(ConfigValue::placeholder());
    }
    values
}

/// Wire contract with the peripheral. The defaults are what the peripheral firmware expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub settle_delay_ms: u64,
    pub operation_timeout_ms: u64,
    pub priming_byte: u8,
}

impl ProtocolConfig {
    pub fn target(&self) -> TargetCharacteristic {
        TargetCharacteristic {
            service: self.service_uuid,
            characteristic: self.characteristic_uuid,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            service_uuid: CONFIG_SERVICE_UUID,
            characteristic_uuid: CONFIG_VALUE_CHARACTERISTIC_UUID,
            settle_delay_ms: SETTLE_DELAY,
            operation_timeout_ms: OPERATION_TIMEOUT,
            priming_byte: PRIMING_BYTE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    // "<name> <address>" of the peripheral to scan for
    pub target: String,
    // address of the peripheral the last configuration was written to
    pub address: Option<String>,
    pub slot_count: usize,
    pub values: Vec<ConfigValue>,
    pub protocol: ProtocolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target: String::from(DEFAULT_SCAN_TARGET),
            address: None,
            slot_count: DEFAULT_SLOT_COUNT,
            values: Vec::new(),
            protocol: ProtocolConfig::default(),
        }
    }
}
