//! Configuration surface consumed by the engine.
//!
//! The engine does not parse or validate configuration files; a host
//! deserializes these structures (JSON, YAML, whatever it likes) and hands
//! them over when building devices and channels.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::format::RegisterFormat;

/// Ordering of 16-bit words inside a multi-word channel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// Word order matches address order (first register holds the most
    /// significant word).
    #[default]
    BigEndian,

    /// 16-bit words are reversed across the full channel width.
    LittleEndian,
}

/// Query generation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPolicy {
    /// Merge aggressively: adjacent groups coalesce while protocol and
    /// device limits allow, holes included.
    #[default]
    Minify,

    /// Merge only groups with identical block sets. The same memory block
    /// may then be transported by more than one query per cycle.
    NoDuplicates,
}

/// Per-device tuning consumed by the planner and the cycle runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Largest run of unrequested registers a read query may transport.
    pub max_reg_hole: u32,

    /// Same as `max_reg_hole`, for single-bit register types.
    pub max_bit_hole: u32,

    /// Device-side cap on registers per read request; 0 means "protocol
    /// maximum".
    pub max_read_registers: u32,

    /// Pause between consecutive frames on the wire, in microseconds.
    pub guard_interval_us: u64,

    /// Inter-byte timeout within one frame, in milliseconds.
    pub frame_timeout_ms: u64,

    /// Whole-transaction timeout, in milliseconds.
    pub device_timeout_ms: u64,

    /// Consecutive failed poll cycles before the device is considered
    /// disconnected.
    pub device_max_fail_cycles: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            max_reg_hole: 0,
            max_bit_hole: 0,
            max_read_registers: 0,
            guard_interval_us: 0,
            frame_timeout_ms: 20,
            device_timeout_ms: 3000,
            device_max_fail_cycles: 2,
        }
    }
}

/// Declarative shape of one channel (virtual register).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Channel name, unique within the device.
    pub name: String,

    /// Protocol-local register type index.
    pub reg_type: u32,

    /// Address of the first memory block.
    pub address: u32,

    /// Value format.
    #[serde(default)]
    pub format: RegisterFormat,

    /// Bit offset of the value relative to the first block, MSB-first.
    #[serde(default)]
    pub bit_offset: u16,

    /// Bit width; defaults to the format's width.
    #[serde(default)]
    pub bit_width: Option<u16>,

    /// Multiplier applied on read (`display = raw * scale + offset`).
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Additive offset applied on read.
    #[serde(default)]
    pub offset: f64,

    /// Rounding step for the displayed value; 0 disables rounding.
    #[serde(default)]
    pub round_to: f64,

    /// Word order for multi-word values.
    #[serde(default)]
    pub word_order: WordOrder,

    /// Reject writes to this channel.
    #[serde(default)]
    pub channel_readonly: bool,

    /// Switch semantics: this raw value publishes as "1", everything else
    /// as "0".
    #[serde(default)]
    pub on_value: Option<u64>,

    /// Raw value the device uses to signal "no data"; matching reads raise
    /// a read error instead of updating the value.
    #[serde(default)]
    pub error_value: Option<u64>,

    /// Desired period between consecutive reads, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_scale() -> f64 {
    1.0
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl ChannelSettings {
    /// Minimal settings: everything defaulted except identity and placement.
    pub fn new(name: impl Into<String>, reg_type: u32, address: u32) -> Self {
        Self {
            name: name.into(),
            reg_type,
            address,
            format: RegisterFormat::default(),
            bit_offset: 0,
            bit_width: None,
            scale: 1.0,
            offset: 0.0,
            round_to: 0.0,
            word_order: WordOrder::default(),
            channel_readonly: false,
            on_value: None,
            error_value: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    /// Set the value format.
    #[must_use]
    pub fn with_format(mut self, format: RegisterFormat) -> Self {
        self.format = format;
        self
    }

    /// Set bit offset and width.
    #[must_use]
    pub fn with_bits(mut self, bit_offset: u16, bit_width: u16) -> Self {
        self.bit_offset = bit_offset;
        self.bit_width = Some(bit_width);
        self
    }

    /// Set the scaling parameters.
    #[must_use]
    pub fn with_scaling(mut self, scale: f64, offset: f64, round_to: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self.round_to = round_to;
        self
    }

    /// Set the word order.
    #[must_use]
    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }

    /// Mark the channel read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.channel_readonly = true;
        self
    }

    /// Set the error value.
    #[must_use]
    pub fn with_error_value(mut self, error_value: u64) -> Self {
        self.error_value = Some(error_value);
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Effective bit width of the channel.
    pub fn width(&self) -> u16 {
        self.bit_width.unwrap_or_else(|| self.format.bit_width())
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_settings_defaults() {
        let settings = DeviceSettings::default();
        assert_eq!(settings.max_reg_hole, 0);
        assert_eq!(settings.max_read_registers, 0);
        assert_eq!(settings.device_max_fail_cycles, 2);
    }

    #[test]
    fn test_channel_settings_from_json() {
        let json = r#"{
            "name": "voltage",
            "reg_type": 2,
            "address": 100,
            "format": "s32",
            "scale": 0.01,
            "word_order": "little_endian",
            "poll_interval_ms": 500
        }"#;

        let settings: ChannelSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.name, "voltage");
        assert_eq!(settings.format, RegisterFormat::S32);
        assert_eq!(settings.width(), 32);
        assert_eq!(settings.word_order, WordOrder::LittleEndian);
        assert_eq!(settings.poll_interval(), Duration::from_millis(500));
        assert!(!settings.channel_readonly);
        assert_eq!(settings.scale, 0.01);
    }

    #[test]
    fn test_channel_settings_builder() {
        let settings = ChannelSettings::new("relay", 0, 7)
            .with_bits(0, 1)
            .read_only()
            .with_poll_interval_ms(100);

        assert_eq!(settings.width(), 1);
        assert!(settings.channel_readonly);
        assert_eq!(settings.poll_interval_ms, 100);
    }
}
