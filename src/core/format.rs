//! Value formats and text conversion.
//!
//! A channel's 64-bit raw value is interpreted through a [`RegisterFormat`]
//! (sign, width, BCD, IEEE float, character), then post-processed with
//! `scale`/`offset`/`round_to` and the optional on-value mapping. This module
//! owns both directions: raw-to-text for publishing and text-to-raw for
//! writes.

use serde::{Deserialize, Serialize};

use crate::core::error::{EngineError, Result};

/// Interpretation of a channel's raw 64-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterFormat {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer (default).
    #[default]
    U16,
    /// Unsigned 24-bit integer.
    U24,
    /// Unsigned 32-bit integer.
    U32,
    /// Unsigned 64-bit integer.
    U64,
    /// Signed 8-bit integer.
    S8,
    /// Signed 16-bit integer.
    S16,
    /// Signed 24-bit integer.
    S24,
    /// Signed 32-bit integer.
    S32,
    /// Signed 64-bit integer.
    S64,
    /// Packed BCD, 2 digits.
    Bcd8,
    /// Packed BCD, 4 digits.
    Bcd16,
    /// Packed BCD, 6 digits.
    Bcd24,
    /// Packed BCD, 8 digits.
    Bcd32,
    /// IEEE-754 single precision.
    Float,
    /// IEEE-754 double precision.
    Double,
    /// Single 8-bit character.
    Char8,
}

impl RegisterFormat {
    /// Semantic width of the format in bits.
    pub fn bit_width(&self) -> u16 {
        match self {
            Self::U8 | Self::S8 | Self::Bcd8 | Self::Char8 => 8,
            Self::U16 | Self::S16 | Self::Bcd16 => 16,
            Self::U24 | Self::S24 | Self::Bcd24 => 24,
            Self::U32 | Self::S32 | Self::Bcd32 | Self::Float => 32,
            Self::U64 | Self::S64 | Self::Double => 64,
        }
    }

    /// Check whether the format sign-extends on decode.
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::S8 | Self::S16 | Self::S24 | Self::S32 | Self::S64)
    }
}

impl std::fmt::Display for RegisterFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U24 => "u24",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S24 => "s24",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::Bcd8 => "bcd8",
            Self::Bcd16 => "bcd16",
            Self::Bcd24 => "bcd24",
            Self::Bcd32 => "bcd32",
            Self::Float => "float",
            Self::Double => "double",
            Self::Char8 => "char8",
        };
        write!(f, "{}", s)
    }
}

/// Bit mask covering the low `width` bits.
pub fn bit_mask(width: u16) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Unpack packed-BCD digits into a decimal integer.
///
/// `width` is the packed width in bits; digits are read most significant
/// first.
pub fn bcd_to_int(packed: u64, width: u16) -> u64 {
    let nibbles = width / 4;
    let mut value = 0u64;
    for i in (0..nibbles).rev() {
        value = value * 10 + ((packed >> (4 * i)) & 0xF);
    }
    value
}

/// Pack a decimal integer into BCD nibbles of the given bit width.
///
/// Digits that do not fit are dropped from the most significant end.
pub fn int_to_bcd(mut value: u64, width: u16) -> u64 {
    let nibbles = width / 4;
    let mut packed = 0u64;
    for i in 0..nibbles {
        packed |= (value % 10) << (4 * i);
        value /= 10;
    }
    packed
}

/// Format a float the way `%.Ng` would: `precision` significant digits,
/// trailing zeros trimmed, scientific notation outside the usual range.
pub fn format_g(value: f64, precision: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }

    let exp = value.abs().log10().floor() as i32;
    if exp < -4 || exp >= precision as i32 {
        let digits = precision.saturating_sub(1);
        let s = format!("{:.*e}", digits, value);
        match s.split_once('e') {
            Some((mantissa, exponent)) => {
                let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
                format!("{}e{}", mantissa, exponent)
            }
            None => s,
        }
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, value);
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    }
}

/// Converts between a channel's raw wire value and its published text form.
///
/// Bundles the format with the scaling parameters so both directions share
/// one definition. The display rule is
/// `round((raw * scale + offset) / round_to) * round_to` whenever any of the
/// three parameters is non-trivial, the write path applies the inverse.
#[derive(Debug, Clone)]
pub struct ValueFormatter {
    format: RegisterFormat,
    scale: f64,
    offset: f64,
    round_to: f64,
    on_value: Option<u64>,
}

impl ValueFormatter {
    /// Create a formatter.
    pub fn new(
        format: RegisterFormat,
        scale: f64,
        offset: f64,
        round_to: f64,
        on_value: Option<u64>,
    ) -> Self {
        Self {
            format,
            scale: if scale == 0.0 { 1.0 } else { scale },
            offset,
            round_to,
            on_value,
        }
    }

    /// The wrapped format.
    pub fn format(&self) -> RegisterFormat {
        self.format
    }

    fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0 && self.round_to == 0.0
    }

    fn round_value(&self, value: f64) -> f64 {
        if self.round_to > 0.0 {
            (value / self.round_to).round() * self.round_to
        } else {
            value
        }
    }

    fn scaled_unsigned(&self, value: u64) -> String {
        if self.is_identity() {
            value.to_string()
        } else {
            format_g(self.round_value(self.scale * value as f64 + self.offset), 15)
        }
    }

    fn scaled_signed(&self, value: i64) -> String {
        if self.is_identity() {
            value.to_string()
        } else {
            format_g(self.round_value(self.scale * value as f64 + self.offset), 15)
        }
    }

    fn scaled_float(&self, value: f64, precision: usize) -> String {
        format_g(self.round_value(self.scale * value + self.offset), precision)
    }

    /// Render a raw wire value as published text.
    pub fn text_from_raw(&self, raw: u64) -> String {
        if let Some(on) = self.on_value {
            return if raw == on { "1" } else { "0" }.to_string();
        }

        let width = self.format.bit_width();
        let masked = raw & bit_mask(width);

        match self.format {
            RegisterFormat::U8
            | RegisterFormat::U16
            | RegisterFormat::U24
            | RegisterFormat::U32
            | RegisterFormat::U64 => self.scaled_unsigned(masked),
            RegisterFormat::S8 => self.scaled_signed(masked as u8 as i8 as i64),
            RegisterFormat::S16 => self.scaled_signed(masked as u16 as i16 as i64),
            RegisterFormat::S24 => {
                let mut v = masked as u32;
                if v & 0x80_0000 != 0 {
                    v |= 0xFF00_0000;
                }
                self.scaled_signed(v as i32 as i64)
            }
            RegisterFormat::S32 => self.scaled_signed(masked as u32 as i32 as i64),
            RegisterFormat::S64 => self.scaled_signed(masked as i64),
            RegisterFormat::Bcd8
            | RegisterFormat::Bcd16
            | RegisterFormat::Bcd24
            | RegisterFormat::Bcd32 => self.scaled_unsigned(bcd_to_int(masked, width)),
            RegisterFormat::Float => self.scaled_float(f32::from_bits(masked as u32) as f64, 7),
            RegisterFormat::Double => self.scaled_float(f64::from_bits(raw), 15),
            RegisterFormat::Char8 => char::from(masked as u8).to_string(),
        }
    }

    fn unsigned_from_text(&self, text: &str) -> Result<u64> {
        if self.scale == 1.0 && self.offset == 0.0 {
            text.trim()
                .parse::<u64>()
                .map_err(|_| EngineError::invalid_value(text, self.format.to_string()))
        } else {
            Ok(self.double_from_text(text)?.round() as i64 as u64)
        }
    }

    fn signed_from_text(&self, text: &str) -> Result<i64> {
        if self.scale == 1.0 && self.offset == 0.0 {
            text.trim()
                .parse::<i64>()
                .map_err(|_| EngineError::invalid_value(text, self.format.to_string()))
        } else {
            Ok(self.double_from_text(text)?.round() as i64)
        }
    }

    fn double_from_text(&self, text: &str) -> Result<f64> {
        let value = text
            .trim()
            .parse::<f64>()
            .map_err(|_| EngineError::invalid_value(text, self.format.to_string()))?;
        Ok((self.round_value(value) - self.offset) / self.scale)
    }

    /// Parse published text into a raw wire value.
    pub fn raw_from_text(&self, text: &str) -> Result<u64> {
        if let Some(on) = self.on_value {
            return Ok(if text.trim() == "1" { on } else { 0 });
        }

        let width = self.format.bit_width();
        let mask = bit_mask(width);

        match self.format {
            RegisterFormat::U8
            | RegisterFormat::U16
            | RegisterFormat::U24
            | RegisterFormat::U32
            | RegisterFormat::U64 => Ok(self.unsigned_from_text(text)? & mask),
            RegisterFormat::S8
            | RegisterFormat::S16
            | RegisterFormat::S24
            | RegisterFormat::S32
            | RegisterFormat::S64 => Ok(self.signed_from_text(text)? as u64 & mask),
            RegisterFormat::Bcd8
            | RegisterFormat::Bcd16
            | RegisterFormat::Bcd24
            | RegisterFormat::Bcd32 => {
                Ok(int_to_bcd(self.unsigned_from_text(text)?, width) & mask)
            }
            RegisterFormat::Float => {
                let value = self.double_from_text(text)? as f32;
                Ok(value.to_bits() as u64)
            }
            RegisterFormat::Double => Ok(self.double_from_text(text)?.to_bits()),
            RegisterFormat::Char8 => Ok(text.bytes().next().unwrap_or(0) as u64),
        }
    }
}
