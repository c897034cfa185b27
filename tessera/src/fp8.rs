//! FP8 E4M3 scalar codec
//!
//! Layout: 1 sign bit, 4 exponent bits (bias 7), 3 mantissa bits. There is
//! no infinity; `0x7F`/`0xFF` encode NaN and the largest finite magnitude is
//! 448. Encoding saturates instead of overflowing.

use bytemuck::{Pod, Zeroable};

/// A single FP8 E4M3 value stored as its raw bit pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct F8E4M3(pub u8);

impl F8E4M3 {
    /// Largest finite magnitude.
    pub const MAX: f32 = 448.0;
    /// Smallest positive normal value (2^-6).
    pub const MIN_POSITIVE: f32 = 0.015_625;

    pub const ZERO: Self = Self(0);
    pub const NAN: Self = Self(0x7F);

    /// Encode an f32, rounding to nearest and saturating at ±448.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_f32(value: f32) -> Self {
        if value.is_nan() {
            return Self::NAN;
        }
        let sign: u8 = if value.is_sign_negative() { 0x80 } else { 0 };
        let abs = value.abs();
        if abs >= Self::MAX {
            return Self(sign | 0x7E);
        }
        if abs < Self::MIN_POSITIVE {
            // Subnormal: mantissa counts multiples of 2^-9. A result of 8
            // lands exactly on the smallest normal, whose bits are also 8.
            let m = (abs * 512.0).round() as u8;
            return Self(sign | m);
        }

        let mut exp = ((abs.to_bits() >> 23) & 0xFF) as i32 - 127;
        let frac = abs / 2f32.powi(exp);
        let mut mant = ((frac - 1.0) * 8.0).round() as u32;
        if mant == 8 {
            mant = 0;
            exp += 1;
        }
        let biased = exp + 7;
        if biased > 15 || (biased == 15 && mant == 7) {
            return Self(sign | 0x7E);
        }
        Self(sign | ((biased as u8) << 3) | mant as u8)
    }

    /// Decode to f32.
    #[must_use]
    pub fn to_f32(self) -> f32 {
        let sign = if self.0 & 0x80 != 0 { -1.0 } else { 1.0 };
        let exp = i32::from((self.0 >> 3) & 0x0F);
        let mant_bits = self.0 & 0x07;
        if exp == 15 && mant_bits == 7 {
            return f32::NAN;
        }
        let mant = f32::from(mant_bits);
        if exp == 0 {
            return sign * (mant / 8.0) * Self::MIN_POSITIVE;
        }
        sign * (1.0 + mant / 8.0) * 2f32.powi(exp - 7)
    }

    /// Raw bit pattern.
    #[must_use]
    pub const fn to_bits(self) -> u8 {
        self.0
    }
}

impl From<F8E4M3> for f32 {
    fn from(v: F8E4M3) -> Self {
        v.to_f32()
    }
}

/// Encode a slice of f32 values.
#[must_use]
pub fn encode_slice(values: &[f32]) -> Vec<F8E4M3> {
    values.iter().map(|&v| F8E4M3::from_f32(v)).collect()
}

/// Decode a slice of FP8 values.
#[must_use]
pub fn decode_slice(values: &[F8E4M3]) -> Vec<f32> {
    values.iter().map(|v| v.to_f32()).collect()
}
