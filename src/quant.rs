//! Narrow-format codecs for the quantized matmul operands.
//!
//! FP8 E4M3 comes in two flavours: `fn` (bias 7, max 448, NaN = S.1111.111)
//! and `fnuz` (bias 8, max 240, NaN = 0x80, no negative zero). INT8 values
//! are stored as their two's-complement byte.

use std::sync::OnceLock;

use crate::types::QuantFormat;

const E4M3_MANT_BITS: i32 = 3;

impl QuantFormat {
    fn exponent_bias(&self) -> i32 {
        match self {
            Self::Fp8E4m3Fn => 7,
            Self::Fp8E4m3Fnuz => 8,
            Self::Int8 => 0,
        }
    }

    /// Quantize one value, saturating to the format range.
    pub fn encode(&self, value: f32) -> u8 {
        match self {
            Self::Int8 => {
                let clamped = value.round().clamp(self.min_value(), self.max_value());
                (clamped as i8) as u8
            }
            Self::Fp8E4m3Fn | Self::Fp8E4m3Fnuz => encode_e4m3(value, *self),
        }
    }

    /// Decode one stored byte back to f32.
    #[inline(always)]
    pub fn decode(&self, byte: u8) -> f32 {
        decode_table(*self)[byte as usize]
    }
}

fn encode_e4m3(value: f32, format: QuantFormat) -> u8 {
    let fnuz = format == QuantFormat::Fp8E4m3Fnuz;
    if value.is_nan() {
        return if fnuz { 0x80 } else { 0x7F };
    }
    let sign: u8 = if value.is_sign_negative() { 0x80 } else { 0 };
    let zero = if fnuz { 0 } else { sign };
    let magnitude = value.abs().min(format.max_value());
    if magnitude == 0.0 || !magnitude.is_normal() {
        return zero;
    }

    let bias = format.exponent_bias();
    let min_exp = 1 - bias;
    let bits = magnitude.to_bits();
    let mut exp = (((bits >> 23) & 0xFF) as i32 - 127).max(min_exp);
    let step = 2f32.powi(exp - E4M3_MANT_BITS);
    let mut q = (magnitude / step).round() as u32;
    if q == 16 {
        q = 8;
        exp += 1;
    }
    if q == 0 {
        return zero;
    }
    let (exp_field, mant) = if q < 8 {
        (0u32, q)
    } else {
        ((exp + bias) as u32, q - 8)
    };
    sign | ((exp_field << 3) as u8) | (mant as u8)
}

fn decode_e4m3(byte: u8, format: QuantFormat) -> f32 {
    let fnuz = format == QuantFormat::Fp8E4m3Fnuz;
    if fnuz && byte == 0x80 {
        return f32::NAN;
    }
    if !fnuz && byte & 0x7F == 0x7F {
        return f32::NAN;
    }
    let sign = if byte & 0x80 != 0 { -1.0 } else { 1.0 };
    let exp = ((byte >> 3) & 0x0F) as i32;
    let mant = (byte & 0x07) as f32;
    let bias = format.exponent_bias();
    let magnitude = if exp == 0 {
        mant * 2f32.powi(1 - bias - E4M3_MANT_BITS)
    } else {
        (8.0 + mant) * 2f32.powi(exp - bias - E4M3_MANT_BITS)
    };
    sign * magnitude
}

fn decode_table(format: QuantFormat) -> &'static [f32; 256] {
    static FN: OnceLock<[f32; 256]> = OnceLock::new();
    static FNUZ: OnceLock<[f32; 256]> = OnceLock::new();
    static INT8: OnceLock<[f32; 256]> = OnceLock::new();

    let cell = match format {
        QuantFormat::Fp8E4m3Fn => &FN,
        QuantFormat::Fp8E4m3Fnuz => &FNUZ,
        QuantFormat::Int8 => &INT8,
    };
    cell.get_or_init(|| {
        let mut table = [0f32; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let byte = i as u8;
            *slot = match format {
                QuantFormat::Int8 => (byte as i8) as f32,
                fp8 => decode_e4m3(byte, fp8),
            };
        }
        table
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_e4m3fn_extremes() {
        let f = QuantFormat::Fp8E4m3Fn;
        assert_eq!(f.encode(448.0), 0x7E);
        assert_eq!(f.encode(1e6), 0x7E);
        assert_eq!(f.encode(-448.0), 0xFE);
        assert_eq!(f.decode(0x7E), 448.0);
        assert_eq!(f.encode(1.0), 0x38);
        assert_eq!(f.decode(0x38), 1.0);
        assert!(f.decode(0x7F).is_nan());
    }

    #[test]
    fn test_e4m3fnuz_extremes() {
        let f = QuantFormat::Fp8E4m3Fnuz;
        assert_eq!(f.encode(240.0), 0x7F);
        assert_eq!(f.decode(0x7F), 240.0);
        assert_eq!(f.encode(-0.0), 0);
        assert!(f.decode(0x80).is_nan());
        assert_eq!(f.encode(1.0), 0x40);
    }

    #[test]
    fn test_e4m3_subnormals() {
        let f = QuantFormat::Fp8E4m3Fn;
        // smallest subnormal is 2^-9
        let tiny = 2f32.powi(-9);
        assert_eq!(f.encode(tiny), 0x01);
        assert_eq!(f.decode(0x01), tiny);
        assert_eq!(f.encode(tiny / 4.0), 0);
    }

    #[test]
    fn test_e4m3_every_code_reencodes() {
        for format in [QuantFormat::Fp8E4m3Fn, QuantFormat::Fp8E4m3Fnuz] {
            for byte in 0u8..=255 {
                let v = format.decode(byte);
                if v.is_nan() || v == 0.0 {
                    continue;
                }
                assert_eq!(format.encode(v), byte, "{format:?} code {byte:#04x} value {v}");
            }
        }
    }

    #[test]
    fn test_int8_saturates() {
        let f = QuantFormat::Int8;
        assert_eq!(f.decode(f.encode(300.0)), 127.0);
        assert_eq!(f.decode(f.encode(-300.0)), -128.0);
        assert_eq!(f.decode(f.encode(-3.4)), -3.0);
    }
}
