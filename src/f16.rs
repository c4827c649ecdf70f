//! Bit-exact f32 <-> f16 truncating codec
//!
//! Half-precision transfer encoding used to shrink bandwidth for the f16
//! matmul variant. This is deliberately *not* a correctly-rounded IEEE
//! conversion: the lower 13 mantissa bits are truncated on encode, denormals
//! flush to signed zero in both directions, and half-range under/overflow is
//! left to the raw bit arithmetic. The exact bit behavior is part of the
//! transfer format and must not be "improved".

/// Encode an f32 into the 16-bit transfer encoding.
///
/// Classified by the 8-bit exponent field of the input:
/// - exponent `0x00` (zero/denormal): sign bit only,
/// - exponent `0xff` (inf/NaN): all-ones half exponent, with mantissa bit
///   `0x0200` forced for NaN payloads so NaN-ness survives the narrowing,
/// - otherwise: rebias the 13-bit-shifted exponent+mantissa field by
///   `0x1c000`, truncating the low mantissa bits.
pub fn encode16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    match (bits >> 23) & 0xff {
        0x00 => sign,
        0xff => {
            let nan = if bits & 0x007f_ffff != 0 { 0x0200 } else { 0 };
            sign | 0x7c00 | nan
        }
        _ => sign | ((((bits & 0x7fff_ffff) >> 13).wrapping_sub(0x1c000)) & 0x7fff) as u16,
    }
}

/// Decode the 16-bit transfer encoding back into an f32.
///
/// A zero half exponent field maps to exact signed zero (denormals-as-zero on
/// the way back in); an all-ones exponent widens to f32 infinity/NaN with the
/// mantissa payload realigned; anything else is rebuilt by aligning the
/// mantissa, sign, and rebiasing the exponent.
pub fn decode32(half: u16) -> f32 {
    let magnitude = (half & 0x7fff) as u32;
    let sign = ((half & 0x8000) as u32) << 16;
    let exponent = half & 0x7c00;

    let bits = if exponent == 0 {
        sign
    } else if exponent == 0x7c00 {
        sign | 0x7f80_0000 | ((magnitude & 0x03ff) << 13)
    } else {
        sign | (magnitude << 13).wrapping_add(0x3800_0000)
    };
    f32::from_bits(bits)
}

/// Encode a whole payload.
pub fn encode_slice(values: &[f32]) -> Vec<u16> {
    values.iter().copied().map(encode16).collect()
}

/// Decode a whole payload.
pub fn decode_slice(halves: &[u16]) -> Vec<f32> {
    halves.iter().copied().map(decode32).collect()
}
