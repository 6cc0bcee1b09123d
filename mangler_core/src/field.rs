use crate::bits::Bits;
use std::fmt;
use thiserror::Error;

/// Errors produced by field construction and value conversion.
///
/// Value setters are total on well-typed input; anything else is reported as
/// an [`FieldError::Input`] and never panics.
#[derive(Error, Debug)]
pub enum FieldError {
    /// The supplied value cannot be represented by this field kind.
    #[error("bad input for {kind} field '{name}': {reason}")]
    Input {
        name: String,
        kind: String,
        reason: String,
    },

    /// A declared length is not valid for the field kind
    /// (e.g. an octetstring whose bit length is not a whole number of bytes).
    #[error("invalid length {length_bits} bits for {kind} field '{name}'")]
    Length {
        name: String,
        kind: String,
        length_bits: usize,
    },

    /// A get was attempted with a conversion the field kind does not define.
    #[error("field '{name}' of kind {kind} does not support {operation}")]
    Conversion {
        name: String,
        kind: String,
        operation: &'static str,
    },
}

/// Byte order applied when a field or container is wider than one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

/// Whether a field's content always fills its declared width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthType {
    Fixed,
    Variable,
}

/// The closed set of built-in field kinds, plus user-registered tags.
///
/// The tag string is the key into the mutation registries; registering a
/// custom kind means constructing fields with `FieldKind::Custom` and
/// inserting a capability under the same tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Unsigned,
    Signed,
    Str,
    HexStr,
    OctetStr,
    BitStr,
    Custom(String),
}

impl FieldKind {
    pub fn tag(&self) -> &str {
        match self {
            FieldKind::Unsigned => "unsigned",
            FieldKind::Signed => "signed",
            FieldKind::Str => "string",
            FieldKind::HexStr => "hexstring",
            FieldKind::OctetStr => "octetstring",
            FieldKind::BitStr => "bitstring",
            FieldKind::Custom(tag) => tag,
        }
    }

    fn default_length_type(&self) -> LengthType {
        match self {
            FieldKind::Str | FieldKind::HexStr => LengthType::Variable,
            _ => LengthType::Fixed,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A named, typed bit string of declared width.
///
/// Fixed-length fields always hold exactly `length_bits` bits; variable
/// fields hold at most that many, in whole bytes. Multi-byte integer kinds
/// apply their endianness at value-conversion time, so the stored bits are
/// already in wire order and serialization is plain concatenation.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    kind: FieldKind,
    length_bits: usize,
    length_type: LengthType,
    endianness: Endianness,
    bits: Bits,
    description: String,
}

impl Field {
    pub fn new(
        name: &str,
        kind: FieldKind,
        length_bits: usize,
        endianness: Endianness,
    ) -> Result<Self, FieldError> {
        if matches!(kind, FieldKind::OctetStr) && length_bits % 8 != 0 {
            return Err(FieldError::Length {
                name: name.to_string(),
                kind: kind.tag().to_string(),
                length_bits,
            });
        }
        let length_type = kind.default_length_type();
        let bits = match length_type {
            LengthType::Fixed => Bits::from_uint(0, length_bits),
            LengthType::Variable => Bits::new(),
        };
        Ok(Field {
            name: name.to_string(),
            kind,
            length_bits,
            length_type,
            endianness,
            bits,
            description: String::new(),
        })
    }

    /// Constructs a field of a user-registered kind with an explicit
    /// length type; value conversion for custom kinds goes through
    /// [`Field::set_raw`] only.
    pub fn custom(
        name: &str,
        tag: &str,
        length_bits: usize,
        length_type: LengthType,
        endianness: Endianness,
    ) -> Self {
        let bits = match length_type {
            LengthType::Fixed => Bits::from_uint(0, length_bits),
            LengthType::Variable => Bits::new(),
        };
        Field {
            name: name.to_string(),
            kind: FieldKind::Custom(tag.to_string()),
            length_bits,
            length_type,
            endianness,
            bits,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn length_bits(&self) -> usize {
        self.length_bits
    }

    pub fn length_type(&self) -> LengthType {
        self.length_type
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn bits(&self) -> &Bits {
        &self.bits
    }

    fn input_error(&self, reason: String) -> FieldError {
        FieldError::Input {
            name: self.name.clone(),
            kind: self.kind.tag().to_string(),
            reason,
        }
    }

    /// True when integer conversion byte-swaps the stored content.
    fn swaps_bytes(&self) -> bool {
        matches!(self.kind, FieldKind::Unsigned | FieldKind::Signed)
            && self.endianness == Endianness::Little
            && self.length_bits > 8
            && self.length_bits % 8 == 0
    }

    /// Sets an integer value, accepting negatives as two's complement of the
    /// declared width. Valid for the `unsigned` and `signed` kinds.
    pub fn set_int(&mut self, value: i128) -> Result<(), FieldError> {
        if !matches!(self.kind, FieldKind::Unsigned | FieldKind::Signed) {
            return Err(self.input_error(format!("integer value {value} not accepted")));
        }
        if self.length_bits == 0 || self.length_bits > 128 {
            return Err(self.input_error(format!(
                "integer conversion undefined for width {}",
                self.length_bits
            )));
        }
        let unsigned = value as u128;
        let mut bits = Bits::from_uint(unsigned, self.length_bits);
        if self.swaps_bytes() {
            bits = bits.swap_bytes();
        }
        self.bits = bits;
        Ok(())
    }

    /// Returns the unsigned interpretation of the stored bits.
    pub fn get_uint(&self) -> Result<u128, FieldError> {
        let bits = if self.swaps_bytes() {
            self.bits.swap_bytes()
        } else {
            self.bits.clone()
        };
        bits.to_uint().ok_or_else(|| FieldError::Conversion {
            name: self.name.clone(),
            kind: self.kind.tag().to_string(),
            operation: "integer conversion above 128 bits",
        })
    }

    /// Returns the signed interpretation; the sign bit is the leftmost bit
    /// of the stored (byte-order-corrected) bit string.
    pub fn get_int(&self) -> Result<i128, FieldError> {
        let raw = self.get_uint()?;
        let width = self.length_bits as u32;
        if width == 0 || width >= 128 {
            return Ok(raw as i128);
        }
        let sign = 1u128 << (width - 1);
        if raw & sign != 0 {
            Ok((raw as i128) - (1i128 << width))
        } else {
            Ok(raw as i128)
        }
    }

    /// Sets raw byte content. Valid for the `string` kind.
    pub fn set_bytes(&mut self, value: &[u8]) -> Result<(), FieldError> {
        if !matches!(self.kind, FieldKind::Str) {
            return Err(self.input_error("raw byte value not accepted".to_string()));
        }
        if value.len() * 8 > self.length_bits {
            return Err(self.input_error(format!(
                "{} bytes exceed the declared maximum of {} bits",
                value.len(),
                self.length_bits
            )));
        }
        self.bits = Bits::from_bytes(value);
        Ok(())
    }

    /// Sets hexadecimal text (`"0x"` prefix optional, odd digit counts are
    /// left-padded). Valid for the `hexstring` kind.
    pub fn set_hex_text(&mut self, text: &str) -> Result<(), FieldError> {
        if !matches!(self.kind, FieldKind::HexStr) {
            return Err(self.input_error("hex text not accepted".to_string()));
        }
        let trimmed = text.strip_prefix("0x").unwrap_or(text);
        let padded = if trimmed.len() % 2 == 1 {
            format!("0{trimmed}")
        } else {
            trimmed.to_string()
        };
        let bytes = hex::decode(&padded)
            .map_err(|e| self.input_error(format!("not hexadecimal text: {e}")))?;
        if bytes.len() * 8 > self.length_bits {
            return Err(self.input_error(format!(
                "{} hex bytes exceed the declared maximum of {} bits",
                bytes.len(),
                self.length_bits
            )));
        }
        self.bits = Bits::from_bytes(&bytes);
        Ok(())
    }

    /// Sets an integer for the `hexstring` kind, stored as its minimal
    /// big-endian byte representation.
    pub fn set_hex_uint(&mut self, value: u128) -> Result<(), FieldError> {
        if !matches!(self.kind, FieldKind::HexStr) {
            return Err(self.input_error(format!("hex integer {value} not accepted")));
        }
        let mut bytes = value.to_be_bytes().to_vec();
        while bytes.len() > 1 && bytes[0] == 0 {
            bytes.remove(0);
        }
        if bytes.len() * 8 > self.length_bits {
            return Err(self.input_error(format!(
                "{value:#x} exceeds the declared maximum of {} bits",
                self.length_bits
            )));
        }
        self.bits = Bits::from_bytes(&bytes);
        Ok(())
    }

    /// Returns the content as lowercase hexadecimal text.
    pub fn get_hex(&self) -> String {
        hex::encode(self.bits.to_bytes())
    }

    /// Sets dotted-octet text such as `"1.2.3.4"`; the octet count must
    /// match the declared width exactly. Valid for the `octetstring` kind.
    pub fn set_octets(&mut self, text: &str) -> Result<(), FieldError> {
        if !matches!(self.kind, FieldKind::OctetStr) {
            return Err(self.input_error("dotted-octet text not accepted".to_string()));
        }
        let expected = self.length_bits / 8;
        let mut octets = Vec::with_capacity(expected);
        for part in text.split('.') {
            let octet: u8 = part
                .parse()
                .map_err(|_| self.input_error(format!("octet '{part}' is not in [0,255]")))?;
            octets.push(octet);
        }
        if octets.len() != expected {
            return Err(self.input_error(format!(
                "expected {expected} octets, got {}",
                octets.len()
            )));
        }
        self.bits = Bits::from_bytes(&octets);
        Ok(())
    }

    /// Returns the content as dotted-octet text.
    pub fn get_octets(&self) -> String {
        let octets: Vec<String> = self
            .bits
            .to_bytes()
            .iter()
            .map(|o| o.to_string())
            .collect();
        octets.join(".")
    }

    /// Sets literal `0`/`1` text; the length must match the declared width.
    /// Valid for the `bitstring` kind.
    pub fn set_bit_text(&mut self, text: &str) -> Result<(), FieldError> {
        if !matches!(self.kind, FieldKind::BitStr) {
            return Err(self.input_error("bit text not accepted".to_string()));
        }
        let bits = Bits::from_text(text)
            .ok_or_else(|| self.input_error("text contains non-binary symbols".to_string()))?;
        if bits.len() != self.length_bits {
            return Err(self.input_error(format!(
                "expected exactly {} bits, got {}",
                self.length_bits,
                bits.len()
            )));
        }
        self.bits = bits;
        Ok(())
    }

    /// Overwrites the raw bit content, used by the fuzzer's replace phase.
    ///
    /// Fixed-width fields keep their declared width: longer input is
    /// left-truncated to the last `length_bits` bits, shorter input is
    /// left-padded with zeros. Variable fields clamp to the largest
    /// byte-aligned length within the declared maximum.
    pub fn set_raw(&mut self, bits: Bits) {
        match self.length_type {
            LengthType::Fixed => {
                self.bits = bits.truncate_left(self.length_bits);
            }
            LengthType::Variable => {
                let max = self.length_bits.min(bits.len());
                let aligned = max - (max % 8);
                self.bits = bits.truncate_left(aligned.min(bits.len()));
            }
        }
    }

    /// Restores previously captured bit content exactly, bypassing the
    /// clamping of [`Field::set_raw`]. Used by the fuzz driver to undo a
    /// mutation.
    pub fn overwrite_bits(&mut self, bits: Bits) {
        self.bits = bits;
    }

    /// The stored content packed to bytes, padded right to a byte boundary.
    pub fn encode(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    /// Consumes this field's worth of bits from `cursor`, advancing it.
    pub(crate) fn consume(&mut self, source: &Bits, cursor: &mut usize) {
        let take = match self.length_type {
            LengthType::Fixed => self.length_bits,
            LengthType::Variable => {
                let remaining = source.len().saturating_sub(*cursor);
                let clamped = remaining.min(self.length_bits);
                clamped - (clamped % 8)
            }
        };
        let mut taken = source.slice(*cursor, *cursor + take);
        if self.length_type == LengthType::Fixed && taken.len() < self.length_bits {
            taken = taken.truncate_left(self.length_bits);
        }
        self.bits = taken;
        *cursor += take;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_unsigned_encodes_byte_swapped() {
        let mut field = Field::new("port", FieldKind::Unsigned, 16, Endianness::Little).unwrap();
        field.set_int(0x1234).unwrap();
        assert_eq!(field.encode(), vec![0x34, 0x12]);
        assert_eq!(field.get_uint().unwrap(), 0x1234);
    }

    #[test]
    fn unsigned_get_is_value_mod_2_pow_len() {
        for width in [1usize, 4, 8, 12, 16, 24, 32] {
            let lo = -(1i128 << (width - 1));
            let hi = (1i128 << width) - 1;
            let modulus = 1i128 << width;
            for value in [lo, lo + 1, -1, 0, 1, hi - 1, hi] {
                let mut field =
                    Field::new("v", FieldKind::Unsigned, width, Endianness::Big).unwrap();
                field.set_int(value).unwrap();
                let expected = value.rem_euclid(modulus) as u128;
                assert_eq!(
                    field.get_uint().unwrap(),
                    expected,
                    "width {width} value {value}"
                );
            }
        }
    }

    #[test]
    fn signed_round_trip_preserves_sign() {
        let mut field = Field::new("delta", FieldKind::Signed, 8, Endianness::Big).unwrap();
        field.set_int(-5).unwrap();
        assert_eq!(field.get_int().unwrap(), -5);
        assert_eq!(field.get_uint().unwrap(), 0xFB);
    }

    #[test]
    fn octetstring_accepts_exact_octet_count_only() {
        let mut field = Field::new("addr", FieldKind::OctetStr, 32, Endianness::Big).unwrap();
        field.set_octets("1.2.3.4").unwrap();
        assert_eq!(field.encode(), vec![1, 2, 3, 4]);
        assert_eq!(field.get_octets(), "1.2.3.4");

        let err = field.set_octets("1.2.3").unwrap_err();
        assert!(matches!(err, FieldError::Input { .. }));
        let err = field.set_octets("1.2.3.999").unwrap_err();
        assert!(matches!(err, FieldError::Input { .. }));
    }

    #[test]
    fn octetstring_requires_whole_bytes() {
        let err = Field::new("addr", FieldKind::OctetStr, 12, Endianness::Big).unwrap_err();
        assert!(matches!(err, FieldError::Length { .. }));
    }

    #[test]
    fn hexstring_accepts_text_and_integers() {
        let mut field = Field::new("cookie", FieldKind::HexStr, 64, Endianness::Big).unwrap();
        field.set_hex_text("0xDEADbeef").unwrap();
        assert_eq!(field.get_hex(), "deadbeef");

        field.set_hex_text("abc").unwrap();
        assert_eq!(field.get_hex(), "0abc");

        field.set_hex_uint(0x1234).unwrap();
        assert_eq!(field.get_hex(), "1234");

        assert!(field.set_hex_text("zz").is_err());
    }

    #[test]
    fn string_field_rejects_overlong_content() {
        let mut field = Field::new("body", FieldKind::Str, 32, Endianness::Big).unwrap();
        field.set_bytes(b"abcd").unwrap();
        assert_eq!(field.encode(), b"abcd");
        assert!(field.set_bytes(b"abcde").is_err());
    }

    #[test]
    fn bitstring_requires_exact_width() {
        let mut field = Field::new("flags", FieldKind::BitStr, 3, Endianness::Big).unwrap();
        field.set_bit_text("101").unwrap();
        assert_eq!(field.bits().to_string(), "101");
        assert!(field.set_bit_text("10").is_err());
        assert!(field.set_bit_text("abc").is_err());
    }

    #[test]
    fn set_raw_left_truncates_fixed_fields() {
        let mut field = Field::new("op", FieldKind::Unsigned, 8, Endianness::Big).unwrap();
        field.set_raw(Bits::from_uint(0x1FF, 9));
        assert_eq!(field.get_uint().unwrap(), 0xFF);
        assert_eq!(field.bits().len(), 8);

        field.set_raw(Bits::from_uint(0b1, 1));
        assert_eq!(field.bits().len(), 8);
        assert_eq!(field.get_uint().unwrap(), 1);
    }

    #[test]
    fn kind_mismatch_is_an_input_error() {
        let mut field = Field::new("n", FieldKind::Unsigned, 8, Endianness::Big).unwrap();
        assert!(matches!(
            field.set_octets("1.2.3.4"),
            Err(FieldError::Input { .. })
        ));
        assert!(matches!(
            field.set_bytes(b"x"),
            Err(FieldError::Input { .. })
        ));
    }
}
