use super::Error;
use std::io::Read;

/// A bounded cursor over an in-memory byte view.
///
/// All primitive decoding goes through this type. Reads never run past the
/// end of the view; a short read fails with [`Error::UnexpectedEof`].
///
/// Variable-width integers are decoded with `leb128`, byte-limited to the
/// maximum width the format admits (5 bytes for 32-bit values, 10 for
/// 64-bit). Together with the range conversion afterwards this enforces the
/// WebAssembly encoding rules: unused high-order bits of the final byte must
/// be zero for unsigned values and a sign extension of the final payload bit
/// for signed ones.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn ensure_remaining(&self, n: usize) -> Result<(), Error> {
        if self.remaining() < n {
            return Err(Error::UnexpectedEof);
        }
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8, Error> {
        self.ensure_remaining(1)?;
        let byte = self.bytes[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    pub fn peek_byte(&self) -> Result<u8, Error> {
        self.ensure_remaining(1)?;
        Ok(self.bytes[self.pos])
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        self.ensure_remaining(n)?;
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), Error> {
        self.ensure_remaining(n)?;
        self.pos += n;
        Ok(())
    }

    /// Fixed-width little-endian `u32`, used for the version field.
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let bytes = self.read_bytes(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf))
    }

    fn read_var_unsigned(&mut self, max_bytes: u64, what: &'static str) -> Result<u64, Error> {
        let mut input = &self.bytes[self.pos..];
        let len_before = input.len();
        let value = {
            let mut limited = (&mut input).take(max_bytes);
            leb128::read::unsigned(&mut limited).map_err(|err| match err {
                leb128::read::Error::Overflow => Error::InvalidVarint(what),
                // Hitting the byte limit mid-value is an encoding error, not
                // short input, when enough bytes were available.
                leb128::read::Error::IoError(_) if len_before >= max_bytes as usize => {
                    Error::InvalidVarint(what)
                }
                leb128::read::Error::IoError(_) => Error::UnexpectedEof,
            })?
        };
        self.pos += len_before - input.len();
        Ok(value)
    }

    fn read_var_signed(&mut self, max_bytes: u64, what: &'static str) -> Result<i64, Error> {
        let mut input = &self.bytes[self.pos..];
        let len_before = input.len();
        let value = {
            let mut limited = (&mut input).take(max_bytes);
            leb128::read::signed(&mut limited).map_err(|err| match err {
                leb128::read::Error::Overflow => Error::InvalidVarint(what),
                leb128::read::Error::IoError(_) if len_before >= max_bytes as usize => {
                    Error::InvalidVarint(what)
                }
                leb128::read::Error::IoError(_) => Error::UnexpectedEof,
            })?
        };
        self.pos += len_before - input.len();
        Ok(value)
    }

    pub fn read_var_u32(&mut self) -> Result<u32, Error> {
        let raw = self.read_var_unsigned(5, "varuint32")?;
        u32::try_from(raw).map_err(|_| Error::InvalidVarint("varuint32"))
    }

    pub fn read_var_u64(&mut self) -> Result<u64, Error> {
        self.read_var_unsigned(10, "varuint64")
    }

    pub fn read_var_i32(&mut self) -> Result<i32, Error> {
        let raw = self.read_var_signed(5, "varint32")?;
        i32::try_from(raw).map_err(|_| Error::InvalidVarint("varint32"))
    }

    pub fn read_var_i64(&mut self) -> Result<i64, Error> {
        self.read_var_signed(10, "varint64")
    }

    /// Raw little-endian bit pattern of an `f32` immediate.
    pub fn read_f32_bits(&mut self) -> Result<u32, Error> {
        let bytes = self.read_bytes(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf))
    }

    /// Raw little-endian bit pattern of an `f64` immediate.
    pub fn read_f64_bits(&mut self) -> Result<u64, Error> {
        let bytes = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Length-prefixed UTF-8 name.
    pub fn read_string(&mut self) -> Result<String, Error> {
        let len = self.read_var_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8)
    }

    /// A vector in the wasm sense: a `varuint32` length followed by that many
    /// elements parsed by `parse_element`.
    pub fn read_vec<T>(
        &mut self,
        mut parse_element: impl FnMut(&mut Reader<'a>) -> Result<T, Error>,
    ) -> Result<Vec<T>, Error> {
        let len = self.read_var_u32()? as usize;
        // Cap preallocation so a bogus length can't balloon memory before the
        // element parsers run into the end of input.
        let mut out = Vec::with_capacity(len.min(Self::MAX_PREALLOCATED));
        for _ in 0..len {
            out.push(parse_element(self)?);
        }
        Ok(out)
    }

    const MAX_PREALLOCATED: usize = 1024;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn reader(bytes: &[u8]) -> Reader {
        Reader::new(bytes)
    }

    #[test]
    fn fixed_reads() {
        let mut r = reader(&[0x01, 0x00, 0x00, 0x00, 0xAA]);
        assert_eq!(r.read_u32().unwrap(), 1);
        assert_eq!(r.read_byte().unwrap(), 0xAA);
        assert!(r.is_at_end());
        assert_matches!(r.read_byte(), Err(Error::UnexpectedEof));
    }

    #[test]
    fn leb_u32_roundtrip() {
        for value in [0u32, 1, 127, 128, 624485, u32::MAX] {
            let mut buf = Vec::new();
            leb128::write::unsigned(&mut buf, value as u64).unwrap();
            assert_eq!(reader(&buf).read_var_u32().unwrap(), value);
        }
    }

    #[test]
    fn leb_i64_roundtrip() {
        for value in [0i64, -1, 127, -128, i64::MIN, i64::MAX] {
            let mut buf = Vec::new();
            leb128::write::signed(&mut buf, value).unwrap();
            assert_eq!(reader(&buf).read_var_i64().unwrap(), value);
        }
    }

    #[test]
    fn leb_u32_rejects_set_bits_past_width() {
        // Five bytes whose final byte carries payload above bit 31.
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0x1F];
        assert_matches!(reader(&bytes).read_var_u32(), Err(Error::InvalidVarint(_)));
    }

    #[test]
    fn leb_u32_rejects_too_long_encoding() {
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x80, 0x00];
        assert_matches!(reader(&bytes).read_var_u32(), Err(Error::InvalidVarint(_)));
    }

    #[test]
    fn leb_u32_accepts_padded_zero() {
        // Non-shortest but legal: high bits of the final byte are zero.
        let bytes = [0x80, 0x00];
        assert_eq!(reader(&bytes).read_var_u32().unwrap(), 0);
    }

    #[test]
    fn leb_i32_accepts_sign_extended_padding() {
        // -1 written in five bytes; the final byte sign-extends bit 31.
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        assert_eq!(reader(&bytes).read_var_i32().unwrap(), -1);
    }

    #[test]
    fn leb_i32_rejects_bad_padding() {
        // Final byte neither zero- nor sign-extends the payload.
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0x0F];
        assert_matches!(reader(&bytes).read_var_i32(), Err(Error::InvalidVarint(_)));
    }

    #[test]
    fn leb_u64_rejects_set_bits_past_width() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        assert_matches!(reader(&bytes).read_var_u64(), Err(Error::InvalidVarint(_)));
    }

    #[test]
    fn leb_truncated_input() {
        let bytes = [0x80, 0x80];
        assert_matches!(reader(&bytes).read_var_u32(), Err(Error::UnexpectedEof));
    }

    #[test]
    fn string_utf8_validation() {
        let bytes = [0x02, 0xFF, 0xFE];
        assert_matches!(reader(&bytes).read_string(), Err(Error::InvalidUtf8));
        let bytes = [0x02, b'h', b'i'];
        assert_eq!(reader(&bytes).read_string().unwrap(), "hi");
    }
}
