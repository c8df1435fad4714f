//! G3 bridge wire (de)serialization helpers
//!
//! # Note
//! G3 frames use big-endian fields and bit-packed headers whose layout is fixed by the standard,
//! so we can't rely on postcard or other convenience libraries for serde functionality.
use crate::Error;

/// Serialization tool for writing fixed-layout frames.
pub struct Serializer<'s> {
    output: &'s mut [u8],
    index: usize,
}

impl<'s> Serializer<'s> {
    /// Construct a new serializer into `output`.
    pub fn new(output: &'s mut [u8]) -> Self {
        Self { output, index: 0 }
    }

    /// Serialize data into the serialization buffer.
    ///
    /// # Args
    /// * `data` - The data to serialize.
    pub fn serialize_data(&mut self, data: &[u8]) -> Result<(), Error> {
        let remainder = &mut self.output[self.index..];
        if remainder.len() >= data.len() {
            let (head, _) = remainder.split_at_mut(data.len());
            head.copy_from_slice(data);
            self.index += data.len();
            Ok(())
        } else {
            Err(Error::Bounds)
        }
    }

    /// Serialize a byte of data.
    pub fn serialize_u8(&mut self, value: u8) -> Result<(), Error> {
        self.serialize_data(&[value])
    }

    /// Serialize 16-bit integer.
    pub fn serialize_u16(&mut self, value: u16) -> Result<(), Error> {
        self.serialize_data(&value.to_be_bytes())
    }

    /// Reserve `len` bytes to be filled in by another encoder.
    ///
    /// # Returns
    /// The reserved region.
    pub fn reserve(&mut self, len: usize) -> Result<&mut [u8], Error> {
        if self.output.len() - self.index < len {
            return Err(Error::Bounds);
        }

        let start = self.index;
        self.index += len;
        Ok(&mut self.output[start..start + len])
    }

    /// The unused tail of the output buffer.
    pub fn remainder(&mut self) -> &mut [u8] {
        &mut self.output[self.index..]
    }

    /// Mark `len` bytes of the remainder as written.
    pub fn advance(&mut self, len: usize) -> Result<(), Error> {
        if self.output.len() - self.index < len {
            return Err(Error::Bounds);
        }
        self.index += len;
        Ok(())
    }

    /// Finish the serialization process.
    ///
    /// # Returns
    /// The number of bytes written.
    pub fn finish(self) -> usize {
        self.index
    }
}

/// Utility for deserializing fixed-layout frames from raw data.
pub struct Deserializer<'de> {
    input: &'de [u8],
}

impl<'de> Deserializer<'de> {
    /// Construct a deserializer from the provided `input` data.
    pub fn new(input: &'de [u8]) -> Self {
        Self { input }
    }

    pub fn try_take(&mut self, count: usize) -> Result<&'de [u8], Error> {
        if self.input.len() >= count {
            let (head, tail) = self.input.split_at(count);
            self.input = tail;
            Ok(head)
        } else {
            Err(Error::Invalid)
        }
    }

    /// Deserialize a single byte from the serialized data.
    pub fn deserialize_u8(&mut self) -> Result<u8, Error> {
        Ok(self.try_take(1)?[0])
    }

    /// Deserialize a 16-bit integer from the serialized data.
    pub fn deserialize_u16(&mut self) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.try_take(2)?);
        Ok(u16::from_be_bytes(buf))
    }

    /// Deserialize a fixed-size array.
    pub fn deserialize_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.try_take(N)?);
        Ok(buf)
    }

    /// Take all of the remaining data.
    pub fn remainder(&mut self) -> &'de [u8] {
        core::mem::take(&mut self.input)
    }

    /// Check if all data has been consumed.
    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_big_endian() {
        let mut buf = [0u8; 5];
        let mut serializer = Serializer::new(&mut buf);
        serializer.serialize_u8(0xA5).unwrap();
        serializer.serialize_u16(0x1234).unwrap();
        serializer.reserve(2).unwrap().copy_from_slice(&[7, 8]);
        assert_eq!(serializer.serialize_u8(0), Err(Error::Bounds));
        assert_eq!(serializer.finish(), 5);
        assert_eq!(buf, [0xA5, 0x12, 0x34, 7, 8]);

        let mut deserializer = Deserializer::new(&buf);
        assert_eq!(deserializer.deserialize_u8(), Ok(0xA5));
        assert_eq!(deserializer.deserialize_u16(), Ok(0x1234));
        assert_eq!(deserializer.deserialize_array::<2>(), Ok([7, 8]));
        assert!(deserializer.is_empty());
        assert_eq!(deserializer.deserialize_u8(), Err(Error::Invalid));
    }
}
