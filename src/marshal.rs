//! Codec for values moved into the passivated tier.
//!
//! # Format
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ MAGIC: [u8; 4] = "RSTR"                  │
//! │ VERSION: u32 (from MarshallingContext)   │
//! │ FLAGS: u32 (bit 0: LZ4 compressed)       │
//! │ PAYLOAD: bincode, possibly compressed    │
//! │ CRC32: u32 over header + payload         │
//! └──────────────────────────────────────────┘
//! ```

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// CRC-32 calculator (iSCSI polynomial)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Magic number of marshalled values.
pub const MAGIC: [u8; 4] = *b"RSTR";

/// Flag: payload is LZ4 compressed
pub const FLAG_COMPRESSED: u32 = 1 << 0;

const HEADER_SIZE: usize = 12;
const TRAILER_SIZE: usize = 4;

/// Converts values to and from their stored byte representation.
pub trait Marshaller<V>: Send + Sync {
    /// Encode a value.
    fn write(&self, value: &V) -> Result<Bytes>;

    /// Decode a value.
    fn read(&self, data: &[u8]) -> Result<V>;
}

/// External parameters of the stored representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshallingContext {
    /// Format version written into every value; reads reject other versions.
    pub version: u32,

    /// Whether payloads are LZ4 compressed.
    pub compress: bool,
}

impl Default for MarshallingContext {
    fn default() -> Self {
        Self {
            version: 1,
            compress: true,
        }
    }
}

impl MarshallingContext {
    /// Create a context for the given format version.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    /// Enable or disable compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

/// Bincode based marshaller with optional LZ4 compression and CRC32 integrity.
#[derive(Debug)]
pub struct BincodeMarshaller<V> {
    context: MarshallingContext,
    _marker: PhantomData<fn() -> V>,
}

impl<V> BincodeMarshaller<V> {
    /// Create a marshaller for the given context.
    pub fn new(context: MarshallingContext) -> Self {
        Self {
            context,
            _marker: PhantomData,
        }
    }

    /// The marshalling context.
    pub fn context(&self) -> MarshallingContext {
        self.context
    }
}

impl<V> Default for BincodeMarshaller<V> {
    fn default() -> Self {
        Self::new(MarshallingContext::default())
    }
}

impl<V> Marshaller<V> for BincodeMarshaller<V>
where
    V: Serialize + DeserializeOwned,
{
    fn write(&self, value: &V) -> Result<Bytes> {
        let encoded = bincode::serialize(value)?;
        let (flags, payload) = if self.context.compress {
            (FLAG_COMPRESSED, lz4_flex::compress_prepend_size(&encoded))
        } else {
            (0, encoded)
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
        buf.put_slice(&MAGIC);
        buf.put_u32(self.context.version);
        buf.put_u32(flags);
        buf.put_slice(&payload);
        let crc = CRC32.checksum(&buf);
        buf.put_u32(crc);

        Ok(buf.freeze())
    }

    fn read(&self, data: &[u8]) -> Result<V> {
        if data.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(Error::Marshalling(format!(
                "value too short: {} bytes",
                data.len()
            )));
        }

        let (body, trailer) = data.split_at(data.len() - TRAILER_SIZE);
        let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = CRC32.checksum(body);
        if expected != actual {
            return Err(Error::Marshalling(format!(
                "checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            )));
        }

        if body[0..4] != MAGIC {
            return Err(Error::Marshalling("invalid magic number".to_string()));
        }

        let version = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
        if version != self.context.version {
            return Err(Error::Marshalling(format!(
                "unsupported version {} (expected {})",
                version, self.context.version
            )));
        }

        let flags = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);
        let payload = &body[HEADER_SIZE..];

        if flags & FLAG_COMPRESSED != 0 {
            let decompressed = lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| Error::Marshalling(format!("decompression failed: {}", e)))?;
            Ok(bincode::deserialize(&decompressed)?)
        } else {
            Ok(bincode::deserialize(payload)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Cart {
        items: Vec<String>,
        total: u64,
    }

    fn cart() -> Cart {
        Cart {
            items: vec!["espresso".to_string(); 32],
            total: 96,
        }
    }

    #[test]
    fn test_compressed_value_is_readable() {
        let marshaller = BincodeMarshaller::<Cart>::default();
        let data = marshaller.write(&cart()).unwrap();

        assert_eq!(&data[0..4], &MAGIC);
        assert_eq!(marshaller.read(&data).unwrap(), cart());
    }

    #[test]
    fn test_corruption_detected() {
        let marshaller =
            BincodeMarshaller::<Cart>::new(MarshallingContext::new(1).with_compression(false));
        let mut data = marshaller.write(&cart()).unwrap().to_vec();
        let middle = data.len() / 2;
        data[middle] ^= 0xFF;

        let err = marshaller.read(&data).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let v1 = BincodeMarshaller::<Cart>::new(MarshallingContext::new(1));
        let v2 = BincodeMarshaller::<Cart>::new(MarshallingContext::new(2));

        let data = v1.write(&cart()).unwrap();
        let err = v2.read(&data).unwrap_err();
        assert!(err.to_string().contains("unsupported version 1"));
    }

    #[test]
    fn test_truncated_value_rejected() {
        let marshaller = BincodeMarshaller::<Cart>::default();
        assert!(marshaller.read(&[1, 2, 3]).is_err());
    }
}
