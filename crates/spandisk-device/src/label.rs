//! Opaque on-disk label
//!
//! One block of the logical device (block 1, leaving block 0 alone)
//! carries a small magic-tagged, checksummed record describing the
//! configuration. The record is treated opaquely: spandisk persists and
//! validates it but attaches no meaning beyond its own fields. A fresh
//! device has no label; a synthesized one stands in until something is
//! written.

use crate::error::{DeviceError, DeviceResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use spandisk_common::{BLOCK_SIZE, DeviceFlags};
use uuid::Uuid;

/// Logical block the label lives at
pub const LABEL_BLOCK: u64 = 1;

/// Label magic: "SPDL"
pub const LABEL_MAGIC: u32 = 0x5350_444c;

/// Current label format version
pub const LABEL_VERSION: u32 = 1;

/// The on-disk label record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLabel {
    magic: u32,
    version: u32,
    /// Stable identity, minted when the label is first created
    pub uuid: Uuid,
    /// Device name, e.g. `span0`
    pub name: String,
    /// Logical size in blocks
    pub size_blocks: u64,
    /// Interleave unit in blocks
    pub interleave: u64,
    /// Writes are mirrored
    pub mirrored: bool,
    /// Components truncated to uniform size
    pub uniform: bool,
    /// crc32c over the record serialized with this field zeroed
    checksum: u32,
}

impl DiskLabel {
    /// Fake up a label for a device that has none on disk
    #[must_use]
    pub fn synthesize(name: &str, size_blocks: u64, interleave: u64, flags: DeviceFlags) -> Self {
        let mut label = Self {
            magic: LABEL_MAGIC,
            version: LABEL_VERSION,
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            size_blocks,
            interleave,
            mirrored: flags.mirrored,
            uniform: flags.uniform,
            checksum: 0,
        };
        label.checksum = label.compute_checksum();
        label
    }

    fn compute_checksum(&self) -> u32 {
        let mut unsummed = self.clone();
        unsummed.checksum = 0;
        let encoded = bincode::serialize(&unsummed).unwrap_or_default();
        crc32c::crc32c(&encoded)
    }

    /// Check magic, version, and checksum
    pub fn validate(&self) -> DeviceResult<()> {
        if self.magic != LABEL_MAGIC
            || self.version != LABEL_VERSION
            || self.checksum != self.compute_checksum()
        {
            return Err(DeviceError::LabelInvalid);
        }
        Ok(())
    }

    /// Serialize into one zero-padded block
    pub fn encode(&self) -> DeviceResult<Bytes> {
        let encoded = bincode::serialize(self)
            .map_err(|e| spandisk_common::Error::storage(format!("label encode: {e}")))?;
        if encoded.len() > BLOCK_SIZE as usize {
            return Err(spandisk_common::Error::storage(format!(
                "label of {} bytes exceeds one block",
                encoded.len()
            ))
            .into());
        }
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        block[..encoded.len()].copy_from_slice(&encoded);
        Ok(Bytes::from(block))
    }

    /// Deserialize and validate a label block
    pub fn decode(data: &[u8]) -> DeviceResult<Self> {
        let label: Self =
            bincode::deserialize(data).map_err(|_| DeviceError::LabelInvalid)?;
        label.validate()?;
        Ok(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DiskLabel {
        DiskLabel::synthesize(
            "span0",
            1024,
            8,
            DeviceFlags {
                mirrored: true,
                uniform: true,
            },
        )
    }

    #[test]
    fn test_synthesized_label_validates() {
        sample().validate().unwrap();
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let label = sample();
        let block = label.encode().unwrap();
        assert_eq!(block.len(), BLOCK_SIZE as usize);

        let decoded = DiskLabel::decode(&block).unwrap();
        assert_eq!(decoded, label);
    }

    #[test]
    fn test_corrupt_label_rejected() {
        let label = sample();
        let mut block = label.encode().unwrap().to_vec();

        // Flip a byte inside the record.
        block[12] ^= 0xff;
        assert!(matches!(
            DiskLabel::decode(&block),
            Err(DeviceError::LabelInvalid)
        ));
    }

    #[test]
    fn test_zero_block_is_no_label() {
        let block = vec![0u8; BLOCK_SIZE as usize];
        assert!(matches!(
            DiskLabel::decode(&block),
            Err(DeviceError::LabelInvalid)
        ));
    }

    #[test]
    fn test_tampered_fields_fail_checksum() {
        let mut label = sample();
        label.size_blocks = 4096;
        assert!(label.validate().is_err());
    }
}
