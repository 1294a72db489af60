//! TLV8 codec used by the pairing handshake.
//!
//! ## Wire format
//!
//! ```text
//! type:   u8   (1)
//! length: u8   (1)
//! value:  [u8] (length bytes)
//! ```
//!
//! Values longer than 255 bytes are carried as consecutive records of the
//! same type. [`Tlv8`] hides that: [`Tlv8::push`] fragments and
//! [`Tlv8::get`] reassembles.

use std::fmt;

use crate::error::MiraError;

/// Largest value a single record can carry.
pub const MAX_RECORD_VALUE: usize = 255;

// ── TlvType ──────────────────────────────────────────────────────

/// Record types used by pair-setup and pair-verify.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlvType {
    Method = 0x00,
    Identifier = 0x01,
    Salt = 0x02,
    PublicKey = 0x03,
    Proof = 0x04,
    EncryptedData = 0x05,
    State = 0x06,
    Error = 0x07,
    RetryDelay = 0x08,
    Signature = 0x0A,
    Flags = 0x13,
    Separator = 0xFF,
}

impl TryFrom<u8> for TlvType {
    type Error = MiraError;

    fn try_from(value: u8) -> Result<Self, MiraError> {
        match value {
            0x00 => Ok(TlvType::Method),
            0x01 => Ok(TlvType::Identifier),
            0x02 => Ok(TlvType::Salt),
            0x03 => Ok(TlvType::PublicKey),
            0x04 => Ok(TlvType::Proof),
            0x05 => Ok(TlvType::EncryptedData),
            0x06 => Ok(TlvType::State),
            0x07 => Ok(TlvType::Error),
            0x08 => Ok(TlvType::RetryDelay),
            0x0A => Ok(TlvType::Signature),
            0x13 => Ok(TlvType::Flags),
            0xFF => Ok(TlvType::Separator),
            _ => Err(MiraError::UnknownVariant {
                type_name: "TlvType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for TlvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Raw codec ────────────────────────────────────────────────────

/// Decode every complete record in `bytes`.
///
/// Stops at the first record that does not fit in the remaining input
/// and returns what was parsed so far. Truncation is not an error.
pub fn decode(bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut records = Vec::new();
    let mut offset = 0;

    while bytes.len() - offset >= 2 {
        let kind = bytes[offset];
        let len = bytes[offset + 1] as usize;
        let start = offset + 2;
        if bytes.len() - start < len {
            break;
        }
        records.push((kind, bytes[start..start + len].to_vec()));
        offset = start + len;
    }

    records
}

/// Encode records in order.
///
/// Every value must already fit in a single record; use [`Tlv8::push`]
/// to fragment longer values.
pub fn encode(records: &[(u8, Vec<u8>)]) -> Result<Vec<u8>, MiraError> {
    let total: usize = records.iter().map(|(_, v)| v.len() + 2).sum();
    let mut out = Vec::with_capacity(total);

    for (kind, value) in records {
        if value.len() > MAX_RECORD_VALUE {
            return Err(MiraError::ValueTooLarge {
                size: value.len(),
                max: MAX_RECORD_VALUE,
            });
        }
        out.push(*kind);
        out.push(value.len() as u8);
        out.extend_from_slice(value);
    }

    Ok(out)
}

// ── Tlv8 ─────────────────────────────────────────────────────────

/// An ordered TLV8 message with fragmentation handled on both ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tlv8 {
    records: Vec<(u8, Vec<u8>)>,
}

impl Tlv8 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a message, merging adjacent same-type fragments.
    pub fn parse(bytes: &[u8]) -> Self {
        let mut records: Vec<(u8, Vec<u8>)> = Vec::new();

        for (kind, value) in decode(bytes) {
            match records.last_mut() {
                Some((prev, acc)) if *prev == kind => acc.extend_from_slice(&value),
                _ => records.push((kind, value)),
            }
        }

        Self { records }
    }

    /// Append a logical value. [`Tlv8::to_bytes`] splits it into
    /// 255-byte fragments.
    pub fn push(&mut self, kind: TlvType, value: &[u8]) -> &mut Self {
        self.records.push((kind as u8, value.to_vec()));
        self
    }

    /// Convenience builder for single-byte values such as `State`.
    pub fn with_byte(mut self, kind: TlvType, value: u8) -> Self {
        self.push(kind, &[value]);
        self
    }

    /// Convenience builder for arbitrary values.
    pub fn with(mut self, kind: TlvType, value: &[u8]) -> Self {
        self.push(kind, value);
        self
    }

    /// The first logical value of `kind`, if present.
    pub fn get(&self, kind: TlvType) -> Option<&[u8]> {
        self.records
            .iter()
            .find(|(k, _)| *k == kind as u8)
            .map(|(_, v)| v.as_slice())
    }

    /// The first byte of the value of `kind`, if present.
    pub fn get_byte(&self, kind: TlvType) -> Option<u8> {
        self.get(kind).and_then(|v| v.first().copied())
    }

    pub fn contains(&self, kind: TlvType) -> bool {
        self.get(kind).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize, fragmenting values longer than one record.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut fragments = Vec::with_capacity(self.records.len());
        for (kind, value) in &self.records {
            if value.is_empty() {
                fragments.push((*kind, Vec::new()));
                continue;
            }
            for chunk in value.chunks(MAX_RECORD_VALUE) {
                fragments.push((*kind, chunk.to_vec()));
            }
        }
        // Fragments are at most MAX_RECORD_VALUE long by construction.
        encode(&fragments).unwrap_or_default()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<(u8, Vec<u8>)> {
        vec![
            (TlvType::State as u8, vec![1]),
            (TlvType::PublicKey as u8, vec![0xAB; 32]),
            (TlvType::Method as u8, vec![]),
            (TlvType::Salt as u8, vec![7; 16]),
        ]
    }

    #[test]
    fn roundtrip_preserves_order() {
        let records = sample();
        let bytes = encode(&records).unwrap();
        assert_eq!(decode(&bytes), records);
    }

    #[test]
    fn decode_every_prefix_yields_complete_records_only() {
        let records = sample();
        let bytes = encode(&records).unwrap();

        // Record boundaries: 3, 37, 39, 57.
        let mut boundaries = vec![0usize];
        for (_, v) in &records {
            boundaries.push(boundaries.last().unwrap() + 2 + v.len());
        }

        for cut in 0..=bytes.len() {
            let parsed = decode(&bytes[..cut]);
            let expected = boundaries.iter().filter(|&&b| b > 0 && b <= cut).count();
            assert_eq!(parsed.len(), expected, "prefix of {cut} bytes");
            assert_eq!(parsed[..], records[..expected]);
        }
    }

    #[test]
    fn encode_rejects_oversized_value() {
        let err = encode(&[(TlvType::PublicKey as u8, vec![0; 256])]).unwrap_err();
        assert!(matches!(err, MiraError::ValueTooLarge { size: 256, .. }));
    }

    #[test]
    fn long_value_fragments_and_reassembles() {
        let key: Vec<u8> = (0..384u32).map(|i| i as u8).collect();
        let msg = Tlv8::new()
            .with_byte(TlvType::State, 2)
            .with(TlvType::PublicKey, &key)
            .with(TlvType::Salt, &[9; 16]);

        let bytes = msg.to_bytes();
        let raw = decode(&bytes);
        assert_eq!(raw.len(), 4);
        assert_eq!(raw[1].1.len(), 255);
        assert_eq!(raw[2].1.len(), 129);

        let parsed = Tlv8::parse(&bytes);
        assert_eq!(parsed.get(TlvType::PublicKey).unwrap(), key.as_slice());
        assert_eq!(parsed.get_byte(TlvType::State), Some(2));
        assert_eq!(parsed.get(TlvType::Salt).unwrap(), &[9; 16]);
    }

    #[test]
    fn exact_fragment_boundary() {
        let value = vec![0x5A; 510];
        let bytes = Tlv8::new().with(TlvType::EncryptedData, &value).to_bytes();
        assert_eq!(bytes.len(), 514);
        let parsed = Tlv8::parse(&bytes);
        assert_eq!(parsed.get(TlvType::EncryptedData).unwrap().len(), 510);
    }

    #[test]
    fn only_adjacent_records_are_merged() {
        let bytes = encode(&[
            (TlvType::Identifier as u8, b"ab".to_vec()),
            (TlvType::Identifier as u8, b"cd".to_vec()),
            (TlvType::State as u8, vec![3]),
            (TlvType::Identifier as u8, b"zz".to_vec()),
        ])
        .unwrap();
        let parsed = Tlv8::parse(&bytes);
        assert_eq!(parsed.get(TlvType::Identifier).unwrap(), b"abcd");
        assert_eq!(parsed.get_byte(TlvType::State), Some(3));
    }

    #[test]
    fn tlv_type_conversion() {
        assert_eq!(TlvType::try_from(0x06).unwrap(), TlvType::State);
        assert_eq!(TlvType::try_from(0x07).unwrap(), TlvType::Error);
        assert!(matches!(
            TlvType::try_from(0x42),
            Err(MiraError::UnknownVariant { .. })
        ));
    }
}
