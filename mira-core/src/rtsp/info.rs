//! The `GET /info` body and the advertised capability bitmask.

use bitflags::bitflags;
use plist::{Dictionary, Value};

use crate::error::MiraError;
use crate::identity::DeviceIdentity;

pub const BINARY_PLIST: &str = "application/x-apple-binary-plist";

/// Protocol version reported under `vv`.
pub const PROTOCOL_VERSION: u64 = 2;

bitflags! {
    /// Advertised receiver capabilities.
    ///
    /// Unnamed bits are carried through unchanged so a configured mask
    /// round-trips exactly.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u64 {
        const VIDEO                 = 1 << 0;
        const PHOTO                 = 1 << 1;
        const VIDEO_FAIRPLAY        = 1 << 2;
        const VIDEO_VOLUME_CONTROL  = 1 << 3;
        const VIDEO_HTTP_LIVE       = 1 << 4;
        const SLIDESHOW             = 1 << 5;
        const SCREEN                = 1 << 7;
        const SCREEN_ROTATE         = 1 << 8;
        const AUDIO                 = 1 << 9;
        const AUDIO_REDUNDANT       = 1 << 11;
        const FPSAP_V2_5            = 1 << 12;
        const PHOTO_CACHING         = 1 << 13;
        const AUTHENTICATION_4      = 1 << 14;
        const METADATA_ARTWORK      = 1 << 15;
        const METADATA_PROGRESS     = 1 << 16;
        const METADATA_TEXT         = 1 << 17;
        const AUDIO_FORMAT_1        = 1 << 18;
        const AUDIO_FORMAT_2        = 1 << 19;
        const AUDIO_FORMAT_3        = 1 << 20;
        const AUDIO_FORMAT_4        = 1 << 21;
        const AUTHENTICATION_1      = 1 << 23;
        const UNIFIED_ADVERTISER    = 1 << 26;
        const LEGACY_PAIRING        = 1 << 27;
        const RAOP                  = 1 << 30;

        const _ = !0;
    }
}

impl Features {
    /// Capability set of a screen-mirroring receiver.
    pub const RECEIVER: Features = Features::from_bits_retain(0x1E_5A7F_FFF7);

    /// `"0x<low 32 bits>,0x<high 32 bits>"`, the form used in
    /// presence records.
    pub fn to_advertised(self) -> String {
        let bits = self.bits();
        format!("{:#X},{:#X}", bits & 0xFFFF_FFFF, bits >> 32)
    }

    /// Parse either a plain integer (decimal or `0x` hex) or the
    /// advertised `low,high` pair.
    pub fn parse(s: &str) -> Result<Self, MiraError> {
        fn number(s: &str) -> Result<u64, MiraError> {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.map_err(|_| MiraError::Other(format!("invalid feature mask: {s}")))
        }

        let bits = match s.split_once(',') {
            Some((low, high)) => (number(high)? << 32) | (number(low)? & 0xFFFF_FFFF),
            None => number(s)?,
        };
        Ok(Features::from_bits_retain(bits))
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::RECEIVER
    }
}

// ── DeviceInfo ───────────────────────────────────────────────────

/// Everything reported by `GET /info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub features: Features,
    pub model: String,
    pub instance_id: String,
    pub public_key: [u8; 32],
    pub source_version: String,
}

impl DeviceInfo {
    pub fn from_identity(
        identity: &DeviceIdentity,
        features: Features,
        model: &str,
        source_version: &str,
    ) -> Result<Self, MiraError> {
        Ok(Self {
            device_id: identity.device_id().to_string(),
            features,
            model: model.to_string(),
            instance_id: identity.instance_id()?,
            public_key: identity.public_key()?.to_bytes(),
            source_version: source_version.to_string(),
        })
    }

    pub fn to_dictionary(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("deviceid".into(), Value::String(self.device_id.clone()));
        dict.insert("features".into(), Value::from(self.features.bits()));
        dict.insert("model".into(), Value::String(self.model.clone()));
        dict.insert("pi".into(), Value::String(self.instance_id.clone()));
        dict.insert("pk".into(), Value::Data(self.public_key.to_vec()));
        dict.insert("srcvers".into(), Value::String(self.source_version.clone()));
        dict.insert("vv".into(), Value::from(PROTOCOL_VERSION));
        dict
    }

    /// Binary property-list encoding.
    pub fn to_plist(&self) -> Result<Vec<u8>, MiraError> {
        let mut out = Vec::new();
        plist::to_writer_binary(&mut out, &Value::Dictionary(self.to_dictionary()))?;
        Ok(out)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn advertised_form_splits_words() {
        assert_eq!(Features::RECEIVER.to_advertised(), "0x5A7FFFF7,0x1E");
        assert!(Features::RECEIVER.contains(Features::SCREEN | Features::VIDEO));
    }

    #[test]
    fn parse_accepts_all_forms() {
        assert_eq!(Features::parse("0x5A7FFFF7,0x1E").unwrap(), Features::RECEIVER);
        assert_eq!(Features::parse("0x1E5A7FFFF7").unwrap(), Features::RECEIVER);
        assert_eq!(Features::parse("129").unwrap().bits(), 129);
        assert!(Features::parse("0xZZ").is_err());
    }

    #[test]
    fn plist_carries_identity_fields() {
        let identity = DeviceIdentity::with_device_id(
            Arc::new(MemoryStore::new()),
            "02:11:22:33:44:55".into(),
        );
        let info =
            DeviceInfo::from_identity(&identity, Features::RECEIVER, "AppleTV3,2", "220.68")
                .unwrap();
        let bytes = info.to_plist().unwrap();
        assert!(bytes.starts_with(b"bplist00"));

        let Value::Dictionary(dict) = plist::from_bytes::<Value>(&bytes).unwrap() else {
            panic!("expected dictionary");
        };
        assert_eq!(
            dict.get("deviceid").and_then(Value::as_string),
            Some("02:11:22:33:44:55")
        );
        assert_eq!(
            dict.get("features").and_then(Value::as_unsigned_integer),
            Some(Features::RECEIVER.bits())
        );
        assert_eq!(dict.get("model").and_then(Value::as_string), Some("AppleTV3,2"));
        assert_eq!(dict.get("srcvers").and_then(Value::as_string), Some("220.68"));
        assert_eq!(dict.get("vv").and_then(Value::as_unsigned_integer), Some(2));
        assert_eq!(
            dict.get("pi").and_then(Value::as_string),
            Some(identity.instance_id().unwrap().as_str())
        );
        assert_eq!(
            dict.get("pk").and_then(Value::as_data),
            Some(&identity.public_key().unwrap().to_bytes()[..])
        );
    }
}
