//! Wire format of the values stored in memcached
//!
//! Each record is stored as a proto2 `UserApps` message:
//!
//! ```text
//! message UserApps {
//!     repeated uint32 apps = 1;
//!     optional double lat = 2;
//!     optional double lon = 3;
//! }
//! ```
//!
//! `apps` uses the unpacked proto2 encoding so values written here stay
//! readable by existing consumers of the key space.

use crate::error::{CodecError, Result};
use prost::Message;

/// Installed applications and location for one device
#[derive(Clone, PartialEq, Message)]
pub struct UserApps {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub apps: Vec<u32>,

    #[prost(double, optional, tag = "2")]
    pub lat: Option<f64>,

    #[prost(double, optional, tag = "3")]
    pub lon: Option<f64>,
}

impl UserApps {
    pub fn new(apps: Vec<u32>, lat: f64, lon: f64) -> Self {
        Self {
            apps,
            lat: Some(lat),
            lon: Some(lon),
        }
    }
}

impl std::fmt::Display for UserApps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for app in &self.apps {
            write!(f, "apps: {} ", app)?;
        }
        write!(
            f,
            "lat: {} lon: {}",
            self.lat.unwrap_or_default(),
            self.lon.unwrap_or_default()
        )
    }
}

/// Serialize a value into its protobuf bytes
pub fn encode(value: &UserApps) -> Vec<u8> {
    value.encode_to_vec()
}

/// Deserialize protobuf bytes produced by [`encode`]
pub fn decode(bytes: &[u8]) -> Result<UserApps> {
    Ok(UserApps::decode(bytes)?)
}

/// Encode and decode `value`, failing on the first field that differs
pub fn verify_round_trip(value: &UserApps) -> Result<UserApps> {
    let unpacked = decode(&encode(value))?;

    if unpacked.lat != value.lat {
        return Err(CodecError::mismatch("lat", value.lat, unpacked.lat));
    }
    if unpacked.lon != value.lon {
        return Err(CodecError::mismatch("lon", value.lon, unpacked.lon));
    }
    if unpacked.apps != value.apps {
        return Err(CodecError::mismatch("apps", &value.apps, &unpacked.apps));
    }

    Ok(unpacked)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip_sample() {
        let value = UserApps::new(vec![1423, 43, 567, 3, 7, 23], 55.55, 42.42);
        let unpacked = verify_round_trip(&value).unwrap();
        assert_eq!(unpacked.apps, vec![1423, 43, 567, 3, 7, 23]);
        assert_eq!(unpacked.lat, Some(55.55));
        assert_eq!(unpacked.lon, Some(42.42));
    }

    #[test]
    fn test_apps_use_unpacked_encoding() {
        let bytes = encode(&UserApps {
            apps: vec![1, 2],
            lat: None,
            lon: None,
        });
        // field 1, wire type varint, once per element
        assert_eq!(bytes, vec![0x08, 0x01, 0x08, 0x02]);
    }

    #[test]
    fn test_empty_apps_round_trip() {
        let value = UserApps::new(Vec::new(), -12.5, 0.0);
        assert_eq!(verify_round_trip(&value).unwrap(), value);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode(&[0xff, 0xff, 0xff]), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_display() {
        let value = UserApps::new(vec![7423, 424], 55.55, 42.42);
        assert_eq!(value.to_string(), "apps: 7423 apps: 424 lat: 55.55 lon: 42.42");
    }

    proptest! {
        #[test]
        fn prop_round_trip_is_exact(
            apps in proptest::collection::vec(any::<u32>(), 0..64),
            lat in -90.0f64..90.0,
            lon in -180.0f64..180.0,
        ) {
            let value = UserApps::new(apps, lat, lon);
            let unpacked = decode(&encode(&value)).unwrap();
            prop_assert_eq!(unpacked.apps, value.apps);
            prop_assert_eq!(unpacked.lat.map(f64::to_bits), value.lat.map(f64::to_bits));
            prop_assert_eq!(unpacked.lon.map(f64::to_bits), value.lon.map(f64::to_bits));
        }
    }
}
