//! Heart Rate Profile
//!
//! GATT identifiers of the standard Heart Rate service. Payload decoding
//! lives in [`crate::domain::heart_rate`].

use uuid::Uuid;

/// Bluetooth base UUID; 16-bit assigned numbers occupy bits 96..112
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Heart Rate Service (0x180D)
pub const HEART_RATE_SERVICE: Uuid = from_short(0x180D);

/// Heart Rate Measurement characteristic (0x2A37), notify only
pub const HEART_RATE_MEASUREMENT: Uuid = from_short(0x2A37);

/// Expand a 16-bit assigned number onto the Bluetooth base UUID
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Whether an advertisement lists the Heart Rate service
pub fn advertises_heart_rate<'a>(services: impl IntoIterator<Item = &'a Uuid>) -> bool {
    services.into_iter().any(|uuid| *uuid == HEART_RATE_SERVICE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuids_expand() {
        assert_eq!(
            HEART_RATE_SERVICE.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            HEART_RATE_MEASUREMENT.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_advertisement_filter() {
        let battery = from_short(0x180F);
        assert!(advertises_heart_rate(&[battery, HEART_RATE_SERVICE]));
        assert!(!advertises_heart_rate(&[battery]));
        assert!(!advertises_heart_rate(&Vec::<Uuid>::new()));
    }
}
