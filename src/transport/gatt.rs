//! Standard-profile GATT UUIDs and the heart-rate measurement decoder.
//!
//! Only Bluetooth SIG assigned numbers live here; the strap vendor's private
//! measurement service is out of scope for this crate.

use uuid::Uuid;

use crate::types::HrSample;

// ── Services ─────────────────────────────────────────────────────────────────

/// Heart Rate service. Chest straps advertise this; auto-connect filters on
/// it by default.
pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Battery service.
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Device Information service.
pub const DEVICE_INFORMATION_SERVICE: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

// ── Characteristics ──────────────────────────────────────────────────────────

/// Heart Rate Measurement — notification-only, decoded by
/// [`parse_heart_rate`].
pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Battery Level — a single `u8` percentage, read once after connect.
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Device Information strings surfaced as `DeviceInfo` transport events,
/// with the keys used for each.
pub const DIS_STRINGS: [(Uuid, &str); 4] = [
    (
        Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb),
        "manufacturer",
    ),
    (
        Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb),
        "model",
    ),
    (
        Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb),
        "firmware",
    ),
    (
        Uuid::from_u128(0x00002a25_0000_1000_8000_00805f9b34fb),
        "serial",
    ),
];

// ── Heart Rate Measurement decoding ──────────────────────────────────────────

// Flag bits of the first payload byte.
const FLAG_BPM_U16: u8 = 1 << 0;
const FLAG_CONTACT_DETECTED: u8 = 1 << 1;
const FLAG_CONTACT_SUPPORTED: u8 = 1 << 2;
const FLAG_ENERGY_EXPENDED: u8 = 1 << 3;
const FLAG_RR_PRESENT: u8 = 1 << 4;

/// Decode one Heart Rate Measurement notification into an [`HrSample`].
///
/// Wire layout (all multi-byte values little-endian):
///
/// ```text
/// byte 0      : flags
/// byte 1      : bpm (u8)        — or bytes 1-2 (u16) when flag bit 0 is set
/// [2 bytes]   : energy expended — present only when flag bit 3 is set, skipped
/// [2 bytes]×N : RR intervals    — present only when flag bit 4 is set
/// ```
///
/// RR intervals arrive in units of 1/1024 s and are converted to whole
/// milliseconds. Returns `None` when the payload is too short for the fields
/// its flags announce.
pub fn parse_heart_rate(data: &[u8]) -> Option<HrSample> {
    let (&flags, rest) = data.split_first()?;

    let (bpm, mut rest) = if flags & FLAG_BPM_U16 != 0 {
        if rest.len() < 2 {
            return None;
        }
        (u16::from_le_bytes([rest[0], rest[1]]), &rest[2..])
    } else {
        let (&b, rest) = rest.split_first()?;
        (b as u16, rest)
    };

    if flags & FLAG_ENERGY_EXPENDED != 0 {
        if rest.len() < 2 {
            return None;
        }
        rest = &rest[2..];
    }

    let rr_available = flags & FLAG_RR_PRESENT != 0;
    let rrs_ms = if rr_available {
        rest.chunks_exact(2)
            .map(|c| {
                let raw = u16::from_le_bytes([c[0], c[1]]) as u32;
                (raw * 1000 / 1024) as u16
            })
            .collect()
    } else {
        Vec::new()
    };

    Some(HrSample {
        bpm,
        contact_detected: flags & FLAG_CONTACT_DETECTED != 0,
        contact_supported: flags & FLAG_CONTACT_SUPPORTED != 0,
        rr_available,
        rrs_ms,
    })
}
