//! Wire format constants and primitive conversions.
//!
//! Every message has the layout:
//! ```text
//! ┌───────────┬──────────┬─────────────────┬────────────┐
//! │ Timestamp │ Kind     │ Payload         │ Terminator │
//! │ 8 bytes   │ 2 bytes  │ kind-specific   │ 4 bytes    │
//! │ FILETIME  │ uint16   │                 │ 0x12345678 │
//! └───────────┴──────────┴─────────────────┴────────────┘
//! ```
//!
//! All multi-byte integers are Little Endian. Strings are `LPSTR`:
//! a `uint64` byte length followed by that many bytes, with
//! [`NULL_STRING_LEN`] standing for "no string".

use chrono::{DateTime, Utc};

use crate::error::{Result, TracerError};

/// Magic value closing every message.
pub const TERMINATOR: u32 = 0x1234_5678;

/// String length marking a null string (distinct from an empty one).
pub const NULL_STRING_LEN: u64 = u64::MAX;

/// Default upper bound for a single string or environment block (64 MB).
pub const DEFAULT_MAX_STRING_LEN: u64 = 64 * 1024 * 1024;

/// FILETIME ticks per second (100 ns resolution).
const FILETIME_TICKS_PER_SECOND: u64 = 10_000_000;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH_OFFSET: i64 = 11_644_473_600;

/// Message kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    /// `exitCode:int32`
    Exit = 0,
    /// `encoding:int32 | exePath:LPSTR | commandLine:LPSTR`
    CreateFailure = 1,
    /// `parentPid:int32 | exePath | commandLine | workingDirectory | environment`,
    /// all strings UTF-16LE.
    Info = 2,
}

impl MessageKind {
    /// Wire tag of this kind.
    #[inline]
    pub fn tag(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for MessageKind {
    type Error = TracerError;

    fn try_from(tag: u16) -> Result<Self> {
        match tag {
            0 => Ok(MessageKind::Exit),
            1 => Ok(MessageKind::CreateFailure),
            2 => Ok(MessageKind::Info),
            other => Err(TracerError::UnknownMessageKind(other)),
        }
    }
}

/// Convert a Windows FILETIME (100 ns ticks since 1601-01-01 UTC) to UTC.
///
/// # Errors
///
/// Returns [`TracerError::InvalidTimestamp`] if the value is outside the
/// range `chrono` can represent.
pub fn filetime_to_utc(filetime: u64) -> Result<DateTime<Utc>> {
    let seconds = (filetime / FILETIME_TICKS_PER_SECOND) as i64 - FILETIME_UNIX_EPOCH_OFFSET;
    let nanos = ((filetime % FILETIME_TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(seconds, nanos).ok_or(TracerError::InvalidTimestamp(filetime))
}

/// Convert UTC to a Windows FILETIME, truncating to 100 ns.
///
/// Instants before 1601 saturate to 0, instants beyond the `u64` tick range to `u64::MAX`.
pub fn utc_to_filetime(timestamp: DateTime<Utc>) -> u64 {
    let seconds = timestamp.timestamp() + FILETIME_UNIX_EPOCH_OFFSET;
    if seconds < 0 {
        return 0;
    }
    (seconds as u64)
        .saturating_mul(FILETIME_TICKS_PER_SECOND)
        .saturating_add(u64::from(timestamp.timestamp_subsec_nanos()) / 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unix_epoch_filetime() {
        let epoch = filetime_to_utc(116_444_736_000_000_000).unwrap();
        assert_eq!(epoch, Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_filetime_zero_is_1601() {
        let start = filetime_to_utc(0).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_filetime_keeps_100ns_resolution() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 17, 12, 30, 45).unwrap()
            + chrono::Duration::nanoseconds(123_456_700);
        let ft = utc_to_filetime(ts);
        assert_eq!(filetime_to_utc(ft).unwrap(), ts);
    }

    #[test]
    fn test_filetime_truncates_sub_tick() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(150);
        let back = filetime_to_utc(utc_to_filetime(ts)).unwrap();
        assert_eq!(back, ts - chrono::Duration::nanoseconds(50));
    }

    #[test]
    fn test_filetime_max_value_is_representable() {
        assert!(filetime_to_utc(u64::MAX).is_ok());
    }

    #[test]
    fn test_far_future_saturates() {
        let far = Utc.with_ymd_and_hms(100_000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(utc_to_filetime(far), u64::MAX);

        let before_1601 = Utc.with_ymd_and_hms(1500, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(utc_to_filetime(before_1601), 0);
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(MessageKind::Exit.tag(), 0);
        assert_eq!(MessageKind::CreateFailure.tag(), 1);
        assert_eq!(MessageKind::Info.tag(), 2);
        assert_eq!(MessageKind::try_from(2).unwrap(), MessageKind::Info);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(matches!(
            MessageKind::try_from(0x7777),
            Err(TracerError::UnknownMessageKind(0x7777))
        ));
    }

    #[test]
    fn test_terminator_value() {
        assert_eq!(TERMINATOR, 0x012345678);
        assert_eq!(TERMINATOR.to_le_bytes(), [0x78, 0x56, 0x34, 0x12]);
    }
}
