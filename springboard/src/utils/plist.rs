//! Plist helpers for payloads sent to the device

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Rounds every `Date` in `value` down to whole seconds, in place
///
/// SpringBoard rejects icon state containing fractional-second dates.
/// Arrays and dictionaries are walked recursively; every other value is left
/// untouched.
pub fn truncate_dates_to_seconds(value: &mut plist::Value) {
    match value {
        plist::Value::Date(date) => *date = floor_to_second(SystemTime::from(*date)).into(),
        plist::Value::Array(items) => items.iter_mut().for_each(truncate_dates_to_seconds),
        plist::Value::Dictionary(dict) => {
            for (_, v) in dict.iter_mut() {
                truncate_dates_to_seconds(v);
            }
        }
        _ => {}
    }
}

fn floor_to_second(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => UNIX_EPOCH + Duration::from_secs(after.as_secs()),
        Err(e) => {
            let before = e.duration();
            let secs = before.as_secs() + u64::from(before.subsec_nanos() != 0);
            UNIX_EPOCH - Duration::from_secs(secs)
        }
    }
}
