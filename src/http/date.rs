//! IMF-fixdate helpers for `Date`, `Last-Modified`, `Expires` and the
//! conditional request headers.

use std::cell::RefCell;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

thread_local! {
    // (unix second, rendered value) — the Date header only changes once per second.
    static CURRENT: RefCell<(u64, String)> = const { RefCell::new((0, String::new())) };
}

/// Formats `time` as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

/// Parses any of the three HTTP date formats. Returns `None` for garbage.
pub fn parse(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value.trim()).ok()
}

/// Returns the `Date` header value for the current second.
pub fn now() -> String {
    let now = SystemTime::now();
    let second = unix_seconds(now);
    CURRENT.with(|cell| {
        let mut cached = cell.borrow_mut();
        if cached.0 != second || cached.1.is_empty() {
            *cached = (second, format(now));
        }
        cached.1.clone()
    })
}

/// Whole seconds since the epoch; HTTP dates have one-second resolution.
pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_at_second_resolution() {
        let time = UNIX_EPOCH + Duration::from_secs(784_111_777);
        let text = format(time);
        assert_eq!(text, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse(&text), Some(time));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse("yesterday"), None);
    }

    #[test]
    fn now_is_parseable() {
        assert!(parse(&now()).is_some());
    }
}
