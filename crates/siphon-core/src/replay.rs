//! Response replay refresh (spec §4.9): shifts time-sensitive headers and
//! cookie expirations forward by the elapsed time since the response was
//! originally recorded, so a stored response can be replayed later without
//! looking stale.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::response::Response;

const REFRESH_HEADERS: [&str; 3] = ["date", "expires", "last-modified"];

/// Refreshes `resp` in place as if it had just arrived at `now`.
pub fn refresh(resp: &mut Response, now: SystemTime) {
    let now_secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
    let delta = now_secs - resp.timestamp_start;

    for name in REFRESH_HEADERS {
        if let Some(value) = resp.headers.get_first(name) {
            if let Some(shifted) = shift_http_date(value, delta) {
                resp.headers.set(capitalize_header(name), shifted);
            }
        }
    }

    let cookies: Vec<String> = resp.headers.get_all("set-cookie").iter().map(|s| s.to_string()).collect();
    if !cookies.is_empty() {
        resp.headers.remove("set-cookie");
        for cookie in cookies {
            resp.headers.add("Set-Cookie", refresh_cookie(&cookie, delta));
        }
    }
}

fn capitalize_header(name: &str) -> &'static str {
    match name {
        "date" => "Date",
        "expires" => "Expires",
        "last-modified" => "Last-Modified",
        _ => unreachable!(),
    }
}

fn shift_http_date(value: &str, delta: f64) -> Option<String> {
    let parsed = httpdate::parse_http_date(value.trim()).ok()?;
    Some(httpdate::fmt_http_date(shift_system_time(parsed, delta)))
}

fn shift_system_time(t: SystemTime, delta: f64) -> SystemTime {
    if delta >= 0.0 {
        t + Duration::from_secs_f64(delta)
    } else {
        t.checked_sub(Duration::from_secs_f64(-delta)).unwrap_or(UNIX_EPOCH)
    }
}

/// Shifts a `Set-Cookie` value's `expires` attribute by `delta` seconds. If
/// the attribute is unparseable it is dropped rather than failing the whole
/// cookie — browsers accept a cookie with no `expires` (it becomes a
/// session cookie), so this is strictly more tolerant than rejecting the
/// cookie outright (spec §4.9, "Cookie expires handling").
fn refresh_cookie(cookie: &str, delta: f64) -> String {
    let mut parts = Vec::new();
    for (i, segment) in cookie.split(';').enumerate() {
        let trimmed = segment.trim();
        if i > 0 && trimmed.to_ascii_lowercase().starts_with("expires") {
            let date_value = trimmed.splitn(2, '=').nth(1).unwrap_or("").trim();
            if let Some(shifted) = shift_http_date(date_value, delta) {
                parts.push(format!("expires={shifted}"));
            }
            // unparseable: drop the attribute
        } else {
            parts.push(trimmed.to_string());
        }
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Content;
    use crate::form::HttpVersion;
    use crate::headers::HeaderMap;

    const T0_UNIX: u64 = 1_577_836_800; // 2020-01-01T00:00:00Z

    fn at(offset_secs: i64) -> SystemTime {
        if offset_secs >= 0 {
            UNIX_EPOCH + Duration::from_secs(T0_UNIX + offset_secs as u64)
        } else {
            UNIX_EPOCH + Duration::from_secs(T0_UNIX - (-offset_secs) as u64)
        }
    }

    fn response_at_t0_with_cookie() -> Response {
        let mut headers = HeaderMap::new();
        headers.add("Date", httpdate::fmt_http_date(at(0)));
        headers.add("Set-Cookie", format!("s=1; expires={}; Path=/", httpdate::fmt_http_date(at(3600))));
        Response {
            httpversion: HttpVersion::HTTP_11,
            code: 200,
            msg: "OK".into(),
            headers,
            content: Content::Absent,
            timestamp_start: T0_UNIX as f64,
            timestamp_end: T0_UNIX as f64,
            is_replay: false,
        }
    }

    #[test]
    fn shifts_date_and_cookie_expires_by_elapsed_time() {
        let mut resp = response_at_t0_with_cookie();
        refresh(&mut resp, at(600)); // 10 minutes later

        assert_eq!(resp.headers.get_first("date"), Some(httpdate::fmt_http_date(at(600))).as_deref());

        let cookie = resp.headers.get_first("set-cookie").unwrap();
        assert!(cookie.contains(&httpdate::fmt_http_date(at(3600 + 600))));
        assert!(cookie.starts_with("s=1"));
        assert!(cookie.contains("Path=/"));
    }

    #[test]
    fn unparseable_cookie_expires_is_dropped_not_fatal() {
        let mut headers = HeaderMap::new();
        headers.add("Set-Cookie", "s=1; expires=not-a-date; Path=/");
        let mut resp = Response {
            httpversion: HttpVersion::HTTP_11,
            code: 200,
            msg: "OK".into(),
            headers,
            content: Content::Absent,
            timestamp_start: T0_UNIX as f64,
            timestamp_end: T0_UNIX as f64,
            is_replay: false,
        };
        refresh(&mut resp, at(60));
        let cookie = resp.headers.get_first("set-cookie").unwrap();
        assert!(!cookie.to_ascii_lowercase().contains("expires"));
        assert!(cookie.contains("Path=/"));
    }
}
