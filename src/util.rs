//! Utility functions used by the load test driver.

use lazy_static::lazy_static;
use regex::Regex;
use std::cmp::{max, min};
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::time;
use url::Url;

use crate::{LoadTestError, CANCELED};

lazy_static! {
    static ref TIMESPAN: Regex =
        Regex::new(r"((?P<hours>\d+?)h)?((?P<minutes>\d+?)m)?((?P<seconds>\d+?)s)?")
            .expect("timespan regex is valid");
}

/// Parse a string representing a time span and return the number of seconds.
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", and "s", in that order.
///
/// # Example
/// ```rust
/// use milmove_loadtest::util;
///
/// // 1 hour 30 minutes is 5,400 seconds.
/// assert_eq!(util::parse_timespan("1h30m"), 5_400);
///
/// // A bare integer is seconds.
/// assert_eq!(util::parse_timespan("45"), 45);
///
/// // Anything unparseable is 0 seconds.
/// assert_eq!(util::parse_timespan("foo"), 0);
/// ```
pub fn parse_timespan(time_str: &str) -> usize {
    if let Ok(seconds) = usize::from_str(time_str) {
        trace!("{} is integer: {} seconds", time_str, seconds);
        return seconds;
    }

    let captures = match TIMESPAN.captures(time_str) {
        Some(c) => c,
        None => return 0,
    };
    let component = |name: &str| -> usize {
        captures
            .name(name)
            .and_then(|m| usize::from_str(m.as_str()).ok())
            .unwrap_or(0)
    };
    let hours = component("hours");
    let minutes = component("minutes");
    let seconds = component("seconds");
    let total = match hours
        .checked_mul(60 * 60)
        .and_then(|h| minutes.checked_mul(60).and_then(|m| h.checked_add(m)))
        .and_then(|hm| hm.checked_add(seconds))
    {
        Some(total) => total,
        None => {
            warn!("{} is too long, ignoring it", time_str);
            return 0;
        }
    };
    trace!(
        "{} hours {} minutes {} seconds: {} seconds",
        hours,
        minutes,
        seconds,
        total
    );
    total
}

/// Greatest common divisor of two integers (binary GCD).
///
/// Used to reduce scenario weights so the allocation list is as short as possible.
///
/// # Example
/// ```rust
/// use milmove_loadtest::util;
///
/// assert_eq!(util::gcd(5, 1), 1);
/// assert_eq!(util::gcd(10, 4), 2);
/// ```
pub fn gcd(u: usize, v: usize) -> usize {
    match ((u, v), (u & 1, v & 1)) {
        ((x, 0), _) | ((0, x), _) => x,
        ((x, y), _) if x == y => x,
        ((x, y), (0, 1)) | ((y, x), (1, 0)) => gcd(x >> 1, y),
        ((x, y), (0, 0)) => gcd(x >> 1, y >> 1) << 1,
        ((x, y), (1, 1)) => {
            let (x, y) = (min(x, y), max(x, y));
            gcd((y - x) >> 1, x)
        }
        _ => unreachable!(),
    }
}

/// Returns `true` once more than `run_time` seconds have passed since `started`.
/// A `run_time` of 0 never expires.
pub fn timer_expired(started: time::Instant, run_time: usize) -> bool {
    run_time > 0 && started.elapsed().as_secs() >= run_time as u64
}

/// Convert an optional hatch rate string to f32, defaulting to 1.0.
///
/// # Example
/// ```rust
/// use milmove_loadtest::util;
///
/// assert_eq!(util::get_hatch_rate(Some(".5".to_string())), 0.5);
/// assert_eq!(util::get_hatch_rate(Some("1.1.1".to_string())), 1.0);
/// assert_eq!(util::get_hatch_rate(None), 1.0);
/// ```
pub fn get_hatch_rate(hatch_rate: Option<String>) -> f32 {
    match hatch_rate {
        Some(rate) => match rate.parse::<f32>() {
            Ok(value) => value,
            Err(e) => {
                warn!("failed to convert {} to float: {}", rate, e);
                1.0
            }
        },
        None => 1.0,
    }
}

/// Time between user launches at the given hatch rate, failing if the rate is not a
/// positive number or is so small the interval can't be represented.
///
/// # Example
/// ```rust
/// use milmove_loadtest::util;
/// use std::time::Duration;
///
/// assert_eq!(util::hatch_interval(4.0).ok(), Some(Duration::from_millis(250)));
/// assert!(util::hatch_interval(f32::NAN).is_err());
/// assert!(util::hatch_interval(1e-30).is_err());
/// ```
pub fn hatch_interval(hatch_rate: f32) -> Result<time::Duration, LoadTestError> {
    let invalid = |detail: String| LoadTestError::InvalidOption {
        option: "--hatch-rate".to_string(),
        value: hatch_rate.to_string(),
        detail,
    };
    if !hatch_rate.is_finite() || hatch_rate <= 0.0 {
        return Err(invalid("The hatch rate must be greater than 0.".to_string()));
    }
    time::Duration::try_from_secs_f32(1.0 / hatch_rate)
        .map_err(|e| invalid(format!("The hatch rate is too small: {}.", e)))
}

/// Parse a host, failing if it is not an absolute URL.
///
/// # Example
/// ```rust
/// use milmove_loadtest::util;
///
/// assert!(util::parse_host("http://milmovelocal:8080").is_ok());
/// assert!(util::parse_host("milmovelocal:8080/").is_err());
/// ```
pub fn parse_host(host: &str) -> Result<Url, LoadTestError> {
    let url = Url::parse(host).map_err(|parse_error| LoadTestError::InvalidHost {
        host: host.to_string(),
        detail: "Invalid host.".to_string(),
        parse_error,
    })?;
    if url.cannot_be_a_base() {
        return Err(LoadTestError::InvalidHost {
            host: host.to_string(),
            detail: "Host must include a protocol, ie http://".to_string(),
            parse_error: url::ParseError::RelativeUrlWithCannotBeABaseBase,
        });
    }
    Ok(url)
}

// Shutdown cleanly on the first ctrl-c, exit abruptly on the second.
pub(crate) fn setup_ctrlc_handler() {
    CANCELED.store(false, Ordering::SeqCst);
    match ctrlc::set_handler(move || {
        if CANCELED.swap(true, Ordering::SeqCst) {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        } else {
            warn!("caught ctrl-c, stopping...");
        }
    }) {
        Ok(_) => (),
        // The handler can only be installed once per process, which happens when
        // more than one load test runs in the same process (ie in tests).
        Err(e) => info!("reusing existing ctrl-c handler: {}", e),
    }
}
