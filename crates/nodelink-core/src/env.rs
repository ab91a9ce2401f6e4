//! Environment variable helpers
//!
//! Node configuration can be overridden from the environment
//! (`NODELINK_PORT`, `NODELINK_IO_CHUNK`, ...). These helpers parse a
//! variable into any `FromStr` type and fall back to a default when the
//! variable is unset or does not parse.
//!
//! ```ignore
//! use nodelink_core::env::{env_get, env_get_bool};
//!
//! let port: u16 = env_get("NODELINK_PORT", 0);
//! let console = env_get_bool("NODELINK_CONSOLE", true);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or return `default`
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as a boolean; see [`parse_bool`]
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    parse_bool(std::env::var(key).ok().as_deref(), default)
}

/// Parse `key` as `T` if it is set and well-formed
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    parse_opt(std::env::var(key).ok().as_deref())
}

/// Parse a looked-up value as `T`, ignoring surrounding whitespace
#[inline]
pub fn parse_opt<T: FromStr>(val: Option<&str>) -> Option<T> {
    val.and_then(|v| v.trim().parse().ok())
}

/// Parse a looked-up value as a boolean
///
/// "1", "true", "yes" and "on" (any case) are true, "0", "false", "no" and
/// "off" are false; anything else, including unset, yields `default`.
pub fn parse_bool(val: Option<&str>, default: bool) -> bool {
    match val.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_env_get_default() {
        let port: u16 = env_get("__NODELINK_TEST_UNSET__", 9000);
        assert_eq!(port, 9000);
        let opt: Option<usize> = env_get_opt("__NODELINK_TEST_UNSET__");
        assert!(opt.is_none());
        assert!(env_get_bool("__NODELINK_TEST_UNSET__", true));
    }

    #[test]
    fn test_parse_trims() {
        let ip: Option<Ipv4Addr> = parse_opt(Some(" 127.0.0.1 "));
        assert_eq!(ip, Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_bad_value_is_none() {
        let chunk: Option<usize> = parse_opt(Some("lots"));
        assert!(chunk.is_none());
        let unset: Option<usize> = parse_opt(None);
        assert!(unset.is_none());
    }

    #[test]
    fn test_parse_bool_variants() {
        for v in ["1", "true", "YES", "on"] {
            assert!(parse_bool(Some(v), false), "{v}");
        }
        for v in ["0", "false", "No", " OFF "] {
            assert!(!parse_bool(Some(v), true), "{v}");
        }
        assert!(parse_bool(Some("maybe"), true));
        assert!(!parse_bool(None, false));
    }
}
