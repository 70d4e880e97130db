//! Parsing of operator-supplied identifiers: MAC-style hex ids, agent ids
//! and `major.minor.revision[extra]` version strings.

use thiserror::Error;

use crate::types::SoftwareVersion;

/// Errors raised while parsing operator input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid id {input:?}: expected {expected} hex digits, found {found}")]
    InvalidId {
        input: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid version {0:?}: expected major.minor.revision[extra]")]
    InvalidVersion(String),
}

/// Normalise a hex identifier of `bytes` bytes.
///
/// Separators and any other non-hex characters are discarded, so
/// `AA:BB:CC:DD:EE:FF` and `aabbccddeeff` give the same result. The output is
/// lower case without separators.
pub fn normalize_mac(input: &str, bytes: usize) -> Result<String, ParseError> {
    let digits: String = input
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if digits.len() != bytes * 2 {
        return Err(ParseError::InvalidId {
            input: input.to_string(),
            expected: bytes * 2,
            found: digits.len(),
        });
    }
    Ok(digits)
}

/// Parse a hex identifier of `bytes` bytes (at most 8) into an integer.
pub fn parse_hex_id(input: &str, bytes: usize) -> Result<u64, ParseError> {
    let digits = normalize_mac(input, bytes.min(8))?;
    u64::from_str_radix(&digits, 16).map_err(|_| ParseError::InvalidId {
        input: input.to_string(),
        expected: bytes * 2,
        found: digits.len(),
    })
}

/// Parse an agent id as carried on the bus: 1 to 16 hex digits after
/// separators are dropped.
///
/// Agents announce a full `u64` in the handshake, so ids wider than a MAC
/// must round-trip through routing keys and payloads.
pub fn parse_agent_id(input: &str) -> Result<u64, ParseError> {
    let digits: String = input.chars().filter(char::is_ascii_hexdigit).collect();
    if digits.is_empty() || digits.len() > 16 {
        return Err(ParseError::InvalidId {
            input: input.to_string(),
            expected: 16,
            found: digits.len(),
        });
    }
    u64::from_str_radix(&digits, 16).map_err(|_| ParseError::InvalidId {
        input: input.to_string(),
        expected: 16,
        found: digits.len(),
    })
}

/// Parse `n.n.n[extra]`, where `extra` is whatever follows the digits of the
/// revision.
pub fn parse_version(input: &str) -> Result<SoftwareVersion, ParseError> {
    let invalid = || ParseError::InvalidVersion(input.to_string());

    let mut parts = input.split('.');
    let (Some(major), Some(minor), Some(tail), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };

    let digits_end = tail
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(tail.len());
    let (revision, extra) = tail.split_at(digits_end);

    Ok(SoftwareVersion {
        major: major.parse().map_err(|_| invalid())?,
        minor: minor.parse().map_err(|_| invalid())?,
        revision: revision.parse().map_err(|_| invalid())?,
        extra: extra.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_forms_normalise_identically() {
        assert_eq!(
            normalize_mac("AA:BB:CC:DD:EE:FF", 6).unwrap(),
            "aabbccddeeff"
        );
        assert_eq!(normalize_mac("aabbccddeeff", 6).unwrap(), "aabbccddeeff");
        assert_eq!(normalize_mac("aa-bb-cc-dd-ee-ff", 6).unwrap(), "aabbccddeeff");
    }

    #[test]
    fn mac_wrong_length_rejected() {
        let err = normalize_mac("AA:BB:CC", 6).unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidId {
                input: "AA:BB:CC".to_string(),
                expected: 12,
                found: 6,
            }
        );
        assert!(normalize_mac("3c970e1e8e4e00", 6).is_err());
    }

    #[test]
    fn gridpoint_ids_are_eight_bytes() {
        assert_eq!(
            parse_hex_id("00:0d:6f:00:00:12:34:56", 8).unwrap(),
            0x000d_6f00_0012_3456
        );
        assert_eq!(parse_hex_id("ffffffffffffffff", 8).unwrap(), u64::MAX);
    }

    #[test]
    fn agent_ids_accept_any_width_up_to_u64() {
        assert_eq!(parse_agent_id("3c:97:0e:1e:8e:4e").unwrap(), 0x3C97_0E1E_8E4E);
        assert_eq!(parse_agent_id("123456789abcdef").unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(parse_agent_id("FFFFFFFFFFFFFFFF").unwrap(), u64::MAX);
        assert_eq!(parse_agent_id("7").unwrap(), 7);
    }

    #[test]
    fn agent_ids_reject_empty_and_oversized() {
        assert!(parse_agent_id("").is_err());
        assert!(parse_agent_id("::").is_err());
        assert!(parse_agent_id("1ffffffffffffffff").is_err());
    }

    #[test]
    fn versions_with_and_without_extra() {
        assert_eq!(
            parse_version("1.2.3").unwrap(),
            SoftwareVersion::new(1, 2, 3, "")
        );
        assert_eq!(
            parse_version("2.10.0rc1").unwrap(),
            SoftwareVersion::new(2, 10, 0, "rc1")
        );
    }

    #[test]
    fn malformed_versions_rejected() {
        for input in ["1.2", "1.2.3.4", "a.b.c", "1..3", "1.2.x", "256.0.0"] {
            assert!(parse_version(input).is_err(), "{input} should be rejected");
        }
    }
}
