//! Per-device control token derivation.
//!
//! The cloud service expects every status request to carry a token that
//! is derived from the device identifier. Identifiers look like
//! `PREFIX<SEPARATOR>SUFFIX`, eg: `9C1221E32995_0840_Aircle-17-03`, where
//! the separator names the product family.
//!
//! The derivation is:
//!
//! ```text
//! stoken = PREFIX[6..12] + SEPARATOR + PREFIX[0..6]   (PREFIX >= 12 chars)
//!        | PREFIX + SEPARATOR + PREFIX                 (otherwise)
//! token  = sha512_hex(sha512_hex(stoken) + "_" + SUFFIX)
//! ```
//!
//! Identifiers that don't match a known separator still produce a token
//! so that setup can proceed; the server may reject it later.

use data_encoding::HEXLOWER;

/// Product family separators, in match priority order.
pub const SEPARATORS: &[&str] = &["_0900_", "_0840_", "_0A00_", "_0B00_", "_0C00_"];

/// The derived credential for a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlToken(String);

impl ControlToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ControlToken {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.0)
    }
}

pub fn sha512_hex(data: &str) -> String {
    HEXLOWER.encode(&openssl::sha::sha512(data.as_bytes()))
}

type Attempt = fn(&str) -> Option<String>;

/// Derivation strategies, evaluated in order; the first to
/// produce a value wins.
const ATTEMPTS: &[(&str, Attempt)] = &[
    ("family-separator", derive_with_separator),
    ("generic-delimiter", derive_with_delimiter),
    ("raw-identifier", derive_raw),
];

/// Compute the control token for `device_id`.
/// This is a pure function; it never fails.
pub fn derive_token(device_id: &str) -> ControlToken {
    for (label, attempt) in ATTEMPTS {
        if let Some(token) = attempt(device_id) {
            log::trace!("derived token for {device_id} via {label}");
            return ControlToken(token);
        }
    }
    // derive_raw always produces a value
    ControlToken(sha512_hex(&device_id.to_uppercase()))
}

/// Returns the separator, prefix and suffix of a well-formed identifier.
/// Separators are matched case insensitively; the prefix and suffix
/// retain the casing of the input.
/// The vendor's own integration upper-cases the whole identifier
/// first, so identifiers with lower case letters hash differently
/// here than they do there; upper case identifiers are unaffected.
pub fn split_identifier(device_id: &str) -> Option<(&'static str, &str, &str)> {
    let upper = device_id.to_ascii_uppercase();
    for sep in SEPARATORS {
        if upper.matches(sep).count() != 1 {
            continue;
        }
        // ascii uppercasing preserves byte offsets
        let idx = upper.find(sep)?;
        let prefix = &device_id[..idx];
        let suffix = &device_id[idx + sep.len()..];
        return Some((sep, prefix, suffix));
    }
    None
}

fn stoken(prefix: &str, sep: &str) -> String {
    let chars: Vec<char> = prefix.chars().collect();
    if chars.len() >= 12 {
        let tail: String = chars[6..12].iter().collect();
        let head: String = chars[..6].iter().collect();
        format!("{tail}{sep}{head}")
    } else {
        format!("{prefix}{sep}{prefix}")
    }
}

fn derive_with_separator(device_id: &str) -> Option<String> {
    let (sep, prefix, suffix) = split_identifier(device_id)?;
    let inner = sha512_hex(&stoken(prefix, sep));
    Some(sha512_hex(&format!("{inner}_{suffix}")))
}

fn derive_with_delimiter(device_id: &str) -> Option<String> {
    let upper = device_id.to_uppercase();
    let parts: Vec<&str> = upper.split('_').collect();
    if parts.len() < 2 {
        return None;
    }
    Some(sha512_hex(&parts.join("_")))
}

fn derive_raw(device_id: &str) -> Option<String> {
    Some(sha512_hex(&device_id.to_uppercase()))
}

#[cfg(test)]
mod test {
    use super::*;

    const FIXTURE: &str = "9C1221E32995_0840_Aircle-17-03";

    #[test]
    fn stoken_slicing() {
        assert_eq!(stoken("9C1221E32995", "_0840_"), "E32995_0840_9C1221");
        assert_eq!(stoken("ABC", "_0900_"), "ABC_0900_ABC");
    }

    #[test]
    fn golden_humidifier_token() {
        let (sep, prefix, suffix) = split_identifier(FIXTURE).unwrap();
        assert_eq!(sep, "_0840_");
        assert_eq!(prefix, "9C1221E32995");
        assert_eq!(suffix, "Aircle-17-03");

        assert_eq!(
            sha512_hex("E32995_0840_9C1221"),
            "ed5870b1392d0d432691531b5a9108e048ed292b4b5345369958254f3a886672\
             f99a5bd287ab569b1a46e3f3ebbd689ecfecbf58f35531a1beaaaf50728e0284"
        );

        k9::assert_equal!(
            derive_token(FIXTURE).as_str(),
            "e454f6ebc2cad6bc45f9f804ea3f24e92a0bb617e685899d5454e2a9e80f0e69\
             91f842c7e1c15e7ea2b35a87195c01114e4b37b3f30711b04e64da766e560cb5"
        );
    }

    #[test]
    fn golden_matches_construction() {
        let inner = sha512_hex("E32995_0840_9C1221");
        let expect = sha512_hex(&format!("{inner}_Aircle-17-03"));
        assert_eq!(derive_token(FIXTURE).as_str(), expect);
    }

    #[test]
    fn repeatable() {
        for id in [FIXTURE, "ABCDEF123456_0900_CZ-01", "foo_bar", "plain", ""] {
            assert_eq!(derive_token(id), derive_token(id));
        }
    }

    #[test]
    fn separators_yield_distinct_tokens() {
        let tokens: Vec<_> = SEPARATORS
            .iter()
            .map(|sep| derive_token(&format!("9C1221E32995{sep}Aircle-17-03")))
            .collect();
        for (i, a) in tokens.iter().enumerate() {
            for b in &tokens[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn separator_is_case_insensitive() {
        let (sep, prefix, _) = split_identifier("9c1221e32995_0a00_thing").unwrap();
        assert_eq!(sep, "_0A00_");
        assert_eq!(prefix, "9c1221e32995");
    }

    #[test]
    fn casing_is_retained() {
        let lower = "9c1221e32995_0840_aircle-17-03";
        assert_ne!(derive_token(lower), derive_token(FIXTURE));
        let inner = sha512_hex("e32995_0840_9c1221");
        assert_eq!(
            derive_token(lower).as_str(),
            sha512_hex(&format!("{inner}_aircle-17-03"))
        );
    }

    #[test]
    fn separator_priority() {
        // both markers present exactly once; the AC marker is checked first
        let (sep, prefix, suffix) = split_identifier("AAAA_0900_BBBB_0840_CCCC").unwrap();
        assert_eq!(sep, "_0900_");
        assert_eq!(prefix, "AAAA");
        assert_eq!(suffix, "BBBB_0840_CCCC");
    }

    #[test]
    fn fallbacks() {
        assert_eq!(
            derive_token("foo_bar").as_str(),
            "1f0c0cb402158307365d9f21f203ee3a5373c232850e49315acc4cfc8b5b3ea5\
             9437bc4b9ba00b360f3925c46da99f6984355e469ad52037a80aa266692738ff"
        );
        assert_eq!(
            derive_token("plainid").as_str(),
            "fe6b6aa342cd160b3842f337c754c39641bdb100d2ce207f984f7029405d6cea\
             3c2f724b1699e9a360dff73df17c0ef419b8cfeebfab24cbc0be40a4906d5ef4"
        );
    }
}
