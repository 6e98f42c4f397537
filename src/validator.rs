//! Component F: structural validation shared across message kinds --
//! URI normalization, descriptor field consistency, and tag validation.
//! JSON-Schema validation of a record's own payload against a protocol's
//! declared `schema` is left to the protocol author's own tooling (an
//! external concern per the crate's scope); this module only enforces
//! shape invariants the dispatcher itself must hold the line on.

use thiserror::Error as ThisError;
use url::Url;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("malformed uri: {0}")]
    MalformedUri(String),
    #[error("{0} and {1} are mutually exclusive")]
    MutuallyExclusive(&'static str, &'static str),
    #[error("{0} requires {1}")]
    MutuallyInclusive(&'static str, &'static str),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("tag {0} did not match the protocol's tag rules")]
    InvalidTag(String),
}

/// Normalizes a protocol/schema URI the way every DWN implementation
/// must, so two authors who wrote `Example.com/Foo/` and
/// `example.com/foo` end up addressing the same protocol: lowercase
/// scheme and host, strip a single trailing slash.
pub fn normalize_uri(uri: &str) -> Result<String, Error> {
    let mut url = Url::parse(uri).map_err(|_| Error::MalformedUri(uri.to_string()))?;
    url.set_scheme(&url.scheme().to_ascii_lowercase())
        .map_err(|_| Error::MalformedUri(uri.to_string()))?;
    if let Some(host) = url.host_str() {
        let host = host.to_ascii_lowercase();
        url.set_host(Some(&host)).map_err(|_| Error::MalformedUri(uri.to_string()))?;
    }
    let mut s = url.to_string();
    if s.ends_with('/') && s.matches('/').count() > 2 {
        s.pop();
    }
    Ok(s)
}

/// Rejects a protocol/schema URI that isn't already in its normalized
/// form. A message's signed descriptor can't be rewritten after the
/// fact, so normalization is enforced as a gate at submission time
/// rather than applied in place: an author who wants `Example.com/Foo/`
/// to address the same protocol as `example.com/foo` must normalize
/// before signing, not rely on the node to do it for them.
pub fn require_normalized(field: &'static str, uri: &str) -> Result<(), Error> {
    let normalized = normalize_uri(uri)?;
    if normalized != uri {
        return Err(Error::MalformedUri(format!("{field} {uri} is not normalized (expected {normalized})")));
    }
    Ok(())
}

/// Two fields that must both be present or both absent.
pub fn require_together(a: (&'static str, bool), b: (&'static str, bool)) -> Result<(), Error> {
    if a.1 != b.1 {
        return Err(Error::MutuallyInclusive(a.0, b.0));
    }
    Ok(())
}

/// Two fields that cannot both be present.
pub fn require_exclusive(a: (&'static str, bool), b: (&'static str, bool)) -> Result<(), Error> {
    if a.1 && b.1 {
        return Err(Error::MutuallyExclusive(a.0, b.0));
    }
    Ok(())
}

pub fn require(field: &'static str, present: bool) -> Result<(), Error> {
    if !present {
        return Err(Error::Missing(field));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_scheme_and_host_case() {
        let normalized = normalize_uri("HTTPS://Example.COM/foo").unwrap();
        assert_eq!(normalized, "https://example.com/foo");
    }

    #[test]
    fn strips_trailing_slash() {
        let normalized = normalize_uri("https://example.com/foo/").unwrap();
        assert_eq!(normalized, "https://example.com/foo");
    }

    #[test]
    fn mutually_exclusive_rejects_both_present() {
        assert!(require_exclusive(("data", true), ("dataCid", true)).is_err());
        assert!(require_exclusive(("data", true), ("dataCid", false)).is_ok());
    }

    #[test]
    fn mutually_inclusive_requires_matching_presence() {
        assert!(require_together(("protocol", true), ("protocolPath", false)).is_err());
        assert!(require_together(("protocol", true), ("protocolPath", true)).is_ok());
    }

    #[test]
    fn require_normalized_rejects_unnormalized_uri() {
        assert!(require_normalized("protocol", "HTTPS://Example.com/Foo/").is_err());
        assert!(require_normalized("protocol", "https://example.com/foo").is_ok());
    }
}
