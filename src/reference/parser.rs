//! Parse a reference to an image in an OCI registry.
//!
//! It tries to be close to what `docker pull` does, but it does not try
//! to be bug-for-bug compatible.

use super::*;

/// Domain to use when the reference is just the repository,
/// like `debian` or `nixos/nix`.
pub(super) const DEFAULT_DOMAIN: &str = "docker.io";

/// Host of the registry for [`DEFAULT_DOMAIN`].
pub(super) const DOCKER_HUB_HOST: &str = "registry-1.docker.io";

const LEGACY_DOMAIN: &str = "index.docker.io";

const DEFAULT_NAMESPACE: &str = "library";

pub(super) const DEFAULT_TAG: &str = "latest";

const MAX_TAG_LEN: usize = 128;

type Result<T> = std::result::Result<T, ParseError>;

pub(super) fn parse(reference: &str) -> Result<Reference> {
    // Extract the digest after the last `@`.
    let (base, digest) = match reference.rsplit_once('@') {
        None => (reference, None),
        Some((base, d)) => (base, Some(Digest::try_from(d)?)),
    };

    // Extract the tag after the last `:`.
    //
    // If the value contains a `/`, it assumes that the value after `:`
    // is a port number, and not a tag.
    let (base, tag) = match base.rsplit_once(':') {
        Some((base, tag)) if !tag.contains('/') => (base, Some(tag)),
        _ => (base, None),
    };

    // Imitate the logic from `docker pull` to get the domain.
    let (domain, repository) = match base.split_once('/') {
        Some((domain, repository))
            if domain.contains(['.', ':']) || domain == "localhost" =>
        {
            (domain, repository)
        }

        _ => (DEFAULT_DOMAIN, base),
    };

    if repository.is_empty() {
        return Err(ParseError::MissingRepository);
    }

    if !valid_domain(domain) {
        return Err(ParseError::InvalidDomain(domain.to_owned()));
    }

    if !repository.split('/').all(valid_component) {
        return Err(ParseError::InvalidRepository(repository.to_owned()));
    }

    if let Some(tag) = tag {
        if !valid_tag(tag) {
            return Err(ParseError::InvalidTag(tag.to_owned()));
        }
    }

    let domain = match domain {
        LEGACY_DOMAIN => DEFAULT_DOMAIN,
        d => d,
    };

    let repository = if domain == DEFAULT_DOMAIN && !repository.contains('/') {
        format!("{DEFAULT_NAMESPACE}/{repository}")
    } else {
        repository.to_owned()
    };

    let tag = match (tag, &digest) {
        (Some(tag), _) => Some(tag.to_owned()),
        (None, None) => Some(DEFAULT_TAG.to_owned()),
        (None, Some(_)) => None,
    };

    Ok(Reference {
        domain: domain.to_owned(),
        repository,
        tag,
        digest,
    })
}

/// Hostname (or IPv6 literal in brackets) with an optional port.
fn valid_domain(domain: &str) -> bool {
    let (host, port) = match domain.rfind(':') {
        Some(i) if !domain[i..].contains(']') => (&domain[..i], Some(&domain[i + 1..])),
        _ => (domain, None),
    };

    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }

    if let Some(ipv6) = host.strip_prefix('[') {
        return ipv6
            .strip_suffix(']')
            .is_some_and(|ip| ip.parse::<std::net::Ipv6Addr>().is_ok());
    }

    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

/// A path component: lowercase alphanumeric runs, joined by `.`, `_`, `__`,
/// or any number of `-`.
fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();

    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if !bytes.first().is_some_and(alnum) || !bytes.last().is_some_and(alnum) {
        return false;
    }

    let mut rest = bytes;
    while !rest.is_empty() {
        let run = rest.iter().take_while(|b| alnum(b)).count();
        rest = &rest[run..];

        let sep = rest.iter().take_while(|b| !alnum(b)).count();
        let valid_sep = match &rest[..sep] {
            [] | b"." | b"_" | b"__" => true,
            s => s.iter().all(|b| *b == b'-'),
        };

        if !valid_sep {
            return false;
        }

        rest = &rest[sep..];
    }

    true
}

/// `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`
fn valid_tag(tag: &str) -> bool {
    let mut bytes = tag.bytes();

    tag.len() <= MAX_TAG_LEN
        && bytes
            .next()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

#[test]
fn parse_valid_references() {
    use crate::digest::HexString;
    use sha2::{Digest as _, Sha256, Sha512};

    macro_rules! check {
        ($reference:expr, [ $domain:expr, $repository:expr, $tag:expr, $digest:expr ]) => {
            let reference = $reference;
            assert_eq!(
                Reference::try_from(<_ as AsRef<str>>::as_ref(&reference)).unwrap(),
                Reference {
                    domain: String::from($domain),
                    repository: String::from($repository),
                    tag: $tag.map(String::from),
                    digest: $digest,
                }
            )
        };
    }

    let sha256 = HexString(Sha256::digest(b"\x00\x01"));
    let sha512 = HexString(Sha512::digest(b"\x01\x02"));

    check!("foo", [DEFAULT_DOMAIN, "library/foo", Some(DEFAULT_TAG), None]);

    check!("foo/bar", [DEFAULT_DOMAIN, "foo/bar", Some(DEFAULT_TAG), None]);

    check!(
        "index.docker.io/foo:1",
        [DEFAULT_DOMAIN, "library/foo", Some("1"), None]
    );

    check!(
        "localhost/a-b__c.d/e--f:x_Y.1",
        ["localhost", "a-b__c.d/e--f", Some("x_Y.1"), None]
    );

    check!(
        "example.com:5678/foo/bar:1.2.3",
        ["example.com:5678", "foo/bar", Some("1.2.3"), None]
    );

    check!(
        &format!("example.com/foo/bar@sha256:{sha256}"),
        [
            "example.com",
            "foo/bar",
            None::<&str>,
            Digest::try_from(format!("sha256:{sha256}")).ok()
        ]
    );

    check!(
        &format!("example.com:1234/foo/bar:1.2.3@sha512:{sha512}"),
        [
            "example.com:1234",
            "foo/bar",
            Some("1.2.3"),
            Digest::try_from(format!("sha512:{sha512}")).ok()
        ]
    );
}

#[test]
fn reject_invalid_references() {
    use crate::digest::DigestError;

    assert!(matches!(
        Reference::try_from("debian:stable@md5:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidAlgorithm)),
    ));

    assert!(matches!(
        Reference::try_from("debian:stable@sha256:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidValue)),
    ));

    assert!(matches!(
        Reference::try_from(""),
        Err(ParseError::MissingRepository)
    ));

    assert!(matches!(
        Reference::try_from("example.com/"),
        Err(ParseError::MissingRepository)
    ));

    for repository in ["Debian", "foo/-bar", "foo//bar", "foo/bar.", "a...b", "a_-b"] {
        assert!(
            matches!(
                Reference::try_from(repository),
                Err(ParseError::InvalidRepository(_))
            ),
            "{repository}"
        );
    }

    assert!(matches!(
        Reference::try_from("foo:.bar"),
        Err(ParseError::InvalidTag(_))
    ));

    assert!(matches!(
        Reference::try_from(format!("foo:{}", "x".repeat(129)).as_str()),
        Err(ParseError::InvalidTag(_))
    ));

    assert!(matches!(
        Reference::try_from("exa_mple.com/foo"),
        Err(ParseError::InvalidDomain(_))
    ));
}
