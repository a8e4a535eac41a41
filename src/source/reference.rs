//! container image references

use std::fmt;

use url::Host;

use crate::error::{Error, Result};
use crate::hash::Hash;

/// registry used for references without a domain
pub const DEFAULT_DOMAIN: &str = "docker.io";
/// host actually serving `docker.io`
pub const DOCKER_HUB_HOST: &str = "registry-1.docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// a parsed `[domain/]path[:tag][@digest]` reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    pub domain: String,
    pub path: String,
    pub tag: String,
    pub digest: Option<Hash>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let malformed = |message: &str| Error::Malformed {
            what: "image reference",
            message: format!("{reference:?}: {message}"),
        };

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (
                name,
                Some(Hash::from_prefixed(digest).map_err(|_| malformed("bad digest"))?),
            ),
            None => (reference, None),
        };

        // a colon after the last slash starts the tag; earlier ones are ports
        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (&name[..last_slash + i], &name[last_slash + i + 1..]),
            None => (name, DEFAULT_TAG),
        };
        if tag.is_empty() {
            return Err(malformed("empty tag"));
        }

        let (domain, path) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
        };

        if path.is_empty() || path.split('/').any(|c| !valid_component(c)) {
            return Err(malformed("invalid repository path"));
        }

        let domain = match domain.as_str() {
            DEFAULT_DOMAIN | "index.docker.io" => DOCKER_HUB_HOST.to_string(),
            _ => domain,
        };
        let path = if domain == DOCKER_HUB_HOST && !path.contains('/') {
            format!("library/{path}")
        } else {
            path
        };

        Ok(Self {
            domain,
            path,
            tag: tag.to_string(),
            digest,
        })
    }

    /// what goes after `/manifests/`: the digest when pinned, else the tag
    pub fn manifest_reference(&self) -> String {
        match &self.digest {
            Some(digest) => format!("sha256:{digest}"),
            None => self.tag.clone(),
        }
    }

    /// loopback registries are spoken to over plain http
    pub fn scheme(&self) -> &'static str {
        if self.is_loopback() {
            "http"
        } else {
            "https"
        }
    }

    fn is_loopback(&self) -> bool {
        // `[v6]:port` keeps its colons inside the brackets
        let host = match self.domain.split_once(']') {
            Some((v6, _)) => &self.domain[..=v6.len()],
            None => self.domain.split(':').next().unwrap_or_default(),
        };
        match Host::parse(host) {
            Ok(Host::Domain(name)) => name.eq_ignore_ascii_case("localhost"),
            Ok(Host::Ipv4(ip)) => ip.is_loopback(),
            Ok(Host::Ipv6(ip)) => ip.is_loopback(),
            Err(_) => false,
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}/v2/{}", self.scheme(), self.domain, self.path)
    }

    /// registry scope requested for pulls
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.path)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.domain, self.path, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@sha256:{digest}")?;
        }
        Ok(())
    }
}

fn valid_component(c: &str) -> bool {
    !c.is_empty()
        && c
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_hub_defaults() {
        let r = ImageRef::parse("alpine").unwrap();
        assert_eq!(r.domain, DOCKER_HUB_HOST);
        assert_eq!(r.path, "library/alpine");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.digest, None);
        assert_eq!(r.to_string(), "registry-1.docker.io/library/alpine:latest");

        let r = ImageRef::parse("docker.io/pantacor/app:1.2").unwrap();
        assert_eq!(r.domain, DOCKER_HUB_HOST);
        assert_eq!(r.path, "pantacor/app");
        assert_eq!(r.tag, "1.2");
    }

    #[test]
    fn test_custom_registry_with_port() {
        let r = ImageRef::parse("localhost:5000/team/app").unwrap();
        assert_eq!(r.domain, "localhost:5000");
        assert_eq!(r.path, "team/app");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.scheme(), "http");
        assert_eq!(r.base_url(), "http://localhost:5000/v2/team/app");

        let r = ImageRef::parse("registry.gitlab.com/group/app:arm32v7").unwrap();
        assert_eq!(r.domain, "registry.gitlab.com");
        assert_eq!(r.scheme(), "https");
        assert_eq!(r.pull_scope(), "repository:group/app:pull");
    }

    #[test]
    fn test_loopback_registries_use_http() {
        for (reference, scheme) in [
            ("127.0.0.1:5000/app", "http"),
            ("127.8.0.1:5000/app", "http"),
            ("[::1]:5000/app", "http"),
            ("[::1]/app", "http"),
            ("LOCALHOST:5000/app", "http"),
            ("[2001:db8::1]:5000/app", "https"),
            ("10.0.0.1:5000/app", "https"),
            ("localhost.example.com/app", "https"),
        ] {
            let r = ImageRef::parse(reference).unwrap();
            assert_eq!(r.scheme(), scheme, "{reference}");
        }
        let r = ImageRef::parse("[::1]:5000/team/app:v1").unwrap();
        assert_eq!(r.domain, "[::1]:5000");
        assert_eq!(r.tag, "v1");
        assert_eq!(r.base_url(), "http://[::1]:5000/v2/team/app");
    }

    #[test]
    fn test_digest_pin() {
        let hex = "a".repeat(64);
        let r = ImageRef::parse(&format!("busybox:1.36@sha256:{hex}")).unwrap();
        assert_eq!(r.tag, "1.36");
        assert_eq!(r.manifest_reference(), format!("sha256:{hex}"));
        assert!(r.to_string().ends_with(&format!("@sha256:{hex}")));
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "Alpine", "alpine:", "a//b", "alpine@sha256:zz"] {
            assert!(
                matches!(ImageRef::parse(bad), Err(Error::Malformed { .. })),
                "{bad}"
            );
        }
    }
}
