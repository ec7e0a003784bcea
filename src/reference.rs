//! Docker-style image names: `[domain/]path[:tag][@digest]`.
//!
//! Parsing and normalization are done by [`oci_spec::distribution::Reference`]:
//! a missing domain becomes `docker.io`, single-component names on that domain
//! gain the `library/` namespace, and `index.docker.io` is folded into
//! `docker.io`. This module keeps track of whether a tag was written out and
//! renders the familiar form.

use crate::error::{RegistryError, Result};
use oci_spec::distribution::Reference;
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_DOMAIN: &str = "docker.io";
pub const OFFICIAL_REPO_PREFIX: &str = "library/";
pub const DEFAULT_TAG: &str = "latest";

/// A content digest, `algorithm:encoded`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            encoded: hex::encode(Sha256::digest(data)),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Whether `data` hashes to this digest. Only sha256 can be checked;
    /// other algorithms report `None`.
    pub fn verify(&self, data: &[u8]) -> Option<bool> {
        (self.algorithm == "sha256").then(|| Self::sha256_of(data) == *self)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl FromStr for Digest {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let parsed: oci_spec::image::Digest = s
            .parse()
            .map_err(|e| format!("invalid digest {s:?}: {e}"))?;
        let encoded = parsed.digest().to_string();
        let algorithm = s
            .strip_suffix(encoded.as_str())
            .and_then(|prefix| prefix.strip_suffix(':'))
            .ok_or_else(|| format!("invalid digest {s:?}"))?;

        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded,
        })
    }
}

/// A fully normalized image name with an optional tag and digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DockerReference {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl DockerReference {
    /// Parses a possibly familiar name (`busybox`, `quay.io/x/y:v1`) into its
    /// normalized form. No tag is filled in; see [`Self::with_default_tag`].
    pub fn parse_normalized(s: &str) -> Result<Self> {
        if s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(RegistryError::malformed(
                s,
                "cannot specify 64-byte hexadecimal strings",
            ));
        }

        let parsed: Reference = s
            .parse()
            .map_err(|e: oci_spec::distribution::ParseError| {
                RegistryError::malformed(s, e.to_string())
            })?;

        let digest = parsed
            .digest()
            .map(str::parse::<Digest>)
            .transpose()
            .map_err(|reason| RegistryError::malformed(s, reason))?;

        Ok(Self {
            domain: parsed.registry().to_string(),
            path: parsed.repository().to_string(),
            tag: parsed
                .tag()
                .filter(|_| has_explicit_tag(s))
                .map(str::to_string),
            digest,
        })
    }

    /// Adds the `latest` tag to a reference with neither tag nor digest.
    pub fn with_default_tag(mut self) -> Self {
        if self.is_name_only() {
            self.tag = Some(DEFAULT_TAG.to_string());
        }
        self
    }

    pub fn is_name_only(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Repository path within the domain, e.g. `library/busybox`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `domain/path`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Shortest name the Docker CLI would accept for this repository.
    pub fn familiar_name(&self) -> String {
        if self.domain != DEFAULT_DOMAIN {
            return self.name();
        }
        match self.path.strip_prefix(OFFICIAL_REPO_PREFIX) {
            Some(short) if !short.contains('/') => short.to_string(),
            _ => self.path.clone(),
        }
    }

    pub fn familiar_string(&self) -> String {
        self.render(self.familiar_name())
    }

    fn render(&self, mut name: String) -> String {
        if let Some(tag) = &self.tag {
            name.push(':');
            name.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            name.push('@');
            name.push_str(&digest.to_string());
        }
        name
    }
}

impl fmt::Display for DockerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(self.name()))
    }
}

impl FromStr for DockerReference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_normalized(s)
    }
}

/// The parser fills in `latest` on its own; a tag only counts when a `:`
/// follows the last `/` of the name part.
fn has_explicit_tag(s: &str) -> bool {
    let name = s.split_once('@').map_or(s, |(name, _)| name);
    match (name.rfind(':'), name.rfind('/')) {
        (Some(colon), Some(slash)) => colon > slash,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Whether `path` can name a repository on a registry.
pub fn valid_repository(path: &str) -> bool {
    !path.is_empty()
        && !path.contains([':', '@'])
        && format!("{DEFAULT_DOMAIN}/{path}").parse::<Reference>().is_ok()
}

/// Whether `tag` is a valid manifest tag.
pub fn valid_tag(tag: &str) -> bool {
    !tag.contains(['/', ':', '@'])
        && format!("{DEFAULT_DOMAIN}/{OFFICIAL_REPO_PREFIX}tag:{tag}")
            .parse::<Reference>()
            .is_ok_and(|parsed| parsed.tag() == Some(tag))
}
