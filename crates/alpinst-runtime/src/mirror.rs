//! Repository index fetching and checking.
//!
//! An Alpine repository serves `<repo>/<arch>/APKINDEX.tar.gz`: two gzip
//! members back to back. The first is a tarball holding only the signature
//! (`.SIGN.RSA.<key name>`), the second is the index tarball it signs.
//! The installer fetches it once before validation, verifies the signature against
//! the key set, and keeps the package names, so the validators can check
//! reachability, trust and package names without doing I/O.

use crate::command::{CommandRunner, HostRunner, Invocation};
use crate::RuntimeError;
use flate2::bufread::GzDecoder;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);
/// Signature member prefixes and the digest each one signs with.
const SIGN_PREFIXES: &[(&str, &str)] = &[(".SIGN.RSA256.", "sha256"), (".SIGN.RSA.", "sha1")];
const APKINDEX: &str = "APKINDEX";

/// Outcome of checking an index signature with the key set's public key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SignatureCheck {
    /// No key of the signer's name was available to check with.
    #[default]
    Unchecked,
    Verified,
    Invalid { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MirrorIndex {
    /// Package names and plain provides.
    pub packages: BTreeSet<String>,
    /// Key file name the index was signed with.
    pub signer: Option<String>,
    pub signature: SignatureCheck,
}

impl MirrorIndex {
    pub fn provides(&self, name: &str) -> bool {
        self.packages.contains(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MirrorStatus {
    Unreachable { reason: String },
    Reachable { index: MirrorIndex },
}

impl MirrorStatus {
    pub fn index(&self) -> Option<&MirrorIndex> {
        match self {
            Self::Reachable { index } => Some(index),
            Self::Unreachable { .. } => None,
        }
    }
}

/// http(s) URL with a host, or an absolute local path.
pub fn is_valid_repository(url: &str) -> bool {
    if let Some(rest) = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
    {
        let host = rest.split('/').next().unwrap_or_default();
        return !host.is_empty() && !rest.contains(char::is_whitespace);
    }
    url.starts_with('/') && !url.contains(char::is_whitespace)
}

pub fn index_location(url: &str, arch: &str) -> String {
    format!("{}/{arch}/APKINDEX.tar.gz", url.trim_end_matches('/'))
}

/// Names from `P:` records plus unversioned, unprefixed `p:` provides.
pub fn parse_apkindex(text: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for line in text.lines() {
        if let Some(name) = line.strip_prefix("P:") {
            names.insert(name.trim().to_owned());
        } else if let Some(provides) = line.strip_prefix("p:") {
            for p in provides.split_whitespace() {
                let name = p.split(['=', '<', '>', '~']).next().unwrap_or_default();
                if !name.is_empty() && !name.contains(':') {
                    names.insert(name.to_owned());
                }
            }
        }
    }
    names
}

/// `(digest, key name)` of a signature member name.
pub fn signature_entry(name: &str) -> Option<(&'static str, &str)> {
    SIGN_PREFIXES
        .iter()
        .find_map(|(prefix, digest)| name.strip_prefix(prefix).map(|key| (*digest, key)))
}

/// The signature member of an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSignature {
    pub signer: String,
    /// `openssl dgst` digest name.
    pub digest: &'static str,
    pub bytes: Vec<u8>,
}

/// An index taken apart.
#[derive(Debug)]
pub struct SplitIndex<'a> {
    pub signature: Option<IndexSignature>,
    /// Compressed bytes the signature covers.
    pub signed: &'a [u8],
    pub apkindex: String,
}

/// Decompress one gzip member, leaving `input` just past it.
fn gunzip_member(input: &mut &[u8]) -> Result<Vec<u8>, RuntimeError> {
    let mut out = Vec::new();
    GzDecoder::new(input).read_to_end(&mut out)?;
    Ok(out)
}

fn tar_entries(tar_bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, RuntimeError> {
    let mut ar = tar::Archive::new(tar_bytes);
    let mut out = Vec::new();
    for entry in ar.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        out.push((name, data));
    }
    Ok(out)
}

/// Separate the signature member from the signed index. An index without a
/// signature member is returned whole as the signed part.
pub fn split_index(archive: &[u8]) -> Result<SplitIndex<'_>, RuntimeError> {
    let mut rest = archive;
    let first = tar_entries(&gunzip_member(&mut rest)?)?;
    let signature = first.iter().find_map(|(name, data)| {
        signature_entry(name).map(|(digest, signer)| IndexSignature {
            signer: signer.to_owned(),
            digest,
            bytes: data.clone(),
        })
    });

    let (signed, control) = match &signature {
        Some(_) if !rest.is_empty() => {
            let signed = rest;
            (signed, tar_entries(&gunzip_member(&mut rest)?)?)
        }
        Some(_) => (rest, first),
        None => (archive, first),
    };
    let apkindex = control
        .into_iter()
        .find(|(name, _)| name == APKINDEX)
        .map(|(_, data)| String::from_utf8_lossy(&data).into_owned())
        .ok_or_else(|| RuntimeError::Mirror("index has no APKINDEX member".to_owned()))?;
    Ok(SplitIndex {
        signature,
        signed,
        apkindex,
    })
}

pub fn verify_invocation(digest: &str, key: &Path, signature: &Path, data: &Path) -> Invocation {
    Invocation::new("openssl")
        .arg("dgst")
        .arg(format!("-{digest}"))
        .arg("-verify")
        .arg(key.to_string_lossy())
        .arg("-signature")
        .arg(signature.to_string_lossy())
        .arg(data.to_string_lossy())
}

fn run_verify(
    runner: &dyn CommandRunner,
    key: &Path,
    signature: &IndexSignature,
    signed: &[u8],
) -> Result<(), RuntimeError> {
    let mut sig_file = tempfile::NamedTempFile::new()?;
    sig_file.write_all(&signature.bytes)?;
    let mut data_file = tempfile::NamedTempFile::new()?;
    data_file.write_all(signed)?;
    runner.run(
        &verify_invocation(signature.digest, key, sig_file.path(), data_file.path()),
        VERIFY_TIMEOUT,
    )?;
    Ok(())
}

/// Check `signature` over `signed` with the signer's key in `key_dir`.
pub fn verify_signature(
    runner: &dyn CommandRunner,
    key_dir: &Path,
    signature: &IndexSignature,
    signed: &[u8],
) -> SignatureCheck {
    if signature.signer.contains('/') || signature.signer.starts_with('.') {
        return SignatureCheck::Invalid {
            reason: format!("malformed signer name '{}'", signature.signer),
        };
    }
    let key = key_dir.join(&signature.signer);
    if !key.is_file() {
        return SignatureCheck::Unchecked;
    }
    match run_verify(runner, &key, signature, signed) {
        Ok(()) => SignatureCheck::Verified,
        Err(e) => SignatureCheck::Invalid {
            reason: e.to_string(),
        },
    }
}

pub struct IndexFetcher {
    agent: ureq::Agent,
    runner: HostRunner,
}

impl Default for IndexFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexFetcher {
    pub fn new() -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(FETCH_TIMEOUT))
            .build()
            .into();
        Self {
            agent,
            runner: HostRunner,
        }
    }

    /// A fetcher whose HTTP requests all go through `proxy`
    /// (`http://host[:port]`).
    pub fn with_proxy(proxy: &str) -> Result<Self, RuntimeError> {
        let proxy = ureq::Proxy::new(proxy)
            .map_err(|e| RuntimeError::Mirror(format!("invalid proxy {proxy}: {e}")))?;
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(FETCH_TIMEOUT))
            .proxy(Some(proxy))
            .build()
            .into();
        Ok(Self {
            agent,
            runner: HostRunner,
        })
    }

    pub fn fetch(&self, location: &str) -> Result<Vec<u8>, RuntimeError> {
        if !location.starts_with("http://") && !location.starts_with("https://") {
            return Ok(std::fs::read(location)?);
        }
        debug!("GET {location}");
        let resp = match self.agent.get(location).call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(code)) => {
                return Err(RuntimeError::Mirror(format!("HTTP {code} for {location}")));
            }
            Err(e) => return Err(RuntimeError::Mirror(format!("{location}: {e}"))),
        };
        let mut body = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| RuntimeError::Mirror(format!("{location}: {e}")))?;
        Ok(body)
    }

    fn read_index(&self, archive: &[u8], key_dir: Option<&Path>) -> Result<MirrorIndex, RuntimeError> {
        let parts = split_index(archive)?;
        let signature = match (&parts.signature, key_dir) {
            (Some(sig), Some(dir)) => verify_signature(&self.runner, dir, sig, parts.signed),
            _ => SignatureCheck::Unchecked,
        };
        Ok(MirrorIndex {
            packages: parse_apkindex(&parts.apkindex),
            signer: parts.signature.map(|s| s.signer),
            signature,
        })
    }

    /// Fetch and read one repository's index, checking its signature with
    /// the keys in `key_dir`. Any failure to fetch or read is reported as
    /// unreachable with the reason.
    pub fn inspect(&self, url: &str, arch: &str, key_dir: Option<&Path>) -> MirrorStatus {
        let location = index_location(url, arch);
        match self
            .fetch(&location)
            .and_then(|bytes| self.read_index(&bytes, key_dir))
        {
            Ok(index) => {
                debug!(
                    "{url}: {} packages, signature {:?}",
                    index.packages.len(),
                    index.signature
                );
                MirrorStatus::Reachable { index }
            }
            Err(e) => {
                warn!("repository {url} unusable: {e}");
                MirrorStatus::Unreachable {
                    reason: e.to_string(),
                }
            }
        }
    }
}
