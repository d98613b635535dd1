//! Pairing handshake
//!
//! Inbound: `POST /api/link` carries exactly one base64 identity. Accepted
//! requests leave a marker under `pending/<fs-safe identity>/`. A marker whose
//! name matches case-insensitively but not exactly is treated as a forged or
//! colliding request: it is deleted and the request is refused.
//!
//! Outbound: [`PairingClient::pair`] fetches a branch's published keys,
//! records it in the [`PeerStore`], and submits our own identity to it.

use crate::peer_store::{PeerStore, StoreError};
use parking_lot::Mutex;
use sdwan_core::{Identity, IdentityError, IDENTITY_TEXT_LEN};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Largest accepted link body: the identity plus one trailing newline
pub const MAX_LINK_BODY: usize = IDENTITY_TEXT_LEN + 1;

/// Pairing errors
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("Content-Length {0:?} outside {IDENTITY_TEXT_LEN}..={MAX_LINK_BODY}")]
    BadLength(Option<u64>),
    #[error("Malformed identity: {0}")]
    Malformed(#[from] IdentityError),
    #[error("Pending link '{existing}' collides with {requested}")]
    Conflict { existing: String, requested: Identity },
    #[error("Failed to remove conflicting pending link {path}: {source}")]
    Invariant {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid pairing target '{0}'")]
    BadTarget(String),
    #[error("Refusing to pair with our own identity")]
    SelfPair,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} responded with {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Validate a link request's Content-Length before touching the body
pub fn check_content_length(length: Option<u64>) -> Result<(), PairingError> {
    match length {
        Some(n) if (IDENTITY_TEXT_LEN as u64..=MAX_LINK_BODY as u64).contains(&n) => Ok(()),
        other => Err(PairingError::BadLength(other)),
    }
}

/// Decode the identity carried by a link request body
pub fn parse_link_body(body: &[u8]) -> Result<Identity, PairingError> {
    let text =
        std::str::from_utf8(body).map_err(|e| IdentityError::Base64(e.to_string()))?;
    Ok(text.parse()?)
}

/// Result of accepting a link request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    /// The exact same identity was already pending
    AlreadyPending,
}

/// Markers for inbound link requests awaiting an operator
pub struct PendingLinks {
    root: PathBuf,
    // scan-then-create must not interleave between requests
    lock: Mutex<()>,
}

impl PendingLinks {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record a pending link for `identity`
    pub fn submit(&self, identity: &Identity) -> Result<LinkOutcome, PairingError> {
        let _guard = self.lock.lock();
        let wanted = identity.to_path();

        match fs::read_dir(&self.root) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name == wanted {
                        debug!("Link from {} already pending", identity.short());
                        return Ok(LinkOutcome::AlreadyPending);
                    }
                    if name.eq_ignore_ascii_case(&wanted) {
                        warn!(
                            "Pending link '{}' matches {} case-insensitively; rejecting and deleting",
                            name, identity
                        );
                        let path = entry.path();
                        remove_marker(&path)
                            .map_err(|source| PairingError::Invariant { path, source })?;
                        return Err(PairingError::Conflict {
                            existing: name.into_owned(),
                            requested: *identity,
                        });
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        fs::create_dir_all(self.root.join(&wanted))?;
        info!("Pending link from {}", identity);
        Ok(LinkOutcome::Created)
    }

    /// Identities with a pending link, in name order
    pub fn list(&self) -> Result<Vec<Identity>, PairingError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut pending = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            match Identity::from_path(&name) {
                Ok(identity) => pending.push(identity),
                Err(e) => warn!("Ignoring pending entry '{}': {}", name, e),
            }
        }
        pending.sort();
        Ok(pending)
    }
}

fn remove_marker(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Outcome of an outbound pairing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Paired {
    pub identity: Identity,
    pub host: String,
    /// `false` when the peer was already in the store
    pub registered: bool,
}

/// Client side of the handshake
pub struct PairingClient {
    http: reqwest::Client,
}

impl PairingClient {
    pub fn new(timeout: Duration) -> Result<Self, PairingError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sdwand/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    async fn fetch(&self, url: &str) -> Result<String, PairingError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(PairingError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        Ok(response.text().await?)
    }

    /// Pair with the branch at `target` (`host` or `host:port`)
    pub async fn pair(
        &self,
        target: &str,
        local: &Identity,
        store: &PeerStore,
    ) -> Result<Paired, PairingError> {
        let base = reqwest::Url::parse(&format!("http://{}", target))
            .map_err(|_| PairingError::BadTarget(target.to_string()))?;
        let host = base
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| PairingError::BadTarget(target.to_string()))?;
        let base = base.as_str().trim_end_matches('/').to_string();

        let identity: Identity = self
            .fetch(&format!("{}/api/keys/wireguard", base))
            .await?
            .parse()?;
        if identity == *local {
            return Err(PairingError::SelfPair);
        }
        let ssh_keys = self.fetch(&format!("{}/api/keys/ssh", base)).await?;
        info!("Got public keys from {} - wg: {}", target, identity);

        let registered = store.register(identity, Some(&host), Some(&ssh_keys))?;

        let url = format!("{}/api/link", base);
        let response = self
            .http
            .post(&url)
            .body(local.to_base64())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PairingError::Status {
                url,
                status: response.status(),
            });
        }

        Ok(Paired {
            identity,
            host,
            registered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lettered() -> Identity {
        // plenty of letters in the base64 form
        Identity::from_bytes([0x61; 32])
    }

    fn swap_case(s: &str) -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_lowercase() {
                    c.to_ascii_uppercase()
                } else {
                    c.to_ascii_lowercase()
                }
            })
            .collect()
    }

    #[test]
    fn test_content_length_bounds() {
        assert!(check_content_length(Some(44)).is_ok());
        assert!(check_content_length(Some(45)).is_ok());
        assert!(matches!(
            check_content_length(Some(43)),
            Err(PairingError::BadLength(Some(43)))
        ));
        assert!(check_content_length(Some(46)).is_err());
        assert!(check_content_length(None).is_err());
    }

    #[test]
    fn test_parse_link_body() {
        let id = lettered();
        assert_eq!(parse_link_body(id.to_base64().as_bytes()).unwrap(), id);
        assert_eq!(
            parse_link_body(format!("{}\n", id).as_bytes()).unwrap(),
            id
        );
        assert!(parse_link_body(&[b'!'; 44]).is_err());
        assert!(parse_link_body(&[0xff; 44]).is_err());
    }

    #[test]
    fn test_submit_creates_marker() {
        let dir = tempdir().unwrap();
        let pending = PendingLinks::new(dir.path().join("pending"));
        let id = lettered();

        assert_eq!(pending.submit(&id).unwrap(), LinkOutcome::Created);
        assert!(dir.path().join("pending").join(id.to_path()).is_dir());
        assert_eq!(pending.submit(&id).unwrap(), LinkOutcome::AlreadyPending);
        assert_eq!(pending.list().unwrap(), vec![id]);
    }

    #[test]
    fn test_case_collision_rejected_and_removed() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("pending");
        let id = lettered();
        let forged = swap_case(&id.to_path());
        assert_ne!(forged, id.to_path());
        fs::create_dir_all(root.join(&forged)).unwrap();

        let pending = PendingLinks::new(&root);
        let err = pending.submit(&id).unwrap_err();
        assert!(matches!(err, PairingError::Conflict { ref existing, .. } if *existing == forged));
        assert!(!root.join(&forged).exists());
        assert!(!root.join(id.to_path()).exists());

        // the next request goes through
        assert_eq!(pending.submit(&id).unwrap(), LinkOutcome::Created);
    }

    #[test]
    fn test_list_without_directory() {
        let dir = tempdir().unwrap();
        let pending = PendingLinks::new(dir.path().join("missing"));
        assert!(pending.list().unwrap().is_empty());
    }
}
