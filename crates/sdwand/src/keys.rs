//! Key material: the WireGuard private key and published SSH keys
//!
//! A node's identity is the X25519 public key of its WireGuard private key.

use rand::rngs::OsRng;
use sdwan_core::{Identity, IdentityError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

/// Key errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed private key in {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: IdentityError,
    },
    #[error("Refusing to overwrite existing key {0}")]
    Exists(PathBuf),
    #[error("No readable SSH public keys in {0}")]
    NoSshKeys(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> KeyError + '_ {
    move |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Identity belonging to a private key
pub fn identity_of(secret: &StaticSecret) -> Identity {
    Identity::from_bytes(PublicKey::from(secret).to_bytes())
}

/// Load a base64 WireGuard private key
pub fn load_private_key(path: &Path) -> Result<StaticSecret, KeyError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    // same 44-character base64 shape as a public identity
    let raw: Identity = text.parse().map_err(|source| KeyError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(StaticSecret::from(*raw.as_bytes()))
}

/// Load the node identity from its private key file
pub fn load_identity(path: &Path) -> Result<Identity, KeyError> {
    let identity = identity_of(&load_private_key(path)?);
    debug!("Derived identity {} from {}", identity, path.display());
    Ok(identity)
}

/// Write a fresh private key (mode 0600) and return its identity
pub fn generate_private_key(path: &Path, force: bool) -> Result<Identity, KeyError> {
    if path.exists() && !force {
        return Err(KeyError::Exists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    let secret = StaticSecret::random_from_rng(OsRng);
    let text = Identity::from_bytes(secret.to_bytes()).to_base64();

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(io_error(path))?;
    writeln!(file, "{}", text).map_err(io_error(path))?;

    let identity = identity_of(&secret);
    info!("Wrote new private key to {} (identity {})", path.display(), identity);
    Ok(identity)
}

/// Concatenate every `*.pub` file in `dir`, in name order
pub fn load_ssh_keys(dir: &Path) -> Result<String, KeyError> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_error(dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "pub"))
        .collect();
    paths.sort();

    let mut keys = String::new();
    for path in &paths {
        match fs::read_to_string(path) {
            Ok(key) => {
                keys.push_str(&key);
                if !key.ends_with('\n') {
                    keys.push('\n');
                }
            }
            Err(e) => warn!("Error reading {}: {}", path.display(), e),
        }
    }

    if keys.is_empty() {
        return Err(KeyError::NoSshKeys(dir.to_path_buf()));
    }
    info!("Found {} SSH public keys in {}", paths.len(), dir.display());
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tempfile::tempdir;

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_identity_matches_x25519_vector() {
        // RFC 7748 section 6.1, Alice
        let private = unhex("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a");
        let public = unhex("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a");

        let dir = tempdir().unwrap();
        let path = dir.path().join("private");
        fs::write(&path, format!("{}\n", STANDARD.encode(&private))).unwrap();

        let identity = load_identity(&path).unwrap();
        assert_eq!(identity.as_bytes().as_slice(), public.as_slice());
    }

    #[test]
    fn test_generate_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wireguard").join("private");

        let generated = generate_private_key(&path, false).unwrap();
        assert_eq!(load_identity(&path).unwrap(), generated);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(matches!(
            generate_private_key(&path, false),
            Err(KeyError::Exists(_))
        ));
        assert_ne!(generate_private_key(&path, true).unwrap(), generated);
    }

    #[test]
    fn test_malformed_key_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("private");
        fs::write(&path, "not a key").unwrap();
        assert!(matches!(load_identity(&path), Err(KeyError::Malformed { .. })));
    }

    #[test]
    fn test_ssh_keys_concatenated() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("id_b.pub"), "ssh-ed25519 BBBB b@host\n").unwrap();
        fs::write(dir.path().join("id_a.pub"), "ssh-ed25519 AAAA a@host").unwrap();
        fs::write(dir.path().join("id_a"), "PRIVATE").unwrap();

        let keys = load_ssh_keys(dir.path()).unwrap();
        assert_eq!(keys, "ssh-ed25519 AAAA a@host\nssh-ed25519 BBBB b@host\n");
    }

    #[test]
    fn test_no_ssh_keys_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(load_ssh_keys(dir.path()), Err(KeyError::NoSshKeys(_))));
    }
}
