//! Persistent per-host server identity.
//!
//! The server id is advertised to clients during the handshake so a
//! returning client can fast-path pairing. It must survive restarts and
//! never change once generated.

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// 32 lowercase hex characters, no separators.
pub type ServerId = String;

const STORE_DIR: &str = ".pier";
const STORE_FILE: &str = "identity.toml";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unable to determine home directory")]
    NoHome,
    #[error("identity store io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("identity store is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    server_id: String,
}

pub struct ServerIdStore {
    path: PathBuf,
}

impl ServerIdStore {
    pub fn open_default() -> Result<Self, IdentityError> {
        let base = BaseDirs::new().ok_or(IdentityError::NoHome)?;
        let path = base.home_dir().join(STORE_DIR).join(STORE_FILE);
        Ok(Self { path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Return the stored server id, generating and persisting a fresh one
    /// on first use. Two processes racing the first write each finish with
    /// a complete value: the write goes to a temp file and is renamed into
    /// place, so a reader never observes a partial record.
    pub fn load_or_create(&self) -> Result<ServerId, IdentityError> {
        if let Some(existing) = self.read_existing()? {
            return Ok(existing);
        }

        let fresh = Uuid::new_v4().simple().to_string();
        self.persist(&fresh)?;
        Ok(fresh)
    }

    fn read_existing(&self) -> Result<Option<ServerId>, IdentityError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(IdentityError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let parsed: IdentityFile =
            toml::from_str(&raw).map_err(|err| IdentityError::Corrupt(err.to_string()))?;
        if !is_server_id(&parsed.server_id) {
            return Err(IdentityError::Corrupt(format!(
                "server id {:?} is not 32 lowercase hex characters",
                parsed.server_id
            )));
        }
        Ok(Some(parsed.server_id))
    }

    fn persist(&self, server_id: &str) -> Result<(), IdentityError> {
        let io_err = |source| IdentityError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let record = IdentityFile {
            server_id: server_id.to_string(),
        };
        let serialized = toml::to_string_pretty(&record)
            .map_err(|err| IdentityError::Corrupt(err.to_string()))?;

        let tmp = self.path.with_extension("toml.tmp");
        write_private(&tmp, serialized.as_bytes()).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn is_server_id(value: &str) -> bool {
    value.len() == 32
        && value
            .chars()
            .all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase())
}
