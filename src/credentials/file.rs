//! Protected-permission file storage for local deployments.
//!
//! The credential lives in one JSON document next to its version. Writes go
//! to a sibling temp file created with mode 0600 and are renamed into place,
//! so readers never observe a half-written file. Clearing leaves the version
//! behind with no credential, so versions keep counting upward.

use super::{BrokerageCredential, StoreError, StoredCredential, TokenStore};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Serialize, Deserialize)]
struct TokenFile {
    version: u64,
    credential: Option<BrokerageCredential>,
}

pub struct FileTokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    fn read(&self) -> Result<Option<TokenFile>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        let file = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(Some(file))
    }

    fn write(&self, file: &TokenFile) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(file).context("Failed to serialize credential")?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut tmp = options
            .open(&tmp_path)
            .with_context(|| format!("Failed to open {}", tmp_path.display()))?;
        tmp.write_all(&json).context("Failed to write credential")?;
        tmp.sync_all().context("Failed to sync credential")?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<StoredCredential>, StoreError> {
        Ok(self.read()?.and_then(|file| {
            file.credential.map(|credential| StoredCredential {
                credential,
                version: file.version,
            })
        }))
    }

    fn save(
        &self,
        credential: &BrokerageCredential,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().expect("token file lock poisoned");

        let current = self.read()?;
        let found = current
            .as_ref()
            .filter(|file| file.credential.is_some())
            .map(|file| file.version);
        if found != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                found,
            });
        }

        let version = current.map_or(0, |file| file.version) + 1;
        self.write(&TokenFile {
            version,
            credential: Some(credential.clone()),
        })?;
        Ok(version)
    }

    fn clear(&self) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().expect("token file lock poisoned");
        match self.read()? {
            Some(TokenFile {
                version,
                credential: Some(_),
            }) => {
                self.write(&TokenFile {
                    version,
                    credential: None,
                })?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
