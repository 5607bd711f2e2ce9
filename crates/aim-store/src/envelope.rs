use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aim_core::constants::STORAGE_MAGIC;
use aim_core::AimError;
use aim_crypto::StorageCipher;
use tracing::{debug, warn};

/// Reads and writes store files through the versioned at-rest envelope:
/// the magic header `AIMENC1\n` followed by AEAD ciphertext. Without a
/// configured storage secret files are plain serialized bytes; with one,
/// envelope-less files found on disk are legacy plaintext and are migrated
/// to the envelope on first open.
#[derive(Clone)]
pub struct EnvelopeCodec {
    cipher: Option<StorageCipher>,
}

impl EnvelopeCodec {
    pub fn plaintext() -> Self {
        Self { cipher: None }
    }

    pub fn encrypted(cipher: StorageCipher) -> Self {
        Self { cipher: Some(cipher) }
    }

    pub fn from_passphrase(passphrase: Option<&str>) -> Self {
        match passphrase {
            Some(p) if !p.is_empty() => Self::encrypted(StorageCipher::from_passphrase(p)),
            _ => Self::plaintext(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Create `dir` (and parents) with owner-only permissions.
    pub fn ensure_dir(dir: &Path) -> Result<(), AimError> {
        fs::create_dir_all(dir).map_err(|e| AimError::Storage(format!("{}: {e}", dir.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(dir, perms)
                .map_err(|e| AimError::Storage(format!("{}: {e}", dir.display())))?;
        }
        Ok(())
    }

    /// Atomically write `plaintext` to `path`: temp file in the same
    /// directory, flushed, then renamed over the target.
    pub fn write_file(&self, path: &Path, plaintext: &[u8]) -> Result<(), AimError> {
        let parent = path
            .parent()
            .ok_or_else(|| AimError::Storage(format!("no parent dir for {}", path.display())))?;
        Self::ensure_dir(parent)?;

        let bytes = match &self.cipher {
            None => plaintext.to_vec(),
            Some(cipher) => {
                let sealed = cipher.seal(plaintext)?;
                let mut out = Vec::with_capacity(STORAGE_MAGIC.len() + sealed.len());
                out.extend_from_slice(STORAGE_MAGIC);
                out.extend_from_slice(&sealed);
                out
            }
        };

        let tmp = tmp_path(path);
        let write = || -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(AimError::Storage(format!("{}: {e}", path.display())));
        }
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            AimError::Storage(format!("{}: {e}", path.display()))
        })
    }

    /// Read `path`, unsealing the envelope when present. Returns `None` for a
    /// missing file. A legacy plaintext file under an encrypted codec is
    /// migrated to the envelope before returning.
    pub fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, AimError> {
        let raw = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AimError::Storage(format!("{}: {e}", path.display()))),
        };

        let enveloped = raw.starts_with(STORAGE_MAGIC);
        match (&self.cipher, enveloped) {
            (Some(cipher), true) => {
                let plain = cipher.open(&raw[STORAGE_MAGIC.len()..])?;
                Ok(Some(plain))
            }
            (Some(_), false) => {
                // Legacy plaintext; opportunistic migration to the envelope.
                debug!(file = %path.display(), "migrating legacy plaintext file to envelope");
                if let Err(e) = self.write_file(path, &raw) {
                    warn!(file = %path.display(), error = %e, "legacy migration failed; continuing with plaintext read");
                }
                Ok(Some(raw))
            }
            (None, true) => Err(AimError::Storage(format!(
                "{} is encrypted but no storage secret is configured",
                path.display()
            ))),
            (None, false) => Ok(Some(raw)),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let codec = EnvelopeCodec::plaintext();
        codec.write_file(&path, b"{\"v\":1}").unwrap();
        assert_eq!(codec.read_file(&path).unwrap().unwrap(), b"{\"v\":1}");
    }

    #[test]
    fn encrypted_file_carries_magic_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let codec = EnvelopeCodec::from_passphrase(Some("pw"));
        codec.write_file(&path, b"payload").unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert!(raw.starts_with(b"AIMENC1\n"));
        assert!(!raw.windows(7).any(|w| w == b"payload"));
        assert_eq!(codec.read_file(&path).unwrap().unwrap(), b"payload");
    }

    #[test]
    fn legacy_plaintext_is_migrated_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"legacy contents").unwrap();

        let codec = EnvelopeCodec::from_passphrase(Some("pw"));
        assert_eq!(codec.read_file(&path).unwrap().unwrap(), b"legacy contents");

        // Second read goes through the envelope.
        let raw = std::fs::read(&path).unwrap();
        assert!(raw.starts_with(b"AIMENC1\n"));
        assert_eq!(codec.read_file(&path).unwrap().unwrap(), b"legacy contents");
    }

    #[test]
    fn encrypted_without_secret_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        EnvelopeCodec::from_passphrase(Some("pw")).write_file(&path, b"x").unwrap();
        assert!(EnvelopeCodec::plaintext().read_file(&path).is_err());
    }

    #[test]
    fn missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let codec = EnvelopeCodec::plaintext();
        assert!(codec.read_file(&dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn unwritable_target_leaves_no_partial_state() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a dir").unwrap();

        // Parent path is a regular file, so the write cannot proceed.
        let codec = EnvelopeCodec::plaintext();
        assert!(codec.write_file(&blocker.join("store.json"), b"x").is_err());
    }
}
