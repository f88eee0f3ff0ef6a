//! Remote filesystem access over SFTP

use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Metadata of a remote file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    /// Size in bytes
    pub size: Option<u64>,
    /// Owner user id
    pub uid: Option<u32>,
    /// Owner group id
    pub gid: Option<u32>,
    /// Mode bits, including the file type bits
    pub perm: Option<u32>,
    /// Last access time (seconds since the epoch)
    pub atime: Option<u64>,
    /// Last modification time (seconds since the epoch)
    pub mtime: Option<u64>,
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

impl RemoteMetadata {
    fn file_type(&self) -> Option<u32> {
        self.perm.map(|perm| perm & S_IFMT)
    }

    /// Whether the entry is a directory
    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(S_IFDIR)
    }

    /// Whether the entry is a regular file
    pub fn is_file(&self) -> bool {
        self.file_type() == Some(S_IFREG)
    }

    /// Whether the entry is a symbolic link (only meaningful for `lstat`)
    pub fn is_symlink(&self) -> bool {
        self.file_type() == Some(S_IFLNK)
    }
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Full remote path of the entry
    pub path: PathBuf,
    /// Entry metadata
    pub metadata: RemoteMetadata,
}

impl DirEntry {
    /// File name component of the entry
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

/// The fixed set of path operations available on a remote host.
///
/// Relative paths are resolved against the working directory set with
/// [`RemoteFilesystem::chdir`].
#[async_trait]
pub trait RemoteFilesystem: Send + Sync {
    /// Change the working directory used for relative paths
    async fn chdir(&self, path: &Path) -> Result<(), TransportError>;

    /// Current working directory
    async fn getcwd(&self) -> Result<PathBuf, TransportError>;

    /// Metadata, following symlinks
    async fn stat(&self, path: &Path) -> Result<RemoteMetadata, TransportError>;

    /// Metadata, not following symlinks
    async fn lstat(&self, path: &Path) -> Result<RemoteMetadata, TransportError>;

    /// List a directory, excluding `.` and `..`
    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, TransportError>;

    /// Create a directory with `mode`
    async fn mkdir(&self, path: &Path, mode: i32) -> Result<(), TransportError>;

    /// Remove an empty directory
    async fn rmdir(&self, path: &Path) -> Result<(), TransportError>;

    /// Remove a file
    async fn remove(&self, path: &Path) -> Result<(), TransportError>;

    /// Rename `from` to `to`
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), TransportError>;

    /// Create a symlink at `path` pointing to `target`
    async fn symlink(&self, target: &Path, path: &Path) -> Result<(), TransportError>;

    /// Target of a symlink
    async fn readlink(&self, path: &Path) -> Result<PathBuf, TransportError>;

    /// Canonical absolute form of `path`
    async fn realpath(&self, path: &Path) -> Result<PathBuf, TransportError>;

    /// Set permission bits
    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), TransportError>;

    /// Read a whole remote file
    async fn read_file(&self, path: &Path) -> Result<Bytes, TransportError>;

    /// Create or truncate a remote file and write `data` to it
    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<u64, TransportError>;

    /// Whether `path` exists. Only a not-found failure yields `false`.
    async fn exists(&self, path: &Path) -> Result<bool, TransportError> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Resolve `path` against `cwd` unless it is already absolute
pub fn resolve_path(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[cfg(feature = "ssh2")]
pub use self::libssh2::SftpFilesystem;

#[cfg(feature = "ssh2")]
mod libssh2 {
    use super::*;
    use crate::error::blocking;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};
    use tracing::debug;

    impl From<ssh2::FileStat> for RemoteMetadata {
        fn from(stat: ssh2::FileStat) -> Self {
            Self {
                size: stat.size,
                uid: stat.uid,
                gid: stat.gid,
                perm: stat.perm,
                atime: stat.atime,
                mtime: stat.mtime,
            }
        }
    }

    /// [`RemoteFilesystem`] over a libssh2 SFTP subsystem
    pub struct SftpFilesystem {
        sftp: Arc<Mutex<ssh2::Sftp>>,
        cwd: Mutex<PathBuf>,
    }

    impl SftpFilesystem {
        /// Wrap an SFTP handle, starting in the server's default directory
        pub async fn open(sftp: ssh2::Sftp) -> Result<Self, TransportError> {
            let fs = Self {
                sftp: Arc::new(Mutex::new(sftp)),
                cwd: Mutex::new(PathBuf::from(".")),
            };
            let home = fs.call(|sftp| Ok(sftp.realpath(Path::new("."))?)).await?;
            debug!("SFTP working directory: {}", home.display());
            fs.set_cwd(home)?;
            Ok(fs)
        }

        fn cwd(&self) -> Result<PathBuf, TransportError> {
            self.cwd
                .lock()
                .map(|cwd| cwd.clone())
                .map_err(|_| TransportError::Sftp("working directory lock poisoned".to_string()))
        }

        fn set_cwd(&self, path: PathBuf) -> Result<(), TransportError> {
            let mut cwd = self
                .cwd
                .lock()
                .map_err(|_| TransportError::Sftp("working directory lock poisoned".to_string()))?;
            *cwd = path;
            Ok(())
        }

        fn resolve(&self, path: &Path) -> Result<PathBuf, TransportError> {
            Ok(resolve_path(&self.cwd()?, path))
        }

        async fn call<F, T>(&self, op: F) -> Result<T, TransportError>
        where
            F: FnOnce(&ssh2::Sftp) -> Result<T, TransportError> + Send + 'static,
            T: Send + 'static,
        {
            let sftp = Arc::clone(&self.sftp);
            blocking(move || {
                let sftp = sftp
                    .lock()
                    .map_err(|_| TransportError::Sftp("sftp lock poisoned".to_string()))?;
                op(&sftp)
            })
            .await
        }
    }

    #[async_trait]
    impl RemoteFilesystem for SftpFilesystem {
        async fn chdir(&self, path: &Path) -> Result<(), TransportError> {
            let target = self.resolve(path)?;
            let resolved = self
                .call(move |sftp| {
                    let resolved = sftp.realpath(&target)?;
                    let stat = RemoteMetadata::from(sftp.stat(&resolved)?);
                    if !stat.is_dir() {
                        return Err(TransportError::Sftp(format!(
                            "not a directory: {}",
                            resolved.display()
                        )));
                    }
                    Ok(resolved)
                })
                .await?;
            self.set_cwd(resolved)
        }

        async fn getcwd(&self) -> Result<PathBuf, TransportError> {
            self.cwd()
        }

        async fn stat(&self, path: &Path) -> Result<RemoteMetadata, TransportError> {
            let path = self.resolve(path)?;
            self.call(move |sftp| Ok(sftp.stat(&path)?.into())).await
        }

        async fn lstat(&self, path: &Path) -> Result<RemoteMetadata, TransportError> {
            let path = self.resolve(path)?;
            self.call(move |sftp| Ok(sftp.lstat(&path)?.into())).await
        }

        async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, TransportError> {
            let path = self.resolve(path)?;
            self.call(move |sftp| {
                let entries = sftp
                    .readdir(&path)?
                    .into_iter()
                    .filter(|(entry, _)| {
                        !matches!(entry.file_name().and_then(|n| n.to_str()), Some(".") | Some(".."))
                    })
                    .map(|(path, stat)| DirEntry { path, metadata: stat.into() })
                    .collect();
                Ok(entries)
            })
            .await
        }

        async fn mkdir(&self, path: &Path, mode: i32) -> Result<(), TransportError> {
            let path = self.resolve(path)?;
            self.call(move |sftp| Ok(sftp.mkdir(&path, mode)?)).await
        }

        async fn rmdir(&self, path: &Path) -> Result<(), TransportError> {
            let path = self.resolve(path)?;
            self.call(move |sftp| Ok(sftp.rmdir(&path)?)).await
        }

        async fn remove(&self, path: &Path) -> Result<(), TransportError> {
            let path = self.resolve(path)?;
            self.call(move |sftp| Ok(sftp.unlink(&path)?)).await
        }

        async fn rename(&self, from: &Path, to: &Path) -> Result<(), TransportError> {
            let from = self.resolve(from)?;
            let to = self.resolve(to)?;
            self.call(move |sftp| Ok(sftp.rename(&from, &to, None)?)).await
        }

        async fn symlink(&self, target: &Path, path: &Path) -> Result<(), TransportError> {
            let path = self.resolve(path)?;
            let target = target.to_path_buf();
            // libssh2 creates the link at its second argument
            self.call(move |sftp| Ok(sftp.symlink(&target, &path)?)).await
        }

        async fn readlink(&self, path: &Path) -> Result<PathBuf, TransportError> {
            let path = self.resolve(path)?;
            self.call(move |sftp| Ok(sftp.readlink(&path)?)).await
        }

        async fn realpath(&self, path: &Path) -> Result<PathBuf, TransportError> {
            let path = self.resolve(path)?;
            self.call(move |sftp| Ok(sftp.realpath(&path)?)).await
        }

        async fn chmod(&self, path: &Path, mode: u32) -> Result<(), TransportError> {
            let path = self.resolve(path)?;
            self.call(move |sftp| {
                let stat = ssh2::FileStat {
                    size: None,
                    uid: None,
                    gid: None,
                    perm: Some(mode),
                    atime: None,
                    mtime: None,
                };
                Ok(sftp.setstat(&path, stat)?)
            })
            .await
        }

        async fn read_file(&self, path: &Path) -> Result<Bytes, TransportError> {
            let path = self.resolve(path)?;
            self.call(move |sftp| {
                let mut file = sftp.open(&path)?;
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(Bytes::from(data))
            })
            .await
        }

        async fn write_file(&self, path: &Path, data: &[u8]) -> Result<u64, TransportError> {
            let path = self.resolve(path)?;
            let data = data.to_vec();
            self.call(move |sftp| {
                let mut file = sftp.create(&path)?;
                file.write_all(&data)?;
                Ok(data.len() as u64)
            })
            .await
        }
    }
}
