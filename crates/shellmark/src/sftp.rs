//! SFTP sessions

use crate::{Instrumentation, Result, ShellmarkError};
use bytes::Bytes;
use shellmark_ssh::{Connection, DirEntry, RemoteFilesystem, RemoteMetadata, TransportError};
use std::fmt::Debug;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Remote filesystem operations over one connection.
///
/// Each call is logged through the session's [`Instrumentation`] and
/// forwarded to the underlying [`RemoteFilesystem`]. Relative paths resolve
/// against the session's working directory.
pub struct SftpSession {
    connection: Arc<dyn Connection>,
    fs: Box<dyn RemoteFilesystem>,
    instrumentation: Instrumentation,
}

impl SftpSession {
    /// Start an SFTP subsystem on `connection`
    pub async fn open(connection: Arc<dyn Connection>) -> Result<Self> {
        if !connection.is_connected() {
            return Err(ShellmarkError::Connection("no active session".to_string()));
        }
        let fs = connection.open_sftp().await?;
        Ok(Self {
            connection,
            fs,
            instrumentation: Instrumentation::default(),
        })
    }

    /// Log through `instrumentation`
    pub fn with_instrumentation(mut self, instrumentation: Instrumentation) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// Change the working directory
    pub async fn chdir(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.call("chdir", &path, self.fs.chdir(path)).await
    }

    /// Current working directory
    pub async fn getcwd(&self) -> Result<PathBuf> {
        self.call("getcwd", &"", self.fs.getcwd()).await
    }

    /// Metadata, following symlinks
    pub async fn stat(&self, path: impl AsRef<Path>) -> Result<RemoteMetadata> {
        let path = path.as_ref();
        self.call("stat", &path, self.fs.stat(path)).await
    }

    /// Metadata of the link itself
    pub async fn lstat(&self, path: impl AsRef<Path>) -> Result<RemoteMetadata> {
        let path = path.as_ref();
        self.call("lstat", &path, self.fs.lstat(path)).await
    }

    /// Directory entries, without `.` and `..`
    pub async fn list_dir(&self, path: impl AsRef<Path>) -> Result<Vec<DirEntry>> {
        let path = path.as_ref();
        self.call("list_dir", &path, self.fs.list_dir(path)).await
    }

    /// Entry names in a directory
    pub async fn list_names(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let entries = self.list_dir(path).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.file_name().map(str::to_string))
            .collect())
    }

    /// Create a directory with `mode`
    pub async fn mkdir(&self, path: impl AsRef<Path>, mode: i32) -> Result<()> {
        let path = path.as_ref();
        self.call("mkdir", &path, self.fs.mkdir(path, mode)).await
    }

    /// Remove an empty directory
    pub async fn rmdir(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.call("rmdir", &path, self.fs.rmdir(path)).await
    }

    /// Remove a file
    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.call("remove", &path, self.fs.remove(path)).await
    }

    /// Rename a file or directory
    pub async fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let (from, to) = (from.as_ref(), to.as_ref());
        self.call("rename", &(from, to), self.fs.rename(from, to)).await
    }

    /// Create a symlink at `path` pointing to `target`
    pub async fn symlink(&self, target: impl AsRef<Path>, path: impl AsRef<Path>) -> Result<()> {
        let (target, path) = (target.as_ref(), path.as_ref());
        self.call("symlink", &(target, path), self.fs.symlink(target, path)).await
    }

    /// Target of a symlink
    pub async fn readlink(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        self.call("readlink", &path, self.fs.readlink(path)).await
    }

    /// Canonical absolute path
    pub async fn realpath(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        self.call("realpath", &path, self.fs.realpath(path)).await
    }

    /// Change permission bits
    pub async fn chmod(&self, path: impl AsRef<Path>, mode: u32) -> Result<()> {
        let path = path.as_ref();
        self.call("chmod", &path, self.fs.chmod(path, mode)).await
    }

    /// Whether `path` exists
    pub async fn exists(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        self.call("exists", &path, self.fs.exists(path)).await
    }

    /// Read a whole remote file
    pub async fn read(&self, path: impl AsRef<Path>) -> Result<Bytes> {
        let path = path.as_ref();
        self.call("read", &path, self.fs.read_file(path)).await
    }

    /// Create or replace a remote file, returning the bytes written
    pub async fn write(&self, path: impl AsRef<Path>, data: &[u8]) -> Result<u64> {
        let path = path.as_ref();
        self.call("write", &path, self.fs.write_file(path, data)).await
    }

    /// Upload a local file
    pub async fn put(&self, local: impl AsRef<Path>, remote: impl AsRef<Path>) -> Result<u64> {
        let local = local.as_ref();
        debug!("Uploading {:?} -> {:?}", local, remote.as_ref());
        let content = tokio::fs::read(local).await?;
        self.write(remote, &content).await
    }

    /// Download a remote file
    pub async fn get(&self, remote: impl AsRef<Path>, local: impl AsRef<Path>) -> Result<u64> {
        let local = local.as_ref();
        debug!("Downloading {:?} -> {:?}", remote.as_ref(), local);
        let content = self.read(remote).await?;
        tokio::fs::write(local, &content).await?;
        Ok(content.len() as u64)
    }

    async fn call<F, T>(
        &self,
        operation: &'static str,
        subject: &(dyn Debug + Sync),
        call: F,
    ) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
        T: Debug,
    {
        let call = async { call.await.map_err(ShellmarkError::from) };
        self.instrumentation.operation(operation, subject, call).await
    }

    /// Close the connection this session runs on
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await?;
        Ok(())
    }
}
