//! Socket listener
//!
//! Binding creates the parent directory, clears a stale socket file left by a
//! crashed agent and restricts the socket to its owner. The socket file is
//! removed again on cleanup.

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};

use super::ServerError;

/// Bound Unix socket listener
pub struct SocketListener {
    path: PathBuf,
    listener: UnixListener,
}

impl SocketListener {
    /// Binds the socket at `path`
    ///
    /// Fails with [`ServerError::AlreadyInUse`] when another process is still
    /// accepting on the path.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, ServerError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            ensure_directory(parent)?;
        }
        remove_stale_socket(&path)?;

        let listener = UnixListener::bind(&path).map_err(|source| ServerError::Bind {
            path: path.clone(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(socket_path = %path.display(), "Listener bound");

        Ok(Self { path, listener })
    }

    /// Waits for the next connection
    pub async fn accept(&self) -> Result<UnixStream, ServerError> {
        let (stream, _addr) = self.listener.accept().await?;
        tracing::debug!("Accepted connection");
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the socket file
    pub fn cleanup(&self) -> Result<(), ServerError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(socket_path = %self.path.display(), "Removed socket file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(socket_path = %self.path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

fn ensure_directory(path: &Path) -> Result<(), ServerError> {
    if path.as_os_str().is_empty() || path.exists() {
        return Ok(());
    }

    std::fs::create_dir_all(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<(), ServerError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            return Err(ServerError::NotASocket(path.to_path_buf()));
        }
    }

    // A successful connect means a live agent owns the socket.
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(ServerError::AlreadyInUse(path.to_path_buf()));
    }

    std::fs::remove_file(path)?;
    tracing::debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn test_bind_creates_socket_with_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scrollwork.sock");

        let listener = SocketListener::bind(&path).unwrap();

        assert!(path.exists());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(listener.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrollwork.sock");

        // A std listener dropped without cleanup leaves the file behind.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let _listener = SocketListener::bind(&path).unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_bind_rejects_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrollwork.sock");

        let _first = SocketListener::bind(&path).unwrap();
        let second = SocketListener::bind(&path);

        assert!(matches!(second, Err(ServerError::AlreadyInUse(_))));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_bind_rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrollwork.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        assert!(matches!(
            SocketListener::bind(&path),
            Err(ServerError::NotASocket(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrollwork.sock");

        let listener = SocketListener::bind(&path).unwrap();
        listener.cleanup().unwrap();
        assert!(!path.exists());

        // Second cleanup is a no-op
        listener.cleanup().unwrap();
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_accept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrollwork.sock");
        let listener = SocketListener::bind(&path).unwrap();

        let (accepted, connected) = tokio::join!(listener.accept(), UnixStream::connect(&path));
        assert!(accepted.is_ok());
        assert!(connected.is_ok());
    }
}
