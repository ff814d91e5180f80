//! Platform-specific pipe/socket implementation.
//!
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//!
//! # Example
//!
//! ```ignore
//! use spawn_tracer::transport::{pipe_path, ClientIdentity, PipeListener};
//!
//! let mut listener = PipeListener::bind(&pipe_path("SpawnCamper")).await?;
//! let stream = listener.accept().await?;
//! let pid = stream.client_process_id()?;
//! ```

use crate::error::{Result, TracerError};
use crate::Pid;
use tokio::io::AsyncRead;

/// Resolve the OS process id on the other end of a connection.
pub trait ClientIdentity {
    fn client_process_id(&self) -> Result<Pid>;
}

/// Map a channel name to a platform path.
///
/// Format:
/// - Unix: `$XDG_RUNTIME_DIR/{name}.sock`, falling back to the temp dir
/// - Windows: `\\.\pipe\{name}`
///
/// Absolute paths (or full pipe paths on Windows) are returned unchanged.
pub fn pipe_path(name: &str) -> String {
    #[cfg(unix)]
    {
        use std::path::{Path, PathBuf};

        if Path::new(name).is_absolute() {
            return name.to_string();
        }
        let dir = std::env::var_os("XDG_RUNTIME_DIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        dir.join(format!("{name}.sock")).to_string_lossy().into_owned()
    }

    #[cfg(windows)]
    {
        if name.starts_with(r"\\") {
            return name.to_string();
        }
        format!(r"\\.\pipe\{}", name)
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix Domain Socket listener.
    pub struct PipeListener {
        listener: UnixListener,
        path: String,
    }

    /// Unix Domain Socket stream (connected).
    pub struct PipeStream {
        stream: UnixStream,
    }

    impl PipeListener {
        /// Bind to a Unix socket path.
        ///
        /// Removes any existing socket file at the path before binding.
        pub async fn bind(path: &str) -> Result<Self> {
            if Path::new(path).exists() {
                tracing::debug!("Removing stale socket {}", path);
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;

            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }

        /// Accept a single connection.
        pub async fn accept(&mut self) -> Result<PipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(PipeStream { stream })
        }

        /// Prepare for the next accept after a transient failure.
        ///
        /// The socket stays bound, so there is nothing to rebuild.
        pub fn recover(&mut self) -> Result<()> {
            Ok(())
        }

        /// Get the socket path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    impl ClientIdentity for PipeStream {
        fn client_process_id(&self) -> Result<Pid> {
            let cred = self.stream.peer_cred()?;
            cred.pid()
                .and_then(|pid| Pid::try_from(pid).ok())
                .ok_or_else(|| {
                    TracerError::Io(std::io::Error::other("peer process id unavailable"))
                })
        }
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
        }
    }

    /// Whether an accept failure is worth retrying.
    pub fn is_transient_accept_error(err: &TracerError) -> bool {
        use std::io::ErrorKind;

        match err {
            TracerError::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::os::windows::io::AsRawHandle;
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
    use windows_sys::Win32::Foundation::ERROR_NO_DATA;
    use windows_sys::Win32::System::Pipes::GetNamedPipeClientProcessId;

    /// Windows Named Pipe listener.
    ///
    /// Always holds one unconnected server instance so clients never see
    /// the pipe missing between two accepts.
    pub struct PipeListener {
        path: String,
        next: NamedPipeServer,
    }

    /// Windows Named Pipe stream (connected).
    pub struct PipeStream {
        pipe: NamedPipeServer,
    }

    impl PipeListener {
        /// Create the first Named Pipe server instance.
        pub async fn bind(path: &str) -> Result<Self> {
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(path)?;

            Ok(Self {
                path: path.to_string(),
                next,
            })
        }

        /// Accept a single connection.
        pub async fn accept(&mut self) -> Result<PipeStream> {
            self.next.connect().await?;

            let next = ServerOptions::new().create(&self.path)?;
            let pipe = std::mem::replace(&mut self.next, next);
            Ok(PipeStream { pipe })
        }

        /// Replace the pending server instance after a transient failure.
        pub fn recover(&mut self) -> Result<()> {
            self.next = ServerOptions::new().create(&self.path)?;
            Ok(())
        }

        /// Get the pipe path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl ClientIdentity for PipeStream {
        fn client_process_id(&self) -> Result<Pid> {
            let mut pid: u32 = 0;
            // SAFETY: the handle is owned by `self.pipe` and stays open for
            // the duration of the call; `pid` is a valid out pointer.
            let ok = unsafe { GetNamedPipeClientProcessId(self.pipe.as_raw_handle() as _, &mut pid) };
            if ok == 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(pid)
        }
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.pipe).poll_read(cx, buf)
        }
    }

    /// Whether an accept failure is worth retrying.
    ///
    /// "The pipe is being closed" shows up when a client disconnects before
    /// the server instance finished connecting.
    pub fn is_transient_accept_error(err: &TracerError) -> bool {
        match err {
            TracerError::Io(e) => e.raw_os_error() == Some(ERROR_NO_DATA as i32),
            _ => false,
        }
    }
}

// ============================================================================
// Platform-independent re-exports
// ============================================================================

#[cfg(unix)]
pub use unix_impl::{is_transient_accept_error, PipeListener, PipeStream};

#[cfg(windows)]
pub use windows_impl::{is_transient_accept_error, PipeListener, PipeStream};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_path_format() {
        let path = pipe_path("SpawnCamper");

        #[cfg(unix)]
        {
            assert!(path.ends_with("/SpawnCamper.sock"));
            assert!(std::path::Path::new(&path).is_absolute());
        }

        #[cfg(windows)]
        {
            assert_eq!(path, r"\\.\pipe\SpawnCamper");
        }
    }

    #[test]
    fn test_full_path_kept() {
        #[cfg(unix)]
        assert_eq!(pipe_path("/run/tracer.sock"), "/run/tracer.sock");

        #[cfg(windows)]
        assert_eq!(pipe_path(r"\\.\pipe\custom"), r"\\.\pipe\custom");
    }

    #[test]
    fn test_transient_classification() {
        assert!(!is_transient_accept_error(&TracerError::EndOfStream));
        assert!(!is_transient_accept_error(&TracerError::Io(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied")
        )));

        #[cfg(unix)]
        assert!(is_transient_accept_error(&TracerError::Io(
            std::io::ErrorKind::ConnectionAborted.into()
        )));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_accept_resolves_client_pid() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid.sock").to_string_lossy().into_owned();
        let mut listener = PipeListener::bind(&path).await.unwrap();

        let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
        let mut stream = listener.accept().await.unwrap();
        assert_eq!(stream.client_process_id().unwrap(), std::process::id());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_socket_replaced_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        let path_str = path.to_string_lossy().into_owned();
        let listener = PipeListener::bind(&path_str).await.unwrap();
        assert_eq!(listener.path(), path_str);
        assert!(path.exists());

        drop(listener);
        assert!(!path.exists());
    }
}
