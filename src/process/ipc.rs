use crate::error::{DevServeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Environment variable carrying the side-channel path to the server.
pub const IPC_PATH_ENV: &str = "DEVSERVE_IPC_PATH";

/// Messages the server sends over the side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    ServerReady,
}

impl ServerMessage {
    /// Parse one line. Anything unrecognised yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

/// Cross-platform IPC path abstraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcPath {
    inner: PathBuf,
}

impl IpcPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { inner: path.into() }
    }

    /// A fresh path for one server process.
    pub fn unique() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("devserve-{}", &id[..12]);

        #[cfg(unix)]
        let path = std::env::temp_dir().join(format!("{name}.sock"));

        #[cfg(windows)]
        let path = PathBuf::from(name);

        Self::new(path)
    }

    pub fn as_path(&self) -> &std::path::Path {
        &self.inner
    }

    pub fn display(&self) -> String {
        self.inner.display().to_string()
    }

    /// Convert to platform-specific socket path
    pub fn to_socket_path(&self) -> String {
        #[cfg(unix)]
        {
            self.inner.to_string_lossy().to_string()
        }
        #[cfg(windows)]
        {
            format!(
                r"\\.\pipe\{}",
                self.inner
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("devserve")
            )
        }
    }
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix domain socket listener; the socket file is removed on drop.
    pub struct UnixIpcListener {
        listener: UnixListener,
        path: PathBuf,
    }

    impl UnixIpcListener {
        pub async fn bind(path: &IpcPath) -> Result<Self> {
            let socket_path = path.as_path();
            if socket_path.exists() {
                std::fs::remove_file(socket_path)?;
            }

            let listener = UnixListener::bind(socket_path).map_err(|e| {
                DevServeError::ConnectionError(format!("Failed to bind Unix socket: {e}"))
            })?;

            Ok(Self {
                listener,
                path: socket_path.to_path_buf(),
            })
        }

        pub async fn accept(&mut self) -> Result<UnixStream> {
            let (stream, _) = self.listener.accept().await.map_err(|e| {
                DevServeError::ConnectionError(format!("Failed to accept connection: {e}"))
            })?;
            Ok(stream)
        }
    }

    impl Drop for UnixIpcListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub async fn connect(path: &IpcPath) -> Result<UnixStream> {
        UnixStream::connect(path.as_path()).await.map_err(|e| {
            DevServeError::ConnectionError(format!("Failed to connect to Unix socket: {e}"))
        })
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    /// Named pipe listener. One server instance is always pending so a
    /// client can connect at any time.
    pub struct WindowsIpcListener {
        pipe_name: String,
        pending: NamedPipeServer,
    }

    impl WindowsIpcListener {
        pub async fn bind(path: &IpcPath) -> Result<Self> {
            let pipe_name = path.to_socket_path();
            let pending = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&pipe_name)
                .map_err(|e| {
                    DevServeError::ConnectionError(format!("Failed to create named pipe: {e}"))
                })?;
            Ok(Self { pipe_name, pending })
        }

        pub async fn accept(&mut self) -> Result<NamedPipeServer> {
            self.pending.connect().await.map_err(|e| {
                DevServeError::ConnectionError(format!("Failed to accept connection: {e}"))
            })?;
            let next = ServerOptions::new().create(&self.pipe_name).map_err(|e| {
                DevServeError::ConnectionError(format!("Failed to create named pipe: {e}"))
            })?;
            Ok(std::mem::replace(&mut self.pending, next))
        }
    }

    pub async fn connect(path: &IpcPath) -> Result<NamedPipeClient> {
        ClientOptions::new().open(path.to_socket_path()).map_err(|e| {
            DevServeError::ConnectionError(format!("Failed to connect to named pipe: {e}"))
        })
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixIpcListener as PlatformListener, connect};

#[cfg(windows)]
pub use windows_impl::{WindowsIpcListener as PlatformListener, connect};

/// Forward recognised messages from one connection.
async fn read_messages<R>(stream: R, tx: mpsc::Sender<ServerMessage>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match ServerMessage::parse(&line) {
            Some(message) => {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            None => debug!("Ignoring side-channel message: {}", line.trim()),
        }
    }
}

/// The listening end of a server's side channel.
///
/// Accepts any number of connections; dropping it stops listening and closes
/// the message receiver.
pub struct SideChannel {
    path: IpcPath,
    task: JoinHandle<()>,
}

impl SideChannel {
    pub async fn open(path: IpcPath) -> Result<(Self, mpsc::Receiver<ServerMessage>)> {
        let mut listener = PlatformListener::bind(&path).await?;
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            let mut readers = Vec::new();
            loop {
                match listener.accept().await {
                    Ok(stream) => {
                        readers.push(tokio::spawn(read_messages(stream, tx.clone())));
                    }
                    Err(e) => {
                        warn!("Side channel stopped accepting: {e}");
                        break;
                    }
                }
            }
            for reader in readers {
                reader.abort();
            }
        });

        Ok((Self { path, task }, rx))
    }

    pub fn path(&self) -> &IpcPath {
        &self.path
    }
}

impl Drop for SideChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}
