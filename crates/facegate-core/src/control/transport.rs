//! Local transport: Unix domain sockets, or named pipes on Windows.

pub use imp::{ClientStream, LocalListener, connect};

#[cfg(unix)]
mod imp {
    use std::path::PathBuf;

    use tokio::net::{UnixListener, UnixStream};
    use tracing::debug;

    use crate::control::{ControlEndpoint, ControlError};

    pub type ServerStream = UnixStream;
    pub type ClientStream = UnixStream;

    /// Listening socket. The socket file is removed on drop.
    pub struct LocalListener {
        inner: UnixListener,
        path: PathBuf,
    }

    impl LocalListener {
        /// Bind the endpoint, refusing if a live instance already answers on it.
        pub async fn bind(endpoint: &ControlEndpoint) -> Result<Self, ControlError> {
            let path = PathBuf::from(endpoint.as_str());
            if path.exists() {
                if UnixStream::connect(&path).await.is_ok() {
                    return Err(ControlError::AlreadyRunning(endpoint.to_string()));
                }
                debug!(path = %path.display(), "Removing stale control socket");
                std::fs::remove_file(&path)?;
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }

            let inner = UnixListener::bind(&path)?;
            Ok(Self { inner, path })
        }

        pub async fn accept(&mut self) -> std::io::Result<ServerStream> {
            let (stream, _) = self.inner.accept().await?;
            Ok(stream)
        }
    }

    impl Drop for LocalListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub async fn connect(endpoint: &ControlEndpoint) -> std::io::Result<ClientStream> {
        UnixStream::connect(endpoint.as_str()).await
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::time::Duration;

    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    use crate::control::{ControlEndpoint, ControlError};

    const ERROR_PIPE_BUSY: i32 = 231;

    pub type ServerStream = NamedPipeServer;
    pub type ClientStream = NamedPipeClient;

    /// Named pipe listener. Always holds one instance waiting for a client.
    pub struct LocalListener {
        next: NamedPipeServer,
        name: String,
    }

    impl LocalListener {
        pub async fn bind(endpoint: &ControlEndpoint) -> Result<Self, ControlError> {
            let name = endpoint.as_str().to_string();
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&name)
                .map_err(|e| match e.kind() {
                    io::ErrorKind::PermissionDenied => {
                        ControlError::AlreadyRunning(endpoint.to_string())
                    }
                    _ => ControlError::Io(e),
                })?;
            Ok(Self { next, name })
        }

        pub async fn accept(&mut self) -> io::Result<ServerStream> {
            self.next.connect().await?;
            let fresh = ServerOptions::new().create(&self.name)?;
            Ok(std::mem::replace(&mut self.next, fresh))
        }
    }

    pub async fn connect(endpoint: &ControlEndpoint) -> io::Result<ClientStream> {
        loop {
            match ClientOptions::new().open(endpoint.as_str()) {
                Ok(client) => return Ok(client),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
