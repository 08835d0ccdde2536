use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::error::PluginError;

/// Bound on every dial: the self-check after bind and the kubelet registration.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between connects to a socket file that nobody listens on yet.
const REFUSED_RETRY: Duration = Duration::from_millis(50);

/// Open a gRPC channel over the unix socket at `path`, giving up after `timeout`.
///
/// A refused connect (the socket file exists but its listener is not up yet)
/// is retried until `timeout` runs out. A missing socket fails immediately.
pub async fn dial(path: &Path, timeout: Duration) -> Result<Channel, PluginError> {
    let socket = path.to_path_buf();
    // The URI is ignored by the connector, tonic only needs a valid authority.
    let endpoint = Endpoint::from_static("http://[::]:50051");
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let socket: PathBuf = socket.clone();
        async move { Ok::<_, std::io::Error>(TokioIo::new(connect_unix(&socket).await?)) }
    }));

    match tokio::time::timeout(timeout, connect).await {
        Ok(res) => res.map_err(|source| PluginError::Dial {
            path: path.to_path_buf(),
            source,
        }),
        Err(_) => Err(PluginError::DialTimeout {
            path: path.to_path_buf(),
            timeout,
        }),
    }
}

async fn connect_unix(socket: &Path) -> std::io::Result<UnixStream> {
    loop {
        match UnixStream::connect(socket).await {
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                tokio::time::sleep(REFUSED_RETRY).await;
            }
            res => return res,
        }
    }
}
