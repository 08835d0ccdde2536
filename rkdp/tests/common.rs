use std::path::Path;
use std::sync::{Arc, Mutex};

use rkdp::api::device_plugin_client::DevicePluginClient;
use rkdp::api::registration_server::{Registration, RegistrationServer};
use rkdp::api::{Empty, RegisterRequest};
use rkdp::plugins::dial::{DIAL_TIMEOUT, dial};
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};

/// Records every registration, optionally refusing them.
#[derive(Clone, Default)]
struct Recorder {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
    reject: bool,
}

#[tonic::async_trait]
impl Registration for Recorder {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        self.requests.lock().unwrap().push(request.into_inner());
        if self.reject {
            return Err(Status::failed_precondition("unsupported version"));
        }
        Ok(Response::new(Empty {}))
    }
}

/// A kubelet registration endpoint listening on `<dir>/kubelet.sock`.
pub struct FakeKubelet {
    recorder: Recorder,
    _shutdown: oneshot::Sender<()>,
}

impl FakeKubelet {
    pub fn requests(&self) -> Vec<RegisterRequest> {
        self.recorder.requests.lock().unwrap().clone()
    }
}

pub async fn start_kubelet(dir: &Path, reject: bool) -> FakeKubelet {
    let recorder = Recorder {
        reject,
        ..Recorder::default()
    };
    let listener = UnixListener::bind(dir.join("kubelet.sock")).unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let service = recorder.clone();
    tokio::spawn(async move {
        Server::builder()
            .add_service(RegistrationServer::new(service))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                shutdown_rx.await.ok();
            })
            .await
            .ok();
    });

    FakeKubelet {
        recorder,
        _shutdown: shutdown_tx,
    }
}

#[allow(dead_code)]
pub async fn connect(socket: &Path) -> DevicePluginClient<Channel> {
    DevicePluginClient::new(dial(socket, DIAL_TIMEOUT).await.unwrap())
}
