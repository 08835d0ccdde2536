use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::api::device_plugin_server::{DevicePlugin, DevicePluginServer};
use crate::api::registration_client::RegistrationClient;
use crate::api::{
    self, AllocateRequest, AllocateResponse, ContainerAllocateResponse, DevicePluginOptions, Empty,
    ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse, RegisterRequest,
};
use crate::error::PluginError;

use super::dial::{DIAL_TIMEOUT, dial};
use super::{DeviceKind, Health, Inventory, Plugin, RunState};

/// How long `stop` waits for in-flight calls before tearing the server down.
const STOP_GRACE: Duration = Duration::from_secs(2);
const WATCH_BUFFER: usize = 4;

/// Current health of every device of one server.
///
/// All ListAndWatch streams read from the same list, so a stream opened after
/// a change starts from the changed state.
#[derive(Clone)]
pub struct HealthReporter {
    devices: Arc<watch::Sender<Vec<api::Device>>>,
}

impl HealthReporter {
    pub fn new(inventory: &Inventory) -> Self {
        let (devices, _) = watch::channel(inventory.devices().to_vec());
        HealthReporter {
            devices: Arc::new(devices),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<api::Device>> {
        self.devices.subscribe()
    }

    /// Record the health of device `id` and notify every open stream if it
    /// changed. Returns false for an id outside the inventory.
    pub fn report(&self, id: &str, health: Health) -> bool {
        let health = health.to_string();
        let mut known = false;
        self.devices.send_if_modified(|devices| {
            let Some(device) = devices.iter_mut().find(|d| d.id == id) else {
                return false;
            };
            known = true;
            if device.health == health {
                return false;
            }
            device.health = health;
            true
        });
        if !known {
            warn!("Health report for unknown device {id}");
        }
        known
    }

    pub fn devices(&self) -> Vec<api::Device> {
        self.devices.borrow().clone()
    }
}

/// The device plugin gRPC service for one inventory.
pub struct PluginService<K> {
    kind: Arc<K>,
    inventory: Arc<Inventory>,
    stop: watch::Receiver<bool>,
    devices: watch::Receiver<Vec<api::Device>>,
}

impl<K: DeviceKind> PluginService<K> {
    pub fn new(
        kind: Arc<K>,
        inventory: Arc<Inventory>,
        stop: watch::Receiver<bool>,
        devices: watch::Receiver<Vec<api::Device>>,
    ) -> Self {
        PluginService {
            kind,
            inventory,
            stop,
            devices,
        }
    }
}

#[tonic::async_trait]
impl<K: DeviceKind> DevicePlugin for PluginService<K> {
    type ListAndWatchStream = ReceiverStream<Result<ListAndWatchResponse, Status>>;

    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions::default()))
    }

    /// Send the current device list, then a fresh one after every health
    /// change, until the plugin stops or the watcher goes away.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut devices = self.devices.clone();
        let mut stop = self.stop.clone();
        let kind = self.kind.name();

        tokio::spawn(async move {
            let first = snapshot(&devices.borrow_and_update());
            if tx.send(Ok(first)).await.is_err() {
                return;
            }
            let mut watching = true;
            loop {
                tokio::select! {
                    _ = stopped(&mut stop) => break,
                    _ = tx.closed() => break,
                    changed = devices.changed(), if watching => {
                        if changed.is_err() {
                            // health reporting is gone, the inventory stays valid
                            watching = false;
                            continue;
                        }
                        let next = snapshot(&devices.borrow_and_update());
                        if tx.send(Ok(next)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("{kind} ListAndWatch stream finished");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        let mut responses = AllocateResponse::default();

        for req in request.container_requests {
            for id in &req.devices_ids {
                debug!("Allocate {} device: {id}", self.kind.name());
                if !self.inventory.contains(id) {
                    let msg = format!("invalid allocation request: unknown device: {id}");
                    return Err(Status::invalid_argument(msg));
                }
            }
            responses.container_responses.push(ContainerAllocateResponse {
                devices: self.kind.device_specs(&req.devices_ids),
                ..Default::default()
            });
        }

        Ok(Response::new(responses))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse::default()))
    }
}

fn snapshot(devices: &[api::Device]) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: devices.to_vec(),
    }
}

/// Resolves once the stop flag is set or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Owns the socket and the gRPC server task for one device kind.
pub struct PluginServer<K: DeviceKind> {
    kind: Arc<K>,
    inventory: Arc<Inventory>,
    health: HealthReporter,
    socket: PathBuf,
    kubelet_socket: PathBuf,
    state: RunState,
    stop: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
}

impl<K: DeviceKind> PluginServer<K> {
    /// A server for `inventory`, using sockets inside `plugin_dir`.
    pub fn new(kind: K, inventory: Inventory, plugin_dir: &Path) -> Self {
        PluginServer {
            socket: plugin_dir.join(kind.socket_name()),
            kubelet_socket: plugin_dir.join(api::KUBELET_SOCKET),
            kind: Arc::new(kind),
            health: HealthReporter::new(&inventory),
            inventory: Arc::new(inventory),
            state: RunState::Created,
            stop: None,
            handle: None,
        }
    }

    /// Handle for reporting device health to every ListAndWatch stream.
    ///
    /// Only handed out while the server runs and only for kinds that report
    /// health. Nothing in this crate probes devices yet.
    pub fn health_reporter(&self) -> Option<HealthReporter> {
        let running = matches!(self.state, RunState::Started | RunState::Registered);
        (running && self.kind.reports_health()).then(|| self.health.clone())
    }

    fn cleanup(&self) -> Result<(), PluginError> {
        match std::fs::remove_file(&self.socket) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(PluginError::Cleanup {
                path: self.socket.clone(),
                source: e,
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<K: DeviceKind> Plugin for PluginServer<K> {
    fn socket_path(&self) -> &Path {
        &self.socket
    }

    fn kubelet_socket(&self) -> &Path {
        &self.kubelet_socket
    }

    fn resource_name(&self) -> &str {
        self.kind.resource_name()
    }

    fn state(&self) -> RunState {
        self.state
    }

    /// # Panics
    /// If the server was already started.
    async fn start(&mut self) -> Result<(), PluginError> {
        assert_eq!(
            self.state,
            RunState::Created,
            "device plugin server can only be started once"
        );
        self.cleanup()?;

        let listener = UnixListener::bind(&self.socket)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let service = PluginService::new(
            self.kind.clone(),
            self.inventory.clone(),
            stop_rx.clone(),
            self.health.subscribe(),
        );

        let mut shutdown = stop_rx;
        let server = Server::builder()
            .add_service(DevicePluginServer::new(service))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                stopped(&mut shutdown).await
            });
        self.handle = Some(tokio::spawn(server));
        self.stop = Some(stop_tx);
        self.state = RunState::Started;

        // Wait for the server to answer before telling anyone about it.
        match dial(&self.socket, DIAL_TIMEOUT).await {
            Ok(channel) => {
                drop(channel);
                Ok(())
            }
            Err(e) => {
                if let Err(stop_err) = self.stop().await {
                    warn!("Failed to clean up {:?}: {stop_err}", self.socket);
                }
                Err(e)
            }
        }
    }

    async fn register(
        &mut self,
        kubelet_socket: &Path,
        resource_name: &str,
    ) -> Result<(), PluginError> {
        let channel = dial(kubelet_socket, DIAL_TIMEOUT).await?;
        let endpoint = self
            .socket
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        RegistrationClient::new(channel)
            .register(RegisterRequest {
                version: api::VERSION.to_string(),
                endpoint,
                resource_name: resource_name.to_string(),
                options: None,
            })
            .await?;
        if self.state == RunState::Started {
            self.state = RunState::Registered;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PluginError> {
        if !matches!(self.state, RunState::Started | RunState::Registered) {
            return Ok(());
        }

        let name = self.kind.name();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(mut handle) = self.handle.take() {
            match tokio::time::timeout(STOP_GRACE, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("{name} device plugin server failed: {e}"),
                Ok(Err(e)) => warn!("{name} device plugin server task failed: {e}"),
                Err(_) => {
                    warn!("{name} device plugin server did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        self.state = RunState::Stopped;
        info!("Stopped {name} device plugin on {:?}", self.socket);

        self.cleanup()
    }
}

impl<K: DeviceKind> Drop for PluginServer<K> {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
