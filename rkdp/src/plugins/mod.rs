//! Device plugins served to the kubelet.
//!
//! - [`fuse`]: a fixed number of logical slots multiplexing `/dev/fuse`.
//! - [`block`]: unmounted whole disks found by `lsblk` at startup.
//!
//! Both kinds run on the same [`server::PluginServer`]; the daemon only sees
//! them through the [`Plugin`] trait.

pub mod block;
pub mod dial;
pub mod fuse;
pub mod server;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::api::{self, DeviceSpec};
use crate::config::{Config, DeviceType};
use crate::error::PluginError;

use block::{Block, CommandRunner, SystemRunner};
use fuse::Fuse;
use server::PluginServer;

/// Health of a single advertised device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => api::HEALTHY,
            Health::Unhealthy => api::UNHEALTHY,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ordered set of devices one plugin instance advertises.
///
/// Built once before the server accepts RPCs and never modified afterwards.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    devices: Vec<api::Device>,
}

impl Inventory {
    /// Build an inventory, keeping the first device of any repeated id.
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = (S, Health)>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut list = Vec::new();
        for (id, health) in devices {
            let id = id.into();
            if !seen.insert(id.clone()) {
                warn!("Duplicate device id {id}, skipped.");
                continue;
            }
            list.push(api::Device {
                id,
                health: health.to_string(),
                topology: None,
            });
        }
        Inventory { devices: list }
    }

    pub fn devices(&self) -> &[api::Device] {
        &self.devices
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.iter().any(|d| d.id == id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Lifecycle of one plugin server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Started,
    Registered,
    Stopped,
}

/// Kind specific behaviour plugged into the shared [`PluginServer`].
pub trait DeviceKind: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Base name of the socket created in the plugin directory.
    fn socket_name(&self) -> &'static str;

    /// Extended resource name registered with the kubelet.
    fn resource_name(&self) -> &str;

    /// Whether the running server hands out a [`server::HealthReporter`].
    fn reports_health(&self) -> bool;

    /// Device nodes to bind for one container request. Every id is already
    /// known to be in the inventory.
    fn device_specs(&self, ids: &[String]) -> Vec<DeviceSpec>;
}

/// What the daemon needs from a running device plugin.
#[async_trait]
pub trait Plugin: Send {
    fn socket_path(&self) -> &Path;

    fn kubelet_socket(&self) -> &Path;

    fn resource_name(&self) -> &str;

    fn state(&self) -> RunState;

    /// Bind the plugin socket and serve the device plugin API on it.
    async fn start(&mut self) -> Result<(), PluginError>;

    /// Announce this plugin to the kubelet listening on `kubelet_socket`.
    async fn register(
        &mut self,
        kubelet_socket: &Path,
        resource_name: &str,
    ) -> Result<(), PluginError>;

    /// Stop serving and remove the socket. Calling it more than once is fine.
    async fn stop(&mut self) -> Result<(), PluginError>;

    /// Start, then register with the kubelet. A failed registration stops
    /// the server again before the error is returned.
    async fn serve(&mut self) -> Result<(), PluginError> {
        if let Err(e) = self.start().await {
            error!("Could not start device plugin: {e}");
            return Err(e);
        }
        info!("Starting to serve on {:?}", self.socket_path());

        let kubelet_socket = self.kubelet_socket().to_path_buf();
        let resource_name = self.resource_name().to_string();
        if let Err(e) = self.register(&kubelet_socket, &resource_name).await {
            error!("Could not register device plugin: {e}");
            if let Err(stop_err) = self.stop().await {
                warn!("Failed to stop device plugin after registration failure: {stop_err}");
            }
            return Err(e);
        }
        info!("Registered device plugin for {resource_name} with kubelet");
        Ok(())
    }
}

/// Builds a fresh plugin each time the daemon (re)starts one.
#[async_trait]
pub trait PluginFactory: Send + Sync {
    async fn build(&self) -> Result<Box<dyn Plugin>, PluginError>;
}

/// Builds the plugin kind selected in [`Config`].
pub struct KindFactory {
    config: Config,
    runner: Arc<dyn CommandRunner>,
}

impl KindFactory {
    pub fn new(config: Config) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    pub fn with_runner(config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        KindFactory { config, runner }
    }
}

#[async_trait]
impl PluginFactory for KindFactory {
    async fn build(&self) -> Result<Box<dyn Plugin>, PluginError> {
        let plugin: Box<dyn Plugin> = match self.config.device {
            DeviceType::Fuse => {
                let inventory = fuse::inventory(&fuse::hostname(), self.config.fuse_mounts_allowed);
                Box::new(PluginServer::new(
                    Fuse::new(self.config.fuse_resource.clone()),
                    inventory,
                    &self.config.plugin_dir,
                ))
            }
            DeviceType::Block => {
                let inventory = block::discover(self.runner.as_ref()).await?;
                Box::new(PluginServer::new(
                    Block::new(self.config.block_resource.clone()),
                    inventory,
                    &self.config.plugin_dir,
                ))
            }
        };
        Ok(plugin)
    }
}
