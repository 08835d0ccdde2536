use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

use crate::api::{DEVICE_PLUGIN_PATH, KUBELET_SOCKET};

pub const DEFAULT_FUSE_MOUNTS_ALLOWED: usize = 5000;
pub const DEFAULT_FUSE_RESOURCE: &str = "hdls.me/fuse";
pub const DEFAULT_BLOCK_RESOURCE: &str = "hdls.me/sdx";

/// Which device plugin this process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceType {
    Fuse,
    Block,
}

/// Process-wide settings, built once at startup and handed to the daemon.
#[derive(Debug, Clone)]
pub struct Config {
    pub device: DeviceType,
    /// How many logical fuse slots are advertised.
    pub fuse_mounts_allowed: usize,
    /// Directory holding the kubelet socket and our own plugin sockets.
    pub plugin_dir: PathBuf,
    pub fuse_resource: String,
    pub block_resource: String,
    /// Hold-off after the first failed serve; doubles per failure up to `retry_max`.
    pub retry_min: Duration,
    pub retry_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DeviceType::Fuse,
            fuse_mounts_allowed: DEFAULT_FUSE_MOUNTS_ALLOWED,
            plugin_dir: PathBuf::from(DEVICE_PLUGIN_PATH),
            fuse_resource: DEFAULT_FUSE_RESOURCE.to_string(),
            block_resource: DEFAULT_BLOCK_RESOURCE.to_string(),
            retry_min: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Path of the kubelet registration socket.
    pub fn kubelet_socket(&self) -> PathBuf {
        self.plugin_dir.join(KUBELET_SOCKET)
    }

    pub fn resource_name(&self) -> &str {
        match self.device {
            DeviceType::Fuse => &self.fuse_resource,
            DeviceType::Block => &self.block_resource,
        }
    }
}
