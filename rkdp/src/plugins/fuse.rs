use crate::api::DeviceSpec;

use super::{DeviceKind, Health, Inventory};

pub const FUSE_DEVICE: &str = "/dev/fuse";
const FUSE_SOCKET: &str = "fuse.sock";

/// Many logical slots sharing the one `/dev/fuse` node.
///
/// There is no health signal for `/dev/fuse` visible from user space, so the
/// slots are always reported healthy and never change.
#[derive(Debug, Clone)]
pub struct Fuse {
    resource_name: String,
}

impl Fuse {
    pub fn new(resource_name: impl Into<String>) -> Self {
        Fuse {
            resource_name: resource_name.into(),
        }
    }
}

impl DeviceKind for Fuse {
    fn name(&self) -> &'static str {
        "fuse"
    }

    fn socket_name(&self) -> &'static str {
        FUSE_SOCKET
    }

    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn reports_health(&self) -> bool {
        false
    }

    /// Whatever slot was requested, the container gets the canonical node once.
    fn device_specs(&self, _ids: &[String]) -> Vec<DeviceSpec> {
        vec![DeviceSpec {
            container_path: FUSE_DEVICE.to_string(),
            host_path: FUSE_DEVICE.to_string(),
            permissions: "rwm".to_string(),
        }]
    }
}

pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// `capacity` healthy slots named `fuse-<hostname>-<index>`.
pub fn inventory(hostname: &str, capacity: usize) -> Inventory {
    Inventory::new((0..capacity).map(|i| (format!("fuse-{hostname}-{i}"), Health::Healthy)))
}
