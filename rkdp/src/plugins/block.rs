use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::api::DeviceSpec;
use crate::error::PluginError;

use super::{DeviceKind, Health, Inventory};

const BLOCK_SOCKET: &str = "block.sock";
const LSBLK: &str = "lsblk";
const LSBLK_ARGS: &[&str] = &["-l", "-o", "NAME,MOUNTPOINT"];

lazy_static! {
    /// Whole scsi/sata disks like `sda`; partitions, loop and optical devices never match.
    static ref WHOLE_DISK: Regex = Regex::new(r"^sd[a-z]+$").unwrap();
}

/// Runs an external command and hands back its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn output(&self, program: &str, args: &[&str]) -> Result<String, PluginError>;
}

pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, program: &str, args: &[&str]) -> Result<String, PluginError> {
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| PluginError::Exec {
                program: program.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(PluginError::Command {
                program: program.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Unmounted whole disks, each handed out to at most one container.
#[derive(Debug, Clone)]
pub struct Block {
    resource_name: String,
}

impl Block {
    pub fn new(resource_name: impl Into<String>) -> Self {
        Block {
            resource_name: resource_name.into(),
        }
    }
}

impl DeviceKind for Block {
    fn name(&self) -> &'static str {
        "block"
    }

    fn socket_name(&self) -> &'static str {
        BLOCK_SOCKET
    }

    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn reports_health(&self) -> bool {
        true
    }

    fn device_specs(&self, ids: &[String]) -> Vec<DeviceSpec> {
        ids.iter()
            .map(|id| DeviceSpec {
                container_path: format!("/dev/{id}"),
                host_path: format!("/dev/{id}"),
                permissions: "rwm".to_string(),
            })
            .collect()
    }
}

/// List the disks visible right now. A failing `lsblk` aborts discovery.
pub async fn discover(runner: &dyn CommandRunner) -> Result<Inventory, PluginError> {
    let output = runner.output(LSBLK, LSBLK_ARGS).await?;
    let disks = parse_disks(&output);
    info!("Discovered block devices: {disks:?}");
    Ok(Inventory::new(
        disks.into_iter().map(|name| (name, Health::Healthy)),
    ))
}

/// Pick disk names out of `lsblk -l -o NAME,MOUNTPOINT` output.
///
/// A line counts only when its name is a whole disk and its mountpoint column
/// is empty. Mounted disks, including the extra lines lsblk prints for every
/// further mountpoint, are left out. Output order is kept.
pub fn parse_disks(output: &str) -> Vec<String> {
    let mut disks = Vec::new();
    for line in output.lines() {
        let mut columns = line.split_whitespace();
        let Some(name) = columns.next() else {
            continue;
        };
        if columns.next().is_some() {
            debug!("Skipping mounted or header line {line:?}");
            continue;
        }
        if !WHOLE_DISK.is_match(name) {
            debug!("Skipping {name}: not a whole disk");
            continue;
        }
        disks.push(name.to_string());
    }
    disks
}
