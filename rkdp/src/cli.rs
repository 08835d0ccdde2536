use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::api::DEVICE_PLUGIN_PATH;
use crate::config::{
    Config, DEFAULT_BLOCK_RESOURCE, DEFAULT_FUSE_MOUNTS_ALLOWED, DEFAULT_FUSE_RESOURCE, DeviceType,
};

#[derive(Parser, Debug)]
#[command(name = "rkdp")]
#[command(about = "Kubelet device plugin for fuse and block devices", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Register the device plugin with the kubelet and serve it")]
    Run(RunArgs),
    #[command(about = "Print version information")]
    Version,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Maximum times the fuse device can be mounted
    #[arg(
        long = "fuse_mounts_allowed",
        env = "RKDP_FUSE_MOUNTS_ALLOWED",
        default_value_t = DEFAULT_FUSE_MOUNTS_ALLOWED
    )]
    pub fuse_mounts_allowed: usize,

    /// Enable the fuse or the block device plugin
    #[arg(long, value_enum, env = "RKDP_DEVICE", default_value = "fuse")]
    pub device: DeviceType,

    /// Kubelet device plugin directory
    #[arg(long, env = "RKDP_PLUGIN_DIR", default_value = DEVICE_PLUGIN_PATH)]
    pub plugin_dir: PathBuf,

    /// Resource name advertised for fuse
    #[arg(long, env = "RKDP_FUSE_RESOURCE", default_value = DEFAULT_FUSE_RESOURCE)]
    pub fuse_resource: String,

    /// Resource name advertised for block disks
    #[arg(long, env = "RKDP_BLOCK_RESOURCE", default_value = DEFAULT_BLOCK_RESOURCE)]
    pub block_resource: String,

    /// Minimum seconds between two registration attempts
    #[arg(long, env = "RKDP_RETRY_MIN_SECS", default_value_t = 1)]
    pub retry_min_secs: u64,

    /// Upper bound of the registration retry backoff in seconds
    #[arg(long, env = "RKDP_RETRY_MAX_SECS", default_value_t = 30)]
    pub retry_max_secs: u64,
}

impl From<RunArgs> for Config {
    fn from(args: RunArgs) -> Self {
        let retry_min = Duration::from_secs(args.retry_min_secs);
        // watcher events always carry absolute paths
        let plugin_dir = std::path::absolute(&args.plugin_dir).unwrap_or(args.plugin_dir);
        Config {
            device: args.device,
            fuse_mounts_allowed: args.fuse_mounts_allowed,
            plugin_dir,
            fuse_resource: args.fuse_resource,
            block_resource: args.block_resource,
            retry_min,
            retry_max: Duration::from_secs(args.retry_max_secs).max(retry_min),
        }
    }
}
