use std::path::PathBuf;

use clap::Parser;

/// GPU task queue daemon.
///
/// Watches accelerator telemetry and starts queued tasks once the devices
/// they ask for are free. Clients talk to it through `gpu-grab`.
#[derive(Parser, Debug)]
#[command(name = "gpu-grabd", version, about = "GPU task queue daemon")]
pub struct DaemonArgs {
    /// Path to config file (default: ~/.gpu-grab/config.yaml)
    #[arg(long, env = "GPU_GRAB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Simulate N idle GPUs instead of querying nvidia-smi
    #[arg(long, value_name = "N")]
    pub dry_run_gpus: Option<u32>,
}
