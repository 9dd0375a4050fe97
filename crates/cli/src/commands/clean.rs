//! `sandbox clean-after-delay`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use sandbox_cluster::{Cleaner, CleanerState, ClusterConfig, HttpControlPlane};
use tracing::info;

use crate::signal::shutdown_signal;

#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Time to wait before deleting the environment
    #[arg(long, value_parser = humantime::parse_duration)]
    pub wait: Duration,

    /// Project to delete, the one of the pod by default
    #[arg(long)]
    pub namespace: Option<String>,

    /// Cluster connection file, the service account of the pod by default
    #[arg(long, env = "SANDBOX_CLUSTER_CONFIG")]
    pub config: Option<PathBuf>,
}

pub async fn run(args: CleanArgs) -> Result<ExitCode> {
    let config =
        ClusterConfig::load(args.config.as_deref()).context("can't load cluster configuration")?;
    let plane = HttpControlPlane::new(&config).context("can't create cluster client")?;

    let mut builder = Cleaner::builder()
        .wait(args.wait)
        .control_plane(Arc::new(plane));
    if let Some(namespace) = args.namespace.or(config.namespace) {
        builder = builder.namespace(namespace);
    }
    let mut cleaner = builder.build().context("can't create cleaner")?;
    cleaner.start().context("can't start cleaner")?;

    // Runs till the pod is terminated, by the runner or with the project
    shutdown_signal().await?;
    if cleaner.state() == CleanerState::Armed {
        info!("Stopping cleaner before the deadline");
    }
    cleaner.stop().await.context("can't stop cleaner")?;
    Ok(ExitCode::SUCCESS)
}
