//! `sandbox run`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args};
use sandbox_cluster::{manifests::DEFAULT_IMAGE, ClusterConfig, HttpControlPlane};
use sandbox_runner::Runner;
use tracing::{error, info};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Directories containing the tests
    #[arg(required = true)]
    pub directories: Vec<PathBuf>,

    /// Kubeconfig or JSON cluster connection file. When not given the
    /// connection comes from the environment, the service account of the pod
    /// or the kubeconfig of the user.
    #[arg(long, env = "SANDBOX_CLUSTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Proxy for the connections to the cluster and to the server
    #[arg(long)]
    pub proxy: Option<String>,

    /// Accept TLS certificates signed by unknown authorities
    #[arg(long)]
    pub insecure: bool,

    /// Look for test directories inside the given ones
    #[arg(long)]
    pub recursive: bool,

    /// Build the test binaries before running them
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub compile: bool,

    /// Don't delete the environment when done
    #[arg(long)]
    pub keep: bool,

    /// Image of the server and cleaner pods
    #[arg(long, env = "SANDBOX_IMAGE", default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// Time after which an abandoned environment deletes itself
    #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
    pub cleanup_delay: Duration,
}

pub async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = ClusterConfig::load(args.config.as_deref())
        .context("can't load cluster configuration")?
        .with_proxy(args.proxy.clone())
        .with_insecure(args.insecure);
    let plane = HttpControlPlane::new(&config).context("can't create cluster client")?;

    let runner = Runner::builder()
        .directories(args.directories)
        .recursive(args.recursive)
        .compile(args.compile)
        .keep(args.keep)
        .image(args.image)
        .cleanup_delay(args.cleanup_delay)
        .proxy(args.proxy)
        .insecure(args.insecure)
        .control_plane(Arc::new(plane))
        .build()
        .context("can't create runner")?;

    let summary = runner
        .run(&mut std::io::stdout(), &mut std::io::stderr())
        .await
        .context("test run failed")?;

    if summary.passed() {
        info!("Tests passed");
        return Ok(ExitCode::SUCCESS);
    }
    error!(
        "Tests failed: {} of {} binaries failed, {} skipped",
        summary.failed, summary.total, summary.skipped
    );
    Ok(ExitCode::FAILURE)
}
