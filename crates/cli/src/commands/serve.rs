//! `sandbox serve`

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use sandbox_core::AuthToken;
use sandbox_server::{Server, DEFAULT_LISTEN};

use crate::signal::shutdown_signal;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address and port to listen on
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Token that callers have to present
    #[arg(long, env = "SANDBOX_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Directory where the test directories are created
    #[arg(long)]
    pub work: Option<PathBuf>,
}

pub async fn run(args: ServeArgs) -> Result<ExitCode> {
    let token = AuthToken::new(args.token).context("invalid token")?;
    let mut builder = Server::builder().listen(args.listen).token(token);
    if let Some(work) = args.work {
        builder = builder.work(work);
    }
    let mut server = builder.build().context("can't create server")?;
    server.start().await.context("can't start server")?;

    shutdown_signal().await?;
    server.stop().await.context("can't stop server")?;
    Ok(ExitCode::SUCCESS)
}
