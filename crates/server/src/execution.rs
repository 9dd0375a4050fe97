//! Runs one test binary in a private directory

use std::path::{Path, PathBuf};
use std::process::Stdio;

use sandbox_core::{ExecutionRequest, ExecutionResult};
use tokio::fs::{DirBuilder, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ExecutionError;

const BINARY_FILE: &str = "binary";
const STDOUT_FILE: &str = "stdout";
const STDERR_FILE: &str = "stderr";

/// Exit code reported when the process was killed by a signal
pub const SIGNALED_EXIT_CODE: i32 = -1;

/// Directory created for a single execution. It's never reused.
#[derive(Debug)]
pub struct TestDirectory {
    id: Uuid,
    path: PathBuf,
}

impl TestDirectory {
    pub async fn create(work: &Path) -> Result<Self, ExecutionError> {
        let id = Uuid::new_v4();
        let path = work.join(id.to_string());
        let mut builder = DirBuilder::new();
        #[cfg(unix)]
        builder.mode(0o700);
        builder
            .create(&path)
            .await
            .map_err(|source| ExecutionError::CreateDirectory {
                path: path.clone(),
                source,
            })?;
        info!("Created test directory {:?} for test '{}'", path, id);
        Ok(Self { id, path })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

/// Run the binary of the request and collect what it wrote. A nonzero exit
/// is a result, not an error.
pub async fn execute(
    work: &Path,
    request: &ExecutionRequest,
) -> Result<ExecutionResult, ExecutionError> {
    let directory = TestDirectory::create(work).await?;
    let id = directory.id();

    let binary = directory.file(BINARY_FILE);
    write_binary(&binary, &request.binary).await?;
    debug!("Created binary file {:?} for test '{}'", binary, id);

    let stdout_path = directory.file(STDOUT_FILE);
    let stderr_path = directory.file(STDERR_FILE);
    let stdout = create_output(&stdout_path).await?;
    let stderr = create_output(&stderr_path).await?;

    // The child inherits the environment of the server, the request only
    // adds or replaces variables
    let status = Command::new(&binary)
        .args(&request.args)
        .envs(&request.env)
        .current_dir(directory.path())
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .status()
        .await
        .map_err(|source| ExecutionError::Spawn {
            path: binary.clone(),
            source,
        })?;
    let exit_code = status.code().unwrap_or(SIGNALED_EXIT_CODE);
    info!(
        "Test binary for test '{}' finished with exit code {}",
        id, exit_code
    );

    Ok(ExecutionResult {
        stdout: read_output(&stdout_path).await?,
        stderr: read_output(&stderr_path).await?,
        exit_code,
    })
}

async fn write_binary(path: &Path, data: &[u8]) -> Result<(), ExecutionError> {
    let error = |source: std::io::Error| ExecutionError::WriteBinary {
        path: path.to_path_buf(),
        source,
    };
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o700);
    let mut file = options.open(path).await.map_err(error)?;
    file.write_all(data).await.map_err(error)?;
    file.flush().await.map_err(error)?;
    // Executing a file that is still open for writing fails with ETXTBSY
    drop(file);
    Ok(())
}

async fn create_output(path: &Path) -> Result<Stdio, ExecutionError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let file: File = options
        .open(path)
        .await
        .map_err(|source| ExecutionError::CreateOutput {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Stdio::from(file.into_std().await))
}

async fn read_output(path: &Path) -> Result<Vec<u8>, ExecutionError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| ExecutionError::ReadOutput {
            path: path.to_path_buf(),
            source,
        })
}
