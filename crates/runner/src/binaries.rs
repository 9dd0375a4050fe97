//! Finding and building test binaries
//!
//! Test directories are crate directories, the ones that contain a
//! `Cargo.toml` file. Each of them is built with `cargo test --no-run` and
//! the resulting test executables are copied to the output directory with a
//! `.test` extension. The binaries sent to the server are the `*.test` files
//! found there.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, RunnerError};

/// Extension of the test binaries
pub const BINARY_EXTENSION: &str = "test";

const MANIFEST_FILE: &str = "Cargo.toml";

/// Resolve the list of test directories, sorted and without duplicates.
/// With `recursive` every crate directory under the given roots is
/// included, skipping hidden and `target` directories.
pub fn scan_directories(roots: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    if roots.is_empty() {
        return Err(RunnerError::Validation(
            "at least one directory must be provided".to_string(),
        ));
    }
    if let Some(missing) = roots.iter().find(|root| !root.is_dir()) {
        return Err(RunnerError::Validation(format!(
            "{:?} isn't a directory",
            missing
        )));
    }

    let mut directories = BTreeSet::new();
    for root in roots {
        if recursive {
            info!("Scanning directory {:?} for test directories", root);
            collect_crate_directories(root, &mut directories);
        } else {
            directories.insert(root.clone());
        }
    }

    let directories: Vec<PathBuf> = directories.into_iter().collect();
    if directories.len() == 1 {
        info!("Found one directory containing tests");
    } else {
        info!("Found {} directories containing tests", directories.len());
    }
    for directory in &directories {
        debug!("Found directory {:?} containing tests", directory);
    }
    Ok(directories)
}

fn collect_crate_directories(path: &Path, found: &mut BTreeSet<PathBuf>) {
    if path.join(MANIFEST_FILE).is_file() {
        found.insert(path.to_path_buf());
    }
    let Ok(entries) = fs::read_dir(path) else {
        warn!("Can't read directory {:?}, will skip it", path);
        return;
    };
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if !entry_path.is_dir() {
            continue;
        }
        let name = entry_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if !name.starts_with('.') && name != "target" {
            collect_crate_directories(&entry_path, found);
        }
    }
}

/// Build the tests of every directory and copy the executables into
/// `output`. Stops at the first directory that fails to build. Returns the
/// copied binaries, sorted by name.
pub async fn compile_binaries(directories: &[PathBuf], output: &Path) -> Result<Vec<PathBuf>> {
    let mut copied = BTreeSet::new();
    for directory in directories {
        info!("Compiling test binaries for directory {:?}", directory);
        let command_output = Command::new("cargo")
            .args(["test", "--no-run", "--message-format=json"])
            .current_dir(directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|e| RunnerError::compile(directory, format!("can't run cargo: {}", e)))?;
        if !command_output.status.success() {
            return Err(RunnerError::compile(
                directory,
                match command_output.status.code() {
                    Some(code) => format!("cargo finished with exit code {}", code),
                    None => "cargo was killed by a signal".to_string(),
                },
            ));
        }

        for executable in test_executables(&command_output.stdout) {
            let target = output.join(executable.file_name());
            if copied.contains(&target) {
                return Err(RunnerError::compile(
                    directory,
                    format!("more than one test binary would be copied to {:?}", target),
                ));
            }
            debug!("Copying test binary {:?} to {:?}", executable.path, target);
            tokio::fs::copy(&executable.path, &target).await?;
            copied.insert(target);
        }
    }
    Ok(copied.into_iter().collect())
}

#[derive(Deserialize)]
struct CargoMessage {
    reason: String,
    #[serde(default)]
    target: Option<CargoTarget>,
    #[serde(default)]
    profile: Option<CargoProfile>,
    #[serde(default)]
    executable: Option<PathBuf>,
}

#[derive(Deserialize)]
struct CargoTarget {
    name: String,
    #[serde(default)]
    kind: Vec<String>,
}

#[derive(Deserialize)]
struct CargoProfile {
    #[serde(default)]
    test: bool,
}

/// A test executable reported by cargo
#[derive(Debug, Clone, PartialEq, Eq)]
struct TestExecutable {
    name: String,
    kind: String,
    path: PathBuf,
}

impl TestExecutable {
    /// Name of the copy in the output directory. The lib and bin targets of
    /// a crate share the target name, and so can targets of different
    /// crates, so the kind and the hashed file name of cargo are part of it.
    fn file_name(&self) -> String {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.name);
        format!("{}-{}.{}", stem, self.kind, BINARY_EXTENSION)
    }
}

/// Pick the test executables out of the JSON messages printed by cargo
fn test_executables(stdout: &[u8]) -> Vec<TestExecutable> {
    stdout
        .split(|b| *b == b'\n')
        .filter_map(|line| serde_json::from_slice::<CargoMessage>(line).ok())
        .filter(|message| message.reason == "compiler-artifact")
        .filter(|message| message.profile.as_ref().is_some_and(|p| p.test))
        .filter_map(|message| {
            let target = message.target?;
            let kind = target.kind.first().cloned().unwrap_or_else(|| "test".to_string());
            Some(TestExecutable {
                name: target.name,
                kind,
                path: message.executable?,
            })
        })
        .collect()
}

/// List the test binaries in `directory`, sorted by name
pub fn find_binaries(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut binaries: Vec<PathBuf> = fs::read_dir(directory)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(BINARY_EXTENSION))
        .collect();
    binaries.sort();

    if binaries.len() == 1 {
        info!("Found one test binary");
    } else {
        info!("Found {} test binaries", binaries.len());
    }
    for binary in &binaries {
        debug!("Found test binary {:?}", binary);
    }
    Ok(binaries)
}
