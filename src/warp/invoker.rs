//! Running the warp tool and checking what it produced.

use crate::config::WarpConfig;
use crate::task::TaskDescriptor;
use crate::warp::gdalwarp::{build_warp_command, WarpCommand};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Longest stderr tail kept in an error.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum InvokerError {
    #[error("warp tool '{program}' not found")]
    ToolMissing { program: String },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("warp tool exited with {}: {stderr}", describe_exit(.exit_code))]
    ToolFailed { exit_code: Option<i32>, stderr: String },

    #[error("warp tool reported success but produced no output at {}", .path.display())]
    OutputMissing { path: PathBuf },

    #[error("warp tool produced an empty file at {}", .path.display())]
    OutputEmpty { path: PathBuf },

    #[error("failed to prepare output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of an external process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code, `None` if terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes a [`WarpCommand`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &WarpCommand) -> std::io::Result<ProcessOutput>;
}

/// Runs commands as child processes of this one.
#[derive(Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &WarpCommand) -> std::io::Result<ProcessOutput> {
        let output = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Produces one output raster per task, or nothing.
///
/// Any file left at the output path by a failed run is removed before the
/// error is returned, so the publisher can never pick up a partial raster.
pub struct ResamplingInvoker {
    config: WarpConfig,
    runner: Arc<dyn CommandRunner>,
}

impl ResamplingInvoker {
    pub fn new(config: WarpConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// Warp `descriptor` into `output`.
    ///
    /// # Returns
    /// The size of the output file in bytes.
    ///
    /// # Errors
    /// - [`InvokerError::OutputDir`] if the tile folder cannot be created
    /// - [`InvokerError::ToolMissing`] / [`InvokerError::Spawn`] if `gdalwarp` cannot be started
    /// - [`InvokerError::ToolFailed`] on a non-zero exit, with the stderr tail
    /// - [`InvokerError::OutputMissing`] / [`InvokerError::OutputEmpty`] if it
    ///   exited cleanly without a usable output
    pub async fn invoke(&self, descriptor: &TaskDescriptor, output: &Path) -> Result<u64, InvokerError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| InvokerError::OutputDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let command = build_warp_command(&self.config, descriptor, output);
        tracing::debug!(command = %command.display(), "Running warp");

        let result = match self.runner.run(&command).await {
            Ok(result) => result,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                remove_partial(output).await;
                return Err(InvokerError::ToolMissing {
                    program: command.program,
                });
            }
            Err(source) => {
                remove_partial(output).await;
                return Err(InvokerError::Spawn {
                    program: command.program,
                    source,
                });
            }
        };

        if !result.success() {
            remove_partial(output).await;
            return Err(InvokerError::ToolFailed {
                exit_code: result.exit_code,
                stderr: stderr_tail(&result.stderr),
            });
        }

        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => Ok(meta.len()),
            Ok(_) => {
                remove_partial(output).await;
                Err(InvokerError::OutputEmpty {
                    path: output.to_path_buf(),
                })
            }
            Err(_) => {
                remove_partial(output).await;
                Err(InvokerError::OutputMissing {
                    path: output.to_path_buf(),
                })
            }
        }
    }
}

/// Remove whatever a failed run left behind.
///
/// The tile folder is left in place; sibling tasks may be writing into it.
async fn remove_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => tracing::debug!("Removed partial output {}", output.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove partial output {}: {}", output.display(), e),
    }
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}
