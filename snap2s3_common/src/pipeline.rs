// snap2s3_common is the main snap2s3 library implementing the migration core.
// Copyright (C) 2025  snap2s3 contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::{PipelineError, PreflightError};

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// External tools every run spawns. Checked before any work starts.
pub const REQUIRED_TOOLS: &[&str] = &["lsblk", "lz4", "tar"];

/// Verifies that every required external tool is on `PATH`.
pub fn check_tools() -> Result<(), PreflightError> {
    for &tool in REQUIRED_TOOLS {
        which::which(tool).map_err(|source| PreflightError::MissingTool { tool, source })?;
    }

    Ok(())
}

/// A `StderrGate` shares one "a stage has failed" flag across the
/// stages of a pipeline. Stage stderr is relayed to the host's stderr
/// only while the flag is unset, so the broken-pipe complaints of
/// downstream stages are suppressed once the first real error is known.
#[derive(Clone, Default)]
pub struct StderrGate {
    failed: Arc<AtomicBool>,
}

impl StderrGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the pipeline as failed, silencing all further stderr relay.
    pub fn trip(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    fn is_tripped(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// A `Stage` is one external tool of a streaming pipeline, spawned in
/// a detached process group so that an interrupt delivered to this
/// process is not auto-forwarded to it; teardown is this process's
/// responsibility (kill-on-drop) once the multipart upload is aborted.
pub struct Stage {
    tool: &'static str,
    command: Command,
}

impl Stage {
    pub fn new(tool: &'static str) -> Self {
        let mut command = Command::new(tool);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        Self { tool, command }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.command.current_dir(dir);
        self
    }

    pub fn pipe_stdin(mut self) -> Self {
        self.command.stdin(Stdio::piped());
        self
    }

    pub fn pipe_stdout(mut self) -> Self {
        self.command.stdout(Stdio::piped());
        self
    }

    /// Spawns the stage, wiring its stderr through the gate.
    pub fn spawn(mut self, gate: &StderrGate) -> Result<RunningStage, PipelineError> {
        let mut child = self.command.spawn()?;

        if let Some(stderr) = child.stderr.take() {
            let gate = gate.clone();
            let tool = self.tool;

            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !gate.is_tripped() {
                        eprintln!("{}: {}", tool, line);
                    }
                }
            });
        }

        Ok(RunningStage {
            tool: self.tool,
            child,
        })
    }
}

/// A `RunningStage` owns a spawned pipeline child until it is awaited.
pub struct RunningStage {
    tool: &'static str,
    child: Child,
}

impl RunningStage {
    /// Takes the child's stdin pipe.
    pub fn take_stdin(&mut self) -> Result<ChildStdin, PipelineError> {
        self.child
            .stdin
            .take()
            .ok_or(PipelineError::NoStageInput(self.tool))
    }

    /// Takes the child's stdout pipe.
    pub fn take_stdout(&mut self) -> Result<ChildStdout, PipelineError> {
        self.child
            .stdout
            .take()
            .ok_or(PipelineError::NoStageOutput(self.tool))
    }

    /// Waits for the stage to exit and settles its status.
    /// An unsuccessful exit trips the gate before surfacing.
    pub async fn wait(mut self, gate: &StderrGate) -> Result<(), PipelineError> {
        let status = self.child.wait().await?;

        if status.success() {
            Ok(())
        } else {
            gate.trip();
            Err(PipelineError::Stage {
                tool: self.tool.to_string(),
                status,
            })
        }
    }
}

/// Returns a compressor stage for the configured level.
pub fn compressor(level: u32) -> Stage {
    Stage::new("lz4")
        .arg("-z")
        .arg(format!("-{}", level))
        .pipe_stdin()
        .pipe_stdout()
}

/// Returns a decompressor stage.
pub fn decompressor() -> Stage {
    Stage::new("lz4").arg("-d").pipe_stdin().pipe_stdout()
}

/// Returns an archiver stage streaming the contents of `dir`
/// as a tar of relative paths.
pub fn archiver(dir: impl AsRef<Path>) -> Stage {
    Stage::new("tar")
        .args(["-cf", "-", "."])
        .current_dir(dir)
        .pipe_stdout()
}
