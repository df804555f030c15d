use crate::args::{display_command, synthesize};
use crate::config::LaunchConfig;
use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SPAWN_GRACE_PERIOD: Duration = Duration::from_secs(3);
const PROBE_HELP_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_BARE_TIMEOUT: Duration = Duration::from_secs(5);

type SpawnFn = fn(&mut Command) -> std::io::Result<Child>;

#[derive(Debug, Clone, Serialize)]
pub struct LaunchResult {
    /// Display form of the command line. Never executed.
    pub command: String,
    /// `None` when the grace period elapsed before the OS reported the spawn.
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub can_launch: bool,
    pub error: Option<String>,
    pub output: String,
}

/// Starts emulator processes and lets go of them.
///
/// Children run detached from the manager: their stdio is discarded, they get their
/// own process group, and nothing waits on them beyond reaping the exit status.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    grace_period: Duration,
    spawn: SpawnFn,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            grace_period: SPAWN_GRACE_PERIOD,
            spawn: Command::spawn,
        }
    }
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    #[cfg(test)]
    fn with_spawn(mut self, spawn: SpawnFn) -> Self {
        self.spawn = spawn;
        self
    }

    pub async fn launch(
        &self,
        executable: &Path,
        game: Option<&Path>,
        cfg: &LaunchConfig,
    ) -> CoreResult<LaunchResult> {
        if !path_exists(executable).await {
            return Err(CoreError::EmulatorNotFound(executable.to_path_buf()));
        }
        if let Some(game) = game {
            if !path_exists(game).await {
                return Err(CoreError::GameNotFound(game.to_path_buf()));
            }
        }

        let argv = synthesize(executable, game, cfg);
        let command = display_command(executable, &argv);
        info!(command = %command, "launching emulator");

        let mut cmd = detached_command(executable, &argv);
        let spawn_child = self.spawn;
        let mut spawn = tokio::task::spawn_blocking(move || {
            let mut child = spawn_child(&mut cmd)?;
            let pid = child.id();
            std::thread::spawn(move || {
                // reap
                let _ = child.wait();
            });
            Ok::<u32, std::io::Error>(pid)
        });

        tokio::select! {
            joined = &mut spawn => {
                let pid = joined
                    .map_err(|e| CoreError::Process(e.to_string()))?
                    .map_err(|e| CoreError::Process(e.to_string()))?;
                info!(pid, "emulator started");
                Ok(LaunchResult { command, pid: Some(pid) })
            }
            _ = tokio::time::sleep(self.grace_period) => {
                info!(grace_ms = self.grace_period.as_millis() as u64, "no spawn error within grace period, assuming started");
                tokio::spawn(async move {
                    match spawn.await {
                        Ok(Ok(pid)) => debug!(pid, "late spawn confirmation"),
                        Ok(Err(err)) => warn!(error = %err, "emulator failed to start after grace period"),
                        Err(err) => warn!(error = %err, "spawn task failed"),
                    }
                });
                Ok(LaunchResult { command, pid: None })
            }
        }
    }

    /// Checks whether `executable` can be started at all: first with `--help`, then bare.
    pub async fn probe(&self, executable: &Path) -> ProbeReport {
        match run_captured(executable, &["--help"], PROBE_HELP_TIMEOUT).await {
            Ok(output) => ProbeReport {
                can_launch: true,
                error: None,
                output: non_empty_or(output, "Emulator responded to --help"),
            },
            Err(first) => {
                debug!(error = %first, "--help probe failed, retrying without arguments");
                match run_captured(executable, &[], PROBE_BARE_TIMEOUT).await {
                    Ok(output) => ProbeReport {
                        can_launch: true,
                        error: None,
                        output: non_empty_or(output, "No output"),
                    },
                    Err(err) => ProbeReport {
                        can_launch: false,
                        error: Some(err),
                        output: "No output".to_string(),
                    },
                }
            }
        }
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn working_dir(executable: &Path) -> PathBuf {
    match executable.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn detached_command(executable: &Path, argv: &[OsString]) -> Command {
    let mut cmd = Command::new(executable);
    cmd.args(argv)
        .current_dir(working_dir(executable))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    cmd
}

async fn run_captured(executable: &Path, args: &[&str], limit: Duration) -> Result<String, String> {
    let mut cmd = tokio::process::Command::new(executable);
    cmd.args(args)
        .current_dir(working_dir(executable))
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(limit, cmd.output()).await {
        Err(_) => return Err(format!("timed out after {}s", limit.as_secs())),
        Ok(Err(err)) => return Err(err.to_string()),
        Ok(Ok(output)) => output,
    };
    if !output.status.success() {
        return Err(format!("process exited with {}", output.status));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        Ok(String::from_utf8_lossy(&output.stderr).into_owned())
    } else {
        Ok(stdout.into_owned())
    }
}

fn non_empty_or(output: String, fallback: &str) -> String {
    if output.trim().is_empty() {
        fallback.to_string()
    } else {
        output
    }
}
