//! Command-line synthesis for the wrapped emulator.
//!
//! The result is always a list of discrete argv tokens handed straight to the OS
//! spawn primitive. Nothing here is ever joined and re-parsed by a shell.

use crate::config::{configured, enabled, LaunchConfig};
use std::ffi::OsString;
use std::path::Path;

/// Flag grammar spoken by the target executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorFamily {
    /// xenia mainline and canary builds: `--name=value` cvars.
    Xenia,
    /// Anything else: a generic short flag set.
    Generic,
}

impl EmulatorFamily {
    pub fn detect(executable: &Path) -> Self {
        let name = executable
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.contains("xenia") {
            EmulatorFamily::Xenia
        } else {
            EmulatorFamily::Generic
        }
    }
}

/// Maps a UI resolution preset to xenia's draw resolution scale. 720p is the native
/// baseline.
fn xenia_scale(resolution: &str) -> Option<&'static str> {
    match resolution {
        "1280x720" => Some("1"),
        "1920x1080" => Some("1.5"),
        "2560x1440" => Some("2"),
        "3840x2160" => Some("3"),
        _ => None,
    }
}

/// Builds the argv for launching `executable`, game path first when given.
pub fn synthesize(executable: &Path, game: Option<&Path>, cfg: &LaunchConfig) -> Vec<OsString> {
    let mut argv: Vec<OsString> = Vec::new();
    if let Some(game) = game {
        argv.push(game.as_os_str().to_os_string());
    }

    let flags = match EmulatorFamily::detect(executable) {
        EmulatorFamily::Xenia => xenia_flags(cfg),
        EmulatorFamily::Generic => generic_flags(cfg),
    };
    argv.extend(flags.into_iter().map(OsString::from));
    argv
}

fn xenia_flags(cfg: &LaunchConfig) -> Vec<String> {
    let mut flags = Vec::new();

    if enabled(cfg.fullscreen) {
        flags.push("--fullscreen=true".to_string());
    }

    // An explicit legacy scale replaces the one derived from the resolution preset.
    let legacy_scale = configured(&cfg.resolution_scale).filter(|s| *s != "1");
    let scale = legacy_scale.or_else(|| {
        configured(&cfg.resolution)
            .and_then(xenia_scale)
            .filter(|s| *s != "1")
    });
    if let Some(scale) = scale {
        flags.push(format!("--draw_resolution_scale_x={scale}"));
        flags.push(format!("--draw_resolution_scale_y={scale}"));
    }

    if let Some(gpu @ ("d3d12" | "vulkan")) = configured(&cfg.renderer) {
        flags.push(format!("--gpu={gpu}"));
    }
    if let Some(vsync) = cfg.vsync {
        flags.push(format!("--vsync={vsync}"));
    }
    if enabled(cfg.show_fps) {
        flags.push("--show_profiler=true".to_string());
    }

    flags.push("--license_mask=-1".to_string());

    let language = configured(&cfg.user_language).unwrap_or("1");
    flags.push(format!("--user_language={language}"));

    if enabled(cfg.mount_cache) {
        flags.push("--mount_cache=true".to_string());
    }
    if enabled(cfg.gpu_readback) {
        flags.push("--d3d12_readback_resolve=true".to_string());
    }

    let priority = configured(&cfg.queue_priority).unwrap_or("1");
    flags.push(format!("--d3d12_queue_priority={priority}"));

    flags.extend(cfg.custom_tokens().map(str::to_string));
    flags
}

fn generic_flags(cfg: &LaunchConfig) -> Vec<String> {
    let mut flags = Vec::new();

    if enabled(cfg.fullscreen) {
        flags.push("--fullscreen".to_string());
    }

    let valued = [
        ("--resolution", &cfg.resolution),
        ("--renderer", &cfg.renderer),
        ("--audio", &cfg.audio_driver),
    ];
    for (flag, value) in valued {
        if let Some(value) = configured(value) {
            flags.push(format!("{flag}={value}"));
        }
    }

    match cfg.vsync {
        Some(false) => flags.push("--no-vsync".to_string()),
        Some(true) => flags.push("--vsync".to_string()),
        None => {}
    }

    let tuning = [
        ("--antialiasing", &cfg.antialiasing),
        ("--texture-filter", &cfg.texture_filtering),
        ("--fps-limit", &cfg.frame_limit),
        ("--audio-latency", &cfg.audio_latency),
    ];
    for (flag, value) in tuning {
        if let Some(value) = configured(value) {
            flags.push(format!("{flag}={value}"));
        }
    }

    flags.extend(cfg.custom_tokens().map(str::to_string));
    flags
}

/// Human-readable rendering of a launch, for logs and the UI only. Never executed.
pub fn display_command(executable: &Path, argv: &[OsString]) -> String {
    let mut out = format!("\"{}\"", executable.display());
    for arg in argv {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}
