use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = concat!("X365-Manager/", env!("CARGO_PKG_VERSION"));
pub const MAX_REDIRECTS: u32 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Per-launch emulator options as the UI produces them.
///
/// Every field is optional: an absent, empty or `"auto"` value means "leave the
/// emulator default alone" and never turns into a flag. Booleans are tri-state so a
/// per-game config can switch off something the global defaults switched on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchConfig {
    pub fullscreen: Option<bool>,
    #[serde(deserialize_with = "text_or_number")]
    pub resolution: Option<String>,
    /// Older configs stored the xenia scale factor directly.
    #[serde(deserialize_with = "text_or_number")]
    pub resolution_scale: Option<String>,
    #[serde(alias = "gpu", deserialize_with = "text_or_number")]
    pub renderer: Option<String>,
    #[serde(deserialize_with = "text_or_number")]
    pub audio_driver: Option<String>,
    pub vsync: Option<bool>,
    #[serde(rename = "showFPS", alias = "showFps")]
    pub show_fps: Option<bool>,
    #[serde(deserialize_with = "text_or_number")]
    pub user_language: Option<String>,
    pub mount_cache: Option<bool>,
    pub gpu_readback: Option<bool>,
    #[serde(deserialize_with = "text_or_number")]
    pub queue_priority: Option<String>,
    #[serde(deserialize_with = "text_or_number")]
    pub antialiasing: Option<String>,
    #[serde(deserialize_with = "text_or_number")]
    pub texture_filtering: Option<String>,
    #[serde(deserialize_with = "text_or_number")]
    pub frame_limit: Option<String>,
    #[serde(deserialize_with = "text_or_number")]
    pub audio_latency: Option<String>,
    pub custom_args: Option<String>,
}

impl LaunchConfig {
    /// Returns a copy of `self` with every field that is set in `other` taking its value.
    pub fn overlay(&self, other: &LaunchConfig) -> LaunchConfig {
        fn pick<T: Clone>(base: &Option<T>, over: &Option<T>) -> Option<T> {
            over.clone().or_else(|| base.clone())
        }

        LaunchConfig {
            fullscreen: pick(&self.fullscreen, &other.fullscreen),
            resolution: pick(&self.resolution, &other.resolution),
            resolution_scale: pick(&self.resolution_scale, &other.resolution_scale),
            renderer: pick(&self.renderer, &other.renderer),
            audio_driver: pick(&self.audio_driver, &other.audio_driver),
            vsync: pick(&self.vsync, &other.vsync),
            show_fps: pick(&self.show_fps, &other.show_fps),
            user_language: pick(&self.user_language, &other.user_language),
            mount_cache: pick(&self.mount_cache, &other.mount_cache),
            gpu_readback: pick(&self.gpu_readback, &other.gpu_readback),
            queue_priority: pick(&self.queue_priority, &other.queue_priority),
            antialiasing: pick(&self.antialiasing, &other.antialiasing),
            texture_filtering: pick(&self.texture_filtering, &other.texture_filtering),
            frame_limit: pick(&self.frame_limit, &other.frame_limit),
            audio_latency: pick(&self.audio_latency, &other.audio_latency),
            custom_args: pick(&self.custom_args, &other.custom_args),
        }
    }

    /// Whitespace-split `customArgs`, empty tokens dropped.
    pub fn custom_tokens(&self) -> impl Iterator<Item = &str> {
        self.custom_args
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
    }
}

/// An option value that should produce a flag, or `None` for unset/empty/`auto`.
pub(crate) fn configured(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("auto"))
}

pub(crate) fn enabled(value: Option<bool>) -> bool {
    value.unwrap_or(false)
}

fn text_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Float(f) => f.to_string(),
        Raw::Bool(b) => b.to_string(),
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadOptions {
    pub user_agent: String,
    /// Inactivity window for the request and for every body read.
    pub idle_timeout_secs: u64,
    pub max_redirects: u32,
    pub use_system_proxy: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_redirects: MAX_REDIRECTS,
            use_system_proxy: true,
        }
    }
}

impl DownloadOptions {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
