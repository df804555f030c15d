//! x365 host
//!
//! Thin host process for the X365 game library manager: downloads the emulator, scans and
//! validates game files, and launches games with flags built from the saved settings.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use x365_core::args::{display_command, synthesize};
use x365_core::logging::init_logging;
use x365_core::{
    format_error_chain, scan_directory, scan_games, validate_emulator, validate_game_file,
    Downloader, JsonFileStore, LaunchConfig, ManagerSettings, ProcessLauncher, SettingsStore,
};

#[derive(Parser)]
#[command(name = "x365")]
#[command(about = "Xbox 360 emulator library manager", long_about = None)]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct LaunchArgs {
    /// Game image to boot; omit to start the emulator on its own
    game: Option<PathBuf>,

    /// Emulator executable (defaults to the configured one)
    #[arg(short, long)]
    emulator: Option<PathBuf>,

    /// Per-game launch config (JSON) laid over the saved defaults
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file, following redirects
    Download {
        /// Source URL (defaults to the configured emulator download URL)
        url: Option<String>,

        /// Destination file (defaults to the download directory + the URL's file name)
        dest: Option<PathBuf>,
    },

    /// Launch the emulator, optionally with a game
    Launch {
        #[command(flatten)]
        launch: LaunchArgs,
    },

    /// Print the argv a launch would use without starting anything
    Args {
        #[command(flatten)]
        launch: LaunchArgs,
    },

    /// List files below a directory
    Scan {
        /// Directory to scan (defaults to the configured games directory)
        dir: Option<PathBuf>,

        /// Only list files with a known game extension
        #[arg(short, long)]
        games_only: bool,
    },

    /// Check that a file looks like a usable emulator executable
    ValidateEmulator { path: PathBuf },

    /// Check that a file looks like a supported game image
    ValidateGame { path: PathBuf },

    /// Try starting the emulator to see whether it runs at all
    Probe {
        /// Emulator executable (defaults to the configured one)
        path: Option<PathBuf>,
    },

    /// Show or change saved settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the current settings as JSON
    Show,
    /// Set the emulator executable
    SetEmulator { path: PathBuf },
    /// Set the games directory
    SetGamesDir { path: PathBuf },
    /// Set the directory downloads land in
    SetDownloadDir { path: PathBuf },
    /// Set the URL the emulator is downloaded from
    SetDownloadUrl { url: String },
    /// Replace the default launch config with a JSON file
    SetDefaults { config: PathBuf },
}

fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("x365-manager")
        .join("settings.json")
}

fn read_launch_config(path: &Path) -> anyhow::Result<LaunchConfig> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading launch config {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing launch config {}", path.display()))
}

fn resolve_emulator(explicit: Option<PathBuf>, settings: &ManagerSettings) -> anyhow::Result<PathBuf> {
    explicit
        .or_else(|| settings.emulator_path.clone())
        .ok_or_else(|| anyhow!("no emulator configured; pass --emulator or run `x365 settings set-emulator`"))
}

fn resolve_launch(
    launch: LaunchArgs,
    settings: &ManagerSettings,
) -> anyhow::Result<(PathBuf, Option<PathBuf>, LaunchConfig)> {
    let emulator = resolve_emulator(launch.emulator, settings)?;
    let per_game = launch.config.as_deref().map(read_launch_config).transpose()?;
    let cfg = settings.launch_config_for(per_game.as_ref());
    Ok((emulator, launch.game, cfg))
}

fn download_target(url: &str, dest: Option<PathBuf>, settings: &ManagerSettings) -> anyhow::Result<PathBuf> {
    if let Some(dest) = dest {
        return Ok(dest);
    }
    let name = url
        .split(['?', '#'])
        .next()
        .and_then(|u| u.rsplit('/').next())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| anyhow!("cannot derive a file name from {url}; pass a destination"))?;
    let dir = settings
        .download_directory
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(dir.join(name))
}

async fn run_download(url: Option<String>, dest: Option<PathBuf>, settings: &ManagerSettings) -> anyhow::Result<()> {
    let url = url
        .or_else(|| settings.emulator_download_url.clone())
        .ok_or_else(|| anyhow!("no URL given and no emulator download URL configured"))?;
    let dest = download_target(&url, dest, settings)?;

    let downloader = Downloader::new(settings.download.clone())?;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("  {bar:40.cyan/blue} {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message(url.clone());

    let result = downloader
        .download_with_cancel(&url, &dest, &cancel, |percent| pb.set_position(u64::from(percent)))
        .await;
    pb.finish_and_clear();

    let path = result?;
    println!("Downloaded {}", path.display());
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let store = JsonFileStore::new(cli.settings.unwrap_or_else(default_settings_path));
    let mut settings = store.load()?;

    match cli.command {
        Commands::Download { url, dest } => run_download(url, dest, &settings).await?,

        Commands::Launch { launch } => {
            let (emulator, game, cfg) = resolve_launch(launch, &settings)?;
            let result = ProcessLauncher::new()
                .launch(&emulator, game.as_deref(), &cfg)
                .await?;
            match result.pid {
                Some(pid) => println!("Launched (pid {pid}): {}", result.command),
                None => println!("Launched: {}", result.command),
            }
        }

        Commands::Args { launch } => {
            let (emulator, game, cfg) = resolve_launch(launch, &settings)?;
            let argv = synthesize(&emulator, game.as_deref(), &cfg);
            println!("{}", display_command(&emulator, &argv));
            for arg in &argv {
                println!("  {}", arg.to_string_lossy());
            }
        }

        Commands::Scan { dir, games_only } => {
            let dir = dir
                .or_else(|| settings.games_directory.clone())
                .ok_or_else(|| anyhow!("no directory given and no games directory configured"))?;
            let files = if games_only {
                scan_games(&dir)?
            } else {
                scan_directory(&dir)?
            };
            for file in &files {
                println!("{}", file.display());
            }
            info!(count = files.len(), "scan finished");
        }

        Commands::ValidateEmulator { path } => {
            let info = validate_emulator(&path)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::ValidateGame { path } => {
            let info = validate_game_file(&path)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Probe { path } => {
            let emulator = resolve_emulator(path, &settings)?;
            let report = ProcessLauncher::new().probe(&emulator).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.can_launch {
                bail!("emulator could not be started");
            }
        }

        Commands::Settings { action } => {
            match action {
                SettingsAction::Show => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                    return Ok(());
                }
                SettingsAction::SetEmulator { path } => {
                    validate_emulator(&path)?;
                    settings.emulator_path = Some(path);
                    settings.setup_completed = true;
                }
                SettingsAction::SetGamesDir { path } => settings.games_directory = Some(path),
                SettingsAction::SetDownloadDir { path } => settings.download_directory = Some(path),
                SettingsAction::SetDownloadUrl { url } => settings.emulator_download_url = Some(url),
                SettingsAction::SetDefaults { config } => {
                    settings.default_launch = read_launch_config(&config)?;
                }
            }
            store.save(&settings)?;
            println!("Saved {}", store.path().display());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging("warn");
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", format_error_chain(err.as_ref()));
            ExitCode::FAILURE
        }
    }
}
