use anyhow::Result;
use clap::{Parser, Subcommand};
use modctl::cancel::{self, CancelToken};
use modctl::remap::RemapRule;
use modctl::{App, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "modctl")]
#[command(
    author,
    version = "0.1.0",
    about = "A deterministic, profile-based mod manager for Linux games"
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// State root override for this invocation
    #[arg(long)]
    state_root: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state directory and database
    Init,

    /// Run health checks on the state, database, and dependencies
    Doctor {
        /// Run the more complete database checks
        #[arg(long)]
        full: bool,
        /// Rehash all blobs in the blob store
        #[arg(long)]
        recheck: bool,
    },

    /// Manage game stores
    Stores {
        #[command(subcommand)]
        action: StoreCommands,
    },

    /// Manage game installs
    Games {
        #[command(subcommand)]
        action: GameCommands,
    },

    /// Import and inspect mods
    Mods {
        #[command(subcommand)]
        action: ModCommands,
    },

    /// Manage profiles and their items
    Profiles {
        #[command(subcommand)]
        action: ProfileCommands,
    },

    /// Manage per-path file overrides
    Overrides {
        #[command(subcommand)]
        action: OverrideCommands,
    },

    /// Apply the selected profile to the game directory
    Apply {
        /// Override the currently active game
        #[arg(short, long)]
        game: Option<String>,
        /// Profile name (defaults to the active profile)
        #[arg(short, long)]
        profile: Option<String>,
        /// Overwrite/remove drifted files after backing them up
        #[arg(long)]
        force: bool,
    },

    /// Remove all tool-managed files and restore backups
    Unapply {
        /// Override the currently active game
        #[arg(short, long)]
        game: Option<String>,
        /// Remove drifted files after backing them up
        #[arg(long)]
        force: bool,
    },

    /// Export or import the full state as a bundle
    Bundle {
        #[command(subcommand)]
        action: BundleCommands,
    },
}

#[derive(Subcommand)]
enum StoreCommands {
    /// List registered stores
    List,
    /// Select the active store
    SetActive { store: String },
}

#[derive(Subcommand)]
enum GameCommands {
    /// List known game installs
    List,
    /// Register a game install by hand
    Add {
        /// Selector, e.g. steam:1091500 or steam:1091500#library_2
        selector: String,
        /// Display name
        name: String,
        /// Absolute install root containing the game files
        path: String,
    },
    /// Re-run discovery across enabled stores
    Refresh,
    /// Select the active game install
    SetActive { game: String },
    /// Show details for a game install
    Info {
        #[arg(short, long)]
        game: Option<String>,
    },
}

#[derive(Subcommand)]
enum ModCommands {
    /// Import a mod archive into the blob store
    Import {
        /// Path to the archive (non-archives are wrapped into tar.gz)
        path: String,
        /// Override the currently active game
        #[arg(short, long)]
        game: Option<String>,
        /// Name for the mod (defaults to the archive filename)
        #[arg(long)]
        name: Option<String>,
        /// Label for the mod file (defaults to "Main File")
        #[arg(long)]
        label: Option<String>,
        /// Nexus mod page URL (sets source_kind=nexus)
        #[arg(long)]
        nexus_url: Option<String>,
        /// Attach to an existing mod page id
        #[arg(long)]
        page_id: Option<i64>,
        /// Remove the original archive after import
        #[arg(long)]
        rm: bool,
    },
    /// List imported mods for a game
    List {
        #[arg(short, long)]
        game: Option<String>,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// List profiles
    List {
        #[arg(short, long)]
        game: Option<String>,
    },
    /// Create a new profile
    Create {
        name: String,
        #[arg(short, long)]
        game: Option<String>,
    },
    /// Rename a profile
    Rename {
        from: String,
        to: String,
        #[arg(short, long)]
        game: Option<String>,
    },
    /// Delete a profile
    Delete {
        name: String,
        #[arg(short, long)]
        game: Option<String>,
    },
    /// Select the active profile
    SetActive {
        name: String,
        #[arg(short, long)]
        game: Option<String>,
    },
    /// Pin a mod file version into a profile
    Add {
        /// Mod file version id (see `modctl mods list`)
        version_id: i64,
        /// Priority; higher wins conflicts
        #[arg(short = 'P', long)]
        priority: i64,
        #[arg(short, long)]
        game: Option<String>,
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Remove a pinned version from a profile
    Remove {
        version_id: i64,
        #[arg(short, long)]
        game: Option<String>,
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Enable a pinned version
    Enable {
        version_id: i64,
        #[arg(short, long)]
        game: Option<String>,
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Disable a pinned version without removing it
    Disable {
        version_id: i64,
        #[arg(short, long)]
        game: Option<String>,
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Replace the remap rules for a pinned version
    SetRemap {
        version_id: i64,
        /// Ordered rules as type=value, e.g. strip_components=1,
        /// select_subdir=Data, include_glob=**/*.esp
        #[arg(long = "rule")]
        rules: Vec<String>,
        #[arg(short, long)]
        game: Option<String>,
        #[arg(short, long)]
        profile: Option<String>,
    },
}

#[derive(Subcommand)]
enum OverrideCommands {
    /// Pin final content for a target-relative path
    Set {
        /// Target-relative path, e.g. config/app.ini
        relpath: String,
        /// Local file providing the content
        file: String,
        #[arg(short, long)]
        game: Option<String>,
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Remove an override
    Remove {
        relpath: String,
        #[arg(short, long)]
        game: Option<String>,
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// List overrides for a profile
    List {
        #[arg(short, long)]
        game: Option<String>,
        #[arg(short, long)]
        profile: Option<String>,
    },
}

#[derive(Subcommand)]
enum BundleCommands {
    /// Export the database and blob stores into one tar.gz
    Export { path: String },
    /// Import a previously exported bundle into an empty state root
    Import { path: String },
}

fn setup_logging(config: &Config, verbosity: u8) {
    let filter = match verbosity {
        0 => "modctl=info",
        1 => "modctl=debug",
        2 => "modctl=trace",
        _ => "trace",
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let log_dir = config.paths.log_dir();
    std::fs::create_dir_all(&log_dir).ok();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("modctl.log"));

    match file {
        Ok(file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file));
            let stderr_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(stderr_layer)
                .init();
        }
        Err(_) => {
            let stderr_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
        }
    }
}

async fn run(command: Commands, config: Config, cancel: CancelToken) -> Result<()> {
    match command {
        Commands::Init => {
            App::init(config, cancel)?;
            Ok(())
        }
        Commands::Bundle {
            action: BundleCommands::Import { path },
        } => App::cmd_bundle_import(&config, &path),
        command => {
            let app = App::open(config, cancel)?;
            match command {
                Commands::Init
                | Commands::Bundle {
                    action: BundleCommands::Import { .. },
                } => unreachable!("handled above"),
                Commands::Doctor { full, recheck } => app.cmd_doctor(full, recheck).await,
                Commands::Stores { action } => match action {
                    StoreCommands::List => app.cmd_stores_list(),
                    StoreCommands::SetActive { store } => app.cmd_stores_set_active(&store),
                },
                Commands::Games { action } => match action {
                    GameCommands::List => app.cmd_games_list(),
                    GameCommands::Add {
                        selector,
                        name,
                        path,
                    } => app.cmd_games_add(&selector, &name, &path),
                    GameCommands::Refresh => app.cmd_games_refresh(),
                    GameCommands::SetActive { game } => app.cmd_games_set_active(&game),
                    GameCommands::Info { game } => app.cmd_games_info(game.as_deref()),
                },
                Commands::Mods { action } => match action {
                    ModCommands::Import {
                        path,
                        game,
                        name,
                        label,
                        nexus_url,
                        page_id,
                        rm,
                    } => {
                        app.cmd_mods_import(
                            &path,
                            game.as_deref(),
                            name.as_deref(),
                            label.as_deref(),
                            nexus_url.as_deref(),
                            page_id,
                            rm,
                        )
                        .await
                    }
                    ModCommands::List { game } => app.cmd_mods_list(game.as_deref()),
                },
                Commands::Profiles { action } => match action {
                    ProfileCommands::List { game } => app.cmd_profiles_list(game.as_deref()),
                    ProfileCommands::Create { name, game } => {
                        app.cmd_profiles_create(game.as_deref(), &name)
                    }
                    ProfileCommands::Rename { from, to, game } => {
                        app.cmd_profiles_rename(game.as_deref(), &from, &to)
                    }
                    ProfileCommands::Delete { name, game } => {
                        app.cmd_profiles_delete(game.as_deref(), &name)
                    }
                    ProfileCommands::SetActive { name, game } => {
                        app.cmd_profiles_set_active(game.as_deref(), &name)
                    }
                    ProfileCommands::Add {
                        version_id,
                        priority,
                        game,
                        profile,
                    } => app.cmd_profiles_add(
                        game.as_deref(),
                        profile.as_deref(),
                        version_id,
                        priority,
                    ),
                    ProfileCommands::Remove {
                        version_id,
                        game,
                        profile,
                    } => app.cmd_profiles_remove(game.as_deref(), profile.as_deref(), version_id),
                    ProfileCommands::Enable {
                        version_id,
                        game,
                        profile,
                    } => app.cmd_profiles_set_enabled(
                        game.as_deref(),
                        profile.as_deref(),
                        version_id,
                        true,
                    ),
                    ProfileCommands::Disable {
                        version_id,
                        game,
                        profile,
                    } => app.cmd_profiles_set_enabled(
                        game.as_deref(),
                        profile.as_deref(),
                        version_id,
                        false,
                    ),
                    ProfileCommands::SetRemap {
                        version_id,
                        rules,
                        game,
                        profile,
                    } => {
                        let rules = rules
                            .iter()
                            .map(|r| RemapRule::parse_cli(r))
                            .collect::<Result<Vec<_>, _>>()?;
                        app.cmd_profiles_set_remap(
                            game.as_deref(),
                            profile.as_deref(),
                            version_id,
                            &rules,
                        )
                    }
                },
                Commands::Overrides { action } => match action {
                    OverrideCommands::Set {
                        relpath,
                        file,
                        game,
                        profile,
                    } => {
                        app.cmd_overrides_set(game.as_deref(), profile.as_deref(), &relpath, &file)
                    }
                    OverrideCommands::Remove {
                        relpath,
                        game,
                        profile,
                    } => app.cmd_overrides_remove(game.as_deref(), profile.as_deref(), &relpath),
                    OverrideCommands::List { game, profile } => {
                        app.cmd_overrides_list(game.as_deref(), profile.as_deref())
                    }
                },
                Commands::Apply {
                    game,
                    profile,
                    force,
                } => {
                    app.cmd_apply(game.as_deref(), profile.as_deref(), force)
                        .await
                }
                Commands::Unapply { game, force } => app.cmd_unapply(game.as_deref(), force).await,
                Commands::Bundle {
                    action: BundleCommands::Export { path },
                } => app.cmd_bundle_export(&path),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load().await {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };
    if let Some(state_root) = cli.state_root.as_deref() {
        let trimmed = state_root.trim();
        if trimmed.is_empty() {
            eprintln!("error: --state-root cannot be empty");
            std::process::exit(1);
        }
        config.state_root_override = Some(trimmed.to_string());
    }

    setup_logging(&config, cli.verbose);

    let cancel = CancelToken::new();
    cancel::install_ctrlc_handler(cancel.clone());

    if let Err(err) = run(cli.command, config, cancel).await {
        eprintln!("error: {err:#}");
        let code = err
            .downcast_ref::<modctl::errors::Error>()
            .map(|core| core.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}
