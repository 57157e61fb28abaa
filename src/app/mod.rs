//! Application wiring: one struct owning the config, database, blob
//! store, and archiver, with a method per CLI command.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::archive::Archiver;
use crate::blobstore::{BlobKind, BlobStore};
use crate::bundle;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::db::Database;
use crate::db::{GameInstallRecord, ProfileRecord};
use crate::deploy::{ApplyOptions, Deployer};
use crate::doctor::{self, DoctorOptions};
use crate::games;
use crate::importer::{self, ImportOptions};
use crate::pathsafe::sanitize_rel_path;
use crate::planner;
use crate::profiles;
use crate::remap::RemapRule;
use crate::state;

pub struct App {
    pub config: Config,
    pub db: Database,
    pub blobstore: BlobStore,
    pub archiver: Archiver,
    pub cancel: CancelToken,
}

impl App {
    /// Open an existing state directory. Most commands require `init` to
    /// have run once.
    pub fn open(config: Config, cancel: CancelToken) -> Result<Self> {
        let db_path = config.database_file();
        match std::fs::metadata(&db_path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => bail!(
                "database path {} exists but is not a regular file",
                db_path.display()
            ),
            Err(_) => bail!(
                "database not found at {}\n\nRun `modctl init` to initialize the state directory",
                db_path.display()
            ),
        }

        let db = Database::open(&db_path)?;
        db.recover_stale_operations()?;

        Ok(Self {
            blobstore: BlobStore::from_config(&config),
            archiver: Archiver::from_config(&config),
            config,
            db,
            cancel,
        })
    }

    /// Create the state directory layout and the database.
    pub fn init(config: Config, cancel: CancelToken) -> Result<Self> {
        config.ensure_dirs()?;
        let db = Database::open(&config.database_file())?;
        db.recover_stale_operations()?;
        println!("Initialized state directory at {}", config.state_root().display());

        Ok(Self {
            blobstore: BlobStore::from_config(&config),
            archiver: Archiver::from_config(&config),
            config,
            db,
            cancel,
        })
    }

    fn deployer(&self) -> Deployer<'_> {
        Deployer {
            db: &self.db,
            blobstore: &self.blobstore,
            archiver: &self.archiver,
            tmp_dir: self.config.tmp_dir(),
            locks_dir: self.config.locks_dir(),
            cancel: &self.cancel,
        }
    }

    fn active_path(&self) -> PathBuf {
        state::active_file(&self.config.paths)
    }

    /// `--game` argument, falling back to the active selection.
    fn resolve_game(&self, arg: Option<&str>) -> Result<GameInstallRecord> {
        if let Some(arg) = arg {
            return Ok(games::resolve_game_install(&self.db, arg)?);
        }
        let active = state::load_active(&self.active_path())?;
        let id = active.active_game_install_id.with_context(|| {
            "no active game selected; run `modctl games set-active <selector>` or pass --game"
        })?;
        Ok(games::resolve_game_install(&self.db, &id.to_string())?)
    }

    fn resolve_profile(
        &self,
        install: &GameInstallRecord,
        name: Option<&str>,
    ) -> Result<ProfileRecord> {
        Ok(profiles::resolve_profile(&self.db, install, name)?)
    }

    // ========== doctor / stores ==========

    pub async fn cmd_doctor(&self, full: bool, recheck: bool) -> Result<()> {
        doctor::run(
            &self.config,
            &self.db,
            &self.blobstore,
            &self.archiver,
            &self.cancel,
            &DoctorOptions { full, recheck },
        )
        .await?;
        println!("doctor: all checks passed");
        Ok(())
    }

    pub fn cmd_stores_list(&self) -> Result<()> {
        let active = state::load_active(&self.active_path())?;
        for store in self.db.list_stores()? {
            let enabled = if store.enabled { "enabled" } else { "disabled" };
            let marker = if active.active_store_id.as_deref() == Some(&store.id) {
                "*"
            } else {
                " "
            };
            println!(
                "{marker} {}  ({})  impl={}  {enabled}",
                store.id, store.display_name, store.implementation
            );
        }
        Ok(())
    }

    pub fn cmd_stores_set_active(&self, store_id: &str) -> Result<()> {
        if self.db.get_store(store_id)?.is_none() {
            bail!("store {store_id:?} is not registered");
        }
        let mut active = state::load_active(&self.active_path())?;
        active.active_store_id = Some(store_id.to_string());
        state::save_active(&self.active_path(), active)?;
        println!("active store: {store_id}");
        Ok(())
    }

    // ========== games ==========

    pub fn cmd_games_list(&self) -> Result<()> {
        let active = state::load_active(&self.active_path())?;
        for gi in self.db.list_game_installs()? {
            let marker = if active.active_game_install_id == Some(gi.id) {
                "*"
            } else {
                " "
            };
            let present = if gi.is_present { "present" } else { "missing" };
            println!(
                "{marker} [{}] {}  ({})  {}  {}",
                gi.id,
                games::short_selector(&gi.store_id, &gi.store_game_id, &gi.instance_id),
                gi.display_name,
                present,
                gi.install_root
            );
        }
        Ok(())
    }

    pub fn cmd_games_add(&self, selector: &str, name: &str, path: &str) -> Result<()> {
        let root = Path::new(path);
        if !root.is_dir() {
            bail!("install root {path:?} is not a directory");
        }
        let gi = games::register_install(&self.db, selector, name, path)?;
        println!(
            "registered {} (id {}) at {}",
            games::full_selector(&gi.store_id, &gi.store_game_id, &gi.instance_id),
            gi.id,
            gi.install_root
        );
        Ok(())
    }

    pub fn cmd_games_refresh(&self) -> Result<()> {
        let warnings = games::refresh_stores(&self.db)?;
        for w in warnings {
            println!("warning: {w}");
        }
        Ok(())
    }

    pub fn cmd_games_set_active(&self, arg: &str) -> Result<()> {
        let gi = games::resolve_game_install(&self.db, arg)?;
        let mut active = state::load_active(&self.active_path())?;
        active.active_game_install_id = Some(gi.id);
        active.active_store_id = Some(gi.store_id.clone());
        state::save_active(&self.active_path(), active)?;
        println!(
            "active game: {} ({})",
            games::short_selector(&gi.store_id, &gi.store_game_id, &gi.instance_id),
            gi.display_name
        );
        Ok(())
    }

    pub fn cmd_games_info(&self, game: Option<&str>) -> Result<()> {
        let gi = self.resolve_game(game)?;
        println!("id:            {}", gi.id);
        println!(
            "selector:      {}",
            games::full_selector(&gi.store_id, &gi.store_game_id, &gi.instance_id)
        );
        println!("name:          {}", gi.display_name);
        println!("install root:  {}", gi.install_root);
        println!("present:       {}", gi.is_present);
        if let Some(last_seen) = &gi.last_seen_at {
            println!("last seen:     {last_seen}");
        }
        if let Some(profile_id) = gi.applied_profile_id {
            let name = self
                .db
                .get_profile(profile_id)?
                .map(|p| p.name)
                .unwrap_or_else(|| format!("#{profile_id}"));
            println!("applied:       profile {name} at {}", gi.applied_at.as_deref().unwrap_or("?"));
        }
        for target in self.db.list_targets(gi.id)? {
            println!(
                "target:        {} -> {} ({})",
                target.name,
                target.root_path,
                target.origin.as_str()
            );
        }
        let installed = self.db.list_installed_files(gi.id)?;
        println!("tracked files: {}", installed.len());
        Ok(())
    }

    // ========== mods ==========

    #[allow(clippy::too_many_arguments)]
    pub async fn cmd_mods_import(
        &self,
        path: &str,
        game: Option<&str>,
        name: Option<&str>,
        label: Option<&str>,
        nexus_url: Option<&str>,
        page_id: Option<i64>,
        remove_source: bool,
    ) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let outcome = importer::import_archive(
            &self.db,
            &self.blobstore,
            &self.archiver,
            &self.config.tmp_dir(),
            &ImportOptions {
                game_install_id: gi.id,
                archive_path: PathBuf::from(path),
                mod_name: name.map(str::to_string),
                file_label: label.map(str::to_string),
                nexus_url: nexus_url.map(str::to_string),
                page_id,
                remove_source,
            },
            &self.cancel,
        )
        .await?;

        if outcome.wrapped {
            println!("note: input was wrapped into tar.gz for storage");
        }
        println!("Imported:");
        println!("  mod_page_id: {}", outcome.ids.page_id);
        println!("  mod_file_id: {}", outcome.ids.file_id);
        println!("  mod_file_version_id: {}", outcome.ids.version_id);
        println!("  sha256: {}", outcome.sha256);
        println!("  size_bytes: {}", outcome.size_bytes);
        Ok(())
    }

    pub fn cmd_mods_list(&self, game: Option<&str>) -> Result<()> {
        let gi = self.resolve_game(game)?;
        for page in self.db.list_mod_pages(gi.id)? {
            println!("[{}] {} ({})", page.id, page.name, page.source_kind);
            for file in self.db.list_mod_files(page.id)? {
                let primary = if file.is_primary { " primary" } else { "" };
                println!("  file [{}] {}{primary}", file.id, file.label);
                for version in self.db.list_mod_file_versions(file.id)? {
                    println!(
                        "    version [{}] {}  {}",
                        version.id,
                        &version.archive_sha256[..12],
                        version.original_name.as_deref().unwrap_or("")
                    );
                }
            }
        }
        Ok(())
    }

    // ========== profiles ==========

    pub fn cmd_profiles_list(&self, game: Option<&str>) -> Result<()> {
        let gi = self.resolve_game(game)?;
        for profile in self.db.list_profiles(gi.id)? {
            let marker = if profile.is_active { "*" } else { " " };
            let items = self.db.list_profile_items(profile.id)?;
            println!("{marker} [{}] {}  ({} items)", profile.id, profile.name, items.len());
        }
        Ok(())
    }

    pub fn cmd_profiles_create(&self, game: Option<&str>, name: &str) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.db.create_profile(gi.id, name)?;
        println!("created profile {} (id {})", profile.name, profile.id);
        Ok(())
    }

    pub fn cmd_profiles_rename(&self, game: Option<&str>, from: &str, to: &str) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.resolve_profile(&gi, Some(from))?;
        self.db.rename_profile(profile.id, to)?;
        println!("renamed profile {from} -> {to}");
        Ok(())
    }

    pub fn cmd_profiles_delete(&self, game: Option<&str>, name: &str) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.resolve_profile(&gi, Some(name))?;
        if gi.applied_profile_id == Some(profile.id) {
            bail!("profile {name:?} is currently applied; run `modctl unapply` first");
        }
        self.db.delete_profile(profile.id)?;
        println!("deleted profile {name}");
        Ok(())
    }

    pub fn cmd_profiles_set_active(&self, game: Option<&str>, name: &str) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.resolve_profile(&gi, Some(name))?;
        self.db.set_active_profile(gi.id, profile.id)?;
        println!("active profile: {name}");
        Ok(())
    }

    pub fn cmd_profiles_add(
        &self,
        game: Option<&str>,
        profile: Option<&str>,
        version_id: i64,
        priority: i64,
    ) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.resolve_profile(&gi, profile)?;
        if self.db.get_mod_file_version(version_id)?.is_none() {
            bail!("mod file version {version_id} not found");
        }
        let item_id = self.db.add_profile_item(profile.id, version_id, priority)?;
        println!(
            "added version {version_id} to profile {} at priority {priority} (item {item_id})",
            profile.name
        );
        Ok(())
    }

    pub fn cmd_profiles_remove(
        &self,
        game: Option<&str>,
        profile: Option<&str>,
        version_id: i64,
    ) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.resolve_profile(&gi, profile)?;
        let item = self
            .db
            .get_profile_item(profile.id, version_id)?
            .with_context(|| format!("version {version_id} is not in profile {}", profile.name))?;
        self.db.remove_profile_item(item.id)?;
        println!("removed version {version_id} from profile {}", profile.name);
        Ok(())
    }

    pub fn cmd_profiles_set_enabled(
        &self,
        game: Option<&str>,
        profile: Option<&str>,
        version_id: i64,
        enabled: bool,
    ) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.resolve_profile(&gi, profile)?;
        let item = self
            .db
            .get_profile_item(profile.id, version_id)?
            .with_context(|| format!("version {version_id} is not in profile {}", profile.name))?;
        self.db.set_profile_item_enabled(item.id, enabled)?;
        println!(
            "{} version {version_id} in profile {}",
            if enabled { "enabled" } else { "disabled" },
            profile.name
        );
        Ok(())
    }

    pub fn cmd_profiles_set_remap(
        &self,
        game: Option<&str>,
        profile: Option<&str>,
        version_id: i64,
        rules: &[RemapRule],
    ) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.resolve_profile(&gi, profile)?;
        let item = self
            .db
            .get_profile_item(profile.id, version_id)?
            .with_context(|| format!("version {version_id} is not in profile {}", profile.name))?;
        self.db.replace_remap_rules(item.id, rules)?;
        println!(
            "set {} remap rule(s) for version {version_id} in profile {}",
            rules.len(),
            profile.name
        );
        Ok(())
    }

    // ========== overrides ==========

    pub fn cmd_overrides_set(
        &self,
        game: Option<&str>,
        profile: Option<&str>,
        relpath: &str,
        file: &str,
    ) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.resolve_profile(&gi, profile)?;
        let target = self
            .db
            .get_target_by_name(gi.id, "game_dir")?
            .with_context(|| format!("no game_dir target for install {}", gi.id))?;
        let relpath = sanitize_rel_path(relpath, &self.config.path_limits)?;

        let ingest = self
            .blobstore
            .ingest_file(BlobKind::Override, Path::new(file), &self.cancel)?;
        self.db.ensure_blob_recorded(
            &ingest.sha256,
            BlobKind::Override,
            ingest.size_bytes as i64,
            Path::new(file).file_name().and_then(|n| n.to_str()),
        )?;
        let id = self
            .db
            .upsert_override(profile.id, target.id, relpath.as_str(), &ingest.sha256)?;
        println!("override [{id}] {relpath} <- {} ({} bytes)", ingest.sha256, ingest.size_bytes);
        Ok(())
    }

    pub fn cmd_overrides_remove(
        &self,
        game: Option<&str>,
        profile: Option<&str>,
        relpath: &str,
    ) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.resolve_profile(&gi, profile)?;
        let target = self
            .db
            .get_target_by_name(gi.id, "game_dir")?
            .with_context(|| format!("no game_dir target for install {}", gi.id))?;
        let relpath = sanitize_rel_path(relpath, &self.config.path_limits)?;
        if self
            .db
            .remove_override(profile.id, target.id, relpath.as_str())?
        {
            println!("removed override for {relpath}");
        } else {
            bail!("no override recorded for {relpath}");
        }
        Ok(())
    }

    pub fn cmd_overrides_list(&self, game: Option<&str>, profile: Option<&str>) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.resolve_profile(&gi, profile)?;
        for ov in self.db.list_overrides(profile.id)? {
            println!("[{}] {}  {}", ov.id, ov.relpath, &ov.blob_sha256[..12]);
        }
        Ok(())
    }

    // ========== apply / unapply ==========

    pub async fn cmd_apply(
        &self,
        game: Option<&str>,
        profile: Option<&str>,
        force: bool,
    ) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let profile = self.resolve_profile(&gi, profile)?;

        let plan = planner::build_plan(
            &self.db,
            &self.blobstore,
            &self.archiver,
            &self.config.path_limits,
            &gi,
            &profile,
            &self.cancel,
        )
        .await?;
        println!("plan: {} path(s) desired", plan.entries.len());

        let outcome = self
            .deployer()
            .apply(&gi, &profile, plan, &ApplyOptions { force })
            .await?;
        println!(
            "apply: operation {} wrote {}, kept {}, removed {}",
            outcome.operation_id, outcome.written, outcome.kept, outcome.removed
        );
        for path in &outcome.drifted {
            println!("  drift (skipped): {path}");
        }
        Ok(())
    }

    pub async fn cmd_unapply(&self, game: Option<&str>, force: bool) -> Result<()> {
        let gi = self.resolve_game(game)?;
        let outcome = self
            .deployer()
            .unapply(&gi, &ApplyOptions { force })
            .await?;
        println!(
            "unapply: operation {} removed {}, restored {}",
            outcome.operation_id, outcome.removed, outcome.restored
        );
        for path in &outcome.drifted {
            println!("  drift (kept): {path}");
        }
        Ok(())
    }

    // ========== bundle ==========

    pub fn cmd_bundle_export(&self, out: &str) -> Result<()> {
        bundle::export_bundle(&self.db, &self.config.state_root(), Path::new(out))?;
        println!("exported bundle to {out}");
        Ok(())
    }

    pub fn cmd_bundle_import(config: &Config, bundle_path: &str) -> Result<()> {
        let manifest = bundle::import_bundle(Path::new(bundle_path), &config.state_root())?;
        println!(
            "imported bundle (schema v{}, {} archive blob(s))",
            manifest.schema_version,
            manifest.blob_counts.get("archive").copied().unwrap_or(0)
        );
        Ok(())
    }
}
