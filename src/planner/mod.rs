//! Conflict-resolution planner.
//!
//! Computes the desired per-path state for a profile: every enabled item's
//! archive entries run through the remap engine and path safety, then the
//! highest-priority candidate wins each `(target, relpath)` key, and
//! profile overrides replace winners last. Output order is fixed by a
//! BTreeMap so two runs over the same rows produce identical plans.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::archive::{ArchiveEntry, Archiver, EntryKind};
use crate::blobstore::{BlobKind, BlobStore};
use crate::cancel::CancelToken;
use crate::config::PathLimits;
use crate::db::{
    BlobRecord, Database, GameInstallRecord, ModFileVersionRecord, OverrideRecord,
    ProfileItemRecord, ProfileRecord, TargetRecord,
};
use crate::errors::{Error, Result};
use crate::pathsafe::{sanitize_rel_path, PathRule, SafeRelPath};
use crate::remap::{apply_rules, RemapRule};

/// Where a planned path's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    FromModVersion {
        mod_file_version_id: i64,
        archive_entry: String,
    },
    FromOverride {
        override_id: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub target_id: i64,
    pub relpath: SafeRelPath,
    pub source: ContentSource,
    /// Known up front for overrides; filled from the staged file for mod
    /// versions.
    pub expected_sha256: Option<String>,
    pub expected_size_bytes: Option<i64>,
}

/// Desired final on-disk state for a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub game_install_id: i64,
    pub profile_id: i64,
    /// Keyed by `(target_id, relpath)`; iteration order is the plan order.
    pub entries: BTreeMap<(i64, SafeRelPath), PlanEntry>,
    /// Archive blob backing each referenced mod file version.
    pub version_archives: BTreeMap<i64, String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct archive hashes the apply engine must stage: only archives
    /// that actually back a winning entry.
    pub fn distinct_archives(&self) -> Vec<String> {
        let mut shas = HashSet::new();
        for entry in self.entries.values() {
            if let ContentSource::FromModVersion {
                mod_file_version_id,
                ..
            } = &entry.source
            {
                if let Some(sha) = self.version_archives.get(mod_file_version_id) {
                    shas.insert(sha.clone());
                }
            }
        }
        let mut shas: Vec<String> = shas.into_iter().collect();
        shas.sort();
        shas
    }
}

/// Everything the pure resolution step needs for one enabled item.
#[derive(Debug, Clone)]
pub struct ItemEntries {
    pub item: ProfileItemRecord,
    pub version: ModFileVersionRecord,
    pub rules: Vec<RemapRule>,
    pub entries: Vec<ArchiveEntry>,
}

/// Resolve candidates into a plan. Deterministic: items arrive in
/// ascending item-id order and ties on priority keep the earlier item.
pub fn plan_from_items(
    install: &GameInstallRecord,
    profile: &ProfileRecord,
    target: &TargetRecord,
    items: &[ItemEntries],
    overrides: &[(OverrideRecord, BlobRecord)],
    limits: &PathLimits,
) -> Result<Plan> {
    let mut seen_priorities = HashSet::new();
    for ie in items {
        if !seen_priorities.insert(ie.item.priority) {
            return Err(Error::validation(format!(
                "duplicate priority {} among enabled profile items",
                ie.item.priority
            )));
        }
    }

    struct Candidate {
        priority: i64,
        item_id: i64,
        version_id: i64,
        archive_entry: String,
    }

    let mut winners: BTreeMap<(i64, SafeRelPath), Candidate> = BTreeMap::new();
    let mut version_archives = BTreeMap::new();

    for ie in items {
        version_archives.insert(ie.version.id, ie.version.archive_sha256.clone());
        let mut produced: HashSet<SafeRelPath> = HashSet::new();

        for entry in &ie.entries {
            match entry.kind {
                EntryKind::Regular => {}
                EntryKind::Directory => continue,
                EntryKind::Link | EntryKind::Other => {
                    return Err(Error::UnsafePath {
                        path: entry.path.clone(),
                        rule: PathRule::LinkEntry,
                    });
                }
            }

            let Some(mapped) = apply_rules(&ie.rules, &entry.path) else {
                continue;
            };
            let relpath = match sanitize_rel_path(&mapped, limits) {
                Ok(p) => p,
                Err(err) => {
                    tracing::debug!(
                        entry = %entry.path,
                        mapped = %mapped,
                        %err,
                        "dropping unsafe remapped entry"
                    );
                    continue;
                }
            };

            // Two entries of the same archive claiming one target path
            // cannot be resolved by priority.
            if !produced.insert(relpath.clone()) {
                return Err(Error::Conflict(format!(
                    "mod file version {} maps two entries to {relpath}",
                    ie.version.id
                )));
            }

            let key = (target.id, relpath);
            let candidate = Candidate {
                priority: ie.item.priority,
                item_id: ie.item.id,
                version_id: ie.version.id,
                archive_entry: entry.path.clone(),
            };
            let replaces = match winners.get(&key) {
                // Higher priority wins; a tie keeps the earlier item id.
                Some(current) => {
                    (candidate.priority, std::cmp::Reverse(candidate.item_id))
                        > (current.priority, std::cmp::Reverse(current.item_id))
                }
                None => true,
            };
            if replaces {
                winners.insert(key, candidate);
            }
        }
    }

    let mut entries: BTreeMap<(i64, SafeRelPath), PlanEntry> = winners
        .into_iter()
        .map(|((target_id, relpath), cand)| {
            let entry = PlanEntry {
                target_id,
                relpath: relpath.clone(),
                source: ContentSource::FromModVersion {
                    mod_file_version_id: cand.version_id,
                    archive_entry: cand.archive_entry,
                },
                expected_sha256: None,
                expected_size_bytes: None,
            };
            ((target_id, relpath), entry)
        })
        .collect();

    // Override layer: replaces any base winner, or introduces a new
    // desired file for a path no mod provides.
    for (ov, blob) in overrides {
        if ov.target_id != target.id {
            tracing::warn!(
                override_id = ov.id,
                target_id = ov.target_id,
                "skipping override for unknown target"
            );
            continue;
        }
        let relpath = match sanitize_rel_path(&ov.relpath, limits) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(override_id = ov.id, %err, "skipping override with unsafe path");
                continue;
            }
        };
        entries.insert(
            (ov.target_id, relpath.clone()),
            PlanEntry {
                target_id: ov.target_id,
                relpath,
                source: ContentSource::FromOverride { override_id: ov.id },
                expected_sha256: Some(blob.sha256.clone()),
                expected_size_bytes: Some(blob.size_bytes),
            },
        );
    }

    Ok(Plan {
        game_install_id: install.id,
        profile_id: profile.id,
        entries,
        version_archives,
    })
}

/// Load a profile's rows, list each referenced archive, and resolve the
/// plan. Listing goes through the external archiver, everything else is
/// pure.
pub async fn build_plan(
    db: &Database,
    blobstore: &BlobStore,
    archiver: &Archiver,
    limits: &PathLimits,
    install: &GameInstallRecord,
    profile: &ProfileRecord,
    cancel: &CancelToken,
) -> Result<Plan> {
    if profile.game_install_id != install.id {
        return Err(Error::invariant(format!(
            "profile {} does not belong to install {}",
            profile.id, install.id
        )));
    }
    let target = db
        .get_target_by_name(install.id, "game_dir")?
        .ok_or_else(|| Error::not_found(format!("target game_dir for install {}", install.id)))?;

    let mut items = Vec::new();
    let mut listed: HashMap<String, Vec<ArchiveEntry>> = HashMap::new();
    for item in db.list_enabled_profile_items(profile.id)? {
        cancel.check()?;
        let version = db
            .get_mod_file_version(item.mod_file_version_id)?
            .ok_or_else(|| {
                Error::not_found(format!("mod file version {}", item.mod_file_version_id))
            })?;
        let rules = db.list_remap_rules(item.id)?;

        let entries = match listed.get(&version.archive_sha256) {
            Some(entries) => entries.clone(),
            None => {
                let archive_path =
                    blobstore.path_for(BlobKind::Archive, &version.archive_sha256)?;
                if !archive_path.exists() {
                    return Err(Error::corruption(format!(
                        "archive blob {} is missing from the blob store",
                        version.archive_sha256
                    )));
                }
                let entries = archiver.list(&archive_path, cancel).await?;
                listed.insert(version.archive_sha256.clone(), entries.clone());
                entries
            }
        };

        items.push(ItemEntries {
            item,
            version,
            rules,
            entries,
        });
    }

    let overrides = db
        .list_overrides(profile.id)?
        .into_iter()
        .map(|ov| {
            let blob = db
                .get_blob(&ov.blob_sha256)?
                .ok_or_else(|| Error::not_found(format!("override blob {}", ov.blob_sha256)))?;
            Ok((ov, blob))
        })
        .collect::<Result<Vec<_>>>()?;

    plan_from_items(install, profile, &target, &items, &overrides, limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install() -> GameInstallRecord {
        GameInstallRecord {
            id: 1,
            store_id: "steam".to_string(),
            store_game_id: "10".to_string(),
            instance_id: "default".to_string(),
            display_name: "Game".to_string(),
            install_root: "/tmp/game1".to_string(),
            is_present: true,
            last_seen_at: None,
            applied_profile_id: None,
            applied_operation_id: None,
            applied_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn profile() -> ProfileRecord {
        ProfileRecord {
            id: 5,
            game_install_id: 1,
            name: "default".to_string(),
            is_active: true,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn target() -> TargetRecord {
        TargetRecord {
            id: 3,
            game_install_id: 1,
            name: "game_dir".to_string(),
            root_path: "/tmp/game1".to_string(),
            origin: crate::db::TargetOrigin::Discovered,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn item_entries(
        item_id: i64,
        version_id: i64,
        priority: i64,
        paths: &[&str],
    ) -> ItemEntries {
        ItemEntries {
            item: ProfileItemRecord {
                id: item_id,
                profile_id: 5,
                mod_file_version_id: version_id,
                enabled: true,
                priority,
                created_at: String::new(),
                updated_at: String::new(),
            },
            version: ModFileVersionRecord {
                id: version_id,
                mod_file_id: 1,
                archive_sha256: format!("{:064}", version_id),
                original_name: None,
                version_string: None,
                metadata: None,
                created_at: String::new(),
                updated_at: String::new(),
            },
            rules: Vec::new(),
            entries: paths
                .iter()
                .map(|p| ArchiveEntry {
                    path: p.to_string(),
                    kind: EntryKind::Regular,
                })
                .collect(),
        }
    }

    fn limits() -> PathLimits {
        PathLimits::default()
    }

    fn plan(items: &[ItemEntries], overrides: &[(OverrideRecord, BlobRecord)]) -> Result<Plan> {
        plan_from_items(&install(), &profile(), &target(), items, overrides, &limits())
    }

    #[test]
    fn empty_profile_yields_empty_plan() {
        let p = plan(&[], &[]).unwrap();
        assert!(p.is_empty());
        assert!(p.distinct_archives().is_empty());
    }

    #[test]
    fn higher_priority_wins_each_path() {
        let items = vec![
            item_entries(1, 101, 10, &["config/app.ini", "a.txt"]),
            item_entries(2, 102, 20, &["config/app.ini", "b.txt"]),
        ];
        let p = plan(&items, &[]).unwrap();
        assert_eq!(p.entries.len(), 3);

        let key = (3, sanitize_rel_path("config/app.ini", &limits()).unwrap());
        match &p.entries[&key].source {
            ContentSource::FromModVersion {
                mod_file_version_id,
                ..
            } => assert_eq!(*mod_file_version_id, 102),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn directory_entries_are_skipped() {
        let mut items = vec![item_entries(1, 101, 10, &["a.txt"])];
        items[0].entries.push(ArchiveEntry {
            path: "textures".to_string(),
            kind: EntryKind::Directory,
        });
        let p = plan(&items, &[]).unwrap();
        assert_eq!(p.entries.len(), 1);
    }

    #[test]
    fn link_entries_fail_planning() {
        let mut items = vec![item_entries(1, 101, 10, &["a.txt"])];
        items[0].entries.push(ArchiveEntry {
            path: "evil".to_string(),
            kind: EntryKind::Link,
        });
        let err = plan(&items, &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsafePath {
                rule: PathRule::LinkEntry,
                ..
            }
        ));
    }

    #[test]
    fn unsafe_remapped_paths_are_discarded() {
        let items = vec![item_entries(1, 101, 10, &["../outside.txt", "ok.txt"])];
        let p = plan(&items, &[]).unwrap();
        assert_eq!(p.entries.len(), 1);
        let key = (3, sanitize_rel_path("ok.txt", &limits()).unwrap());
        assert!(p.entries.contains_key(&key));
    }

    #[test]
    fn intra_item_collision_is_a_conflict() {
        // Backslash and slash forms normalize to the same target path.
        let items = vec![item_entries(1, 101, 10, &["a/b.txt", "a\\b.txt"])];
        let err = plan(&items, &[]).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn duplicate_priorities_fail_validation() {
        let items = vec![
            item_entries(1, 101, 10, &["a.txt"]),
            item_entries(2, 102, 10, &["b.txt"]),
        ];
        assert!(matches!(plan(&items, &[]), Err(Error::Validation(_))));
    }

    #[test]
    fn remap_rules_shape_the_plan() {
        let mut items = vec![item_entries(
            1,
            101,
            10,
            &["MyMod/Data/meshes/a.nif", "MyMod/readme.txt"],
        )];
        items[0].rules = vec![
            RemapRule::StripComponents(1),
            RemapRule::SelectSubdir("Data".to_string()),
        ];
        let p = plan(&items, &[]).unwrap();
        assert_eq!(p.entries.len(), 1);
        let key = (3, sanitize_rel_path("meshes/a.nif", &limits()).unwrap());
        assert!(p.entries.contains_key(&key));
    }

    fn override_fixture(id: i64, relpath: &str, sha: &str, size: i64) -> (OverrideRecord, BlobRecord) {
        (
            OverrideRecord {
                id,
                profile_id: 5,
                target_id: 3,
                relpath: relpath.to_string(),
                blob_sha256: sha.to_string(),
                kind: "full_file".to_string(),
                created_at: String::new(),
                updated_at: String::new(),
            },
            BlobRecord {
                sha256: sha.to_string(),
                kind: "override".to_string(),
                size_bytes: size,
                original_name: None,
                verified_at: None,
                created_at: String::new(),
                updated_at: String::new(),
            },
        )
    }

    #[test]
    fn overrides_replace_winners_and_add_new_paths() {
        let items = vec![item_entries(1, 101, 10, &["config/app.ini"])];
        let sha = format!("{:064}", 9);
        let overrides = vec![
            override_fixture(7, "config/app.ini", &sha, 12),
            override_fixture(8, "extra/new.txt", &sha, 12),
        ];
        let p = plan(&items, &overrides).unwrap();
        assert_eq!(p.entries.len(), 2);

        let key = (3, sanitize_rel_path("config/app.ini", &limits()).unwrap());
        let entry = &p.entries[&key];
        assert_eq!(entry.source, ContentSource::FromOverride { override_id: 7 });
        assert_eq!(entry.expected_sha256.as_deref(), Some(sha.as_str()));
        assert_eq!(entry.expected_size_bytes, Some(12));
    }

    #[test]
    fn plans_are_deterministic() {
        let items = vec![
            item_entries(1, 101, 10, &["z.txt", "a/b.txt", "m.txt"]),
            item_entries(2, 102, 20, &["a/b.txt", "q.txt"]),
        ];
        let first = plan(&items, &[]).unwrap();
        let second = plan(&items, &[]).unwrap();
        assert_eq!(first, second);
        let keys: Vec<_> = first.entries.keys().cloned().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
