// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, path::PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::Flavor,
    release::{Asset, Release, ReleaseApi},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to query remote release")]
    Query(#[from] crate::release::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Build metadata mixed into every artifact name. `revision` is the short
/// hash of the source tree that produced the build.
#[derive(Clone, Debug)]
pub struct BuildStamp {
    pub revision: String,
    pub dirty: bool,
    pub test: bool,
}

/// Deterministic artifact name for one flavor. Two runs with identical
/// inputs must produce identical names; remote-state reconciliation depends
/// on it.
pub fn artifact_name(
    device: &str,
    version: &str,
    flavor: Flavor,
    tool_version: Option<&str>,
    stamp: &BuildStamp,
) -> String {
    let mut parts = vec![device, version, flavor.as_str()];

    if let Some(tool_version) = tool_version {
        parts.push(tool_version);
    }

    parts.push(&stamp.revision);

    if stamp.dirty {
        parts.push("dirty");
    }
    if stamp.test {
        parts.push("test");
    }

    format!("{}.zip", parts.join("-"))
}

/// Prefix shared by all assets of a flavor within one release, regardless of
/// tool version or build stamp.
pub fn asset_prefix(device: &str, version: &str, flavor: Flavor) -> String {
    format!("{device}-{version}-{flavor}-")
}

#[derive(Clone, Debug)]
pub struct Artifact {
    pub flavor: Flavor,
    pub file_name: String,
    /// Filled in by the patch executor.
    pub local_path: Option<PathBuf>,
}

/// The flavors that still require artifact production. The set only ever
/// shrinks after planning; stages may drop entries but never add them.
#[derive(Debug, Default)]
pub struct PendingSet {
    entries: BTreeMap<Flavor, Artifact>,
}

impl PendingSet {
    fn insert(&mut self, artifact: Artifact) {
        self.entries.insert(artifact.flavor, artifact);
    }

    pub fn remove(&mut self, flavor: Flavor) {
        self.entries.remove(&flavor);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, flavor: Flavor) -> bool {
        self.entries.contains_key(&flavor)
    }

    pub fn get(&self, flavor: Flavor) -> Option<&Artifact> {
        self.entries.get(&flavor)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Flavor, &Artifact)> {
        self.entries.iter().map(|(f, a)| (*f, a))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Flavor, &mut Artifact)> {
        self.entries.iter_mut().map(|(f, a)| (*f, a))
    }
}

/// Planner output: what still needs building and which remote assets are
/// left over from prior naming schemes.
#[derive(Debug, Default)]
pub struct Plan {
    pub pending: PendingSet,
    pub stale_assets: Vec<Asset>,
    /// Remote release observed during planning, if any.
    pub existing_release: Option<Release>,
}

/// Compute the pending set for this run.
///
/// Without API access the remote state cannot be checked, so everything is
/// (re)built. Otherwise, a flavor is dropped only when an asset carrying its
/// exact deterministic filename already exists and no force/test override is
/// set. Prefix-matching assets under any other name are scheduled for
/// deletion and keep their flavor pending.
pub fn plan(
    api: Option<&dyn ReleaseApi>,
    device: &str,
    version: &str,
    flavors: impl IntoIterator<Item = (Flavor, Option<String>)>,
    stamp: &BuildStamp,
    force: bool,
) -> Result<Plan> {
    let mut plan = Plan::default();

    for (flavor, tool_version) in flavors {
        plan.pending.insert(Artifact {
            flavor,
            file_name: artifact_name(device, version, flavor, tool_version.as_deref(), stamp),
            local_path: None,
        });
    }

    let Some(api) = api else {
        debug!("No API credentials; assuming all flavors are pending");
        return Ok(plan);
    };

    let Some(release) = api.release_by_tag(version)? else {
        debug!("No release for tag {version}; all flavors are pending");
        return Ok(plan);
    };

    info!("Found existing release {} for tag {version}", release.id);

    if stamp.test {
        // The test channel never reconciles against production assets.
        plan.existing_release = Some(release);
        return Ok(plan);
    }

    let mut satisfied = vec![];

    for (flavor, artifact) in plan.pending.iter() {
        let prefix = asset_prefix(device, version, flavor);
        let mut exact = false;

        for asset in &release.assets {
            if !asset.name.starts_with(&prefix) {
                continue;
            }

            if asset.name == artifact.file_name {
                exact = true;
            } else {
                debug!("Asset {} does not match target {}", asset.name, artifact.file_name);
                plan.stale_assets.push(asset.clone());
            }
        }

        if exact && !force {
            info!("Flavor {flavor} already published as {}", artifact.file_name);
            satisfied.push(flavor);
        }
    }

    for flavor in satisfied {
        plan.pending.remove(flavor);
    }

    plan.existing_release = Some(release);

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::{
        config::Flavor,
        release::{Asset, CreateOutcome, Release, ReleaseApi},
    };

    use super::{artifact_name, plan, BuildStamp};

    struct FixedApi {
        release: Option<Release>,
    }

    impl ReleaseApi for FixedApi {
        fn release_by_tag(
            &self,
            _tag: &str,
        ) -> crate::release::Result<Option<Release>> {
            Ok(self.release.clone())
        }

        fn create_release(&self, _tag: &str) -> crate::release::Result<CreateOutcome> {
            unreachable!()
        }

        fn upload_asset(
            &self,
            _release_id: u64,
            _name: &str,
            _path: &Path,
        ) -> crate::release::Result<Asset> {
            unreachable!()
        }

        fn delete_asset(&self, _asset_id: u64) -> crate::release::Result<()> {
            unreachable!()
        }
    }

    fn stamp() -> BuildStamp {
        BuildStamp {
            revision: "1a2b3c4".to_owned(),
            dirty: false,
            test: false,
        }
    }

    #[test]
    fn filenames_are_deterministic() {
        let stamp = stamp();

        let a = artifact_name("cheetah", "100", Flavor::Magisk, Some("v27.0"), &stamp);
        let b = artifact_name("cheetah", "100", Flavor::Magisk, Some("v27.0"), &stamp);

        assert_eq!(a, b);
        assert_eq!(a, "cheetah-100-magisk-v27.0-1a2b3c4.zip");
    }

    #[test]
    fn stamp_markers_appear_in_order() {
        let stamp = BuildStamp {
            revision: "1a2b3c4".to_owned(),
            dirty: true,
            test: true,
        };

        assert_eq!(
            artifact_name("cheetah", "100", Flavor::Rootless, None, &stamp),
            "cheetah-100-rootless-1a2b3c4-dirty-test.zip",
        );
    }

    #[test]
    fn no_api_builds_everything() {
        let plan = plan(
            None,
            "cheetah",
            "100",
            [(Flavor::Magisk, Some("v27.0".to_owned())), (Flavor::Rootless, None)],
            &stamp(),
            false,
        )
        .unwrap();

        assert_eq!(plan.pending.len(), 2);
        assert!(plan.stale_assets.is_empty());
    }

    fn api_with_assets(names: &[(u64, &str)]) -> FixedApi {
        FixedApi {
            release: Some(Release {
                id: 7,
                tag_name: "100".to_owned(),
                assets: names
                    .iter()
                    .map(|(id, name)| Asset {
                        id: *id,
                        name: (*name).to_owned(),
                    })
                    .collect(),
            }),
        }
    }

    #[test]
    fn exact_match_is_the_only_skip_condition() {
        // v1 is stale, v27.0 is the current target.
        let api = api_with_assets(&[
            (1, "cheetah-100-magisk-v1-0000000.zip"),
            (2, "cheetah-100-rootless-1a2b3c4.zip"),
        ]);

        let plan = plan(
            Some(&api),
            "cheetah",
            "100",
            [(Flavor::Magisk, Some("v27.0".to_owned())), (Flavor::Rootless, None)],
            &stamp(),
            false,
        )
        .unwrap();

        // The rootless asset matches exactly and is satisfied. The magisk
        // asset only matches the prefix, so it must be rebuilt and the old
        // asset replaced.
        assert!(!plan.pending.contains(Flavor::Rootless));
        assert!(plan.pending.contains(Flavor::Magisk));
        assert_eq!(plan.pending.len(), 1);
        assert_eq!(plan.stale_assets.len(), 1);
        assert_eq!(plan.stale_assets[0].id, 1);
    }

    #[test]
    fn pending_set_never_grows() {
        let enabled = [(Flavor::Magisk, Some("v27.0".to_owned())), (Flavor::Rootless, None)];

        let api = api_with_assets(&[
            (1, "cheetah-100-magisk-v27.0-1a2b3c4.zip"),
            (2, "cheetah-100-rootless-1a2b3c4.zip"),
        ]);

        let plan = plan(Some(&api), "cheetah", "100", enabled.clone(), &stamp(), false).unwrap();

        for (flavor, _) in plan.pending.iter() {
            assert!(enabled.iter().any(|(f, _)| *f == flavor));
        }
        assert!(plan.pending.is_empty());
    }

    #[test]
    fn force_keeps_exact_matches_pending() {
        let api = api_with_assets(&[(1, "cheetah-100-rootless-1a2b3c4.zip")]);

        let plan = plan(
            Some(&api),
            "cheetah",
            "100",
            [(Flavor::Rootless, None)],
            &stamp(),
            true,
        )
        .unwrap();

        assert!(plan.pending.contains(Flavor::Rootless));
        assert!(plan.stale_assets.is_empty());
    }

    #[test]
    fn test_channel_never_reconciles() {
        let api = api_with_assets(&[(1, "cheetah-100-rootless-1a2b3c4.zip")]);
        let stamp = BuildStamp {
            revision: "1a2b3c4".to_owned(),
            dirty: false,
            test: true,
        };

        let plan = plan(
            Some(&api),
            "cheetah",
            "100",
            [(Flavor::Rootless, None)],
            &stamp,
            false,
        )
        .unwrap();

        // Production assets are neither trusted nor deleted.
        assert!(plan.pending.contains(Flavor::Rootless));
        assert!(plan.stale_assets.is_empty());
    }

    #[test]
    fn absent_release_builds_everything() {
        let api = FixedApi { release: None };

        let plan = plan(
            Some(&api),
            "cheetah",
            "100",
            [(Flavor::Rootless, None)],
            &stamp(),
            false,
        )
        .unwrap();

        assert!(plan.pending.contains(Flavor::Rootless));
        assert!(plan.existing_release.is_none());
    }
}
