// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::{
    config::{Config, Flavor},
    crypto,
    download::Fetcher,
    git::{self, Git},
    index,
    patch::{self, PatchCommand, PatchMode},
    plan::{self, BuildStamp},
    release::{self, GitHubApi, ReleaseApi},
    resolve::{self, Resolved, AVBROOT_REPO, CUSTOTA_REPO, MAGISK_REPO},
};

fn ensure_not_cancelled(cancel_signal: &AtomicBool) -> Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        bail!("Received cancel signal");
    }

    Ok(())
}

/// Best-effort removal of the scratch directory when the run ends, on both
/// the success and the failure path. Key material materialized under the
/// work dir must not outlive the run.
struct WorkDirCleanup<'a> {
    dir: &'a Path,
    skip: bool,
}

impl Drop for WorkDirCleanup<'_> {
    fn drop(&mut self) {
        if self.skip {
            info!("Keeping work directory: {:?}", self.dir);
        } else if let Err(e) = fs::remove_dir_all(self.dir) {
            warn!("Failed to clean up work directory: {e}");
        }
    }
}

/// The index stage only runs when release publishing is possible and the
/// index upload has not been disabled.
fn index_stage_enabled(has_token: bool, skip_index_upload: bool) -> bool {
    has_token && !skip_index_upload
}

/// Download URL for a release asset of a tool repo.
fn tool_asset_url(repo: &str, tag: &str, asset: &str) -> String {
    format!("https://github.com/{repo}/releases/download/{tag}/{asset}")
}

/// Fetch and verify the signer binary. Release archives are named after the
/// bare version, while tags carry a `v` prefix.
fn fetch_avbroot(
    fetcher: &Fetcher,
    version: &str,
    pubkey: &rsa::RsaPublicKey,
) -> Result<PathBuf> {
    let archive = format!(
        "avbroot-{}-x86_64-unknown-linux-gnu.zip",
        version.trim_start_matches('v'),
    );

    fetcher
        .fetch_tool(
            &tool_asset_url(AVBROOT_REPO, version, &archive),
            &archive,
            "avbroot",
            pubkey,
        )
        .with_context(|| format!("Failed to fetch avbroot {version}"))
}

fn fetch_custota_tool(
    fetcher: &Fetcher,
    version: &str,
    pubkey: &rsa::RsaPublicKey,
) -> Result<PathBuf> {
    let archive = format!(
        "custota-tool-{}-x86_64-unknown-linux-gnu.zip",
        version.trim_start_matches('v'),
    );

    fetcher
        .fetch_tool(
            &tool_asset_url(CUSTOTA_REPO, version, &archive),
            &archive,
            "custota-tool",
            pubkey,
        )
        .with_context(|| format!("Failed to fetch custota-tool {version}"))
}

fn fetch_magisk(fetcher: &Fetcher, version: &str) -> Result<PathBuf> {
    let asset = format!("Magisk-{version}.apk");

    fetcher
        .fetch(&tool_asset_url(MAGISK_REPO, version, &asset), &asset)
        .with_context(|| format!("Failed to fetch Magisk {version}"))
}

/// A prepatched boot image may be referenced by URL or by local path.
fn locate_prepatched(fetcher: &Fetcher, source: &str) -> Result<PathBuf> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let name = source
            .rsplit('/')
            .next()
            .expect("rsplit yields at least one item");

        fetcher
            .fetch(source, name)
            .with_context(|| format!("Failed to fetch prepatched image: {source}"))
    } else {
        let path = PathBuf::from(source);
        if !path.exists() {
            bail!("Prepatched image does not exist: {path:?}");
        }

        Ok(path)
    }
}

fn ota_file_name(resolved: &Resolved) -> &str {
    resolved
        .ota_url
        .rsplit('/')
        .next()
        .expect("rsplit yields at least one item")
}

/// Run the patch stage for every pending flavor, filling in the local paths
/// that the publisher consumes.
#[allow(clippy::too_many_arguments)]
fn patch_pending(
    config: &Config,
    plan: &mut plan::Plan,
    avbroot: &Path,
    ota: &Path,
    magisk_apk: Option<&Path>,
    prepatched: Option<&Path>,
    keys: &crate::config::KeyMaterial,
    work_dir: &Path,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    for (flavor, artifact) in plan.pending.iter_mut() {
        ensure_not_cancelled(cancel_signal)?;

        let mode = match flavor {
            Flavor::Magisk => PatchMode::Magisk {
                apk: magisk_apk.context("Magisk flavor pending without an apk")?,
                preinit_device: config
                    .magisk_preinit_device
                    .as_deref()
                    .context("Magisk flavor pending without a preinit device")?,
            },
            Flavor::KernelSu => PatchMode::Prepatched {
                boot_image: prepatched
                    .context("KernelSU flavor pending without a prepatched image")?,
            },
            Flavor::Rootless => PatchMode::Rootless,
        };

        let output = work_dir.join(&artifact.file_name);

        patch::patch_artifact(&PatchCommand {
            avbroot,
            input: ota,
            output: &output,
            keys,
            pass_avb_env_var: config.pass_avb_env_var.as_deref(),
            pass_ota_env_var: config.pass_ota_env_var.as_deref(),
            mode,
        })
        .with_context(|| format!("Failed to patch flavor {flavor}"))?;

        artifact.local_path = Some(output);
    }

    Ok(())
}

/// Generate the device-facing descriptors and merge them into the publishing
/// branch.
fn publish_index(
    config: &Config,
    version: &str,
    plan: &plan::Plan,
    custota_tool: &Path,
    keys: &crate::config::KeyMaterial,
) -> Result<()> {
    let mut sidecars = vec![];

    for (flavor, artifact) in plan.pending.iter() {
        let path = artifact
            .local_path
            .as_deref()
            .with_context(|| format!("Artifact for {flavor} has no local path"))?;
        let location = format!(
            "https://github.com/{}/releases/download/{version}/{}",
            config.repo, artifact.file_name,
        );

        let generated = index::generate_sidecars(
            custota_tool,
            flavor,
            path,
            &location,
            &keys.key_ota,
            &keys.cert_ota,
            config.pass_ota_env_var.as_deref(),
        )
        .with_context(|| format!("Failed to generate descriptors for {flavor}"))?;

        sidecars.push(generated);
    }

    let git = Git::new(".");

    let committed = index::update_index(
        &git,
        Path::new("."),
        &config.pages_branch,
        &config.device,
        version,
        &sidecars,
        config.test_channel,
        config.force_index_upload,
        index::PUSH_ATTEMPTS,
        index::PUSH_RETRY_DELAY,
    )
    .context("Failed to update distribution index")?;

    if committed {
        info!("Distribution index updated for {version}");
    }

    Ok(())
}

/// Run the whole pipeline once. Every stage is idempotent, so an interrupted
/// or failed run converges on a rerun.
pub fn run(config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("Failed to create work directory: {:?}", config.work_dir))?;

    let _cleanup = WorkDirCleanup {
        dir: &config.work_dir,
        skip: config.skip_cleanup,
    };

    let keys = config
        .materialize_keys(&config.work_dir)
        .context("Failed to prepare key material")?;

    let source_git = Git::new(".");
    let (revision, dirty) =
        git::current_revision(&source_git).context("Failed to read source revision")?;
    let stamp = BuildStamp {
        revision,
        dirty,
        test: config.test_channel,
    };

    if stamp.dirty {
        warn!("Source tree has uncommitted changes; artifacts are stamped dirty");
    }

    let resolved = resolve::resolve(config).context("Failed to resolve versions")?;
    let version = &resolved.release_version;

    let api = config
        .github_token
        .as_deref()
        .map(|token| GitHubApi::new(&config.repo, token));
    if api.is_none() {
        warn!("No API token; remote state is assumed empty and nothing will be published");
    }

    let flavors = config.enabled_flavors.iter().map(|&flavor| {
        let tool_version = match flavor {
            Flavor::Magisk => resolved.magisk_version.clone(),
            Flavor::KernelSu | Flavor::Rootless => None,
        };
        (flavor, tool_version)
    });

    let mut plan = plan::plan(
        api.as_ref().map(|a| a as &dyn ReleaseApi),
        &config.device,
        version,
        flavors,
        &stamp,
        config.force_build,
    )
    .context("Failed to plan the run")?;

    if plan.pending.is_empty() {
        if let Some(api) = &api {
            for asset in &plan.stale_assets {
                info!("Deleting stale asset: {}", asset.name);
                api.delete_asset(asset.id)
                    .context("Failed to delete stale asset")?;
            }
        }

        info!("Release {version} is complete; nothing to do");
        return Ok(());
    }

    info!("{} flavor(s) pending for {version}", plan.pending.len());

    ensure_not_cancelled(cancel_signal)?;

    let fetcher = Fetcher::new(&config.work_dir, cancel_signal);
    let pubkey = crypto::read_pem_public_key_file(&config.tool_pubkey)
        .context("Failed to load tool verification key")?;

    let avbroot = fetch_avbroot(&fetcher, &resolved.avbroot_version, &pubkey)?;

    let magisk_apk = match &resolved.magisk_version {
        Some(magisk_version) if plan.pending.contains(Flavor::Magisk) => {
            Some(fetch_magisk(&fetcher, magisk_version)?)
        }
        _ => None,
    };

    let prepatched = match &config.kernelsu_prepatched {
        Some(source) if plan.pending.contains(Flavor::KernelSu) => {
            Some(locate_prepatched(&fetcher, source)?)
        }
        _ => None,
    };

    let ota = fetcher
        .fetch(&resolved.ota_url, ota_file_name(&resolved))
        .context("Failed to fetch OTA image")?;

    patch_pending(
        config,
        &mut plan,
        &avbroot,
        &ota,
        magisk_apk.as_deref(),
        prepatched.as_deref(),
        &keys,
        &config.work_dir,
        cancel_signal,
    )?;

    ensure_not_cancelled(cancel_signal)?;

    let index_enabled = index_stage_enabled(api.is_some(), config.skip_index_upload);

    if let Some(api) = &api {
        let release_id =
            release::publish(api, version, &plan).context("Failed to publish artifacts")?;

        info!("Release {release_id} is up to date for {version}");

        if index_enabled {
            let custota_tool =
                fetch_custota_tool(&fetcher, &resolved.custota_version, &pubkey)?;

            publish_index(config, version, &plan, &custota_tool, &keys)?;
        } else {
            info!("Skipping distribution index update");
        }
    }

    Ok(())
}
