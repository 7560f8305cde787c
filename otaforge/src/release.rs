// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs::File, io, path::Path, time::Duration};

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::plan::Plan;

const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {method} {url}")]
    Http {
        method: &'static str,
        url: String,
        #[source]
        source: attohttpc::Error,
    },
    #[error("Unexpected status {status} for {method} {url}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },
    #[error("Release for tag {0} not found after create conflict")]
    InconsistentCreate(String),
    #[error("Failed to open asset for upload: {0:?}")]
    OpenAsset(std::path::PathBuf, #[source] io::Error),
    #[error("Artifact for {0} has no local path; executor did not run")]
    MissingLocalPath(crate::config::Flavor),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Asset {
    pub id: u64,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Release {
    pub id: u64,
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

pub enum CreateOutcome {
    Created(Release),
    /// The tag already exists, most likely because a concurrent run created
    /// it between our query and our create.
    Conflict,
}

/// The subset of the hosting platform's release semantics the pipeline needs.
pub trait ReleaseApi {
    fn release_by_tag(&self, tag: &str) -> Result<Option<Release>>;

    fn create_release(&self, tag: &str) -> Result<CreateOutcome>;

    fn upload_asset(&self, release_id: u64, name: &str, path: &Path) -> Result<Asset>;

    fn delete_asset(&self, asset_id: u64) -> Result<()>;
}

pub struct GitHubApi {
    repo: String,
    token: String,
}

impl GitHubApi {
    pub fn new(repo: &str, token: &str) -> Self {
        Self {
            repo: repo.to_owned(),
            token: token.to_owned(),
        }
    }

    fn request(&self, method: &'static str, url: &str) -> attohttpc::RequestBuilder {
        let builder = match method {
            "GET" => attohttpc::get(url),
            "POST" => attohttpc::post(url),
            "DELETE" => attohttpc::delete(url),
            _ => unreachable!("Unsupported method: {method}"),
        };

        builder
            .connect_timeout(TIMEOUT)
            .read_timeout(TIMEOUT)
            .header("User-Agent", "otaforge")
            .header("Accept", "application/vnd.github+json")
            .bearer_auth(&self.token)
    }
}

impl ReleaseApi for GitHubApi {
    fn release_by_tag(&self, tag: &str) -> Result<Option<Release>> {
        let url = format!(
            "https://api.github.com/repos/{}/releases/tags/{tag}",
            self.repo,
        );

        debug!("GET {url}");

        let response = self.request("GET", &url).send().map_err(|e| Error::Http {
            method: "GET",
            url: url.clone(),
            source: e,
        })?;

        if response.status() == attohttpc::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let release = response
            .error_for_status()
            .and_then(|r| r.json())
            .map_err(|e| Error::Http {
                method: "GET",
                url,
                source: e,
            })?;

        Ok(Some(release))
    }

    fn create_release(&self, tag: &str) -> Result<CreateOutcome> {
        let url = format!("https://api.github.com/repos/{}/releases", self.repo);

        debug!("POST {url}");

        let response = self
            .request("POST", &url)
            .json(&json!({ "tag_name": tag, "name": tag }))
            .and_then(|r| r.send())
            .map_err(|e| Error::Http {
                method: "POST",
                url: url.clone(),
                source: e,
            })?;

        if response.status() == attohttpc::StatusCode::UNPROCESSABLE_ENTITY {
            return Ok(CreateOutcome::Conflict);
        }

        let release = response
            .error_for_status()
            .and_then(|r| r.json())
            .map_err(|e| Error::Http {
                method: "POST",
                url,
                source: e,
            })?;

        Ok(CreateOutcome::Created(release))
    }

    fn upload_asset(&self, release_id: u64, name: &str, path: &Path) -> Result<Asset> {
        let url = format!(
            "https://uploads.github.com/repos/{}/releases/{release_id}/assets?name={name}",
            self.repo,
        );

        debug!("POST {url}");

        let file = File::open(path).map_err(|e| Error::OpenAsset(path.to_owned(), e))?;

        let asset = self
            .request("POST", &url)
            .header("Content-Type", "application/octet-stream")
            .body(attohttpc::body::File(file))
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| Error::Http {
                method: "POST",
                url,
                source: e,
            })?;

        Ok(asset)
    }

    fn delete_asset(&self, asset_id: u64) -> Result<()> {
        let url = format!(
            "https://api.github.com/repos/{}/releases/assets/{asset_id}",
            self.repo,
        );

        debug!("DELETE {url}");

        let response = self
            .request("DELETE", &url)
            .send()
            .map_err(|e| Error::Http {
                method: "DELETE",
                url: url.clone(),
                source: e,
            })?;

        // A concurrent run may have already reconciled this asset away.
        match response.status().as_u16() {
            204 | 404 => Ok(()),
            status => Err(Error::Status {
                method: "DELETE",
                url,
                status,
            }),
        }
    }
}

/// Ensure a release exists for the tag, creating it if needed and adopting
/// the winner of a concurrent create race.
pub fn ensure_release(api: &dyn ReleaseApi, tag: &str) -> Result<Release> {
    match api.create_release(tag)? {
        CreateOutcome::Created(release) => {
            info!("Created release {} for tag {tag}", release.id);
            Ok(release)
        }
        CreateOutcome::Conflict => {
            info!("Tag {tag} already exists; adopting existing release");
            api.release_by_tag(tag)?
                .ok_or_else(|| Error::InconsistentCreate(tag.to_owned()))
        }
    }
}

/// Upload all pending artifacts, removing stale assets from prior naming
/// schemes and any same-name leftovers first.
pub fn publish(api: &dyn ReleaseApi, tag: &str, plan: &Plan) -> Result<u64> {
    let release = ensure_release(api, tag)?;

    let targets = plan
        .pending
        .iter()
        .map(|(_, a)| a.file_name.as_str())
        .collect::<Vec<_>>();

    for asset in &plan.stale_assets {
        // Never delete something we are about to upload under the same name.
        if targets.contains(&asset.name.as_str()) {
            continue;
        }

        info!("Deleting stale asset: {}", asset.name);
        api.delete_asset(asset.id)?;
    }

    // A forced rebuild replaces assets that already carry the target name.
    for asset in &release.assets {
        if targets.contains(&asset.name.as_str()) {
            info!("Deleting asset to be replaced: {}", asset.name);
            api.delete_asset(asset.id)?;
        }
    }

    for (flavor, artifact) in plan.pending.iter() {
        let path = artifact
            .local_path
            .as_deref()
            .ok_or(Error::MissingLocalPath(flavor))?;

        info!("Uploading {} for flavor {flavor}", artifact.file_name);
        api.upload_asset(release.id, &artifact.file_name, path)?;
    }

    Ok(release.id)
}
