// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, Flavor};

/// Publisher page listing the latest OTA build per device.
pub const OTA_INDEX_URL: &str = "https://developers.google.com/android/ota";
/// Base URL that the filenames on the publisher page resolve against.
pub const OTA_DOWNLOAD_BASE_URL: &str = "https://dl.google.com/dl/android/aosp";

pub const MAGISK_REPO: &str = "topjohnwu/Magisk";
pub const AVBROOT_REPO: &str = "chenxiaolong/avbroot";
pub const CUSTOTA_REPO: &str = "chenxiaolong/Custota";

const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String, #[source] attohttpc::Error),
    #[error("No release found for {0}")]
    NoToolRelease(String),
    #[error("No OTA found for device {device} on publisher page")]
    OtaNotFound { device: String },
    #[error("Failed to parse version token from OTA filename: {0:?}")]
    ParseVersion(String),
    #[error("Failed to build OTA filename pattern")]
    Pattern(#[from] regex::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Canonical identifiers for one run, derived once and then immutable.
#[derive(Clone, Debug)]
pub struct Resolved {
    /// Upstream-assigned version of the firmware build. Doubles as the tag
    /// of the remote release.
    pub release_version: String,
    pub ota_url: String,
    pub magisk_version: Option<String>,
    pub avbroot_version: String,
    pub custota_version: String,
}

fn http_get_string(url: &str) -> Result<String> {
    debug!("Fetching {url}");

    attohttpc::get(url)
        .connect_timeout(TIMEOUT)
        .read_timeout(TIMEOUT)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .map_err(|e| Error::Http(url.to_owned(), e))
}

#[derive(Deserialize)]
struct LatestRelease {
    tag_name: String,
}

/// Resolve the `latest` sentinel against a tool's release index. Pinned
/// versions are passed through untouched.
fn resolve_tool_version(repo: &str, pin: &str) -> Result<String> {
    if pin != "latest" {
        return Ok(pin.to_owned());
    }

    let url = format!("https://api.github.com/repos/{repo}/releases/latest");

    debug!("Fetching {url}");

    let response = attohttpc::get(&url)
        .connect_timeout(TIMEOUT)
        .read_timeout(TIMEOUT)
        .header("User-Agent", "otaforge")
        .header("Accept", "application/vnd.github+json")
        .send()
        .map_err(|e| Error::Http(url.clone(), e))?;

    if response.status() == attohttpc::StatusCode::NOT_FOUND {
        return Err(Error::NoToolRelease(repo.to_owned()));
    }

    let release: LatestRelease = response
        .error_for_status()
        .and_then(|r| r.json())
        .map_err(|e| Error::Http(url, e))?;

    Ok(release.tag_name)
}

/// Find the device's OTA filename on the publisher page and extract its
/// version token.
pub fn find_ota(page: &str, device: &str) -> Result<(String, String)> {
    let pattern = Regex::new(&format!(
        r"{}-ota-[a-z0-9._]+-[0-9a-f]{{8}}\.zip",
        regex::escape(device),
    ))?;

    let filename = pattern
        .find(page)
        .map(|m| m.as_str().to_owned())
        .ok_or_else(|| Error::OtaNotFound {
            device: device.to_owned(),
        })?;

    let version = parse_version(&filename)?;

    Ok((filename, version))
}

/// The version token sits between the `ota` marker and the trailing hash:
/// `<device>-ota-<token>-<hash>.zip`. Anything else is malformed and fatal,
/// since the token becomes the release tag.
pub fn parse_version(filename: &str) -> Result<String> {
    let stem = filename
        .strip_suffix(".zip")
        .ok_or_else(|| Error::ParseVersion(filename.to_owned()))?;

    let parts = stem.split('-').collect::<Vec<_>>();
    let [_, marker, token, _] = parts.as_slice() else {
        return Err(Error::ParseVersion(filename.to_owned()));
    };

    if *marker != "ota" || token.is_empty() {
        return Err(Error::ParseVersion(filename.to_owned()));
    }

    Ok(token.to_uppercase())
}

pub fn resolve(config: &Config) -> Result<Resolved> {
    let page = http_get_string(OTA_INDEX_URL)?;
    let (filename, release_version) = find_ota(&page, &config.device)?;

    info!("Latest OTA for {}: {filename} ({release_version})", config.device);

    let magisk_version = if config.enabled_flavors.contains(&Flavor::Magisk) {
        let version = resolve_tool_version(MAGISK_REPO, &config.magisk_version)?;
        info!("Magisk version: {version}");
        Some(version)
    } else {
        None
    };

    let avbroot_version = resolve_tool_version(AVBROOT_REPO, &config.avbroot_version)?;
    let custota_version = resolve_tool_version(CUSTOTA_REPO, &config.custota_version)?;

    info!("Tool versions: avbroot {avbroot_version}, custota-tool {custota_version}");

    Ok(Resolved {
        release_version,
        ota_url: format!("{OTA_DOWNLOAD_BASE_URL}/{filename}"),
        magisk_version,
        avbroot_version,
        custota_version,
    })
}
