// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeSet,
    env, fmt,
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
};

use base64::{prelude::BASE64_STANDARD, Engine};
use thiserror::Error;

/// Prefix for all environment variables recognized by the pipeline, except
/// for the passphrase variables, which are named by the signer's contract.
pub const ENV_PREFIX: &str = "OTAFORGE_";

pub const PASS_AVB_ENV_VAR: &str = "PASSPHRASE_AVB";
pub const PASS_OTA_ENV_VAR: &str = "PASSPHRASE_OTA";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: String, value: String },
    #[error("Both {0} and {0}_BASE64 are set; pick one")]
    ConflictingSources(String),
    #[error("Invalid base64 data in {0}")]
    InvalidBase64(String, #[source] base64::DecodeError),
    #[error("No flavors enabled; set at least one of {}MAGISK, {}KERNELSU, {}ROOTLESS",
        ENV_PREFIX, ENV_PREFIX, ENV_PREFIX)]
    NoFlavors,
    #[error("Invalid repository (expected owner/name): {0:?}")]
    InvalidRepo(String),
    #[error("Failed to write key material: {0:?}")]
    WriteFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// An output variant axis. Each enabled flavor maps to exactly one artifact
/// per run.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Flavor {
    Magisk,
    KernelSu,
    Rootless,
}

impl Flavor {
    pub const ALL: [Self; 3] = [Self::Magisk, Self::KernelSu, Self::Rootless];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Magisk => "magisk",
            Self::KernelSu => "kernelsu",
            Self::Rootless => "rootless",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a piece of key material comes from. Base64 values are materialized
/// to 0600 files in the work directory before the signer runs.
#[derive(Clone, Debug)]
enum KeySource {
    File(PathBuf),
    Base64(String),
}

impl KeySource {
    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Self> {
        let file_var = format!("{ENV_PREFIX}{name}");
        let base64_var = format!("{file_var}_BASE64");

        match (lookup(&file_var), lookup(&base64_var)) {
            (Some(_), Some(_)) => Err(Error::ConflictingSources(file_var)),
            (Some(p), None) => Ok(Self::File(PathBuf::from(p))),
            (None, Some(b)) => Ok(Self::Base64(b)),
            (None, None) => Err(Error::MissingVar(file_var)),
        }
    }

    fn materialize(&self, var: &str, target: &Path) -> Result<PathBuf> {
        match self {
            Self::File(p) => Ok(p.clone()),
            Self::Base64(b) => {
                let data = BASE64_STANDARD
                    .decode(b.trim())
                    .map_err(|e| Error::InvalidBase64(var.to_owned(), e))?;

                let mut options = OpenOptions::new();
                options.write(true);
                options.create(true);
                options.truncate(true);

                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o600);
                }

                // Never log the contents here; this is secret material.
                options
                    .open(target)
                    .and_then(|mut f| f.write_all(&data))
                    .map_err(|e| Error::WriteFile(target.to_owned(), e))?;

                Ok(target.to_owned())
            }
        }
    }
}

/// Paths to the signing inputs after normalization.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    pub key_avb: PathBuf,
    pub key_ota: PathBuf,
    pub cert_ota: PathBuf,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub device: String,
    pub enabled_flavors: BTreeSet<Flavor>,

    pub magisk_version: String,
    pub magisk_preinit_device: Option<String>,
    pub kernelsu_prepatched: Option<String>,
    pub avbroot_version: String,
    pub custota_version: String,

    pub repo: String,
    pub github_token: Option<String>,

    pub force_build: bool,
    pub force_index_upload: bool,
    pub skip_index_upload: bool,
    pub test_channel: bool,
    pub skip_cleanup: bool,

    pub work_dir: PathBuf,
    pub pages_branch: String,
    pub tool_pubkey: PathBuf,

    key_avb: KeySource,
    key_ota: KeySource,
    cert_ota: KeySource,

    /// Names of the passphrase variables that are actually set. Only the
    /// names are ever passed to subprocesses.
    pub pass_avb_env_var: Option<String>,
    pub pass_ota_env_var: Option<String>,
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(Error::InvalidValue {
            var: var.to_owned(),
            value: value.to_owned(),
        }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| -> Result<String> {
            let var = format!("{ENV_PREFIX}{name}");
            lookup(&var).ok_or(Error::MissingVar(var))
        };
        let optional = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let toggle = |name: &str| -> Result<bool> {
            let var = format!("{ENV_PREFIX}{name}");
            match lookup(&var) {
                Some(v) => parse_bool(&var, &v),
                None => Ok(false),
            }
        };

        let device = required("DEVICE")?;

        let mut enabled_flavors = BTreeSet::new();
        for (flavor, name) in [
            (Flavor::Magisk, "MAGISK"),
            (Flavor::KernelSu, "KERNELSU"),
            (Flavor::Rootless, "ROOTLESS"),
        ] {
            if toggle(name)? {
                enabled_flavors.insert(flavor);
            }
        }
        if enabled_flavors.is_empty() {
            return Err(Error::NoFlavors);
        }

        let magisk_preinit_device = optional("MAGISK_PREINIT_DEVICE");
        if enabled_flavors.contains(&Flavor::Magisk) && magisk_preinit_device.is_none() {
            return Err(Error::MissingVar(format!(
                "{ENV_PREFIX}MAGISK_PREINIT_DEVICE"
            )));
        }

        let kernelsu_prepatched = optional("KERNELSU_PREPATCHED");
        if enabled_flavors.contains(&Flavor::KernelSu) && kernelsu_prepatched.is_none() {
            return Err(Error::MissingVar(format!(
                "{ENV_PREFIX}KERNELSU_PREPATCHED"
            )));
        }

        let repo = required("REPO")?;
        if repo.split('/').filter(|c| !c.is_empty()).count() != 2 {
            return Err(Error::InvalidRepo(repo));
        }

        Ok(Self {
            device,
            enabled_flavors,
            magisk_version: optional("MAGISK_VERSION").unwrap_or_else(|| "latest".to_owned()),
            magisk_preinit_device,
            kernelsu_prepatched,
            avbroot_version: optional("AVBROOT_VERSION")
                .unwrap_or_else(|| "latest".to_owned()),
            custota_version: optional("CUSTOTA_VERSION")
                .unwrap_or_else(|| "latest".to_owned()),
            repo,
            github_token: optional("GITHUB_TOKEN"),
            force_build: toggle("FORCE_BUILD")?,
            force_index_upload: toggle("FORCE_INDEX_UPLOAD")?,
            skip_index_upload: toggle("SKIP_INDEX_UPLOAD")?,
            test_channel: toggle("TEST_CHANNEL")?,
            skip_cleanup: toggle("SKIP_CLEANUP")?,
            work_dir: optional("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".otaforge")),
            pages_branch: optional("PAGES_BRANCH").unwrap_or_else(|| "gh-pages".to_owned()),
            tool_pubkey: required("TOOL_PUBKEY").map(PathBuf::from)?,
            key_avb: KeySource::from_lookup(lookup, "KEY_AVB")?,
            key_ota: KeySource::from_lookup(lookup, "KEY_OTA")?,
            cert_ota: KeySource::from_lookup(lookup, "CERT_OTA")?,
            pass_avb_env_var: lookup(PASS_AVB_ENV_VAR).map(|_| PASS_AVB_ENV_VAR.to_owned()),
            pass_ota_env_var: lookup(PASS_OTA_ENV_VAR).map(|_| PASS_OTA_ENV_VAR.to_owned()),
        })
    }

    /// Normalize all key material to paths on disk. Base64 inputs land in
    /// `<work_dir>/keys` with owner-only permissions.
    pub fn materialize_keys(&self, work_dir: &Path) -> Result<KeyMaterial> {
        let key_dir = work_dir.join("keys");
        std::fs::create_dir_all(&key_dir)
            .map_err(|e| Error::WriteFile(key_dir.clone(), e))?;

        Ok(KeyMaterial {
            key_avb: self
                .key_avb
                .materialize("KEY_AVB_BASE64", &key_dir.join("avb.key"))?,
            key_ota: self
                .key_ota
                .materialize("KEY_OTA_BASE64", &key_dir.join("ota.key"))?,
            cert_ota: self
                .cert_ota
                .materialize("CERT_OTA_BASE64", &key_dir.join("ota.crt"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;

    use super::{Config, Error, Flavor};

    fn base_env() -> BTreeMap<&'static str, &'static str> {
        BTreeMap::from([
            ("OTAFORGE_DEVICE", "cheetah"),
            ("OTAFORGE_ROOTLESS", "true"),
            ("OTAFORGE_REPO", "example/cheetah-ota"),
            ("OTAFORGE_TOOL_PUBKEY", "/keys/tools.pub.pem"),
            ("OTAFORGE_KEY_AVB", "/keys/avb.key"),
            ("OTAFORGE_KEY_OTA", "/keys/ota.key"),
            ("OTAFORGE_CERT_OTA", "/keys/ota.crt"),
        ])
    }

    fn from_map(map: &BTreeMap<&str, &str>) -> Result<Config, Error> {
        Config::from_lookup(&|name| map.get(name).map(|v| (*v).to_owned()))
    }

    #[test]
    fn minimal_config() {
        let config = from_map(&base_env()).unwrap();

        assert_eq!(config.device, "cheetah");
        assert!(config.enabled_flavors.contains(&Flavor::Rootless));
        assert_eq!(config.magisk_version, "latest");
        assert_eq!(config.pages_branch, "gh-pages");
        assert!(config.github_token.is_none());
        assert!(!config.force_build);
    }

    #[test]
    fn missing_device_is_fatal() {
        let mut env = base_env();
        env.remove("OTAFORGE_DEVICE");

        assert_matches!(from_map(&env), Err(Error::MissingVar(v)) if v == "OTAFORGE_DEVICE");
    }

    #[test]
    fn no_flavors_is_fatal() {
        let mut env = base_env();
        env.remove("OTAFORGE_ROOTLESS");

        assert_matches!(from_map(&env), Err(Error::NoFlavors));
    }

    #[test]
    fn magisk_requires_preinit_device() {
        let mut env = base_env();
        env.insert("OTAFORGE_MAGISK", "1");

        assert_matches!(from_map(&env), Err(Error::MissingVar(v))
            if v == "OTAFORGE_MAGISK_PREINIT_DEVICE");

        env.insert("OTAFORGE_MAGISK_PREINIT_DEVICE", "metadata");

        let config = from_map(&env).unwrap();
        assert!(config.enabled_flavors.contains(&Flavor::Magisk));
    }

    #[test]
    fn invalid_boolean_is_fatal() {
        let mut env = base_env();
        env.insert("OTAFORGE_FORCE_BUILD", "maybe");

        assert_matches!(from_map(&env), Err(Error::InvalidValue { var, .. })
            if var == "OTAFORGE_FORCE_BUILD");
    }

    #[test]
    fn conflicting_key_sources_are_fatal() {
        let mut env = base_env();
        env.insert("OTAFORGE_KEY_AVB_BASE64", "QUJD");

        assert_matches!(from_map(&env), Err(Error::ConflictingSources(v))
            if v == "OTAFORGE_KEY_AVB");
    }
}
