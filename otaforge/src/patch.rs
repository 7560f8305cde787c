// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Command,
};

use thiserror::Error;
use tracing::info;

use crate::{cmd, config::KeyMaterial};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] cmd::Error),
    #[error("I/O error on {0:?}")]
    Io(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Per-flavor signer options. The variants mirror the signer's mutually
/// exclusive root-access flags.
#[derive(Clone, Debug)]
pub enum PatchMode<'a> {
    Magisk {
        apk: &'a Path,
        preinit_device: &'a str,
    },
    Prepatched {
        boot_image: &'a Path,
    },
    Rootless,
}

/// Typed builder for one signer invocation. This is the entire external
/// contract with the patching tool; nothing else in the pipeline constructs
/// signer arguments.
#[derive(Debug)]
pub struct PatchCommand<'a> {
    pub avbroot: &'a Path,
    pub input: &'a Path,
    pub output: &'a Path,
    pub keys: &'a KeyMaterial,
    /// Passphrases are passed by environment variable name only. The values
    /// never appear in an argument list.
    pub pass_avb_env_var: Option<&'a str>,
    pub pass_ota_env_var: Option<&'a str>,
    pub mode: PatchMode<'a>,
}

impl PatchCommand<'_> {
    pub fn build(&self) -> Command {
        let mut command = Command::new(self.avbroot);

        command.arg("ota");
        command.arg("patch");
        command.arg("--input").arg(self.input);
        command.arg("--output").arg(self.output);
        command.arg("--key-avb").arg(&self.keys.key_avb);
        command.arg("--key-ota").arg(&self.keys.key_ota);
        command.arg("--cert-ota").arg(&self.keys.cert_ota);

        if let Some(var) = self.pass_avb_env_var {
            command.arg("--pass-avb-env-var").arg(var);
        }
        if let Some(var) = self.pass_ota_env_var {
            command.arg("--pass-ota-env-var").arg(var);
        }

        match &self.mode {
            PatchMode::Magisk {
                apk,
                preinit_device,
            } => {
                command.arg("--magisk").arg(apk);
                command.arg("--magisk-preinit-device").arg(preinit_device);
            }
            PatchMode::Prepatched { boot_image } => {
                command.arg("--prepatched").arg(boot_image);
            }
            PatchMode::Rootless => {
                command.arg("--rootless");
            }
        }

        command
    }
}

/// Produce one signed artifact. Skips work if the output already exists so
/// an interrupted run can resume. A failed invocation removes its partial
/// output; nothing partially patched is ever published.
pub fn patch_artifact(command: &PatchCommand) -> Result<()> {
    if command.output.exists() {
        info!("Already patched: {:?}", command.output);
        return Ok(());
    }

    info!("Patching {:?} -> {:?}", command.input, command.output);

    if let Err(e) = cmd::run(&mut command.build()) {
        // Never leave a partial artifact under the deterministic name.
        let _ = fs::remove_file(command.output);

        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::config::KeyMaterial;

    use super::{PatchCommand, PatchMode};

    fn keys() -> KeyMaterial {
        KeyMaterial {
            key_avb: "/keys/avb.key".into(),
            key_ota: "/keys/ota.key".into(),
            cert_ota: "/keys/ota.crt".into(),
        }
    }

    fn args_of(command: &std::process::Command) -> Vec<String> {
        command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn magisk_arguments() {
        let keys = keys();
        let command = PatchCommand {
            avbroot: Path::new("avbroot"),
            input: Path::new("ota.zip"),
            output: Path::new("out.zip"),
            keys: &keys,
            pass_avb_env_var: Some("PASSPHRASE_AVB"),
            pass_ota_env_var: None,
            mode: PatchMode::Magisk {
                apk: Path::new("magisk.apk"),
                preinit_device: "metadata",
            },
        }
        .build();

        let args = args_of(&command);

        assert_eq!(
            args,
            [
                "ota",
                "patch",
                "--input",
                "ota.zip",
                "--output",
                "out.zip",
                "--key-avb",
                "/keys/avb.key",
                "--key-ota",
                "/keys/ota.key",
                "--cert-ota",
                "/keys/ota.crt",
                "--pass-avb-env-var",
                "PASSPHRASE_AVB",
                "--magisk",
                "magisk.apk",
                "--magisk-preinit-device",
                "metadata",
            ],
        );
    }

    #[test]
    fn rootless_and_prepatched_arguments() {
        let keys = keys();

        let rootless = PatchCommand {
            avbroot: Path::new("avbroot"),
            input: Path::new("ota.zip"),
            output: Path::new("out.zip"),
            keys: &keys,
            pass_avb_env_var: None,
            pass_ota_env_var: None,
            mode: PatchMode::Rootless,
        }
        .build();
        assert!(args_of(&rootless).contains(&"--rootless".to_owned()));

        let prepatched = PatchCommand {
            avbroot: Path::new("avbroot"),
            input: Path::new("ota.zip"),
            output: Path::new("out.zip"),
            keys: &keys,
            pass_avb_env_var: None,
            pass_ota_env_var: None,
            mode: PatchMode::Prepatched {
                boot_image: Path::new("boot.img"),
            },
        }
        .build();

        let args = args_of(&prepatched);
        let pos = args.iter().position(|a| a == "--prepatched").unwrap();
        assert_eq!(args[pos + 1], "boot.img");
    }
}
