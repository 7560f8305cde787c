// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use thiserror::Error;
use tracing::info;

use crate::{
    cmd,
    config::Flavor,
    git::{self, push_with_retry, BranchGuard, GitRunner},
};

/// Retry policy for the publishing-branch push. Pushes race against
/// concurrent pipeline invocations, so a bounded rebase-and-retry loop
/// absorbs the common case.
pub const PUSH_ATTEMPTS: u32 = 5;
pub const PUSH_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] cmd::Error),
    #[error(transparent)]
    Git(#[from] git::Error),
    #[error("I/O error on {0:?}")]
    Io(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Typed builder for `custota-tool gen-csig`.
#[derive(Debug)]
pub struct CsigCommand<'a> {
    pub custota_tool: &'a Path,
    pub input: &'a Path,
    pub output: &'a Path,
    pub key: &'a Path,
    pub cert: &'a Path,
    pub passphrase_env_var: Option<&'a str>,
}

impl CsigCommand<'_> {
    pub fn build(&self) -> Command {
        let mut command = Command::new(self.custota_tool);

        command.arg("gen-csig");
        command.arg("--input").arg(self.input);
        command.arg("--output").arg(self.output);
        command.arg("--key").arg(self.key);
        command.arg("--cert").arg(self.cert);

        if let Some(var) = self.passphrase_env_var {
            command.arg("--passphrase-env-var").arg(var);
        }

        command
    }
}

/// Typed builder for `custota-tool gen-update-info`.
#[derive(Debug)]
pub struct UpdateInfoCommand<'a> {
    pub custota_tool: &'a Path,
    pub file: &'a Path,
    pub location: &'a str,
}

impl UpdateInfoCommand<'_> {
    pub fn build(&self) -> Command {
        let mut command = Command::new(self.custota_tool);

        command.arg("gen-update-info");
        command.arg("--file").arg(self.file);
        command.arg("--location").arg(self.location);

        command
    }
}

/// Generated sidecars for one artifact: the detached signature and the JSON
/// descriptor that devices poll.
#[derive(Debug)]
pub struct Sidecars {
    pub flavor: Flavor,
    pub csig: PathBuf,
    pub info: PathBuf,
}

#[allow(clippy::too_many_arguments)]
pub fn generate_sidecars(
    custota_tool: &Path,
    flavor: Flavor,
    artifact: &Path,
    location: &str,
    key: &Path,
    cert: &Path,
    passphrase_env_var: Option<&str>,
) -> Result<Sidecars> {
    let csig = append_ext(artifact, "csig");
    let info = append_ext(artifact, "json");

    cmd::run(
        &mut CsigCommand {
            custota_tool,
            input: artifact,
            output: &csig,
            key,
            cert,
            passphrase_env_var,
        }
        .build(),
    )?;

    cmd::run(
        &mut UpdateInfoCommand {
            custota_tool,
            file: &info,
            location,
        }
        .build(),
    )?;

    Ok(Sidecars { flavor, csig, info })
}

fn append_ext(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Decide whether an existing index entry must be replaced. Entries are only
/// rewritten when the stored release version differs, so metadata-only
/// reruns do not trigger device updates. When the descriptor schema carries
/// no top-level version string, the freshly generated content is compared
/// instead.
pub fn should_replace(existing: Option<&str>, fresh: &str, version: &str, force: bool) -> bool {
    if force {
        return true;
    }

    let Some(existing) = existing else {
        return true;
    };

    match serde_json::from_str::<serde_json::Value>(existing) {
        Ok(value) => match value.get("version").and_then(|v| v.as_str()) {
            Some(stored) => stored != version,
            None => existing != fresh,
        },
        // An unreadable entry is worth replacing.
        Err(_) => true,
    }
}

/// Merge the generated descriptors into the publishing branch and push.
///
/// Returns whether anything was committed. The original checkout is restored
/// on every exit path.
#[allow(clippy::too_many_arguments)]
pub fn update_index(
    git: &dyn GitRunner,
    repo_dir: &Path,
    branch: &str,
    device: &str,
    version: &str,
    sidecars: &[Sidecars],
    test_channel: bool,
    force: bool,
    attempts: u32,
    delay: Duration,
) -> Result<bool> {
    let _guard = BranchGuard::switch(git, branch)?;

    let mut changed_dirs = vec![];

    for sidecar in sidecars {
        let rel_dir = if test_channel {
            format!("test/{}", sidecar.flavor)
        } else {
            sidecar.flavor.to_string()
        };
        let dir = repo_dir.join(&rel_dir);
        let info_target = dir.join(format!("{device}.json"));
        let csig_target = dir.join(format!("{device}.csig"));

        let fresh = fs::read_to_string(&sidecar.info)
            .map_err(|e| Error::Io(sidecar.info.clone(), e))?;
        let existing = fs::read_to_string(&info_target).ok();

        if !should_replace(existing.as_deref(), &fresh, version, force) {
            info!(
                "Index entry for {} already at version {version}",
                sidecar.flavor,
            );
            continue;
        }

        fs::create_dir_all(&dir).map_err(|e| Error::Io(dir.clone(), e))?;
        fs::copy(&sidecar.info, &info_target)
            .map_err(|e| Error::Io(info_target.clone(), e))?;
        fs::copy(&sidecar.csig, &csig_target)
            .map_err(|e| Error::Io(csig_target.clone(), e))?;

        changed_dirs.push(rel_dir);
    }

    if changed_dirs.is_empty() {
        info!("Index is up to date");
        return Ok(false);
    }

    let mut add_args = vec!["add", "--"];
    add_args.extend(changed_dirs.iter().map(String::as_str));
    git.run(&add_args)?;

    // The copies may have produced identical content; only commit when the
    // staged index paths actually differ from HEAD. Unrelated dirty files
    // elsewhere in the tree must not trip this gate.
    let mut diff_args = vec!["diff", "--cached", "--name-only", "--"];
    diff_args.extend(changed_dirs.iter().map(String::as_str));
    let staged = git.output(&diff_args)?;
    if staged.is_empty() {
        info!("Index is up to date");
        return Ok(false);
    }

    let message = format!("Update {device} to {version}");
    git.run(&["commit", "-m", &message])?;

    push_with_retry(git, branch, attempts, delay)?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, fs, path::Path, time::Duration};

    use crate::{cmd, config::Flavor, git::GitRunner};

    use super::{should_replace, update_index, CsigCommand, Sidecars};

    struct MockGit {
        calls: RefCell<Vec<Vec<String>>>,
        /// What `git diff --cached` reports after the add.
        staged: &'static str,
    }

    impl Default for MockGit {
        fn default() -> Self {
            Self {
                calls: RefCell::new(vec![]),
                staged: "rootless/cheetah.json",
            }
        }
    }

    impl MockGit {
        fn count(&self, verb: &str) -> usize {
            self.calls.borrow().iter().filter(|c| c[0] == verb).count()
        }
    }

    impl GitRunner for MockGit {
        fn run(&self, args: &[&str]) -> cmd::Result<()> {
            self.calls
                .borrow_mut()
                .push(args.iter().map(|s| (*s).to_owned()).collect());
            Ok(())
        }

        fn output(&self, args: &[&str]) -> cmd::Result<String> {
            self.calls
                .borrow_mut()
                .push(args.iter().map(|s| (*s).to_owned()).collect());

            match args {
                ["rev-parse", "--abbrev-ref", "HEAD"] => Ok("main".to_owned()),
                ["diff", "--cached", "--name-only", ..] => Ok(self.staged.to_owned()),
                _ => Ok(String::new()),
            }
        }
    }

    #[test]
    fn replace_only_when_version_differs() {
        let stored = r#"{"version":"100","location":"https://x/100/a.zip"}"#;
        let fresh = r#"{"version":"100","location":"https://x/100/b.zip"}"#;

        assert!(!should_replace(Some(stored), fresh, "100", false));
        assert!(should_replace(Some(stored), fresh, "101", false));
        assert!(should_replace(Some(stored), fresh, "100", true));
        assert!(should_replace(None, fresh, "100", false));
        assert!(should_replace(Some("not json"), fresh, "100", false));
    }

    #[test]
    fn versionless_schema_falls_back_to_content_comparison() {
        let stored = r#"{"format":2,"location":"https://x/100/a.zip"}"#;
        let changed = r#"{"format":2,"location":"https://x/101/a.zip"}"#;

        assert!(!should_replace(Some(stored), stored, "100", false));
        assert!(should_replace(Some(stored), changed, "100", false));
    }

    fn sidecars_for(dir: &Path, version: &str) -> Sidecars {
        let info = dir.join("generated.json");
        let csig = dir.join("generated.csig");

        fs::write(
            &info,
            format!(r#"{{"version":"{version}","location":"https://x/{version}/a.zip"}}"#),
        )
        .unwrap();
        fs::write(&csig, b"csig").unwrap();

        Sidecars {
            flavor: Flavor::Rootless,
            csig,
            info,
        }
    }

    #[test]
    fn same_version_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let git = MockGit::default();

        let entry_dir = dir.path().join("rootless");
        fs::create_dir_all(&entry_dir).unwrap();
        fs::write(
            entry_dir.join("cheetah.json"),
            r#"{"version":"100","location":"https://x/100/old.zip"}"#,
        )
        .unwrap();

        let sidecars = [sidecars_for(dir.path(), "100")];

        let committed = update_index(
            &git,
            dir.path(),
            "gh-pages",
            "cheetah",
            "100",
            &sidecars,
            false,
            false,
            5,
            Duration::ZERO,
        )
        .unwrap();

        assert!(!committed);
        assert_eq!(git.count("commit"), 0);
        assert_eq!(git.count("push"), 0);

        // The stored entry keeps its original location.
        let stored = fs::read_to_string(entry_dir.join("cheetah.json")).unwrap();
        assert!(stored.contains("old.zip"));
    }

    #[test]
    fn new_version_is_committed_and_pushed() {
        let dir = tempfile::tempdir().unwrap();
        let git = MockGit::default();

        let entry_dir = dir.path().join("rootless");
        fs::create_dir_all(&entry_dir).unwrap();
        fs::write(
            entry_dir.join("cheetah.json"),
            r#"{"version":"100","location":"https://x/100/old.zip"}"#,
        )
        .unwrap();

        let sidecars = [sidecars_for(dir.path(), "101")];

        let committed = update_index(
            &git,
            dir.path(),
            "gh-pages",
            "cheetah",
            "101",
            &sidecars,
            false,
            false,
            5,
            Duration::ZERO,
        )
        .unwrap();

        assert!(committed);
        assert_eq!(git.count("commit"), 1);
        assert_eq!(git.count("push"), 1);

        let stored = fs::read_to_string(entry_dir.join("cheetah.json")).unwrap();
        assert!(stored.contains(r#""version":"101""#));
        assert!(fs::read(entry_dir.join("cheetah.csig")).unwrap() == b"csig");

        // Original checkout restored last.
        let calls = git.calls.borrow();
        assert_eq!(
            calls.last().unwrap(),
            &vec!["switch".to_owned(), "main".to_owned()],
        );
    }

    #[test]
    fn forced_rerun_with_identical_content_does_not_commit() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing ends up staged even though the tree may be dirty elsewhere.
        let git = MockGit {
            staged: "",
            ..Default::default()
        };

        let entry_dir = dir.path().join("rootless");
        fs::create_dir_all(&entry_dir).unwrap();
        fs::write(
            entry_dir.join("cheetah.json"),
            r#"{"version":"100","location":"https://x/100/a.zip"}"#,
        )
        .unwrap();

        let sidecars = [sidecars_for(dir.path(), "100")];

        let committed = update_index(
            &git,
            dir.path(),
            "gh-pages",
            "cheetah",
            "100",
            &sidecars,
            false,
            true,
            5,
            Duration::ZERO,
        )
        .unwrap();

        assert!(!committed);
        assert_eq!(git.count("commit"), 0);
        assert_eq!(git.count("push"), 0);
    }

    #[test]
    fn test_channel_uses_separate_paths() {
        let dir = tempfile::tempdir().unwrap();
        let git = MockGit::default();
        let sidecars = [sidecars_for(dir.path(), "100")];

        update_index(
            &git,
            dir.path(),
            "gh-pages",
            "cheetah",
            "100",
            &sidecars,
            true,
            false,
            5,
            Duration::ZERO,
        )
        .unwrap();

        assert!(dir.path().join("test/rootless/cheetah.json").exists());
    }

    #[test]
    fn csig_arguments() {
        let command = CsigCommand {
            custota_tool: Path::new("custota-tool"),
            input: Path::new("out.zip"),
            output: Path::new("out.zip.csig"),
            key: Path::new("/keys/ota.key"),
            cert: Path::new("/keys/ota.crt"),
            passphrase_env_var: Some("PASSPHRASE_OTA"),
        }
        .build();

        let args = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>();

        assert_eq!(
            args,
            [
                "gen-csig",
                "--input",
                "out.zip",
                "--output",
                "out.zip.csig",
                "--key",
                "/keys/ota.key",
                "--cert",
                "/keys/ota.crt",
                "--passphrase-env-var",
                "PASSPHRASE_OTA",
            ],
        );
    }
}
