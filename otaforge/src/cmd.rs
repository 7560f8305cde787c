// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    process::{Command, ExitStatus, Stdio},
};

use thiserror::Error;
use tracing::debug;

use crate::util::DebugString;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to run command: {0:?}")]
    Spawn(DebugString, #[source] io::Error),
    #[error("Command failed with status: {1}: {0:?}")]
    Execution(DebugString, ExitStatus),
    #[error("Command produced non-UTF-8 output: {0:?}")]
    InvalidOutput(DebugString),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Run a command to completion with inherited stdio. A non-zero exit status is
/// an error.
pub fn run(command: &mut Command) -> Result<()> {
    let rendered = DebugString::new(command);

    debug!("Running command: {rendered}");

    let status = command
        .status()
        .map_err(|e| Error::Spawn(rendered.clone(), e))?;

    if !status.success() {
        return Err(Error::Execution(rendered, status));
    }

    Ok(())
}

/// Run a command and capture its stdout as a string with trailing line
/// terminators removed. stderr is inherited.
pub fn output(command: &mut Command) -> Result<String> {
    let rendered = DebugString::new(command);

    debug!("Running command: {rendered}");

    let output = command
        .stderr(Stdio::inherit())
        .output()
        .map_err(|e| Error::Spawn(rendered.clone(), e))?;

    if !output.status.success() {
        return Err(Error::Execution(rendered, output.status));
    }

    let stdout =
        String::from_utf8(output.stdout).map_err(|_| Error::InvalidOutput(rendered))?;

    Ok(stdout.trim_end_matches(['\r', '\n']).to_owned())
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use assert_matches::assert_matches;

    use super::{output, run, Error};

    #[test]
    fn run_reports_exit_status() {
        assert_matches!(run(&mut Command::new("false")), Err(Error::Execution(_, _)));
        run(&mut Command::new("true")).unwrap();
    }

    #[test]
    fn output_trims_newline() {
        let out = output(Command::new("echo").arg("hello")).unwrap();
        assert_eq!(out, "hello");
    }
}
