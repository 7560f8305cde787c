// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, process::Command};

/// A small wrapper to render a [`Command`] in error messages without losing
/// non-UTF-8 arguments entirely.
#[derive(Clone)]
pub struct DebugString(String);

impl DebugString {
    pub fn new(command: &Command) -> Self {
        let mut s = command.get_program().to_string_lossy().into_owned();

        for arg in command.get_args() {
            s.push(' ');
            s.push_str(&arg.to_string_lossy());
        }

        Self(s)
    }
}

impl fmt::Debug for DebugString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for DebugString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for DebugString {
    fn from(s: String) -> Self {
        Self(s)
    }
}
