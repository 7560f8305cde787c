// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! otaforge is primarily an application and not a library. The semver
//! versioning covers the CLI and the environment variable contract only; all
//! Rust APIs can change at any time, even in patch releases.

pub mod cli;
pub mod cmd;
pub mod config;
pub mod crypto;
pub mod download;
pub mod git;
pub mod index;
pub mod patch;
pub mod pipeline;
pub mod plan;
pub mod release;
pub mod resolve;
pub mod util;
