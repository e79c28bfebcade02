// Copyright 2023 Elemental contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Boot sentinels exchanged with the initramfs stage.  The initramfs writes
//! the mode sentinels on a normal boot; the mount action writes them when it
//! composes the system itself.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::cmdline::MountMode;

const SENTINEL_DIRS: [&str; 2] = ["run/cos", "run/elemental"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootMode {
    Active,
    Passive,
    Recovery,
    LiveCd,
    Unknown,
}

fn sentinel_exists(root: &Path, name: &str) -> bool {
    SENTINEL_DIRS
        .iter()
        .any(|dir| root.join(dir).join(name).exists())
}

/// What the current system booted from.
pub fn boot_mode(root: &Path) -> BootMode {
    if sentinel_exists(root, "recovery_mode") {
        BootMode::Recovery
    } else if sentinel_exists(root, "passive_mode") {
        BootMode::Passive
    } else if sentinel_exists(root, "active_mode") {
        BootMode::Active
    } else if sentinel_exists(root, "live_mode") {
        BootMode::LiveCd
    } else {
        BootMode::Unknown
    }
}

/// Whether boot assessment flagged the last upgrade as failed.
pub fn upgrade_failure(root: &Path) -> bool {
    sentinel_exists(root, "upgrade_failure")
}

/// Emit the mode sentinels for the given mount mode.
pub fn write_mode_sentinels(root: &Path, mode: MountMode) -> Result<()> {
    let name = format!("{}_mode", mode);
    for dir in SENTINEL_DIRS {
        let dir = root.join(dir);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(&name);
        fs::write(&path, b"")
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}
