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

//! Deployment versioning.  A snapshotter owns the lifecycle of root
//! filesystem snapshots on the state partition and the atomic swap of the
//! active deployment.

mod btrfs;
mod loopdevice;

pub use btrfs::BtrfsSnapshotter;
pub use loopdevice::LoopDeviceSnapshotter;

use anyhow::{anyhow, Context, Error, Result};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::{Config, Runner};
use crate::source::ImageSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub enum SnapshotterKind {
    LoopDevice,
    Btrfs,
}

impl FromStr for SnapshotterKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loop-device" => Ok(Self::LoopDevice),
            "btrfs" => Ok(Self::Btrfs),
            other => Err(anyhow!("invalid snapshotter type '{}'", other)),
        }
    }
}

impl fmt::Display for SnapshotterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoopDevice => write!(f, "loop-device"),
            Self::Btrfs => write!(f, "btrfs"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SnapshotterConfig {
    #[serde(rename = "type")]
    pub kind: SnapshotterKind,
    /// Passive snapshots beyond this count are pruned oldest-first.
    pub max_snaps: u32,
    /// Loop backend: filesystem of each deployment image.
    pub fs: String,
    /// Loop backend: size of each deployment image, in MiB.
    pub size: u64,
    /// Btrfs backend: delegate subvolume management to snapper.
    pub snapper: bool,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        SnapshotterConfig {
            kind: SnapshotterKind::LoopDevice,
            max_snaps: 4,
            fs: "ext4".to_string(),
            size: 3072,
            snapper: false,
        }
    }
}

/// One versioned deployment.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub id: u32,
    /// Read-only view once committed.
    pub path: PathBuf,
    /// Writable build area between start and close.
    pub work_dir: PathBuf,
    pub in_progress: bool,
    pub labels: BTreeMap<String, String>,
}

/// The transactional contract shared by all backends.
///
/// Snapshot ids are positive, strictly increasing and never reused.  At most
/// one snapshot is in progress per instance.  A successful close leaves
/// exactly one snapshot active on disk; a failed close leaves the previous
/// active and passive views untouched.
pub trait Snapshotter {
    fn init(&mut self, state_mount: &Path, efi_dir: &Path) -> Result<()>;
    fn start_transaction(&mut self) -> Result<Snapshot>;
    fn close_transaction(&mut self, snapshot: &mut Snapshot) -> Result<()>;
    fn close_transaction_on_error(&mut self, snapshot: &Snapshot) -> Result<()>;
    fn delete_snapshot(&mut self, id: u32) -> Result<()>;
    fn get_snapshots(&self) -> Result<Vec<u32>>;
    /// Consume a committed snapshot as an image source for a later action.
    fn snapshot_to_source(&self, snapshot: &Snapshot) -> ImageSource;
    fn kind(&self) -> SnapshotterKind;
    /// Currently active snapshot id, if any.
    fn active_id(&self) -> Option<u32>;
}

pub fn new_snapshotter<'a>(
    cfg: &'a Config,
    config: SnapshotterConfig,
) -> Box<dyn Snapshotter + 'a> {
    match config.kind {
        SnapshotterKind::LoopDevice => Box::new(LoopDeviceSnapshotter::new(cfg, config)),
        SnapshotterKind::Btrfs => Box::new(BtrfsSnapshotter::new(cfg, config)),
    }
}

/// Restore SELinux contexts under `root` using the policy shipped inside it.
/// A tree without a policy is left alone.
pub(crate) fn relabel_if_policy_present(runner: &dyn Runner, root: &Path) -> Result<()> {
    let contexts = root.join("etc/selinux/targeted/contexts/files/file_contexts");
    if !contexts.exists() {
        return Ok(());
    }
    let root_arg = root.to_string_lossy().to_string();
    let contexts_arg = contexts.to_string_lossy().to_string();
    runner
        .run(
            "setfiles",
            &["-i", "-F", "-r", &root_arg, &contexts_arg, &root_arg],
        )
        .context("restoring SELinux labels")?;
    Ok(())
}
