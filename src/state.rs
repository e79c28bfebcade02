// Copyright 2022 Elemental contributors
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

//! The persisted installation state, written to both the state and recovery
//! partitions after every successful action.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::source::ImageSource;

pub const STATE_FILE: &str = "state.yaml";
const STATE_FILE_HEADER: &str = "# Autogenerated file by elemental client, do not edit";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct InstallState {
    pub date: String,
    pub snapshotter: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PartitionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<PartitionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oem: Option<PartitionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent: Option<PartitionState>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PartitionState {
    #[serde(rename = "label")]
    pub fs_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_image: Option<SystemState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<BTreeMap<u32, SystemState>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SystemState {
    pub source: ImageSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_action: Option<String>,
}

impl InstallState {
    /// Id and state of the single active snapshot on the state partition.
    pub fn active_snapshot(&self) -> Option<(u32, &SystemState)> {
        self.state
            .as_ref()?
            .snapshots
            .as_ref()?
            .iter()
            .find(|(_, s)| s.active)
            .map(|(id, s)| (*id, s))
    }

    /// Passive snapshot ids, newest first.
    pub fn passive_snapshots(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .state
            .as_ref()
            .and_then(|p| p.snapshots.as_ref())
            .map(|snaps| {
                snaps
                    .iter()
                    .filter(|(_, s)| !s.active)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids
    }
}

impl PartitionState {
    /// Record `entry` under `id` and make it the only active snapshot.
    pub fn commit_snapshot(&mut self, id: u32, mut entry: SystemState) {
        entry.active = true;
        let snapshots = self.snapshots.get_or_insert_with(BTreeMap::new);
        for snap in snapshots.values_mut() {
            snap.active = false;
        }
        snapshots.insert(id, entry);
    }

    /// Drop entries for snapshots that no longer exist on disk.
    pub fn retain_snapshots(&mut self, existing: &[u32]) {
        if let Some(snapshots) = self.snapshots.as_mut() {
            snapshots.retain(|id, _| existing.contains(id));
        }
    }
}

/// Current time in the state file format.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Write the state file under every given directory.  The write is staged
/// and renamed so a crash never leaves a half-written state file.
pub fn write_install_state(state: &InstallState, dirs: &[&Path]) -> Result<()> {
    let body = format!(
        "{}\n{}",
        STATE_FILE_HEADER,
        serde_yaml::to_string(state).context("serializing state file")?
    );
    for dir in dirs {
        let target = dir.join(STATE_FILE);
        let staged = dir.join(format!("{}.tmp", STATE_FILE));
        fs::write(&staged, &body)
            .with_context(|| format!("writing {}", staged.display()))?;
        fs::rename(&staged, &target)
            .with_context(|| format!("renaming {}", target.display()))?;
    }
    Ok(())
}

/// Read the state file from a directory.  A missing file is tolerated so
/// systems installed before state tracking keep working.
pub fn load_install_state(dir: &Path) -> Result<Option<InstallState>> {
    let path = dir.join(STATE_FILE);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let state = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(state))
}
