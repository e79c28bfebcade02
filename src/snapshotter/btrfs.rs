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

//! Btrfs snapshotter.  The state partition carries a top-level `@`
//! subvolume with snapshots at `@/.snapshots/<id>/snapshot`.  Subvolume
//! management is performed either directly with the btrfs tool or through
//! snapper; the outer snapshotter is oblivious to the difference.

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

use super::{relabel_if_policy_present, Snapshot, Snapshotter, SnapshotterConfig, SnapshotterKind};
use crate::config::{Config, Mounter, Runner};
use crate::source::ImageSource;

const TOP_SUBVOL: &str = "@";
const SNAPSHOTS_DIR: &str = ".snapshots";

/// Subvolume management operations, dispatched to btrfs or snapper.  Paths
/// passed in are always relative to the top-level `@` subvolume.
trait SubvolumeBackend {
    /// Create snapshot `suggested`, as a writable copy of `base` when given.
    /// Returns the id actually allocated.
    fn create_snapshot(
        &self,
        runner: &dyn Runner,
        top: &Path,
        base: Option<u32>,
        suggested: u32,
    ) -> Result<u32>;
    fn delete_snapshot(&self, runner: &dyn Runner, top: &Path, id: u32) -> Result<()>;
    fn set_default(&self, runner: &dyn Runner, top: &Path, id: u32) -> Result<()>;
    fn cleanup(&self, runner: &dyn Runner, top: &Path, max_snaps: u32, keep: &[u32])
        -> Result<()>;
}

fn snapshot_path(top: &Path, id: u32) -> PathBuf {
    top.join(SNAPSHOTS_DIR).join(id.to_string()).join("snapshot")
}

fn list_snapshot_ids(top: &Path) -> Result<Vec<u32>> {
    let dir = top.join(SNAPSHOTS_DIR);
    let mut ids = Vec::new();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("reading {} entry", dir.display()))?;
        if let Ok(id) = entry.file_name().to_string_lossy().parse::<u32>() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Direct subvolume management with the btrfs tool, including the
/// snapper-compatible metadata file so externally-run snapper agrees with
/// our snapshot list.
#[derive(Debug, Default)]
struct NativeBackend;

impl NativeBackend {
    fn write_info_xml(dir: &Path, id: u32) -> Result<()> {
        let date = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        let body = format!(
            "<?xml version=\"1.0\"?>\n<snapshot>\n  <type>single</type>\n  <num>{}</num>\n  <date>{}</date>\n  <description>elemental managed snapshot</description>\n  <cleanup>number</cleanup>\n</snapshot>\n",
            id, date
        );
        let path = dir.join("info.xml");
        fs::write(&path, body).with_context(|| format!("writing {}", path.display()))
    }
}

impl SubvolumeBackend for NativeBackend {
    fn create_snapshot(
        &self,
        runner: &dyn Runner,
        top: &Path,
        base: Option<u32>,
        suggested: u32,
    ) -> Result<u32> {
        let dir = top.join(SNAPSHOTS_DIR).join(suggested.to_string());
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let target = snapshot_path(top, suggested);
        let target_arg = target.to_string_lossy().to_string();
        match base {
            Some(base) => {
                let source_arg = snapshot_path(top, base).to_string_lossy().to_string();
                runner
                    .run("btrfs", &["subvolume", "snapshot", &source_arg, &target_arg])
                    .with_context(|| format!("snapshotting {} from {}", suggested, base))?;
            }
            None => {
                runner
                    .run("btrfs", &["subvolume", "create", &target_arg])
                    .with_context(|| format!("creating snapshot {}", suggested))?;
            }
        }
        Self::write_info_xml(&dir, suggested)?;
        Ok(suggested)
    }

    fn delete_snapshot(&self, runner: &dyn Runner, top: &Path, id: u32) -> Result<()> {
        let target = snapshot_path(top, id).to_string_lossy().to_string();
        runner
            .run("btrfs", &["subvolume", "delete", &target])
            .with_context(|| format!("deleting snapshot {}", id))?;
        let dir = top.join(SNAPSHOTS_DIR).join(id.to_string());
        fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
        Ok(())
    }

    fn set_default(&self, runner: &dyn Runner, top: &Path, id: u32) -> Result<()> {
        let target = snapshot_path(top, id).to_string_lossy().to_string();
        runner
            .run("btrfs", &["subvolume", "set-default", &target])
            .with_context(|| format!("setting snapshot {} as default", id))?;
        Ok(())
    }

    fn cleanup(
        &self,
        runner: &dyn Runner,
        top: &Path,
        max_snaps: u32,
        keep: &[u32],
    ) -> Result<()> {
        let ids = list_snapshot_ids(top)?;
        let mut total = ids.len();
        for id in ids {
            if total <= max_snaps as usize {
                break;
            }
            if keep.contains(&id) {
                continue;
            }
            log::info!("Pruning snapshot {}", id);
            self.delete_snapshot(runner, top, id)?;
            total -= 1;
        }
        Ok(())
    }
}

/// Subvolume management delegated to the external snapper tool, using the
/// templated configuration shipped at /etc/snapper/config-templates/default.
#[derive(Debug, Default)]
struct SnapperBackend;

impl SnapperBackend {
    fn snapper(runner: &dyn Runner, top: &Path, args: &[&str]) -> Result<String> {
        let root_arg = top.to_string_lossy().to_string();
        let mut full = vec!["--no-dbus", "--root", root_arg.as_str()];
        full.extend_from_slice(args);
        runner.run("snapper", &full)
    }
}

impl SubvolumeBackend for SnapperBackend {
    fn create_snapshot(
        &self,
        runner: &dyn Runner,
        top: &Path,
        base: Option<u32>,
        suggested: u32,
    ) -> Result<u32> {
        match base {
            Some(base) => {
                let base_arg = base.to_string();
                let output = Self::snapper(
                    runner,
                    top,
                    &[
                        "create",
                        "--from",
                        &base_arg,
                        "--read-write",
                        "--print-number",
                        "--description",
                        "elemental managed snapshot",
                        "--cleanup-algorithm",
                        "number",
                    ],
                )
                .context("creating snapper snapshot")?;
                output
                    .trim()
                    .parse()
                    .with_context(|| format!("parsing snapper snapshot number '{}'", output.trim()))
            }
            None => {
                // Snapper cannot snapshot a root that does not exist yet, so
                // the first snapshot is created directly and its config right
                // after it.
                Self::snapper(
                    runner,
                    top,
                    &["create-config", "--template", "default", "/"],
                )
                .context("creating snapper config")?;
                NativeBackend.create_snapshot(runner, top, None, suggested)
            }
        }
    }

    fn delete_snapshot(&self, runner: &dyn Runner, top: &Path, id: u32) -> Result<()> {
        let id_arg = id.to_string();
        Self::snapper(runner, top, &["delete", &id_arg])
            .with_context(|| format!("deleting snapshot {}", id))?;
        let dir = top.join(SNAPSHOTS_DIR).join(id.to_string());
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
        }
        Ok(())
    }

    fn set_default(&self, runner: &dyn Runner, top: &Path, id: u32) -> Result<()> {
        let id_arg = id.to_string();
        Self::snapper(runner, top, &["modify", "--default", &id_arg])
            .with_context(|| format!("setting snapshot {} as default", id))?;
        Ok(())
    }

    fn cleanup(
        &self,
        runner: &dyn Runner,
        top: &Path,
        max_snaps: u32,
        _keep: &[u32],
    ) -> Result<()> {
        let limit = format!("NUMBER_LIMIT={}", max_snaps);
        Self::snapper(runner, top, &["set-config", &limit])
            .context("configuring snapper retention")?;
        Self::snapper(runner, top, &["cleanup", "number"]).context("running snapper cleanup")?;
        Ok(())
    }
}

struct Transaction {
    id: u32,
    work_dir: PathBuf,
}

pub struct BtrfsSnapshotter<'a> {
    cfg: &'a Config,
    config: SnapshotterConfig,
    backend: Box<dyn SubvolumeBackend>,
    /// Filesystem root view (subvolid 5), containing the `@` subvolume.
    root: Option<PathBuf>,
    active: Option<u32>,
    transaction: Option<Transaction>,
}

impl<'a> BtrfsSnapshotter<'a> {
    pub fn new(cfg: &'a Config, config: SnapshotterConfig) -> Self {
        let backend: Box<dyn SubvolumeBackend> = if config.snapper {
            Box::new(SnapperBackend)
        } else {
            Box::new(NativeBackend)
        };
        BtrfsSnapshotter {
            cfg,
            config,
            backend,
            root: None,
            active: None,
            transaction: None,
        }
    }

    fn root(&self) -> Result<&Path> {
        self.root
            .as_deref()
            .context("snapshotter used before initialization")
    }

    fn top(&self) -> Result<PathBuf> {
        Ok(self.root()?.join(TOP_SUBVOL))
    }

    fn probe_active(&self, root: &Path) -> Result<Option<u32>> {
        lazy_static! {
            static ref DEFAULT_RE: Regex =
                Regex::new(r"@/\.snapshots/(\d+)/snapshot").unwrap();
        }
        let root_arg = root.to_string_lossy().to_string();
        let output = self
            .cfg
            .runner
            .run("btrfs", &["subvolume", "get-default", &root_arg])
            .context("reading default subvolume")?;
        Ok(DEFAULT_RE
            .captures(&output)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok()))
    }
}

impl Snapshotter for BtrfsSnapshotter<'_> {
    /// Probes the state partition.  When the partition is mounted inside the
    /// active snapshot, as it is on a running system, it is remounted at the
    /// top-level subvolume since management requires the full layout.
    fn init(&mut self, state_mount: &Path, _efi_dir: &Path) -> Result<()> {
        let mount_arg = state_mount.to_string_lossy().to_string();
        let options = self
            .cfg
            .runner
            .run("findmnt", &["-no", "OPTIONS", &mount_arg])
            .context("reading state partition mount options")?;
        if options.contains("subvol=/@/.snapshots") {
            let device = self
                .cfg
                .runner
                .run("findmnt", &["-no", "SOURCE", &mount_arg])
                .context("reading state partition device")?
                .trim()
                .to_string();
            log::debug!("Remounting {} at the top level subvolume", device);
            self.cfg.mounter.unmount(state_mount)?;
            self.cfg
                .mounter
                .mount(&device, state_mount, "btrfs", &["rw", "subvolid=5"])?;
        }
        let root = state_mount.to_path_buf();

        let top = root.join(TOP_SUBVOL);
        if !top.join(SNAPSHOTS_DIR).exists() {
            log::info!("Setting up btrfs layout on the state partition");
            let top_arg = top.to_string_lossy().to_string();
            self.cfg
                .runner
                .run("btrfs", &["subvolume", "create", &top_arg])
                .context("creating top level subvolume")?;
            self.cfg
                .runner
                .run("btrfs", &["subvolume", "set-default", &top_arg])
                .context("setting top level subvolume as default")?;
            let snapshots_arg = top.join(SNAPSHOTS_DIR).to_string_lossy().to_string();
            self.cfg
                .runner
                .run("btrfs", &["subvolume", "create", &snapshots_arg])
                .context("creating snapshots subvolume")?;
            // the command above creates this on a real filesystem; recreate
            // in case the subvolume is materialized lazily
            fs::create_dir_all(top.join(SNAPSHOTS_DIR))
                .with_context(|| format!("creating {}", top.display()))?;
            self.active = None;
        } else {
            self.active = self.probe_active(&root)?;
        }
        self.root = Some(root);
        Ok(())
    }

    fn start_transaction(&mut self) -> Result<Snapshot> {
        if self.transaction.is_some() {
            bail!("a snapshot transaction is already in progress");
        }
        let top = self.top()?;
        let next = list_snapshot_ids(&top)?.last().copied().unwrap_or(0) + 1;
        let id =
            self.backend
                .create_snapshot(self.cfg.runner.as_ref(), &top, self.active, next)?;

        let path = snapshot_path(&top, id);
        let work_dir = top.join(SNAPSHOTS_DIR).join(id.to_string()).join("work");
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("creating {}", work_dir.display()))?;
        let path_arg = path.to_string_lossy().to_string();
        if let Err(e) = self
            .cfg
            .mounter
            .mount(&path_arg, &work_dir, "", &["bind", "rw"])
        {
            let _ = self
                .backend
                .delete_snapshot(self.cfg.runner.as_ref(), &top, id);
            return Err(e).context("mounting snapshot work area");
        }

        self.transaction = Some(Transaction {
            id,
            work_dir: work_dir.clone(),
        });
        Ok(Snapshot {
            id,
            path,
            work_dir,
            in_progress: true,
            labels: Default::default(),
        })
    }

    fn close_transaction(&mut self, snapshot: &mut Snapshot) -> Result<()> {
        let transaction = self
            .transaction
            .take()
            .context("no snapshot transaction in progress")?;
        if transaction.id != snapshot.id {
            bail!(
                "closing snapshot {} but snapshot {} is in progress",
                snapshot.id,
                transaction.id
            );
        }
        let root = self.root()?.to_path_buf();
        let top = self.top()?;

        // nested mountpoint for the snapshots subvolume inside the running
        // system
        fs::create_dir_all(transaction.work_dir.join(SNAPSHOTS_DIR))
            .with_context(|| format!("creating {}", transaction.work_dir.display()))?;

        let contexts = transaction
            .work_dir
            .join("etc/selinux/targeted/contexts/files/file_contexts");
        if contexts.exists() {
            // relabel with the real snapshots subvolume visible, the way the
            // running system sees it
            let snapshots_arg = top.join(SNAPSHOTS_DIR).to_string_lossy().to_string();
            let nested = transaction.work_dir.join(SNAPSHOTS_DIR);
            self.cfg
                .mounter
                .mount(&snapshots_arg, &nested, "", &["bind"])?;
            let result = relabel_if_policy_present(self.cfg.runner.as_ref(), &transaction.work_dir);
            self.cfg.mounter.unmount(&nested)?;
            result?;
        }

        self.cfg
            .mounter
            .unmount(&transaction.work_dir)
            .context("unmounting snapshot work area")?;
        let _ = fs::remove_dir(&transaction.work_dir);

        let path_arg = snapshot.path.to_string_lossy().to_string();
        self.cfg
            .runner
            .run("btrfs", &["property", "set", &path_arg, "ro", "true"])
            .context("sealing snapshot read-only")?;
        self.backend
            .set_default(self.cfg.runner.as_ref(), &top, transaction.id)?;
        let root_arg = root.to_string_lossy().to_string();
        self.cfg
            .runner
            .run("btrfs", &["filesystem", "sync", &root_arg])
            .context("syncing state partition")?;

        let previous = self.active;
        self.active = Some(transaction.id);
        snapshot.in_progress = false;

        let mut keep = vec![transaction.id];
        keep.extend(previous);
        self.backend
            .cleanup(self.cfg.runner.as_ref(), &top, self.config.max_snaps, &keep)?;
        Ok(())
    }

    fn close_transaction_on_error(&mut self, snapshot: &Snapshot) -> Result<()> {
        let transaction = match self.transaction.take() {
            Some(t) => t,
            None => return Ok(()),
        };
        log::info!("Discarding failed snapshot {}", snapshot.id);
        if self
            .cfg
            .mounter
            .is_mounted(&transaction.work_dir)
            .unwrap_or(false)
        {
            if let Err(e) = self.cfg.mounter.unmount(&transaction.work_dir) {
                log::warn!("unmounting {}: {:#}", transaction.work_dir.display(), e);
            }
        }
        let _ = fs::remove_dir(&transaction.work_dir);
        let top = self.top()?;
        self.backend
            .delete_snapshot(self.cfg.runner.as_ref(), &top, transaction.id)?;
        Ok(())
    }

    fn delete_snapshot(&mut self, id: u32) -> Result<()> {
        if Some(id) == self.active {
            bail!("refusing to delete the active snapshot {}", id);
        }
        let top = self.top()?;
        self.backend
            .delete_snapshot(self.cfg.runner.as_ref(), &top, id)
    }

    fn get_snapshots(&self) -> Result<Vec<u32>> {
        list_snapshot_ids(&self.top()?)
    }

    fn snapshot_to_source(&self, snapshot: &Snapshot) -> ImageSource {
        ImageSource::Dir(snapshot.path.clone())
    }

    fn kind(&self) -> SnapshotterKind {
        SnapshotterKind::Btrfs
    }

    fn active_id(&self) -> Option<u32> {
        self.active
    }
}
