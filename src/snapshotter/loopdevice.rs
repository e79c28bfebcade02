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

//! Loop-device snapshotter.  Deployments are filesystem images on the state
//! partition: `cOS/active.img` and `cOS/passive.img`, with
//! `cOS/transition.img` as the in-flight build target.  Only two durable
//! deployments exist; larger retention settings degrade to two.
//!
//! The image files carry no snapshot numbering, so ids are persisted in a
//! small ledger next to them and only updated at commit time.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::{relabel_if_policy_present, Snapshot, Snapshotter, SnapshotterConfig, SnapshotterKind};
use crate::config::{Config, Mounter, Runner};
use crate::partitioner::{format_partition, ACTIVE_LABEL, PASSIVE_LABEL};
use crate::source::ImageSource;

const STATE_DIR: &str = "cOS";
const ACTIVE_IMG: &str = "active.img";
const PASSIVE_IMG: &str = "passive.img";
const TRANSITION_IMG: &str = "transition.img";
const WORK_DIR: &str = "transition";
const LEDGER_FILE: &str = "snapshots.yaml";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct Ledger {
    active: Option<u32>,
    passive: Option<u32>,
    next: u32,
}

struct Transaction {
    id: u32,
    loop_device: String,
    work_dir: PathBuf,
}

pub struct LoopDeviceSnapshotter<'a> {
    cfg: &'a Config,
    config: SnapshotterConfig,
    root: Option<PathBuf>,
    ledger: Ledger,
    transaction: Option<Transaction>,
}

impl<'a> LoopDeviceSnapshotter<'a> {
    pub fn new(cfg: &'a Config, config: SnapshotterConfig) -> Self {
        LoopDeviceSnapshotter {
            cfg,
            config,
            root: None,
            ledger: Ledger::default(),
            transaction: None,
        }
    }

    fn root(&self) -> Result<&Path> {
        self.root
            .as_deref()
            .context("snapshotter used before initialization")
    }

    fn load_ledger(root: &Path) -> Result<Ledger> {
        let path = root.join(LEDGER_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => {
                serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Legacy layout: images exist but were never numbered.
                let mut ledger = Ledger {
                    next: 1,
                    ..Default::default()
                };
                if root.join(ACTIVE_IMG).exists() {
                    ledger.active = Some(1);
                    ledger.next = 2;
                }
                Ok(ledger)
            }
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn save_ledger(&self) -> Result<()> {
        let root = self.root()?;
        let staged = root.join(format!("{}.tmp", LEDGER_FILE));
        let target = root.join(LEDGER_FILE);
        fs::write(
            &staged,
            serde_yaml::to_string(&self.ledger).context("serializing snapshot ledger")?,
        )
        .with_context(|| format!("writing {}", staged.display()))?;
        fs::rename(&staged, &target)
            .with_context(|| format!("renaming {}", target.display()))?;
        Ok(())
    }

    fn detach_loop(&self, device: &str) {
        if let Err(e) = self.cfg.runner.run("losetup", &["-d", device]) {
            log::warn!("detaching {}: {:#}", device, e);
        }
    }
}

impl Snapshotter for LoopDeviceSnapshotter<'_> {
    fn init(&mut self, state_mount: &Path, _efi_dir: &Path) -> Result<()> {
        if !self.config.fs.starts_with("ext") {
            bail!(
                "loop-device snapshotter requires an ext filesystem, not '{}'",
                self.config.fs
            );
        }
        let root = state_mount.join(STATE_DIR);
        fs::create_dir_all(&root)
            .with_context(|| format!("creating {}", root.display()))?;
        self.ledger = Self::load_ledger(&root)?;
        self.root = Some(root);
        Ok(())
    }

    fn start_transaction(&mut self) -> Result<Snapshot> {
        if self.transaction.is_some() {
            bail!("a snapshot transaction is already in progress");
        }
        let root = self.root()?.to_path_buf();
        let id = self.ledger.next.max(1);

        let transition = root.join(TRANSITION_IMG);
        let image = fs::File::create(&transition)
            .with_context(|| format!("creating {}", transition.display()))?;
        image
            .set_len(self.config.size * 1024 * 1024)
            .with_context(|| format!("allocating {}", transition.display()))?;
        drop(image);
        format_partition(
            self.cfg,
            &transition.to_string_lossy(),
            &self.config.fs,
            ACTIVE_LABEL,
        )
        .context("formatting transition image")?;

        let loop_device = self
            .cfg
            .runner
            .run("losetup", &["--show", "-f", &transition.to_string_lossy()])
            .context("attaching transition image")?
            .trim()
            .to_string();

        let work_dir = root.join(WORK_DIR);
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("creating {}", work_dir.display()))?;
        if let Err(e) =
            self.cfg
                .mounter
                .mount(&loop_device, &work_dir, &self.config.fs, &["rw"])
        {
            self.detach_loop(&loop_device);
            let _ = fs::remove_file(&transition);
            return Err(e).context("mounting transition image");
        }

        self.transaction = Some(Transaction {
            id,
            loop_device,
            work_dir: work_dir.clone(),
        });
        Ok(Snapshot {
            id,
            path: root.join(ACTIVE_IMG),
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

        relabel_if_policy_present(self.cfg.runner.as_ref(), &transaction.work_dir)?;
        self.cfg
            .mounter
            .unmount(&transaction.work_dir)
            .context("unmounting transition image")?;
        let _ = fs::remove_dir(&transaction.work_dir);
        self.detach_loop(&transaction.loop_device);

        let active = root.join(ACTIVE_IMG);
        let passive = root.join(PASSIVE_IMG);
        let transition = root.join(TRANSITION_IMG);
        let first_commit = !active.exists();
        if !first_commit {
            log::info!("Copying {} image...", PASSIVE_LABEL);
            fs::rename(&active, &passive)
                .with_context(|| format!("demoting {}", active.display()))?;
            self.cfg
                .runner
                .run(
                    "tune2fs",
                    &["-L", PASSIVE_LABEL, &passive.to_string_lossy()],
                )
                .context("relabeling passive image")?;
            self.ledger.passive = self.ledger.active;
        }
        log::info!("Copying {} image...", ACTIVE_LABEL);
        fs::rename(&transition, &active)
            .with_context(|| format!("activating {}", transition.display()))?;
        if first_commit {
            // fallback copy so the bootloader has a passive target from the
            // very first boot
            log::info!("Copying {} image...", PASSIVE_LABEL);
            fs::copy(&active, &passive)
                .with_context(|| format!("seeding {}", passive.display()))?;
            self.cfg
                .runner
                .run(
                    "tune2fs",
                    &["-L", PASSIVE_LABEL, &passive.to_string_lossy()],
                )
                .context("relabeling passive image")?;
        }

        self.ledger.active = Some(transaction.id);
        self.ledger.next = transaction.id + 1;
        self.save_ledger()?;
        snapshot.in_progress = false;
        Ok(())
    }

    fn close_transaction_on_error(&mut self, snapshot: &Snapshot) -> Result<()> {
        log::info!("Discarding failed snapshot {}", snapshot.id);
        if let Some(transaction) = self.transaction.take() {
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
            self.detach_loop(&transaction.loop_device);
        }
        let transition = self.root()?.join(TRANSITION_IMG);
        if transition.exists() {
            fs::remove_file(&transition)
                .with_context(|| format!("removing {}", transition.display()))?;
        }
        Ok(())
    }

    fn delete_snapshot(&mut self, id: u32) -> Result<()> {
        if Some(id) == self.ledger.active {
            bail!("refusing to delete the active snapshot {}", id);
        }
        if Some(id) == self.ledger.passive {
            let passive = self.root()?.join(PASSIVE_IMG);
            if passive.exists() {
                fs::remove_file(&passive)
                    .with_context(|| format!("removing {}", passive.display()))?;
            }
            self.ledger.passive = None;
            self.save_ledger()?;
        } else {
            log::warn!("snapshot {} not found, nothing to delete", id);
        }
        Ok(())
    }

    fn get_snapshots(&self) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = [self.ledger.passive, self.ledger.active]
            .into_iter()
            .flatten()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn snapshot_to_source(&self, snapshot: &Snapshot) -> ImageSource {
        ImageSource::File(snapshot.path.to_string_lossy().to_string())
    }

    fn kind(&self) -> SnapshotterKind {
        SnapshotterKind::LoopDevice
    }

    fn active_id(&self) -> Option<u32> {
        self.ledger.active
    }
}
