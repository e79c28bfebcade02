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

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use super::{finalize, install_recovery, run_hook, unpack_opts, MountGuard, RUN_DIR};
use crate::blockdev::ensure_exclusive_access;
use crate::bootloader::{enable_boot_assessment, install_grub, set_boot_entries};
use crate::cmdline::InstallConfig;
use crate::config::{Config, RunConfig};
use crate::partitioner::{
    partition, DiskSpec, ElementalPartitions, Firmware, PartTable, ACTIVE_LABEL,
};
use crate::snapshotter::SnapshotterKind;
use crate::source::unpack_source;
use crate::state::{now, write_install_state, InstallState, PartitionState, SystemState};

pub fn install(cfg: &Config, run: &RunConfig, action: &InstallConfig) -> Result<()> {
    install_at(cfg, run, action, Path::new(RUN_DIR))
}

pub(crate) fn install_at(
    cfg: &Config,
    run: &RunConfig,
    action: &InstallConfig,
    run_dir: &Path,
) -> Result<()> {
    // validate the request before any side effect
    let source = action
        .source()
        .context("an image source must be specified")?;
    if source.is_empty() {
        bail!("the image source is empty");
    }
    let (mut layout, mut spec) = match &action.partition_layout {
        Some(path) => {
            let spec = DiskSpec::load_layout(path)?;
            (ElementalPartitions::from_list(spec.partitions.clone()), spec)
        }
        None => (ElementalPartitions::defaults(), DiskSpec::default()),
    };
    if let Some(device) = &action.device {
        spec.device = device.clone();
    }
    if spec.device.is_empty() {
        bail!("a destination device must be specified");
    }

    let firmware = if action.force_efi {
        Firmware::Efi
    } else {
        cfg.firmware
    };
    if firmware == Firmware::Efi && cfg.firmware == Firmware::Bios {
        log::warn!(
            "Forcing an EFI installation on a BIOS host; the resulting system will not boot here"
        );
    }
    let table = if action.force_gpt || firmware == Firmware::Efi {
        PartTable::Gpt
    } else {
        spec.part_table
    };
    layout
        .set_firmware_partitions(firmware, table)
        .context("install: resolving firmware partitions")?;
    spec.firmware = firmware;
    spec.part_table = table;

    // the btrfs snapshotter owns the whole state partition and needs it
    // formatted accordingly
    if run.snapshotter.kind == SnapshotterKind::Btrfs {
        if let Some(state) = layout.state.as_mut() {
            state.fs = "btrfs".to_string();
        }
    }

    ensure_exclusive_access(cfg.runner.as_ref(), &spec.device)
        .context("install: checking target device")?;

    let parts = partition(cfg, &layout, &spec).context("install: partitioning")?;

    log::info!("Mounting disk partitions");
    let state_part = parts.state.as_ref().context("no state partition")?;
    let state_device = state_part.path.as_deref().context("no state device")?;
    let state_guard = MountGuard::mount_rw(
        cfg,
        state_device,
        &state_part.fs,
        &run_dir.join("state"),
    )
    .context("install: mounting state partition")?;
    let recovery_part = parts.recovery.as_ref().context("no recovery partition")?;
    let recovery_guard = MountGuard::mount_rw(
        cfg,
        recovery_part.path.as_deref().context("no recovery device")?,
        &recovery_part.fs,
        &run_dir.join("recovery"),
    )
    .context("install: mounting recovery partition")?;
    let oem_guard = match parts.oem.as_ref() {
        Some(oem) => Some(
            MountGuard::mount_rw(
                cfg,
                oem.path.as_deref().context("no oem device")?,
                &oem.fs,
                &run_dir.join("oem"),
            )
            .context("install: mounting oem partition")?,
        ),
        None => None,
    };
    let _persistent_guard = match parts.persistent.as_ref() {
        Some(persistent) => Some(
            MountGuard::mount_rw(
                cfg,
                persistent.path.as_deref().context("no persistent device")?,
                &persistent.fs,
                &run_dir.join("persistent"),
            )
            .context("install: mounting persistent partition")?,
        ),
        None => None,
    };
    let boot_guard = match parts.boot.as_ref() {
        Some(boot) => Some(
            MountGuard::mount_rw(
                cfg,
                boot.path.as_deref().context("no boot device")?,
                &boot.fs,
                &run_dir.join("efi"),
            )
            .context("install: mounting boot partition")?,
        ),
        None => None,
    };

    // site customization snippets land on the OEM partition before any hook
    // can rely on them
    if let Some(oem_guard) = oem_guard.as_ref() {
        stage_cloud_init_configs(&action.cloud_init, oem_guard.path())?;
    }

    run_hook(cfg, run, "before-install", None)?;

    let mut snapshotter = crate::snapshotter::new_snapshotter(cfg, run.snapshotter.clone());
    let efi_dir = boot_guard
        .as_ref()
        .map(|g| g.path().to_path_buf())
        .unwrap_or_else(|| state_guard.path().join("grub2"));
    snapshotter
        .init(state_guard.path(), &efi_dir)
        .context("install: initializing snapshotter")?;
    let mut snapshot = snapshotter
        .start_transaction()
        .context("install: starting transaction")?;

    log::info!("Copying {} image...", ACTIVE_LABEL);
    let digest = match unpack_source(
        cfg,
        &source,
        &snapshot.work_dir,
        &unpack_opts(cfg, run, action.no_verify),
    )
    .context("install: extracting image")
    .and_then(|digest| {
        run_hook(cfg, run, "after-install-chroot", Some(&snapshot.work_dir))?;
        Ok(digest)
    }) {
        Ok(digest) => digest,
        Err(e) => {
            let _ = snapshotter.close_transaction_on_error(&snapshot);
            return Err(e);
        }
    };
    if let Err(e) = snapshotter.close_transaction(&mut snapshot) {
        let _ = snapshotter.close_transaction_on_error(&snapshot);
        return Err(e).context("install: committing snapshot");
    }

    let recovery_source = snapshotter.snapshot_to_source(&snapshot);
    let recovery_entry = install_recovery(cfg, &recovery_source, recovery_guard.path())
        .context("install: installing recovery image")?;

    let mut state_partition_state = PartitionState {
        fs_label: state_part.label.clone(),
        recovery_image: None,
        snapshots: None,
    };
    state_partition_state.commit_snapshot(
        snapshot.id,
        SystemState {
            source: source.clone(),
            digest,
            label: Some(ACTIVE_LABEL.to_string()),
            fs: Some(run.snapshotter.fs.clone()),
            date: Some(now()),
            from_action: Some("install".to_string()),
            ..Default::default()
        },
    );
    let install_state = InstallState {
        date: now(),
        snapshotter: snapshotter.kind().to_string(),
        state: Some(state_partition_state),
        recovery: Some(PartitionState {
            fs_label: recovery_part.label.clone(),
            recovery_image: Some(recovery_entry),
            snapshots: None,
        }),
        oem: parts.oem.as_ref().map(|p| PartitionState {
            fs_label: p.label.clone(),
            ..Default::default()
        }),
        persistent: parts.persistent.as_ref().map(|p| PartitionState {
            fs_label: p.label.clone(),
            ..Default::default()
        }),
    };
    write_install_state(
        &install_state,
        &[state_guard.path(), recovery_guard.path()],
    )
    .context("install: writing state file")?;

    if !action.disable_boot_entry {
        install_grub(
            cfg,
            firmware,
            &spec.device,
            state_guard.path(),
            boot_guard.as_ref().map(|g| g.path()),
        )
        .context("install: bootloader")?;
        fs::create_dir_all(&efi_dir)
            .with_context(|| format!("creating {}", efi_dir.display()))?;
        set_boot_entries(cfg, &efi_dir, "Elemental", &[], snapshotter.kind())
            .context("install: bootloader")?;
        if run.boot_assessment {
            enable_boot_assessment(state_guard.path()).context("install: bootloader")?;
        }
    }

    run_hook(cfg, run, "after-install", None)?;

    log::info!("Unmounting disk partitions");
    drop(boot_guard);
    drop(_persistent_guard);
    drop(oem_guard);
    drop(recovery_guard);
    drop(state_guard);

    log::info!("Install complete.");
    finalize(cfg, action.reboot, action.poweroff, action.eject_cd)
}

/// Copy cloud-init config files into the OEM partition as numbered custom
/// snippets.
fn stage_cloud_init_configs(configs: &[String], oem_dir: &Path) -> Result<()> {
    for (index, config) in configs.iter().enumerate() {
        let target = oem_dir.join(format!("{}_custom.yaml", 90 + index));
        fs::copy(config, &target)
            .with_context(|| format!("copying {} to {}", config, target.display()))?;
    }
    Ok(())
}
