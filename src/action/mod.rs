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

//! The actions.  Each is a linear pipeline over the partitioner, the image
//! source resolver, the snapshotter and the bootloader adapter; errors abort
//! the pipeline and roll back any open snapshot transaction.

pub mod install;
pub mod mount;
pub mod reset;
pub mod upgrade;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::blockdev::filesystem_mountpoint;
use crate::config::{CloudInitRunner, Config, Mounter, RunConfig, Runner};
use crate::partitioner::SYSTEM_LABEL;
use crate::source::{ImageSource, UnpackOpts};
use crate::state::{now, SystemState};

/// Runtime directory where actions mount the labeled partitions.
pub const RUN_DIR: &str = "/run/elemental";

enum GuardAction {
    Unmount,
    RemountRo,
}

/// A partition mount scoped to one pipeline step.  Released on drop along
/// every exit path: either unmounted, or remounted read-only when the
/// filesystem was already mounted by the running system.  A loop device
/// attached for the mount is detached with it.
pub(crate) struct MountGuard<'a> {
    cfg: &'a Config,
    device: String,
    target: PathBuf,
    action: GuardAction,
    loop_device: Option<String>,
}

impl<'a> MountGuard<'a> {
    /// Mount `device` read-write, reusing (and remounting) an existing mount
    /// when there is one.
    pub(crate) fn mount_rw(
        cfg: &'a Config,
        device: &str,
        fstype: &str,
        target: &Path,
    ) -> Result<Self> {
        if let Some(existing) = filesystem_mountpoint(cfg.runner.as_ref(), device)? {
            let target = PathBuf::from(existing);
            cfg.mounter
                .mount(device, &target, "", &["remount", "rw"])
                .with_context(|| format!("remounting {} read-write", device))?;
            return Ok(MountGuard {
                cfg,
                device: device.to_string(),
                target,
                action: GuardAction::RemountRo,
                loop_device: None,
            });
        }
        fs::create_dir_all(target)
            .with_context(|| format!("creating {}", target.display()))?;
        cfg.mounter
            .mount(device, target, fstype, &["rw"])
            .with_context(|| format!("mounting {}", device))?;
        Ok(MountGuard {
            cfg,
            device: device.to_string(),
            target: target.to_path_buf(),
            action: GuardAction::Unmount,
            loop_device: None,
        })
    }

    /// Attach `image` to a loop device and mount it read-only; both are
    /// released on drop.
    pub(crate) fn mount_image(
        cfg: &'a Config,
        image: &Path,
        fstype: &str,
        target: &Path,
    ) -> Result<Self> {
        fs::create_dir_all(target)
            .with_context(|| format!("creating {}", target.display()))?;
        let loop_device = cfg
            .runner
            .run("losetup", &["--show", "-f", &image.to_string_lossy()])
            .with_context(|| format!("attaching {}", image.display()))?
            .trim()
            .to_string();
        if let Err(e) = cfg.mounter.mount(&loop_device, target, fstype, &["ro"]) {
            let _ = cfg.runner.run("losetup", &["-d", &loop_device]);
            return Err(e).with_context(|| format!("mounting {}", image.display()));
        }
        Ok(MountGuard {
            cfg,
            device: image.to_string_lossy().to_string(),
            target: target.to_path_buf(),
            action: GuardAction::Unmount,
            loop_device: Some(loop_device),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.target
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        let result = match self.action {
            GuardAction::Unmount => self.cfg.mounter.unmount(&self.target),
            GuardAction::RemountRo => {
                self.cfg
                    .mounter
                    .mount(&self.device, &self.target, "", &["remount", "ro"])
            }
        };
        if let Err(e) = result {
            log::warn!("releasing mount of {}: {:#}", self.device, e);
        }
        if let Some(loop_device) = &self.loop_device {
            if let Err(e) = self.cfg.runner.run("losetup", &["-d", loop_device]) {
                log::warn!("detaching {}: {:#}", loop_device, e);
            }
        }
    }
}

/// Run one cloud-init stage with the configured extra config paths, chrooted
/// into `root` when one is given.
pub(crate) fn run_hook(
    cfg: &Config,
    run: &RunConfig,
    stage: &str,
    root: Option<&Path>,
) -> Result<()> {
    let extra: Vec<&str> = run.cloud_init_paths.iter().map(String::as_str).collect();
    cfg.cloud_init
        .run_stage(cfg.runner.as_ref(), stage, root, &extra)
        .with_context(|| format!("running {} hook", stage))
}

/// Unpack options derived from the merged configuration; cosign
/// verification only applies when a public key is configured.
pub(crate) fn unpack_opts<'a>(
    cfg: &'a Config,
    run: &'a RunConfig,
    no_verify: bool,
) -> UnpackOpts<'a> {
    UnpackOpts {
        platform: &cfg.platform,
        local: false,
        verify: !no_verify && run.cosign_pub_key.is_some(),
        cosign_pub_key: run.cosign_pub_key.as_deref(),
        tls_verify: run.tls_verify,
        retries: run.fetch_retries,
        repositories: &run.repositories,
    }
}

/// Materialize the recovery image on the recovery partition: a squashfs when
/// the source is a tree, a labeled filesystem image when it already is one.
pub(crate) fn install_recovery(
    cfg: &Config,
    source: &ImageSource,
    recovery_mount: &Path,
) -> Result<SystemState> {
    log::info!("Installing recovery image");
    let dir = recovery_mount.join("cOS");
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut entry = SystemState {
        source: source.clone(),
        label: Some(SYSTEM_LABEL.to_string()),
        date: Some(now()),
        ..Default::default()
    };
    match source {
        ImageSource::File(path) => {
            let target = dir.join("recovery.img");
            fs::copy(path, &target)
                .with_context(|| format!("copying {} to {}", path, target.display()))?;
            cfg.runner
                .run("tune2fs", &["-L", SYSTEM_LABEL, &target.to_string_lossy()])
                .context("relabeling recovery image")?;
            entry.fs = Some("ext4".to_string());
        }
        ImageSource::Dir(path) => {
            let target = dir.join("recovery.squashfs");
            if target.exists() {
                fs::remove_file(&target)
                    .with_context(|| format!("removing {}", target.display()))?;
            }
            let path_arg = path.to_string_lossy().to_string();
            let target_arg = target.to_string_lossy().to_string();
            cfg.runner
                .run(
                    "mksquashfs",
                    &[&path_arg, &target_arg, "-b", "1024k", "-no-progress"],
                )
                .context("building recovery squashfs")?;
            entry.fs = Some("squashfs".to_string());
        }
        other => bail!("cannot build a recovery image from source '{}'", other),
    }
    Ok(entry)
}

/// Act on the finalization flags once an action succeeded.
pub(crate) fn finalize(cfg: &Config, reboot: bool, poweroff: bool, eject_cd: bool) -> Result<()> {
    if eject_cd {
        log::info!("Ejecting the live media");
        cfg.runner
            .run("eject", &["-rmv", "/dev/cdrom"])
            .context("ejecting the live media")?;
    }
    if reboot {
        log::info!("Rebooting the system");
        cfg.runner.run("shutdown", &["-r", "now"]).context("rebooting")?;
    } else if poweroff {
        log::info!("Powering off the system");
        cfg.runner
            .run("shutdown", &["-h", "now"])
            .context("powering off")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;

    #[test]
    fn test_mount_guard_fresh_mount() {
        let (cfg, _, mounter, _, _) = test_config();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state");
        {
            let guard = MountGuard::mount_rw(&cfg, "/dev/sda2", "ext4", &target).unwrap();
            assert_eq!(guard.path(), target.as_path());
            assert!(mounter.is_mounted(&target).unwrap());
        }
        assert!(!mounter.is_mounted(&target).unwrap());
    }

    #[test]
    fn test_mount_guard_remounts_existing() {
        let (cfg, runner, mounter, _, _) = test_config();
        runner.on_output(
            "lsblk",
            "NAME=\"/dev/sda2\" TYPE=\"part\" MOUNTPOINT=\"/run/initramfs/cos-state\"\n",
        );
        {
            let guard =
                MountGuard::mount_rw(&cfg, "/dev/sda2", "ext4", Path::new("/unused")).unwrap();
            assert_eq!(guard.path(), Path::new("/run/initramfs/cos-state"));
            let mounts = mounter.mounts();
            assert!(mounts[0].3.contains(&"remount".to_string()));
            assert!(mounts[0].3.contains(&"rw".to_string()));
        }
        let mounts = mounter.mounts();
        assert!(mounts[1].3.contains(&"ro".to_string()));
    }

    #[test]
    fn test_finalize_flags() {
        let (cfg, runner, _, _, _) = test_config();
        finalize(&cfg, false, false, false).unwrap();
        assert!(runner.invocations().is_empty());

        finalize(&cfg, true, false, true).unwrap();
        assert!(runner.ran("eject -rmv /dev/cdrom"));
        assert!(runner.ran("shutdown -r now"));
    }
}
