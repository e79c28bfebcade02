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

//! Composes the writable system over the read-only rootfs at boot time:
//! an ephemeral overlay for volatile paths, bind or overlay mounts from the
//! persistent partition for durable ones.

use anyhow::{anyhow, bail, Context, Error, Result};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::blockdev::find_device_by_label;
use crate::bootmode::write_mode_sentinels;
use crate::cmdline::{MountConfig, MountMode};
use crate::config::{Config, Mounter, RunConfig, Runner};
use crate::partitioner::{OEM_LABEL, PERSISTENT_LABEL};
use crate::snapshotter::relabel_if_policy_present;
use crate::util::sort_paths_by_depth;

#[derive(Clone, Copy, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub enum PersistentMode {
    Bind,
    Overlay,
}

impl FromStr for PersistentMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bind" => Ok(Self::Bind),
            "overlay" => Ok(Self::Overlay),
            other => Err(anyhow!("invalid persistent mode '{}'", other)),
        }
    }
}

impl fmt::Display for PersistentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind => write!(f, "bind"),
            Self::Overlay => write!(f, "overlay"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub enum EphemeralKind {
    Tmpfs,
    Block,
}

impl FromStr for EphemeralKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tmpfs" => Ok(Self::Tmpfs),
            "block" => Ok(Self::Block),
            other => Err(anyhow!("invalid ephemeral storage type '{}'", other)),
        }
    }
}

impl fmt::Display for EphemeralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tmpfs => write!(f, "tmpfs"),
            Self::Block => write!(f, "block"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PersistentSpec {
    pub mode: PersistentMode,
    pub paths: Vec<String>,
    /// Filesystem label of the partition backing persistent storage.
    pub volume: String,
}

impl Default for PersistentSpec {
    fn default() -> Self {
        PersistentSpec {
            mode: PersistentMode::Bind,
            paths: [
                "/etc/systemd",
                "/etc/ssh",
                "/home",
                "/opt",
                "/root",
                "/var/log",
            ]
            .map(String::from)
            .to_vec(),
            volume: PERSISTENT_LABEL.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EphemeralSpec {
    #[serde(rename = "type")]
    pub kind: EphemeralKind,
    /// Block device backing the overlay when the type is `block`.
    pub device: String,
    /// tmpfs size, as accepted by the tmpfs mount option.
    pub size: String,
    pub paths: Vec<String>,
}

impl Default for EphemeralSpec {
    fn default() -> Self {
        EphemeralSpec {
            kind: EphemeralKind::Tmpfs,
            device: String::new(),
            size: "25%".to_string(),
            paths: ["/etc", "/srv", "/var"].map(String::from).to_vec(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VolumeSpec {
    pub label: String,
    pub mountpoint: String,
}

/// How the writable system is composed at boot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MountSpec {
    pub persistent: PersistentSpec,
    pub ephemeral: EphemeralSpec,
    pub volumes: Vec<VolumeSpec>,
}

impl Default for MountSpec {
    fn default() -> Self {
        MountSpec {
            persistent: PersistentSpec::default(),
            ephemeral: EphemeralSpec::default(),
            volumes: vec![VolumeSpec {
                label: OEM_LABEL.to_string(),
                mountpoint: "/oem".to_string(),
            }],
        }
    }
}

pub fn mount(cfg: &Config, run: &RunConfig, action: &MountConfig) -> Result<()> {
    mount_system(cfg, &run.mount, action, Path::new("/"))
}

fn escape_path(path: &str) -> String {
    path.trim_matches('/').replace('/', "-")
}

fn sysroot_path(sysroot: &Path, path: &str) -> PathBuf {
    sysroot.join(path.trim_start_matches('/'))
}

/// Mount an overlay for `path` with its upper and work directories under
/// `upper_root`, recording the fstab line.
fn overlay_path(
    cfg: &Config,
    sysroot: &Path,
    upper_root: &Path,
    path: &str,
    fstab: &mut Vec<String>,
) -> Result<()> {
    let target = sysroot_path(sysroot, path);
    let base = upper_root.join(escape_path(path));
    let upper = base.join("upper");
    let work = base.join("work");
    for dir in [&upper, &work, &target] {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        target.display(),
        upper.display(),
        work.display()
    );
    cfg.mounter
        .mount("overlay", &target, "overlay", &["defaults", &options])
        .with_context(|| format!("mounting overlay for {}", path))?;
    fstab.push(format!("overlay {} overlay defaults,{} 0 0", path, options));
    Ok(())
}

pub(crate) fn mount_system(
    cfg: &Config,
    spec: &MountSpec,
    action: &MountConfig,
    runtime_root: &Path,
) -> Result<()> {
    let sysroot = action.sysroot.as_path();
    if !sysroot.exists() {
        bail!("sysroot {} does not exist", sysroot.display());
    }
    let mut fstab: Vec<String> = Vec::new();

    // ephemeral layer
    let overlay_dir = runtime_root.join("run/elemental/overlay");
    fs::create_dir_all(&overlay_dir)
        .with_context(|| format!("creating {}", overlay_dir.display()))?;
    match spec.ephemeral.kind {
        EphemeralKind::Tmpfs => {
            let size = format!("size={}", spec.ephemeral.size);
            cfg.mounter
                .mount("tmpfs", &overlay_dir, "tmpfs", &["defaults", &size])
                .context("mounting ephemeral tmpfs")?;
            fstab.push(format!(
                "tmpfs /run/elemental/overlay tmpfs defaults,{} 0 0",
                size
            ));
        }
        EphemeralKind::Block => {
            if spec.ephemeral.device.is_empty() {
                bail!("ephemeral storage type is block but no device is set");
            }
            cfg.runner
                .run("mkfs.ext2", &["-F", &spec.ephemeral.device])
                .context("formatting ephemeral device")?;
            cfg.mounter
                .mount(&spec.ephemeral.device, &overlay_dir, "ext2", &["rw"])
                .context("mounting ephemeral device")?;
            fstab.push(format!(
                "{} /run/elemental/overlay ext2 defaults 0 0",
                spec.ephemeral.device
            ));
        }
    }
    for path in &spec.ephemeral.paths {
        overlay_path(cfg, sysroot, &overlay_dir, path, &mut fstab)?;
    }

    // persistent layer; recovery never touches persistent storage
    if action.mode != MountMode::Recovery {
        let device = find_device_by_label(cfg.runner.as_ref(), &spec.persistent.volume)
            .context("locating persistent partition")?;
        let persistent_dir = runtime_root.join("run/elemental/persistent");
        fs::create_dir_all(&persistent_dir)
            .with_context(|| format!("creating {}", persistent_dir.display()))?;
        let fstype = device.fstype.as_deref().unwrap_or("ext4").to_string();
        cfg.mounter
            .mount(&device.path, &persistent_dir, &fstype, &["rw"])
            .context("mounting persistent partition")?;
        fstab.push(format!(
            "LABEL={} /run/elemental/persistent {} defaults 0 0",
            spec.persistent.volume, fstype
        ));

        let state_root = persistent_dir.join(".state");
        for path in sort_paths_by_depth(&spec.persistent.paths) {
            match spec.persistent.mode {
                PersistentMode::Bind => {
                    let source = state_root.join(format!("{}.bind", escape_path(&path)));
                    let target = sysroot_path(sysroot, &path);
                    for dir in [&source, &target] {
                        fs::create_dir_all(dir)
                            .with_context(|| format!("creating {}", dir.display()))?;
                    }
                    let source_arg = source.to_string_lossy().to_string();
                    cfg.mounter
                        .mount(&source_arg, &target, "", &["bind"])
                        .with_context(|| format!("binding persistent path {}", path))?;
                    fstab.push(format!("{} {} none defaults,bind 0 0", source_arg, path));
                }
                PersistentMode::Overlay => {
                    overlay_path(cfg, sysroot, &state_root, &path, &mut fstab)?;
                }
            }
        }
    }

    // extra volumes
    for volume in &spec.volumes {
        let device = find_device_by_label(cfg.runner.as_ref(), &volume.label)
            .with_context(|| format!("locating volume {}", volume.label))?;
        let target = sysroot_path(sysroot, &volume.mountpoint);
        fs::create_dir_all(&target)
            .with_context(|| format!("creating {}", target.display()))?;
        let fstype = device.fstype.as_deref().unwrap_or("auto").to_string();
        cfg.mounter
            .mount(&device.path, &target, &fstype, &["rw"])
            .with_context(|| format!("mounting volume {}", volume.label))?;
        fstab.push(format!(
            "LABEL={} {} {} defaults 0 0",
            volume.label, volume.mountpoint, fstype
        ));
    }

    write_mode_sentinels(runtime_root, action.mode)?;

    if action.write_fstab {
        let etc = sysroot.join("etc");
        fs::create_dir_all(&etc).with_context(|| format!("creating {}", etc.display()))?;
        let body = fstab.join("\n") + "\n";
        fs::write(etc.join("fstab"), body).context("writing /etc/fstab")?;
    }

    if action.selinux_relabel {
        relabel_if_policy_present(cfg.runner.as_ref(), sysroot)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootmode::{boot_mode, BootMode};
    use crate::testing::test_config;

    const LSBLK_OUTPUT: &str = r#"NAME="/dev/sda5" LABEL="COS_PERSISTENT" FSTYPE="ext2" TYPE="part"
NAME="/dev/sda3" LABEL="COS_OEM" FSTYPE="ext4" TYPE="part"
"#;

    fn test_action(sysroot: &Path) -> MountConfig {
        MountConfig {
            sysroot: sysroot.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_active_mount_composition() {
        let (cfg, runner, mounter, _, _) = test_config();
        runner.on_output("lsblk", LSBLK_OUTPUT);
        let root = tempfile::tempdir().unwrap();
        let sysroot = root.path().join("sysroot");
        fs::create_dir_all(&sysroot).unwrap();
        let mut action = test_action(&sysroot);
        action.write_fstab = true;

        mount_system(&cfg, &MountSpec::default(), &action, root.path()).unwrap();

        let mounts = mounter.mounts();
        // tmpfs overlay first
        assert_eq!(mounts[0].0, "tmpfs");
        assert!(mounts[0].3.contains(&"size=25%".to_string()));
        // persistent partition mounted rw
        assert!(mounts
            .iter()
            .any(|(source, _, fstype, _)| source == "/dev/sda5" && fstype == "ext2"));
        // oem volume mounted under the sysroot
        assert!(mounts
            .iter()
            .any(|(source, target, _, _)| source == "/dev/sda3"
                && target == &sysroot.join("oem")));
        // sentinels for the default active mode
        assert_eq!(boot_mode(root.path()), BootMode::Active);
        // fstab generated
        let fstab = fs::read_to_string(sysroot.join("etc/fstab")).unwrap();
        assert!(fstab.contains("tmpfs /run/elemental/overlay tmpfs defaults,size=25%"));
        assert!(fstab.contains("LABEL=COS_PERSISTENT"));
    }

    #[test]
    fn test_persistent_paths_mounted_parent_first() {
        let (cfg, runner, mounter, _, _) = test_config();
        runner.on_output("lsblk", LSBLK_OUTPUT);
        let root = tempfile::tempdir().unwrap();
        let sysroot = root.path().join("sysroot");
        fs::create_dir_all(&sysroot).unwrap();
        let mut spec = MountSpec::default();
        spec.ephemeral.paths.clear();
        spec.volumes.clear();
        spec.persistent.paths = vec![
            "/var/lib/rancher".to_string(),
            "/var".to_string(),
            "/etc/ssh".to_string(),
        ];

        mount_system(&cfg, &spec, &test_action(&sysroot), root.path()).unwrap();

        let persistent_targets: Vec<PathBuf> = mounter
            .mounts()
            .into_iter()
            .filter(|(_, _, _, opts)| opts.contains(&"bind".to_string()))
            .map(|(_, target, _, _)| target)
            .collect();
        assert_eq!(
            persistent_targets,
            vec![
                sysroot.join("var"),
                sysroot.join("etc/ssh"),
                sysroot.join("var/lib/rancher"),
            ]
        );
    }

    #[test]
    fn test_recovery_skips_persistent() {
        let (cfg, runner, mounter, _, _) = test_config();
        runner.on_output("lsblk", LSBLK_OUTPUT);
        let root = tempfile::tempdir().unwrap();
        let sysroot = root.path().join("sysroot");
        fs::create_dir_all(&sysroot).unwrap();
        let mut action = test_action(&sysroot);
        action.mode = MountMode::Recovery;
        let mut spec = MountSpec::default();
        spec.volumes.clear();

        mount_system(&cfg, &spec, &action, root.path()).unwrap();

        assert!(!mounter
            .mounts()
            .iter()
            .any(|(source, _, _, _)| source == "/dev/sda5"));
        assert_eq!(boot_mode(root.path()), BootMode::Recovery);
    }

    #[test]
    fn test_overlay_persistent_mode() {
        let (cfg, runner, mounter, _, _) = test_config();
        runner.on_output("lsblk", LSBLK_OUTPUT);
        let root = tempfile::tempdir().unwrap();
        let sysroot = root.path().join("sysroot");
        fs::create_dir_all(&sysroot).unwrap();
        let mut spec = MountSpec::default();
        spec.ephemeral.paths.clear();
        spec.volumes.clear();
        spec.persistent.mode = PersistentMode::Overlay;
        spec.persistent.paths = vec!["/home".to_string()];

        mount_system(&cfg, &spec, &test_action(&sysroot), root.path()).unwrap();

        let overlays: Vec<_> = mounter
            .mounts()
            .into_iter()
            .filter(|(source, _, _, _)| source == "overlay")
            .collect();
        assert_eq!(overlays.len(), 1);
        assert_eq!(overlays[0].1, sysroot.join("home"));
        assert!(overlays[0]
            .3
            .iter()
            .any(|o| o.contains("upperdir") && o.contains(".state/home/upper")));
    }

    #[test]
    fn test_block_ephemeral_requires_device() {
        let (cfg, _, _, _, _) = test_config();
        let root = tempfile::tempdir().unwrap();
        let sysroot = root.path().join("sysroot");
        fs::create_dir_all(&sysroot).unwrap();
        let mut spec = MountSpec::default();
        spec.ephemeral.kind = EphemeralKind::Block;
        assert!(mount_system(&cfg, &spec, &test_action(&sysroot), root.path()).is_err());
    }

    #[test]
    fn test_spec_parses_from_yaml() {
        let raw = r#"
persistent:
  mode: overlay
  paths: ["/home", "/opt"]
ephemeral:
  type: tmpfs
  size: 30%
volumes:
  - label: COS_OEM
    mountpoint: /oem
"#;
        let spec: MountSpec = serde_yaml::from_str(raw).unwrap();
        assert_eq!(spec.persistent.mode, PersistentMode::Overlay);
        assert_eq!(spec.ephemeral.size, "30%");
        assert_eq!(spec.volumes.len(), 1);
    }
}
