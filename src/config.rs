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

//! Cross-cutting dependencies for every action.  The `Config` aggregate is
//! passed explicitly to all subsystems; tests replace each trait object with
//! a scripted fake.

use anyhow::{Context, Result};
use nix::mount::{self, MsFlags};
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread::sleep;
use std::time::Duration;

use crate::cmdline::FetchRetries;
use crate::partitioner::Firmware;
use crate::snapshotter::SnapshotterConfig;
use crate::source::ImageExtractor;
use crate::util::cmd_output;

/// System-wide configuration file, lowest merge precedence.
pub const SYSTEM_CONFIG: &str = "/etc/elemental/config.yaml";
/// Site customization snippets, merged over the system configuration.
pub const OEM_CONFIG_DIR: &str = "/oem";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Platform {
    /// `uname -m` style architecture
    pub arch: String,
    /// architecture name as used in image manifests (amd64, arm64, ...)
    pub image_arch: String,
    pub variant: String,
}

impl Platform {
    pub fn new(arch: &str, variant: &str) -> Self {
        let image_arch = match arch {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Platform {
            arch: arch.to_string(),
            image_arch: image_arch.to_string(),
            variant: variant.to_string(),
        }
    }

    pub fn host() -> Self {
        Self::new(std::env::consts::ARCH, "")
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "linux/{}", self.image_arch)
    }
}

/// Executes external commands.  All subprocess invocations in the library go
/// through this seam so tests can script them.
pub trait Runner {
    /// Run the command to completion, returning captured stdout.  Non-zero
    /// exit is an error carrying the command line and its stderr.
    fn run(&self, cmd: &str, args: &[&str]) -> Result<String>;
}

/// Real `Runner` spawning through std::process.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl Runner for ProcessRunner {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<String> {
        log::debug!("Running: {} {}", cmd, args.join(" "));
        let mut command = Command::new(cmd);
        command.args(args);
        cmd_output(&mut command)
    }
}

/// Mounts and unmounts filesystems.
pub trait Mounter {
    /// Mount `source` on `target`.  Options are fstab-style strings; flag
    /// options (`ro`, `bind`, `remount`, ...) become mount flags, the rest is
    /// passed as filesystem data.
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[&str]) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Whether something is mounted at the given path.
    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let mounts = read_to_string("/proc/self/mounts").context("reading mount table")?;
        let target = target.to_string_lossy();
        Ok(mounts
            .lines()
            .filter_map(|l| l.split_whitespace().nth(1))
            .any(|mp| mp == target))
    }
}

/// Real `Mounter` over the mount(2)/umount(2) syscalls.
#[derive(Debug, Default)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[&str]) -> Result<()> {
        let mut flags = MsFlags::empty();
        let mut data: Vec<&str> = Vec::new();
        for opt in options {
            match *opt {
                "ro" => flags.insert(MsFlags::MS_RDONLY),
                "rw" | "defaults" => (),
                "bind" => flags.insert(MsFlags::MS_BIND),
                "rbind" => flags.insert(MsFlags::MS_BIND | MsFlags::MS_REC),
                "remount" => flags.insert(MsFlags::MS_REMOUNT),
                "noexec" => flags.insert(MsFlags::MS_NOEXEC),
                "nosuid" => flags.insert(MsFlags::MS_NOSUID),
                "nodev" => flags.insert(MsFlags::MS_NODEV),
                other => data.push(other),
            }
        }
        let data = data.join(",");
        log::debug!(
            "Mounting {} on {} ({}, flags {:?}, data '{}')",
            source,
            target.display(),
            fstype,
            flags,
            data
        );
        mount::mount::<str, Path, str, str>(
            Some(source),
            target,
            if fstype.is_empty() { None } else { Some(fstype) },
            flags,
            if data.is_empty() { None } else { Some(&data) },
        )
        .with_context(|| format!("mounting device {} on {}", source, target.display()))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        // Unmount sometimes fails immediately after closing the last open
        // file on the filesystem.  Retry several times before giving up.
        let mut result = Ok(());
        for retries in (0..20).rev() {
            result = mount::umount(target)
                .with_context(|| format!("unmounting {}", target.display()));
            if result.is_ok() || retries == 0 {
                break;
            }
            sleep(Duration::from_millis(100));
        }
        result
    }
}

/// Executes cloud-init stages at the hook points of each action.  Stages
/// with a root run chrooted into it, so `*-chroot` hooks see the new
/// deployment as their filesystem.
pub trait CloudInitRunner {
    fn run_stage(
        &self,
        runner: &dyn Runner,
        stage: &str,
        root: Option<&Path>,
        extra_configs: &[&str],
    ) -> Result<()>;
}

/// Real cloud-init runner delegating to the yip-based `cos-setup` binary.
#[derive(Debug, Default)]
pub struct YipRunner;

impl CloudInitRunner for YipRunner {
    fn run_stage(
        &self,
        runner: &dyn Runner,
        stage: &str,
        root: Option<&Path>,
        extra_configs: &[&str],
    ) -> Result<()> {
        log::info!("Running {} hook", stage);
        let result = match root {
            Some(root) => {
                let root_arg = root.to_string_lossy().to_string();
                let mut args = vec![root_arg.as_str(), "cos-setup", stage];
                args.extend_from_slice(extra_configs);
                runner.run("chroot", &args)
            }
            None => {
                let mut args = vec![stage];
                args.extend_from_slice(extra_configs);
                runner.run("cos-setup", &args)
            }
        };
        result.with_context(|| format!("running cloud-init stage {}", stage))?;
        Ok(())
    }
}

/// Aggregate of all injectable collaborators.  Owned by the caller of each
/// action and passed down explicitly; never global.
pub struct Config {
    pub runner: Box<dyn Runner>,
    pub mounter: Box<dyn Mounter>,
    pub extractor: Box<dyn ImageExtractor>,
    pub cloud_init: Box<dyn CloudInitRunner>,
    pub platform: Platform,
    /// Firmware the host booted with.
    pub firmware: Firmware,
}

impl Config {
    /// Configuration wired to the host: real subprocesses, real mounts.
    pub fn new_host() -> Self {
        Config {
            runner: Box::new(ProcessRunner),
            mounter: Box::new(SysMounter),
            extractor: Box::new(crate::source::SkopeoExtractor),
            cloud_init: Box::new(YipRunner),
            platform: Platform::host(),
            firmware: Firmware::detect(),
        }
    }
}

/// Settings read from the merged YAML configuration files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RunConfig {
    pub snapshotter: SnapshotterConfig,
    pub fetch_retries: FetchRetries,
    pub cosign_pub_key: Option<String>,
    pub tls_verify: bool,
    /// Install the GRUB boot-assessment hooks and arm them on upgrades.
    pub boot_assessment: bool,
    /// luet repositories consulted by channel sources
    pub repositories: Vec<String>,
    /// extra directories or files handed to every cloud-init stage
    pub cloud_init_paths: Vec<String>,
    /// Runtime mount composition, consumed by the mount action.
    pub mount: crate::action::mount::MountSpec,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            snapshotter: SnapshotterConfig::default(),
            fetch_retries: FetchRetries::default(),
            cosign_pub_key: None,
            tls_verify: true,
            boot_assessment: true,
            repositories: Vec::new(),
            cloud_init_paths: Vec::new(),
            mount: crate::action::mount::MountSpec::default(),
        }
    }
}

impl RunConfig {
    /// Load and merge configuration from the well-known locations plus an
    /// optional explicit file: `/etc/elemental/config.yaml`, `/oem/*.yaml`
    /// in name order, then the `--config` file.  Later files win key by key.
    /// Missing files are skipped.  `ELEMENTAL_*` variables override last.
    pub fn load(explicit: Option<&Path>) -> Result<RunConfig> {
        let mut paths: Vec<PathBuf> = vec![PathBuf::from(SYSTEM_CONFIG)];
        if let Ok(entries) = std::fs::read_dir(OEM_CONFIG_DIR) {
            let mut oem: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "yaml").unwrap_or(false))
                .collect();
            oem.sort();
            paths.extend(oem);
        }
        if let Some(p) = explicit {
            paths.push(p.to_path_buf());
        }
        let mut config = Self::load_from(&paths)?;
        config.apply_env_overrides(std::env::vars());
        Ok(config)
    }

    pub fn load_from(paths: &[PathBuf]) -> Result<RunConfig> {
        let mut merged = serde_yaml::to_value(RunConfig::default())
            .context("serializing default configuration")?;
        for path in paths {
            let raw = match read_to_string(path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("reading {}", path.display()))
                }
            };
            let value: serde_yaml::Value = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_values(&mut merged, value);
        }
        serde_yaml::from_value(merged).context("deserializing merged configuration")
    }

    /// `ELEMENTAL_*` variables override matching configuration keys.
    pub fn apply_env_overrides(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (key, val) in vars {
            match key.as_str() {
                "ELEMENTAL_FETCH_RETRIES" => {
                    if let Ok(v) = val.parse() {
                        self.fetch_retries = v;
                    }
                }
                "ELEMENTAL_COSIGN_PUB_KEY" => self.cosign_pub_key = Some(val),
                "ELEMENTAL_TLS_VERIFY" => {
                    if let Ok(v) = val.parse() {
                        self.tls_verify = v;
                    }
                }
                "ELEMENTAL_SNAPSHOTTER_TYPE" => {
                    if let Ok(v) = val.parse() {
                        self.snapshotter.kind = v;
                    }
                }
                "ELEMENTAL_SNAPSHOTTER_MAX_SNAPS" => {
                    if let Ok(v) = val.parse() {
                        self.snapshotter.max_snaps = v;
                    }
                }
                _ => (),
            }
        }
    }
}

/// Recursively merge `other` into `base`.  Mappings merge key by key, any
/// other value replaces the base wholesale.
fn merge_values(base: &mut serde_yaml::Value, other: serde_yaml::Value) {
    match (base, other) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(other_map)) => {
            for (key, value) in other_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, other) => *base = other,
    }
}
