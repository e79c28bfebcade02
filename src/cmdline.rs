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

use anyhow::{anyhow, Error, Result};
use clap::{AppSettings, Parser};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;

use crate::source::ImageSource;

// Args are listed in --help in the order declared in these structs/enums.
// Please keep the entire help text to 80 columns.

#[derive(Debug, Parser)]
#[clap(version)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(help_expected = true)]
pub struct Cli {
    /// Additional config file
    ///
    /// Merged over /etc/elemental/config.yaml and /oem/*.yaml.
    #[clap(long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,
    /// Enable debug output
    #[clap(long, global = true)]
    pub debug: bool,
    #[clap(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Parser)]
pub enum Cmd {
    /// Install the system to a target device
    Install(InstallConfig),
    /// Upgrade the active system deployment
    Upgrade(UpgradeConfig),
    /// Reset the system to the installation defaults
    Reset(ResetConfig),
    /// Compose the writable system at boot time
    Mount(MountConfig),
}

#[derive(Debug, Default, Parser)]
#[clap(args_override_self = true)]
pub struct InstallConfig {
    /// Container image to install
    #[clap(long, value_name = "REF")]
    #[clap(conflicts_with = "system-uri")]
    pub docker_image: Option<String>,
    /// System image source URI
    ///
    /// Accepts oci:<ref>, dir:<path>, file:<path> and channel:<package>
    /// sources.
    #[clap(long = "system.uri", value_name = "URI")]
    pub system_uri: Option<ImageSource>,
    /// Partition layout file
    ///
    /// YAML description of the desired partition table; overrides the
    /// built-in layout.
    #[clap(long, value_name = "path")]
    pub partition_layout: Option<PathBuf>,
    /// Force a GPT partition table
    #[clap(long)]
    #[clap(conflicts_with = "force-efi")]
    pub force_gpt: bool,
    /// Force an EFI installation
    #[clap(long)]
    pub force_efi: bool,
    /// Cloud-init config files staged into the OEM partition
    #[clap(long, value_name = "path")]
    pub cloud_init: Vec<String>,
    /// Skip image signature verification
    #[clap(long)]
    pub no_verify: bool,
    /// Do not install the bootloader or its boot entries
    #[clap(long)]
    pub disable_boot_entry: bool,
    /// Reboot when the installation finishes
    #[clap(long)]
    #[clap(conflicts_with = "poweroff", conflicts_with = "eject-cd")]
    pub reboot: bool,
    /// Power off when the installation finishes
    #[clap(long)]
    #[clap(conflicts_with = "eject-cd")]
    pub poweroff: bool,
    /// Eject the live media when the installation finishes
    #[clap(long)]
    pub eject_cd: bool,
    /// Destination device
    #[clap(value_name = "DEVICE")]
    pub device: Option<String>,
}

#[derive(Debug, Default, Parser)]
#[clap(args_override_self = true)]
pub struct UpgradeConfig {
    /// Upgrade only the recovery image
    #[clap(long)]
    pub recovery: bool,
    /// System image source URI
    #[clap(long = "system.uri", value_name = "URI")]
    pub system_uri: Option<ImageSource>,
    /// Refresh the bootloader artifacts on the ESP
    #[clap(long)]
    pub bootloader: bool,
    /// Skip image signature verification
    #[clap(long)]
    pub no_verify: bool,
    /// Proceed even if the previous upgrade was assessed as failed
    #[clap(long)]
    pub force: bool,
    /// Reboot when the upgrade finishes
    #[clap(long)]
    #[clap(conflicts_with = "poweroff")]
    pub reboot: bool,
    /// Power off when the upgrade finishes
    #[clap(long)]
    pub poweroff: bool,
}

#[derive(Debug, Default, Parser)]
#[clap(args_override_self = true)]
pub struct ResetConfig {
    /// Format the persistent partition as well
    #[clap(long)]
    pub reset_persistent: bool,
    /// Format the OEM partition as well
    #[clap(long)]
    pub reset_oem: bool,
    /// System image source URI
    ///
    /// Defaults to the recovery image of the running system.
    #[clap(long = "system.uri", value_name = "URI")]
    pub system_uri: Option<ImageSource>,
    /// Reboot when the reset finishes
    #[clap(long)]
    #[clap(conflicts_with = "poweroff")]
    pub reboot: bool,
    /// Power off when the reset finishes
    #[clap(long)]
    pub poweroff: bool,
}

#[derive(Debug, Parser)]
#[clap(args_override_self = true)]
pub struct MountConfig {
    /// Image to boot from (active, passive or recovery)
    #[clap(long, value_name = "mode", default_value_t)]
    pub mode: MountMode,
    /// Path the composed system is assembled at
    #[clap(long, value_name = "path", default_value = "/sysroot")]
    pub sysroot: PathBuf,
    /// Generate /etc/fstab for the composed mounts
    #[clap(long)]
    pub write_fstab: bool,
    /// Restore SELinux contexts on the composed paths
    #[clap(long)]
    pub selinux_relabel: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mode: MountMode::default(),
            sysroot: PathBuf::from("/sysroot"),
            write_fstab: false,
            selinux_relabel: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub enum MountMode {
    Active,
    Passive,
    Recovery,
}

impl Default for MountMode {
    fn default() -> Self {
        MountMode::Active
    }
}

impl FromStr for MountMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "passive" => Ok(Self::Passive),
            "recovery" => Ok(Self::Recovery),
            other => Err(anyhow!("invalid mount mode '{}'", other)),
        }
    }
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Passive => write!(f, "passive"),
            Self::Recovery => write!(f, "recovery"),
        }
    }
}

#[derive(Debug, SerializeDisplay, Clone, Copy, PartialEq, Eq)]
pub enum FetchRetries {
    Infinite,
    Finite(NonZeroU32),
    None,
}

// Config files may spell this as a bare integer or as "infinite", so the
// derived from-string deserializer is not enough.
impl<'de> serde::Deserialize<'de> for FetchRetries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;
        impl serde::de::Visitor<'_> for Visitor {
            type Value = FetchRetries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a retry count or \"infinite\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
                let v = u32::try_from(v).map_err(E::custom)?;
                Ok(NonZeroU32::new(v)
                    .map(FetchRetries::Finite)
                    .unwrap_or(FetchRetries::None))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
                self.visit_u64(u64::try_from(v).map_err(E::custom)?)
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }
        deserializer.deserialize_any(Visitor)
    }
}

impl FromStr for FetchRetries {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "infinite" => Ok(Self::Infinite),
            num => num
                .parse::<u32>()
                .map(|num| NonZeroU32::new(num).map(Self::Finite).unwrap_or(Self::None))
                .map_err(|e| anyhow!(e)),
        }
    }
}

impl fmt::Display for FetchRetries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "0"),
            Self::Finite(n) => write!(f, "{}", n),
            Self::Infinite => write!(f, "infinite"),
        }
    }
}

impl Default for FetchRetries {
    /// Transient fetch errors are retried a bounded number of times.
    fn default() -> Self {
        Self::Finite(NonZeroU32::new(3).unwrap())
    }
}

impl InstallConfig {
    /// The effective image source; --docker-image is shorthand for an OCI
    /// URI.
    pub fn source(&self) -> Option<ImageSource> {
        if let Some(image) = &self.docker_image {
            Some(ImageSource::Oci(image.clone()))
        } else {
            self.system_uri.clone()
        }
    }
}
