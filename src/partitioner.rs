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

//! Partition planning and creation.  Labels below are filesystem labels;
//! partition names (`p.state`, ...) are stable lookup keys independent of
//! the label.

use anyhow::{anyhow, bail, Context, Error, Result};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::blockdev::{device_size_mib, partition_device, settle_udev};
use crate::config::{Config, Runner};
use crate::source::ImageSource;

pub const EFI_LABEL: &str = "COS_GRUB";
pub const OEM_LABEL: &str = "COS_OEM";
pub const STATE_LABEL: &str = "COS_STATE";
pub const RECOVERY_LABEL: &str = "COS_RECOVERY";
pub const PERSISTENT_LABEL: &str = "COS_PERSISTENT";
pub const ACTIVE_LABEL: &str = "COS_ACTIVE";
pub const PASSIVE_LABEL: &str = "COS_PASSIVE";
pub const SYSTEM_LABEL: &str = "COS_SYSTEM";

pub const BIOS_PART_NAME: &str = "p.bios";
pub const EFI_PART_NAME: &str = "p.grub";
pub const OEM_PART_NAME: &str = "p.oem";
pub const STATE_PART_NAME: &str = "p.state";
pub const RECOVERY_PART_NAME: &str = "p.recovery";
pub const PERSISTENT_PART_NAME: &str = "p.persistent";

/// Partitions smaller than this are still accounted at this size when
/// checking whether a disk can fit a layout.
pub const MIN_PART_MIB: u64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub enum Firmware {
    Efi,
    Bios,
}

impl FromStr for Firmware {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "efi" => Ok(Self::Efi),
            "bios" => Ok(Self::Bios),
            other => Err(anyhow!("invalid firmware '{}'", other)),
        }
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Efi => write!(f, "efi"),
            Self::Bios => write!(f, "bios"),
        }
    }
}

impl Firmware {
    /// Firmware the running host booted with, from the presence of the EFI
    /// variable tree.
    pub fn detect() -> Self {
        if PathBuf::from("/sys/firmware/efi").exists() {
            Self::Efi
        } else {
            Self::Bios
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub enum PartTable {
    Gpt,
    Msdos,
}

impl FromStr for PartTable {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpt" => Ok(Self::Gpt),
            "msdos" => Ok(Self::Msdos),
            other => Err(anyhow!("invalid partition table '{}'", other)),
        }
    }
}

impl fmt::Display for PartTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpt => write!(f, "gpt"),
            Self::Msdos => write!(f, "msdos"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Partition {
    pub name: String,
    /// Filesystem label, not the GPT partition name.
    pub label: String,
    /// Size in MiB; 0 grows to fill the disk.
    pub size: u64,
    /// Filesystem kind; empty means unformatted (BIOS boot partition).
    pub fs: String,
    pub flags: Vec<String>,
    pub mountpoint: Option<PathBuf>,
    /// Device node, set once the partition exists on disk.
    #[serde(skip)]
    pub path: Option<String>,
    /// Parent disk device, set once the partition exists on disk.
    #[serde(skip)]
    pub disk: Option<String>,
}

impl Partition {
    pub fn new(name: &str, label: &str, size: u64, fs: &str) -> Self {
        Partition {
            name: name.to_string(),
            label: label.to_string(),
            size,
            fs: fs.to_string(),
            ..Default::default()
        }
    }

    /// Project this partition into a fresh `Image` with an undefined source.
    /// No back pointer to the partition is kept.
    pub fn to_image(&self, file: PathBuf) -> Image {
        Image {
            file,
            label: self.label.clone(),
            size: self.size,
            fs: self.fs.clone(),
            source: ImageSource::Empty,
            mountpoint: None,
            loop_device: None,
        }
    }
}

/// A materialized root filesystem image.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub file: PathBuf,
    pub label: String,
    pub size: u64,
    pub fs: String,
    pub source: ImageSource,
    pub mountpoint: Option<PathBuf>,
    pub loop_device: Option<String>,
}

/// The well-known partition slots of an installed system.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ElementalPartitions {
    pub bios: Option<Partition>,
    pub boot: Option<Partition>,
    pub oem: Option<Partition>,
    pub recovery: Option<Partition>,
    pub state: Option<Partition>,
    pub persistent: Option<Partition>,
    pub extras: Vec<Partition>,
}

impl ElementalPartitions {
    /// The stock layout: state, oem, recovery and a growing persistent
    /// partition.  Firmware partitions are added by
    /// `set_firmware_partitions`.
    pub fn defaults() -> Self {
        ElementalPartitions {
            oem: Some(Partition::new(OEM_PART_NAME, OEM_LABEL, 64, "ext4")),
            state: Some(Partition::new(STATE_PART_NAME, STATE_LABEL, 8192, "ext4")),
            recovery: Some(Partition::new(
                RECOVERY_PART_NAME,
                RECOVERY_LABEL,
                4096,
                "ext4",
            )),
            persistent: Some(Partition::new(
                PERSISTENT_PART_NAME,
                PERSISTENT_LABEL,
                0,
                "ext2",
            )),
            ..Default::default()
        }
    }

    /// Map a flat partition list (layout file) into the named slots; unknown
    /// names become extra partitions.
    pub fn from_list(parts: Vec<Partition>) -> Self {
        let mut layout = ElementalPartitions::default();
        for p in parts {
            match p.name.as_str() {
                BIOS_PART_NAME => layout.bios = Some(p),
                EFI_PART_NAME => layout.boot = Some(p),
                OEM_PART_NAME => layout.oem = Some(p),
                STATE_PART_NAME => layout.state = Some(p),
                RECOVERY_PART_NAME => layout.recovery = Some(p),
                PERSISTENT_PART_NAME => layout.persistent = Some(p),
                _ => layout.extras.push(p),
            }
        }
        layout
    }

    /// Enforce the firmware invariant: exactly one of {BIOS, Boot, none}
    /// depending on (firmware, table).  With BIOS firmware on MSDOS there is
    /// no dedicated boot partition and the state partition carries the boot
    /// flag.
    pub fn set_firmware_partitions(
        &mut self,
        firmware: Firmware,
        table: PartTable,
    ) -> Result<()> {
        match (firmware, table) {
            (Firmware::Efi, PartTable::Gpt) => {
                let mut esp = Partition::new(EFI_PART_NAME, EFI_LABEL, 64, "vfat");
                esp.flags = vec!["esp".to_string()];
                self.boot = Some(esp);
                self.bios = None;
            }
            (Firmware::Bios, PartTable::Gpt) => {
                let mut bios = Partition::new(BIOS_PART_NAME, "", 1, "");
                bios.flags = vec!["bios_grub".to_string()];
                self.bios = Some(bios);
                self.boot = None;
            }
            (Firmware::Bios, PartTable::Msdos) => {
                self.bios = None;
                self.boot = None;
                let state = self
                    .state
                    .as_mut()
                    .context("no state partition to flag bootable")?;
                if !state.flags.iter().any(|f| f == "boot") {
                    state.flags.push("boot".to_string());
                }
            }
            (Firmware::Efi, PartTable::Msdos) => {
                bail!("EFI firmware requires a GPT partition table")
            }
        }
        Ok(())
    }

    /// Partitions in the order they are created on disk.  At most one
    /// partition may grow (size 0) and it is placed last.
    pub fn partitions_by_install_order(&self) -> Result<Vec<Partition>> {
        let mut parts: Vec<Partition> = Vec::new();
        for slot in [
            &self.bios,
            &self.boot,
            &self.oem,
            &self.recovery,
            &self.state,
            &self.persistent,
        ] {
            if let Some(p) = slot {
                parts.push(p.clone());
            }
        }
        parts.extend(self.extras.iter().cloned());

        let growing: Vec<usize> = parts
            .iter()
            .enumerate()
            .filter(|(_, p)| p.size == 0)
            .map(|(i, _)| i)
            .collect();
        if growing.len() > 1 {
            bail!("more than one partition set to grow to fill the disk");
        }
        if let Some(&i) = growing.first() {
            let grow = parts.remove(i);
            parts.push(grow);
        }
        Ok(parts)
    }
}

/// Declarative disk description consumed by `partition`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DiskSpec {
    pub device: String,
    pub firmware: Firmware,
    pub part_table: PartTable,
    pub partitions: Vec<Partition>,
    /// Accept disks smaller than the layout; sizes are then best-effort.
    pub expandable: bool,
}

impl Default for DiskSpec {
    fn default() -> Self {
        DiskSpec {
            device: String::new(),
            firmware: Firmware::Bios,
            part_table: PartTable::Msdos,
            partitions: Vec::new(),
            expandable: false,
        }
    }
}

impl DiskSpec {
    pub fn load_layout(path: &std::path::Path) -> Result<DiskSpec> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading layout file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing layout file {}", path.display()))
    }
}

/// Disk space needed by the layout: leading alignment plus every partition
/// at its declared size or the accounting minimum.
pub fn required_disk_size_mib(parts: &[Partition]) -> u64 {
    2 + parts
        .iter()
        .map(|p| std::cmp::max(p.size, MIN_PART_MIB))
        .sum::<u64>()
}

/// Create the partition table described by the layout, format the
/// filesystems, and return the labeled slots with device paths filled in.
/// Any parted or mkfs failure is fatal; the caller must not proceed with a
/// partially-created table.
pub fn partition(cfg: &Config, layout: &ElementalPartitions, spec: &DiskSpec) -> Result<ElementalPartitions> {
    log::info!("Partitioning device...");

    let ordered = layout.partitions_by_install_order()?;
    if !spec.expandable {
        let available = device_size_mib(cfg.runner.as_ref(), &spec.device)?;
        let required = required_disk_size_mib(&ordered);
        if available < required {
            bail!(
                "device {} too small: {} MiB available, {} MiB required",
                spec.device,
                available,
                required
            );
        }
    }

    let device = spec.device.as_str();
    cfg.runner
        .run("parted", &["-s", device, "mklabel", &spec.part_table.to_string()])
        .context("creating partition table")?;

    let mut start: u64 = 1;
    for (idx, part) in ordered.iter().enumerate() {
        let number = (idx + 1) as u32;
        let end = if part.size == 0 {
            "-1MiB".to_string()
        } else {
            format!("{}MiB", start + part.size)
        };
        let start_arg = format!("{}MiB", start);
        let name_arg = match spec.part_table {
            PartTable::Gpt => part.name.clone(),
            PartTable::Msdos => "primary".to_string(),
        };
        cfg.runner
            .run(
                "parted",
                &["-s", device, "unit", "MiB", "mkpart", &name_arg, &start_arg, &end],
            )
            .with_context(|| format!("creating partition {}", part.name))?;
        for flag in &part.flags {
            cfg.runner
                .run("parted", &["-s", device, "set", &number.to_string(), flag, "on"])
                .with_context(|| format!("setting {} flag on partition {}", flag, part.name))?;
        }
        start += std::cmp::max(part.size, MIN_PART_MIB);
    }

    settle_udev(cfg.runner.as_ref(), device)?;

    let mut result = layout.clone();
    for (idx, part) in ordered.iter().enumerate() {
        let number = (idx + 1) as u32;
        let path = partition_device(device, number);
        if !part.fs.is_empty() {
            format_partition(cfg, &path, &part.fs, &part.label)
                .with_context(|| format!("formatting partition {}", part.name))?;
        }
        for slot in [
            &mut result.bios,
            &mut result.boot,
            &mut result.oem,
            &mut result.recovery,
            &mut result.state,
            &mut result.persistent,
        ]
        .into_iter()
        .flatten()
        .chain(result.extras.iter_mut())
        {
            if slot.name == part.name {
                slot.path = Some(path.clone());
                slot.disk = Some(device.to_string());
            }
        }
    }
    Ok(result)
}

/// Run the mkfs flavor matching the filesystem kind.
pub fn format_partition(cfg: &Config, device: &str, fs: &str, label: &str) -> Result<()> {
    match fs {
        "ext2" | "ext3" | "ext4" => {
            cfg.runner
                .run(&format!("mkfs.{}", fs), &["-L", label, device])?;
        }
        "vfat" | "fat32" => {
            cfg.runner.run("mkfs.vfat", &["-n", label, device])?;
        }
        "btrfs" => {
            cfg.runner.run("mkfs.btrfs", &["-f", "-L", label, device])?;
        }
        other => bail!("unsupported filesystem '{}'", other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;

    #[test]
    fn test_firmware_mapping() {
        let mut parts = ElementalPartitions::defaults();
        parts
            .set_firmware_partitions(Firmware::Efi, PartTable::Gpt)
            .unwrap();
        assert!(parts.bios.is_none());
        let boot = parts.boot.as_ref().unwrap();
        assert_eq!(boot.label, EFI_LABEL);
        assert_eq!(boot.fs, "vfat");

        let mut parts = ElementalPartitions::defaults();
        parts
            .set_firmware_partitions(Firmware::Bios, PartTable::Gpt)
            .unwrap();
        assert!(parts.boot.is_none());
        let bios = parts.bios.as_ref().unwrap();
        assert_eq!(bios.flags, vec!["bios_grub".to_string()]);
        assert!(bios.fs.is_empty());

        let mut parts = ElementalPartitions::defaults();
        parts
            .set_firmware_partitions(Firmware::Bios, PartTable::Msdos)
            .unwrap();
        assert!(parts.bios.is_none() && parts.boot.is_none());
        assert!(parts
            .state
            .as_ref()
            .unwrap()
            .flags
            .contains(&"boot".to_string()));

        let mut parts = ElementalPartitions::defaults();
        assert!(parts
            .set_firmware_partitions(Firmware::Efi, PartTable::Msdos)
            .is_err());
    }

    #[test]
    fn test_install_order_grow_last() {
        let mut parts = ElementalPartitions::defaults();
        parts
            .set_firmware_partitions(Firmware::Efi, PartTable::Gpt)
            .unwrap();
        let ordered = parts.partitions_by_install_order().unwrap();
        let names: Vec<&str> = ordered.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                EFI_PART_NAME,
                OEM_PART_NAME,
                RECOVERY_PART_NAME,
                STATE_PART_NAME,
                PERSISTENT_PART_NAME
            ]
        );
        assert_eq!(ordered.last().unwrap().size, 0);
    }

    #[test]
    fn test_install_order_rejects_two_growing() {
        let mut parts = ElementalPartitions::defaults();
        parts
            .extras
            .push(Partition::new("p.data", "DATA", 0, "ext4"));
        assert!(parts.partitions_by_install_order().is_err());
    }

    #[test]
    fn test_partition_to_image_projection() {
        let part = Partition::new(STATE_PART_NAME, STATE_LABEL, 8192, "ext4");
        let image = part.to_image(PathBuf::from("/run/elemental/state/cOS/active.img"));
        assert_eq!(image.label, STATE_LABEL);
        assert_eq!(image.size, 8192);
        assert_eq!(image.fs, "ext4");
        assert_eq!(image.source, ImageSource::Empty);
    }

    #[test]
    fn test_required_disk_size() {
        let parts = vec![
            Partition::new("a", "A", 100, "ext4"),
            Partition::new("b", "B", 0, "ext4"),
            Partition::new("c", "C", 1, ""),
        ];
        // 2 alignment + 100 + 2 (grow floor) + 2 (min floor)
        assert_eq!(required_disk_size_mib(&parts), 106);
    }

    #[test]
    fn test_layout_parse() {
        let raw = r#"
device: /dev/sda
part-table: gpt
partitions:
  - name: p.state
    label: COS_STATE
    size: 8192
    fs: ext4
  - name: p.oem
    label: COS_OEM
    size: 10
    fs: ext4
  - name: p.recovery
    label: COS_RECOVERY
    size: 4000
    fs: ext2
  - name: p.persistent
    label: COS_PERSISTENT
    size: 100
    fs: ext2
"#;
        let spec: DiskSpec = serde_yaml::from_str(raw).unwrap();
        assert_eq!(spec.part_table, PartTable::Gpt);
        let layout = ElementalPartitions::from_list(spec.partitions.clone());
        assert_eq!(layout.state.as_ref().unwrap().size, 8192);
        assert_eq!(layout.recovery.as_ref().unwrap().fs, "ext2");
        assert_eq!(layout.persistent.as_ref().unwrap().size, 100);
        assert!(layout.extras.is_empty());
    }

    #[test]
    fn test_partition_runs_parted_and_mkfs() {
        let (cfg, runner, _, _, _) = test_config();
        runner.on_output("blockdev --getsize64", &format!("{}\n", 20u64 * 1024 * 1024 * 1024));

        let mut layout = ElementalPartitions::defaults();
        layout
            .set_firmware_partitions(Firmware::Bios, PartTable::Gpt)
            .unwrap();
        let spec = DiskSpec {
            device: "/dev/sda".to_string(),
            firmware: Firmware::Bios,
            part_table: PartTable::Gpt,
            partitions: Vec::new(),
            expandable: false,
        };
        let result = partition(&cfg, &layout, &spec).unwrap();

        assert!(runner.ran("parted -s /dev/sda mklabel gpt"));
        assert!(runner.ran("parted -s /dev/sda unit MiB mkpart p.bios 1MiB 2MiB"));
        assert!(runner.ran("parted -s /dev/sda set 1 bios_grub on"));
        assert!(runner.ran("mkfs.ext4 -L COS_STATE"));
        assert!(runner.ran("mkfs.ext2 -L COS_PERSISTENT"));
        assert!(runner.ran("partprobe /dev/sda"));
        assert_eq!(
            result.state.as_ref().unwrap().path.as_deref(),
            // bios, oem, recovery, state
            Some("/dev/sda4")
        );
        assert_eq!(
            result.persistent.as_ref().unwrap().path.as_deref(),
            Some("/dev/sda5")
        );
    }

    #[test]
    fn test_partition_rejects_small_disk() {
        let (cfg, runner, _, _, _) = test_config();
        runner.on_output("blockdev --getsize64", "1048576\n");
        let layout = ElementalPartitions::defaults();
        let spec = DiskSpec {
            device: "/dev/sda".to_string(),
            ..Default::default()
        };
        assert!(partition(&cfg, &layout, &spec).is_err());
        assert!(!runner.ran("parted"));
    }
}
