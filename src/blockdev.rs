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

use anyhow::{anyhow, bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

use crate::config::Runner;

/// One device row from lsblk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub label: Option<String>,
    pub fstype: Option<String>,
    pub blktype: Option<String>,
    pub mountpoint: Option<String>,
}

impl DeviceInfo {
    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(DeviceInfo {
            path: fields.get("NAME")?.clone(),
            label: fields.get("LABEL").cloned(),
            fstype: fields.get("FSTYPE").cloned(),
            blktype: fields.get("TYPE").cloned(),
            mountpoint: fields.get("MOUNTPOINT").cloned(),
        })
    }
}

/// List devices below `dev`, or every block device when `dev` is None.
pub fn lsblk(runner: &dyn Runner, dev: Option<&str>, with_deps: bool) -> Result<Vec<DeviceInfo>> {
    let mut args = vec![
        "--pairs",
        "--paths",
        "--output",
        "NAME,LABEL,FSTYPE,TYPE,MOUNTPOINT",
    ];
    if !with_deps {
        args.push("--nodeps");
    }
    if let Some(dev) = dev {
        args.push(dev);
    }
    let output = runner.run("lsblk", &args)?;
    Ok(output
        .lines()
        .filter_map(|line| DeviceInfo::from_fields(&split_lsblk_line(line)))
        .collect())
}

/// Parse key-value pairs from lsblk --pairs.
/// Newer versions of lsblk support JSON but the one in CentOS 7 doesn't.
fn split_lsblk_line(line: &str) -> HashMap<String, String> {
    lazy_static! {
        static ref REGEX: Regex = Regex::new(r#"([A-Z-]+)="([^"]+)""#).unwrap();
    }
    let mut fields: HashMap<String, String> = HashMap::new();
    for cap in REGEX.captures_iter(line) {
        fields.insert(cap[1].to_string(), cap[2].to_string());
    }
    fields
}

/// Find the single device carrying the given filesystem label.
pub fn find_device_by_label(runner: &dyn Runner, label: &str) -> Result<DeviceInfo> {
    let matching: Vec<DeviceInfo> = lsblk(runner, None, true)?
        .into_iter()
        .filter(|d| d.label.as_deref() == Some(label))
        .collect();
    match matching.len() {
        0 => bail!("couldn't find device with label \"{}\"", label),
        1 => Ok(matching.into_iter().next().unwrap()),
        _ => bail!("found multiple devices with label \"{}\"", label),
    }
}

/// Device node path of partition `number` on `disk`.  Disks whose name ends
/// in a digit get a `p` separator (nvme0n1p1, mmcblk0p2).
pub fn partition_device(disk: &str, number: u32) -> String {
    if disk
        .chars()
        .last()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false)
    {
        format!("{}p{}", disk, number)
    } else {
        format!("{}{}", disk, number)
    }
}

/// Whole-disk device backing a partition node: trailing partition number
/// stripped, along with the `p` separator disks with numeric names use.
pub fn parent_disk(partition: &str) -> String {
    let trimmed = partition.trim_end_matches(|c: char| c.is_ascii_digit());
    if let Some(stripped) = trimmed.strip_suffix('p') {
        if stripped
            .chars()
            .last()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false)
        {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

/// Size of a block device in MiB.
pub fn device_size_mib(runner: &dyn Runner, dev: &str) -> Result<u64> {
    let output = runner.run("blockdev", &["--getsize64", dev])?;
    let bytes: u64 = output
        .trim()
        .parse()
        .with_context(|| format!("parsing size of {} from \"{}\"", dev, output.trim()))?;
    Ok(bytes / (1024 * 1024))
}

/// Refuse to operate on a disk with mounted or otherwise busy partitions.
pub fn ensure_exclusive_access(runner: &dyn Runner, disk: &str) -> Result<()> {
    let busy: Vec<DeviceInfo> = lsblk(runner, Some(disk), true)?
        .into_iter()
        .filter(|d| d.blktype.as_deref() != Some("disk"))
        .filter(|d| d.mountpoint.is_some())
        .collect();
    if busy.is_empty() {
        return Ok(());
    }
    for part in &busy {
        log::error!(
            "    {} mounted on {}",
            part.path,
            part.mountpoint.as_deref().unwrap_or("?")
        );
    }
    Err(anyhow!("found busy partitions on {}", disk))
}

/// Ask the kernel to pick up a new partition table and wait for device
/// nodes to appear.
pub fn settle_udev(runner: &dyn Runner, disk: &str) -> Result<()> {
    runner.run("partprobe", &[disk])?;
    runner.run("udevadm", &["settle"])?;
    Ok(())
}

/// Whether `path` lies on a mounted filesystem listed in the mount table.
pub fn filesystem_mountpoint(runner: &dyn Runner, device: &str) -> Result<Option<String>> {
    Ok(lsblk(runner, Some(device), false)?
        .into_iter()
        .next()
        .and_then(|d| d.mountpoint))
}
