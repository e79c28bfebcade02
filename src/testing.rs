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

//! Scripted fakes for the `Config` seams, compiled for tests only.

use anyhow::{bail, Result};
use std::cell::RefCell;
use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::config::{CloudInitRunner, Config, Mounter, Platform, Runner};
use crate::partitioner::Firmware;
use crate::source::{ImageExtractor, UnpackOpts};

#[derive(Default)]
struct RunnerState {
    commands: RefCell<Vec<String>>,
    outputs: RefCell<Vec<(String, String)>>,
    failures: RefCell<Vec<String>>,
}

/// Records every invocation; returns scripted stdout by command-line prefix.
#[derive(Clone, Default)]
pub struct FakeRunner {
    state: Rc<RunnerState>,
}

impl FakeRunner {
    /// Return `stdout` for any command line starting with `prefix`.
    pub fn on_output(&self, prefix: &str, stdout: &str) {
        self.state
            .outputs
            .borrow_mut()
            .push((prefix.to_string(), stdout.to_string()));
    }

    /// Fail any command line starting with `prefix`.
    pub fn fail_on(&self, prefix: &str) {
        self.state.failures.borrow_mut().push(prefix.to_string());
    }

    pub fn invocations(&self) -> Vec<String> {
        self.state.commands.borrow().clone()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.state
            .commands
            .borrow()
            .iter()
            .any(|c| c.starts_with(prefix))
    }
}

impl Runner for FakeRunner {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let line = if args.is_empty() {
            cmd.to_string()
        } else {
            format!("{} {}", cmd, args.join(" "))
        };
        self.state.commands.borrow_mut().push(line.clone());
        if self
            .state
            .failures
            .borrow()
            .iter()
            .any(|p| line.starts_with(p.as_str()))
        {
            bail!("{} failed with exit status: 1", line);
        }
        for (prefix, stdout) in self.state.outputs.borrow().iter() {
            if line.starts_with(prefix.as_str()) {
                return Ok(stdout.clone());
            }
        }
        Ok(String::new())
    }
}

#[derive(Default)]
struct MounterState {
    mounts: RefCell<Vec<(String, PathBuf, String, Vec<String>)>>,
    unmounts: RefCell<Vec<PathBuf>>,
}

#[derive(Clone, Default)]
pub struct FakeMounter {
    state: Rc<MounterState>,
}

impl FakeMounter {
    pub fn mounts(&self) -> Vec<(String, PathBuf, String, Vec<String>)> {
        self.state.mounts.borrow().clone()
    }

    pub fn unmounts(&self) -> Vec<PathBuf> {
        self.state.unmounts.borrow().clone()
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[&str]) -> Result<()> {
        self.state.mounts.borrow_mut().push((
            source.to_string(),
            target.to_path_buf(),
            fstype.to_string(),
            options.iter().map(|o| o.to_string()).collect(),
        ));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.state.unmounts.borrow_mut().push(target.to_path_buf());
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let unmounted = self
            .state
            .unmounts
            .borrow()
            .iter()
            .filter(|t| t.as_path() == target)
            .count();
        let mounted = self
            .state
            .mounts
            .borrow()
            .iter()
            .filter(|(_, t, _, _)| t.as_path() == target)
            .count();
        Ok(mounted > unmounted)
    }
}

#[derive(Default)]
struct ExtractorState {
    digest: RefCell<String>,
    files: RefCell<Vec<(String, String)>>,
    unpacked: RefCell<Vec<(String, PathBuf)>>,
}

/// Writes scripted files into the destination and reports a fixed digest.
#[derive(Clone, Default)]
pub struct FakeExtractor {
    state: Rc<ExtractorState>,
}

impl FakeExtractor {
    pub fn with_digest(digest: &str) -> Self {
        let fake = Self::default();
        *fake.state.digest.borrow_mut() = digest.to_string();
        fake
    }

    pub fn add_file(&self, relative: &str, content: &str) {
        self.state
            .files
            .borrow_mut()
            .push((relative.to_string(), content.to_string()));
    }

    pub fn unpacked(&self) -> Vec<(String, PathBuf)> {
        self.state.unpacked.borrow().clone()
    }
}

impl ImageExtractor for FakeExtractor {
    fn unpack(
        &self,
        _runner: &dyn Runner,
        image: &str,
        dest: &Path,
        _opts: &UnpackOpts,
    ) -> Result<String> {
        self.state
            .unpacked
            .borrow_mut()
            .push((image.to_string(), dest.to_path_buf()));
        for (relative, content) in self.state.files.borrow().iter() {
            let path = dest.join(relative);
            if let Some(parent) = path.parent() {
                create_dir_all(parent)?;
            }
            File::create(&path)?.write_all(content.as_bytes())?;
        }
        Ok(self.state.digest.borrow().clone())
    }
}

#[derive(Clone, Default)]
pub struct FakeCloudInit {
    stages: Rc<RefCell<Vec<(String, Option<PathBuf>)>>>,
}

impl FakeCloudInit {
    pub fn stages(&self) -> Vec<String> {
        self.stages
            .borrow()
            .iter()
            .map(|(stage, _)| stage.clone())
            .collect()
    }

    /// The chroot each stage ran in, None for host stages.
    pub fn stage_roots(&self) -> Vec<(String, Option<PathBuf>)> {
        self.stages.borrow().clone()
    }
}

impl CloudInitRunner for FakeCloudInit {
    fn run_stage(
        &self,
        _runner: &dyn Runner,
        stage: &str,
        root: Option<&Path>,
        _extra: &[&str],
    ) -> Result<()> {
        self.stages
            .borrow_mut()
            .push((stage.to_string(), root.map(Path::to_path_buf)));
        Ok(())
    }
}

/// A `Config` with every collaborator faked; the returned fakes share state
/// with the aggregate for assertions.
pub fn test_config() -> (Config, FakeRunner, FakeMounter, FakeExtractor, FakeCloudInit) {
    let runner = FakeRunner::default();
    let mounter = FakeMounter::default();
    let extractor = FakeExtractor::with_digest("sha256:deadbeef");
    let cloud_init = FakeCloudInit::default();
    let config = Config {
        runner: Box::new(runner.clone()),
        mounter: Box::new(mounter.clone()),
        extractor: Box::new(extractor.clone()),
        cloud_init: Box::new(cloud_init.clone()),
        platform: Platform::new("x86_64", ""),
        firmware: Firmware::Bios,
    };
    (config, runner, mounter, extractor, cloud_init)
}
