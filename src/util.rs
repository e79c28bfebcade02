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

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;

/// Runs the provided Command object, captures its stdout, and swallows its
/// stderr except on failure.  Returns a Result<String> describing whether the
/// command failed, and if not, its standard output.  Output is assumed to be
/// UTF-8.  Errors are adequately prefixed with the full command.
pub fn cmd_output(cmd: &mut Command) -> Result<String> {
    let result = cmd
        .output()
        .with_context(|| format!("running {:#?}", cmd))?;
    if !result.status.success() {
        log::error!("{}", String::from_utf8_lossy(&result.stderr));
        bail!("{:#?} failed with {}", cmd, result.status);
    }
    String::from_utf8(result.stdout)
        .with_context(|| format!("decoding as UTF-8 output of `{:#?}`", cmd))
}

/// Number of path components, used to order mounts so parents come before
/// children.
pub fn path_depth(path: &str) -> usize {
    Path::new(path).components().count()
}

/// Sort paths by ascending depth, dropping empty entries.  Equal-depth paths
/// keep lexicographic order so the result is deterministic.
pub fn sort_paths_by_depth(paths: &[String]) -> Vec<String> {
    let mut paths: Vec<String> = paths.iter().filter(|p| !p.is_empty()).cloned().collect();
    paths.sort();
    paths.sort_by_key(|p| path_depth(p));
    paths
}
