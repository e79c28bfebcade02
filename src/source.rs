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

//! Image sources and their materialization into a directory.

use anyhow::{Context, Result};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::cmdline::FetchRetries;
use crate::config::{Config, Platform, Runner};
use crate::http::{download_to_path, FetchBackoff};

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("undefined image source")]
    UndefinedSource,
    #[error("image verification failed: {0}")]
    Verification(String),
}

/// Where a system image comes from.
#[derive(Clone, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub enum ImageSource {
    /// Container image reference.
    Oci(String),
    /// Local directory tree.
    Dir(PathBuf),
    /// Single image file, local path or http(s) URL.
    File(String),
    /// Package from the configured repositories.
    Channel(String),
    Empty,
}

impl FromStr for ImageSource {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::Empty);
        }
        if let Some(rest) = s.strip_prefix("oci:").or_else(|| s.strip_prefix("docker:")) {
            return Ok(Self::Oci(rest.trim_start_matches("//").to_string()));
        }
        if let Some(rest) = s.strip_prefix("dir:") {
            return Ok(Self::Dir(PathBuf::from(rest)));
        }
        if let Some(rest) = s.strip_prefix("file:") {
            return Ok(Self::File(rest.to_string()));
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(Self::File(s.to_string()));
        }
        if let Some(rest) = s.strip_prefix("channel:") {
            return Ok(Self::Channel(rest.to_string()));
        }
        // an unprefixed source is a container reference
        Ok(Self::Oci(s.to_string()))
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oci(r) => write!(f, "oci:{}", r),
            Self::Dir(p) => write!(f, "dir:{}", p.display()),
            Self::File(p) => write!(f, "file:{}", p),
            Self::Channel(p) => write!(f, "channel:{}", p),
            Self::Empty => Ok(()),
        }
    }
}

impl Default for ImageSource {
    fn default() -> Self {
        Self::Empty
    }
}

impl ImageSource {
    pub fn is_empty(&self) -> bool {
        self == &Self::Empty
    }
}

/// Knobs applied while materializing a source.
pub struct UnpackOpts<'a> {
    pub platform: &'a Platform,
    /// Pull from the local container store only; never hit the network.
    pub local: bool,
    /// Validate the image signature with cosign before unpacking.
    pub verify: bool,
    pub cosign_pub_key: Option<&'a str>,
    pub tls_verify: bool,
    pub retries: FetchRetries,
    /// Repositories consulted by channel sources.
    pub repositories: &'a [String],
}

impl<'a> UnpackOpts<'a> {
    pub fn new(platform: &'a Platform) -> Self {
        UnpackOpts {
            platform,
            local: false,
            verify: false,
            cosign_pub_key: None,
            tls_verify: true,
            retries: FetchRetries::None,
            repositories: &[],
        }
    }
}

/// Pulls a container image and unpacks its layers into a directory,
/// preserving ownership, xattrs and device nodes.
pub trait ImageExtractor {
    /// Returns the canonical digest of the unpacked image.
    fn unpack(
        &self,
        runner: &dyn Runner,
        image: &str,
        dest: &Path,
        opts: &UnpackOpts,
    ) -> Result<String>;
}

/// Extractor delegating to skopeo and umoci.
#[derive(Debug, Default)]
pub struct SkopeoExtractor;

impl ImageExtractor for SkopeoExtractor {
    fn unpack(
        &self,
        runner: &dyn Runner,
        image: &str,
        dest: &Path,
        opts: &UnpackOpts,
    ) -> Result<String> {
        if opts.verify {
            let key = opts.cosign_pub_key.ok_or_else(|| {
                SourceError::Verification("no cosign public key configured".to_string())
            })?;
            runner
                .run("cosign", &["verify", "--key", key, image])
                .map_err(|e| SourceError::Verification(e.to_string()))?;
        }

        let transport = if opts.local {
            format!("containers-storage:{}", image)
        } else {
            format!("docker://{}", image)
        };

        let mut inspect = vec!["inspect", "--format", "{{.Digest}}"];
        if !opts.tls_verify {
            inspect.insert(1, "--tls-verify=false");
        }
        inspect.push(&transport);
        let digest = runner
            .run("skopeo", &inspect)
            .context("reading image digest")?
            .trim()
            .to_string();

        let staging = tempfile::Builder::new()
            .prefix("elemental-oci.")
            .tempdir()
            .context("creating OCI staging directory")?;
        let oci_dir = format!("oci:{}:latest", staging.path().display());
        let mut copy = vec!["copy", "--override-arch", opts.platform.image_arch.as_str()];
        if !opts.tls_verify {
            copy.push("--src-tls-verify=false");
        }
        copy.push(&transport);
        copy.push(&oci_dir);
        runner
            .run("skopeo", &copy)
            .with_context(|| format!("pulling {}", image))?;

        let image_arg = format!("{}:latest", staging.path().display());
        let dest_arg = dest.to_string_lossy().to_string();
        runner
            .run("umoci", &["raw", "unpack", "--image", &image_arg, &dest_arg])
            .with_context(|| format!("unpacking {}", image))?;

        Ok(digest)
    }
}

/// Materialize `source` into `dest`.  Returns the content digest when the
/// source has one.  Only registry pulls are retried; local failures surface
/// immediately.
pub fn unpack_source(
    cfg: &Config,
    source: &ImageSource,
    dest: &Path,
    opts: &UnpackOpts,
) -> Result<Option<String>> {
    log::info!("Unpacking {} into {}", source, dest.display());
    std::fs::create_dir_all(dest)
        .with_context(|| format!("creating {}", dest.display()))?;
    match source {
        ImageSource::Empty => Err(SourceError::UndefinedSource.into()),
        ImageSource::Oci(image) => {
            let mut backoff = FetchBackoff::new(opts.retries);
            loop {
                match cfg.extractor.unpack(cfg.runner.as_ref(), image, dest, opts) {
                    Ok(digest) => return Ok(Some(digest)),
                    // verification failures are final, never retried
                    Err(e) if e.is::<SourceError>() => return Err(e),
                    Err(e) => {
                        if !backoff.retry(image, &e) {
                            return Err(e).with_context(|| format!("pulling {}", image));
                        }
                    }
                }
            }
        }
        ImageSource::Dir(path) => {
            let src = format!("{}/", path.display());
            let dst = format!("{}/", dest.display());
            cfg.runner
                .run("rsync", &["-aqAXS", "--delete", &src, &dst])
                .with_context(|| format!("mirroring {}", path.display()))?;
            Ok(None)
        }
        ImageSource::File(file) => {
            let name = Path::new(file)
                .file_name()
                .with_context(|| format!("source file {} has no filename", file))?;
            let target = dest.join(name);
            if file.starts_with("http://") || file.starts_with("https://") {
                let url = url::Url::parse(file)
                    .with_context(|| format!("parsing '{}' as URL", file))?;
                download_to_path(&url, &target, opts.retries)?;
            } else {
                std::fs::copy(file, &target)
                    .with_context(|| format!("copying {} to {}", file, target.display()))?;
            }
            Ok(None)
        }
        ImageSource::Channel(package) => {
            let dest_arg = dest.to_string_lossy().to_string();
            let mut args = vec!["install", "--no-spinner", "-y", "--system-target", &dest_arg];
            for repo in opts.repositories {
                args.push("--repository");
                args.push(repo);
            }
            args.push(package);
            cfg.runner
                .run("luet", &args)
                .with_context(|| format!("installing {}", package))?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;

    #[test]
    fn test_parse_and_display() {
        let cases = vec![
            ("oci:quay.io/os:v1", ImageSource::Oci("quay.io/os:v1".into())),
            ("docker://quay.io/os:v1", ImageSource::Oci("quay.io/os:v1".into())),
            ("quay.io/os:v1", ImageSource::Oci("quay.io/os:v1".into())),
            ("dir:/tmp/root", ImageSource::Dir(PathBuf::from("/tmp/root"))),
            ("file:/tmp/rootfs.img", ImageSource::File("/tmp/rootfs.img".into())),
            ("channel:system/os", ImageSource::Channel("system/os".into())),
            ("", ImageSource::Empty),
        ];
        for (raw, expected) in cases {
            assert_eq!(raw.parse::<ImageSource>().unwrap(), expected);
        }
        assert_eq!(
            "dir:/tmp/root".parse::<ImageSource>().unwrap().to_string(),
            "dir:/tmp/root"
        );
        assert_eq!(ImageSource::Empty.to_string(), "");
    }

    #[test]
    fn test_unpack_empty_is_an_error() {
        let (cfg, _, _, _, _) = test_config();
        let dir = tempfile::tempdir().unwrap();
        let opts = UnpackOpts::new(&cfg.platform);
        let err = unpack_source(&cfg, &ImageSource::Empty, dir.path(), &opts).unwrap_err();
        assert!(err.is::<SourceError>());
    }

    #[test]
    fn test_unpack_dir_mirrors_with_rsync() {
        let (cfg, runner, _, _, _) = test_config();
        let dir = tempfile::tempdir().unwrap();
        let opts = UnpackOpts::new(&cfg.platform);
        let source = ImageSource::Dir(PathBuf::from("/source/root"));
        let digest = unpack_source(&cfg, &source, dir.path(), &opts).unwrap();
        assert_eq!(digest, None);
        assert!(runner.ran(&format!(
            "rsync -aqAXS --delete /source/root/ {}/",
            dir.path().display()
        )));
    }

    #[test]
    fn test_unpack_file_copies_under_basename() {
        let (cfg, _, _, _, _) = test_config();
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("rootfs.img");
        std::fs::write(&src, b"image").unwrap();
        let opts = UnpackOpts::new(&cfg.platform);
        let source = ImageSource::File(src.to_string_lossy().to_string());
        unpack_source(&cfg, &source, dest_dir.path(), &opts).unwrap();
        assert_eq!(
            std::fs::read(dest_dir.path().join("rootfs.img")).unwrap(),
            b"image"
        );
    }

    #[test]
    fn test_unpack_channel_invokes_luet() {
        let (cfg, runner, _, _, _) = test_config();
        let dir = tempfile::tempdir().unwrap();
        let repos = vec!["https://repo.example.com".to_string()];
        let mut opts = UnpackOpts::new(&cfg.platform);
        opts.repositories = &repos;
        let source = ImageSource::Channel("system/os@1.0".to_string());
        unpack_source(&cfg, &source, dir.path(), &opts).unwrap();
        assert!(runner.ran(&format!(
            "luet install --no-spinner -y --system-target {} --repository https://repo.example.com system/os@1.0",
            dir.path().display()
        )));
    }

    #[test]
    fn test_unpack_oci_reports_digest() {
        let (cfg, _, _, extractor, _) = test_config();
        let dir = tempfile::tempdir().unwrap();
        let opts = UnpackOpts::new(&cfg.platform);
        let source = ImageSource::Oci("quay.io/os:v1".to_string());
        let digest = unpack_source(&cfg, &source, dir.path(), &opts).unwrap();
        assert_eq!(digest.as_deref(), Some("sha256:deadbeef"));
        assert_eq!(extractor.unpacked().len(), 1);
    }

    #[test]
    fn test_oci_retry_until_success() {
        use std::cell::Cell;

        struct Flaky {
            calls: Cell<u32>,
        }
        impl ImageExtractor for Flaky {
            fn unpack(
                &self,
                _runner: &dyn Runner,
                _image: &str,
                _dest: &Path,
                _opts: &UnpackOpts,
            ) -> Result<String> {
                self.calls.set(self.calls.get() + 1);
                if self.calls.get() < 2 {
                    anyhow::bail!("connection reset");
                }
                Ok("sha256:f00d".to_string())
            }
        }

        let (mut cfg, _, _, _, _) = test_config();
        cfg.extractor = Box::new(Flaky { calls: Cell::new(0) });
        let dir = tempfile::tempdir().unwrap();
        let mut opts = UnpackOpts::new(&cfg.platform);
        opts.retries = FetchRetries::Finite(std::num::NonZeroU32::new(2).unwrap());
        let source = ImageSource::Oci("quay.io/os:v1".to_string());
        let digest = unpack_source(&cfg, &source, dir.path(), &opts).unwrap();
        assert_eq!(digest.as_deref(), Some("sha256:f00d"));
    }

    #[test]
    fn test_verification_failure_is_not_retried() {
        struct Failing;
        impl ImageExtractor for Failing {
            fn unpack(
                &self,
                _runner: &dyn Runner,
                _image: &str,
                _dest: &Path,
                _opts: &UnpackOpts,
            ) -> Result<String> {
                Err(SourceError::Verification("bad signature".to_string()).into())
            }
        }

        let (mut cfg, _, _, _, _) = test_config();
        cfg.extractor = Box::new(Failing);
        let dir = tempfile::tempdir().unwrap();
        let mut opts = UnpackOpts::new(&cfg.platform);
        opts.retries = FetchRetries::Infinite;
        let source = ImageSource::Oci("quay.io/os:v1".to_string());
        let err = unpack_source(&cfg, &source, dir.path(), &opts).unwrap_err();
        assert!(err.is::<SourceError>());
    }
}
