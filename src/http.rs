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

//! Blocking HTTP fetch, plus the retry budget every network fetch path
//! (plain downloads and registry pulls alike) draws from.

use anyhow::{anyhow, Context, Result};
use reqwest::blocking;
use std::fs::File;
use std::io::copy;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;
use url::Url;

use crate::cmdline::FetchRetries;

/// Per-request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest pause between two attempts, however often the delay doubles.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub fn new_http_client() -> Result<blocking::Client> {
    blocking::ClientBuilder::new()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("building HTTP client")
}

/// Attempt budget for a fetch.  Every failed attempt consumes one unit of
/// the budget and doubles the pause before the next try, up to
/// `MAX_BACKOFF`.
pub struct FetchBackoff {
    /// Attempts still allowed after the current one; None is unbounded.
    remaining: Option<u32>,
    delay: Duration,
}

impl FetchBackoff {
    pub fn new(retries: FetchRetries) -> Self {
        let remaining = match retries {
            FetchRetries::Infinite => None,
            FetchRetries::Finite(n) => Some(n.get()),
            FetchRetries::None => Some(0),
        };
        FetchBackoff {
            remaining,
            delay: Duration::from_secs(1),
        }
    }

    /// Report a failed attempt on `what`.  Returns false once the budget is
    /// spent; otherwise logs the failure, sleeps, and lets the caller go
    /// again.
    pub fn retry(&mut self, what: &str, err: &anyhow::Error) -> bool {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return false;
            }
            *remaining -= 1;
        }
        log::warn!("Fetching {} failed: {:#}", what, err);
        log::warn!("Retrying in {}s...", self.delay.as_secs());
        sleep(self.delay);
        self.delay = std::cmp::min(self.delay * 2, MAX_BACKOFF);
        true
    }
}

/// Whether a response status is worth another attempt: timeouts, throttling
/// and upstream hiccups, not client mistakes.
fn transient_status(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

/// GET `url`, retrying transient failures within the given budget.
pub fn http_get(
    client: &blocking::Client,
    url: &Url,
    retries: FetchRetries,
) -> Result<blocking::Response> {
    let mut backoff = FetchBackoff::new(retries);
    loop {
        let err = match client.get(url.clone()).send() {
            Ok(resp) if transient_status(resp.status()) => anyhow!("HTTP {}", resp.status()),
            Ok(resp) => {
                return resp
                    .error_for_status()
                    .with_context(|| format!("fetching '{}'", url))
            }
            Err(err) => err.into(),
        };
        if !backoff.retry(&format!("'{}'", url), &err) {
            return Err(err).with_context(|| format!("fetching '{}'", url));
        }
    }
}

/// Fetch a URL into the given destination file path.
pub fn download_to_path(url: &Url, dest: &Path, retries: FetchRetries) -> Result<()> {
    let client = new_http_client()?;
    let mut resp = http_get(&client, url, retries)?;
    let mut out = File::create(dest)
        .with_context(|| format!("creating {}", dest.display()))?;
    copy(&mut resp, &mut out).with_context(|| format!("downloading {}", url))?;
    Ok(())
}
