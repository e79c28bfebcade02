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

use anyhow::Result;
use clap::Parser;
use std::process::exit;

use libelemental::action;
use libelemental::cmdline::{Cli, Cmd};
use libelemental::config::{Config, RunConfig};

fn main() {
    let cli = Cli::parse();
    let level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();

    if let Err(e) = run(cli) {
        log::error!("{:#}", e);
        exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let run_config = RunConfig::load(cli.config.as_deref())?;
    let config = Config::new_host();
    match cli.cmd {
        Cmd::Install(c) => action::install::install(&config, &run_config, &c),
        Cmd::Upgrade(c) => action::upgrade::upgrade(&config, &run_config, &c),
        Cmd::Reset(c) => action::reset::reset(&config, &run_config, &c),
        Cmd::Mount(c) => action::mount::mount(&config, &run_config, &c),
    }
}
