// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the request gateway against simulated hosts

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use cowvm_common::cmd::{fatal, CmdError};
use cowvm_controller::{run_sim, Config};

#[derive(Debug, Parser)]
#[clap(
    name = "cowvm-sim",
    about = "Run the copy-on-write VM gateway against simulated hosts"
)]
struct Args {
    #[clap(name = "CONFIG_FILE_PATH", action)]
    config_file_path: Utf8PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(cmd_error) = do_run().await {
        fatal(cmd_error);
    }
}

async fn do_run() -> Result<(), CmdError> {
    let args = Args::parse();
    let config = Config::from_file(&args.config_file_path)
        .context("loading configuration")
        .map_err(CmdError::Failure)?;
    run_sim(config).await.map_err(CmdError::Failure)
}
