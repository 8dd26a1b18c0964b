// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable for dirauthd: the mix network directory authority.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use dirauth_server::{run_openapi, Config, Server};

#[derive(Debug, Parser)]
#[clap(name = "dirauthd", about = "Mix network directory authority")]
enum Args {
    /// Print the OpenAPI Spec document and exit
    Openapi,

    /// Start a directory authority server
    Run {
        #[clap(name = "CONFIG_FILE_PATH", action)]
        config_file_path: Utf8PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::Openapi => run_openapi(),
        Args::Run { config_file_path } => {
            let config = Config::from_file(&config_file_path)?;
            let log = config
                .log
                .to_logger("dirauthd")
                .context("initializing logger")?;
            let mut server = Server::start(config, &log).await?;
            server.wait_for_finish().await
        }
    }
}
