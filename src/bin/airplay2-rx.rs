/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use airplay2_rx::{app, config::ReceiverParams};
use clap::Parser;
use miette::IntoDiagnostic;
use std::path::PathBuf;
use tokio::runtime;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to a YAML parameters file; defaults are used when absent
    #[arg(short, long, env = "AIRPLAY2_RX_PARAMS")]
    params: Option<PathBuf>,
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let params = match &args.params {
        Some(path) => {
            let text = std::fs::read_to_string(path).into_diagnostic()?;
            serde_yaml::from_str::<ReceiverParams>(&text).into_diagnostic()?
        }
        None => ReceiverParams::default(),
    };

    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;
    runtime.block_on(app::run(params)).into_diagnostic()?;
    Ok(())
}
