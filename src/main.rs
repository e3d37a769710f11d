// SPDX-FileCopyrightText: Copyright (c) 2026 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gateway binary: loads a TOML configuration and serves until killed.

use std::{env, fs, process::ExitCode};

use log::error;

use modbus_dtu_gateway::{Gateway, GatewayConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::init();

    let Some(config_path) = env::args().nth(1) else {
        eprintln!("Usage: modbus-dtu-gateway <config.toml>");
        return ExitCode::FAILURE;
    };
    match run(&config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    let raw = fs::read_to_string(config_path)?;
    let config: GatewayConfig = toml::from_str(&raw)?;
    let gateway = Gateway::new(config)?;
    let (dtu, modbus) = gateway.bind().await?;
    gateway.serve(dtu, modbus).await?;
    Ok(())
}
