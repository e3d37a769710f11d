// SPDX-FileCopyrightText: Copyright (c) 2026 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A [tokio](https://tokio.rs) based Modbus-TCP gateway for DTU field
//! devices.
//!
//! Many serial-to-TCP modems ("DTUs") embedded in industrial equipment
//! cannot speak Modbus-TCP idiomatically: they prepend a registration
//! handshake, pad frames to cipher block boundaries and may encrypt
//! the whole stream. This crate bridges exactly one such device to
//! exactly one standard Modbus-TCP client, forwarding bytes between
//! two independent listening endpoints.
//!
//! Whenever the device is absent or stays silent beyond the configured
//! response timeout, the client receives a well-formed
//! `GatewayTargetDeviceFailedToRespond` exception instead of hanging.

pub mod config;
mod error;
pub mod frame;
mod handshake;
mod server;
mod transform;

pub use self::{
    config::{Encryption, GatewayConfig},
    error::{Error, Result},
    handshake::HandshakeOutcome,
    server::Gateway,
};
