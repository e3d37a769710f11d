// SPDX-FileCopyrightText: Copyright (c) 2026 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gateway configuration.

use std::{net::ToSocketAddrs as _, time::Duration};

use regex::Regex;
use serde::Deserialize;
use tokio::net::TcpListener;

use crate::{Error, Result};

const DEFAULT_CODE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2000;

/// Cipher applied to all bytes crossing the DTU boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    /// Plain passthrough.
    #[default]
    None,
    /// AES-128 in CBC mode.
    Aes,
    /// Triple-DES in CBC mode.
    Des3,
}

impl Encryption {
    /// Cipher block size in bytes; outbound chunks are zero padded to
    /// a multiple of this before encryption.
    pub(crate) const fn block_size(self) -> usize {
        match self {
            Self::None => 1,
            Self::Aes => 16,
            Self::Des3 => 8,
        }
    }

    pub(crate) const fn key_size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Aes => 16,
            Self::Des3 => 24,
        }
    }
}

/// Immutable gateway configuration.
///
/// Both endpoints listen for exactly one live connection each: the
/// field device (DTU) on `dtu_host:dtu_port` and the Modbus-TCP client
/// on `modbus_host:modbus_port`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Listen host for the DTU endpoint.
    #[serde(default = "default_host")]
    pub dtu_host: String,

    /// Listen port for the DTU endpoint.
    pub dtu_port: u16,

    /// Listen host for the Modbus client endpoint.
    #[serde(default = "default_host")]
    pub modbus_host: String,

    /// Listen port for the Modbus client endpoint.
    pub modbus_port: u16,

    /// Regex the first DTU payload must match before the connection is
    /// admitted to the forwarding path. No handshake when absent.
    #[serde(default)]
    pub dtu_code_pattern: Option<String>,

    /// Milliseconds the DTU has to send its registration code.
    #[serde(default = "default_code_timeout_ms")]
    pub dtu_code_timeout_ms: u64,

    /// Milliseconds the DTU has to answer a forwarded request before a
    /// synthetic exception is sent to the Modbus client.
    #[serde(default = "default_response_timeout_ms")]
    pub dtu_response_timeout_ms: u64,

    #[serde(default)]
    pub dtu_encryption: Encryption,

    /// Cipher key, required when encryption is enabled. Interpreted as
    /// raw bytes: 16 for AES-128, 24 for Triple-DES.
    #[serde(default)]
    pub dtu_encryption_key: Option<String>,

    /// Fixed initialization vector, one cipher block long.
    #[serde(default)]
    pub dtu_encryption_iv: Option<String>,

    /// Hex-dump every forwarded chunk.
    #[serde(default)]
    pub debug: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_code_timeout_ms() -> u64 {
    DEFAULT_CODE_TIMEOUT_MS
}

const fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_MS
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dtu_host: default_host(),
            dtu_port: 11502,
            modbus_host: default_host(),
            modbus_port: 10502,
            dtu_code_pattern: None,
            dtu_code_timeout_ms: DEFAULT_CODE_TIMEOUT_MS,
            dtu_response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            dtu_encryption: Encryption::None,
            dtu_encryption_key: None,
            dtu_encryption_iv: None,
            debug: false,
        }
    }
}

impl GatewayConfig {
    /// Checks everything that must hold before serving: key material
    /// for the selected cipher, the code pattern and both listen
    /// addresses. Called by [`Gateway::new`](crate::Gateway::new).
    pub fn validate(&self) -> Result<()> {
        if self.dtu_encryption != Encryption::None {
            self.cipher_key()?;
            self.cipher_iv()?;
        }
        self.code_pattern()?;
        resolve(&self.dtu_host, self.dtu_port)?;
        resolve(&self.modbus_host, self.modbus_port)?;
        Ok(())
    }

    /// Binds the DTU endpoint listener.
    pub async fn bind_dtu(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind((self.dtu_host.as_str(), self.dtu_port)).await?)
    }

    /// Binds the Modbus client endpoint listener.
    pub async fn bind_modbus(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind((self.modbus_host.as_str(), self.modbus_port)).await?)
    }

    pub(crate) fn code_pattern(&self) -> Result<Option<Regex>> {
        self.dtu_code_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(Into::into)
    }

    pub(crate) fn code_timeout(&self) -> Duration {
        Duration::from_millis(self.dtu_code_timeout_ms)
    }

    pub(crate) fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.dtu_response_timeout_ms)
    }

    pub(crate) fn cipher_key(&self) -> Result<&[u8]> {
        key_material(
            "key",
            self.dtu_encryption_key.as_deref(),
            self.dtu_encryption.key_size(),
        )
    }

    pub(crate) fn cipher_iv(&self) -> Result<&[u8]> {
        key_material(
            "IV",
            self.dtu_encryption_iv.as_deref(),
            self.dtu_encryption.block_size(),
        )
    }
}

fn key_material<'a>(
    name: &'static str,
    value: Option<&'a str>,
    expected: usize,
) -> Result<&'a [u8]> {
    let bytes = value.ok_or(Error::MissingKeyMaterial(name))?.as_bytes();
    if bytes.len() != expected {
        return Err(Error::InvalidKeyMaterial {
            name,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

fn resolve(host: &str, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}");
    match (host, port).to_socket_addrs() {
        Ok(mut addrs) => {
            if addrs.next().is_some() {
                Ok(())
            } else {
                Err(Error::InvalidListenAddr { addr })
            }
        }
        _ => Err(Error::InvalidListenAddr { addr }),
    }
}
