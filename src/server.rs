// SPDX-FileCopyrightText: Copyright (c) 2026 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection broker.
//!
//! Owns both listening endpoints, the at-most-one-connection-per-role
//! pairing and the response deadline for requests forwarded to the
//! DTU. All slot mutation happens under one async mutex, so handler
//! steps are serialized exactly like events on a single-threaded loop.

use std::{future::Future, sync::Arc};

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::Mutex,
    task::JoinHandle,
    time::sleep,
};

use crate::{
    config::GatewayConfig,
    frame,
    handshake::{self, HandshakeOutcome},
    transform::{Inbound, Outbound},
    Result,
};

const READ_CHUNK_CAPACITY: usize = 4096;

/// The paired DTU connection: write half plus its encrypt stage. The
/// decrypt stage stays with the read half in the connection's task.
struct DtuSlot {
    writer: OwnedWriteHalf,
    encrypt: Outbound,
}

struct ModbusSlot {
    writer: OwnedWriteHalf,
}

/// Response deadline armed for the request most recently forwarded to
/// the DTU. The timer task keeps the plaintext request so an exception
/// response can be synthesized from its header on expiry.
struct PendingRequest {
    timer: JoinHandle<()>,
}

impl PendingRequest {
    fn disarm(self) {
        self.timer.abort();
    }
}

#[derive(Default)]
struct PairingState {
    dtu: Option<DtuSlot>,
    modbus: Option<ModbusSlot>,
    pending: Option<PendingRequest>,
}

struct Inner {
    config: GatewayConfig,
    code_pattern: Option<Regex>,
    state: Mutex<PairingState>,
}

/// A Modbus-TCP gateway bridging one DTU to one Modbus client.
///
/// Bytes from the Modbus endpoint are forwarded to the DTU through the
/// configured encryption pipeline; bytes from the DTU flow back
/// decrypted and trimmed. Whenever the DTU is absent or silent for
/// longer than the response timeout, the client receives a synthetic
/// `GatewayTargetDeviceFailedToRespond` exception instead of nothing.
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Validates the configuration and sets up the broker state.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for missing or malformed cipher
    /// key material, an invalid code pattern or an unresolvable listen
    /// address.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let code_pattern = config.code_pattern()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                code_pattern,
                state: Mutex::default(),
            }),
        })
    }

    /// Binds both listeners at the configured addresses.
    pub async fn bind(&self) -> Result<(TcpListener, TcpListener)> {
        let dtu = self.inner.config.bind_dtu().await?;
        let modbus = self.inner.config.bind_modbus().await?;
        Ok((dtu, modbus))
    }

    /// Serves both endpoints until an accept error occurs.
    pub async fn serve(self, dtu: TcpListener, modbus: TcpListener) -> Result<()> {
        self.serve_until(dtu, modbus, std::future::pending()).await
    }

    /// Serves both endpoints until an accept error occurs or
    /// `shutdown_signal` resolves.
    pub async fn serve_until<Sd>(
        self,
        dtu: TcpListener,
        modbus: TcpListener,
        shutdown_signal: Sd,
    ) -> Result<()>
    where
        Sd: Future<Output = ()>,
    {
        info!("Opened DTU server on {}", dtu.local_addr()?);
        info!("Opened MODBUS server on {}", modbus.local_addr()?);
        tokio::select! {
            res = accept_dtu_loop(&self.inner, dtu) => res,
            res = accept_modbus_loop(&self.inner, modbus) => res,
            () = shutdown_signal => {
                debug!("Shutdown signal received");
                Ok(())
            }
        }
    }
}

async fn accept_dtu_loop(inner: &Arc<Inner>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        debug!("New DTU connection from {peer_addr}");
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            if let Err(err) = accept_dtu(&inner, stream).await {
                error!("DTU connection error: {err}");
            }
        });
    }
}

async fn accept_modbus_loop(inner: &Arc<Inner>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        debug!("New MODBUS connection from {peer_addr}");
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            accept_modbus(&inner, stream).await;
        });
    }
}

/// Runs one DTU connection from accept to teardown. Rejected and
/// surplus connections are closed by dropping them, with zero bytes
/// written.
async fn accept_dtu(inner: &Arc<Inner>, stream: TcpStream) -> Result<()> {
    if inner.state.lock().await.dtu.is_some() {
        error!("Already have DTU connection");
        return Ok(());
    }

    let (mut reader, writer) = stream.into_split();
    let mut decrypt = Inbound::new(&inner.config)?;
    let encrypt = Outbound::new(&inner.config)?;

    if let Some(pattern) = &inner.code_pattern {
        let deadline = inner.config.code_timeout();
        match handshake::run(&mut reader, &mut decrypt, pattern, deadline).await {
            HandshakeOutcome::Promoted => {}
            HandshakeOutcome::Rejected => {
                warn!("DTU sent wrong code");
                return Ok(());
            }
            HandshakeOutcome::TimedOut => {
                warn!("DTU code timeout");
                return Ok(());
            }
        }
    }

    {
        let mut state = inner.state.lock().await;
        // A second attempt may have registered while this one was
        // still awaiting its code.
        if state.dtu.is_some() {
            error!("Already have DTU connection");
            return Ok(());
        }
        state.dtu = Some(DtuSlot { writer, encrypt });
    }
    info!("Successfully connected DTU");

    dtu_read_loop(inner, &mut reader, &mut decrypt).await;

    // Outstanding response deadlines keep running so the Modbus client
    // still gets a terminal response for an in-flight request.
    inner.state.lock().await.dtu = None;
    info!("DTU disconnected");
    Ok(())
}

/// Runs one Modbus client connection from accept to teardown.
async fn accept_modbus(inner: &Arc<Inner>, stream: TcpStream) {
    let (mut reader, writer) = stream.into_split();
    {
        let mut state = inner.state.lock().await;
        if state.modbus.is_some() {
            error!("Already have MODBUS connection");
            return;
        }
        state.modbus = Some(ModbusSlot { writer });
    }
    info!("Successfully connected MODBUS client");

    modbus_read_loop(inner, &mut reader).await;

    inner.state.lock().await.modbus = None;
    info!("MODBUS disconnected");
}

/// Forwards decrypted DTU chunks to the Modbus client. Every inbound
/// chunk counts as the answer to the outstanding request and disarms
/// the response deadline.
async fn dtu_read_loop(inner: &Inner, reader: &mut OwnedReadHalf, decrypt: &mut Inbound) {
    loop {
        let mut chunk = BytesMut::with_capacity(READ_CHUNK_CAPACITY);
        match reader.read_buf(&mut chunk).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!("DTU read error: {err}");
                break;
            }
        }
        decrypt.transform(&mut chunk);

        let mut state = inner.state.lock().await;
        if let Some(pending) = state.pending.take() {
            pending.disarm();
        }
        let Some(slot) = state.modbus.as_mut() else {
            warn!("DTU try to write, but no MODBUS connection available");
            continue;
        };
        if inner.config.debug {
            debug!("DTU -> MODBUS: {}", hex(&chunk));
        }
        if let Err(err) = slot.writer.write_all(&chunk).await {
            // The Modbus task observes the broken stream itself and
            // clears its own slot.
            warn!("MODBUS write error: {err}");
        }
    }
}

/// Forwards Modbus client chunks to the DTU through its encrypt stage,
/// arming the response deadline per forwarded request. With no DTU
/// paired, the exception response is synthesized right away.
async fn modbus_read_loop(inner: &Arc<Inner>, reader: &mut OwnedReadHalf) {
    loop {
        let mut chunk = BytesMut::with_capacity(READ_CHUNK_CAPACITY);
        match reader.read_buf(&mut chunk).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!("MODBUS read error: {err}");
                break;
            }
        }

        let mut state = inner.state.lock().await;
        if state.dtu.is_some() {
            forward_request(inner, &mut state, chunk).await;
        } else {
            warn!("MODBUS try to write, but no DTU connection available");
            synthesize_exception(&mut state, &chunk, inner.config.debug).await;
        }
    }
}

/// Encrypts and writes one request chunk to the paired DTU, then arms
/// the response deadline for it.
async fn forward_request(inner: &Arc<Inner>, state: &mut PairingState, mut chunk: BytesMut) {
    let Some(slot) = state.dtu.as_mut() else {
        return;
    };
    let request = chunk.clone().freeze();
    slot.encrypt.transform(&mut chunk);
    if inner.config.debug {
        debug!("MODBUS -> DTU: {}", hex(&chunk));
    }
    if let Err(err) = slot.writer.write_all(&chunk).await {
        warn!("DTU write error: {err}");
        return;
    }
    arm_response_deadline(inner, state, request);
}

/// Writes the synthetic exception for `request` to the Modbus client,
/// if one can be built and the client is still connected.
async fn synthesize_exception(state: &mut PairingState, request: &[u8], debug: bool) {
    let Some(response) = frame::exception_frame(request) else {
        warn!("Request too short to synthesize an exception response");
        return;
    };
    let Some(slot) = state.modbus.as_mut() else {
        return;
    };
    if debug {
        debug!("... -> MODBUS: {}", hex(&response));
    }
    if let Err(err) = slot.writer.write_all(&response).await {
        warn!("MODBUS write error: {err}");
    }
}

/// Arms the response deadline for a just-forwarded request. A newer
/// request supersedes the previous deadline; a DTU chunk disarms it.
/// The deadline outlives a DTU disconnect on purpose: the client is
/// still owed a terminal response.
fn arm_response_deadline(inner: &Arc<Inner>, state: &mut PairingState, request: Bytes) {
    if let Some(previous) = state.pending.take() {
        previous.disarm();
    }
    let deadline = inner.config.response_timeout();
    let inner = Arc::clone(inner);
    let timer = tokio::spawn(async move {
        sleep(deadline).await;
        let mut state = inner.state.lock().await;
        state.pending = None;
        warn!("DTU response timeout");
        synthesize_exception(&mut state, &request, inner.config.debug).await;
    });
    state.pending = Some(PendingRequest { timer });
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
