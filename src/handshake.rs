// SPDX-FileCopyrightText: Copyright (c) 2026 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! DTU registration handshake.
//!
//! A freshly accepted DTU connection must present a registration code
//! matching the configured pattern before it is admitted to the
//! forwarding path. Exactly one payload unit (the first chunk read
//! from the socket) is consumed; every byte after it belongs to the
//! data path. The code is read through the connection's decrypt stage,
//! since an encrypting DTU encrypts from the very first byte.

use std::time::Duration;

use bytes::BytesMut;
use log::warn;
use regex::Regex;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _},
    time::timeout,
};

use crate::transform::Inbound;

/// Terminal state of a registration attempt.
///
/// The attempt starts in an implicit `AwaitingPayload` state while
/// [`run`] is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The first payload matched the pattern; the connection joins the
    /// forwarding path.
    Promoted,
    /// The first payload did not match (or the peer hung up first);
    /// the connection is closed without a response.
    Rejected,
    /// Nothing arrived before the deadline; the connection is closed.
    TimedOut,
}

/// Reads one payload unit from `reader`, decodes it through the
/// connection's decrypt stage and matches it against `pattern`.
pub(crate) async fn run<R>(
    reader: &mut R,
    decrypt: &mut Inbound,
    pattern: &Regex,
    deadline: Duration,
) -> HandshakeOutcome
where
    R: AsyncRead + Unpin,
{
    let mut payload = BytesMut::with_capacity(256);
    match timeout(deadline, reader.read_buf(&mut payload)).await {
        Err(_elapsed) => return HandshakeOutcome::TimedOut,
        Ok(Err(err)) => {
            warn!("DTU read error during registration: {err}");
            return HandshakeOutcome::Rejected;
        }
        Ok(Ok(0)) => return HandshakeOutcome::Rejected,
        Ok(Ok(_)) => {}
    }
    decrypt.transform(&mut payload);
    let code = String::from_utf8_lossy(&payload);
    if pattern.is_match(&code) {
        HandshakeOutcome::Promoted
    } else {
        HandshakeOutcome::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt as _;

    use crate::config::GatewayConfig;

    const PATTERN: &str = r"7CA5D4033591 \w+";
    const DEADLINE: Duration = Duration::from_millis(100);

    fn passthrough() -> Inbound {
        Inbound::new(&GatewayConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn matching_code_promotes() {
        let (mut local, mut remote) = tokio::io::duplex(64);
        remote.write_all(b"7CA5D4033591 random1").await.unwrap();
        let pattern = Regex::new(PATTERN).unwrap();
        let outcome = run(&mut local, &mut passthrough(), &pattern, DEADLINE).await;
        assert_eq!(outcome, HandshakeOutcome::Promoted);
    }

    #[tokio::test]
    async fn wrong_code_rejects() {
        let (mut local, mut remote) = tokio::io::duplex(64);
        remote.write_all(b"not a registration code").await.unwrap();
        let pattern = Regex::new(PATTERN).unwrap();
        let outcome = run(&mut local, &mut passthrough(), &pattern, DEADLINE).await;
        assert_eq!(outcome, HandshakeOutcome::Rejected);
    }

    #[tokio::test]
    async fn closed_peer_rejects() {
        let (mut local, remote) = tokio::io::duplex(64);
        drop(remote);
        let pattern = Regex::new(PATTERN).unwrap();
        let outcome = run(&mut local, &mut passthrough(), &pattern, DEADLINE).await;
        assert_eq!(outcome, HandshakeOutcome::Rejected);
    }

    #[tokio::test]
    async fn silence_times_out() {
        let (mut local, _remote) = tokio::io::duplex(64);
        let pattern = Regex::new(PATTERN).unwrap();
        let outcome = run(&mut local, &mut passthrough(), &pattern, DEADLINE).await;
        assert_eq!(outcome, HandshakeOutcome::TimedOut);
    }
}
