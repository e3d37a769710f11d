// SPDX-FileCopyrightText: Copyright (c) 2026 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP (MBAP) frame helpers.
//!
//! The gateway never interprets PDUs. It only needs to recognize the
//! MBAP header to trim cipher padding and to synthesize an exception
//! response from a request's header bytes.

use byteorder::{BigEndian, ByteOrder as _};
use bytes::{BufMut as _, Bytes, BytesMut};

/// MBAP header: transaction id, protocol id, length, unit id.
const HEADER_SIZE: usize = 7;

const PROTOCOL_ID: u16 = 0x0000;

/// High bit of the function code marks an exception response.
const EXCEPTION_FLAG: u8 = 0x80;

/// Exception code 0x0A: gateway target device failed to respond.
const GATEWAY_TARGET_FAILED_TO_RESPOND: u8 = 0x0A;

/// Declared total frame length; the MBAP length field counts the unit
/// id and the PDU, i.e. everything after the length field itself.
const LEN_FIELD_OFFSET: usize = 6;

/// Returns `true` iff `bytes` is exactly one well-formed Modbus TCP
/// frame: protocol id zero and declared length matching the input.
#[must_use]
pub fn is_modbus(bytes: &[u8]) -> bool {
    bytes.len() > HEADER_SIZE
        && BigEndian::read_u16(&bytes[2..4]) == PROTOCOL_ID
        && declared_len(bytes) == Some(bytes.len())
}

/// Total frame length declared by the MBAP header, or `None` if the
/// input is too short or not recognized as Modbus.
#[must_use]
pub fn declared_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < LEN_FIELD_OFFSET || BigEndian::read_u16(&bytes[2..4]) != PROTOCOL_ID {
        return None;
    }
    Some(LEN_FIELD_OFFSET + usize::from(BigEndian::read_u16(&bytes[4..6])))
}

/// Drops the zero padding a block cipher leaves after the declared end
/// of a Modbus frame. Payloads not recognized as Modbus (e.g. the raw
/// registration code) pass through untouched.
pub fn trim_to_declared_len(chunk: &mut BytesMut) {
    if let Some(len) = declared_len(chunk) {
        if len < chunk.len() {
            chunk.truncate(len);
        }
    }
}

/// Synthesizes the 9-byte `GatewayTargetDeviceFailedToRespond`
/// exception response for a request the DTU did not answer.
///
/// Copies transaction id, protocol id and unit id from the request,
/// sets the length field to 3 and the high bit of the function code.
/// Only the first 8 bytes of the request are inspected; `None` is
/// returned when fewer are available, since the unit id and function
/// code would be unknown.
#[must_use]
pub fn exception_frame(request: &[u8]) -> Option<Bytes> {
    if request.len() <= HEADER_SIZE {
        return None;
    }
    let mut frame = BytesMut::with_capacity(HEADER_SIZE + 2);
    frame.extend_from_slice(&request[..HEADER_SIZE]);
    BigEndian::write_u16(&mut frame[4..6], 0x0003);
    frame.put_u8(request[HEADER_SIZE] | EXCEPTION_FLAG);
    frame.put_u8(GATEWAY_TARGET_FAILED_TO_RESPOND);
    Some(frame.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: [u8; 12] = [
        0x00, 0x01, // transaction id
        0x00, 0x00, // protocol id
        0x00, 0x06, // length
        0x01, // unit id
        0x01, 0x20, 0x00, 0x00, 0x01, // PDU
    ];

    #[test]
    fn recognize_valid_frame() {
        assert!(is_modbus(&REQUEST));
    }

    #[test]
    fn reject_non_zero_protocol_id() {
        let mut frame = REQUEST;
        frame[2] = 0x33;
        assert!(!is_modbus(&frame));
    }

    #[test]
    fn reject_length_mismatch() {
        let mut frame = REQUEST.to_vec();
        frame.push(0x00);
        assert!(!is_modbus(&frame));
    }

    #[test]
    fn reject_header_fragment() {
        assert!(!is_modbus(&REQUEST[..7]));
        assert!(declared_len(&REQUEST[..5]).is_none());
    }

    #[test]
    fn declared_len_of_request() {
        assert_eq!(declared_len(&REQUEST), Some(12));
    }

    #[test]
    fn trim_cipher_padding() {
        let mut chunk = BytesMut::from(&REQUEST[..]);
        chunk.extend_from_slice(&[0x00; 4]);
        trim_to_declared_len(&mut chunk);
        assert_eq!(&chunk[..], &REQUEST);
    }

    #[test]
    fn trim_leaves_exact_frame_alone() {
        let mut chunk = BytesMut::from(&REQUEST[..]);
        trim_to_declared_len(&mut chunk);
        assert_eq!(&chunk[..], &REQUEST);
    }

    #[test]
    fn trim_passes_non_modbus_payload_through() {
        let payload = b"7CA5D4033591 random1\x00\x00\x00\x00";
        let mut chunk = BytesMut::from(&payload[..]);
        trim_to_declared_len(&mut chunk);
        assert_eq!(&chunk[..], &payload[..]);
    }

    #[test]
    fn exception_frame_is_bit_exact() {
        // Request 000100000006010120000001 => reply 00010000000301810a
        let frame = exception_frame(&REQUEST).unwrap();
        assert_eq!(
            &frame[..],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x81, 0x0A]
        );
    }

    #[test]
    fn exception_frame_ignores_pdu_tail() {
        // Only the bounded prefix matters, fragmented input is fine.
        assert_eq!(
            exception_frame(&REQUEST[..8]),
            exception_frame(&REQUEST)
        );
    }

    #[test]
    fn exception_frame_needs_eight_bytes() {
        assert!(exception_frame(&REQUEST[..7]).is_none());
        assert!(exception_frame(&[]).is_none());
    }
}
