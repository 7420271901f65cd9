//! Framing: 1-byte opcode + 4-byte big-endian length + payload.
//! Endpoints travel as 4 address bytes followed by a 2-byte big-endian port.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::protocol::{Op, STATUS_REDIRECT};

/// Opcode byte plus big-endian payload length.
pub const HEADER_LEN: usize = 5;
/// IPv4 address bytes on the wire.
pub const ADDRESS_LEN: usize = 4;
/// Address plus port.
pub const ENDPOINT_LEN: usize = ADDRESS_LEN + 2;
/// Largest payload a peer may declare.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024; // 64 MiB

/// Decoded frame header. The opcode stays raw so the caller decides how to treat unknown values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub op: u8,
    pub len: u32,
}

pub fn encode_header(op: Op, len: u32) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0] = op.as_byte();
    out[1..].copy_from_slice(&len.to_be_bytes());
    out
}

/// Encode a whole frame into one buffer.
pub fn encode_frame(op: Op, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&encode_header(op, len));
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Decode a header from the front of `bytes`. Returns `NeedMore` until 5 bytes are present.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok(FrameHeader { op: bytes[0], len })
}

/// Error decoding a frame header.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
}

pub fn encode_endpoint(endpoint: SocketAddrV4) -> [u8; ENDPOINT_LEN] {
    let mut out = [0u8; ENDPOINT_LEN];
    out[..ADDRESS_LEN].copy_from_slice(&endpoint.ip().octets());
    out[ADDRESS_LEN..].copy_from_slice(&endpoint.port().to_be_bytes());
    out
}

/// Parse an endpoint from the first 6 bytes of `bytes`.
pub fn decode_endpoint(bytes: &[u8]) -> Result<SocketAddrV4, EndpointError> {
    if bytes.len() < ENDPOINT_LEN {
        return Err(EndpointError::Truncated {
            expected: ENDPOINT_LEN,
            actual: bytes.len(),
        });
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Redirect response sent instead of acceptance: status, address length, address, port.
/// The length byte counts address bytes only; the port always trails as 2 bytes.
pub fn encode_redirect(target: SocketAddrV4) -> [u8; 2 + ENDPOINT_LEN] {
    let mut out = [0u8; 2 + ENDPOINT_LEN];
    out[0] = STATUS_REDIRECT;
    out[1] = ADDRESS_LEN as u8;
    out[2..].copy_from_slice(&encode_endpoint(target));
    out
}

/// Validate the address length byte of a redirect response.
pub fn check_redirect_address_len(len: u8) -> Result<(), EndpointError> {
    if len as usize != ADDRESS_LEN {
        return Err(EndpointError::UnsupportedAddressLength(len));
    }
    Ok(())
}

/// Error parsing an endpoint or redirect.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unsupported address length {0} (only IPv4 is carried)")]
    UnsupportedAddressLength(u8),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_is_big_endian() {
        assert_eq!(encode_header(Op::Code, 0x0102_0304), [2, 1, 2, 3, 4]);
        let header = decode_header(&[255, 0, 0, 1, 0]).unwrap();
        assert_eq!(header, FrameHeader { op: 255, len: 256 });
    }

    #[test]
    fn partial_header_need_more() {
        let frame = encode_frame(Op::Invoke, &[]).unwrap();
        assert_eq!(frame.len(), HEADER_LEN);
        for cut in 0..HEADER_LEN {
            assert_eq!(decode_header(&frame[..cut]), Err(FrameDecodeError::NeedMore));
        }
    }

    #[test]
    fn frame_carries_payload() {
        let frame = encode_frame(Op::Okay, b"sha256:00").unwrap();
        let header = decode_header(&frame).unwrap();
        assert_eq!(header.op, Op::Okay.as_byte());
        assert_eq!(header.len as usize, 9);
        assert_eq!(&frame[HEADER_LEN..], b"sha256:00");
    }

    #[test]
    fn redirect_layout() {
        let target = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 6974);
        let bytes = encode_redirect(target);
        assert_eq!(bytes, [0, 4, 10, 0, 0, 7, 0x1b, 0x3e]);
        assert!(check_redirect_address_len(bytes[1]).is_ok());
        assert_eq!(decode_endpoint(&bytes[2..]).unwrap(), target);
    }

    #[test]
    fn ipv6_length_rejected() {
        assert_eq!(
            check_redirect_address_len(16),
            Err(EndpointError::UnsupportedAddressLength(16))
        );
    }

    #[test]
    fn short_endpoint_rejected() {
        assert_eq!(
            decode_endpoint(&[127, 0, 0, 1, 0]),
            Err(EndpointError::Truncated {
                expected: 6,
                actual: 5
            })
        );
    }

    proptest! {
        #[test]
        fn endpoint_roundtrip(octets in any::<[u8; 4]>(), port in any::<u16>()) {
            let endpoint = SocketAddrV4::new(Ipv4Addr::from(octets), port);
            prop_assert_eq!(decode_endpoint(&encode_endpoint(endpoint)).unwrap(), endpoint);
        }
    }
}
