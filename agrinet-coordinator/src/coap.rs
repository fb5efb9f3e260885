// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Minimal CoAP (RFC 7252) message codec
//!
//! Covers what the wide-area session needs: confirmable observe
//! registrations, non-confirmable PUTs and parsing of notifications.
//!
//! ```text
//!  0                   1                   2                   3
//!  |Ver| T |  TKL  |      Code     |          Message ID           |
//!  |   Token (0-8 bytes) ...  |  Options ...  | 0xFF |  Payload ...
//! ```

use thiserror::Error;

/// CoAP version carried in every header
pub const COAP_VERSION: u8 = 1;
/// Default CoAP UDP port
pub const COAP_PORT: u16 = 5683;
/// Observe option number
pub const OPTION_OBSERVE: u16 = 6;
/// Uri-Path option number
pub const OPTION_URI_PATH: u16 = 11;

const PAYLOAD_MARKER: u8 = 0xFF;
const MAX_TOKEN_LEN: usize = 8;

/// CoAP codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoapError {
    /// Datagram shorter than its header or an option
    #[error("CoAP message truncated")]
    Truncated,

    /// Unsupported protocol version
    #[error("Unsupported CoAP version {0}")]
    BadVersion(u8),

    /// Token length above 8
    #[error("Invalid token length {0}")]
    BadTokenLength(u8),

    /// Reserved option delta or length nibble
    #[error("Malformed option")]
    BadOption,

    /// Payload marker with nothing after it
    #[error("Payload marker without payload")]
    EmptyPayload,
}

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoapType {
    /// Confirmable
    Confirmable = 0,
    /// Non-confirmable
    NonConfirmable = 1,
    /// Acknowledgement
    Acknowledgement = 2,
    /// Reset
    Reset = 3,
}

impl CoapType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => CoapType::Confirmable,
            1 => CoapType::NonConfirmable,
            2 => CoapType::Acknowledgement,
            _ => CoapType::Reset,
        }
    }
}

/// Request method or response code (`class.detail`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoapCode(pub u8);

impl CoapCode {
    /// 0.00
    pub const EMPTY: CoapCode = CoapCode(0x00);
    /// 0.01
    pub const GET: CoapCode = CoapCode(0x01);
    /// 0.02
    pub const POST: CoapCode = CoapCode(0x02);
    /// 0.03
    pub const PUT: CoapCode = CoapCode(0x03);
    /// 2.04
    pub const CHANGED: CoapCode = CoapCode(0x44);
    /// 2.05
    pub const CONTENT: CoapCode = CoapCode(0x45);

    /// Code class (0 request, 2 success, 4/5 errors)
    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    /// Code detail
    pub fn detail(&self) -> u8 {
        self.0 & 0x1F
    }
}

/// One option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// Option number
    pub number: u16,
    /// Raw value
    pub value: Vec<u8>,
}

/// A CoAP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapPacket {
    /// Message type
    pub kind: CoapType,
    /// Method or response code
    pub code: CoapCode,
    /// Message id
    pub message_id: u16,
    /// Token, 0-8 bytes
    pub token: Vec<u8>,
    /// Options, in any order
    pub options: Vec<CoapOption>,
    /// Payload
    pub payload: Vec<u8>,
}

impl CoapPacket {
    /// Confirmable GET registering an observation on `resource`
    pub fn observe_request(resource: &str, token: &[u8], message_id: u16) -> Self {
        let mut packet = Self::request(CoapType::Confirmable, CoapCode::GET, resource, token, message_id);
        packet.options.insert(
            0,
            CoapOption {
                number: OPTION_OBSERVE,
                value: Vec::new(),
            },
        );
        packet
    }

    /// Non-confirmable PUT of `payload` to `resource`
    pub fn put_request(resource: &str, token: &[u8], message_id: u16, payload: Vec<u8>) -> Self {
        let mut packet =
            Self::request(CoapType::NonConfirmable, CoapCode::PUT, resource, token, message_id);
        packet.payload = payload;
        packet
    }

    fn request(kind: CoapType, code: CoapCode, resource: &str, token: &[u8], message_id: u16) -> Self {
        let options = resource
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|segment| CoapOption {
                number: OPTION_URI_PATH,
                value: segment.as_bytes().to_vec(),
            })
            .collect();
        Self {
            kind,
            code,
            message_id,
            token: token[..token.len().min(MAX_TOKEN_LEN)].to_vec(),
            options,
            payload: Vec::new(),
        }
    }

    /// Joined Uri-Path options
    pub fn uri_path(&self) -> String {
        self.options
            .iter()
            .filter(|o| o.number == OPTION_URI_PATH)
            .map(|o| String::from_utf8_lossy(&o.value).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Value of the Observe option, if present
    pub fn observe(&self) -> Option<u32> {
        self.options
            .iter()
            .find(|o| o.number == OPTION_OBSERVE)
            .map(|o| o.value.iter().take(4).fold(0u32, |acc, b| (acc << 8) | *b as u32))
    }

    /// Serialize to a datagram
    pub fn to_bytes(&self) -> Vec<u8> {
        let token_len = self.token.len().min(MAX_TOKEN_LEN);
        let mut out = Vec::with_capacity(4 + token_len + self.payload.len() + 16);
        out.push((COAP_VERSION << 6) | ((self.kind as u8) << 4) | token_len as u8);
        out.push(self.code.0);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token[..token_len]);

        let mut options: Vec<&CoapOption> = self.options.iter().collect();
        options.sort_by_key(|o| o.number);
        let mut previous = 0u16;
        for option in options {
            let delta = option.number - previous;
            previous = option.number;
            let (delta_nibble, delta_ext) = split_extended(delta as usize);
            let (len_nibble, len_ext) = split_extended(option.value.len());
            out.push((delta_nibble << 4) | len_nibble);
            out.extend_from_slice(&delta_ext);
            out.extend_from_slice(&len_ext);
            out.extend_from_slice(&option.value);
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }
        out
    }

    /// Parse a datagram
    pub fn parse(data: &[u8]) -> Result<Self, CoapError> {
        if data.len() < 4 {
            return Err(CoapError::Truncated);
        }
        let version = data[0] >> 6;
        if version != COAP_VERSION {
            return Err(CoapError::BadVersion(version));
        }
        let token_len = data[0] & 0x0F;
        if token_len as usize > MAX_TOKEN_LEN {
            return Err(CoapError::BadTokenLength(token_len));
        }
        let kind = CoapType::from_bits(data[0] >> 4);
        let code = CoapCode(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        let mut pos = 4;
        let token = data
            .get(pos..pos + token_len as usize)
            .ok_or(CoapError::Truncated)?
            .to_vec();
        pos += token_len as usize;

        let mut options = Vec::new();
        let mut number = 0u16;
        let mut payload = Vec::new();
        while pos < data.len() {
            let byte = data[pos];
            pos += 1;
            if byte == PAYLOAD_MARKER {
                if pos == data.len() {
                    return Err(CoapError::EmptyPayload);
                }
                payload = data[pos..].to_vec();
                break;
            }
            let delta = read_extended(byte >> 4, data, &mut pos)?;
            let length = read_extended(byte & 0x0F, data, &mut pos)?;
            number = number
                .checked_add(u16::try_from(delta).map_err(|_| CoapError::BadOption)?)
                .ok_or(CoapError::BadOption)?;
            let value = data.get(pos..pos + length).ok_or(CoapError::Truncated)?;
            pos += length;
            options.push(CoapOption {
                number,
                value: value.to_vec(),
            });
        }

        Ok(Self {
            kind,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

fn split_extended(value: usize) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269) as u16).to_be_bytes().to_vec())
    }
}

fn read_extended(nibble: u8, data: &[u8], pos: &mut usize) -> Result<usize, CoapError> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let b = *data.get(*pos).ok_or(CoapError::Truncated)?;
            *pos += 1;
            Ok(b as usize + 13)
        }
        14 => {
            let bytes = data.get(*pos..*pos + 2).ok_or(CoapError::Truncated)?;
            *pos += 2;
            Ok(u16::from_be_bytes([bytes[0], bytes[1]]) as usize + 269)
        }
        _ => Err(CoapError::BadOption),
    }
}
