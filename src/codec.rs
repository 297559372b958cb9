//! CI SysEx codec: 7-bit packing, frame parsing/building, and the
//! Property Exchange envelope (header + body, chunked).
//!
//! Every frame on the wire begins `F0 7E <dev> 0D <type> <ver>`, carries
//! source and destination MUID as 4x7-bit bytes, a type-specific payload,
//! and ends `F7`. `parse` never panics: bad framing, truncation, or an
//! unrecognized sub-id #2 all come back as `None`, mirroring the contract
//! that a Responder must never crash on a malformed inbound frame.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::identity::{CategorySupport, DeviceIdentity, ManufacturerId};
use crate::muid::Muid;

pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;
pub const UNIVERSAL_SUB_ID: u8 = 0x7E;
pub const MIDI_CI_SUB_ID: u8 = 0x0D;

/// sub-id #2: which CI message this frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CiMessageType {
    DiscoveryInquiry,
    DiscoveryReply,
    InvalidateMuid,
    Nak,
    PeCapabilityInquiry,
    PeCapabilityReply,
    PeGetInquiry,
    PeGetReply,
    PeSetInquiry,
    PeSetReply,
    PeSubscribeInquiry,
    PeSubscribeReply,
    PeNotify,
}

impl CiMessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use CiMessageType::*;
        match v {
            0x70 => Some(DiscoveryInquiry),
            0x71 => Some(DiscoveryReply),
            0x7E => Some(InvalidateMuid),
            0x7F => Some(Nak),
            0x34 => Some(PeCapabilityInquiry),
            0x35 => Some(PeCapabilityReply),
            0x36 => Some(PeGetInquiry),
            0x37 => Some(PeGetReply),
            0x38 => Some(PeSetInquiry),
            0x39 => Some(PeSetReply),
            0x3A => Some(PeSubscribeInquiry),
            0x3B => Some(PeSubscribeReply),
            0x3F => Some(PeNotify),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        use CiMessageType::*;
        match self {
            DiscoveryInquiry => 0x70,
            DiscoveryReply => 0x71,
            InvalidateMuid => 0x7E,
            Nak => 0x7F,
            PeCapabilityInquiry => 0x34,
            PeCapabilityReply => 0x35,
            PeGetInquiry => 0x36,
            PeGetReply => 0x37,
            PeSetInquiry => 0x38,
            PeSetReply => 0x39,
            PeSubscribeInquiry => 0x3A,
            PeSubscribeReply => 0x3B,
            PeNotify => 0x3F,
        }
    }

    pub fn is_pe_request(self) -> bool {
        matches!(
            self,
            CiMessageType::PeGetInquiry | CiMessageType::PeSetInquiry | CiMessageType::PeSubscribeInquiry
        )
    }
}

/// A fully-framed, parsed CI message. `payload` is everything between the
/// destination MUID and the trailing `F7`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiMessage {
    pub message_type: CiMessageType,
    pub device_id: u8,
    pub version: u8,
    pub source: Muid,
    pub destination: Muid,
    pub payload: Vec<u8>,
}

/// Result of the cheap top-level parse: framing + routing fields, with a
/// cursor into `bytes` for specialized parsers to resume from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub message_type: CiMessageType,
    pub device_id: u8,
    pub version: u8,
    pub source: Muid,
    pub destination: Muid,
    pub remainder_start: usize,
}

/// Parses the common CI framing. Returns `None` on bad framing, truncation,
/// or an unrecognized message type — never panics.
pub fn parse(bytes: &[u8]) -> Option<ParsedHeader> {
    if bytes.len() < 13 {
        return None;
    }
    if bytes[0] != SYSEX_START || bytes[1] != UNIVERSAL_SUB_ID {
        return None;
    }
    if bytes[3] != MIDI_CI_SUB_ID {
        return None;
    }
    if *bytes.last()? != SYSEX_END {
        return None;
    }
    let device_id = bytes[2];
    let message_type = CiMessageType::from_u8(bytes[4])?;
    let version = bytes[5];
    let source = Muid::from_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    let destination = Muid::from_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
    Some(ParsedHeader {
        message_type,
        device_id,
        version,
        source,
        destination,
        remainder_start: 14,
    })
}

/// Parses a complete message, payload included.
pub fn parse_message(bytes: &[u8]) -> Option<CiMessage> {
    let header = parse(bytes)?;
    let payload = bytes.get(header.remainder_start..bytes.len() - 1)?.to_vec();
    Some(CiMessage {
        message_type: header.message_type,
        device_id: header.device_id,
        version: header.version,
        source: header.source,
        destination: header.destination,
        payload,
    })
}

fn build_common(
    device_id: u8,
    message_type: CiMessageType,
    version: u8,
    source: Muid,
    destination: Muid,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + payload.len() + 1);
    out.push(SYSEX_START);
    out.push(UNIVERSAL_SUB_ID);
    out.push(device_id);
    out.push(MIDI_CI_SUB_ID);
    out.push(message_type.to_u8());
    out.push(version);
    out.extend_from_slice(&source.to_bytes());
    out.extend_from_slice(&destination.to_bytes());
    out.extend_from_slice(payload);
    out.push(SYSEX_END);
    out
}

/// Packs 7-bit-clean data for the wire: every 7 source bytes become 8 output
/// bytes, with a leading byte whose bits carry the high bit of each of the
/// following 7 bytes (the standard MIDI packed-data scheme).
pub fn encode7bit(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 7 + 1);
    for chunk in data.chunks(7) {
        let mut msb_byte = 0u8;
        for (i, b) in chunk.iter().enumerate() {
            if b & 0x80 != 0 {
                msb_byte |= 1 << i;
            }
        }
        out.push(msb_byte);
        for b in chunk {
            out.push(b & 0x7F);
        }
    }
    out
}

/// Inverse of [`encode7bit`]. Malformed input (wrong group sizes) is
/// tolerated best-effort rather than panicking.
pub fn decode7bit(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for group in data.chunks(8) {
        let msb_byte = group[0];
        for (i, b) in group[1..].iter().enumerate() {
            let mut byte = *b;
            if msb_byte & (1 << i) != 0 {
                byte |= 0x80;
            }
            out.push(byte);
        }
    }
    out
}

/// Encodes a length-like integer as LSB-first 7-bit bytes, using just
/// enough bytes to hold `width` groups of 7 bits (3 bytes comfortably
/// covers the 65 535-chunk ceiling the envelope format allows for).
fn encode_7bit_int(value: u32, width: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(width);
    let mut v = value;
    for _ in 0..width {
        out.push((v & 0x7F) as u8);
        v >>= 7;
    }
    out
}

fn decode_7bit_int(bytes: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as u32 & 0x7F) << (7 * i as u32);
    }
    value
}

/// PE header fields. Every field the responder or initiator might set is
/// optional; anything else a resource handler wants to stash rides along in
/// `extra` rather than requiring a schema change here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PeHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(rename = "resId", skip_serializing_if = "Option::is_none")]
    pub res_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(rename = "totalCount", skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u32>,
    #[serde(rename = "mutualEncoding", skip_serializing_if = "Option::is_none")]
    pub mutual_encoding: Option<String>,
    #[serde(rename = "subscribeId", skip_serializing_if = "Option::is_none")]
    pub subscribe_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl PeHeader {
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_offset_limit(mut self, offset: u32, limit: u32) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    pub fn with_total_count(mut self, total: u32) -> Self {
        self.total_count = Some(total);
        self
    }

    pub fn with_subscribe_id(mut self, subscribe_id: impl Into<String>) -> Self {
        self.subscribe_id = Some(subscribe_id.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec())
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(bytes).map_err(|e| CodecError::InvalidUtf8(e.to_string()))?;
        serde_json::from_str(text).map_err(|e| CodecError::InvalidHeaderJson(e.to_string()))
    }
}

pub fn success_response_header() -> PeHeader {
    PeHeader::default().with_status(200)
}

pub fn error_response_header(status: u16, message: impl Into<String>) -> PeHeader {
    PeHeader::default().with_status(status).with_message(message)
}

pub fn notify_header(subscribe_id: impl Into<String>, resource: impl Into<String>) -> PeHeader {
    PeHeader::default()
        .with_subscribe_id(subscribe_id)
        .with_resource(resource)
}

pub fn subscribe_response_header(status: u16, subscribe_id: impl Into<String>) -> PeHeader {
    PeHeader::default().with_status(status).with_subscribe_id(subscribe_id)
}

/// One reassembled (or single-chunk) PE envelope, decoded but not yet
/// interpreted by message-type-specific parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct PeEnvelope {
    pub request_id: u8,
    pub header: PeHeader,
    pub body: Vec<u8>,
}

const CHUNK_COUNT_WIDTH: usize = 3;
const HEADER_LEN_WIDTH: usize = 2;
const BODY_LEN_WIDTH: usize = 3;

/// Builds the chunk-count-prefixed payload body for a single PE chunk.
/// `num_chunks`/`chunk_index` are both 1-based, matching the convention that
/// a single-chunk envelope reports `num_chunks = chunk_index = 1`.
fn build_pe_chunk_payload(
    request_id: u8,
    num_chunks: u16,
    chunk_index: u16,
    header_bytes: &[u8],
    body_bytes: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(request_id & 0x7F);
    out.extend(encode_7bit_int(num_chunks as u32, CHUNK_COUNT_WIDTH));
    out.extend(encode_7bit_int(chunk_index as u32, CHUNK_COUNT_WIDTH));
    let packed_header = encode7bit(header_bytes);
    out.extend(encode_7bit_int(packed_header.len() as u32, HEADER_LEN_WIDTH));
    out.extend(&packed_header);
    let packed_body = encode7bit(body_bytes);
    out.extend(encode_7bit_int(packed_body.len() as u32, BODY_LEN_WIDTH));
    out.extend(&packed_body);
    out
}

struct ParsedChunk {
    request_id: u8,
    num_chunks: u16,
    chunk_index: u16,
    header_bytes: Vec<u8>,
    body_bytes: Vec<u8>,
}

fn parse_pe_chunk_payload(payload: &[u8]) -> Option<ParsedChunk> {
    let mut cursor = 0usize;
    let request_id = *payload.get(cursor)?;
    cursor += 1;

    let num_chunks = decode_7bit_int(payload.get(cursor..cursor + CHUNK_COUNT_WIDTH)?) as u16;
    cursor += CHUNK_COUNT_WIDTH;
    let chunk_index = decode_7bit_int(payload.get(cursor..cursor + CHUNK_COUNT_WIDTH)?) as u16;
    cursor += CHUNK_COUNT_WIDTH;

    let header_len = decode_7bit_int(payload.get(cursor..cursor + HEADER_LEN_WIDTH)?) as usize;
    cursor += HEADER_LEN_WIDTH;
    let packed_header = payload.get(cursor..cursor + header_len)?;
    cursor += header_len;
    let header_bytes = decode7bit(packed_header);

    let body_len = decode_7bit_int(payload.get(cursor..cursor + BODY_LEN_WIDTH)?) as usize;
    cursor += BODY_LEN_WIDTH;
    let packed_body = payload.get(cursor..cursor + body_len)?;
    let body_bytes = decode7bit(packed_body);

    Some(ParsedChunk {
        request_id,
        num_chunks,
        chunk_index,
        header_bytes,
        body_bytes,
    })
}

/// Accumulates multi-chunk PE envelopes keyed by (source MUID, request ID).
/// A single-chunk envelope resolves immediately without ever touching the
/// map.
#[derive(Debug, Default)]
pub struct ChunkReassembler {
    pending: HashMap<(Muid, u8), PartialEnvelope>,
}

#[derive(Debug)]
struct PartialEnvelope {
    num_chunks: u16,
    header_bytes: Vec<u8>,
    body_bytes: Vec<u8>,
    seen: u16,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk's raw PE payload bytes. Returns `Some(envelope)` once
    /// the last chunk for that (source, request id) has arrived.
    pub fn push(&mut self, source: Muid, payload: &[u8]) -> Option<PeEnvelope> {
        let parsed = parse_pe_chunk_payload(payload)?;
        if parsed.num_chunks <= 1 {
            let header = PeHeader::from_json_bytes(&parsed.header_bytes).ok()?;
            return Some(PeEnvelope {
                request_id: parsed.request_id,
                header,
                body: parsed.body_bytes,
            });
        }

        let key = (source, parsed.request_id);
        let entry = self.pending.entry(key).or_insert_with(|| PartialEnvelope {
            num_chunks: parsed.num_chunks,
            header_bytes: Vec::new(),
            body_bytes: Vec::new(),
            seen: 0,
        });
        entry.header_bytes.extend_from_slice(&parsed.header_bytes);
        entry.body_bytes.extend_from_slice(&parsed.body_bytes);
        entry.seen += 1;

        if entry.seen >= entry.num_chunks {
            let entry = self.pending.remove(&key).unwrap();
            let header = PeHeader::from_json_bytes(&entry.header_bytes).ok()?;
            Some(PeEnvelope {
                request_id: parsed.request_id,
                header,
                body: entry.body_bytes,
            })
        } else {
            None
        }
    }

    /// Discards any in-flight reassembly state for `(source, request_id)`,
    /// used when a pending request times out so late-arriving chunks don't
    /// leak memory.
    pub fn discard(&mut self, source: Muid, request_id: u8) {
        self.pending.remove(&(source, request_id));
    }
}

// ---- message builders -----------------------------------------------------

pub fn discovery_inquiry(
    device_id: u8,
    source: Muid,
    identity: &DeviceIdentity,
    category_support: CategorySupport,
    max_sysex: u32,
    output_path: u8,
) -> Vec<u8> {
    let mut payload = identity.manufacturer().to_bytes();
    payload.push((identity.family() & 0x7F) as u8);
    payload.push(((identity.family() >> 7) & 0x7F) as u8);
    payload.push((identity.model() & 0x7F) as u8);
    payload.push(((identity.model() >> 7) & 0x7F) as u8);
    payload.extend(encode_7bit_int(identity.version(), 4));
    payload.push(category_support.bits());
    payload.extend(encode_7bit_int(max_sysex, 4));
    payload.push(output_path & 0x7F);
    build_common(
        device_id,
        CiMessageType::DiscoveryInquiry,
        0x02,
        source,
        Muid::BROADCAST,
        &payload,
    )
}

pub fn discovery_reply(
    device_id: u8,
    source: Muid,
    destination: Muid,
    identity: &DeviceIdentity,
    category_support: CategorySupport,
    max_sysex: u32,
    output_path: u8,
    function_block: u8,
) -> Vec<u8> {
    let mut payload = identity.manufacturer().to_bytes();
    payload.push((identity.family() & 0x7F) as u8);
    payload.push(((identity.family() >> 7) & 0x7F) as u8);
    payload.push((identity.model() & 0x7F) as u8);
    payload.push(((identity.model() >> 7) & 0x7F) as u8);
    payload.extend(encode_7bit_int(identity.version(), 4));
    payload.push(category_support.bits());
    payload.extend(encode_7bit_int(max_sysex, 4));
    payload.push(output_path & 0x7F);
    payload.push(function_block & 0x7F);
    build_common(
        device_id,
        CiMessageType::DiscoveryReply,
        0x02,
        source,
        destination,
        &payload,
    )
}

/// Parsed Discovery Reply payload, enough to populate a `DiscoveredDevice`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryReplyInfo {
    pub source: Muid,
    pub identity: DeviceIdentity,
    pub category_support: CategorySupport,
    pub max_sysex: u32,
    pub output_path: u8,
    pub function_block: u8,
}

pub fn parse_discovery_reply(bytes: &[u8]) -> Option<DiscoveryReplyInfo> {
    let header = parse(bytes)?;
    if header.message_type != CiMessageType::DiscoveryReply {
        return None;
    }
    let payload = bytes.get(header.remainder_start..bytes.len() - 1)?;
    let (manufacturer, mut cursor) = ManufacturerId::parse(payload)?;
    let family = (*payload.get(cursor)? as u16) | ((*payload.get(cursor + 1)? as u16) << 7);
    cursor += 2;
    let model = (*payload.get(cursor)? as u16) | ((*payload.get(cursor + 1)? as u16) << 7);
    cursor += 2;
    let version = decode_7bit_int(payload.get(cursor..cursor + 4)?);
    cursor += 4;
    let category_support = CategorySupport::from_bits(*payload.get(cursor)?);
    cursor += 1;
    let max_sysex = decode_7bit_int(payload.get(cursor..cursor + 4)?);
    cursor += 4;
    let output_path = *payload.get(cursor)?;
    cursor += 1;
    let function_block = *payload.get(cursor)?;

    Some(DiscoveryReplyInfo {
        source: header.source,
        identity: DeviceIdentity::new(manufacturer, family, model, version),
        category_support,
        max_sysex,
        output_path,
        function_block,
    })
}

pub fn invalidate_muid(device_id: u8, source: Muid, target: Muid) -> Vec<u8> {
    build_common(
        device_id,
        CiMessageType::InvalidateMuid,
        0x02,
        source,
        Muid::BROADCAST,
        &target.to_bytes(),
    )
}

pub fn pe_capability_reply(
    device_id: u8,
    source: Muid,
    destination: Muid,
    max_simultaneous: u8,
    major: u8,
    minor: u8,
) -> Vec<u8> {
    let payload = vec![max_simultaneous & 0x7F, major & 0x7F, minor & 0x7F];
    build_common(
        device_id,
        CiMessageType::PeCapabilityReply,
        0x02,
        source,
        destination,
        &payload,
    )
}

fn build_pe_message(
    device_id: u8,
    message_type: CiMessageType,
    source: Muid,
    destination: Muid,
    request_id: u8,
    header: &PeHeader,
    body: &[u8],
) -> Vec<u8> {
    let header_bytes = header.to_json_bytes();
    let payload = build_pe_chunk_payload(request_id, 1, 1, &header_bytes, body);
    build_common(device_id, message_type, 0x02, source, destination, &payload)
}

pub fn pe_get_inquiry(device_id: u8, source: Muid, destination: Muid, request_id: u8, header: &PeHeader) -> Vec<u8> {
    build_pe_message(device_id, CiMessageType::PeGetInquiry, source, destination, request_id, header, &[])
}

pub fn pe_get_reply(
    device_id: u8,
    source: Muid,
    destination: Muid,
    request_id: u8,
    header: &PeHeader,
    body: &[u8],
) -> Vec<u8> {
    build_pe_message(device_id, CiMessageType::PeGetReply, source, destination, request_id, header, body)
}

pub fn pe_set_inquiry(
    device_id: u8,
    source: Muid,
    destination: Muid,
    request_id: u8,
    header: &PeHeader,
    body: &[u8],
) -> Vec<u8> {
    build_pe_message(device_id, CiMessageType::PeSetInquiry, source, destination, request_id, header, body)
}

pub fn pe_set_reply(device_id: u8, source: Muid, destination: Muid, request_id: u8, header: &PeHeader) -> Vec<u8> {
    build_pe_message(device_id, CiMessageType::PeSetReply, source, destination, request_id, header, &[])
}

pub fn pe_subscribe_inquiry(
    device_id: u8,
    source: Muid,
    destination: Muid,
    request_id: u8,
    header: &PeHeader,
) -> Vec<u8> {
    build_pe_message(
        device_id,
        CiMessageType::PeSubscribeInquiry,
        source,
        destination,
        request_id,
        header,
        &[],
    )
}

pub fn pe_subscribe_reply(device_id: u8, source: Muid, destination: Muid, request_id: u8, header: &PeHeader) -> Vec<u8> {
    build_pe_message(
        device_id,
        CiMessageType::PeSubscribeReply,
        source,
        destination,
        request_id,
        header,
        &[],
    )
}

pub fn pe_notify(
    device_id: u8,
    source: Muid,
    destination: Muid,
    request_id: u8,
    header: &PeHeader,
    body: &[u8],
) -> Vec<u8> {
    build_pe_message(device_id, CiMessageType::PeNotify, source, destination, request_id, header, body)
}

/// A fully-typed PE GET/SET/Subscribe inquiry, extracted from a parsed
/// envelope plus its resource name (pulled out of the header JSON).
#[derive(Debug, Clone, PartialEq)]
pub struct PeInquiry {
    pub source: Muid,
    pub request_id: u8,
    pub header: PeHeader,
    pub body: Vec<u8>,
    pub resource: Option<String>,
}

fn parse_full_inquiry(bytes: &[u8], expected: CiMessageType, reassembler: &mut ChunkReassembler) -> Option<PeInquiry> {
    let parsed = parse_message(bytes)?;
    if parsed.message_type != expected {
        return None;
    }
    let envelope = reassembler.push(parsed.source, &parsed.payload)?;
    let resource = envelope.header.resource.clone();
    Some(PeInquiry {
        source: parsed.source,
        request_id: envelope.request_id,
        header: envelope.header,
        body: envelope.body,
        resource,
    })
}

pub fn parse_full_pe_get_inquiry(bytes: &[u8], reassembler: &mut ChunkReassembler) -> Option<PeInquiry> {
    parse_full_inquiry(bytes, CiMessageType::PeGetInquiry, reassembler)
}

pub fn parse_full_pe_set_inquiry(bytes: &[u8], reassembler: &mut ChunkReassembler) -> Option<PeInquiry> {
    parse_full_inquiry(bytes, CiMessageType::PeSetInquiry, reassembler)
}

pub fn parse_full_pe_subscribe_inquiry(bytes: &[u8], reassembler: &mut ChunkReassembler) -> Option<PeInquiry> {
    parse_full_inquiry(bytes, CiMessageType::PeSubscribeInquiry, reassembler)
}

pub fn parse_full_pe_reply(bytes: &[u8], reassembler: &mut ChunkReassembler) -> Option<PeEnvelope> {
    let parsed = parse_message(bytes)?;
    if !matches!(
        parsed.message_type,
        CiMessageType::PeGetReply | CiMessageType::PeSetReply | CiMessageType::PeSubscribeReply | CiMessageType::PeNotify
    ) {
        return None;
    }
    reassembler.push(parsed.source, &parsed.payload)
}

/// Inspects sub-id #2 to tag a frame with a human-readable label, for the
/// trace ring buffer. Returns `None` for anything that doesn't parse as CI.
pub fn detect_label(bytes: &[u8]) -> Option<&'static str> {
    let header = parse(bytes)?;
    Some(match header.message_type {
        CiMessageType::DiscoveryInquiry => "Discovery Inquiry",
        CiMessageType::DiscoveryReply => "Discovery Reply",
        CiMessageType::InvalidateMuid => "Invalidate MUID",
        CiMessageType::Nak => "NAK",
        CiMessageType::PeCapabilityInquiry => "PE Capability Inquiry",
        CiMessageType::PeCapabilityReply => "PE Capability Reply",
        CiMessageType::PeGetInquiry => "PE GET",
        CiMessageType::PeGetReply => "PE GET Reply",
        CiMessageType::PeSetInquiry => "PE SET",
        CiMessageType::PeSetReply => "PE SET Reply",
        CiMessageType::PeSubscribeInquiry => "PE Subscribe",
        CiMessageType::PeSubscribeReply => "PE Subscribe Reply",
        CiMessageType::PeNotify => "PE Notify",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sevenbit_roundtrips_up_to_49_bytes() {
        for len in 0..=49usize {
            let data: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
            let encoded = encode7bit(&data);
            assert!(encoded.iter().all(|b| *b <= 0x7F));
            let decoded = decode7bit(&encoded);
            assert_eq!(decoded, data, "roundtrip failed at len {len}");
        }
    }

    #[test]
    fn discovery_roundtrips() {
        let src = Muid::new(0x0ABC_DEF1);
        let identity = DeviceIdentity::new(ManufacturerId::Extended([0x6B, 0x01]), 0x1234, 0x0321, 0x0102_0304);
        let support = CategorySupport::PROPERTY_EXCHANGE;
        let bytes = discovery_inquiry(0x7F, src, &identity, support, 512, 0);
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.message_type, CiMessageType::DiscoveryInquiry);
        assert_eq!(parsed.source, src);
        assert!(parsed.destination.is_broadcast());
    }

    #[test]
    fn discovery_reply_roundtrips_identity_fields() {
        let src = Muid::new(0x0123_456);
        let dst = Muid::new(0x0ABC_DEF1);
        let identity = DeviceIdentity::new(ManufacturerId::Standard(0x42), 0x6B, 0x01, 0x0102_0304);
        let support = CategorySupport::PROPERTY_EXCHANGE | CategorySupport::PROCESS_INQUIRY;
        let bytes = discovery_reply(0x7F, src, dst, &identity, support, 4096, 0, 0);
        let info = parse_discovery_reply(&bytes).unwrap();
        assert_eq!(info.source, src);
        assert_eq!(info.identity, identity);
        assert_eq!(info.category_support, support);
        assert_eq!(info.max_sysex, 4096);
    }

    #[test]
    fn pe_get_round_trips_through_reassembler() {
        let src = Muid::new(1);
        let dst = Muid::new(2);
        let header = PeHeader::default().with_resource("DeviceInfo");
        let bytes = pe_get_inquiry(0x7F, src, dst, 5, &header);

        let mut reassembler = ChunkReassembler::new();
        let inquiry = parse_full_pe_get_inquiry(&bytes, &mut reassembler).unwrap();
        assert_eq!(inquiry.request_id, 5);
        assert_eq!(inquiry.resource.as_deref(), Some("DeviceInfo"));
        assert!(inquiry.body.is_empty());
    }

    #[test]
    fn pe_get_reply_carries_body() {
        let src = Muid::new(2);
        let dst = Muid::new(1);
        let header = success_response_header();
        let body = br#"{"manufacturer":"KORG Inc.","model":"Module Pro"}"#;
        let bytes = pe_get_reply(0x7F, src, dst, 5, &header, body);

        let mut reassembler = ChunkReassembler::new();
        let envelope = parse_full_pe_reply(&bytes, &mut reassembler).unwrap();
        assert_eq!(envelope.request_id, 5);
        assert_eq!(envelope.header.status, Some(200));
        assert_eq!(envelope.body, body);
    }

    #[test]
    fn pe_set_round_trips_through_reassembler() {
        let src = Muid::new(1);
        let dst = Muid::new(2);
        let header = PeHeader::default().with_resource("Volume");
        let body = br#"{"level":50}"#;
        let inquiry_bytes = pe_set_inquiry(0x7F, src, dst, 9, &header, body);

        let mut reassembler = ChunkReassembler::new();
        let inquiry = parse_full_pe_set_inquiry(&inquiry_bytes, &mut reassembler).unwrap();
        assert_eq!(inquiry.request_id, 9);
        assert_eq!(inquiry.resource.as_deref(), Some("Volume"));
        assert_eq!(inquiry.body, body);

        let reply_bytes = pe_set_reply(0x7F, dst, src, 9, &success_response_header());
        let mut reassembler = ChunkReassembler::new();
        let envelope = parse_full_pe_reply(&reply_bytes, &mut reassembler).unwrap();
        assert_eq!(envelope.request_id, 9);
        assert_eq!(envelope.header.status, Some(200));
        assert!(envelope.body.is_empty());

        // Guards against the from_u8/to_u8 table falling back out of sync.
        assert_eq!(parse(&inquiry_bytes).unwrap().message_type, CiMessageType::PeSetInquiry);
        assert_eq!(parse(&reply_bytes).unwrap().message_type, CiMessageType::PeSetReply);
    }

    #[test]
    fn pe_subscribe_round_trips_through_reassembler() {
        let src = Muid::new(1);
        let dst = Muid::new(2);
        let header = PeHeader::default().with_resource("Patch");
        let inquiry_bytes = pe_subscribe_inquiry(0x7F, src, dst, 4, &header);

        let mut reassembler = ChunkReassembler::new();
        let inquiry = parse_full_pe_subscribe_inquiry(&inquiry_bytes, &mut reassembler).unwrap();
        assert_eq!(inquiry.request_id, 4);
        assert_eq!(inquiry.resource.as_deref(), Some("Patch"));

        let reply_header = success_response_header();
        let reply_bytes = pe_subscribe_reply(0x7F, dst, src, 4, &reply_header);
        let mut reassembler = ChunkReassembler::new();
        let envelope = parse_full_pe_reply(&reply_bytes, &mut reassembler).unwrap();
        assert_eq!(envelope.request_id, 4);
        assert_eq!(envelope.header.status, Some(200));
    }

    #[test]
    fn pe_capability_reply_round_trips_its_fields() {
        let src = Muid::new(2);
        let dst = Muid::new(1);
        let bytes = pe_capability_reply(0x7F, src, dst, 0x7F, 0, 2);

        let message = parse_message(&bytes).unwrap();
        assert_eq!(message.message_type, CiMessageType::PeCapabilityReply);
        assert_eq!(message.source, src);
        assert_eq!(message.destination, dst);
        assert_eq!(message.payload, vec![0x7F, 0, 2]);
    }

    #[test]
    fn chunked_envelope_reassembles_in_order() {
        let src = Muid::new(9);
        let header_bytes = br#"{"status":200}"#.to_vec();
        let body = b"abcdefghij".to_vec();

        let chunk1 = build_pe_chunk_payload(3, 2, 1, &header_bytes, &body[..5]);
        let chunk2 = build_pe_chunk_payload(3, 2, 2, &[], &body[5..]);

        let mut reassembler = ChunkReassembler::new();
        assert!(reassembler.push(src, &chunk1).is_none());
        let envelope = reassembler.push(src, &chunk2).unwrap();
        assert_eq!(envelope.request_id, 3);
        assert_eq!(envelope.body, body);
    }

    #[test]
    fn parse_rejects_bad_framing() {
        assert!(parse(&[0x00, 0x7E, 0x7F, 0x0D]).is_none());
        assert!(parse(&[]).is_none());
        let mut bytes = discovery_inquiry(
            0x7F,
            Muid::new(1),
            &DeviceIdentity::new(ManufacturerId::Standard(1), 1, 1, 1),
            CategorySupport::empty(),
            128,
            0,
        );
        *bytes.last_mut().unwrap() = 0x00;
        assert!(parse(&bytes).is_none());
    }

    #[test]
    fn detect_label_tags_known_types() {
        let bytes = pe_get_inquiry(0x7F, Muid::new(1), Muid::new(2), 1, &PeHeader::default());
        assert_eq!(detect_label(&bytes), Some("PE GET"));
    }

    #[test]
    fn response_header_builders_match_shape() {
        let success = success_response_header();
        assert_eq!(success.status, Some(200));

        let error = error_response_header(404, "not found");
        assert_eq!(error.status, Some(404));
        assert_eq!(error.message.as_deref(), Some("not found"));

        let notify = notify_header("sub-1", "Patch");
        assert_eq!(notify.subscribe_id.as_deref(), Some("sub-1"));
        assert_eq!(notify.resource.as_deref(), Some("Patch"));
    }
}
