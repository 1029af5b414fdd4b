//! ELM327 Reply Parsing
//!
//! The adapter answers with text lines of hex, optionally prefixed by a CAN
//! header and an ISO-TP PCI byte. Payloads are located by searching for the
//! mode-echo marker (e.g. `43` for Mode 03, `41 0C` for RPM) rather than by
//! assuming a fixed offset. The decode path is chosen by the caller from the
//! request it sent, never by sniffing the reply.

use crate::dtc::{decode_dtc, decode_dtc_list, DtcStatus, TroubleCode};
use crate::error::DecodeError;
use crate::pid::{supported_from_bitmap, SensorReading};
use std::collections::HashMap;

/// Negative replies the adapter prints instead of data
const NEGATIVE_REPLIES: [&str; 9] = [
    "NODATA",
    "ERROR",
    "UNABLETOCONNECT",
    "BUSINIT:...ERROR",
    "CANERROR",
    "BUSERROR",
    "STOPPED",
    "BUFFERFULL",
    "?",
];

/// Coarse classification of a raw reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Nothing but the prompt, or nothing at all
    Empty,
    /// At least one line of data
    Data,
    /// `NO DATA`: the vehicle did not answer this request
    NoData,
    /// Any other negative reply (`ERROR`, `?`, `UNABLE TO CONNECT` ...)
    Error(String),
}

/// Classify a raw reply without decoding it
pub fn reply_status(raw: &str) -> ReplyStatus {
    let lines = reply_lines(raw);
    if lines.is_empty() {
        return ReplyStatus::Empty;
    }
    if lines.iter().any(|l| l == "NODATA") {
        return ReplyStatus::NoData;
    }
    if let Some(line) = lines.iter().find(|l| is_negative(l)) {
        return ReplyStatus::Error(line.clone());
    }
    ReplyStatus::Data
}

fn is_negative(line: &str) -> bool {
    NEGATIVE_REPLIES.iter().any(|n| line.contains(n))
}

/// Split a raw reply into normalized lines.
///
/// Spaces are removed, letters upper-cased, and the prompt, `SEARCHING...`
/// progress text and blank lines dropped.
pub fn reply_lines(raw: &str) -> Vec<String> {
    raw.split(['\r', '\n'])
        .map(|line| {
            line.chars()
                .filter(|c| !c.is_whitespace() && *c != '>')
                .collect::<String>()
                .to_ascii_uppercase()
        })
        .filter(|line| {
            !line.is_empty()
                && !line.starts_with("SEARCHING")
                && !(line.starts_with("BUSINIT") && line.ends_with("OK"))
        })
        .collect()
}

/// Convert a hex string into bytes
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, DecodeError> {
    if hex.len() % 2 != 0 {
        return Err(DecodeError::OddLength(hex.len()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| DecodeError::InvalidHex(hex.to_string()))
        })
        .collect()
}

/// One reply line with its framing identified
#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    /// CAN id the line arrived under (`7E8`, `18DAF110`); `None` without headers
    header: Option<String>,
    /// Line carried an ISO 15765 (CAN) header and PCI byte
    can: bool,
    /// Bytes after header and PCI
    payload: Vec<u8>,
    /// ISO-TP single/first frame declared message length
    declared_len: Option<usize>,
    /// ISO-TP consecutive frame, or a headerless `N:` line with N > 0
    continuation: bool,
}

impl Frame {
    fn plain(header: Option<String>, can: bool, payload: Vec<u8>) -> Self {
        Self {
            header,
            can,
            payload,
            declared_len: None,
            continuation: false,
        }
    }
}

/// Headerless multi-frame output announces the message length alone on a
/// line of three hex digits (`00C`) before the `0:` line
fn length_announcement(line: &str) -> Option<usize> {
    if line.len() == 3 {
        usize::from_str_radix(line, 16).ok()
    } else {
        None
    }
}

fn parse_frame(line: &str) -> Result<Frame, DecodeError> {
    // Headerless multi-frame output: "0:490201314731", "1:4A4335..."
    if let Some((index, rest)) = line
        .split_once(':')
        .filter(|(index, _)| index.len() <= 2 && index.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return Ok(Frame {
            continuation: index != "0",
            ..Frame::plain(None, true, hex_to_bytes(rest)?)
        });
    }

    if line.len() < 3 && line.len() % 2 == 1 {
        return Ok(Frame::plain(None, false, Vec::new()));
    }

    let (header, body) = if line.len() % 2 == 1 {
        // 11-bit CAN id, three hex digits
        line.split_at(3)
    } else if line.starts_with("18DA") && line.len() >= 10 {
        // 29-bit CAN id, four bytes
        line.split_at(8)
    } else {
        return Ok(Frame::plain(None, false, hex_to_bytes(line)?));
    };

    let header = Some(header.to_string());
    let bytes = hex_to_bytes(body)?;
    let Some(&pci) = bytes.first() else {
        return Ok(Frame::plain(header, true, bytes));
    };

    let frame = match pci >> 4 {
        0x0 => {
            let len = (pci & 0x0F) as usize;
            let end = (1 + len).min(bytes.len());
            Frame {
                declared_len: Some(len),
                ..Frame::plain(header, true, bytes[1..end].to_vec())
            }
        }
        0x1 if bytes.len() >= 2 => Frame {
            declared_len: Some((((pci & 0x0F) as usize) << 8) | bytes[1] as usize),
            ..Frame::plain(header, true, bytes[2..].to_vec())
        },
        0x2 => Frame {
            continuation: true,
            ..Frame::plain(header, true, bytes[1..].to_vec())
        },
        _ => Frame::plain(header, true, bytes),
    };
    Ok(frame)
}

/// Data following one occurrence of a marker, with continuation frames appended
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    can: bool,
    data: Vec<u8>,
    limit: Option<usize>,
}

fn find_marker(bytes: &[u8], marker: &[u8]) -> Option<usize> {
    bytes.windows(marker.len()).position(|w| w == marker)
}

/// Collect the bytes following every occurrence of `marker`.
///
/// Only single frames, first frames and non-CAN lines are searched for the
/// marker. A consecutive frame extends the open message from the same CAN
/// id, so replies from several ECUs may interleave. Lines before the first
/// marker are ignored, as are lines that are not hex (echoes, `OK`,
/// negative replies).
fn segments(raw: &str, marker: &[u8]) -> Result<Vec<Segment>, DecodeError> {
    let mut out: Vec<Segment> = Vec::new();
    let mut open: HashMap<Option<String>, usize> = HashMap::new();
    let mut announced = None;

    for line in reply_lines(raw) {
        if !line.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            continue;
        }
        if let Some(len) = length_announcement(&line) {
            announced = Some(len);
            continue;
        }
        let frame = parse_frame(&line)?;

        if frame.continuation {
            if let Some(&index) = open.get(&frame.header) {
                out[index].data.extend_from_slice(&frame.payload);
            }
            continue;
        }

        let declared_len = match frame.header {
            None if frame.can => announced.take(),
            _ => frame.declared_len,
        };
        match find_marker(&frame.payload, marker) {
            Some(pos) => {
                let start = pos + marker.len();
                open.insert(frame.header, out.len());
                out.push(Segment {
                    can: frame.can,
                    data: frame.payload[start..].to_vec(),
                    limit: declared_len.map(|len| len.saturating_sub(start)),
                });
            }
            None => {
                open.remove(&frame.header);
            }
        }
    }

    for segment in &mut out {
        if let Some(limit) = segment.limit {
            segment.data.truncate(limit);
        }
    }
    Ok(out)
}

/// Decode a Mode 03/07/0A reply into trouble codes.
///
/// Each responding ECU contributes its own list. CAN replies carry a code
/// count byte after the mode echo, which is skipped.
pub fn parse_dtcs(raw: &str, status: DtcStatus) -> Result<Vec<TroubleCode>, DecodeError> {
    let mut codes = Vec::new();
    for segment in segments(raw, &[status.response_marker()])? {
        let data = if segment.can && segment.data.len() % 2 == 1 {
            &segment.data[1..]
        } else {
            &segment.data[..]
        };
        codes.extend(decode_dtc_list(data, status));
    }
    Ok(codes)
}

/// Decode a Mode 01 reply for `pid`.
///
/// Returns `None` when the reply lacks the `41 <pid>` echo or carries too
/// few data bytes; the vehicle may simply not support the PID.
pub fn parse_sensor(raw: &str, pid: u8) -> Result<Option<SensorReading>, DecodeError> {
    Ok(segments(raw, &[0x41, pid])?
        .iter()
        .find_map(|s| SensorReading::decode(pid, &s.data)))
}

/// Decode a Mode 02 reply for `pid` in freeze frame `frame`.
pub fn parse_freeze_sensor(
    raw: &str,
    pid: u8,
    frame: u8,
) -> Result<Option<SensorReading>, DecodeError> {
    Ok(segments(raw, &[0x42, pid, frame])?
        .iter()
        .find_map(|s| SensorReading::decode(pid, &s.data)))
}

/// Decode the code that triggered freeze frame `frame` (`02 02 nn`)
pub fn parse_freeze_trigger(raw: &str, frame: u8) -> Result<Option<TroubleCode>, DecodeError> {
    Ok(segments(raw, &[0x42, 0x02, frame])?
        .iter()
        .find_map(|s| match s.data.as_slice() {
            [b0, b1, ..] => decode_dtc(*b0, *b1),
            _ => None,
        }))
}

/// Raw data bytes for a Mode 01 PID with a fixed-size payload
pub fn parse_pid_bytes<const N: usize>(raw: &str, pid: u8) -> Result<Option<[u8; N]>, DecodeError> {
    Ok(segments(raw, &[0x41, pid])?
        .iter()
        .find_map(|s| s.data.get(..N).and_then(|d| d.try_into().ok())))
}

/// Decode a supported-PID reply (`0100`, `0120`, ...) into PID numbers
pub fn parse_supported_pids(raw: &str, base: u8) -> Result<Vec<u8>, DecodeError> {
    Ok(parse_pid_bytes::<4>(raw, base)?
        .map(|bitmap| supported_from_bitmap(base, bitmap))
        .unwrap_or_default())
}

/// Concatenate the data bytes of a Mode 09 reply for `info_type`.
///
/// Every frame is stitched together before any ASCII conversion, since the
/// adapter splits the identifier across frames arbitrarily. Legacy
/// (non-CAN) lines carry a sequence byte and four data bytes each; CAN
/// messages carry one item-count byte and then the full payload.
pub fn parse_vehicle_info(raw: &str, info_type: u8) -> Result<Vec<u8>, DecodeError> {
    let found = segments(raw, &[0x49, info_type])?;
    if found.is_empty() {
        return Err(DecodeError::MissingMarker(format!("49{info_type:02X}")));
    }
    let mut data = Vec::new();
    for segment in found {
        let body = segment.data.get(1..).unwrap_or_default();
        if segment.can {
            data.extend_from_slice(body);
        } else {
            data.extend(body.iter().take(4));
        }
    }
    Ok(data)
}
