use std::{borrow::Cow, str::FromStr};

use bytes::Bytes;

use crate::{
    command::StompCommand,
    constants::{CR, EOL, HDR_CONTENT_LENGTH, NULL},
    error::CodecError,
    frame::{Frame, Headers},
    limits::{MAX_FRAME_LEN, MAX_HEADER_LINE, MAX_HEADERS, max_body_for},
};

/// One decoded unit of inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A bare EOL sent to keep the connection alive.
    Heartbeat,
    Frame(Frame),
}

/// Bytes of a single heartbeat.
pub const HEARTBEAT: &[u8] = b"\n";

/// Encode a frame into its wire representation.
///
/// `content-length` is always recomputed from the body; any value present in
/// `frame.headers` is ignored.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let command = frame.command;
    if !frame.body.is_empty() && !command.allows_body() {
        return Err(CodecError::BodyNotAllowed(command));
    }
    if frame.body.len() > max_body_for(command) {
        return Err(CodecError::FrameTooLarge(frame.body.len()));
    }

    let escape = command.escapes_headers();
    let mut out = Vec::with_capacity(64 + frame.body.len());
    out.extend_from_slice(command.as_str().as_bytes());
    out.push(EOL);

    for (name, value) in frame.headers.iter() {
        if name == HDR_CONTENT_LENGTH {
            continue;
        }
        if !escape && (name.contains(':') || has_line_break(name) || has_line_break(value)) {
            return Err(CodecError::UnencodableHeader(name.to_string(), command));
        }
        out.extend_from_slice(encode_header_text(name, escape).as_bytes());
        out.push(b':');
        out.extend_from_slice(encode_header_text(value, escape).as_bytes());
        out.push(EOL);
    }
    if !frame.body.is_empty() {
        out.extend_from_slice(format!("{HDR_CONTENT_LENGTH}:{}", frame.body.len()).as_bytes());
        out.push(EOL);
    }

    out.push(EOL);
    out.extend_from_slice(&frame.body);
    out.push(NULL);

    if out.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(out.len()));
    }
    Ok(out)
}

/// Decode exactly one WebSocket message worth of STOMP data.
///
/// The message must hold either heartbeat EOLs only, or a single frame
/// optionally surrounded by EOLs.
pub fn decode_frame(buf: &[u8]) -> Result<Inbound, CodecError> {
    let start = buf
        .iter()
        .position(|&b| b != EOL && b != CR)
        .unwrap_or(buf.len());
    if start == buf.len() {
        return if buf.is_empty() {
            Err(CodecError::Incomplete)
        } else {
            Ok(Inbound::Heartbeat)
        };
    }

    let (item, used) = parse_one(&buf[start..])?.ok_or(CodecError::Incomplete)?;
    let trailing = &buf[start + used..];
    if trailing.iter().any(|&b| b != EOL && b != CR) {
        return Err(CodecError::TrailingData);
    }
    Ok(item)
}

/// Decode as many complete frames/heartbeats as `in_buf` holds.
///
/// Returns the decoded items and the number of bytes consumed; the caller
/// keeps the unconsumed tail for the next read.
pub fn try_decode_frames(in_buf: &[u8]) -> Result<(Vec<Inbound>, usize), CodecError> {
    let mut items = Vec::new();
    let mut offset = 0usize;

    while offset < in_buf.len() {
        match parse_one(&in_buf[offset..])? {
            Some((item, used)) => {
                items.push(item);
                offset += used;
            }
            None => break,
        }
    }

    Ok((items, offset))
}

/// Parse one heartbeat or frame from the front of `buf`.
///
/// `Ok(None)` means more bytes are needed.
fn parse_one(buf: &[u8]) -> Result<Option<(Inbound, usize)>, CodecError> {
    match buf {
        [] => return Ok(None),
        [EOL, ..] => return Ok(Some((Inbound::Heartbeat, 1))),
        [CR] => return Ok(None),
        [CR, EOL, ..] => return Ok(Some((Inbound::Heartbeat, 2))),
        _ => {}
    }

    let Some((line, mut pos)) = read_line(buf, 0)? else {
        return Ok(None);
    };
    let command_text = std::str::from_utf8(line)?;
    let command = StompCommand::from_str(command_text)
        .map_err(|_| CodecError::UnknownCommand(command_text.to_string()))?;
    let escape = command.escapes_headers();

    let mut headers = Headers::new();
    loop {
        let Some((line, next)) = read_line(buf, pos)? else {
            return Ok(None);
        };
        pos = next;
        if line.is_empty() {
            break;
        }
        if headers.len() == MAX_HEADERS {
            return Err(CodecError::TooManyHeaders(MAX_HEADERS + 1));
        }
        let text = std::str::from_utf8(line)?;
        let (name, value) = text
            .split_once(':')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| CodecError::MalformedHeader(text.to_string()))?;
        if escape {
            headers.append(unescape(name)?, unescape(value)?);
        } else {
            headers.append(name.to_string(), value.to_string());
        }
    }

    let body_start = pos;
    let body_end = match headers.get(HDR_CONTENT_LENGTH) {
        Some(raw) => {
            let len: usize = raw
                .trim()
                .parse()
                .map_err(|_| CodecError::InvalidContentLength(raw.to_string()))?;
            let total = body_start
                .checked_add(len)
                .and_then(|n| n.checked_add(1))
                .ok_or(CodecError::FrameTooLarge(usize::MAX))?;
            if total > MAX_FRAME_LEN {
                return Err(CodecError::FrameTooLarge(total));
            }
            if buf.len() < total {
                return Ok(None);
            }
            if buf[body_start + len] != NULL {
                return Err(CodecError::MissingNull);
            }
            body_start + len
        }
        None => match buf[body_start..].iter().position(|&b| b == NULL) {
            Some(i) => body_start + i,
            None if buf.len() >= MAX_FRAME_LEN => {
                return Err(CodecError::FrameTooLarge(buf.len()));
            }
            None => return Ok(None),
        },
    };

    let consumed = body_end + 1;
    if consumed > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(consumed));
    }
    if body_end > body_start && !command.allows_body() {
        return Err(CodecError::BodyNotAllowed(command));
    }

    let frame = Frame {
        command,
        headers,
        body: Bytes::copy_from_slice(&buf[body_start..body_end]),
    };
    Ok(Some((Inbound::Frame(frame), consumed)))
}

/// Read one EOL-terminated line starting at `start`, stripping an optional CR.
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, CodecError> {
    let rest = &buf[start..];
    match rest.iter().position(|&b| b == EOL) {
        Some(i) if i > MAX_HEADER_LINE => Err(CodecError::HeaderTooLong(i)),
        Some(i) => {
            let line = match &rest[..i] {
                [head @ .., CR] => head,
                line => line,
            };
            Ok(Some((line, start + i + 1)))
        }
        None if rest.len() > MAX_HEADER_LINE => Err(CodecError::HeaderTooLong(rest.len())),
        None => Ok(None),
    }
}

fn has_line_break(s: &str) -> bool {
    s.contains(['\n', '\r'])
}

fn encode_header_text(raw: &str, escape: bool) -> Cow<'_, str> {
    if !escape || !raw.contains(['\\', '\n', '\r', ':']) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 4);
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn unescape(raw: &str) -> Result<String, CodecError> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            _ => return Err(CodecError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
