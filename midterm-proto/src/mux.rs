//! Browser-facing multiplex protocol (§4.5).
//!
//! A single WebSocket carries frames for every session a browser client is
//! subscribed to:
//!
//! ```text
//! [type: 1][session id: 8 ASCII bytes][payload: remainder of the WS message]
//! ```
//!
//! The one exception is the out-of-band init frame, tagged `0xFF`, which has
//! no session id field — it carries an opaque UTF-8 client id and is sent
//! exactly once right after the socket opens (§4.5 "init frame").

use thiserror::Error;

use crate::session::SessionId;

/// Header size: 1 type byte + 8 ASCII session-id bytes.
const HEADER_LEN: usize = 9;

/// Tag for the out-of-band init frame, which skips the session id field.
const INIT_FRAME_TAG: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxMessageType {
    Output = 0x01,
    Input = 0x02,
    Resize = 0x03,
    SessionState = 0x04,
    Resync = 0x05,
    BufferRequest = 0x06,
    CompressedOutput = 0x07,
}

impl MuxMessageType {
    #[must_use]
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::Output,
            0x02 => Self::Input,
            0x03 => Self::Resize,
            0x04 => Self::SessionState,
            0x05 => Self::Resync,
            0x06 => Self::BufferRequest,
            0x07 => Self::CompressedOutput,
            _ => return None,
        })
    }
}

/// A decoded mux WebSocket message.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxFrame {
    /// Sent once, immediately after connect: an opaque UTF-8 client id.
    Init(Vec<u8>),
    Output { session: SessionId, cols: u16, rows: u16, data: Vec<u8> },
    /// gzip-compressed `Output` payload, used when the raw payload exceeds
    /// the 2048-byte threshold (§4.5 "compression threshold"). `data` is the
    /// already-gzipped bytes; `uncompressed_len` lets the client size a
    /// decode buffer up front.
    CompressedOutput { session: SessionId, cols: u16, rows: u16, uncompressed_len: u32, data: Vec<u8> },
    Input { session: SessionId, data: Vec<u8> },
    Resize { session: SessionId, cols: u16, rows: u16 },
    /// One byte: `created` true means the session just joined the
    /// registry, false means it was closed/removed.
    SessionState { session: SessionId, created: bool },
    /// Server -> client: "clear and replay." Empty payload;
    /// `SessionId::all_zero()` means every subscribed session.
    Resync { session: SessionId },
    /// Client -> server: "send me the full ring buffer for this session."
    BufferRequest { session: SessionId },
}

impl MuxFrame {
    fn message_type(&self) -> Option<MuxMessageType> {
        match self {
            Self::Init(_) => None,
            Self::Output { .. } => Some(MuxMessageType::Output),
            Self::CompressedOutput { .. } => Some(MuxMessageType::CompressedOutput),
            Self::Input { .. } => Some(MuxMessageType::Input),
            Self::Resize { .. } => Some(MuxMessageType::Resize),
            Self::SessionState { .. } => Some(MuxMessageType::SessionState),
            Self::Resync { .. } => Some(MuxMessageType::Resync),
            Self::BufferRequest { .. } => Some(MuxMessageType::BufferRequest),
        }
    }

    fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Init(_) => None,
            Self::Output { session, .. }
            | Self::CompressedOutput { session, .. }
            | Self::Input { session, .. }
            | Self::Resize { session, .. }
            | Self::SessionState { session, .. }
            | Self::Resync { session, .. }
            | Self::BufferRequest { session } => Some(session),
        }
    }

    fn body(&self) -> Vec<u8> {
        match self {
            Self::Init(json) => json.clone(),
            Self::Input { data, .. } => data.clone(),
            Self::Output { cols, rows, data, .. } => {
                let mut out = Vec::with_capacity(4 + data.len());
                out.extend_from_slice(&cols.to_le_bytes());
                out.extend_from_slice(&rows.to_le_bytes());
                out.extend_from_slice(data);
                out
            }
            Self::CompressedOutput { cols, rows, uncompressed_len, data, .. } => {
                let mut out = Vec::with_capacity(8 + data.len());
                out.extend_from_slice(&cols.to_le_bytes());
                out.extend_from_slice(&rows.to_le_bytes());
                out.extend_from_slice(&uncompressed_len.to_le_bytes());
                out.extend_from_slice(data);
                out
            }
            Self::SessionState { created, .. } => vec![u8::from(*created)],
            Self::Resize { cols, rows, .. } => {
                let mut out = Vec::with_capacity(4);
                out.extend_from_slice(&cols.to_le_bytes());
                out.extend_from_slice(&rows.to_le_bytes());
                out
            }
            Self::Resync { .. } | Self::BufferRequest { .. } => Vec::new(),
        }
    }

    /// Encode as a single binary WebSocket message.
    ///
    /// # Panics
    ///
    /// Panics if a non-init frame's session id is not exactly 8 bytes —
    /// every [`SessionId`] produced by [`SessionId::generate`] or
    /// [`SessionId::all_zero`] satisfies this.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body();
        match self.message_type() {
            None => {
                let mut out = Vec::with_capacity(1 + body.len());
                out.push(INIT_FRAME_TAG);
                out.extend_from_slice(&body);
                out
            }
            Some(ty) => {
                let id = self.session_id().expect("non-init frame always carries a session id");
                let id_bytes = id.as_str().as_bytes();
                assert_eq!(id_bytes.len(), 8, "session id must be 8 ASCII bytes");
                let mut out = Vec::with_capacity(HEADER_LEN + body.len());
                out.push(ty as u8);
                out.extend_from_slice(id_bytes);
                out.extend_from_slice(&body);
                out
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MuxFramingError {
    #[error("unknown mux frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("mux message shorter than the {HEADER_LEN}-byte header")]
    TooShort,
    #[error("malformed payload for frame type {0:?}: {1}")]
    Malformed(MuxMessageType, &'static str),
}

/// Decode one complete WebSocket binary message. Unlike [`crate::ipc`], the
/// mux protocol rides over WebSocket message framing (already length
/// delimited by the transport), so there is no partial-read reassembly to do
/// here — [`MuxFrameDecoder`] exists for API symmetry and to keep the door
/// open for a future byte-stream transport.
pub fn decode_message(bytes: &[u8]) -> Result<MuxFrame, MuxFramingError> {
    if bytes.is_empty() {
        return Err(MuxFramingError::TooShort);
    }
    if bytes[0] == INIT_FRAME_TAG {
        return Ok(MuxFrame::Init(bytes[1..].to_vec()));
    }
    if bytes.len() < HEADER_LEN {
        return Err(MuxFramingError::TooShort);
    }
    let ty = MuxMessageType::from_byte(bytes[0]).ok_or(MuxFramingError::UnknownType(bytes[0]))?;
    let session_bytes = &bytes[1..9];
    let session_str = std::str::from_utf8(session_bytes)
        .map_err(|_| MuxFramingError::Malformed(ty, "session id is not ASCII"))?;
    let session = SessionId::from_raw(session_str.to_string());
    let body = &bytes[HEADER_LEN..];

    Ok(match ty {
        MuxMessageType::Output => {
            if body.len() < 4 {
                return Err(MuxFramingError::Malformed(ty, "output body shorter than 4 bytes"));
            }
            let cols = u16::from_le_bytes([body[0], body[1]]);
            let rows = u16::from_le_bytes([body[2], body[3]]);
            MuxFrame::Output { session, cols, rows, data: body[4..].to_vec() }
        }
        MuxMessageType::CompressedOutput => {
            if body.len() < 8 {
                return Err(MuxFramingError::Malformed(ty, "compressed output body shorter than 8 bytes"));
            }
            let cols = u16::from_le_bytes([body[0], body[1]]);
            let rows = u16::from_le_bytes([body[2], body[3]]);
            let uncompressed_len = u32::from_le_bytes(body[4..8].try_into().unwrap());
            MuxFrame::CompressedOutput { session, cols, rows, uncompressed_len, data: body[8..].to_vec() }
        }
        MuxMessageType::Input => MuxFrame::Input { session, data: body.to_vec() },
        MuxMessageType::Resize => {
            if body.len() < 4 {
                return Err(MuxFramingError::Malformed(ty, "resize body shorter than 4 bytes"));
            }
            let cols = u16::from_le_bytes([body[0], body[1]]);
            let rows = u16::from_le_bytes([body[2], body[3]]);
            MuxFrame::Resize { session, cols, rows }
        }
        MuxMessageType::SessionState => {
            if body.is_empty() {
                return Err(MuxFramingError::Malformed(ty, "session state body is empty"));
            }
            MuxFrame::SessionState { session, created: body[0] != 0 }
        }
        MuxMessageType::Resync => MuxFrame::Resync { session },
        MuxMessageType::BufferRequest => MuxFrame::BufferRequest { session },
    })
}

/// Thin wrapper kept for API symmetry with [`crate::ipc::IpcFrameDecoder`].
/// WebSocket message boundaries already delimit mux frames, so `feed` always
/// decodes exactly the bytes it is given and never buffers across calls.
#[derive(Debug, Default)]
pub struct MuxFrameDecoder;

impl MuxFrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Decode one WebSocket binary message into a single frame.
    ///
    /// # Errors
    ///
    /// See [`decode_message`].
    pub fn feed(&mut self, message: &[u8]) -> Result<MuxFrame, MuxFramingError> {
        decode_message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s.to_string())
    }

    fn roundtrip(frame: MuxFrame) {
        let encoded = frame.encode();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn init_frame_round_trip() {
        roundtrip(MuxFrame::Init(br#"[{"id":"deadbeef"}]"#.to_vec()));
    }

    #[test]
    fn output_round_trip() {
        roundtrip(MuxFrame::Output { session: sid("deadbeef"), cols: 80, rows: 24, data: b"hello\n".to_vec() });
    }

    #[test]
    fn compressed_output_round_trip() {
        roundtrip(MuxFrame::CompressedOutput {
            session: sid("deadbeef"),
            cols: 80,
            rows: 24,
            uncompressed_len: 12345,
            data: vec![0x1f, 0x8b, 0x08, 0x00],
        });
    }

    #[test]
    fn input_round_trip() {
        roundtrip(MuxFrame::Input { session: sid("cafebabe"), data: b"ls\n".to_vec() });
    }

    #[test]
    fn resize_round_trip() {
        roundtrip(MuxFrame::Resize { session: sid("cafebabe"), cols: 80, rows: 24 });
    }

    #[test]
    fn session_state_round_trip() {
        roundtrip(MuxFrame::SessionState { session: sid("cafebabe"), created: true });
        roundtrip(MuxFrame::SessionState { session: sid("cafebabe"), created: false });
    }

    #[test]
    fn resync_round_trip_including_all_zero() {
        roundtrip(MuxFrame::Resync { session: sid("cafebabe") });
        roundtrip(MuxFrame::Resync { session: SessionId::all_zero() });
    }

    #[test]
    fn buffer_request_round_trip() {
        roundtrip(MuxFrame::BufferRequest { session: sid("cafebabe") });
    }

    #[test]
    fn empty_message_is_too_short() {
        assert_eq!(decode_message(&[]), Err(MuxFramingError::TooShort));
    }

    #[test]
    fn short_header_is_too_short() {
        assert_eq!(
            decode_message(&[MuxMessageType::Output as u8, b'a', b'b']),
            Err(MuxFramingError::TooShort)
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut msg = vec![0x42];
        msg.extend_from_slice(b"deadbeef");
        assert_eq!(decode_message(&msg), Err(MuxFramingError::UnknownType(0x42)));
    }

    #[test]
    fn decoder_wrapper_matches_free_function() {
        let frame = MuxFrame::BufferRequest { session: sid("deadbeef") };
        let encoded = frame.encode();
        let mut decoder = MuxFrameDecoder::new();
        assert_eq!(decoder.feed(&encoded).unwrap(), frame);
    }
}
