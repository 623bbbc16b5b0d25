//! Per-session IPC framing codec (§4.1).
//!
//! Every message on a PtyHost endpoint has the form:
//!
//! ```text
//! [type: 1][length: 4 little-endian][payload: length bytes]
//! ```
//!
//! The type tag is a closed set (see [`IpcFrameType`]); an unknown type or a
//! payload whose declared length exceeds [`MAX_FRAME_PAYLOAD`] is
//! [`FramingError::InvalidFrame`] — the transport must be torn down when that
//! happens (§7 "InvalidFrame").

use thiserror::Error;

/// Maximum IPC frame payload size: 16 MiB (§4.1).
pub const MAX_FRAME_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Closed set of IPC message types (§4.1 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpcFrameType {
    GetInfo = 0x01,
    Info = 0x02,
    Input = 0x03,
    Output = 0x04,
    Resize = 0x05,
    ResizeAck = 0x06,
    GetBuffer = 0x07,
    Buffer = 0x08,
    SetName = 0x09,
    SetNameAck = 0x0A,
    SetLogLevel = 0x0B,
    SetLogLevelAck = 0x0C,
    StateChange = 0x0D,
    ProcessEvent = 0x0E,
    ForegroundChange = 0x0F,
    Close = 0x10,
    CloseAck = 0x11,
}

impl IpcFrameType {
    #[must_use]
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::GetInfo,
            0x02 => Self::Info,
            0x03 => Self::Input,
            0x04 => Self::Output,
            0x05 => Self::Resize,
            0x06 => Self::ResizeAck,
            0x07 => Self::GetBuffer,
            0x08 => Self::Buffer,
            0x09 => Self::SetName,
            0x0A => Self::SetNameAck,
            0x0B => Self::SetLogLevel,
            0x0C => Self::SetLogLevelAck,
            0x0D => Self::StateChange,
            0x0E => Self::ProcessEvent,
            0x0F => Self::ForegroundChange,
            0x10 => Self::Close,
            0x11 => Self::CloseAck,
            _ => return None,
        })
    }
}

/// A decoded IPC frame. Payloads that carry structured data are kept as raw
/// bytes / JSON values here; the typed `SessionInfo` etc. conversion happens
/// one layer up (in `midterm-host` / `midterm-server`) so this crate stays a
/// pure codec.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcFrame {
    GetInfo,
    /// `SessionInfo` serialized as compact JSON.
    Info(Vec<u8>),
    /// Raw bytes to write to the PTY.
    Input(Vec<u8>),
    /// `[cols:2][rows:2][bytes...]`
    Output { cols: u16, rows: u16, data: Vec<u8> },
    /// `[cols:2][rows:2]`
    Resize { cols: u16, rows: u16 },
    ResizeAck,
    GetBuffer,
    /// Full ring-buffer snapshot.
    Buffer(Vec<u8>),
    /// UTF-8 display name. Empty string clears it (§8 law 7).
    SetName(String),
    SetNameAck,
    /// 1-byte log level enum.
    SetLogLevel(u8),
    SetLogLevelAck,
    StateChange,
    /// JSON-encoded `{type, pid, ppid, name, cmd, exit?, ts}`.
    ProcessEvent(Vec<u8>),
    /// JSON-encoded `{pid, name, cmd, cwd}`.
    ForegroundChange(Vec<u8>),
    Close,
    CloseAck,
}

impl IpcFrame {
    fn frame_type(&self) -> IpcFrameType {
        match self {
            Self::GetInfo => IpcFrameType::GetInfo,
            Self::Info(_) => IpcFrameType::Info,
            Self::Input(_) => IpcFrameType::Input,
            Self::Output { .. } => IpcFrameType::Output,
            Self::Resize { .. } => IpcFrameType::Resize,
            Self::ResizeAck => IpcFrameType::ResizeAck,
            Self::GetBuffer => IpcFrameType::GetBuffer,
            Self::Buffer(_) => IpcFrameType::Buffer,
            Self::SetName(_) => IpcFrameType::SetName,
            Self::SetNameAck => IpcFrameType::SetNameAck,
            Self::SetLogLevel(_) => IpcFrameType::SetLogLevel,
            Self::SetLogLevelAck => IpcFrameType::SetLogLevelAck,
            Self::StateChange => IpcFrameType::StateChange,
            Self::ProcessEvent(_) => IpcFrameType::ProcessEvent,
            Self::ForegroundChange(_) => IpcFrameType::ForegroundChange,
            Self::Close => IpcFrameType::Close,
            Self::CloseAck => IpcFrameType::CloseAck,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::GetInfo
            | Self::ResizeAck
            | Self::GetBuffer
            | Self::SetNameAck
            | Self::SetLogLevelAck
            | Self::StateChange
            | Self::Close
            | Self::CloseAck => Vec::new(),
            Self::Info(bytes) | Self::Input(bytes) | Self::Buffer(bytes) => bytes.clone(),
            Self::Output { cols, rows, data } => {
                let mut out = Vec::with_capacity(4 + data.len());
                out.extend_from_slice(&cols.to_le_bytes());
                out.extend_from_slice(&rows.to_le_bytes());
                out.extend_from_slice(data);
                out
            }
            Self::Resize { cols, rows } => {
                let mut out = Vec::with_capacity(4);
                out.extend_from_slice(&cols.to_le_bytes());
                out.extend_from_slice(&rows.to_le_bytes());
                out
            }
            Self::SetName(name) => name.as_bytes().to_vec(),
            Self::SetLogLevel(level) => vec![*level],
            Self::ProcessEvent(json) | Self::ForegroundChange(json) => json.clone(),
        }
    }

    /// Encode this frame into `[type:1][length:4 LE][payload]`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut buf = Vec::with_capacity(5 + payload.len());
        buf.push(self.frame_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf
    }
}

/// Errors raised while decoding the IPC wire format (§7 `InvalidFrame`).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("unknown IPC frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("IPC frame payload length {0} exceeds cap {MAX_FRAME_PAYLOAD}")]
    PayloadTooLarge(u32),
    #[error("malformed payload for frame type {0:?}: {1}")]
    Malformed(IpcFrameType, &'static str),
}

fn decode_payload(ty: IpcFrameType, payload: &[u8]) -> Result<IpcFrame, FramingError> {
    Ok(match ty {
        IpcFrameType::GetInfo => IpcFrame::GetInfo,
        IpcFrameType::Info => IpcFrame::Info(payload.to_vec()),
        IpcFrameType::Input => IpcFrame::Input(payload.to_vec()),
        IpcFrameType::Output => {
            if payload.len() < 4 {
                return Err(FramingError::Malformed(ty, "output frame shorter than 4 bytes"));
            }
            let cols = u16::from_le_bytes([payload[0], payload[1]]);
            let rows = u16::from_le_bytes([payload[2], payload[3]]);
            IpcFrame::Output { cols, rows, data: payload[4..].to_vec() }
        }
        IpcFrameType::Resize => {
            if payload.len() < 4 {
                return Err(FramingError::Malformed(ty, "resize frame shorter than 4 bytes"));
            }
            let cols = u16::from_le_bytes([payload[0], payload[1]]);
            let rows = u16::from_le_bytes([payload[2], payload[3]]);
            IpcFrame::Resize { cols, rows }
        }
        IpcFrameType::ResizeAck => IpcFrame::ResizeAck,
        IpcFrameType::GetBuffer => IpcFrame::GetBuffer,
        IpcFrameType::Buffer => IpcFrame::Buffer(payload.to_vec()),
        IpcFrameType::SetName => {
            let name = String::from_utf8(payload.to_vec())
                .map_err(|_| FramingError::Malformed(ty, "name is not valid UTF-8"))?;
            IpcFrame::SetName(name)
        }
        IpcFrameType::SetNameAck => IpcFrame::SetNameAck,
        IpcFrameType::SetLogLevel => {
            if payload.len() != 1 {
                return Err(FramingError::Malformed(ty, "log level payload must be 1 byte"));
            }
            IpcFrame::SetLogLevel(payload[0])
        }
        IpcFrameType::SetLogLevelAck => IpcFrame::SetLogLevelAck,
        IpcFrameType::StateChange => IpcFrame::StateChange,
        IpcFrameType::ProcessEvent => IpcFrame::ProcessEvent(payload.to_vec()),
        IpcFrameType::ForegroundChange => IpcFrame::ForegroundChange(payload.to_vec()),
        IpcFrameType::Close => IpcFrame::Close,
        IpcFrameType::CloseAck => IpcFrame::CloseAck,
    })
}

/// Incremental decoder: feed bytes as they arrive from the transport and
/// drain complete frames. Header reads are best-effort — a header or payload
/// split across reads is buffered until complete (§4.1 "Header reads are
/// best-effort").
#[derive(Debug, Default)]
pub struct IpcFrameDecoder {
    buf: Vec<u8>,
}

impl IpcFrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-read bytes and extract every frame that is now complete.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] on an unknown type tag or an oversize length
    /// prefix. Per §4.1/§7 the caller must tear down the transport on error;
    /// this decoder does not attempt to resynchronize the stream.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<IpcFrame>, FramingError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < 5 {
                break;
            }
            let type_byte = self.buf[0];
            let length = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
            if length > MAX_FRAME_PAYLOAD {
                return Err(FramingError::PayloadTooLarge(length));
            }
            let ty = IpcFrameType::from_byte(type_byte).ok_or(FramingError::UnknownType(type_byte))?;

            let total = 5 + length as usize;
            if self.buf.len() < total {
                break; // incomplete frame, wait for more data
            }

            let payload = &self.buf[5..total];
            let frame = decode_payload(ty, payload)?;
            frames.push(frame);
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: IpcFrame) {
        let encoded = frame.encode();
        let mut decoder = IpcFrameDecoder::new();
        let frames = decoder.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], frame);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn get_info_round_trip() {
        roundtrip(IpcFrame::GetInfo);
    }

    #[test]
    fn input_round_trip() {
        roundtrip(IpcFrame::Input(b"echo hi\n".to_vec()));
    }

    #[test]
    fn output_round_trip_carries_dims() {
        roundtrip(IpcFrame::Output { cols: 80, rows: 24, data: b"hello".to_vec() });
    }

    #[test]
    fn resize_round_trip() {
        roundtrip(IpcFrame::Resize { cols: 132, rows: 40 });
    }

    #[test]
    fn set_name_round_trip_including_empty() {
        roundtrip(IpcFrame::SetName("my-session".to_string()));
        roundtrip(IpcFrame::SetName(String::new()));
    }

    #[test]
    fn set_log_level_round_trip() {
        roundtrip(IpcFrame::SetLogLevel(2));
    }

    #[test]
    fn buffer_round_trip_large_payload() {
        let data = vec![0x42u8; 256 * 1024];
        roundtrip(IpcFrame::Buffer(data));
    }

    #[test]
    fn multiple_frames_in_one_feed() {
        let f1 = IpcFrame::GetInfo;
        let f2 = IpcFrame::Input(b"x".to_vec());
        let f3 = IpcFrame::Close;
        let mut buf = Vec::new();
        buf.extend(f1.encode());
        buf.extend(f2.encode());
        buf.extend(f3.encode());

        let mut decoder = IpcFrameDecoder::new();
        let frames = decoder.feed(&buf).unwrap();
        assert_eq!(frames, vec![f1, f2, f3]);
    }

    #[test]
    fn partial_header_then_partial_payload_reassembles() {
        let frame = IpcFrame::Input(b"hello world".to_vec());
        let encoded = frame.encode();

        let mut decoder = IpcFrameDecoder::new();
        // Feed the header byte-by-byte, then nothing should come out yet.
        let frames = decoder.feed(&encoded[..3]).unwrap();
        assert!(frames.is_empty());
        assert!(decoder.has_partial());

        let frames = decoder.feed(&encoded[3..8]).unwrap();
        assert!(frames.is_empty());

        let frames = decoder.feed(&encoded[8..]).unwrap();
        assert_eq!(frames, vec![frame]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn unknown_type_is_invalid_frame() {
        let mut buf = Vec::new();
        buf.push(0xFF); // unknown type
        buf.extend_from_slice(&0u32.to_le_bytes());
        let mut decoder = IpcFrameDecoder::new();
        assert_eq!(decoder.feed(&buf), Err(FramingError::UnknownType(0xFF)));
    }

    #[test]
    fn oversize_length_is_invalid_frame() {
        let mut buf = Vec::new();
        buf.push(IpcFrameType::Input as u8);
        buf.extend_from_slice(&(MAX_FRAME_PAYLOAD + 1).to_le_bytes());
        let mut decoder = IpcFrameDecoder::new();
        assert_eq!(
            decoder.feed(&buf),
            Err(FramingError::PayloadTooLarge(MAX_FRAME_PAYLOAD + 1))
        );
    }

    #[test]
    fn set_name_rejects_invalid_utf8() {
        let mut buf = Vec::new();
        buf.push(IpcFrameType::SetName as u8);
        let bad = vec![0xFF, 0xFE];
        buf.extend_from_slice(&(bad.len() as u32).to_le_bytes());
        buf.extend_from_slice(&bad);
        let mut decoder = IpcFrameDecoder::new();
        assert!(decoder.feed(&buf).is_err());
    }

    #[test]
    fn empty_output_payload_is_valid() {
        roundtrip(IpcFrame::Output { cols: 1, rows: 1, data: Vec::new() });
    }
}
