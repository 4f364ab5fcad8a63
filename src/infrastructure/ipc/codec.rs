//! Frame Codec
//!
//! Each message travels as a 4-byte big-endian length followed by that many
//! bytes of UTF-8 JSON. Frames never exceed [`MAX_FRAME_LEN`].
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | payload: len bytes (JSON) |
//! +----------------+---------------------------+
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Largest payload either side accepts
pub const MAX_FRAME_LEN: usize = 65536;
pub const PREFIX_LEN: usize = 4;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds the 65536 byte limit")]
    Oversized(usize),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the connection has to be torn down.
    ///
    /// A bad payload only costs that one message; framing and transport
    /// errors leave the byte stream unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Payload(_))
    }

    /// True for read timeouts on sockets configured with one
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

/// Serialize `message` into one complete frame
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(payload.len()));
    }

    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse the JSON body of a frame already split off by [`FrameDecoder`]
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decode exactly one frame held in `frame`.
///
/// Trailing bytes after the declared length are ignored.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, FrameError> {
    let mut decoder = FrameDecoder::new();
    decoder.extend(frame);
    match decoder.next_frame()? {
        Some(payload) => decode_payload(&payload),
        None => Err(FrameError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "incomplete frame",
        ))),
    }
}

/// Write one frame and flush
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), FrameError> {
    let frame = encode(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Incremental splitter for a byte stream that may deliver frames in
/// arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    expected: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes received but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete payload, if one is buffered.
    ///
    /// An oversized length prefix is reported as soon as the prefix itself
    /// has arrived, without waiting for the body.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let len = match self.expected {
            Some(len) => len,
            None => {
                if self.buffer.len() < PREFIX_LEN {
                    return Ok(None);
                }
                let prefix = [self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]];
                let len = u32::from_be_bytes(prefix) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(FrameError::Oversized(len));
                }
                self.expected = Some(len);
                len
            }
        };

        if self.buffer.len() < PREFIX_LEN + len {
            return Ok(None);
        }

        let payload = self.buffer[PREFIX_LEN..PREFIX_LEN + len].to_vec();
        self.buffer.drain(..PREFIX_LEN + len);
        self.expected = None;
        Ok(Some(payload))
    }
}

/// Blocking frame source over any reader.
///
/// Partial frames survive read errors, so a reader with a read timeout can
/// keep calling [`FrameReader::next_payload`] after a timeout.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
        }
    }

    /// Next raw payload, or `None` once the peer closed the stream
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                return Ok(Some(payload));
            }
            let n = match self.reader.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    return Err(FrameError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed mid-frame",
                    )));
                }
                return Ok(None);
            }
            self.decoder.extend(&chunk[..n]);
        }
    }

    /// Next payload parsed as `T`
    pub fn next_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        match self.next_payload()? {
            Some(payload) => decode_payload(&payload).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::ipc::messages::{BridgeMessage, ClientMessage, ErrorCode};
    use std::io::Cursor;

    #[test]
    fn test_frame_layout() {
        let frame = encode(&ClientMessage::Status).unwrap();
        let body = br#"{"type":"status"}"#;
        assert_eq!(&frame[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&frame[4..], body);
    }

    #[test]
    fn test_round_trip() {
        let message = BridgeMessage::HrData {
            bpm: 72,
            timestamp: 1_700_000_000.25,
            rr: Some(vec![812.5]),
        };
        let frame = encode(&message).unwrap();
        let decoded: BridgeMessage = decode(&frame).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_wall_clock_timestamp_keeps_last_digit() {
        let message = BridgeMessage::BridgeHeartbeat {
            timestamp: 1608553005.2305593,
        };
        let decoded: BridgeMessage = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_oversized_prefix_rejected_before_body() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&65537u32.to_be_bytes());
        assert!(matches!(decoder.next_frame(), Err(FrameError::Oversized(65537))));
    }

    #[test]
    fn test_max_size_prefix_accepted() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&65536u32.to_be_bytes());
        assert!(matches!(decoder.next_frame(), Ok(None)));
    }

    #[test]
    fn test_oversized_message_not_encoded() {
        let message = BridgeMessage::error(ErrorCode::AdapterFailure, "x".repeat(MAX_FRAME_LEN));
        assert!(matches!(encode(&message), Err(FrameError::Oversized(_))));
    }

    #[test]
    fn test_frame_split_across_three_chunks() {
        let frame = encode(&ClientMessage::Connect { id: "sim-hr-01".into() }).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&frame[..2]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&frame[2..7]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&frame[7..]);

        let payload = decoder.next_frame().unwrap().unwrap();
        let message: ClientMessage = decode_payload(&payload).unwrap();
        assert_eq!(message, ClientMessage::Connect { id: "sim-hr-01".into() });
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = encode(&ClientMessage::Status).unwrap();
        bytes.extend(encode(&ClientMessage::Disconnect).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        let first: ClientMessage = decode_payload(&decoder.next_frame().unwrap().unwrap()).unwrap();
        let second: ClientMessage = decode_payload(&decoder.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(first, ClientMessage::Status);
        assert_eq!(second, ClientMessage::Disconnect);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_malformed_json_is_not_fatal() {
        let err = decode_payload::<ClientMessage>(b"{not json").unwrap_err();
        assert!(!err.is_fatal());
        assert!(FrameError::Oversized(70000).is_fatal());
    }

    #[test]
    fn test_reader_yields_frames_then_eof() {
        let mut bytes = encode(&ClientMessage::Scan { on: true }).unwrap();
        bytes.extend(encode(&ClientMessage::Scan { on: false }).unwrap());
        let mut reader = FrameReader::new(Cursor::new(bytes));

        assert_eq!(
            reader.next_message::<ClientMessage>().unwrap(),
            Some(ClientMessage::Scan { on: true })
        );
        assert_eq!(
            reader.next_message::<ClientMessage>().unwrap(),
            Some(ClientMessage::Scan { on: false })
        );
        assert_eq!(reader.next_message::<ClientMessage>().unwrap(), None);
    }

    #[test]
    fn test_reader_truncated_stream_is_error() {
        let frame = encode(&ClientMessage::Status).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame[..frame.len() - 1].to_vec()));
        let err = reader.next_payload().unwrap_err();
        assert!(err.is_fatal());
    }

    mod chunking {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_any_chunking_yields_same_frames(
                names in proptest::collection::vec("[a-z0-9:-]{0,24}", 1..5),
                cuts in proptest::collection::vec(1usize..16, 0..40),
            ) {
                let messages: Vec<ClientMessage> = names
                    .into_iter()
                    .map(|id| ClientMessage::Connect { id })
                    .collect();
                let stream: Vec<u8> = messages
                    .iter()
                    .flat_map(|m| encode(m).unwrap())
                    .collect();

                let mut decoder = FrameDecoder::new();
                let mut decoded = Vec::new();
                let mut rest = stream.as_slice();
                let mut cuts = cuts.into_iter();
                while !rest.is_empty() {
                    let take = cuts.next().unwrap_or(rest.len()).min(rest.len());
                    decoder.extend(&rest[..take]);
                    rest = &rest[take..];
                    while let Some(payload) = decoder.next_frame().unwrap() {
                        decoded.push(decode_payload::<ClientMessage>(&payload).unwrap());
                    }
                }

                prop_assert_eq!(decoded, messages);
                prop_assert_eq!(decoder.buffered(), 0);
            }
        }
    }

    mod round_trip {
        use super::*;
        use crate::domain::models::PermissionState;
        use crate::infrastructure::ipc::messages::DeviceInfo;
        use proptest::num::f64 as float;
        use proptest::prelude::*;

        fn finite() -> impl Strategy<Value = f64> {
            prop_oneof![
                0.0..2e9f64,
                float::NORMAL | float::SUBNORMAL | float::ZERO,
            ]
        }

        fn permission() -> impl Strategy<Value = PermissionState> {
            prop_oneof![
                Just(PermissionState::Unknown),
                Just(PermissionState::Denied),
                Just(PermissionState::Authorized),
            ]
        }

        fn error_code() -> impl Strategy<Value = ErrorCode> {
            proptest::sample::select(vec![
                ErrorCode::DeviceNotFound,
                ErrorCode::Busy,
                ErrorCode::NotConnected,
                ErrorCode::ServiceNotFound,
                ErrorCode::CharacteristicNotFound,
                ErrorCode::SubscribeFailed,
                ErrorCode::ConnectTimeout,
                ErrorCode::ConnectFailed,
                ErrorCode::PermissionDenied,
                ErrorCode::ScanFailed,
                ErrorCode::AdapterFailure,
                ErrorCode::InvalidMessage,
            ])
        }

        fn bridge_message() -> impl Strategy<Value = BridgeMessage> {
            prop_oneof![
                any::<u32>().prop_map(|version| BridgeMessage::Ready { version }),
                permission().prop_map(|state| BridgeMessage::Permission { state }),
                (any::<String>(), any::<String>(), any::<i16>()).prop_map(|(id, name, rssi)| {
                    BridgeMessage::DeviceFound {
                        device: DeviceInfo { id, name, rssi },
                    }
                }),
                (any::<String>(), any::<Option<String>>())
                    .prop_map(|(device_id, name)| BridgeMessage::Connected { device_id, name }),
                (any::<String>(), any::<Option<String>>()).prop_map(|(device_id, reason)| {
                    BridgeMessage::Disconnected { device_id, reason }
                }),
                (
                    any::<u16>(),
                    finite(),
                    proptest::option::of(proptest::collection::vec(finite(), 0..8)),
                )
                    .prop_map(|(bpm, timestamp, rr)| BridgeMessage::HrData { bpm, timestamp, rr }),
                (permission(), any::<bool>(), any::<Option<String>>(), "[a-z]{0,12}").prop_map(
                    |(permission, connected, device_id, state)| BridgeMessage::Status {
                        permission,
                        connected,
                        device_id,
                        state,
                    }
                ),
                (error_code(), any::<String>())
                    .prop_map(|(code, message)| BridgeMessage::Error { code, message }),
                finite().prop_map(|timestamp| BridgeMessage::BridgeHeartbeat { timestamp }),
            ]
        }

        fn client_message() -> impl Strategy<Value = ClientMessage> {
            prop_oneof![
                (any::<Option<u32>>(), any::<Option<String>>())
                    .prop_map(|(version, client)| ClientMessage::Handshake { version, client }),
                any::<bool>().prop_map(|on| ClientMessage::Scan { on }),
                any::<String>().prop_map(|id| ClientMessage::Connect { id }),
                Just(ClientMessage::Disconnect),
                Just(ClientMessage::Status),
            ]
        }

        proptest! {
            #[test]
            fn prop_bridge_messages_survive_framing(message in bridge_message()) {
                let frame = encode(&message).unwrap();
                prop_assert_eq!(decode::<BridgeMessage>(&frame).unwrap(), message);
            }

            #[test]
            fn prop_client_messages_survive_framing(message in client_message()) {
                let frame = encode(&message).unwrap();
                prop_assert_eq!(decode::<ClientMessage>(&frame).unwrap(), message);
            }

            #[test]
            fn prop_wall_clock_timestamps_are_exact(timestamp in 0.0..2e9f64) {
                let message = BridgeMessage::HrData { bpm: 70, timestamp, rr: None };
                let decoded: BridgeMessage = decode(&encode(&message).unwrap()).unwrap();
                match decoded {
                    BridgeMessage::HrData { timestamp: back, .. } => {
                        prop_assert_eq!(back.to_bits(), timestamp.to_bits());
                    }
                    other => prop_assert!(false, "unexpected {:?}", other),
                }
            }
        }
    }
}
