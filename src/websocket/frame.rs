//! Incremental RFC 6455 frame decoder and frame encoder.
//!
//! [`FrameParser::feed`] accepts byte chunks of any size, including chunks
//! that end mid-header, mid-mask or mid-payload, and reports what it decodes
//! through a [`FrameHandler`]. The only state carried between calls is the
//! parse phase, the partially read header field, the bytes left in the
//! current frame and the buffered message data not yet emitted.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{CloseCode, Opcode};
use crate::config::WebSocketConfig;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Protocol violations detected while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,

    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("control frame is fragmented")]
    FragmentedControl,

    #[error("control frame payload exceeds 125 bytes")]
    ControlTooLong,

    #[error("client frame is not masked")]
    Unmasked,

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("data frame started while a message is in progress")]
    MessageInterrupted,

    #[error("64-bit payload length has the most significant bit set")]
    LengthSignBit,

    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("message exceeds the {max} byte limit")]
    MessageTooLarge { max: u64 },

    #[error("text message is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid close frame: {0}")]
    InvalidClose(&'static str),
}

impl FrameError {
    /// The close code sent to the peer for this violation.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::FrameTooLarge { .. } | Self::MessageTooLarge { .. } => CloseCode::MessageTooBig,
            Self::InvalidUtf8 => CloseCode::InvalidPayload,
            _ => CloseCode::Protocol,
        }
    }
}

/// Receives decoded events from a [`FrameParser`].
pub trait FrameHandler {
    /// A piece of a text or binary message. `fin` marks the last piece.
    fn on_data(&mut self, payload: Bytes, binary: bool, fin: bool);

    /// A complete, unmasked close, ping or pong frame.
    fn on_control(&mut self, opcode: Opcode, payload: Bytes);

    /// A protocol violation. The parser ignores all further input.
    fn on_error(&mut self, error: FrameError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Length16,
    Length64,
    MaskingKey,
    Payload,
    Error,
}

/// Resumable frame decoder for one connection.
#[derive(Debug)]
pub struct FrameParser {
    state: State,
    require_mask: bool,
    validate_utf8: bool,
    max_frame_size: u64,
    max_message_size: u64,
    emit_threshold: usize,

    // Header bytes of the field currently being read.
    scratch: [u8; 8],
    filled: usize,

    fin: bool,
    opcode: Opcode,
    masked: bool,
    mask: [u8; 4],
    mask_offset: usize,
    remaining: u64,

    in_message: bool,
    binary: bool,
    message_len: u64,
    data: BytesMut,
    control: BytesMut,
}

impl FrameParser {
    /// Creates a parser for client-to-server traffic: masking is required.
    pub fn new(config: &WebSocketConfig) -> Self {
        Self {
            state: State::Start,
            require_mask: true,
            validate_utf8: config.validate_utf8,
            max_frame_size: config.max_frame_size,
            max_message_size: config.max_message_size,
            emit_threshold: config.emit_threshold.max(1),
            scratch: [0; 8],
            filled: 0,
            fin: false,
            opcode: Opcode::Continuation,
            masked: false,
            mask: [0; 4],
            mask_offset: 0,
            remaining: 0,
            in_message: false,
            binary: false,
            message_len: 0,
            data: BytesMut::new(),
            control: BytesMut::new(),
        }
    }

    /// Accepts unmasked frames (server-to-client traffic).
    #[must_use]
    pub fn require_mask(mut self, required: bool) -> Self {
        self.require_mask = required;
        self
    }

    /// `true` once a protocol error has been reported.
    pub fn is_failed(&self) -> bool {
        self.state == State::Error
    }

    /// `true` while a fragmented message is waiting for its final frame.
    pub fn in_message(&self) -> bool {
        self.in_message
    }

    /// Consumes `input` and returns the number of frames completed.
    pub fn feed<H: FrameHandler>(&mut self, input: &[u8], handler: &mut H) -> usize {
        let mut pos = 0;
        let mut frames = 0;

        loop {
            let step = match self.state {
                State::Error => return frames,
                State::Start => {
                    if !self.fill(input, &mut pos, 2) {
                        return frames;
                    }
                    let (b0, b1) = (self.scratch[0], self.scratch[1]);
                    self.start_frame(b0, b1)
                }
                State::Length16 => {
                    if !self.fill(input, &mut pos, 2) {
                        return frames;
                    }
                    let len = u16::from_be_bytes([self.scratch[0], self.scratch[1]]);
                    self.set_length(u64::from(len))
                }
                State::Length64 => {
                    if !self.fill(input, &mut pos, 8) {
                        return frames;
                    }
                    let len = u64::from_be_bytes(self.scratch);
                    if len >> 63 != 0 {
                        Err(FrameError::LengthSignBit)
                    } else if usize::try_from(len).is_err() {
                        Err(FrameError::FrameTooLarge {
                            len,
                            max: self.max_frame_size,
                        })
                    } else {
                        self.set_length(len)
                    }
                }
                State::MaskingKey => {
                    if !self.fill(input, &mut pos, 4) {
                        return frames;
                    }
                    self.mask.copy_from_slice(&self.scratch[..4]);
                    self.state = State::Payload;
                    Ok(())
                }
                State::Payload => {
                    let available = (input.len() - pos) as u64;
                    let take = available.min(self.remaining) as usize;
                    if take == 0 && self.remaining > 0 {
                        return frames;
                    }
                    self.read_payload(&input[pos..pos + take]);
                    pos += take;
                    self.remaining -= take as u64;

                    if self.remaining == 0 {
                        frames += 1;
                        self.state = State::Start;
                        self.finish_frame(handler)
                    } else if !self.opcode.is_control() && self.data.len() >= self.emit_threshold {
                        self.emit(false, handler)
                    } else {
                        Ok(())
                    }
                }
            };

            if let Err(error) = step {
                self.fail(error, handler);
                return frames;
            }
        }
    }

    // Copies bytes into `scratch` until `need` are present.
    fn fill(&mut self, input: &[u8], pos: &mut usize, need: usize) -> bool {
        let take = (need - self.filled).min(input.len() - *pos);
        self.scratch[self.filled..self.filled + take].copy_from_slice(&input[*pos..*pos + take]);
        self.filled += take;
        *pos += take;
        if self.filled == need {
            self.filled = 0;
            true
        } else {
            false
        }
    }

    fn start_frame(&mut self, b0: u8, b1: u8) -> Result<(), FrameError> {
        if b0 & 0x70 != 0 {
            return Err(FrameError::ReservedBits);
        }
        let opcode = Opcode::from_u8(b0 & 0x0F).ok_or(FrameError::UnknownOpcode(b0 & 0x0F))?;
        let fin = b0 & 0x80 != 0;
        let len7 = b1 & 0x7F;

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControl);
            }
            if usize::from(len7) > MAX_CONTROL_PAYLOAD {
                return Err(FrameError::ControlTooLong);
            }
        } else if opcode == Opcode::Continuation {
            if !self.in_message {
                return Err(FrameError::UnexpectedContinuation);
            }
        } else if self.in_message {
            return Err(FrameError::MessageInterrupted);
        } else {
            self.in_message = true;
            self.binary = opcode == Opcode::Binary;
            self.message_len = 0;
        }

        self.fin = fin;
        self.opcode = opcode;
        self.masked = b1 & 0x80 != 0;
        self.mask_offset = 0;

        match len7 {
            126 => {
                self.state = State::Length16;
                Ok(())
            }
            127 => {
                self.state = State::Length64;
                Ok(())
            }
            len => self.set_length(u64::from(len)),
        }
    }

    fn set_length(&mut self, len: u64) -> Result<(), FrameError> {
        if self.require_mask && !self.masked && len > 0 {
            return Err(FrameError::Unmasked);
        }
        if len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        if !self.opcode.is_control() {
            self.message_len += len;
            if self.message_len > self.max_message_size {
                return Err(FrameError::MessageTooLarge {
                    max: self.max_message_size,
                });
            }
        }

        self.remaining = len;
        self.state = if self.masked {
            State::MaskingKey
        } else {
            State::Payload
        };
        Ok(())
    }

    fn read_payload(&mut self, chunk: &[u8]) {
        let buf = if self.opcode.is_control() {
            &mut self.control
        } else {
            &mut self.data
        };
        let start = buf.len();
        buf.put_slice(chunk);
        if self.masked {
            apply_mask(&mut buf[start..], self.mask, self.mask_offset);
            self.mask_offset = (self.mask_offset + chunk.len()) % 4;
        }
    }

    fn finish_frame<H: FrameHandler>(&mut self, handler: &mut H) -> Result<(), FrameError> {
        if self.opcode.is_control() {
            let payload = self.control.split().freeze();
            if self.opcode == Opcode::Close {
                validate_close(&payload)?;
            }
            handler.on_control(self.opcode, payload);
            return Ok(());
        }

        if self.fin {
            self.emit(true, handler)?;
            self.in_message = false;
            self.message_len = 0;
        } else if self.data.len() >= self.emit_threshold {
            self.emit(false, handler)?;
        }
        Ok(())
    }

    // Delivers the buffered message data. For text, an incomplete UTF-8
    // sequence at the end of a partial delivery stays buffered.
    fn emit<H: FrameHandler>(&mut self, fin: bool, handler: &mut H) -> Result<(), FrameError> {
        let mut payload = self.data.split();

        if !self.binary && self.validate_utf8 {
            if let Err(e) = std::str::from_utf8(&payload) {
                if fin || e.error_len().is_some() {
                    return Err(FrameError::InvalidUtf8);
                }
                let tail = payload.split_off(e.valid_up_to());
                self.data.put_slice(&tail);
            }
        }

        if payload.is_empty() && !fin {
            return Ok(());
        }
        handler.on_data(payload.freeze(), self.binary, fin);
        Ok(())
    }

    fn fail<H: FrameHandler>(&mut self, error: FrameError, handler: &mut H) {
        self.state = State::Error;
        self.data.clear();
        self.control.clear();
        self.in_message = false;
        handler.on_error(error);
    }
}

/// XORs `buf` with the masking key, starting `offset` bytes into the key cycle.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) & 3];
    }
}

fn validate_close(payload: &[u8]) -> Result<(), FrameError> {
    match payload.len() {
        0 => Ok(()),
        1 => Err(FrameError::InvalidClose("payload of one byte")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseCode::is_sendable(code) {
                return Err(FrameError::InvalidClose("status code not allowed"));
            }
            std::str::from_utf8(&payload[2..]).map_err(|_| FrameError::InvalidUtf8)?;
            Ok(())
        }
    }
}

/// Encodes one frame. Server frames pass `mask: None`.
pub fn encode_frame(opcode: Opcode, payload: &[u8], fin: bool, mask: Option<[u8; 4]>) -> Bytes {
    let len = payload.len();
    let mut buf = BytesMut::with_capacity(len + 14);

    buf.put_u8(if fin { 0x80 } else { 0 } | opcode.as_u8());
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if len <= 125 {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(payload);
            apply_mask(&mut buf[start..], key, 0);
        }
        None => buf.put_slice(payload),
    }
    buf.freeze()
}

/// Splits a message into frames of at most `fragment_size` payload bytes.
/// A `fragment_size` of zero disables fragmentation.
pub fn encode_message(payload: &[u8], binary: bool, fragment_size: usize) -> Vec<Bytes> {
    let opcode = if binary { Opcode::Binary } else { Opcode::Text };
    if fragment_size == 0 || payload.len() <= fragment_size {
        return vec![encode_frame(opcode, payload, true, None)];
    }

    let count = payload.len().div_ceil(fragment_size);
    payload
        .chunks(fragment_size)
        .enumerate()
        .map(|(i, chunk)| {
            let op = if i == 0 { opcode } else { Opcode::Continuation };
            encode_frame(op, chunk, i + 1 == count, None)
        })
        .collect()
}

/// Builds a close payload. The reason is cut at a character boundary so the
/// payload fits a control frame.
pub fn close_payload(code: u16, reason: &str) -> Bytes {
    let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let mut buf = BytesMut::with_capacity(2 + end);
    buf.put_u16(code);
    buf.put_slice(&reason.as_bytes()[..end]);
    buf.freeze()
}

/// Reads the code and reason of a validated close payload. An empty payload
/// reports [`CloseCode::NoStatus`].
pub fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (CloseCode::NoStatus.as_u16(), String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    (code, String::from_utf8_lossy(&payload[2..]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Data(Vec<u8>, bool, bool),
        Control(Opcode, Vec<u8>),
        Error(FrameError),
    }

    #[derive(Default)]
    struct Recorder(Vec<Event>);

    impl FrameHandler for Recorder {
        fn on_data(&mut self, payload: Bytes, binary: bool, fin: bool) {
            self.0.push(Event::Data(payload.to_vec(), binary, fin));
        }

        fn on_control(&mut self, opcode: Opcode, payload: Bytes) {
            self.0.push(Event::Control(opcode, payload.to_vec()));
        }

        fn on_error(&mut self, error: FrameError) {
            self.0.push(Event::Error(error));
        }
    }

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn parser() -> FrameParser {
        FrameParser::new(&WebSocketConfig::default())
    }

    fn run(parser: &mut FrameParser, input: &[u8]) -> (usize, Vec<Event>) {
        let mut rec = Recorder::default();
        let n = parser.feed(input, &mut rec);
        (n, rec.0)
    }

    #[test]
    fn rfc_masked_hello() {
        // RFC 6455 §5.7: a single-frame masked text message containing "Hello".
        let wire = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let (n, events) = run(&mut parser(), &wire);
        assert_eq!(n, 1);
        assert_eq!(events, vec![Event::Data(b"Hello".to_vec(), false, true)]);
        assert_eq!(encode_frame(Opcode::Text, b"Hello", true, Some(KEY)).as_ref(), &wire);
    }

    #[test]
    fn round_trips_masked_and_unmasked() {
        let big = vec![7u8; 70_000];
        let cases: Vec<(Opcode, &[u8], bool)> = vec![
            (Opcode::Text, b"", true),
            (Opcode::Binary, b"\x00\x01\x02", true),
            (Opcode::Binary, &big[..300], true),
            (Opcode::Binary, &big, true),
            (Opcode::Ping, b"are you there", true),
            (Opcode::Pong, b"", true),
        ];

        for (opcode, payload, fin) in cases {
            for mask in [Some(KEY), None] {
                let wire = encode_frame(opcode, payload, fin, mask);
                let mut parser = parser().require_mask(mask.is_some());
                let (n, events) = run(&mut parser, &wire);
                assert_eq!(n, 1);
                let expected = if opcode.is_control() {
                    Event::Control(opcode, payload.to_vec())
                } else {
                    Event::Data(payload.to_vec(), opcode == Opcode::Binary, fin)
                };
                assert_eq!(events, vec![expected], "{opcode:?} masked={}", mask.is_some());
            }
        }
    }

    #[test]
    fn resumable_at_every_split() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(Opcode::Text, b"frag", false, Some(KEY)));
        wire.extend_from_slice(&encode_frame(Opcode::Ping, b"p", true, Some(KEY)));
        wire.extend_from_slice(&encode_frame(Opcode::Continuation, b"mented", true, Some(KEY)));
        wire.extend_from_slice(&encode_frame(Opcode::Binary, &[9u8; 200], true, Some(KEY)));
        wire.extend_from_slice(&encode_frame(Opcode::Close, &close_payload(1000, "bye"), true, Some(KEY)));

        let (frames, whole) = run(&mut parser(), &wire);
        assert_eq!(frames, 5);
        assert_eq!(whole.len(), 4);

        for chunk in 1..=wire.len() {
            let mut parser = parser();
            let mut rec = Recorder::default();
            let mut total = 0;
            for piece in wire.chunks(chunk) {
                total += parser.feed(piece, &mut rec);
            }
            assert_eq!(total, 5, "chunk size {chunk}");
            assert_eq!(rec.0, whole, "chunk size {chunk}");
        }
    }

    #[test]
    fn fragmented_close_is_protocol_error_without_data() {
        let mut wire = encode_frame(Opcode::Close, &close_payload(1000, ""), false, Some(KEY)).to_vec();
        wire.extend_from_slice(&encode_frame(Opcode::Text, b"after", true, Some(KEY)));
        let mut parser = parser();
        let (_, events) = run(&mut parser, &wire);
        assert_eq!(events, vec![Event::Error(FrameError::FragmentedControl)]);
        assert_eq!(FrameError::FragmentedControl.close_code(), CloseCode::Protocol);
        assert!(parser.is_failed());

        // Nothing more is processed once failed.
        let (n, events) = run(&mut parser, &encode_frame(Opcode::Text, b"x", true, Some(KEY)));
        assert_eq!((n, events), (0, vec![]));
    }

    #[test]
    fn unmasked_client_frame_is_rejected() {
        let (_, events) = run(&mut parser(), &encode_frame(Opcode::Text, b"hi", true, None));
        assert_eq!(events, vec![Event::Error(FrameError::Unmasked)]);

        // An empty unmasked frame carries nothing to unmask.
        let (n, events) = run(&mut parser(), &encode_frame(Opcode::Pong, b"", true, None));
        assert_eq!(n, 1);
        assert_eq!(events, vec![Event::Control(Opcode::Pong, vec![])]);
    }

    #[test]
    fn continuation_rules() {
        let (_, events) = run(&mut parser(), &encode_frame(Opcode::Continuation, b"x", true, Some(KEY)));
        assert_eq!(events, vec![Event::Error(FrameError::UnexpectedContinuation)]);

        let mut wire = encode_frame(Opcode::Text, b"a", false, Some(KEY)).to_vec();
        wire.extend_from_slice(&encode_frame(Opcode::Binary, b"b", true, Some(KEY)));
        let (_, events) = run(&mut parser(), &wire);
        assert_eq!(events, vec![Event::Error(FrameError::MessageInterrupted)]);
    }

    #[test]
    fn control_frame_limits() {
        let long = [0u8; 126];
        let (_, events) = run(&mut parser(), &encode_frame(Opcode::Ping, &long, true, Some(KEY)));
        assert_eq!(events, vec![Event::Error(FrameError::ControlTooLong)]);

        let (_, events) = run(&mut parser(), &encode_frame(Opcode::Close, &[0x03], true, Some(KEY)));
        assert!(matches!(events[..], [Event::Error(FrameError::InvalidClose(_))]));

        let (_, events) = run(&mut parser(), &encode_frame(Opcode::Close, &close_payload(1005, ""), true, Some(KEY)));
        assert!(matches!(events[..], [Event::Error(FrameError::InvalidClose(_))]));

        let (_, events) = run(&mut parser(), &encode_frame(Opcode::Close, &[0x03, 0xe8, 0xff], true, Some(KEY)));
        assert_eq!(events, vec![Event::Error(FrameError::InvalidUtf8)]);
    }

    #[test]
    fn reserved_bits_and_opcodes() {
        let (_, events) = run(&mut parser(), &[0xC1, 0x80, 0, 0, 0, 0]);
        assert_eq!(events, vec![Event::Error(FrameError::ReservedBits)]);
        let (_, events) = run(&mut parser(), &[0x83, 0x80, 0, 0, 0, 0]);
        assert_eq!(events, vec![Event::Error(FrameError::UnknownOpcode(3))]);
    }

    #[test]
    fn size_limits() {
        let config = WebSocketConfig::default().max_frame_size(16).max_message_size(24);

        let mut p = FrameParser::new(&config);
        let (_, events) = run(&mut p, &encode_frame(Opcode::Binary, &[0; 17], true, Some(KEY)));
        assert!(matches!(events[..], [Event::Error(FrameError::FrameTooLarge { len: 17, .. })]));

        let mut wire = encode_frame(Opcode::Binary, &[0; 16], false, Some(KEY)).to_vec();
        wire.extend_from_slice(&encode_frame(Opcode::Continuation, &[0; 16], true, Some(KEY)));
        let mut p = FrameParser::new(&config);
        let (_, events) = run(&mut p, &wire);
        assert_eq!(events, vec![Event::Error(FrameError::MessageTooLarge { max: 24 })]);
        assert_eq!(FrameError::MessageTooLarge { max: 24 }.close_code(), CloseCode::MessageTooBig);
    }

    #[test]
    fn sign_bit_in_64_bit_length() {
        let wire = [0x82, 0xFF, 0x80, 0, 0, 0, 0, 0, 0, 0];
        let (_, events) = run(&mut parser(), &wire);
        assert_eq!(events, vec![Event::Error(FrameError::LengthSignBit)]);
    }

    #[test]
    fn large_messages_are_emitted_early() {
        let mut config = WebSocketConfig::default();
        config.emit_threshold = 64;
        let payload = vec![1u8; 200];
        let wire = encode_frame(Opcode::Binary, &payload, true, Some(KEY));

        let mut p = FrameParser::new(&config);
        let mut rec = Recorder::default();
        for piece in wire.chunks(50) {
            p.feed(piece, &mut rec);
        }

        let mut joined = Vec::new();
        for (i, event) in rec.0.iter().enumerate() {
            let Event::Data(bytes, true, fin) = event else {
                panic!("unexpected event {event:?}");
            };
            assert_eq!(*fin, i + 1 == rec.0.len());
            joined.extend_from_slice(bytes);
        }
        assert!(rec.0.len() > 1);
        assert_eq!(joined, payload);
    }

    #[test]
    fn utf8_split_across_partial_emits() {
        let mut config = WebSocketConfig::default();
        config.emit_threshold = 4;
        // "aé€😀": 1 + 2 + 3 + 4 bytes.
        let text = "aé€😀".as_bytes();
        let wire = encode_frame(Opcode::Text, text, true, Some(KEY));

        for chunk in 1..=wire.len() {
            let mut p = FrameParser::new(&config);
            let mut rec = Recorder::default();
            for piece in wire.chunks(chunk) {
                p.feed(piece, &mut rec);
            }
            let mut joined = Vec::new();
            for event in &rec.0 {
                let Event::Data(bytes, false, _) = event else {
                    panic!("unexpected event {event:?}");
                };
                assert!(std::str::from_utf8(bytes).is_ok(), "chunk size {chunk}");
                joined.extend_from_slice(bytes);
            }
            assert_eq!(joined, text);
        }
    }

    #[test]
    fn invalid_utf8_is_1007() {
        let (_, events) = run(&mut parser(), &encode_frame(Opcode::Text, &[0x61, 0xff, 0x62], true, Some(KEY)));
        assert_eq!(events, vec![Event::Error(FrameError::InvalidUtf8)]);
        assert_eq!(FrameError::InvalidUtf8.close_code(), CloseCode::InvalidPayload);

        // A truncated sequence at the end of the final frame is invalid too.
        let (_, events) = run(&mut parser(), &encode_frame(Opcode::Text, &[0xe2, 0x82], true, Some(KEY)));
        assert_eq!(events, vec![Event::Error(FrameError::InvalidUtf8)]);
    }

    #[test]
    fn message_fragmentation() {
        let frames = encode_message(b"abcdefgh", false, 3);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0][0], 0x01);
        assert_eq!(frames[1][0], 0x00);
        assert_eq!(frames[2][0], 0x80);

        let mut p = parser().require_mask(false);
        let mut rec = Recorder::default();
        for frame in &frames {
            p.feed(frame, &mut rec);
        }
        assert_eq!(rec.0, vec![Event::Data(b"abcdefgh".to_vec(), false, true)]);
        assert_eq!(encode_message(b"", true, 3).len(), 1);
    }

    #[test]
    fn close_payload_helpers() {
        let long = "é".repeat(100);
        let payload = close_payload(1001, &long);
        assert!(payload.len() <= MAX_CONTROL_PAYLOAD);
        let (code, reason) = parse_close_payload(&payload);
        assert_eq!(code, 1001);
        assert!(long.starts_with(&reason));
        assert_eq!(parse_close_payload(&[]), (1005, String::new()));
    }
}
