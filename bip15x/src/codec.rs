//! Framing of application messages into wire packets and back
//!
//! Outbound messages are split into packets of at most `max_packet_payload`
//! bytes. A message that fits one packet travels as a lone
//! [MsgType::FragmentFinal]; larger messages start with a
//! [MsgType::FragmentHeader] announcing the total length, continue with
//! [MsgType::FragmentContinuation] packets and end with a
//! [MsgType::FragmentFinal]. All packets of a message share its message id.
//!
//! Inbound bytes are accumulated by [FrameDecoder] until whole packets are
//! available. Handshake, rekey and heartbeat frames are returned as soon as
//! they are decoded, even between two fragments of an application message,
//! so the caller can update the session cipher before the next packet is
//! opened.

use log::trace;

use crate::msgs::{
    HandshakeFrame, MsgType, CONTROL_MSG_ID, FRAGMENT_TOTAL_LEN, HEADER_LEN, LENGTH_LEN,
    MAX_HANDSHAKE_PAYLOAD, MAX_PACKET_BODY_LEN, MIN_SEALED_BODY_LEN,
};
use crate::protocol::SessionCipher;
use crate::{Error, Result};

/// One complete packet as written to the transport
pub type WirePacket = Vec<u8>;

/// Plaintext content of one packet before sealing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub msg_type: MsgType,
    pub msg_id: u32,
    pub payload: Vec<u8>,
}

/// Reasons decoding can fail; all of them are fatal to the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    SerializationFailed(String),
    UnexpectedFragment { expected: u32, got: u32 },
    DecryptionFailed,
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::SerializationFailed(m) => Error::SerializationFailed(m),
            FrameError::UnexpectedFragment { expected, got } => {
                Error::UnexpectedFragment { expected, got }
            }
            FrameError::DecryptionFailed => Error::DecryptionFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The buffer holds no complete packet; the bytes are kept for the next call
    NeedMoreBytes,
    /// A fully reassembled application message
    CompleteMessage(Vec<u8>),
    /// A frame for the handshake engine
    HandshakeFrame(HandshakeFrame),
    /// A keep-alive frame; only of interest for liveness tracking
    Heartbeat,
    Error(FrameError),
}

/// Write one packet; it is sealed iff `cipher` is given and active
pub fn encode_packet(
    msg_type: MsgType,
    msg_id: u32,
    payload: &[u8],
    cipher: Option<&mut SessionCipher>,
) -> Result<WirePacket> {
    let mut body = Vec::with_capacity(HEADER_LEN + payload.len());
    body.push(msg_type as u8);
    body.extend_from_slice(&msg_id.to_le_bytes());
    body.extend_from_slice(payload);

    match cipher.filter(|c| c.is_active()) {
        Some(cipher) => {
            let len = length_prefix(body.len() + bip15x_ciphers::aead::TAG_LEN)?;
            let sealed = cipher.encrypt(&len, &body)?;
            let mut packet = Vec::with_capacity(LENGTH_LEN + sealed.len());
            packet.extend_from_slice(&len);
            packet.extend_from_slice(&sealed);
            Ok(packet)
        }
        None => {
            let len = length_prefix(body.len())?;
            let mut packet = Vec::with_capacity(LENGTH_LEN + body.len());
            packet.extend_from_slice(&len);
            packet.extend_from_slice(&body);
            Ok(packet)
        }
    }
}

fn length_prefix(body_len: usize) -> Result<[u8; LENGTH_LEN]> {
    if body_len > MAX_PACKET_BODY_LEN {
        return Err(Error::SerializationFailed(format!(
            "packet body of {body_len} bytes exceeds the limit of {MAX_PACKET_BODY_LEN}"
        )));
    }
    Ok((body_len as u32).to_le_bytes())
}

/// Splits outbound messages and assigns message ids
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    next_msg_id: u32,
    max_packet_payload: usize,
}

impl FrameEncoder {
    pub fn new(max_packet_payload: usize) -> Self {
        Self {
            next_msg_id: 1,
            max_packet_payload: max_packet_payload.max(FRAGMENT_TOTAL_LEN + 1),
        }
    }

    pub fn max_packet_payload(&self) -> usize {
        self.max_packet_payload
    }

    fn take_msg_id(&mut self) -> u32 {
        let id = self.next_msg_id;
        // 0 is reserved for control frames
        self.next_msg_id = self.next_msg_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Split `payload` into the fragments of one message without sealing them
    pub fn fragments(&mut self, payload: &[u8]) -> Result<Vec<Fragment>> {
        let total = u32::try_from(payload.len()).map_err(|_| {
            Error::SerializationFailed(format!("message of {} bytes is too long", payload.len()))
        })?;
        let msg_id = self.take_msg_id();
        let max = self.max_packet_payload;

        if payload.len() <= max {
            return Ok(vec![Fragment {
                msg_type: MsgType::FragmentFinal,
                msg_id,
                payload: payload.to_vec(),
            }]);
        }

        let first_len = max - FRAGMENT_TOTAL_LEN;
        let mut head = Vec::with_capacity(max);
        head.extend_from_slice(&total.to_le_bytes());
        head.extend_from_slice(&payload[..first_len]);
        let mut frags = vec![Fragment {
            msg_type: MsgType::FragmentHeader,
            msg_id,
            payload: head,
        }];

        let mut rest = &payload[first_len..];
        while !rest.is_empty() {
            let n = rest.len().min(max);
            let msg_type = match n == rest.len() {
                true => MsgType::FragmentFinal,
                false => MsgType::FragmentContinuation,
            };
            frags.push(Fragment {
                msg_type,
                msg_id,
                payload: rest[..n].to_vec(),
            });
            rest = &rest[n..];
        }
        Ok(frags)
    }

    /// Encode `payload` as one or more packets, sealed with `cipher` when active
    pub fn encode(
        &mut self,
        payload: &[u8],
        mut cipher: Option<&mut SessionCipher>,
    ) -> Result<Vec<WirePacket>> {
        self.fragments(payload)?
            .into_iter()
            .map(|f| encode_packet(f.msg_type, f.msg_id, &f.payload, cipher.as_deref_mut()))
            .collect()
    }

    /// The empty keep-alive packet
    pub fn encode_heartbeat(&self, cipher: Option<&mut SessionCipher>) -> Result<WirePacket> {
        encode_packet(MsgType::Heartbeat, CONTROL_MSG_ID, &[], cipher)
    }
}

#[derive(Debug)]
struct PartialMessage {
    msg_id: u32,
    total_len: usize,
    data: Vec<u8>,
}

/// Accumulates inbound bytes and reassembles messages
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    partial: Option<PartialMessage>,
    max_body_len: usize,
    max_message_len: usize,
}

impl FrameDecoder {
    pub fn new(max_packet_payload: usize, max_message_len: usize) -> Self {
        let max_body_len = (max_packet_payload + HEADER_LEN + bip15x_ciphers::aead::TAG_LEN)
            .max(HEADER_LEN + MAX_HANDSHAKE_PAYLOAD + bip15x_ciphers::aead::TAG_LEN)
            .min(MAX_PACKET_BODY_LEN);
        Self {
            buf: Vec::new(),
            partial: None,
            max_body_len,
            max_message_len,
        }
    }

    /// Bytes received but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether some fragments of a message have been received
    pub fn has_partial_message(&self) -> bool {
        self.partial.is_some()
    }

    /// Append received bytes without decoding them
    pub fn feed(&mut self, raw_bytes: &[u8]) {
        self.buf.extend_from_slice(raw_bytes);
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.partial = None;
    }

    /// Append `raw_bytes` to the buffer and decode the next outcome
    ///
    /// Call again with an empty slice until [DecodeOutcome::NeedMoreBytes] is
    /// returned to drain everything buffered. `cipher` is used to open
    /// packets when it is given and active.
    pub fn decode(
        &mut self,
        raw_bytes: &[u8],
        mut cipher: Option<&mut SessionCipher>,
    ) -> DecodeOutcome {
        self.feed(raw_bytes);
        loop {
            let outcome = self.decode_packet(cipher.as_deref_mut());
            match outcome {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => continue,
                Err(e) => {
                    self.reset();
                    return DecodeOutcome::Error(e);
                }
            }
        }
    }

    /// Consume at most one packet
    ///
    /// Returns `Ok(None)` when a fragment was absorbed into the partial message.
    fn decode_packet(
        &mut self,
        cipher: Option<&mut SessionCipher>,
    ) -> Result<Option<DecodeOutcome>, FrameError> {
        use FrameError as E;

        if self.buf.len() < LENGTH_LEN {
            return Ok(Some(DecodeOutcome::NeedMoreBytes));
        }
        let mut len_bytes = [0u8; LENGTH_LEN];
        len_bytes.copy_from_slice(&self.buf[..LENGTH_LEN]);
        let body_len = u32::from_le_bytes(len_bytes) as usize;

        let cipher = cipher.filter(|c| c.is_active());
        let min_len = match cipher.is_some() {
            true => MIN_SEALED_BODY_LEN,
            false => HEADER_LEN,
        };
        // A plausible length with missing bytes is a packet still in flight.
        // This can not be told apart from a corrupted length field that happens
        // to look plausible; such a stream stalls instead of failing.
        if body_len < min_len || body_len > self.max_body_len {
            return Err(E::SerializationFailed(format!(
                "packet length {body_len} outside of {min_len}..={}",
                self.max_body_len
            )));
        }
        if self.buf.len() < LENGTH_LEN + body_len {
            return Ok(Some(DecodeOutcome::NeedMoreBytes));
        }

        let packet: Vec<u8> = self.buf.drain(..LENGTH_LEN + body_len).collect();
        let sealed = cipher.is_some();
        let body = match cipher {
            Some(cipher) => cipher
                .decrypt(&packet[..LENGTH_LEN], &packet[LENGTH_LEN..])
                .map_err(|_| E::DecryptionFailed)?,
            None => packet[LENGTH_LEN..].to_vec(),
        };

        let msg_type = MsgType::try_from(body[0]).map_err(|e| E::SerializationFailed(e.to_string()))?;
        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&body[1..HEADER_LEN]);
        let msg_id = u32::from_le_bytes(id_bytes);
        let payload = &body[HEADER_LEN..];
        trace!("Decoded {msg_type:?} packet {msg_id} with {} bytes", payload.len());

        if !sealed && !msg_type.is_plaintext() {
            return Err(E::SerializationFailed(format!(
                "{msg_type:?} frame received without encryption"
            )));
        }

        if msg_type.is_handshake() {
            if payload.len() > MAX_HANDSHAKE_PAYLOAD {
                return Err(E::SerializationFailed(format!(
                    "{msg_type:?} frame of {} bytes is too long",
                    payload.len()
                )));
            }
            return Ok(Some(DecodeOutcome::HandshakeFrame(HandshakeFrame::new(
                msg_type, payload,
            ))));
        }

        match msg_type {
            MsgType::Heartbeat => Ok(Some(DecodeOutcome::Heartbeat)),
            MsgType::FragmentHeader => {
                if let Some(p) = &self.partial {
                    return Err(E::UnexpectedFragment {
                        expected: p.msg_id,
                        got: msg_id,
                    });
                }
                if payload.len() < FRAGMENT_TOTAL_LEN {
                    return Err(E::SerializationFailed("truncated fragment header".into()));
                }
                let mut total = [0u8; FRAGMENT_TOTAL_LEN];
                total.copy_from_slice(&payload[..FRAGMENT_TOTAL_LEN]);
                let total_len = u32::from_le_bytes(total) as usize;
                let chunk = &payload[FRAGMENT_TOTAL_LEN..];
                if total_len > self.max_message_len {
                    return Err(E::SerializationFailed(format!(
                        "message of {total_len} bytes exceeds the limit of {}",
                        self.max_message_len
                    )));
                }
                if chunk.len() >= total_len {
                    return Err(E::SerializationFailed(
                        "fragment header carries the whole message".into(),
                    ));
                }
                let mut data = Vec::with_capacity(total_len);
                data.extend_from_slice(chunk);
                self.partial = Some(PartialMessage {
                    msg_id,
                    total_len,
                    data,
                });
                Ok(None)
            }
            MsgType::FragmentContinuation | MsgType::FragmentFinal => {
                let is_final = msg_type == MsgType::FragmentFinal;
                let Some(mut p) = self.partial.take() else {
                    return match is_final {
                        true => Ok(Some(DecodeOutcome::CompleteMessage(payload.to_vec()))),
                        false => Err(E::SerializationFailed(
                            "fragment continuation without header".into(),
                        )),
                    };
                };
                if p.msg_id != msg_id {
                    return Err(E::UnexpectedFragment {
                        expected: p.msg_id,
                        got: msg_id,
                    });
                }
                p.data.extend_from_slice(payload);
                match (is_final, p.data.len().cmp(&p.total_len)) {
                    (true, std::cmp::Ordering::Equal) => {
                        Ok(Some(DecodeOutcome::CompleteMessage(p.data)))
                    }
                    (false, std::cmp::Ordering::Less) => {
                        self.partial = Some(p);
                        Ok(None)
                    }
                    _ => Err(E::SerializationFailed(format!(
                        "message {msg_id} announced {} bytes, got {}",
                        p.total_len,
                        p.data.len()
                    ))),
                }
            }
            // handshake types were handled above
            _ => Err(E::SerializationFailed(format!("unexpected {msg_type:?} frame"))),
        }
    }
}
