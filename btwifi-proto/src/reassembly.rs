//! Per-channel reassembly of notification chunks into complete messages

use crate::{Channel, ChannelMap, DEFAULT_MAX_MESSAGE_LEN, FrameError, TERMINATOR};

/// Accumulates chunks per channel until the terminator arrives.
///
/// A buffer exists only while a message is in flight on its channel and is
/// removed the moment it is handed out or the link is reset.
#[derive(Debug, Clone)]
pub struct Reassembler {
    buffers: ChannelMap<Option<Vec<u8>>>,
    max_message_len: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl Reassembler {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            buffers: ChannelMap::default(),
            max_message_len: max_message_len.max(1),
        }
    }

    /// Append a chunk. Returns the complete message (terminator stripped)
    /// once the buffer ends with the terminator.
    pub fn push(&mut self, channel: Channel, chunk: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        if chunk.is_empty() {
            return Ok(None);
        }

        let slot = &mut self.buffers[channel];
        let buffer = slot.get_or_insert_with(Vec::new);
        buffer.extend_from_slice(chunk);

        if buffer.len() > self.max_message_len + 1 {
            *slot = None;
            return Err(FrameError::Oversized { channel, limit: self.max_message_len });
        }

        if buffer.last() != Some(&TERMINATOR) {
            return Ok(None);
        }

        let mut message = slot.take().unwrap_or_default();
        message.pop();
        Ok(Some(message))
    }

    pub fn in_flight(&self, channel: Channel) -> bool {
        self.buffers[channel].is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.buffers.iter().all(|(_, buffer)| buffer.is_none())
    }

    /// Drop every partial message
    pub fn reset(&mut self) {
        for (_, buffer) in self.buffers.iter_mut() {
            *buffer = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{chunk_frame, decode_response, encode_frame};
    use crate::wire::{CommandEnvelope, ResponseEnvelope};
    use proptest::prelude::*;
    use serde_json::{Value, json};

    #[test]
    fn message_is_released_only_at_terminator() {
        let mut reassembler = Reassembler::default();
        assert_eq!(reassembler.push(Channel::Wifi, b"{\"c\":0,").unwrap(), None);
        assert!(reassembler.in_flight(Channel::Wifi));
        let message = reassembler.push(Channel::Wifi, b"\"r\":0}\n").unwrap().unwrap();
        assert_eq!(message, b"{\"c\":0,\"r\":0}");
        assert!(!reassembler.in_flight(Channel::Wifi));
    }

    #[test]
    fn channels_do_not_interleave() {
        let mut reassembler = Reassembler::default();
        reassembler.push(Channel::Wifi, b"{\"c\":0,").unwrap();
        let system = reassembler.push(Channel::System, b"{\"c\":9,\"r\":0}\n").unwrap();
        assert_eq!(system.as_deref(), Some(&b"{\"c\":9,\"r\":0}"[..]));
        assert!(reassembler.in_flight(Channel::Wifi));
        assert!(!reassembler.in_flight(Channel::System));
    }

    #[test]
    fn empty_chunks_do_not_open_a_buffer() {
        let mut reassembler = Reassembler::default();
        assert_eq!(reassembler.push(Channel::System, b"").unwrap(), None);
        assert!(reassembler.is_idle());
    }

    #[test]
    fn reset_discards_partial_messages() {
        let mut reassembler = Reassembler::default();
        reassembler.push(Channel::Wifi, b"{\"c\":").unwrap();
        reassembler.push(Channel::System, b"{").unwrap();
        reassembler.reset();
        assert!(reassembler.is_idle());

        // the next message starts clean
        let message = reassembler.push(Channel::Wifi, b"{\"c\":0,\"r\":0}\n").unwrap();
        assert!(decode_response(Channel::Wifi, &message.unwrap()).is_ok());
    }

    #[test]
    fn oversized_message_is_rejected_and_dropped() {
        let mut reassembler = Reassembler::new(8);
        assert_eq!(reassembler.push(Channel::Wifi, b"12345678").unwrap(), None);
        let err = reassembler.push(Channel::Wifi, b"9x").unwrap_err();
        assert!(matches!(err, FrameError::Oversized { limit: 8, .. }));
        assert!(!reassembler.in_flight(Channel::Wifi));
    }

    #[test]
    fn message_of_exactly_the_limit_fits() {
        let mut reassembler = Reassembler::new(4);
        assert_eq!(reassembler.push(Channel::Wifi, b"1234\n").unwrap(), Some(b"1234".to_vec()));
    }

    fn envelope_strategy() -> impl Strategy<Value = CommandEnvelope> {
        let entry = ("[ -~]{0,24}", "[0-9a-f:]{0,17}", -100i64..0, any::<bool>())
            .prop_map(|(e, m, s, p)| json!({"e": e, "m": m, "s": s, "p": p}));
        (0i32..6, proptest::option::of(proptest::collection::vec(entry, 0..6))).prop_map(
            |(command, entries)| CommandEnvelope {
                command,
                payload: entries.map(Value::Array),
            },
        )
    }

    proptest! {
        #[test]
        fn chunked_frames_reassemble_to_the_same_message(
            envelope in envelope_strategy(),
            chunk_len in 1usize..=20,
            result in 0i32..8,
        ) {
            let frame = encode_frame(&envelope).unwrap();
            let mut reassembler = Reassembler::default();
            let mut messages = Vec::new();
            for chunk in chunk_frame(&frame, chunk_len) {
                if let Some(message) = reassembler.push(Channel::Wifi, chunk).unwrap() {
                    messages.push(message);
                }
            }
            prop_assert_eq!(messages.len(), 1);
            prop_assert!(reassembler.is_idle());

            let decoded: CommandEnvelope = serde_json::from_slice(&messages[0]).unwrap();
            prop_assert_eq!(&decoded, &envelope);

            // the same bytes with a result code read back as a response
            let mut value: Value = serde_json::from_slice(&messages[0]).unwrap();
            value["r"] = json!(result);
            let response: ResponseEnvelope = serde_json::from_value(value).unwrap();
            prop_assert_eq!(response.command, envelope.command);
            prop_assert_eq!(response.payload, envelope.payload);
        }

        #[test]
        fn proper_prefixes_never_complete(
            envelope in envelope_strategy(),
            cut in any::<prop::sample::Index>(),
        ) {
            let frame = encode_frame(&envelope).unwrap();
            let prefix = &frame[..cut.index(frame.len())];
            let mut reassembler = Reassembler::default();
            for chunk in chunk_frame(prefix, 20) {
                prop_assert_eq!(reassembler.push(Channel::Wifi, chunk).unwrap(), None);
            }
        }
    }
}
