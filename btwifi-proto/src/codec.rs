//! Framing: compact JSON + newline terminator, split into characteristic-sized chunks

use crate::wire::{CommandEnvelope, ResponseEnvelope};
use crate::{Channel, FrameError, MAX_CHUNK_LEN, TERMINATOR};

/// Encode a command as one terminated frame
pub fn encode_frame(envelope: &CommandEnvelope) -> Result<Vec<u8>, FrameError> {
    let mut frame = serde_json::to_vec(envelope).map_err(FrameError::Encode)?;
    frame.push(TERMINATOR);
    Ok(frame)
}

/// Split a frame into chunks of at most `max_chunk_len` bytes (clamped to 1..=20)
pub fn chunk_frame(frame: &[u8], max_chunk_len: usize) -> std::slice::Chunks<'_, u8> {
    frame.chunks(max_chunk_len.clamp(1, MAX_CHUNK_LEN))
}

/// Decode one complete message received on `channel`
pub fn decode_response(channel: Channel, message: &[u8]) -> Result<ResponseEnvelope, FrameError> {
    serde_json::from_slice(message).map_err(|source| FrameError::Decode { channel, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_is_compact_and_terminated() {
        let frame = encode_frame(&CommandEnvelope::with_payload(1, json!({"e": "a b"}))).unwrap();
        assert_eq!(frame, b"{\"c\":1,\"p\":{\"e\":\"a b\"}}\n");
    }

    #[test]
    fn newlines_inside_strings_are_escaped() {
        let frame = encode_frame(&CommandEnvelope::with_payload(1, json!({"e": "a\nb"}))).unwrap();
        assert_eq!(frame.iter().filter(|b| **b == TERMINATOR).count(), 1);
        assert_eq!(frame.last(), Some(&TERMINATOR));
    }

    #[test]
    fn chunks_never_exceed_transport_limit() {
        let frame = vec![b'x'; 47];
        let sizes: Vec<_> = chunk_frame(&frame, 20).map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![20, 20, 7]);

        let sizes: Vec<_> = chunk_frame(&frame, 512).map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![20, 20, 7]);

        assert_eq!(chunk_frame(&frame, 0).count(), 47);
    }

    #[test]
    fn decode_error_names_the_channel() {
        let err = decode_response(Channel::Wifi, b"{\"c\":0,").unwrap_err();
        assert!(matches!(err, FrameError::Decode { channel: Channel::Wifi, .. }));
    }

    #[test]
    fn missing_result_code_reads_as_success() {
        let response = decode_response(Channel::Wifi, b"{\"c\":4}").unwrap();
        assert_eq!(response.command, 4);
        assert!(response.is_success());

        let failed = decode_response(Channel::Wifi, b"{\"c\":1,\"r\":2}").unwrap();
        assert!(!failed.is_success());
        assert!(decode_response(Channel::Wifi, b"{\"r\":0}").is_err());
    }
}
