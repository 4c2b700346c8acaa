//! Frame encoding/decoding between ring buffers
//!
//! Data frame format:
//! ```text
//! +-----+----+---------------------------+-----+
//! | END | id | payload (END/ESC escaped) | END |
//! +-----+----+---------------------------+-----+
//! ```
//!
//! Encoding writes straight into the free space of the tunnel buffer and
//! decoding un-escapes straight into the destination connection buffer, so
//! no intermediate allocation happens per frame. Decoding is resumable: a
//! frame may be split across any number of calls.

use super::RingBuffer;
use crate::protocol::{Command, COMMAND_FRAME_LEN, DATA_HEADER_LEN, END, ESC};

/// Outcome of one decode call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// The closing `END` was consumed
    Complete,
    /// Source exhausted or destination full before the end of the frame
    Partial,
}

fn needs_escape(byte: u8) -> bool {
    byte == END || byte == ESC
}

/// Cursor over the unread bytes of a buffer
struct Reader<'a> {
    first: &'a [u8],
    second: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a RingBuffer) -> Self {
        let (first, second) = buf.readable_slices();
        Self { first, second }
    }

    fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    fn at(&self, idx: usize) -> u8 {
        if idx < self.first.len() {
            self.first[idx]
        } else {
            self.second[idx - self.first.len()]
        }
    }
}

/// Cursor over the free space of a buffer
struct Writer<'a> {
    first: &'a mut [u8],
    second: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut RingBuffer) -> Self {
        let (first, second) = buf.writable_slices_mut();
        Self {
            first,
            second,
            pos: 0,
        }
    }

    fn put(&mut self, byte: u8) {
        if self.pos < self.first.len() {
            self.first[self.pos] = byte;
        } else {
            self.second[self.pos - self.first.len()] = byte;
        }
        self.pos += 1;
    }
}

/// Encode as much of `src` as fits into `dst` as one data frame for `id`.
///
/// Returns the number of payload bytes consumed from `src`; zero means
/// either `src` is empty or `dst` cannot hold a frame with at least one
/// payload byte. Room for the escape of each byte and for the closing `END`
/// is checked before the byte is emitted, so a frame is never left open.
pub fn encode_data(src: &mut RingBuffer, dst: &mut RingBuffer, id: u8) -> usize {
    let first = match src.peek_byte() {
        Some(b) => b,
        None => return 0,
    };
    let first_cost = if needs_escape(first) { 2 } else { 1 };
    let available = dst.free();
    if available < DATA_HEADER_LEN + first_cost + 1 {
        return 0;
    }

    let reader = Reader::new(src);
    let mut writer = Writer::new(dst);
    writer.put(END);
    writer.put(id);

    // Keep one byte for the trailing END.
    let mut room = available - DATA_HEADER_LEN - 1;
    let mut consumed = 0;
    while consumed < reader.len() {
        let byte = reader.at(consumed);
        let cost = if needs_escape(byte) { 2 } else { 1 };
        if room < cost {
            break;
        }
        if cost == 2 {
            writer.put(ESC);
        }
        writer.put(byte);
        room -= cost;
        consumed += 1;
    }
    writer.put(END);

    let written = writer.pos;
    src.advance_read(consumed);
    dst.advance_write(written);
    consumed
}

/// Un-escape payload bytes from `src` into `dst` until the closing `END`.
///
/// With `dst == None` the payload is consumed and discarded. An `ESC` that is
/// the last available byte is left in `src` so the pair is decoded together
/// on the next call.
pub fn decode_data(src: &mut RingBuffer, mut dst: Option<&mut RingBuffer>) -> Decoded {
    let reader = Reader::new(src);
    let limit = dst.as_ref().map_or(usize::MAX, |d| d.free());
    let mut writer = dst.as_deref_mut().map(Writer::new);

    let mut consumed = 0;
    let mut produced = 0;
    let mut result = Decoded::Partial;
    while consumed < reader.len() {
        let mut byte = reader.at(consumed);
        if byte == END {
            consumed += 1;
            result = Decoded::Complete;
            break;
        }
        if produced == limit {
            break;
        }
        if byte == ESC {
            if consumed + 1 == reader.len() {
                break;
            }
            byte = reader.at(consumed + 1);
            consumed += 2;
        } else {
            consumed += 1;
        }
        if let Some(writer) = writer.as_mut() {
            writer.put(byte);
        }
        produced += 1;
    }

    drop(writer);
    src.advance_read(consumed);
    if let Some(dst) = dst {
        dst.advance_write(produced);
    }
    result
}

/// Append a command frame. Returns `false` if `dst` lacks room for it.
pub fn encode_command(dst: &mut RingBuffer, cmd: Command) -> bool {
    if dst.free() < COMMAND_FRAME_LEN {
        return false;
    }
    dst.write_slice(&cmd.to_frame()) == COMMAND_FRAME_LEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandKind;

    fn filled(capacity: usize, data: &[u8]) -> RingBuffer {
        let mut buf = RingBuffer::new(capacity);
        assert_eq!(buf.write_slice(data), data.len());
        buf
    }

    fn drain(buf: &mut RingBuffer) -> Vec<u8> {
        let mut out = vec![0u8; buf.len()];
        buf.read_slice(&mut out);
        out
    }

    /// Payload containing both markers, plain bytes and a trailing ESC
    fn tricky_payload(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| match i % 5 {
                0 => END,
                3 => ESC,
                _ => (i * 31) as u8,
            })
            .collect()
    }

    #[test]
    fn test_escaping_layout() {
        let mut src = filled(16, &[0x01, END, ESC, 0x02]);
        let mut dst = RingBuffer::new(32);

        assert_eq!(encode_data(&mut src, &mut dst, 9), 4);
        assert!(src.is_empty());
        assert_eq!(
            drain(&mut dst),
            vec![END, 9, 0x01, ESC, END, ESC, ESC, 0x02, END]
        );
    }

    #[test]
    fn test_round_trip_all_lengths() {
        for len in 1..=64 {
            let payload = tricky_payload(len);
            let mut src = filled(64, &payload);
            let mut tunnel = RingBuffer::new(256);

            assert_eq!(encode_data(&mut src, &mut tunnel, 3), len);

            let mut header = [0u8; 2];
            tunnel.read_slice(&mut header);
            assert_eq!(header, [END, 3]);

            let mut out = RingBuffer::new(64);
            assert_eq!(decode_data(&mut tunnel, Some(&mut out)), Decoded::Complete);
            assert!(tunnel.is_empty());
            assert_eq!(drain(&mut out), payload, "payload length {}", len);
        }
    }

    #[test]
    fn test_empty_frame_decodes() {
        let mut tunnel = filled(8, &[END]);
        let mut out = RingBuffer::new(8);
        assert_eq!(decode_data(&mut tunnel, Some(&mut out)), Decoded::Complete);
        assert!(out.is_empty());
        assert!(tunnel.is_empty());
    }

    #[test]
    fn test_encode_needs_header_room() {
        let mut src = filled(8, b"abc");
        let mut dst = RingBuffer::new(3);
        assert_eq!(encode_data(&mut src, &mut dst, 1), 0);
        assert!(dst.is_empty());
        assert_eq!(src.len(), 3);

        // A leading marker needs one more byte for its escape.
        let mut src = filled(8, &[END]);
        let mut dst = RingBuffer::new(4);
        assert_eq!(encode_data(&mut src, &mut dst, 1), 0);
        let mut dst = RingBuffer::new(5);
        assert_eq!(encode_data(&mut src, &mut dst, 1), 1);
        assert!(dst.is_full());
    }

    #[test]
    fn test_encode_partial_keeps_frame_closed() {
        let mut src = filled(16, &[b'a', b'b', END, b'c']);
        let mut dst = RingBuffer::new(6);

        // Room for END, id, 'a', 'b', END; the escaped marker does not fit.
        assert_eq!(encode_data(&mut src, &mut dst, 7), 2);
        assert_eq!(drain(&mut dst), vec![END, 7, b'a', b'b', END]);
        assert_eq!(src.len(), 2);
        assert_eq!(src.peek_byte(), Some(END));
    }

    #[test]
    fn test_decode_resumes_with_small_destination() {
        let payload = tricky_payload(40);
        let mut src = filled(64, &payload);
        let mut tunnel = RingBuffer::new(128);
        encode_data(&mut src, &mut tunnel, 1);
        tunnel.advance_read(DATA_HEADER_LEN);

        let mut collected = Vec::new();
        let mut window = RingBuffer::new(7);
        loop {
            let result = decode_data(&mut tunnel, Some(&mut window));
            collected.extend(drain(&mut window));
            if result == Decoded::Complete {
                break;
            }
        }
        assert_eq!(collected, payload);
        assert!(tunnel.is_empty());
    }

    #[test]
    fn test_decode_resumes_with_fragmented_source() {
        let payload = tricky_payload(25);
        let mut src = filled(64, &payload);
        let mut encoded = RingBuffer::new(128);
        encode_data(&mut src, &mut encoded, 1);
        encoded.advance_read(DATA_HEADER_LEN);
        let wire = drain(&mut encoded);

        // Feed one byte at a time; an ESC split from its byte must wait.
        let mut tunnel = RingBuffer::new(8);
        let mut out = RingBuffer::new(64);
        let mut result = Decoded::Partial;
        for byte in wire {
            tunnel.write_slice(&[byte]);
            result = decode_data(&mut tunnel, Some(&mut out));
        }
        assert_eq!(result, Decoded::Complete);
        assert_eq!(drain(&mut out), payload);
    }

    #[test]
    fn test_decode_discard() {
        let mut tunnel = filled(16, &[b'x', ESC, END, b'y', END, 0x42]);
        assert_eq!(decode_data(&mut tunnel, None), Decoded::Complete);
        assert_eq!(drain(&mut tunnel), vec![0x42]);
    }

    #[test]
    fn test_command_frame_needs_five_bytes() {
        let mut dst = RingBuffer::new(9);
        let cmd = Command::new(CommandKind::Ack, 200);
        assert!(encode_command(&mut dst, cmd));
        assert!(!encode_command(&mut dst, cmd));
        assert_eq!(drain(&mut dst), vec![END, 0, 5, 200, END]);
    }
}
