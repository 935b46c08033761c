//! Meshtastic stream-API framing.
//!
//! Over TCP (and serial in protobuf mode) every protobuf is preceded by a four byte header:
//!
//!   `0x94 0xC3 <len_hi> <len_lo>`
//!
//! [`StreamDecoder`] accepts arbitrary chunks and yields whole payloads. Bytes that do not
//! start a valid header (console text, line noise) are skipped until the next `0x94`.

use bytes::{Buf, BytesMut};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
const HEADER_LEN: usize = 4;

/// Largest payload the firmware will emit; bigger declared lengths mean we are misaligned.
pub const MAX_PAYLOAD: usize = 512;

#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
    skipped: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded while resynchronising since the decoder was created.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Next complete payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buf.iter().position(|&b| b == START1) {
                Some(0) => {}
                Some(pos) => {
                    self.buf.advance(pos);
                    self.skipped += pos;
                }
                None => {
                    self.skipped += self.buf.len();
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            if self.buf[1] != START2 {
                self.buf.advance(1);
                self.skipped += 1;
                continue;
            }
            let declared = ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
            if declared == 0 || declared > MAX_PAYLOAD {
                self.buf.advance(1);
                self.skipped += 1;
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }
}

/// Prefix `payload` with the stream header.
pub fn encode_frame(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame payload too large ({} bytes)", payload.len()),
        ));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(START1);
    out.push(START2);
    out.push((payload.len() >> 8) as u8);
    out.push((payload.len() & 0xff) as u8);
    out.extend_from_slice(payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_split_frames() {
        let frame = encode_frame(b"hello").unwrap();
        let mut dec = StreamDecoder::new();
        dec.push(&frame[..3]);
        assert!(dec.next_frame().is_none());
        dec.push(&frame[3..]);
        assert_eq!(dec.next_frame().as_deref(), Some(&b"hello"[..]));
        assert!(dec.next_frame().is_none());
    }

    #[test]
    fn skips_console_noise_between_frames() {
        let mut dec = StreamDecoder::new();
        dec.push(b"DEBUG | boot\r\n");
        dec.push(&encode_frame(b"a").unwrap());
        dec.push(&[0x94, 0x00, 0x94]);
        dec.push(&encode_frame(b"bc").unwrap());
        assert_eq!(dec.next_frame().as_deref(), Some(&b"a"[..]));
        assert_eq!(dec.next_frame().as_deref(), Some(&b"bc"[..]));
        assert!(dec.skipped() >= 14);
    }

    #[test]
    fn oversize_declared_length_resyncs() {
        let mut dec = StreamDecoder::new();
        dec.push(&[START1, START2, 0xff, 0xff]);
        dec.push(&encode_frame(b"ok").unwrap());
        assert_eq!(dec.next_frame().as_deref(), Some(&b"ok"[..]));
    }

    #[test]
    fn encode_rejects_oversize_payload() {
        assert!(encode_frame(&vec![0u8; MAX_PAYLOAD + 1]).is_err());
    }
}
