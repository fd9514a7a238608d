//! Passive reader for the WebSocket frames the live server sends its clients.
//!
//! Tunnelled bytes are forwarded untouched; a [`FrameReader`] only looks at a
//! copy of them and hands back every complete text message it saw. Binary and
//! control frames are skipped without buffering.

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    fin: bool,
    opcode: u8,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: u64,
}

impl FrameHeader {
    /// `None` until the whole header is available.
    fn parse(bytes: &[u8]) -> Option<Self> {
        let (&first, &second) = (bytes.first()?, bytes.get(1)?);
        let (payload_len, mut header_len) = match second & 0x7f {
            126 => (u64::from(u16::from_be_bytes(bytes.get(2..4)?.try_into().ok()?)), 4),
            127 => (u64::from_be_bytes(bytes.get(2..10)?.try_into().ok()?), 10),
            short => (u64::from(short), 2),
        };
        let mask = if second & 0x80 != 0 {
            let key: [u8; 4] = bytes.get(header_len..header_len + 4)?.try_into().ok()?;
            header_len += 4;
            Some(key)
        } else {
            None
        };
        Some(Self {
            fin: first & 0x80 != 0,
            opcode: first & 0x0f,
            mask,
            header_len,
            payload_len,
        })
    }
}

#[derive(Debug)]
pub struct FrameReader {
    pending: Vec<u8>,
    /// Payload bytes of a skipped frame still to arrive.
    skip: u64,
    message: Vec<u8>,
    in_text: bool,
    oversized: bool,
    limit: usize,
}

impl FrameReader {
    /// Text messages longer than `limit` bytes are dropped.
    pub fn new(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            skip: 0,
            message: Vec::new(),
            in_text: false,
            oversized: false,
            limit,
        }
    }

    /// Consume the next chunk of the stream; returns the text messages it completed.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Vec<String> {
        if self.skip > 0 {
            let skipped = usize::try_from(self.skip).map_or(bytes.len(), |skip| skip.min(bytes.len()));
            self.skip -= skipped as u64;
            bytes = &bytes[skipped..];
        }
        self.pending.extend_from_slice(bytes);

        let mut messages = Vec::new();
        while let Some(header) = FrameHeader::parse(&self.pending) {
            if !self.begin(&header) {
                let available = (self.pending.len() - header.header_len) as u64;
                if available >= header.payload_len {
                    // Bounded by the buffered length checked just above.
                    let end = header.header_len + header.payload_len as usize;
                    self.pending.drain(..end);
                } else {
                    self.skip = header.payload_len - available;
                    self.pending.clear();
                }
                self.finish(&header, None, &mut messages);
                continue;
            }

            // Kept frames are at most `limit` bytes long.
            let end = header.header_len + header.payload_len as usize;
            if self.pending.len() < end {
                break;
            }
            let mut payload: Vec<u8> = self.pending.drain(..end).skip(header.header_len).collect();
            if let Some(key) = header.mask {
                for (index, byte) in payload.iter_mut().enumerate() {
                    *byte ^= key[index % 4];
                }
            }
            self.finish(&header, Some(payload), &mut messages);
        }
        messages
    }

    /// Whether the frame's payload should be collected.
    fn begin(&mut self, header: &FrameHeader) -> bool {
        let limit = self.limit as u64;
        match header.opcode {
            OPCODE_TEXT => {
                self.message.clear();
                self.in_text = true;
                self.oversized = header.payload_len > limit;
            }
            OPCODE_CONTINUATION if self.in_text => {
                if self.message.len() as u64 + header.payload_len > limit {
                    self.oversized = true;
                    self.message.clear();
                }
            }
            _ => return false,
        }
        !self.oversized
    }

    fn finish(&mut self, header: &FrameHeader, payload: Option<Vec<u8>>, out: &mut Vec<String>) {
        let data_frame = matches!(header.opcode, OPCODE_TEXT | OPCODE_CONTINUATION);
        if !self.in_text || !data_frame {
            return;
        }
        if let Some(payload) = payload {
            self.message.extend_from_slice(&payload);
        }
        if !header.fin {
            return;
        }

        match String::from_utf8(std::mem::take(&mut self.message)) {
            Ok(text) if !self.oversized => out.push(text),
            _ => {}
        }
        self.in_text = false;
        self.oversized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![(if fin { 0x80 } else { 0 }) | opcode];
        match payload.len() {
            len if len < 126 => bytes.push(len as u8),
            len if len <= usize::from(u16::MAX) => {
                bytes.push(126);
                bytes.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                bytes.push(127);
                bytes.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        bytes.extend_from_slice(payload);
        bytes
    }

    fn masked(payload: &[u8]) -> Vec<u8> {
        let key = [1u8, 2, 3, 4];
        let mut bytes = vec![0x81, 0x80 | payload.len() as u8];
        bytes.extend_from_slice(&key);
        bytes.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        bytes
    }

    #[test]
    fn whole_text_frames_become_messages() {
        let mut reader = FrameReader::new(1024);
        let mut stream = frame(true, OPCODE_TEXT, br#"{"op":"a"}"#);
        stream.extend(frame(true, OPCODE_TEXT, br#"{"op":"b"}"#));
        assert_eq!(reader.feed(&stream), vec![r#"{"op":"a"}"#, r#"{"op":"b"}"#]);
    }

    #[test]
    fn frames_split_across_reads_are_reassembled() {
        let mut reader = FrameReader::new(1024);
        let payload = "x".repeat(300);
        let stream = frame(true, OPCODE_TEXT, payload.as_bytes());

        assert!(reader.feed(&stream[..1]).is_empty());
        assert!(reader.feed(&stream[1..150]).is_empty());
        assert_eq!(reader.feed(&stream[150..]), vec![payload]);
    }

    #[test]
    fn fragmented_messages_survive_interleaved_control_frames() {
        let mut reader = FrameReader::new(1024);
        let mut stream = frame(false, OPCODE_TEXT, b"hello ");
        stream.extend(frame(true, 0x9, b"ping"));
        stream.extend(frame(true, OPCODE_CONTINUATION, b"world"));
        assert_eq!(reader.feed(&stream), vec!["hello world"]);
    }

    #[test]
    fn binary_and_oversized_messages_are_skipped() {
        let mut reader = FrameReader::new(8);
        let big = frame(true, OPCODE_TEXT, &[b'y'; 200]);
        let mut stream = frame(true, 0x2, &[0xff; 40]);
        stream.extend_from_slice(&big[..50]);
        assert!(reader.feed(&stream).is_empty());

        let mut rest = big[50..].to_vec();
        rest.extend(frame(true, OPCODE_TEXT, b"small"));
        assert_eq!(reader.feed(&rest), vec!["small"]);
    }

    #[test]
    fn masked_frames_are_unmasked() {
        let mut reader = FrameReader::new(64);
        assert_eq!(reader.feed(&masked(b"masked")), vec!["masked"]);
    }
}
