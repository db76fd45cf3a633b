//! Bounded in-memory scrollback: a byte ring buffer keeping the most
//! recent N bytes of a session's filtered output.

pub struct ScrollbackBuffer {
    buffer: Vec<u8>,
    write_pos: usize,
    filled: bool,
    total_written: u64,
    max_size: usize,
}

impl ScrollbackBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: vec![0u8; max_size],
            write_pos: 0,
            filled: false,
            total_written: 0,
            max_size,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;

        if data.len() >= self.max_size {
            // Data larger than buffer -- keep the tail
            let start = data.len() - self.max_size;
            self.buffer[..self.max_size].copy_from_slice(&data[start..]);
            self.write_pos = 0;
            self.filled = true;
            return;
        }

        let space_left = self.max_size - self.write_pos;
        if data.len() <= space_left {
            self.buffer[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
            self.write_pos += data.len();
        } else {
            // Wrap around
            self.buffer[self.write_pos..self.write_pos + space_left]
                .copy_from_slice(&data[..space_left]);
            let remaining = data.len() - space_left;
            self.buffer[..remaining].copy_from_slice(&data[space_left..]);
            self.write_pos = remaining;
            self.filled = true;
        }

        if self.write_pos >= self.max_size {
            self.write_pos = 0;
            self.filled = true;
        }
    }

    /// Linearized contents for replay. When the ring has wrapped, the start
    /// is sanitized to the first newline so a reattaching viewer never sees
    /// a torn escape sequence or split UTF-8 character.
    pub fn read(&self) -> Vec<u8> {
        if !self.filled {
            return self.buffer[..self.write_pos].to_vec();
        }
        sanitize_start(self.read_raw())
    }

    pub fn size(&self) -> usize {
        if self.filled {
            self.max_size
        } else {
            self.write_pos
        }
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    fn read_raw(&self) -> Vec<u8> {
        if !self.filled {
            return self.buffer[..self.write_pos].to_vec();
        }
        let mut result = Vec::with_capacity(self.max_size);
        result.extend_from_slice(&self.buffer[self.write_pos..]);
        result.extend_from_slice(&self.buffer[..self.write_pos]);
        result
    }
}

/// Skip to the first newline in a wrapped buffer.
pub fn sanitize_start(buf: Vec<u8>) -> Vec<u8> {
    if let Some(idx) = buf.iter().position(|&b| b == b'\n') {
        if idx == 0 {
            buf
        } else {
            buf[idx + 1..].to_vec()
        }
    } else {
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read() {
        let mut buf = ScrollbackBuffer::new(64);
        buf.write(b"hello world");
        assert_eq!(buf.read(), b"hello world");
        assert_eq!(buf.size(), 11);
        assert_eq!(buf.total_written(), 11);
    }

    #[test]
    fn wraps_around_keeping_most_recent() {
        let mut buf = ScrollbackBuffer::new(16);
        buf.write(b"AAAAAAAAAA");
        buf.write(b"BBBBBBBBBB");
        assert_eq!(buf.size(), 16);
        assert_eq!(buf.total_written(), 20);
        let raw = buf.read_raw();
        // Most recent 16 bytes, linearized from the write position.
        assert_eq!(raw, b"AAAAAABBBBBBBBBB");
    }

    #[test]
    fn oversized_write_keeps_tail() {
        let mut buf = ScrollbackBuffer::new(64);
        let big = vec![b'X'; 128];
        buf.write(&big);
        assert_eq!(buf.size(), 64);
        assert_eq!(buf.total_written(), 128);
        assert!(buf.read_raw().iter().all(|&b| b == b'X'));
    }

    #[test]
    fn empty_read() {
        let buf = ScrollbackBuffer::new(64);
        assert!(buf.read().is_empty());
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn exact_capacity_write() {
        let mut buf = ScrollbackBuffer::new(8);
        buf.write(b"12345678");
        assert_eq!(buf.read_raw(), b"12345678");
        assert_eq!(buf.size(), 8);
    }

    #[test]
    fn wrapped_read_skips_partial_line() {
        let mut buf = ScrollbackBuffer::new(16);
        buf.write(b"old line\nnew line!");
        // Wrapped: read() must start at a line boundary.
        let replay = buf.read();
        assert!(!replay.starts_with(b"ld"), "partial line leaked: {:?}", replay);
    }

    #[test]
    fn sanitize_start_skips_to_first_newline() {
        assert_eq!(sanitize_start(b"partial\nreal line\n".to_vec()), b"real line\n");
    }

    #[test]
    fn sanitize_start_preserves_leading_newline() {
        assert_eq!(sanitize_start(b"\nfull line\n".to_vec()), b"\nfull line\n");
    }

    #[test]
    fn sanitize_start_no_newline() {
        assert_eq!(sanitize_start(b"no newline".to_vec()), b"no newline");
    }
}
