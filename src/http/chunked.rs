use std::io::{self, BufRead, Read};

/// Decodes a `Transfer-Encoding: chunked` request body.
///
/// Reads never cross the boundary of the chunk being consumed. A size line
/// that is not valid hex ends the body without reading past it, and the
/// body is reported as malformed.
pub struct ChunkedReader<R> {
    stream: R,
    remaining: usize,
    started: bool,
    done: bool,
    malformed: bool,
}

impl<R: BufRead> ChunkedReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            remaining: 0,
            started: false,
            done: false,
            malformed: false,
        }
    }

    /// `true` once the terminating chunk (or an unparsable size) was read.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// `true` if a chunk size could not be parsed. What follows on the
    /// stream is not known to be a request boundary.
    #[inline]
    pub fn is_malformed(&self) -> bool {
        self.malformed
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        let mut line = Vec::new();

        if self.started {
            // CRLF closing the previous chunk's data
            self.stream.read_until(b'\n', &mut line)?;
            line.clear();
        }
        self.started = true;

        self.stream.read_until(b'\n', &mut line)?;

        match parse_size(&line) {
            Some(0) => {
                self.done = true;
                self.skip_trailers()
            }
            None => {
                self.done = true;
                self.malformed = true;
                Ok(())
            }
            Some(size) => {
                self.remaining = size;
                Ok(())
            }
        }
    }

    fn skip_trailers(&mut self) -> io::Result<()> {
        let mut line = Vec::new();
        loop {
            line.clear();
            if self.stream.read_until(b'\n', &mut line)? == 0 {
                return Ok(());
            }
            if line.trim_ascii().is_empty() {
                return Ok(());
            }
        }
    }

    /// Reads one line of the decoded body, newline included.
    ///
    /// Returns `0` at end of body.
    pub fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let mut byte = [0u8; 1];
        let mut read = 0;

        while self.read(&mut byte)? == 1 {
            buf.push(byte[0]);
            read += 1;
            if byte[0] == b'\n' {
                break;
            }
        }

        Ok(read)
    }
}

impl<R: BufRead> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.remaining == 0 {
            if self.done {
                return Ok(0);
            }
            self.next_chunk()?;
        }

        let max = buf.len().min(self.remaining);
        let read = self.stream.read(&mut buf[..max])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "chunked body ended inside a chunk",
            ));
        }

        self.remaining -= read;
        Ok(read)
    }
}

#[inline]
fn parse_size(line: &[u8]) -> Option<usize> {
    let line = line.trim_ascii();
    let digits = match memchr::memchr(b';', line) {
        Some(ext) => line[..ext].trim_ascii(),
        None => line,
    };

    let digits = std::str::from_utf8(digits).ok()?;
    usize::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE_CHUNKED_REQUEST: &[u8] = b"25\r\n\
        This is the data in the first chunk\r\n\r\n\
        1C\r\n\
        and this is the second one\r\n\r\n\
        3\r\n\
        con\r\n\
        8\r\n\
        sequence\r\n\
        0\r\n\
        \r\n";

    const SAMPLE_CHUNKED_ANSWER: &[u8] = b"This is the data in the first chunk\r\n\
        and this is the second one\r\n\
        consequence";

    #[test]
    fn read_by_byte() {
        let mut chunky = ChunkedReader::new(Cursor::new(SAMPLE_CHUNKED_REQUEST));
        let mut result = Vec::new();
        let mut byte = [0u8; 1];

        while chunky.read(&mut byte).unwrap() == 1 {
            result.push(byte[0]);
        }

        assert_eq!(result, SAMPLE_CHUNKED_ANSWER);
        assert!(chunky.is_done());
        assert_eq!(chunky.read(&mut byte).unwrap(), 0);
    }

    #[test]
    fn read_lines() {
        let mut chunky = ChunkedReader::new(Cursor::new(SAMPLE_CHUNKED_REQUEST));
        let answer = Cursor::new(SAMPLE_CHUNKED_ANSWER);

        for expected in answer.split(b'\n') {
            let mut expected = expected.unwrap();
            if expected.ends_with(b"\r") {
                expected.push(b'\n');
            }

            let mut line = Vec::new();
            chunky.read_line(&mut line).unwrap();
            assert_eq!(line, expected);
        }

        let mut line = Vec::new();
        assert_eq!(chunky.read_line(&mut line).unwrap(), 0);
    }

    #[test]
    fn read_to_end_stops_at_terminator() {
        let mut stream = SAMPLE_CHUNKED_REQUEST.to_vec();
        stream.extend_from_slice(b"GET /next HTTP/1.1\r\n");

        let mut cursor = Cursor::new(stream);
        let mut body = Vec::new();
        ChunkedReader::new(&mut cursor).read_to_end(&mut body).unwrap();

        assert_eq!(body, SAMPLE_CHUNKED_ANSWER);

        let mut rest = String::new();
        cursor.read_line(&mut rest).unwrap();
        assert_eq!(rest, "GET /next HTTP/1.1\r\n");
    }

    #[test]
    fn bad_size_is_end_of_body() {
        let mut cursor = Cursor::new(&b"5\r\nhello\r\nzz\r\nGET /next HTTP/1.1\r\n\r\n"[..]);
        let mut chunky = ChunkedReader::new(&mut cursor);
        let mut body = Vec::new();
        chunky.read_to_end(&mut body).unwrap();

        assert_eq!(body, b"hello");
        assert!(chunky.is_done());
        assert!(chunky.is_malformed());

        let mut rest = String::new();
        cursor.read_line(&mut rest).unwrap();
        assert_eq!(rest, "GET /next HTTP/1.1\r\n");
    }

    #[test]
    fn terminator_is_well_formed() {
        let mut chunky = ChunkedReader::new(Cursor::new(SAMPLE_CHUNKED_REQUEST));
        let mut body = Vec::new();
        chunky.read_to_end(&mut body).unwrap();

        assert!(chunky.is_done());
        assert!(!chunky.is_malformed());
    }

    #[test]
    fn chunk_extensions() {
        assert_eq!(parse_size(b"1C;name=value\r\n"), Some(0x1C));
        assert_eq!(parse_size(b"  a \r\n"), Some(10));
        assert_eq!(parse_size(b"\r\n"), None);
    }
}
