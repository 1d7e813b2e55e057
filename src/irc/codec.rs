/// IRC line codec — frames a TCP byte stream into protocol lines.
///
/// Splits on `\r\n` (per RFC 1459), strips NUL padding, and serializes
/// outgoing lines with `\r\n` termination. Lines longer than the 512-byte
/// IRC limit are truncated before being emitted.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum line length on the wire, including `\r\n`.
pub const MAX_LINE_LENGTH: usize = 512;

/// Codec error: either malformed input or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames IRC lines on `\r\n` boundaries.
#[derive(Debug, Default)]
pub struct LineCodec;

/// Truncate `line` so that, with the `\r\n` terminator, it fits in
/// [`MAX_LINE_LENGTH`] bytes. Cuts back to a char boundary.
fn truncate_line(mut line: String) -> String {
    let max = MAX_LINE_LENGTH - 2;
    if line.len() <= max {
        return line;
    }
    let mut cut = max;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    line.truncate(cut);
    line
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Emit one line per call; skip empty segments between CRLFs.
        while let Some(pos) = src.windows(2).position(|w| w == b"\r\n") {
            let segment = src.split_to(pos);
            src.advance(2);

            // NUL padding can precede the terminator on sloppy clients.
            let trimmed: &[u8] = match segment.iter().rposition(|&b| b != 0) {
                Some(last) => &segment[..=last],
                None => continue,
            };

            let line = std::str::from_utf8(trimmed).map_err(|_| CodecError::InvalidUtf8)?;
            return Ok(Some(truncate_line(line.to_owned())));
        }
        Ok(None)
    }
}

impl Encoder<String> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 2);
        dst.put_slice(item.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_complete_line() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from("NICK wings\r\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, "NICK wings");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_line_then_complete() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from("NICK wi");

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ngs\r\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, "NICK wings");
    }

    #[test]
    fn decode_two_lines_in_one_read() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from("NICK wings\r\nUSER wings 0 * :Wings\r\n");

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "NICK wings");
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            "USER wings 0 * :Wings"
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_skips_empty_segments() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from("\r\n\r\nPING :x\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "PING :x");
    }

    #[test]
    fn decode_strips_nul_padding() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(&b"QUIT\x00\x00\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "QUIT");
    }

    #[test]
    fn decode_truncates_oversized_line() {
        let mut codec = LineCodec;
        let mut long = vec![b'A'; 600];
        long.extend_from_slice(b"\r\n");
        let mut buf = BytesMut::from(long.as_slice());
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line.len(), MAX_LINE_LENGTH - 2);
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(&b"\xff\xfe\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::InvalidUtf8)
        ));
    }

    #[test]
    fn decode_empty_buffer() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(":irc.test 001 alice :Hi, welcome to IRC".into(), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b":irc.test 001 alice :Hi, welcome to IRC\r\n");
    }

    #[test]
    fn truncate_respects_char_boundary() {
        // A multibyte char straddling the cut must not split.
        let mut s = "A".repeat(509);
        s.push('é');
        let out = truncate_line(s);
        assert_eq!(out.len(), 509);
        assert!(out.chars().all(|c| c == 'A'));
    }
}
