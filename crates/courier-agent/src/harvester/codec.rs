//! Codecs turn raw file bytes into discrete events.
//!
//! A codec is fed chunks in file order and yields zero or more complete
//! lines per chunk, each reporting how many bytes of the stream it consumed
//! so the harvester can keep exact `(last_read_offset, last_event_offset)`
//! bookkeeping. Bytes belonging to an incomplete trailing line stay inside
//! the codec and are not counted as consumed, which is what makes resume
//! after a restart exact.
//!
//! The built-in `plain` codec splits on `\n` and strips one optional
//! trailing `\r`. Richer codecs (multiline join, filter) plug in through
//! the same [`Codec`] trait.

/// One decoded line and the stream bytes it accounts for, including its
/// terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub consumed: u64,
}

/// Byte-stream to event decoder. Implementations are stateful and owned by
/// exactly one harvester.
pub trait Codec: Send {
    /// Feeds one chunk, appending completed lines to `out`.
    fn decode(&mut self, chunk: &[u8], out: &mut Vec<Line>);

    /// Releases any pending complete event at end of stream. The plain
    /// codec holds only an unterminated fragment and returns it so stream
    /// sources (stdin) do not lose a final unterminated line; file
    /// harvesters ignore the fragment and leave its offset unconsumed.
    fn finish(&mut self) -> Option<Line>;

    /// Discards buffered state after a seek (truncation recovery).
    fn reset(&mut self);
}

/// Names accepted by the `codec` key of a file group.
#[must_use]
pub fn supported() -> &'static [&'static str] {
    &["plain"]
}

#[must_use]
pub fn is_supported(name: &str) -> bool {
    supported().contains(&name)
}

/// Instantiates a codec by configured name.
pub fn by_name(name: &str) -> Option<Box<dyn Codec>> {
    match name {
        "plain" => Some(Box::new(PlainCodec::default())),
        _ => None,
    }
}

/// Newline-delimited text, one event per line.
#[derive(Debug, Default)]
pub struct PlainCodec {
    partial: Vec<u8>,
}

impl Codec for PlainCodec {
    fn decode(&mut self, chunk: &[u8], out: &mut Vec<Line>) {
        self.partial.extend_from_slice(chunk);
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut end = pos;
            if end > 0 && self.partial[end - 1] == b'\r' {
                end -= 1;
            }
            let text = String::from_utf8_lossy(&self.partial[..end]).into_owned();
            out.push(Line {
                text,
                consumed: (pos + 1) as u64,
            });
            self.partial.drain(..=pos);
        }
    }

    fn finish(&mut self) -> Option<Line> {
        if self.partial.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.partial).into_owned();
        let consumed = self.partial.len() as u64;
        self.partial.clear();
        Some(Line { text, consumed })
    }

    fn reset(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut PlainCodec, chunk: &[u8]) -> Vec<Line> {
        let mut out = Vec::new();
        codec.decode(chunk, &mut out);
        out
    }

    #[test]
    fn test_splits_lines_with_consumed_bytes() {
        let mut codec = PlainCodec::default();
        let lines = decode_all(&mut codec, b"A\nB\nC\n");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], Line { text: "A".into(), consumed: 2 });
        assert_eq!(lines[2], Line { text: "C".into(), consumed: 2 });
    }

    #[test]
    fn test_partial_line_spans_chunks() {
        let mut codec = PlainCodec::default();
        assert!(decode_all(&mut codec, b"hel").is_empty());
        let lines = decode_all(&mut codec, b"lo\nwor");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "hello");
        assert_eq!(lines[0].consumed, 6);
        let lines = decode_all(&mut codec, b"ld\n");
        assert_eq!(lines[0].text, "world");
        assert_eq!(lines[0].consumed, 6);
    }

    #[test]
    fn test_crlf_stripped_but_counted() {
        let mut codec = PlainCodec::default();
        let lines = decode_all(&mut codec, b"line\r\n");
        assert_eq!(lines[0].text, "line");
        assert_eq!(lines[0].consumed, 6);
    }

    #[test]
    fn test_empty_lines() {
        let mut codec = PlainCodec::default();
        let lines = decode_all(&mut codec, b"\n\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "");
        assert_eq!(lines[0].consumed, 1);
    }

    #[test]
    fn test_finish_returns_unterminated_fragment() {
        let mut codec = PlainCodec::default();
        decode_all(&mut codec, b"no newline");
        let last = codec.finish().unwrap();
        assert_eq!(last.text, "no newline");
        assert_eq!(last.consumed, 10);
        assert!(codec.finish().is_none());
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut codec = PlainCodec::default();
        decode_all(&mut codec, b"stale");
        codec.reset();
        let lines = decode_all(&mut codec, b"fresh\n");
        assert_eq!(lines[0].text, "fresh");
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut codec = PlainCodec::default();
        let lines = decode_all(&mut codec, b"ok\xff\n");
        assert_eq!(lines[0].consumed, 4);
        assert!(lines[0].text.starts_with("ok"));
    }

    #[test]
    fn test_registry() {
        assert!(is_supported("plain"));
        assert!(!is_supported("multiline"));
        assert!(by_name("plain").is_some());
        assert!(by_name("gzip").is_none());
    }
}
