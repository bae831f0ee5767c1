//! Splits a raw ingress datagram into individual, newline-terminated metric lines.

/// Minimum valid line length, exclusive: `X:1|c\n` is the shortest sensible metric.
const MIN_LINE_LEN: usize = 5;

/// Scans `datagram` for newline-delimited lines and invokes `on_line` for each line whose
/// length is valid, in order. A missing trailing newline is treated as if one were appended.
///
/// `max_line_len` is the exclusive upper bound on a line's length (the per-downstream buffer
/// capacity); longer lines can never fit in an outgoing buffer and are dropped.
pub fn frame_lines(datagram: &[u8], max_line_len: usize, mut on_line: impl FnMut(&[u8])) {
    let mut remaining = datagram;

    loop {
        let Some(pos) = remaining.iter().position(|&b| b == b'\n') else {
            // No newline in what's left. The only case this matters for is the very end of
            // the datagram: the original appends a trailing '\n' before scanning, so an
            // unterminated tail is treated as one more candidate line, newline included —
            // otherwise it would run straight into the next datagram's first line on egress.
            if !remaining.is_empty() {
                let line_len = remaining.len() + 1;
                if line_len > MIN_LINE_LEN && line_len < max_line_len {
                    let mut line = remaining.to_vec();
                    line.push(b'\n');
                    on_line(&line);
                } else {
                    tracing::warn!(len = line_len, "invalid length of metric line");
                }
            }
            return;
        };

        let line_len = pos + 1; // include the newline
        let line = &remaining[..line_len];

        if line_len > MIN_LINE_LEN && line_len < max_line_len {
            on_line(line);
        } else {
            tracing::warn!(len = line_len, "invalid length of metric line");
        }

        remaining = &remaining[line_len..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(datagram: &[u8], max: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        frame_lines(datagram, max, |line| out.push(line.to_vec()));
        out
    }

    #[test]
    fn single_terminated_line() {
        let lines = collect(b"foo.bar:1|c\n", 1450);
        assert_eq!(lines, vec![b"foo.bar:1|c\n".to_vec()]);
    }

    #[test]
    fn missing_trailing_newline_is_still_framed() {
        let lines = collect(b"foo.bar:1|c", 1450);
        assert_eq!(lines, vec![b"foo.bar:1|c\n".to_vec()]);
    }

    #[test]
    fn multiple_lines_in_one_datagram() {
        let datagram = b"a.b:1|c\nc.d:2|c\ne.f:3|c\n";
        let lines = collect(datagram, 1450);
        assert_eq!(
            lines,
            vec![
                b"a.b:1|c\n".to_vec(),
                b"c.d:2|c\n".to_vec(),
                b"e.f:3|c\n".to_vec(),
            ]
        );
    }

    #[test]
    fn too_short_line_is_dropped() {
        let lines = collect(b"a:1\n", 1450);
        assert!(lines.is_empty());
    }

    #[test]
    fn too_long_line_is_dropped() {
        let long = vec![b'a'; 2000];
        let mut datagram = long;
        datagram.push(b'\n');
        let lines = collect(&datagram, 1450);
        assert!(lines.is_empty());
    }

    #[test]
    fn valid_and_invalid_lines_interleave() {
        let datagram = b"a:1\nfoo.bar:1|c\nb\n";
        let lines = collect(datagram, 1450);
        assert_eq!(lines, vec![b"foo.bar:1|c\n".to_vec()]);
    }

    #[test]
    fn empty_datagram_yields_nothing() {
        assert!(collect(b"", 1450).is_empty());
    }
}
