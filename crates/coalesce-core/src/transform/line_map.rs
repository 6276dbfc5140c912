//! Line-level V3 source maps.

use serde_json::{json, Value};

/// VLQ-encode a signed integer and append to output string.
fn vlq_encode(value: i64, out: &mut String) {
    const B64: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    #[allow(clippy::cast_sign_loss)]
    let mut v = (if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    }) as u64;
    loop {
        let mut digit = (v & 0x1f) as u8;
        v >>= 5;
        if v > 0 {
            digit |= 0x20;
        }
        out.push(B64[digit as usize] as char);
        if v == 0 {
            break;
        }
    }
}

/// Maps whole output lines back to lines of a single source.
#[derive(Debug, Default)]
pub(crate) struct LineMapBuilder {
    /// (output_line, source_line), both 0-based, in output order.
    lines: Vec<(u32, u32)>,
}

impl LineMapBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Map `output_line` to column 0 of `source_line`.
    pub(crate) fn add_line(&mut self, output_line: u32, source_line: u32) {
        self.lines.push((output_line, source_line));
    }

    /// Generate the map as a JSON value.
    pub(crate) fn generate(&self, source: &str, content: &str) -> Value {
        let mut mappings = String::new();
        let mut current_line = 0u32;
        let mut prev_source_line = 0i64;

        for &(output_line, source_line) in &self.lines {
            while current_line < output_line {
                mappings.push(';');
                current_line += 1;
            }
            // Column 0, source 0, source line (relative), source column 0.
            vlq_encode(0, &mut mappings);
            vlq_encode(0, &mut mappings);
            vlq_encode(i64::from(source_line) - prev_source_line, &mut mappings);
            vlq_encode(0, &mut mappings);
            prev_source_line = i64::from(source_line);
        }

        json!({
            "version": 3,
            "sources": [source],
            "sourcesContent": [content],
            "names": [],
            "mappings": mappings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlq_encode() {
        let mut out = String::new();
        vlq_encode(0, &mut out);
        vlq_encode(1, &mut out);
        vlq_encode(-1, &mut out);
        vlq_encode(16, &mut out);
        assert_eq!(out, "ACDgB");
    }

    #[test]
    fn test_line_mappings() {
        let mut builder = LineMapBuilder::new();
        builder.add_line(2, 0);
        builder.add_line(3, 1);
        builder.add_line(5, 4);

        let map = builder.generate("a.js", "src");
        assert_eq!(map["mappings"], ";;AAAA;AACA;;AAGA");
        assert_eq!(map["sources"], json!(["a.js"]));
    }
}
