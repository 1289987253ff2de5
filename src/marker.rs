//! Marker scanning
//!
//! Finds SVUnit test cases in SystemVerilog source text. A test starts at a
//! `` `SVTEST(name) `` line and ends at the next `` `SVTEST_END `` line.
//! Framework wrappers such as `` `FAST_SVTEST(name) `` are accepted too.

use serde::Serialize;
use std::sync::LazyLock;

use regex::Regex;

static BEGIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*`[A-Za-z_]*SVTEST\s*\(\s*(\w+)\s*\)").expect("begin marker regex")
});

static END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*`[A-Za-z_]*SVTEST_END").expect("end marker regex"));

/// A source span, zero-based lines and columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineRange {
    pub start_line: usize,
    pub start_column: usize,
    pub end_line: usize,
    pub end_column: usize,
}

/// One test case found in a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMarker {
    pub label: String,
    pub range: LineRange,
}

/// Lazy scanner over the lines of a file.
///
/// A second begin marker before an end marker replaces the pending label
/// only; the reported range still starts at the first open begin line.
/// Begins left open at end of input are dropped.
pub struct MarkerScanner<'a> {
    lines: std::iter::Enumerate<std::str::Split<'a, char>>,
    pending: Option<(String, usize)>,
}

impl<'a> MarkerScanner<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            lines: text.split('\n').enumerate(),
            pending: None,
        }
    }
}

impl Iterator for MarkerScanner<'_> {
    type Item = TestMarker;

    fn next(&mut self) -> Option<TestMarker> {
        for (line_no, raw) in self.lines.by_ref() {
            let line = raw.strip_suffix('\r').unwrap_or(raw);

            if let Some(caps) = BEGIN_RE.captures(line) {
                let label = caps[1].to_string();
                match self.pending.as_mut() {
                    Some(pending) => pending.0 = label,
                    None => self.pending = Some((label, line_no)),
                }
                continue;
            }

            if END_RE.is_match(line) {
                if let Some((label, start_line)) = self.pending.take() {
                    return Some(TestMarker {
                        label,
                        range: LineRange {
                            start_line,
                            start_column: 0,
                            end_line: line_no,
                            end_column: line.chars().count(),
                        },
                    });
                }
            }
        }
        None
    }
}

/// Scan `text` for test markers, in source order.
pub fn scan(text: &str) -> MarkerScanner<'_> {
    MarkerScanner::new(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_well_formed_pairs() {
        let text = "\
module foo_unit_test;
  `SVUNIT_TESTS_BEGIN
  `SVTEST(first)
    `FAIL_IF(0)
  `SVTEST_END

  `SVTEST( second )
  `SVTEST_END
  `SVUNIT_TESTS_END
endmodule
";
        let markers: Vec<_> = scan(text).collect();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].label, "first");
        assert_eq!(markers[0].range.start_line, 2);
        assert_eq!(markers[0].range.end_line, 4);
        assert_eq!(markers[0].range.start_column, 0);
        assert_eq!(markers[0].range.end_column, "  `SVTEST_END".len());
        assert_eq!(markers[1].label, "second");
        assert_eq!(markers[1].range.start_line, 6);
        assert_eq!(markers[1].range.end_line, 7);
    }

    #[test]
    fn test_last_begin_wins() {
        let text = "`SVTEST(a)\n`SVTEST(b)\n`SVTEST_END\n";
        let markers: Vec<_> = scan(text).collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].label, "b");
        assert_eq!(markers[0].range.start_line, 0);
        assert_eq!(markers[0].range.end_line, 2);
    }

    #[test]
    fn test_unterminated_begin_is_dropped() {
        let text = "`SVTEST(a)\n`SVTEST_END\n`SVTEST(x)\n  // no end\n";
        let labels: Vec<_> = scan(text).map(|m| m.label).collect();
        assert_eq!(labels, vec!["a"]);
    }

    #[test]
    fn test_end_without_begin_is_ignored() {
        let text = "`SVTEST_END\n`SVTEST(a)\n`SVTEST_END\n`SVTEST_END\n";
        let labels: Vec<_> = scan(text).map(|m| m.label).collect();
        assert_eq!(labels, vec!["a"]);
    }

    #[test]
    fn test_prefixed_macros_and_crlf() {
        let text = "  `FAST_SVTEST(quick)\r\n  `FAST_SVTEST_END\r\n";
        let markers: Vec<_> = scan(text).collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].label, "quick");
        assert_eq!(markers[0].range.end_column, "  `FAST_SVTEST_END".len());
    }

    #[test]
    fn test_markers_are_case_sensitive() {
        let text = "`svtest(a)\n`svtest_end\n";
        assert_eq!(scan(text).count(), 0);
    }
}
