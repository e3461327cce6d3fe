use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::LazyLock;

static PYTHON_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File \\?"(?P<file>[^"\\]+)\\?", line (?P<line>\d+), in (?P<func>[^\s"\\]+)"#)
        .expect("python frame pattern is valid")
});

static JVM_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bat (?P<func>[\w$.<>]+)\((?P<file>[^:()\s]+):(?P<line>\d+)\)")
        .expect("jvm frame pattern is valid")
});

static JS_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bat (?P<func>[^\s(]+) \((?P<file>[^()\s]+?):(?P<line>\d+)(?::\d+)?\)")
        .expect("js frame pattern is valid")
});

static TRACE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Traceback \(most recent call last\):|Exception in thread ")
        .expect("trace header pattern is valid")
});

static CONTINUATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Caused by: |^\s*\.\.\. \d+ more").expect("continuation pattern is valid")
});

/// Python 3.11+ underlines the failing expression with `^` and `~`.
static MARKER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)[\^~]+\s*$").expect("marker pattern is valid")
});

static EXCEPTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\w.$]*(?:Error|Exception|Exit|Interrupt|Failure)\b")
        .expect("exception line pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameStyle {
    Python,
    Jvm,
    Js,
}

/// One source location in a captured trace.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl StackFrame {
    pub fn location(&self) -> String {
        format!("{}:{}:{}", self.file, self.line, self.function)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StackTrace {
    pub header: Option<String>,
    pub frames: Vec<StackFrame>,
    pub message: Option<String>,
}

impl StackTrace {
    /// Dedup key over the ordered frame locations. Messages do not participate.
    pub fn fingerprint(&self) -> TraceFingerprint {
        let joined: Vec<String> = self.frames.iter().map(StackFrame::location).collect();
        TraceFingerprint(md5::compute(joined.join("\n").as_bytes()).0)
    }

    /// Short human description: the message if one was captured, else the innermost frame.
    pub fn summary(&self) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        match self.frames.last() {
            Some(frame) => format!("trace ending at {}", frame.location()),
            None => "empty trace".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceFingerprint(pub [u8; 16]);

impl fmt::Display for TraceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for TraceFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug)]
struct PendingTrace {
    header: Option<String>,
    frames: Vec<StackFrame>,
    last_style: Option<FrameStyle>,
    /// Exception line printed just before the first frame, as JVM and JS runtimes do.
    lead_message: Option<String>,
    /// Consecutive non-frame lines seen since the last frame or header.
    gap: usize,
}

impl PendingTrace {
    fn new(header: Option<String>, lead_message: Option<String>) -> Self {
        Self {
            header,
            frames: Vec::new(),
            last_style: None,
            lead_message,
            gap: 0,
        }
    }
}

enum LineKind {
    Header,
    Frame(StackFrame, FrameStyle),
    Continuation,
    Marker,
    Plain,
}

/// Incremental recogniser of stack traces in log text.
///
/// A trace is a run of frame lines, optionally introduced by a header. Python traces
/// echo a source line after each frame, so one non-frame line is tolerated after a
/// Python frame; caret marker lines under it are skipped. An exception line directly
/// before the first frame becomes the message unless one follows the frames. State
/// carries over between calls to [`TraceScanner::feed`], so a trace split across two
/// polls is still captured whole.
#[derive(Debug, Default)]
pub struct TraceScanner {
    pending: Option<PendingTrace>,
    /// Exception-looking line seen while no trace was open.
    last_exception: Option<String>,
}

impl TraceScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans a self-contained block of text, such as a response body.
    pub fn scan_block(text: &str) -> Vec<StackTrace> {
        let mut scanner = TraceScanner::new();
        let mut traces: Vec<StackTrace> = split_segments(text)
            .filter_map(|line| scanner.feed(line))
            .collect();
        traces.extend(scanner.flush());
        traces
    }

    /// Feeds one line. Returns a trace when this line completes one.
    pub fn feed(&mut self, line: &str) -> Option<StackTrace> {
        match classify(line) {
            LineKind::Header => {
                let finished = self.finish(None);
                self.last_exception = None;
                self.pending = Some(PendingTrace::new(Some(line.trim().to_string()), None));
                finished
            }
            LineKind::Frame(frame, style) => {
                let lead = self.last_exception.take();
                let pending = self
                    .pending
                    .get_or_insert_with(|| PendingTrace::new(None, lead));
                pending.frames.push(frame);
                pending.last_style = Some(style);
                pending.gap = 0;
                None
            }
            LineKind::Continuation => {
                match self.pending.as_mut() {
                    Some(pending) => pending.gap = 0,
                    None => self.last_exception = None,
                }
                None
            }
            LineKind::Marker => None,
            LineKind::Plain => {
                let Some(pending) = self.pending.as_mut() else {
                    self.last_exception = exception_message(line);
                    return None;
                };
                if pending.frames.is_empty() {
                    pending.gap += 1;
                    if pending.gap > 1 {
                        self.pending = None;
                    }
                    return None;
                }
                if pending.last_style == Some(FrameStyle::Python) && pending.gap == 0 {
                    pending.gap = 1;
                    return None;
                }
                self.finish(exception_message(line))
            }
        }
    }

    /// Completes any trace still in progress.
    pub fn flush(&mut self) -> Option<StackTrace> {
        self.finish(None)
    }

    fn finish(&mut self, message: Option<String>) -> Option<StackTrace> {
        let pending = self.pending.take()?;
        if pending.frames.is_empty() {
            return None;
        }
        Some(StackTrace {
            header: pending.header,
            frames: pending.frames,
            message: message.or(pending.lead_message),
        })
    }
}

/// Splits text on real newlines and on escaped `\n` sequences, which services that
/// log one JSON record per line use to embed multi-line traces.
pub(crate) fn split_segments(text: &str) -> impl Iterator<Item = &str> {
    text.lines().flat_map(|line| line.split("\\n"))
}

fn classify(line: &str) -> LineKind {
    if let Some(frame) = parse_frame(line) {
        return LineKind::Frame(frame.0, frame.1);
    }
    if TRACE_HEADER.is_match(line) {
        return LineKind::Header;
    }
    if CONTINUATION.is_match(line) {
        return LineKind::Continuation;
    }
    if MARKER_LINE.is_match(line) {
        return LineKind::Marker;
    }
    LineKind::Plain
}

fn exception_message(line: &str) -> Option<String> {
    EXCEPTION_LINE
        .is_match(line)
        .then(|| line.trim().to_string())
}

fn parse_frame(line: &str) -> Option<(StackFrame, FrameStyle)> {
    let (captures, style) = if let Some(c) = PYTHON_FRAME.captures(line) {
        (c, FrameStyle::Python)
    } else if let Some(c) = JVM_FRAME.captures(line) {
        (c, FrameStyle::Jvm)
    } else if let Some(c) = JS_FRAME.captures(line) {
        (c, FrameStyle::Js)
    } else {
        return None;
    };
    let line_number = captures.name("line")?.as_str().parse().ok()?;
    Some((
        StackFrame {
            file: captures.name("file")?.as_str().to_string(),
            line: line_number,
            function: captures.name("func")?.as_str().to_string(),
        },
        style,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTHON_TRACE: &[&str] = &[
        "2024-05-01 10:00:00.123 42 ERROR api.handler [req-1] Unhandled error",
        "2024-05-01 10:00:00.123 42 ERROR api.handler Traceback (most recent call last):",
        "2024-05-01 10:00:00.123 42 ERROR api.handler   File \"/srv/api/views.py\", line 88, in create",
        "2024-05-01 10:00:00.123 42 ERROR api.handler     widget = build(body)",
        "2024-05-01 10:00:00.123 42 ERROR api.handler   File \"/srv/api/model.py\", line 12, in build",
        "2024-05-01 10:00:00.123 42 ERROR api.handler     return Widget(**body)",
        "2024-05-01 10:00:00.123 42 ERROR api.handler TypeError: unexpected keyword 'x'",
        "2024-05-01 10:00:01.000 42 INFO api.handler GET /widgets 200",
    ];

    fn feed_all(scanner: &mut TraceScanner, lines: &[&str]) -> Vec<StackTrace> {
        lines.iter().filter_map(|line| scanner.feed(line)).collect()
    }

    #[test]
    fn python_traceback_with_log_prefixes_is_captured() {
        let mut scanner = TraceScanner::new();
        let traces = feed_all(&mut scanner, PYTHON_TRACE);
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert_eq!(trace.frames.len(), 2);
        assert_eq!(trace.frames[0].location(), "/srv/api/views.py:88:create");
        assert_eq!(trace.frames[1].location(), "/srv/api/model.py:12:build");
        assert!(trace.header.as_deref().unwrap().contains("Traceback"));
        assert!(trace.message.as_deref().unwrap().contains("TypeError"));
        assert!(scanner.flush().is_none());
    }

    #[test]
    fn jvm_trace_ends_at_first_plain_line() {
        let lines = [
            "java.lang.NullPointerException: boom",
            "\tat com.acme.WidgetService.create(WidgetService.java:41)",
            "\tat com.acme.Api.handle(Api.java:10)",
            "Caused by: java.io.IOException: disk",
            "\t... 3 more",
            "INFO request done",
        ];
        let mut scanner = TraceScanner::new();
        let traces = feed_all(&mut scanner, &lines);
        assert_eq!(traces.len(), 1);
        assert_eq!(
            traces[0].frames[0].location(),
            "WidgetService.java:41:com.acme.WidgetService.create"
        );
        assert_eq!(traces[0].frames.len(), 2);
        assert_eq!(
            traces[0].message.as_deref(),
            Some("java.lang.NullPointerException: boom")
        );
    }

    #[test]
    fn js_frames_are_recognised() {
        let block = "TypeError: x is undefined\n    at handler (/app/routes.js:20:5)\n    at next (/app/router.js:7:3)\n";
        let traces = TraceScanner::scan_block(block);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].frames[1].location(), "/app/router.js:7:next");
        assert_eq!(traces[0].summary(), "TypeError: x is undefined");
    }

    #[test]
    fn caret_markers_keep_python_traceback_whole() {
        let block = "Traceback (most recent call last):
  File \"/srv/api/views.py\", line 88, in create
    widget = build(body)
             ^^^^^^^^^^^
  File \"/srv/api/model.py\", line 12, in build
    return Widget(**body)
           ~~~~~~^^^^^^^^
TypeError: Widget.__init__() got an unexpected keyword argument 'x'
INFO POST /widgets 500
";
        let traces = TraceScanner::scan_block(block);
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert_eq!(trace.frames.len(), 2);
        assert_eq!(trace.frames[1].location(), "/srv/api/model.py:12:build");
        assert!(trace.message.as_deref().unwrap().starts_with("TypeError"));
    }

    #[test]
    fn caret_markers_behind_log_prefixes_are_skipped() {
        let prefix = "2024-05-01 10:00:00.123 42 ERROR api.handler";
        let lines: Vec<String> = [
            "Traceback (most recent call last):",
            "  File \"/srv/api/views.py\", line 88, in create",
            "    widget = build(body)",
            "             ^^^^^^^^^^^",
            "  File \"/srv/api/model.py\", line 12, in build",
            "    return Widget(**body)",
            "TypeError: unexpected keyword 'x'",
        ]
        .iter()
        .map(|line| format!("{prefix} {line}"))
        .collect();
        let mut scanner = TraceScanner::new();
        let mut traces: Vec<StackTrace> =
            lines.iter().filter_map(|line| scanner.feed(line)).collect();
        traces.extend(scanner.flush());
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].frames.len(), 2);
        assert!(traces[0].summary().contains("TypeError"));
    }

    #[test]
    fn python_traces_sharing_an_entry_frame_fingerprint_apart() {
        let trace = |inner: &str| {
            format!(
                "Traceback (most recent call last):\n  File \"/srv/api/views.py\", line 88, in create\n    widget = build(body)\n             ^^^^^^^^^^^\n  File \"{inner}\", line 5, in build\n    raise ValueError()\nValueError\n"
            )
        };
        let a = TraceScanner::scan_block(&trace("/srv/api/a.py"));
        let b = TraceScanner::scan_block(&trace("/srv/api/b.py"));
        assert_eq!((a.len(), b.len()), (1, 1));
        assert_ne!(a[0].fingerprint(), b[0].fingerprint());
    }

    #[test]
    fn leading_exception_line_is_only_kept_when_adjacent() {
        let block = "java.lang.IllegalStateException: stale\nINFO unrelated\n\tat com.acme.Api.handle(Api.java:10)\n";
        let traces = TraceScanner::scan_block(block);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].message, None);
    }

    #[test]
    fn trace_split_across_feeds_is_completed_later() {
        let mut scanner = TraceScanner::new();
        assert!(feed_all(&mut scanner, &PYTHON_TRACE[..4]).is_empty());
        let traces = feed_all(&mut scanner, &PYTHON_TRACE[4..]);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].frames.len(), 2);
    }

    #[test]
    fn flush_completes_pending_trace() {
        let mut scanner = TraceScanner::new();
        scanner.feed("  File \"/a.py\", line 1, in f");
        let trace = scanner.flush().expect("pending trace should complete on flush");
        assert_eq!(trace.frames.len(), 1);
        assert!(scanner.flush().is_none());
    }

    #[test]
    fn header_without_frames_yields_nothing() {
        let traces = TraceScanner::scan_block(
            "Traceback (most recent call last):\nsomething\nelse entirely\n",
        );
        assert!(traces.is_empty());
    }

    #[test]
    fn escaped_newlines_split_single_line_traces() {
        let line = r#"{"msg": "Traceback (most recent call last):\n  File \"/a.py\", line 3, in f\n    g()\nValueError: bad"}"#;
        let traces = TraceScanner::scan_block(line);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].frames[0].location(), "/a.py:3:f");
    }

    #[test]
    fn fingerprint_depends_only_on_ordered_frames() {
        let frame = |file: &str, line| StackFrame {
            file: file.to_string(),
            line,
            function: "f".to_string(),
        };
        let a = StackTrace {
            header: None,
            frames: vec![frame("a.py", 1), frame("b.py", 2)],
            message: Some("ValueError: one".to_string()),
        };
        let b = StackTrace {
            header: Some("Traceback".to_string()),
            frames: vec![frame("a.py", 1), frame("b.py", 2)],
            message: Some("ValueError: two".to_string()),
        };
        let reversed = StackTrace {
            header: None,
            frames: vec![frame("b.py", 2), frame("a.py", 1)],
            message: None,
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), reversed.fingerprint());
        assert_eq!(a.fingerprint().to_string().len(), 32);
    }
}
