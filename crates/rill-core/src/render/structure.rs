//! Structural classification of streamed text.
//!
//! Tracks fenced blocks as they stream in so partially-formed code or
//! diagram markup is never handed to expensive renderers. Scanning is
//! incremental: each observation only walks the suffix added since the
//! last one, and a trailing partial line waits for its newline.
//!
//! Diagram completeness is a bounded-accuracy heuristic, not a parser:
//! each recognized diagram kind names the minimal structural tokens a
//! layout engine needs to not throw. A valid diagram of an unrecognized
//! kind degrades to literal source display.

/// Classified region kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanKind {
    Plain,
    FencedCode { language: Option<String> },
    Diagram { kind: DiagramKind },
}

/// Recognized diagram families, tagged with their minimal-token rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagramKind {
    Flowchart,
    Sequence,
    Class,
    State,
    EntityRelationship,
    Pie,
    Gantt,
    Journey,
    Unknown,
}

impl DiagramKind {
    /// Minimal structural tokens this kind needs before layout is worth
    /// attempting.
    fn has_required_tokens(self, body: &str) -> bool {
        match self {
            DiagramKind::Flowchart => ["-->", "---", "==>", "-.-"]
                .iter()
                .any(|t| body.contains(t)),
            DiagramKind::Sequence => {
                let declared = body.contains("participant ") || body.contains("actor ");
                let arrow = ["->>", "-->>", "-)", "->"].iter().any(|t| body.contains(t));
                declared && arrow
            }
            DiagramKind::Class => {
                body.contains("class ")
                    || ["<|--", "*--", "o--", "-->"].iter().any(|t| body.contains(t))
            }
            DiagramKind::State => body.contains("-->"),
            DiagramKind::EntityRelationship => body.contains("--"),
            DiagramKind::Pie | DiagramKind::Gantt | DiagramKind::Journey => body.contains(':'),
            DiagramKind::Unknown => false,
        }
    }
}

/// Detects the diagram kind from the first non-empty source line.
pub fn detect_diagram_kind(source: &str) -> DiagramKind {
    let Some(head) = source.lines().find(|l| !l.trim().is_empty()) else {
        return DiagramKind::Unknown;
    };
    let head = head.trim();
    if head.starts_with("graph") || head.starts_with("flowchart") {
        DiagramKind::Flowchart
    } else if head.starts_with("sequenceDiagram") {
        DiagramKind::Sequence
    } else if head.starts_with("classDiagram") {
        DiagramKind::Class
    } else if head.starts_with("stateDiagram") {
        DiagramKind::State
    } else if head.starts_with("erDiagram") {
        DiagramKind::EntityRelationship
    } else if head.starts_with("pie") {
        DiagramKind::Pie
    } else if head.starts_with("gantt") {
        DiagramKind::Gantt
    } else if head.starts_with("journey") {
        DiagramKind::Journey
    } else {
        DiagramKind::Unknown
    }
}

/// Whether a diagram source looks complete enough to lay out.
pub fn is_structurally_complete(source: &str) -> bool {
    detect_diagram_kind(source).has_required_tokens(source)
}

/// Best-effort repair for forced renders: strips a trailing line that ends
/// mid-connector, which is the common shape of a stream cut off inside an
/// edge definition.
pub fn best_effort_repair(source: &str) -> String {
    let trimmed = source.trim_end();
    let Some(last_start) = trimmed.rfind('\n') else {
        return trimmed.to_string();
    };
    let last_line = trimmed[last_start + 1..].trim_end();
    let dangling = ["--", "->", "-.", "==", "-"]
        .iter()
        .any(|t| last_line.ends_with(t));
    if dangling {
        trimmed[..last_start].trim_end().to_string()
    } else {
        trimmed.to_string()
    }
}

/// A classified region of committed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralSpan {
    pub kind: SpanKind,
    /// Byte offset of the span's first character.
    pub start: usize,
    /// Byte offset one past the span's last character; `None` while open.
    pub end: Option<usize>,
    /// Inner content for fenced spans (without the fence lines).
    pub body: String,
    /// Whether the closing fence was seen.
    pub delimited: bool,
    /// Closed by its delimiter and, for diagrams, structurally complete.
    pub complete: bool,
}

impl StructuralSpan {
    pub fn is_diagram(&self) -> bool {
        matches!(self.kind, SpanKind::Diagram { .. })
    }
}

#[derive(Debug)]
struct OpenFence {
    start: usize,
    language: Option<String>,
    body: String,
    diagram: bool,
}

#[derive(Debug)]
enum ScanState {
    Plain { start: usize },
    InFence(OpenFence),
}

/// Incremental fence/diagram span tracker.
#[derive(Debug)]
pub struct StructureTracker {
    /// Bytes of the committed text consumed so far (whole lines only).
    pos: usize,
    state: ScanState,
    finished: bool,
}

impl Default for StructureTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StructureTracker {
    pub fn new() -> Self {
        Self {
            pos: 0,
            state: ScanState::Plain { start: 0 },
            finished: false,
        }
    }

    /// True while a fenced span is open.
    pub fn has_open_fence(&self) -> bool {
        matches!(self.state, ScanState::InFence(_))
    }

    /// Scans text appended since the last observation and returns spans
    /// that closed. `text` must be the full committed text; commits are
    /// append-only so everything before `pos` is already classified.
    pub fn observe(&mut self, text: &str) -> Vec<StructuralSpan> {
        debug_assert!(text.len() >= self.pos, "committed text shrank");
        let mut closed = Vec::new();
        if self.finished {
            return closed;
        }

        while let Some(nl) = text[self.pos..].find('\n') {
            let line_start = self.pos;
            self.pos = line_start + nl + 1;
            self.consume_line(text, line_start, line_start + nl, &mut closed);
        }

        closed
    }

    /// Force-closes at stream end. Consumes any trailing partial line, then
    /// finalizes whatever span is still open: a dangling fence is handed
    /// back incomplete so the consumer can degrade it (code as plain text,
    /// diagram as literal source).
    pub fn finish(&mut self, text: &str) -> Vec<StructuralSpan> {
        let mut closed = self.observe(text);
        if self.finished {
            return closed;
        }
        self.finished = true;

        if self.pos < text.len() {
            let line_start = self.pos;
            self.pos = text.len();
            self.consume_line(text, line_start, text.len(), &mut closed);
        }

        match std::mem::replace(&mut self.state, ScanState::Plain { start: text.len() }) {
            ScanState::Plain { start } => {
                if start < text.len() {
                    closed.push(StructuralSpan {
                        kind: SpanKind::Plain,
                        start,
                        end: Some(text.len()),
                        body: text[start..].to_string(),
                        delimited: false,
                        complete: true,
                    });
                }
            }
            ScanState::InFence(fence) => {
                let diagram = fence.diagram;
                let kind = if diagram {
                    SpanKind::Diagram {
                        kind: detect_diagram_kind(&fence.body),
                    }
                } else {
                    SpanKind::FencedCode {
                        language: fence.language,
                    }
                };
                closed.push(StructuralSpan {
                    kind,
                    start: fence.start,
                    end: Some(text.len()),
                    body: fence.body,
                    delimited: false,
                    complete: false,
                });
            }
        }

        closed
    }

    fn consume_line(
        &mut self,
        text: &str,
        line_start: usize,
        line_end: usize,
        closed: &mut Vec<StructuralSpan>,
    ) {
        let line = &text[line_start..line_end];
        let content = line.strip_suffix('\r').unwrap_or(line);
        let trimmed = content.trim_start();

        let closes_fence = matches!(self.state, ScanState::InFence(_))
            && trimmed.strip_prefix("```").is_some_and(|r| r.trim().is_empty());

        if closes_fence {
            let next_plain = (line_end + 1).min(text.len());
            let ScanState::InFence(fence) =
                std::mem::replace(&mut self.state, ScanState::Plain { start: next_plain })
            else {
                unreachable!("guarded by closes_fence");
            };
            let span = if fence.diagram {
                let complete = is_structurally_complete(&fence.body);
                StructuralSpan {
                    kind: SpanKind::Diagram {
                        kind: detect_diagram_kind(&fence.body),
                    },
                    start: fence.start,
                    end: Some(line_end),
                    body: fence.body,
                    delimited: true,
                    complete,
                }
            } else {
                StructuralSpan {
                    kind: SpanKind::FencedCode {
                        language: fence.language,
                    },
                    start: fence.start,
                    end: Some(line_end),
                    body: fence.body,
                    delimited: true,
                    complete: true,
                }
            };
            closed.push(span);
            return;
        }

        match &mut self.state {
            ScanState::Plain { start } => {
                // A fence may open mid-line ("Hello ```mermaid"); text
                // before the backticks stays in the plain span.
                if let Some(idx) = content.find("```") {
                    let fence_start = line_start + idx;
                    let plain_start = *start;
                    if plain_start < fence_start {
                        closed.push(StructuralSpan {
                            kind: SpanKind::Plain,
                            start: plain_start,
                            end: Some(fence_start),
                            body: text[plain_start..fence_start].to_string(),
                            delimited: false,
                            complete: true,
                        });
                    }
                    let language = content[idx + 3..]
                        .trim()
                        .split_whitespace()
                        .next()
                        .map(str::to_ascii_lowercase);
                    let diagram = language.as_deref() == Some("mermaid");
                    self.state = ScanState::InFence(OpenFence {
                        start: fence_start,
                        language,
                        body: String::new(),
                        diagram,
                    });
                }
            }
            ScanState::InFence(fence) => {
                fence.body.push_str(content);
                fence.body.push('\n');
            }
        }
    }
}
