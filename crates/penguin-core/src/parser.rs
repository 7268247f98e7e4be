// Action tag extraction
//
// Assistant text interleaves narration with tagged tool invocations of the
// form <kind>payload</kind>. The parser is a single left-to-right scan that
// splits the text into plain segments and action tags, preserving every
// byte: reassembling the segments reproduces the input exactly.
//
// Payloads are opaque here; argument parsing belongs to the tool invoker.

use serde::{Deserialize, Serialize};

/// Closed vocabulary of action tag kinds. Anything else is narration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Execute,
    Search,
    PerplexitySearch,
    WorkspaceSearch,
    MemorySearch,
    Read,
    Write,
    AddDeclarativeNote,
    AddSummaryNote,
    ProcessStart,
    ProcessStop,
    ProcessStatus,
    ProcessList,
    ProcessEnter,
    ProcessSend,
    ProcessExit,
    BrowserNavigate,
    BrowserInteract,
    BrowserScreenshot,
    ProjectCreate,
    ProjectUpdate,
    ProjectDelete,
    ProjectList,
    ProjectDisplay,
    TaskCreate,
    TaskUpdate,
    TaskComplete,
    TaskDelete,
    TaskList,
    TaskDisplay,
    FinishResponse,
    FinishTask,
    Delegate,
    SendMessage,
    SpawnSubAgent,
}

impl ActionKind {
    /// All kinds, in a stable order
    pub const ALL: [ActionKind; 35] = [
        ActionKind::Execute,
        ActionKind::Search,
        ActionKind::PerplexitySearch,
        ActionKind::WorkspaceSearch,
        ActionKind::MemorySearch,
        ActionKind::Read,
        ActionKind::Write,
        ActionKind::AddDeclarativeNote,
        ActionKind::AddSummaryNote,
        ActionKind::ProcessStart,
        ActionKind::ProcessStop,
        ActionKind::ProcessStatus,
        ActionKind::ProcessList,
        ActionKind::ProcessEnter,
        ActionKind::ProcessSend,
        ActionKind::ProcessExit,
        ActionKind::BrowserNavigate,
        ActionKind::BrowserInteract,
        ActionKind::BrowserScreenshot,
        ActionKind::ProjectCreate,
        ActionKind::ProjectUpdate,
        ActionKind::ProjectDelete,
        ActionKind::ProjectList,
        ActionKind::ProjectDisplay,
        ActionKind::TaskCreate,
        ActionKind::TaskUpdate,
        ActionKind::TaskComplete,
        ActionKind::TaskDelete,
        ActionKind::TaskList,
        ActionKind::TaskDisplay,
        ActionKind::FinishResponse,
        ActionKind::FinishTask,
        ActionKind::Delegate,
        ActionKind::SendMessage,
        ActionKind::SpawnSubAgent,
    ];

    /// The literal tag name as it appears between angle brackets
    pub fn tag_name(self) -> &'static str {
        match self {
            ActionKind::Execute => "execute",
            ActionKind::Search => "search",
            ActionKind::PerplexitySearch => "perplexity_search",
            ActionKind::WorkspaceSearch => "workspace_search",
            ActionKind::MemorySearch => "memory_search",
            ActionKind::Read => "read",
            ActionKind::Write => "write",
            ActionKind::AddDeclarativeNote => "add_declarative_note",
            ActionKind::AddSummaryNote => "add_summary_note",
            ActionKind::ProcessStart => "process_start",
            ActionKind::ProcessStop => "process_stop",
            ActionKind::ProcessStatus => "process_status",
            ActionKind::ProcessList => "process_list",
            ActionKind::ProcessEnter => "process_enter",
            ActionKind::ProcessSend => "process_send",
            ActionKind::ProcessExit => "process_exit",
            ActionKind::BrowserNavigate => "browser_navigate",
            ActionKind::BrowserInteract => "browser_interact",
            ActionKind::BrowserScreenshot => "browser_screenshot",
            ActionKind::ProjectCreate => "project_create",
            ActionKind::ProjectUpdate => "project_update",
            ActionKind::ProjectDelete => "project_delete",
            ActionKind::ProjectList => "project_list",
            ActionKind::ProjectDisplay => "project_display",
            ActionKind::TaskCreate => "task_create",
            ActionKind::TaskUpdate => "task_update",
            ActionKind::TaskComplete => "task_complete",
            ActionKind::TaskDelete => "task_delete",
            ActionKind::TaskList => "task_list",
            ActionKind::TaskDisplay => "task_display",
            ActionKind::FinishResponse => "finish_response",
            ActionKind::FinishTask => "finish_task",
            ActionKind::Delegate => "delegate",
            ActionKind::SendMessage => "send_message",
            ActionKind::SpawnSubAgent => "spawn_sub_agent",
        }
    }

    /// Resolve a tag name to a kind
    pub fn from_tag_name(name: &str) -> Option<ActionKind> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|k| k.tag_name() == name)
    }

    /// The registry tool this kind dispatches to. `None` for the finish
    /// signals, which the engine consumes directly.
    pub fn tool_name(self) -> Option<&'static str> {
        match self {
            ActionKind::Execute => Some("code_execution"),
            ActionKind::Search => Some("pattern_search"),
            ActionKind::PerplexitySearch => Some("web_search"),
            ActionKind::WorkspaceSearch => Some("code_search"),
            ActionKind::MemorySearch => Some("memory_search"),
            ActionKind::Read => Some("file_read"),
            ActionKind::Write => Some("file_write"),
            ActionKind::AddDeclarativeNote | ActionKind::AddSummaryNote => Some("notes_add"),
            ActionKind::ProcessStart => Some("interactive_process_start"),
            ActionKind::ProcessStop => Some("interactive_process_stop"),
            ActionKind::ProcessStatus => Some("interactive_process_status"),
            ActionKind::ProcessList => Some("interactive_process_list"),
            ActionKind::ProcessEnter => Some("interactive_process_enter"),
            ActionKind::ProcessSend => Some("interactive_process_send"),
            ActionKind::ProcessExit => Some("interactive_process_exit"),
            ActionKind::BrowserNavigate => Some("browser_navigate"),
            ActionKind::BrowserInteract => Some("browser_interact"),
            ActionKind::BrowserScreenshot => Some("browser_screenshot"),
            ActionKind::ProjectCreate => Some("project_create"),
            ActionKind::ProjectUpdate => Some("project_update"),
            ActionKind::ProjectDelete => Some("project_delete"),
            ActionKind::ProjectList => Some("project_list"),
            ActionKind::ProjectDisplay => Some("project_display"),
            ActionKind::TaskCreate => Some("task_create"),
            ActionKind::TaskUpdate => Some("task_update"),
            ActionKind::TaskComplete => Some("task_complete"),
            ActionKind::TaskDelete => Some("task_delete"),
            ActionKind::TaskList => Some("task_list"),
            ActionKind::TaskDisplay => Some("task_display"),
            ActionKind::FinishResponse | ActionKind::FinishTask => None,
            ActionKind::Delegate => Some("delegate"),
            ActionKind::SendMessage => Some("send_message"),
            ActionKind::SpawnSubAgent => Some("spawn_sub_agent"),
        }
    }

    /// Whether this kind is a loop-terminating signal rather than a tool
    pub fn is_finish_signal(self) -> bool {
        matches!(self, ActionKind::FinishResponse | ActionKind::FinishTask)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag_name())
    }
}

/// A structured invocation extracted from assistant text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTag {
    pub kind: ActionKind,
    /// Payload between the tags, verbatim (whitespace preserved)
    pub payload: String,
    /// Byte offset of the opening `<` in the source text
    pub start: usize,
}

/// One span of the parsed text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    /// Narration outside any tag
    Text(String),
    /// A complete action tag
    Action(ActionTag),
    /// A known open tag with no matching close; the raw open-tag text is
    /// kept so reassembly stays lossless
    Unclosed { kind: ActionKind, raw: String },
}

impl Segment {
    /// Reproduce the exact source text of this segment
    pub fn source_text(&self) -> String {
        match self {
            Segment::Text(text) => text.clone(),
            Segment::Action(tag) => format!(
                "<{name}>{payload}</{name}>",
                name = tag.kind.tag_name(),
                payload = tag.payload
            ),
            Segment::Unclosed { raw, .. } => raw.clone(),
        }
    }
}

/// Parse assistant text into an ordered list of segments.
///
/// Identical input always yields identical output. The concatenation of
/// `Segment::source_text` over the result equals the input.
pub fn parse(input: &str) -> Vec<Segment> {
    let bytes = input.as_bytes();
    let mut segments = Vec::new();
    let mut plain_start = 0;
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] != b'<' {
            pos += 1;
            continue;
        }

        let Some((kind, open_len)) = match_open_tag(&input[pos..]) else {
            pos += 1;
            continue;
        };

        let payload_start = pos + open_len;
        match find_close(input, payload_start, kind) {
            Some((payload_end, close_len)) => {
                if plain_start < pos {
                    segments.push(Segment::Text(input[plain_start..pos].to_string()));
                }
                segments.push(Segment::Action(ActionTag {
                    kind,
                    payload: input[payload_start..payload_end].to_string(),
                    start: pos,
                }));
                pos = payload_end + close_len;
                plain_start = pos;
            }
            None => {
                // Unclosed known tag: report it and continue after the open
                // tag, treating the rest as plain until the next tag.
                if plain_start < pos {
                    segments.push(Segment::Text(input[plain_start..pos].to_string()));
                }
                segments.push(Segment::Unclosed {
                    kind,
                    raw: input[pos..payload_start].to_string(),
                });
                pos = payload_start;
                plain_start = pos;
            }
        }
    }

    if plain_start < input.len() {
        segments.push(Segment::Text(input[plain_start..].to_string()));
    }

    segments
}

/// Convenience: just the completed action tags, in document order
pub fn extract_actions(input: &str) -> Vec<ActionTag> {
    parse(input)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Action(tag) => Some(tag),
            _ => None,
        })
        .collect()
}

/// Try to match `<kind>` at the start of `text`; returns (kind, tag byte length)
fn match_open_tag(text: &str) -> Option<(ActionKind, usize)> {
    let rest = text.strip_prefix('<')?;
    let end = rest.find('>')?;
    let name = &rest[..end];
    let kind = ActionKind::from_tag_name(name)?;
    Some((kind, end + 2))
}

/// Find the matching `</kind>` for a tag whose payload starts at `from`.
///
/// Same-kind open tags inside the payload increase the depth, so a close
/// tag at deeper nesting does not terminate the outer tag. Returns the
/// payload end offset and the close tag length.
fn find_close(input: &str, from: usize, kind: ActionKind) -> Option<(usize, usize)> {
    let open = format!("<{}>", kind.tag_name());
    let close = format!("</{}>", kind.tag_name());
    let mut depth = 0usize;
    let mut pos = from;

    while pos < input.len() {
        let rest = &input[pos..];
        if rest.starts_with(&close) {
            if depth == 0 {
                return Some((pos, close.len()));
            }
            depth -= 1;
            pos += close.len();
        } else if rest.starts_with(&open) {
            depth += 1;
            pos += open.len();
        } else {
            // Advance one char, not one byte, to stay on a boundary
            pos += rest.chars().next().map(|c| c.len_utf8()).unwrap_or(1);
        }
    }

    None
}

/// Terminal status carried by a finish_task payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    Done,
    Partial,
    Blocked,
}

/// Parse the status out of a finish_task payload.
///
/// The literal `[FINISH_STATUS:done|partial|blocked]` marker wins; keyword
/// inspection of the payload is the fallback when the marker is absent.
/// Returns `Done` when nothing hints otherwise.
pub fn parse_finish_status(payload: &str) -> FinishStatus {
    if let Some(idx) = payload.find("[FINISH_STATUS:") {
        let rest = &payload[idx + "[FINISH_STATUS:".len()..];
        if let Some(end) = rest.find(']') {
            return match rest[..end].trim() {
                "partial" => FinishStatus::Partial,
                "blocked" => FinishStatus::Blocked,
                _ => FinishStatus::Done,
            };
        }
    }

    let lower = payload.to_lowercase();
    if lower.contains("blocked") {
        FinishStatus::Blocked
    } else if lower.contains("partial") {
        FinishStatus::Partial
    } else {
        FinishStatus::Done
    }
}
