//! Splits raw model output into ordered text and tool-invocation blocks.
//!
//! Tool invocations are written inline as
//! `<tool name="list_files"><path>.</path></tool>`: each inner element is one
//! string parameter. Parsing never fails; input that stops mid-invocation
//! yields a trailing block marked `partial`, and anything that does not look
//! like a well-formed opener stays plain text.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const TOOL_OPEN_PREFIX: &str = "<tool";
const TOOL_CLOSE: &str = "</tool>";

static TOOL_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^<tool\s+name\s*=\s*"([^"<>]*)"\s*(/?)>"#).expect("tool opener regex")
});

static PARAM_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<([A-Za-z_][A-Za-z0-9_\-]*)\s*(/?)>").expect("parameter opener regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    ToolUse,
}

pub type ToolParams = BTreeMap<String, String>;

/// A capability call found in model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub params: ToolParams,
    pub partial: bool,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: ToolParams::new(),
            partial: false,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    /// `blk_<index>`; identical for batch and incremental parsing.
    pub id: String,
    pub kind: BlockKind,
    /// Prose for text blocks, the raw invocation markup for tool blocks.
    pub text: String,
    pub partial: bool,
    pub invocation: Option<ToolInvocation>,
}

impl ContentBlock {
    pub fn text(index: usize, text: impl Into<String>, partial: bool) -> Self {
        Self {
            id: block_id(index),
            kind: BlockKind::Text,
            text: text.into(),
            partial,
            invocation: None,
        }
    }

    pub fn tool_use(
        index: usize,
        raw: impl Into<String>,
        mut invocation: ToolInvocation,
        partial: bool,
    ) -> Self {
        invocation.partial = partial;
        Self {
            id: block_id(index),
            kind: BlockKind::ToolUse,
            text: raw.into(),
            partial,
            invocation: Some(invocation),
        }
    }

    pub fn is_tool_use(&self) -> bool {
        self.kind == BlockKind::ToolUse
    }

    /// Mark the block complete. An invocation whose closing tag never
    /// arrived stays partial so it is reported rather than run.
    pub fn finalize(&mut self) {
        self.partial = false;
    }
}

pub fn block_id(index: usize) -> String {
    format!("blk_{index}")
}

/// Parse a complete model response.
pub fn parse_message(input: &str) -> Vec<ContentBlock> {
    parse_blocks(input, false)
}

/// Incremental front end over [`parse_message`]: feed deltas as they arrive,
/// read snapshots in between, and call [`MessageParser::finish`] once the
/// response is complete.
#[derive(Debug, Default, Clone)]
pub struct MessageParser {
    buffer: String,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return the blocks seen so far. The trailing block
    /// is partial because more text may follow.
    pub fn push(&mut self, delta: &str) -> Vec<ContentBlock> {
        self.buffer.push_str(delta);
        self.snapshot()
    }

    pub fn snapshot(&self) -> Vec<ContentBlock> {
        parse_blocks(&self.buffer, true)
    }

    /// Blocks for the response as received in full.
    pub fn finish(&self) -> Vec<ContentBlock> {
        parse_message(&self.buffer)
    }

    pub fn raw(&self) -> &str {
        &self.buffer
    }
}

enum Opener {
    Tool {
        name: String,
        len: usize,
        self_closing: bool,
    },
    /// Input ends before the opener could be decided.
    Incomplete,
    NotATag,
}

fn parse_blocks(input: &str, streaming: bool) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(offset) = input[cursor..].find(TOOL_OPEN_PREFIX) {
        let start = cursor + offset;
        match classify_opener(&input[start..]) {
            Opener::Tool {
                name,
                len,
                self_closing,
            } => {
                push_text(&mut blocks, &input[text_start..start], false);
                let body_start = start + len;
                if self_closing {
                    let index = blocks.len();
                    blocks.push(ContentBlock::tool_use(
                        index,
                        &input[start..body_start],
                        ToolInvocation::new(name),
                        false,
                    ));
                    cursor = body_start;
                    text_start = cursor;
                    continue;
                }

                let body = parse_tool_body(&input[body_start..]);
                let end = body_start + body.consumed;
                let index = blocks.len();
                let invocation = ToolInvocation {
                    name,
                    params: body.params,
                    partial: !body.closed,
                };
                blocks.push(ContentBlock::tool_use(
                    index,
                    input[start..end].trim_end(),
                    invocation,
                    !body.closed,
                ));
                cursor = end;
                text_start = end;
                if !body.closed {
                    return blocks;
                }
            }
            Opener::Incomplete => break,
            Opener::NotATag => cursor = start + TOOL_OPEN_PREFIX.len(),
        }
    }

    push_text(&mut blocks, &input[text_start..], streaming);
    blocks
}

fn push_text(blocks: &mut Vec<ContentBlock>, raw: &str, partial: bool) {
    let text = raw.trim();
    if text.is_empty() {
        return;
    }
    let index = blocks.len();
    blocks.push(ContentBlock::text(index, text, partial));
}

fn classify_opener(rest: &str) -> Opener {
    if let Some(caps) = TOOL_OPEN.captures(rest) {
        return Opener::Tool {
            name: caps[1].trim().to_string(),
            len: caps[0].len(),
            self_closing: !caps[2].is_empty(),
        };
    }
    let after = &rest[TOOL_OPEN_PREFIX.len()..];
    let could_continue = after
        .chars()
        .next()
        .is_none_or(|c| c.is_whitespace());
    if could_continue && !after.contains('>') && !after.contains('<') {
        Opener::Incomplete
    } else {
        Opener::NotATag
    }
}

struct ToolBody {
    params: ToolParams,
    consumed: usize,
    closed: bool,
}

fn parse_tool_body(body: &str) -> ToolBody {
    let mut params = ToolParams::new();
    let mut cursor = 0;

    loop {
        let Some(offset) = body[cursor..].find('<') else {
            return ToolBody {
                params,
                consumed: body.len(),
                closed: false,
            };
        };
        let lt = cursor + offset;
        let rest = &body[lt..];

        if rest.starts_with(TOOL_CLOSE) {
            return ToolBody {
                params,
                consumed: lt + TOOL_CLOSE.len(),
                closed: true,
            };
        }
        if TOOL_CLOSE.starts_with(rest) {
            // `</to` at the very end of the input
            return ToolBody {
                params,
                consumed: body.len(),
                closed: false,
            };
        }

        if let Some(caps) = PARAM_OPEN.captures(rest) {
            let name = caps[1].to_string();
            let value_start = lt + caps[0].len();
            if !caps[2].is_empty() {
                params.insert(name, String::new());
                cursor = value_start;
                continue;
            }

            let close = format!("</{name}>");
            match body[value_start..].find(&close) {
                Some(len) => {
                    let value = body[value_start..value_start + len].trim();
                    params.insert(name, value.to_string());
                    cursor = value_start + len + close.len();
                }
                None => {
                    let value = strip_partial_close(&body[value_start..], &close);
                    params.insert(name, value.trim().to_string());
                    return ToolBody {
                        params,
                        consumed: body.len(),
                        closed: false,
                    };
                }
            }
            continue;
        }

        if !rest.contains('>') {
            // an element opener still being written
            return ToolBody {
                params,
                consumed: body.len(),
                closed: false,
            };
        }
        cursor = lt + 1;
    }
}

/// Drop a trailing fragment of `close` (e.g. `</pa` for `</path>`).
fn strip_partial_close<'a>(value: &'a str, close: &str) -> &'a str {
    for len in (1..close.len()).rev() {
        if value.ends_with(&close[..len]) {
            return &value[..value.len() - len];
        }
    }
    value
}
