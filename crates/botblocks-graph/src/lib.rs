pub mod block;

use std::collections::BTreeMap;

use block::*;
use botblocks_common::{NodeId, Span};
use serde::Deserialize;
use serde_json::value::RawValue;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ParseError {
    pub span: Span,
    pub message: String,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Name used when the document does not carry one.
pub const DEFAULT_PROGRAM_NAME: &str = "robot";

// ── Document shape ──────────────────────────────────────

#[derive(Deserialize)]
struct RawDocument<'a> {
    #[serde(default)]
    name: Option<String>,
    /// Each top-level stack is kept as its source text so it carries a span.
    #[serde(default, borrow)]
    blocks: Vec<&'a RawValue>,
}

#[derive(Deserialize)]
struct RawBlock {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    inputs: BTreeMap<String, RawBlock>,
    #[serde(default)]
    next: Option<Box<RawBlock>>,
}

/// Where a freshly lowered block hangs off its parent.
enum Link {
    Input(NodeId, String),
    Next(NodeId),
}

/// Flattens the nested document into the node arena.
struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    /// Lower one top-level stack. Ids are assigned in pre-order: a block,
    /// then its inputs by name, then the rest of its chain.
    fn lower(&mut self, root: RawBlock) -> NodeId {
        let root_id = NodeId(self.nodes.len() as u32);
        let mut pending = vec![(root, None)];

        while let Some((raw, link)) = pending.pop() {
            let id = NodeId(self.nodes.len() as u32);
            let RawBlock {
                type_name,
                fields,
                inputs,
                next,
            } = raw;
            self.nodes.push(Node {
                kind: BlockKind::from_type_name(&type_name),
                fields,
                inputs: BTreeMap::new(),
                next: None,
            });
            match link {
                Some(Link::Input(parent, name)) => {
                    self.nodes[parent.index()].inputs.insert(name, id);
                }
                Some(Link::Next(parent)) => self.nodes[parent.index()].next = Some(id),
                None => {}
            }

            // Popped in reverse: inputs in name order, then `next`.
            if let Some(next) = next {
                pending.push((*next, Some(Link::Next(id))));
            }
            for (name, child) in inputs.into_iter().rev() {
                pending.push((child, Some(Link::Input(id, name))));
            }
        }
        root_id
    }
}

/// Load a block program from the editor's JSON document.
pub fn parse(source: &str) -> ParseResult<Graph> {
    let mut de = serde_json::Deserializer::from_str(source);
    let doc = RawDocument::deserialize(&mut de)
        .and_then(|doc| de.end().map(|()| doc))
        .map_err(|e| json_error(source, &e))?;

    let mut builder = GraphBuilder { nodes: Vec::new() };
    let mut roots = Vec::with_capacity(doc.blocks.len());
    let mut root_spans = Vec::with_capacity(doc.blocks.len());
    for raw in doc.blocks {
        let text = raw.get();
        let offset = offset_in(source, text);
        let block = parse_stack(text).map_err(|e| ParseError {
            span: e.span.shift(offset),
            ..e
        })?;
        roots.push(builder.lower(block));
        root_spans.push(Span::new(offset, offset + text.len()));
    }

    Ok(Graph {
        name: doc
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROGRAM_NAME.to_string()),
        nodes: builder.nodes,
        roots,
        root_spans,
    })
}

/// Every `next` link is one more level of JSON nesting, so long statement
/// chains run far past serde_json's default depth limit. The limit is lifted
/// and the stack grows on the heap instead.
fn parse_stack(text: &str) -> ParseResult<RawBlock> {
    let mut de = serde_json::Deserializer::from_str(text);
    de.disable_recursion_limit();
    let block = RawBlock::deserialize(serde_stacker::Deserializer::new(&mut de))
        .map_err(|e| json_error(text, &e))?;
    de.end().map_err(|e| json_error(text, &e))?;
    Ok(block)
}

/// Byte offset of `part`, a slice borrowed from `source`.
fn offset_in(source: &str, part: &str) -> usize {
    (part.as_ptr() as usize)
        .saturating_sub(source.as_ptr() as usize)
        .min(source.len())
}

fn json_error(source: &str, err: &serde_json::Error) -> ParseError {
    let text = err.to_string();
    let message = match text.rsplit_once(" at line ") {
        Some((msg, _)) => msg.to_string(),
        None => text,
    };
    let offset = byte_offset(source, err.line(), err.column());
    ParseError {
        span: Span::new(offset, (offset + 1).min(source.len())),
        message,
    }
}

/// Convert serde_json's 1-based line/column into a byte offset.
fn byte_offset(source: &str, line: usize, column: usize) -> usize {
    if line == 0 {
        return 0;
    }
    let line_start: usize = source
        .split_inclusive('\n')
        .take(line - 1)
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(source.len())
}
