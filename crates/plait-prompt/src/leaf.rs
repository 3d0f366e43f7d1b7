use serde_json::Value;

use crate::value::{lookup, parse_path, render_value};

/// Root a placeholder path is resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Ctx,
    Item,
    Globals,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder { root: Root, path: Vec<String> },
}

/// Values a leaf is rendered against.
#[derive(Debug, Clone, Copy)]
pub struct LeafScope<'a> {
    pub ctx: &'a Value,
    pub item: Option<&'a Value>,
    pub globals: Option<&'a Value>,
}

impl<'a> LeafScope<'a> {
    /// Scope over a context; `globals` is taken from `ctx.globals`.
    pub fn new(ctx: &'a Value) -> Self {
        Self {
            ctx,
            item: None,
            globals: ctx.get("globals"),
        }
    }

    pub fn with_item(mut self, item: &'a Value) -> Self {
        self.item = Some(item);
        self
    }
}

/// Output of one leaf evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafOutput {
    pub text: String,
    /// The leaf has placeholders and every one of them rendered empty.
    pub all_placeholders_empty: bool,
}

/// A pre-parsed template string.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledLeaf {
    segments: Vec<Segment>,
}

/// Compile a template string. An unterminated `{{` is kept as literal text.
pub fn compile_leaf(template: &str) -> CompiledLeaf {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        let expr = after[..end].trim();
        literal.push_str(&rest[..start]);
        if expr.is_empty() {
            literal.push_str(&rest[start..start + 2 + end + 2]);
        } else {
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(parse_placeholder(expr));
        }
        rest = &after[end + 2..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    CompiledLeaf { segments }
}

fn parse_placeholder(expr: &str) -> Segment {
    let mut path = parse_path(expr);
    let root = match path.first().map(String::as_str) {
        Some("ctx") => Some(Root::Ctx),
        Some("item") => Some(Root::Item),
        Some("globals") => Some(Root::Globals),
        _ => None,
    };
    match root {
        Some(root) => {
            path.remove(0);
            Segment::Placeholder { root, path }
        }
        // Bare paths resolve against the context.
        None => Segment::Placeholder {
            root: Root::Ctx,
            path,
        },
    }
}

impl CompiledLeaf {
    pub fn has_placeholders(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder { .. }))
    }

    pub fn render(&self, scope: &LeafScope<'_>) -> LeafOutput {
        let mut text = String::new();
        let mut placeholders = 0usize;
        let mut empty = 0usize;

        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => text.push_str(s),
                Segment::Placeholder { root, path } => {
                    placeholders += 1;
                    let base = match root {
                        Root::Ctx => Some(scope.ctx),
                        Root::Item => scope.item,
                        Root::Globals => scope.globals,
                    };
                    let rendered = base
                        .and_then(|b| lookup(b, path))
                        .map(render_value)
                        .unwrap_or_default();
                    if rendered.is_empty() {
                        empty += 1;
                    }
                    text.push_str(&rendered);
                }
            }
        }

        LeafOutput {
            text,
            all_placeholders_empty: placeholders > 0 && placeholders == empty,
        }
    }
}
