use std::collections::{BTreeMap, HashSet};

use plait_core::error::{PlaitError, Result};
use plait_core::template::{
    Condition, ForEachNode, IfNode, LayoutItem, MessageNode, Order, PlanNode, SourceRef, Template,
};
use plait_core::types::Role;

use crate::leaf::{compile_leaf, CompiledLeaf};
use crate::value::parse_path;

/// Text source of a compiled message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Leaf(CompiledLeaf),
    From(SourceRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMessage {
    pub role: Role,
    pub body: MessageBody,
    pub prefix: bool,
    pub budget: Option<u64>,
    pub skip_if_empty_interpolation: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledInterleave {
    pub separator: CompiledLeaf,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledForEach {
    pub source: SourceRef,
    pub order: Order,
    pub order_by: Option<Vec<String>>,
    pub limit: Option<usize>,
    pub interleave: Option<CompiledInterleave>,
    pub budget: Option<u64>,
    pub stop_when_out_of_budget: bool,
    pub map: Vec<CompiledPlanNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledIf {
    pub condition: Condition,
    pub then: Vec<CompiledPlanNode>,
    pub otherwise: Vec<CompiledPlanNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledPlanNode {
    Message(CompiledMessage),
    ForEach(CompiledForEach),
    If(CompiledIf),
    /// Kept so the executor can report it; renders nothing.
    Unknown { kind: String },
}

/// Where a section came from in the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionOrigin {
    Layout,
    Slot { name: String, priority: i32 },
}

/// A run of nodes occupying one output position.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSection {
    pub origin: SectionOrigin,
    pub nodes: Vec<CompiledPlanNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTemplate {
    pub id: String,
    pub task: String,
    pub version: u32,
    /// Sections in output order.
    pub sections: Vec<CompiledSection>,
    /// Indices into `sections` in the order they claim budget.
    pub render_order: Vec<usize>,
}

impl CompiledTemplate {
    /// Sources referenced anywhere in the tree.
    pub fn referenced_sources(&self) -> HashSet<&str> {
        let mut names = HashSet::new();
        for section in &self.sections {
            collect_sources(&section.nodes, &mut names);
        }
        names
    }
}

fn collect_sources<'a>(nodes: &'a [CompiledPlanNode], names: &mut HashSet<&'a str>) {
    for node in nodes {
        match node {
            CompiledPlanNode::Message(m) => {
                if let MessageBody::From(r) = &m.body {
                    names.insert(r.source.as_str());
                }
            }
            CompiledPlanNode::ForEach(f) => {
                names.insert(f.source.source.as_str());
                collect_sources(&f.map, names);
            }
            CompiledPlanNode::If(i) => {
                names.insert(i.condition.source_ref.source.as_str());
                collect_sources(&i.then, names);
                collect_sources(&i.otherwise, names);
            }
            CompiledPlanNode::Unknown { .. } => {}
        }
    }
}

struct Compiler<'a> {
    template_id: &'a str,
    allowed: Option<&'a HashSet<String>>,
}

impl Compiler<'_> {
    fn error(&self, message: impl Into<String>) -> PlaitError {
        PlaitError::template(self.template_id, message)
    }

    fn check_source(&self, source_ref: &SourceRef, node: &str) -> Result<()> {
        if source_ref.source.is_empty() {
            return Err(self.error(format!("{node} node has an empty source name")));
        }
        if let Some(allowed) = self.allowed {
            if !allowed.contains(&source_ref.source) {
                let mut declared: Vec<&str> = allowed.iter().map(String::as_str).collect();
                declared.sort_unstable();
                return Err(self.error(format!(
                    "unknown source '{}' in {node} node (declared: {})",
                    source_ref.source,
                    declared.join(", ")
                )));
            }
        }
        Ok(())
    }

    fn nodes(&self, nodes: &[PlanNode]) -> Result<Vec<CompiledPlanNode>> {
        nodes.iter().map(|n| self.node(n)).collect()
    }

    fn node(&self, node: &PlanNode) -> Result<CompiledPlanNode> {
        Ok(match node {
            PlanNode::Message(m) => CompiledPlanNode::Message(self.message(m)?),
            PlanNode::ForEach(f) => CompiledPlanNode::ForEach(self.for_each(f)?),
            PlanNode::If(i) => CompiledPlanNode::If(self.if_node(i)?),
            PlanNode::Unknown(u) => CompiledPlanNode::Unknown {
                kind: u.kind.clone(),
            },
        })
    }

    fn message(&self, node: &MessageNode) -> Result<CompiledMessage> {
        let body = match (&node.from, &node.content) {
            (Some(from), _) => {
                self.check_source(from, "message")?;
                MessageBody::From(from.clone())
            }
            (None, Some(content)) => MessageBody::Leaf(compile_leaf(content)),
            (None, None) => {
                return Err(self.error("message node needs either `content` or `from`"));
            }
        };
        Ok(CompiledMessage {
            role: node.role,
            body,
            prefix: node.prefix,
            budget: node.budget,
            skip_if_empty_interpolation: node.skip_if_empty_interpolation,
        })
    }

    fn for_each(&self, node: &ForEachNode) -> Result<CompiledForEach> {
        self.check_source(&node.source, "forEach")?;
        let order_by = match node.order_by.as_deref() {
            Some(path) => {
                let segments = parse_path(path);
                if segments.is_empty() {
                    return Err(self.error("forEach `orderBy` must be a non-empty path"));
                }
                Some(segments)
            }
            None => None,
        };
        Ok(CompiledForEach {
            source: node.source.clone(),
            order: node.order,
            order_by,
            limit: node.limit,
            interleave: node.interleave.as_ref().map(|i| CompiledInterleave {
                separator: compile_leaf(&i.separator),
                role: i.role.unwrap_or(Role::System),
            }),
            budget: node.budget,
            stop_when_out_of_budget: node.stop_when_out_of_budget,
            map: self.nodes(&node.map)?,
        })
    }

    fn if_node(&self, node: &IfNode) -> Result<CompiledIf> {
        self.check_source(&node.condition.source_ref, "if")?;
        Ok(CompiledIf {
            condition: node.condition.clone(),
            then: self.nodes(&node.then)?,
            otherwise: self.nodes(&node.otherwise)?,
        })
    }
}

/// Compile a template, optionally restricting the sources it may name.
pub fn compile_template(
    template: &Template,
    allowed_sources: Option<&HashSet<String>>,
) -> Result<CompiledTemplate> {
    let compiler = Compiler {
        template_id: &template.id,
        allowed: allowed_sources,
    };

    let mut compiled_slots = BTreeMap::new();
    for (name, slot) in &template.slots {
        compiled_slots.insert(name.as_str(), (slot.priority, compiler.nodes(&slot.plan)?));
    }

    let mut sections = Vec::new();
    let mut referenced = HashSet::new();
    for item in &template.layout {
        match item {
            LayoutItem::Node(node) => sections.push(CompiledSection {
                origin: SectionOrigin::Layout,
                nodes: vec![compiler.node(node)?],
            }),
            LayoutItem::Slot { name } => {
                let (priority, nodes) = compiled_slots
                    .get(name.as_str())
                    .ok_or_else(|| compiler.error(format!("layout references undeclared slot '{name}'")))?;
                referenced.insert(name.as_str());
                sections.push(CompiledSection {
                    origin: SectionOrigin::Slot {
                        name: name.clone(),
                        priority: *priority,
                    },
                    nodes: nodes.clone(),
                });
            }
        }
    }

    // Unreferenced slots go after the layout, highest priority first.
    let mut trailing: Vec<_> = compiled_slots
        .iter()
        .filter(|(name, _)| !referenced.contains(*name))
        .collect();
    trailing.sort_by(|a, b| b.1 .0.cmp(&a.1 .0));
    for (name, (priority, nodes)) in trailing {
        sections.push(CompiledSection {
            origin: SectionOrigin::Slot {
                name: name.to_string(),
                priority: *priority,
            },
            nodes: nodes.clone(),
        });
    }

    // Layout nodes claim budget first, then slots by descending priority.
    let mut render_order: Vec<usize> = (0..sections.len()).collect();
    render_order.sort_by_key(|&idx| match &sections[idx].origin {
        SectionOrigin::Layout => (0, 0),
        SectionOrigin::Slot { priority, .. } => (1, -i64::from(*priority)),
    });

    Ok(CompiledTemplate {
        id: template.id.clone(),
        task: template.task.clone(),
        version: template.version,
        sections,
        render_order,
    })
}
