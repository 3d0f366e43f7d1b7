use std::cmp::Ordering;

use serde_json::Value;
use tracing::{debug, warn};

use plait_core::template::{Condition, ConditionOp, Order};
use plait_core::types::ChatCompletionMessage;

use crate::budget::{estimate_tokens, BudgetManager, ScopedBudget};
use crate::compiler::{
    CompiledForEach, CompiledIf, CompiledMessage, CompiledPlanNode, CompiledTemplate, MessageBody,
};
use crate::leaf::LeafScope;
use crate::registry::SourceRegistry;
use crate::value::{is_empty, lookup, loose_eq, natural_cmp, ordered_cmp, render_value};

/// Render a compiled template into an ordered message list.
///
/// Sections claim budget in `render_order` but are emitted in layout order.
pub fn render(
    compiled: &CompiledTemplate,
    ctx: &Value,
    budget: &mut BudgetManager,
    registry: &dyn SourceRegistry,
) -> Vec<ChatCompletionMessage> {
    let mut executor = Executor {
        template_id: &compiled.id,
        ctx,
        registry,
        budget: ScopedBudget::new(budget),
    };

    let mut outputs: Vec<Vec<ChatCompletionMessage>> = vec![Vec::new(); compiled.sections.len()];
    for &idx in &compiled.render_order {
        let section = &compiled.sections[idx];
        let mut out = Vec::new();
        if let Some(depth) = executor.nodes(&section.nodes, None, &mut out) {
            debug!(
                template_id = %compiled.id,
                section = idx,
                depth,
                "Section truncated by budget"
            );
        }
        outputs[idx] = out;
    }

    outputs.into_iter().flatten().collect()
}

/// Evaluate a condition against an already resolved value.
pub fn evaluate_condition(condition: &Condition, resolved: &Value) -> bool {
    let literal = condition.value.as_ref().unwrap_or(&Value::Null);
    match condition.op {
        ConditionOp::Exists => !resolved.is_null(),
        ConditionOp::NonEmpty => match resolved {
            Value::Array(items) => !items.is_empty(),
            Value::String(s) => !s.is_empty(),
            _ => false,
        },
        ConditionOp::Eq => loose_eq(resolved, literal),
        ConditionOp::Neq => !loose_eq(resolved, literal),
        ConditionOp::Gt => ordered_cmp(resolved, literal) == Some(Ordering::Greater),
        ConditionOp::Lt => ordered_cmp(resolved, literal) == Some(Ordering::Less),
    }
}

/// Outcome of evaluating nodes: `Some(depth)` when some message was skipped
/// because the budget at `depth` was exhausted (0 = global).
type Exhausted = Option<usize>;

fn merge(a: Exhausted, b: Exhausted) -> Exhausted {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

struct Executor<'a> {
    template_id: &'a str,
    ctx: &'a Value,
    registry: &'a dyn SourceRegistry,
    budget: ScopedBudget<'a>,
}

fn leaf_scope<'v>(ctx: &'v Value, item: Option<&'v Value>) -> LeafScope<'v> {
    let scope = LeafScope::new(ctx);
    match item {
        Some(item) => scope.with_item(item),
        None => scope,
    }
}

impl Executor<'_> {
    fn nodes(
        &mut self,
        nodes: &[CompiledPlanNode],
        item: Option<&Value>,
        out: &mut Vec<ChatCompletionMessage>,
    ) -> Exhausted {
        let mut exhausted = None;
        for node in nodes {
            exhausted = merge(exhausted, self.node(node, item, out));
        }
        exhausted
    }

    fn node(
        &mut self,
        node: &CompiledPlanNode,
        item: Option<&Value>,
        out: &mut Vec<ChatCompletionMessage>,
    ) -> Exhausted {
        match node {
            CompiledPlanNode::Message(m) => self.message(m, item, out),
            CompiledPlanNode::ForEach(f) => self.for_each(f, out),
            CompiledPlanNode::If(i) => self.if_node(i, item, out),
            CompiledPlanNode::Unknown { kind } => {
                warn!(template_id = %self.template_id, kind = %kind, "Skipping unknown plan node");
                None
            }
        }
    }

    fn message(
        &mut self,
        node: &CompiledMessage,
        item: Option<&Value>,
        out: &mut Vec<ChatCompletionMessage>,
    ) -> Exhausted {
        let text = match &node.body {
            MessageBody::From(source_ref) => {
                let value = self.registry.resolve(source_ref, self.ctx);
                if is_empty(&value) {
                    return None;
                }
                render_value(&value)
            }
            MessageBody::Leaf(leaf) => {
                let rendered = leaf.render(&leaf_scope(self.ctx, item));
                if node.skip_if_empty_interpolation && rendered.all_placeholders_empty {
                    return None;
                }
                rendered.text
            }
        };

        let tokens = estimate_tokens(&text);
        let reserved = match node.budget {
            Some(ceiling) => {
                self.budget.push(ceiling);
                let reserved = self.budget.try_reserve(tokens);
                self.budget.pop();
                reserved
            }
            None => self.budget.try_reserve(tokens),
        };
        if let Err(depth) = reserved {
            debug!(
                template_id = %self.template_id,
                role = ?node.role,
                tokens,
                depth,
                "Message skipped, budget exhausted"
            );
            return Some(depth);
        }

        out.push(ChatCompletionMessage::new(node.role, text).with_prefix(node.prefix));
        None
    }

    fn for_each(&mut self, node: &CompiledForEach, out: &mut Vec<ChatCompletionMessage>) -> Exhausted {
        let resolved = self.registry.resolve(&node.source, self.ctx);
        let Value::Array(items) = resolved else {
            return None;
        };

        let mut items: Vec<&Value> = items.iter().collect();
        if node.order != Order::None {
            let key = |v: &Value| -> Value {
                match &node.order_by {
                    Some(path) => lookup(v, path).cloned().unwrap_or(Value::Null),
                    None => v.clone(),
                }
            };
            let mut keyed: Vec<(Value, &Value)> = items.iter().map(|v| (key(*v), *v)).collect();
            match node.order {
                Order::Desc => keyed.sort_by(|a, b| natural_cmp(&b.0, &a.0)),
                _ => keyed.sort_by(|a, b| natural_cmp(&a.0, &b.0)),
            }
            items = keyed.into_iter().map(|(_, v)| v).collect();
        }
        if let Some(limit) = node.limit {
            items.truncate(limit);
        }

        if let Some(ceiling) = node.budget {
            self.budget.push(ceiling);
        }
        let loop_depth = self.budget.depth();

        let mut exhausted = None;
        let mut emitted_items = 0usize;
        for item in items {
            let mut item_out = Vec::new();
            let item_exhausted = self.nodes(&node.map, Some(item), &mut item_out);

            if !item_out.is_empty() {
                if emitted_items > 0 {
                    if let Some(interleave) = &node.interleave {
                        let separator = interleave.separator.render(&LeafScope::new(self.ctx)).text;
                        out.push(ChatCompletionMessage::new(interleave.role, separator));
                    }
                }
                out.append(&mut item_out);
                emitted_items += 1;
            }

            exhausted = merge(exhausted, item_exhausted);
            if node.stop_when_out_of_budget && item_exhausted.is_some_and(|d| d <= loop_depth) {
                debug!(
                    template_id = %self.template_id,
                    source = %node.source.source,
                    emitted_items,
                    "forEach stopped, budget exhausted"
                );
                break;
            }
        }

        if node.budget.is_some() {
            self.budget.pop();
        }
        exhausted
    }

    fn if_node(
        &mut self,
        node: &CompiledIf,
        item: Option<&Value>,
        out: &mut Vec<ChatCompletionMessage>,
    ) -> Exhausted {
        let resolved = self.registry.resolve(&node.condition.source_ref, self.ctx);
        if evaluate_condition(&node.condition, &resolved) {
            self.nodes(&node.then, item, out)
        } else {
            self.nodes(&node.otherwise, item, out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_template;
    use crate::registry::StaticRegistry;
    use plait_core::template::{ForEachNode, IfNode, Interleave, MessageNode, PlanNode, SourceRef, Template};
    use plait_core::types::Role;
    use serde_json::json;

    fn registry() -> StaticRegistry {
        StaticRegistry::new("test")
            .with_context_source("items")
            .with_context_source("flag")
            .with_context_source("obj")
            .with_context_source("nothing")
            .with_context_source("count")
    }

    fn for_each(map: Vec<PlanNode>) -> ForEachNode {
        ForEachNode {
            source: SourceRef::new("items"),
            order: Order::None,
            order_by: None,
            limit: None,
            interleave: None,
            budget: None,
            stop_when_out_of_budget: true,
            map,
        }
    }

    fn item_message() -> PlanNode {
        PlanNode::message(Role::User, "{{item}}")
    }

    fn run(template: Template, ctx: Value, max_tokens: u64) -> (Vec<ChatCompletionMessage>, u64) {
        let compiled = compile_template(&template, None).unwrap();
        let mut budget = BudgetManager::new(max_tokens);
        let messages = render(&compiled, &ctx, &mut budget, &registry());
        (messages, budget.consumed())
    }

    fn contents(messages: &[ChatCompletionMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn test_for_each_order() {
        let ctx = json!({ "items": [3, 1, 2] });
        let mut node = for_each(vec![item_message()]);

        let (none, _) = run(Template::new("t", "x").with_node(PlanNode::ForEach(node.clone())), ctx.clone(), 1000);
        assert_eq!(contents(&none), vec!["3", "1", "2"]);

        node.order = Order::Asc;
        let (asc, _) = run(Template::new("t", "x").with_node(PlanNode::ForEach(node.clone())), ctx.clone(), 1000);
        assert_eq!(contents(&asc), vec!["1", "2", "3"]);

        node.order = Order::Desc;
        node.limit = Some(2);
        let (desc, _) = run(Template::new("t", "x").with_node(PlanNode::ForEach(node)), ctx, 1000);
        assert_eq!(contents(&desc), vec!["3", "2"]);
    }

    #[test]
    fn test_for_each_order_by_path() {
        let ctx = json!({ "items": [
            { "name": "c", "at": 30 },
            { "name": "a", "at": 10 },
            { "name": "b", "at": 20 }
        ]});
        let mut node = for_each(vec![PlanNode::message(Role::User, "{{item.name}}")]);
        node.order = Order::Asc;
        node.order_by = Some("at".into());
        let (messages, _) = run(Template::new("t", "x").with_node(PlanNode::ForEach(node)), ctx, 1000);
        assert_eq!(contents(&messages), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_interleave_separator_between_items_only() {
        let ctx = json!({ "items": ["a", "b", "c", "d"] });
        let mut node = for_each(vec![item_message()]);
        node.interleave = Some(Interleave {
            separator: "---".into(),
            role: None,
        });
        let (messages, consumed) = run(Template::new("t", "x").with_node(PlanNode::ForEach(node)), ctx, 1000);
        assert_eq!(contents(&messages), vec!["a", "---", "b", "---", "c", "---", "d"]);
        assert_eq!(messages[1].role, Role::System);
        // Separators are not charged
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_interleave_ignores_items_with_no_output() {
        let ctx = json!({ "items": ["a", "", "b"] });
        let mut node = for_each(vec![PlanNode::Message(MessageNode {
            role: Role::User,
            content: Some("{{item}}".into()),
            from: None,
            prefix: false,
            budget: None,
            skip_if_empty_interpolation: true,
        })]);
        node.interleave = Some(Interleave {
            separator: "|".into(),
            role: Some(Role::User),
        });
        let (messages, _) = run(Template::new("t", "x").with_node(PlanNode::ForEach(node)), ctx, 1000);
        assert_eq!(contents(&messages), vec!["a", "|", "b"]);
    }

    #[test]
    fn test_node_budget_bounds_subtree() {
        // Each item costs 2 tokens; the loop ceiling admits 3 items.
        let ctx = json!({ "items": ["aaaaaaa", "bbbbbbb", "ccccccc", "ddddddd", "eeeeeee"] });
        let mut node = for_each(vec![item_message()]);
        node.budget = Some(6);
        let template = Template::new("t", "x")
            .with_node(PlanNode::ForEach(node))
            .with_node(PlanNode::message(Role::User, "after"));
        let (messages, consumed) = run(template, ctx, 1000);
        assert_eq!(contents(&messages), vec!["aaaaaaa", "bbbbbbb", "ccccccc", "after"]);
        assert_eq!(consumed, 6 + 2);
    }

    #[test]
    fn test_message_budget_skips_only_that_message() {
        let ctx = json!({ "items": ["short", "a much longer item text here", "tiny"] });
        let msg = MessageNode {
            role: Role::User,
            content: Some("{{item}}".into()),
            from: None,
            prefix: false,
            budget: Some(2),
            skip_if_empty_interpolation: false,
        };
        let node = for_each(vec![PlanNode::Message(msg)]);
        let (messages, _) = run(Template::new("t", "x").with_node(PlanNode::ForEach(node)), ctx, 1000);
        // The oversize item is dropped but the loop keeps going
        assert_eq!(contents(&messages), vec!["short", "tiny"]);
    }

    #[test]
    fn test_global_exhaustion_stops_loop_by_default() {
        // "xxxxxxxxxxxx" = 3 tokens, "y" = 1 token; global budget 4.
        let ctx = json!({ "items": ["y", "xxxxxxxxxxxx", "y", "y"] });
        let node = for_each(vec![item_message()]);
        let (messages, consumed) = run(Template::new("t", "x").with_node(PlanNode::ForEach(node)), ctx, 4);
        assert_eq!(contents(&messages), vec!["y", "xxxxxxxxxxxx"]);
        assert_eq!(consumed, 4);

        let ctx = json!({ "items": ["xxxxxxxxxxxx", "xxxxxxxxxxxx", "y"] });
        let node = for_each(vec![item_message()]);
        let (messages, _) = run(Template::new("t", "x").with_node(PlanNode::ForEach(node)), ctx, 4);
        assert_eq!(contents(&messages), vec!["xxxxxxxxxxxx"]);
    }

    #[test]
    fn test_global_exhaustion_continues_when_disabled() {
        let ctx = json!({ "items": ["xxxxxxxxxxxx", "xxxxxxxxxxxx", "y"] });
        let mut node = for_each(vec![item_message()]);
        node.stop_when_out_of_budget = false;
        let (messages, consumed) = run(Template::new("t", "x").with_node(PlanNode::ForEach(node)), ctx, 4);
        assert_eq!(contents(&messages), vec!["xxxxxxxxxxxx", "y"]);
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_budget_never_exceeded() {
        let items: Vec<String> = (0..50).map(|i| "w".repeat(i % 9 + 1)).collect();
        let ctx = json!({ "items": items });
        let mut node = for_each(vec![item_message()]);
        node.stop_when_out_of_budget = false;
        let (_, consumed) = run(Template::new("t", "x").with_node(PlanNode::ForEach(node)), ctx, 17);
        assert!(consumed <= 17);
    }

    #[test]
    fn test_slot_priority_claims_budget_but_keeps_layout_order() {
        // Budget fits exactly one of the two slot messages (2 tokens each).
        let template = Template::new("t", "x")
            .with_slot_ref("low")
            .with_slot_ref("high")
            .with_slot("low", 1, vec![PlanNode::message(Role::User, "low-msg")])
            .with_slot("high", 9, vec![PlanNode::message(Role::User, "high-ms")]);
        let (messages, _) = run(template.clone(), json!({}), 2);
        assert_eq!(contents(&messages), vec!["high-ms"]);

        let (messages, _) = run(template, json!({}), 100);
        assert_eq!(contents(&messages), vec!["low-msg", "high-ms"]);
    }

    #[test]
    fn test_from_null_is_skipped_and_values_stringified() {
        let template = Template::new("t", "x")
            .with_node(PlanNode::message_from(Role::User, SourceRef::new("nothing")))
            .with_node(PlanNode::message_from(Role::User, SourceRef::new("obj")))
            .with_node(PlanNode::message_from(Role::User, SourceRef::new("count")))
            .with_node(PlanNode::message_from(Role::User, SourceRef::new("undeclared")));
        let ctx = json!({ "nothing": null, "obj": { "a": [1, 2] }, "count": 7 });
        let (messages, _) = run(template, ctx, 1000);
        assert_eq!(contents(&messages), vec![r#"{"a":[1,2]}"#, "7"]);
    }

    #[test]
    fn test_skip_if_empty_interpolation() {
        let node = |skip| {
            PlanNode::Message(MessageNode {
                role: Role::System,
                content: Some("Intent: {{intent}}".into()),
                from: None,
                prefix: false,
                budget: None,
                skip_if_empty_interpolation: skip,
            })
        };
        let template = Template::new("t", "x").with_node(node(true)).with_node(node(false));
        let (messages, _) = run(template, json!({}), 1000);
        assert_eq!(contents(&messages), vec!["Intent: "]);
    }

    #[test]
    fn test_prefix_preserved_only_when_true() {
        let prefill = PlanNode::Message(MessageNode {
            role: Role::Assistant,
            content: Some("Sure,".into()),
            from: None,
            prefix: true,
            budget: None,
            skip_if_empty_interpolation: false,
        });
        let template = Template::new("t", "x")
            .with_node(PlanNode::message(Role::User, "hi"))
            .with_node(prefill);
        let (messages, _) = run(template, json!({}), 1000);
        assert!(!messages[0].prefix);
        assert!(messages[1].prefix);
    }

    #[test]
    fn test_if_node_branches() {
        let branch = |op, value: Option<Value>| {
            PlanNode::If(IfNode {
                condition: Condition {
                    op,
                    source_ref: SourceRef::new("flag"),
                    value,
                },
                then: vec![PlanNode::message(Role::User, "then")],
                otherwise: vec![PlanNode::message(Role::User, "else")],
            })
        };
        let ctx = json!({ "flag": 5 });
        let cases = [
            (ConditionOp::Exists, None, "then"),
            (ConditionOp::NonEmpty, None, "else"),
            (ConditionOp::Eq, Some(json!(5.0)), "then"),
            (ConditionOp::Neq, Some(json!(5)), "else"),
            (ConditionOp::Gt, Some(json!(4)), "then"),
            (ConditionOp::Lt, Some(json!(4)), "else"),
            (ConditionOp::Gt, Some(json!("4")), "else"),
        ];
        for (op, value, expected) in cases {
            let (messages, _) = run(Template::new("t", "x").with_node(branch(op, value)), ctx.clone(), 1000);
            assert_eq!(contents(&messages), vec![expected], "{op:?}");
        }
    }

    #[test]
    fn test_if_without_else_emits_nothing() {
        let node = PlanNode::If(IfNode {
            condition: Condition {
                op: ConditionOp::NonEmpty,
                source_ref: SourceRef::new("items"),
                value: None,
            },
            then: vec![PlanNode::message(Role::User, "has items")],
            otherwise: vec![],
        });
        let (messages, _) = run(Template::new("t", "x").with_node(node), json!({ "items": [] }), 1000);
        assert!(messages.is_empty());
    }

    #[test]
    fn test_unknown_node_and_non_array_source_render_nothing() {
        let raw = json!({
            "id": "t", "task": "x",
            "layout": [
                { "kind": "image", "url": "x" },
                { "kind": "forEach", "source": { "source": "flag" }, "map": [
                    { "kind": "message", "role": "user", "content": "{{item}}" }
                ]},
                { "kind": "message", "role": "user", "content": "end" }
            ]
        });
        let template: Template = serde_json::from_value(raw).unwrap();
        let (messages, _) = run(template, json!({ "flag": "scalar" }), 1000);
        assert_eq!(contents(&messages), vec!["end"]);
    }
}
