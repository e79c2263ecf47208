pub mod slots;

use botblocks_common::{FileId, NodeId, Span};
use botblocks_graph::block::*;
use codespan_reporting::diagnostic::{Diagnostic, Label};
use thiserror::Error;
use tracing::debug;

pub use slots::{SlotAllocator, SlotCounts, StatefulFamily, MAX_SLOTS};

/// Non-fatal findings of the pre-pass, one per top-level stack. The program
/// still compiles.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SemaWarning {
    #[error("block stack is not attached to the start block and will not run")]
    Unreachable { span: Span },
    #[error("extra start block ignored; only the first one runs")]
    ExtraStart { span: Span },
}

impl SemaWarning {
    pub fn span(&self) -> Span {
        match self {
            SemaWarning::Unreachable { span } | SemaWarning::ExtraStart { span } => *span,
        }
    }

    pub fn to_diagnostic(&self, file_id: FileId) -> Diagnostic<FileId> {
        let label = match self {
            SemaWarning::Unreachable { .. } => "never runs",
            SemaWarning::ExtraStart { .. } => "ignored",
        };
        Diagnostic::warning()
            .with_message(self.to_string())
            .with_labels(vec![
                Label::primary(file_id, self.span().to_range()).with_message(label)
            ])
    }
}

/// Result of the pre-pass over the block graph.
#[derive(Debug)]
pub struct SemaResult {
    /// The start block whose chain becomes the program, if any.
    pub start: Option<NodeId>,
    /// Slots for every variable and stateful block reachable from `start`.
    pub slots: SlotAllocator,
    /// Number of blocks the compiler will visit.
    pub reachable: usize,
    pub warnings: Vec<SemaWarning>,
}

impl SemaResult {
    pub fn to_diagnostics(&self, file_id: FileId) -> Vec<Diagnostic<FileId>> {
        self.warnings
            .iter()
            .map(|w| w.to_diagnostic(file_id))
            .collect()
    }
}

pub struct SemanticAnalyzer<'g> {
    graph: &'g Graph,
    slots: SlotAllocator,
    reachable: usize,
}

impl<'g> SemanticAnalyzer<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            slots: SlotAllocator::new(),
            reachable: 0,
        }
    }

    pub fn analyze(mut self) -> SemaResult {
        let starts = self.graph.start_blocks();
        let start = starts.first().copied();
        let mut warnings = Vec::new();

        if start.is_some() {
            for &root in self.graph.roots.iter().filter(|&&r| Some(r) != start) {
                let span = self.graph.root_span(root).unwrap_or(Span::new(0, 0));
                warnings.push(match self.graph.kind(root) {
                    BlockKind::Start => SemaWarning::ExtraStart { span },
                    _ => SemaWarning::Unreachable { span },
                });
            }
        }

        if let Some(start) = start {
            self.reachable += 1;
            self.visit_chain(self.graph.node(start).next);
        }

        debug!(
            reachable = self.reachable,
            variables = self.slots.counts().variables,
            "slot pre-pass complete"
        );

        SemaResult {
            start,
            slots: self.slots,
            reachable: self.reachable,
            warnings,
        }
    }

    fn visit_chain(&mut self, first: Option<NodeId>) {
        for id in self.graph.chain(first) {
            if self.graph.kind(id).is_statement() {
                self.visit(id);
            }
        }
    }

    fn visit_value(&mut self, id: NodeId) {
        if self.graph.kind(id).is_value() {
            self.visit(id);
        }
    }

    fn visit(&mut self, id: NodeId) {
        self.reachable += 1;
        match self.graph.kind(id) {
            BlockKind::SetVariable
            | BlockKind::ChangeVariable
            | BlockKind::For
            | BlockKind::GetVariable => {
                let name = self.graph.variable_name(id);
                self.slots.slot_for(&name);
            }
            BlockKind::Pid => {
                self.slots.slot_for_stateful(StatefulFamily::Pid, id);
            }
            BlockKind::Smooth => {
                self.slots.slot_for_stateful(StatefulFamily::Smooth, id);
            }
            BlockKind::Schmitt => {
                self.slots.slot_for_stateful(StatefulFamily::Schmitt, id);
            }
            BlockKind::Edge => {
                self.slots.slot_for_stateful(StatefulFamily::Edge, id);
            }
            _ => {}
        }

        for (child, input) in self.graph.children(id) {
            match input {
                InputKind::Value => self.visit_value(child),
                InputKind::Statements => self.visit_chain(Some(child)),
            }
        }
    }
}

/// Convenience function to run the pre-pass.
pub fn analyze(graph: &Graph) -> SemaResult {
    SemanticAnalyzer::new(graph).analyze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use botblocks_graph::parse;

    fn analyze_str(input: &str) -> SemaResult {
        let graph = parse(input).expect("parse error");
        analyze(&graph)
    }

    fn program(body: &str) -> String {
        format!(r#"{{"blocks": [{{"type": "robot_start", "next": {body}}}]}}"#)
    }

    #[test]
    fn test_variables_in_first_use_order() {
        let result = analyze_str(&program(
            r#"{"type": "variables_set", "fields": {"VAR": "b"},
                "inputs": {"VALUE": {"type": "variables_get", "fields": {"VAR": "a"}}},
                "next": {"type": "math_change", "fields": {"VAR": "b"}}}"#,
        ));
        assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
        assert_eq!(result.slots.variable_names(), ["b", "a"]);
        assert_eq!(result.start, Some(NodeId(0)));
    }

    #[test]
    fn test_stateful_blocks_get_slots() {
        let result = analyze_str(&program(
            r#"{"type": "robot_drive", "inputs": {"SPEED": {"type": "robot_pid", "inputs": {
                "ERROR": {"type": "robot_smooth", "fields": {"WINDOW": 3},
                    "inputs": {"VALUE": {"type": "robot_sensor"}}},
                "KP": {"type": "robot_edge", "inputs": {"VALUE": {"type": "robot_sensor"}}}}}}}"#,
        ));
        let counts = result.slots.counts();
        assert_eq!(counts.pid, 1);
        assert_eq!(counts.smooth, 1);
        assert_eq!(counts.edge, 1);
        assert_eq!(counts.schmitt, 0);
        assert_eq!(counts.variables, 0);
    }

    #[test]
    fn test_unknown_blocks_are_not_walked() {
        let result = analyze_str(&program(
            r#"{"type": "text_print", "inputs": {"TEXT": {"type": "variables_get", "fields": {"VAR": "ghost"}}},
                "next": {"type": "math_arithmetic", "fields": {"OP": "HYPOT"},
                    "inputs": {"A": {"type": "robot_pid"}}}}"#,
        ));
        // Neither the unknown statement nor a value block sitting in a
        // statement chain lowers its inputs, so nothing is allocated.
        assert_eq!(result.slots.counts(), SlotCounts::default());
    }

    #[test]
    fn test_detached_stacks_warn() {
        let source = r#"{"blocks": [{"type": "robot_start"}, {"type": "robot_stop"}, {"type": "robot_start"}]}"#;
        let result = analyze_str(source);
        assert_eq!(result.start, Some(NodeId(0)));

        let stop_at = source.find(r#"{"type": "robot_stop"}"#).unwrap();
        let second_start_at = source.rfind(r#"{"type": "robot_start"}"#).unwrap();
        assert_eq!(
            result.warnings,
            vec![
                SemaWarning::Unreachable {
                    span: Span::new(stop_at, stop_at + 22)
                },
                SemaWarning::ExtraStart {
                    span: Span::new(second_start_at, second_start_at + 23)
                },
            ]
        );

        let diags = result.to_diagnostics(0);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].labels.len(), 1);
        assert_eq!(diags[0].labels[0].range, stop_at..stop_at + 22);
    }

    #[test]
    fn test_no_start_block() {
        let result = analyze_str(r#"{"blocks": [{"type": "robot_stop"}]}"#);
        assert_eq!(result.start, None);
        assert_eq!(result.reachable, 0);
    }

    #[test]
    fn test_if_branches_are_walked() {
        let result = analyze_str(&program(
            r#"{"type": "controls_if", "inputs": {
                "IF0": {"type": "variables_get", "fields": {"VAR": "c0"}},
                "DO0": {"type": "variables_set", "fields": {"VAR": "x"}},
                "IF1": {"type": "variables_get", "fields": {"VAR": "c1"}},
                "ELSE": {"type": "variables_set", "fields": {"VAR": "y"},
                    "next": {"type": "variables_set", "fields": {"VAR": "z"}}}}}"#,
        ));
        assert_eq!(result.slots.variable_names(), ["c0", "x", "c1", "y", "z"]);
    }
}
