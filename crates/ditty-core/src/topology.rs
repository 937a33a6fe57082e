//! Score topology.
//!
//! The dry run of a score produces a [`ScoreStructure`]: which loops and
//! filters exist, which of them run as their own task, and where each one
//! sends its output. The session builds its task graph from it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{DittyError, Result};

/// Kind of a node in the score graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Loop = 0,
    InlineFilter = 1,
    SharedFilter = 2,
    Output = 3,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Loop => "loop",
            NodeKind::InlineFilter => "inline filter",
            NodeKind::SharedFilter => "shared filter",
            NodeKind::Output => "output",
        };
        f.write_str(name)
    }
}

/// Where a node is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunAs {
    /// In its own generator task.
    Task,
    /// Inside the chain of the node it is attached to.
    Inline,
}

/// Destination of a node's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOut {
    pub kind: NodeKind,
    pub name: Option<String>,
}

impl NodeOut {
    pub fn output() -> Self {
        Self {
            kind: NodeKind::Output,
            name: None,
        }
    }

    pub fn inline() -> Self {
        Self {
            kind: NodeKind::InlineFilter,
            name: None,
        }
    }

    pub fn shared(name: &str) -> Self {
        Self {
            kind: NodeKind::SharedFilter,
            name: Some(name.to_string()),
        }
    }
}

impl fmt::Display for NodeOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} '{}'", self.kind, name),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// One loop or filter of a compiled score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyEntry {
    pub name: String,
    pub kind: NodeKind,
    pub run_as: RunAs,
    pub out: NodeOut,
}

impl TopologyEntry {
    /// Whether this entry consumes the output of `other`.
    pub fn feeds_from(&self, other: &TopologyEntry) -> bool {
        other.out.kind == self.kind && other.out.name.as_deref() == Some(self.name.as_str())
    }
}

/// Structure of a compiled score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreStructure {
    pub bpm: f64,
    pub sample_rate: u32,
    pub loops: Vec<TopologyEntry>,
    pub filters: Vec<TopologyEntry>,
}

impl ScoreStructure {
    /// Entries that run as their own task: every loop and every shared filter.
    pub fn tasks(&self) -> Vec<&TopologyEntry> {
        self.loops
            .iter()
            .chain(self.filters.iter().filter(|f| f.run_as == RunAs::Task))
            .collect()
    }

    /// Tasks whose output goes to `entry`.
    pub fn inputs_of(&self, entry: &TopologyEntry) -> Vec<&TopologyEntry> {
        self.tasks()
            .into_iter()
            .filter(|t| entry.feeds_from(t))
            .collect()
    }

    /// Tasks mixed by the final output bus.
    pub fn outputs(&self) -> Vec<&TopologyEntry> {
        self.tasks()
            .into_iter()
            .filter(|t| t.out.kind == NodeKind::Output)
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<&TopologyEntry> {
        self.loops.iter().chain(self.filters.iter()).find(|e| e.name == name)
    }

    /// Check that every shared destination exists and the task graph has no cycles.
    pub fn validate(&self) -> Result<()> {
        let tasks = self.tasks();
        let shared: BTreeSet<&str> = tasks
            .iter()
            .filter(|t| t.kind == NodeKind::SharedFilter)
            .map(|t| t.name.as_str())
            .collect();

        let mut next: BTreeMap<&str, &str> = BTreeMap::new();
        for task in &tasks {
            if task.out.kind == NodeKind::SharedFilter {
                let target = task.out.name.as_deref().unwrap_or_default();
                if !shared.contains(target) {
                    return Err(DittyError::UnknownNode(format!(
                        "{} sends to missing shared filter '{}'",
                        task.name, target
                    )));
                }
                next.insert(task.name.as_str(), target);
            }
        }

        // every task has at most one destination, so following it must end at the output
        for task in &tasks {
            let mut seen = BTreeSet::new();
            let mut current = task.name.as_str();
            while let Some(&target) = next.get(current) {
                if !seen.insert(current) {
                    return Err(DittyError::Config(format!(
                        "shared filter cycle through '{}'",
                        current
                    )));
                }
                current = target;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: NodeKind, run_as: RunAs, out: NodeOut) -> TopologyEntry {
        TopologyEntry {
            name: name.to_string(),
            kind,
            run_as,
            out,
        }
    }

    fn structure(filters: Vec<TopologyEntry>, loops: Vec<TopologyEntry>) -> ScoreStructure {
        ScoreStructure {
            bpm: 120.0,
            sample_rate: 44100,
            loops,
            filters,
        }
    }

    #[test]
    fn test_tasks_and_inputs() {
        let s = structure(
            vec![
                entry("reverb", NodeKind::SharedFilter, RunAs::Task, NodeOut::output()),
                entry("drive", NodeKind::InlineFilter, RunAs::Inline, NodeOut::inline()),
            ],
            vec![
                entry("bass", NodeKind::Loop, RunAs::Task, NodeOut::shared("reverb")),
                entry("lead", NodeKind::Loop, RunAs::Task, NodeOut::output()),
            ],
        );
        let tasks: Vec<&str> = s.tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tasks, vec!["bass", "lead", "reverb"]);

        let reverb = s.find("reverb").unwrap();
        let inputs: Vec<&str> = s.inputs_of(reverb).iter().map(|t| t.name.as_str()).collect();
        assert_eq!(inputs, vec!["bass"]);

        let outputs: Vec<&str> = s.outputs().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(outputs, vec!["lead", "reverb"]);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_missing_shared_filter() {
        let s = structure(
            vec![],
            vec![entry("bass", NodeKind::Loop, RunAs::Task, NodeOut::shared("nope"))],
        );
        assert!(matches!(s.validate(), Err(DittyError::UnknownNode(_))));
    }

    #[test]
    fn test_shared_cycle_rejected() {
        let s = structure(
            vec![
                entry("a", NodeKind::SharedFilter, RunAs::Task, NodeOut::shared("b")),
                entry("b", NodeKind::SharedFilter, RunAs::Task, NodeOut::shared("a")),
            ],
            vec![],
        );
        assert!(matches!(s.validate(), Err(DittyError::Config(_))));
    }

    #[test]
    fn test_display() {
        assert_eq!(NodeOut::shared("echo").to_string(), "shared filter 'echo'");
        assert_eq!(NodeOut::output().to_string(), "output");
    }
}
