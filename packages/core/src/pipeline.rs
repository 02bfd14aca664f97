//! Pipelines: directed sequences of job definitions.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. Each node has at
//! most one successor, and linking is rejected when it would close a cycle.
//! Pipelines are structural only; data still flows through queues.

use std::collections::HashSet;

use crate::error::PipelineError;
use crate::job::JobDefinition;

/// Index of a node inside a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named group of jobs forming one stage.
#[derive(Clone)]
pub struct PipelineNode {
    pub name: String,
    pub description: Option<String>,
    pub jobs: Vec<JobDefinition>,
}

impl PipelineNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            jobs: Vec::new(),
        }
    }

    /// Node holding a single job, named after it.
    pub fn single(job: JobDefinition) -> Self {
        Self {
            name: job.name.clone(),
            description: job.description.clone(),
            jobs: vec![job],
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_job(mut self, job: JobDefinition) -> Self {
        self.jobs.push(job);
        self
    }
}

impl std::fmt::Debug for PipelineNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineNode")
            .field("name", &self.name)
            .field("jobs", &self.jobs.iter().map(|j| &j.name).collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub name: String,
    nodes: Vec<PipelineNode>,
    next: Vec<Option<NodeId>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            next: Vec::new(),
        }
    }

    /// Build a linear pipeline from a list of jobs, one node per job.
    pub fn chain(name: impl Into<String>, jobs: impl IntoIterator<Item = JobDefinition>) -> Self {
        let mut pipeline = Self::new(name);
        let mut previous: Option<NodeId> = None;
        for job in jobs {
            let id = pipeline.add_node(PipelineNode::single(job));
            if let Some(prev) = previous {
                // Fresh nodes cannot form a cycle.
                pipeline.next[prev.0] = Some(id);
            }
            previous = Some(id);
        }
        pipeline
    }

    pub fn add_node(&mut self, node: PipelineNode) -> NodeId {
        self.nodes.push(node);
        self.next.push(None);
        NodeId(self.nodes.len() - 1)
    }

    pub fn node(&self, id: NodeId) -> Option<&PipelineNode> {
        self.nodes.get(id.0)
    }

    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        self.next.get(id.0).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Set `to` as the successor of `from`, replacing any previous link.
    pub fn link(&mut self, from: NodeId, to: NodeId) -> Result<(), PipelineError> {
        for id in [from, to] {
            if id.0 >= self.nodes.len() {
                return Err(PipelineError::UnknownNode(id));
            }
        }
        if self.traverse(to).any(|id| id == from) {
            return Err(PipelineError::Cycle { from, to });
        }
        self.next[from.0] = Some(to);
        Ok(())
    }

    /// Walk successors starting at `start` (inclusive).
    pub fn traverse(&self, start: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut seen = HashSet::new();
        let mut current = self.node(start).map(|_| start);
        std::iter::from_fn(move || {
            let id = current?;
            if !seen.insert(id) {
                return None;
            }
            current = self.successor(id);
            Some(id)
        })
    }

    /// Nodes that are not the successor of any other node.
    pub fn roots(&self) -> Vec<NodeId> {
        let targets: HashSet<NodeId> = self.next.iter().flatten().copied().collect();
        (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| !targets.contains(id))
            .collect()
    }

    /// Jobs in traversal order from every root.
    pub fn jobs_in_order(&self) -> Vec<&JobDefinition> {
        self.roots()
            .into_iter()
            .flat_map(|root| self.traverse(root))
            .flat_map(|id| self.nodes[id.0].jobs.iter())
            .collect()
    }

    pub fn into_jobs(self) -> Vec<JobDefinition> {
        let order: Vec<NodeId> = self
            .roots()
            .into_iter()
            .flat_map(|root| self.traverse(root).collect::<Vec<_>>())
            .collect();
        let mut slots: Vec<Option<PipelineNode>> = self.nodes.into_iter().map(Some).collect();
        order
            .into_iter()
            .filter_map(|id| slots[id.0].take())
            .flat_map(|node| node.jobs)
            .collect()
    }

    /// Edges where no job of `from` outputs to a queue some job of `to` reads.
    pub fn unwired_edges(&self) -> Vec<(NodeId, NodeId)> {
        self.next
            .iter()
            .enumerate()
            .filter_map(|(from, to)| to.map(|to| (NodeId(from), to)))
            .filter(|(from, to)| {
                let outputs: HashSet<&str> = self.nodes[from.0]
                    .jobs
                    .iter()
                    .flat_map(|job| job.output_queue_refs.iter())
                    .map(|r| r.identifier.as_str())
                    .collect();
                !self.nodes[to.0]
                    .jobs
                    .iter()
                    .flat_map(|job| job.input_queue_refs.iter())
                    .any(|r| outputs.contains(r.identifier.as_str()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::job::{JobDefinition, JobOutput};

    fn job(name: &str, input: Option<&str>, output: Option<&str>) -> JobDefinition {
        let mut def = JobDefinition::new(name, |_call| async { Ok(JobOutput::Nothing) });
        if let Some(input) = input {
            def = def.with_input(input);
        }
        if let Some(output) = output {
            def = def.with_output(output);
        }
        def
    }

    #[test]
    fn chain_links_in_order() {
        let pipeline = Pipeline::chain(
            "etl",
            [
                job("extract", None, Some("raw")),
                job("transform", Some("raw"), Some("clean")),
                job("load", Some("clean"), None),
            ],
        );
        let names: Vec<&str> = pipeline.jobs_in_order().iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["extract", "transform", "load"]);
        assert_eq!(pipeline.roots(), vec![NodeId(0)]);
        assert!(pipeline.unwired_edges().is_empty());
    }

    #[test]
    fn link_rejects_cycles_and_self_loops() {
        let mut pipeline = Pipeline::new("p");
        let a = pipeline.add_node(PipelineNode::new("a"));
        let b = pipeline.add_node(PipelineNode::new("b"));
        let c = pipeline.add_node(PipelineNode::new("c"));

        pipeline.link(a, b).unwrap();
        pipeline.link(b, c).unwrap();
        assert_eq!(pipeline.link(c, a), Err(PipelineError::Cycle { from: c, to: a }));
        assert_eq!(pipeline.link(a, a), Err(PipelineError::Cycle { from: a, to: a }));
        assert_eq!(
            pipeline.link(a, NodeId(9)),
            Err(PipelineError::UnknownNode(NodeId(9)))
        );
        assert_eq!(pipeline.traverse(a).collect::<Vec<_>>(), vec![a, b, c]);
    }

    #[test]
    fn unwired_edges_are_reported() {
        let pipeline = Pipeline::chain(
            "broken",
            [job("first", None, Some("q1")), job("second", Some("q2"), None)],
        );
        assert_eq!(pipeline.unwired_edges(), vec![(NodeId(0), NodeId(1))]);
    }

    #[test]
    fn into_jobs_keeps_traversal_order() {
        let mut pipeline = Pipeline::new("p");
        let tail = pipeline.add_node(PipelineNode::single(job("tail", None, None)));
        let head = pipeline.add_node(PipelineNode::single(job("head", None, None)));
        pipeline.link(head, tail).unwrap();

        let names: Vec<String> = pipeline.into_jobs().into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["head".to_string(), "tail".to_string()]);
    }
}
