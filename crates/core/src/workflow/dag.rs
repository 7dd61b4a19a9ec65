//! Dependency resolution over a [`StepGraph`].

use super::step::{StepGraph, StepRef};
use crate::error::CycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unvisited,
    InProgress,
    Done,
}

impl StepGraph {
    /// Every step reachable from `root` through `depends_on`, including
    /// `root` itself, in topological order (dependencies first).
    ///
    /// Dependencies are walked in insertion order, so the same graph always
    /// yields the same ordering.
    pub fn transitive_dependencies(&self, root: StepRef) -> Result<Vec<StepRef>, CycleError> {
        self.transitive_dependencies_of(&[root])
    }

    /// Union of the transitive dependencies of several roots, visited in the
    /// given order.
    pub fn transitive_dependencies_of(&self, roots: &[StepRef]) -> Result<Vec<StepRef>, CycleError> {
        let mut walk = Walk {
            graph: self,
            state: vec![Visit::Unvisited; self.len()],
            path: Vec::new(),
            order: Vec::new(),
        };

        for &root in roots {
            walk.visit(root)?;
        }

        Ok(walk.order)
    }
}

struct Walk<'a> {
    graph: &'a StepGraph,
    state: Vec<Visit>,
    path: Vec<StepRef>,
    order: Vec<StepRef>,
}

impl Walk<'_> {
    /// Iterative post-order walk from `root`. `path` mirrors the frames, so
    /// it always holds the steps currently in progress.
    fn visit(&mut self, root: StepRef) -> Result<(), CycleError> {
        match self.state[root.index()] {
            Visit::Done => return Ok(()),
            Visit::InProgress => return Err(self.cycle_through(root)),
            Visit::Unvisited => {}
        }

        // Each frame is a step on the path and the index of its next dependency.
        let mut frames = vec![(root, 0usize)];
        self.enter(root);

        while let Some(&(step, next)) = frames.last() {
            let graph = self.graph;
            let Some(&dep) = graph.get(step).depends_on().get(next) else {
                frames.pop();
                self.path.pop();
                self.state[step.index()] = Visit::Done;
                self.order.push(step);
                continue;
            };

            let top = frames.len() - 1;
            frames[top].1 += 1;
            match self.state[dep.index()] {
                Visit::Done => {}
                Visit::InProgress => return Err(self.cycle_through(dep)),
                Visit::Unvisited => {
                    self.enter(dep);
                    frames.push((dep, 0));
                }
            }
        }

        Ok(())
    }

    fn enter(&mut self, step: StepRef) {
        self.state[step.index()] = Visit::InProgress;
        self.path.push(step);
    }

    /// `step` is on the current path; the cycle is the path from there down.
    fn cycle_through(&self, step: StepRef) -> CycleError {
        let start = self.path.iter().position(|s| *s == step).unwrap_or(0);
        let chain = self.path[start..]
            .iter()
            .chain(std::iter::once(&step))
            .map(|s| self.graph.name(*s).to_string())
            .collect();
        CycleError { chain }
    }
}
