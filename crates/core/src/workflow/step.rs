use super::context::StepContext;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Future returned by a step implementation
pub type StepFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Shared step implementation callback
pub type StepFn = Arc<dyn Fn(StepContext) -> StepFuture + Send + Sync>;

/// Handle to a step owned by a [`StepGraph`].
///
/// Handles are only meaningful for the graph that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepRef(pub(crate) usize);

impl StepRef {
    /// Position of the step in its graph, in creation order.
    pub fn index(self) -> usize {
        self.0
    }
}

/// One unit of work: a name, an optional timeout, an optional implementation
/// and the steps it depends on.
#[derive(Clone)]
pub struct Step {
    name: String,
    timeout: Option<Duration>,
    implementation: Option<StepFn>,
    depends_on: Vec<StepRef>,
}

impl Step {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` means the step may run for as long as it needs.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn depends_on(&self) -> &[StepRef] {
        &self.depends_on
    }

    /// Indicator steps have no implementation and only join their dependencies.
    pub fn is_indicator(&self) -> bool {
        self.implementation.is_none()
    }

    pub(crate) fn implementation(&self) -> Option<&StepFn> {
        self.implementation.as_ref()
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("indicator", &self.is_indicator())
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

/// Arena owning every step of a graph.
///
/// Steps are appended during construction and never removed. The runner
/// borrows the graph immutably, so a graph cannot change while it runs.
/// Step names are not checked here; the runner rejects duplicates.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    steps: Vec<Step>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step with an implementation and explicit dependencies.
    ///
    /// # Panics
    ///
    /// Panics if a dependency handle was not issued by this graph.
    pub fn step<F, Fut>(
        &mut self,
        name: impl Into<String>,
        timeout: Option<Duration>,
        implementation: F,
        depends_on: &[StepRef],
    ) -> StepRef
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let implementation: StepFn = Arc::new(move |ctx| implementation(ctx).boxed());
        self.push(name.into(), timeout, Some(implementation), depends_on)
    }

    /// Add a step with no dependencies.
    pub fn root<F, Fut>(
        &mut self,
        name: impl Into<String>,
        timeout: Option<Duration>,
        implementation: F,
    ) -> StepRef
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.step(name, timeout, implementation, &[])
    }

    /// Add a step that depends on `previous`.
    pub fn then<F, Fut>(
        &mut self,
        previous: StepRef,
        name: impl Into<String>,
        timeout: Option<Duration>,
        implementation: F,
    ) -> StepRef
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.step(name, timeout, implementation, &[previous])
    }

    /// Add a no-op step that completes once all of `depends_on` have.
    pub fn indicator(&mut self, name: impl Into<String>, depends_on: &[StepRef]) -> StepRef {
        self.push(name.into(), None, None, depends_on)
    }

    /// Append one more dependency to an existing step.
    ///
    /// # Panics
    ///
    /// Panics if either handle was not issued by this graph.
    pub fn add_dependency(&mut self, step: StepRef, dependency: StepRef) {
        self.check(dependency);
        self.check(step);
        self.steps[step.0].depends_on.push(dependency);
    }

    /// # Panics
    ///
    /// Panics if the handle was not issued by this graph.
    pub fn get(&self, step: StepRef) -> &Step {
        &self.steps[step.0]
    }

    pub fn name(&self, step: StepRef) -> &str {
        self.get(step).name()
    }

    /// First step created with the given name.
    pub fn find(&self, name: &str) -> Option<StepRef> {
        self.steps
            .iter()
            .position(|s| s.name == name)
            .map(StepRef)
    }

    /// Every step, in creation order.
    pub fn all(&self) -> Vec<StepRef> {
        (0..self.steps.len()).map(StepRef).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StepRef, &Step)> {
        self.steps.iter().enumerate().map(|(i, s)| (StepRef(i), s))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn push(
        &mut self,
        name: String,
        timeout: Option<Duration>,
        implementation: Option<StepFn>,
        depends_on: &[StepRef],
    ) -> StepRef {
        for dep in depends_on {
            self.check(*dep);
        }

        self.steps.push(Step {
            name,
            timeout,
            implementation,
            depends_on: depends_on.to_vec(),
        });
        StepRef(self.steps.len() - 1)
    }

    fn check(&self, step: StepRef) {
        assert!(
            step.0 < self.steps.len(),
            "step handle {} does not belong to this graph",
            step.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_conveniences() {
        let mut graph = StepGraph::new();
        let a = graph.root("a", None, |_| async { Ok(()) });
        let b = graph.then(a, "b", Some(Duration::from_secs(5)), |_| async { Ok(()) });
        let c = graph.root("c", None, |_| async { Ok(()) });
        let done = graph.indicator("done", &[b, c]);

        assert_eq!(graph.len(), 4);
        assert!(graph.get(a).depends_on().is_empty());
        assert_eq!(graph.get(b).depends_on(), &[a]);
        assert_eq!(graph.get(b).timeout(), Some(Duration::from_secs(5)));
        assert_eq!(graph.get(done).depends_on(), &[b, c]);
        assert!(graph.get(done).is_indicator());
        assert!(!graph.get(a).is_indicator());
        assert_eq!(graph.find("c"), Some(c));
        assert_eq!(graph.find("missing"), None);
        assert_eq!(graph.all(), vec![a, b, c, done]);
    }

    #[test]
    fn test_add_dependency_appends_in_order() {
        let mut graph = StepGraph::new();
        let a = graph.indicator("a", &[]);
        let b = graph.indicator("b", &[]);
        let c = graph.indicator("c", &[a]);
        graph.add_dependency(c, b);

        assert_eq!(graph.get(c).depends_on(), &[a, b]);
    }

    #[test]
    #[should_panic(expected = "does not belong to this graph")]
    fn test_foreign_handle_rejected() {
        let mut other = StepGraph::new();
        other.indicator("x", &[]);
        let foreign = other.indicator("y", &[]);

        let mut graph = StepGraph::new();
        graph.indicator("z", &[foreign]);
    }
}
