//! Helpers for testing code built on runtree: a [`Recorder`] behavior that
//! logs every lifecycle call to a shared [`CallLog`].

use std::sync::{Arc, Mutex, PoisonError};

use crate::graph::{
    Behavior, Dependency, Holder, OperatorStatus, ResolvedDependency, RunContext, RunInstanceKey,
    Stage,
};

/// A lifecycle call seen by a [`Recorder`]
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Duplicate,
    /// Dependency names and whether a peer was found
    Resolve(Vec<(String, bool)>),
    RunInit(Stage),
    Run(Stage),
    Cancel,
}

/// One entry in a [`CallLog`]
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub operator: String,
    pub holder: Option<Holder>,
    pub run_instance: Option<RunInstanceKey>,
    pub event: Event,
}

/// Shared log every [`Recorder`] writes to, in call order
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }
    fn push(&self, call: Call) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
    /// A copy of every call so far
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
    /// Calls matching `event`
    pub fn filter(&self, event: &Event) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| &c.event == event)
            .collect()
    }
    /// Number of calls matching `event` made by `operator`
    pub fn count(&self, operator: &str, event: &Event) -> usize {
        self.filter(event)
            .iter()
            .filter(|c| c.operator == operator)
            .count()
    }
    #[allow(missing_docs)]
    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// A behavior that records everything that happens to it.
pub struct Recorder {
    name: String,
    log: CallLog,
    dependencies: Vec<Dependency>,
    /// Periods of pending work left after a cancel
    linger: usize,
    pending: usize,
    done_after: Option<usize>,
    runs: usize,
    /// Peers handed over by dependency resolution
    pub peers: Vec<ResolvedDependency>,
}

impl Recorder {
    #[allow(missing_docs)]
    pub fn new(name: impl Into<String>, log: &CallLog) -> Self {
        Self {
            name: name.into(),
            log: log.clone(),
            dependencies: vec![],
            linger: 0,
            pending: 0,
            done_after: None,
            runs: 0,
            peers: vec![],
        }
    }
    /// Declare a dependency
    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }
    /// Keep pending work for `runs` Post stages after being canceled
    pub fn linger(mut self, runs: usize) -> Self {
        self.linger = runs;
        self
    }
    /// Report done after running `runs` Post stages
    pub fn done_after(mut self, runs: usize) -> Self {
        self.done_after = Some(runs);
        self
    }
    /// Post stages run so far
    pub fn runs(&self) -> usize {
        self.runs
    }
    fn record(&self, ctx: Option<&RunContext>, event: Event) {
        self.log.push(Call {
            operator: self.name.clone(),
            holder: ctx.map(|c| c.holder),
            run_instance: ctx.map(|c| c.run_instance),
            event,
        });
    }
}

impl Behavior for Recorder {
    fn name(&self) -> &str {
        &self.name
    }
    fn duplicate(&self) -> Box<dyn Behavior> {
        self.record(None, Event::Duplicate);
        Box::new(Recorder {
            name: self.name.clone(),
            log: self.log.clone(),
            dependencies: self.dependencies.clone(),
            linger: self.linger,
            pending: 0,
            done_after: self.done_after,
            runs: 0,
            peers: vec![],
        })
    }
    fn dependencies(&self) -> Vec<Dependency> {
        self.dependencies.clone()
    }
    fn resolve_dependencies(&mut self, resolved: Vec<ResolvedDependency>) {
        self.record(
            None,
            Event::Resolve(
                resolved
                    .iter()
                    .map(|r| (r.name.clone(), r.operator.is_some()))
                    .collect(),
            ),
        );
        self.peers = resolved;
    }
    fn run_init(&mut self, ctx: &RunContext) {
        self.record(Some(ctx), Event::RunInit(ctx.stage));
    }
    fn run(&mut self, ctx: &RunContext) -> OperatorStatus {
        self.record(Some(ctx), Event::Run(ctx.stage));
        if ctx.stage == Stage::Post {
            self.runs += 1;
            self.pending = self.pending.saturating_sub(1);
            if self.done_after.is_some_and(|n| self.runs >= n) {
                return OperatorStatus::Done;
            }
        }
        OperatorStatus::Continue
    }
    fn cancel(&mut self) {
        self.record(None, Event::Cancel);
        self.pending = self.linger;
    }
    fn has_pending_work(&self) -> bool {
        self.pending > 0
    }
}
