//! Operators are the units of work attached to holders.
//!
//! A holder keeps *templates*; every run instance that reaches the holder
//! gets its own clone of each matching template, bound to that instance and
//! its [`RunGroup`](super::RunGroup). Clones go through
//! duplicate → resolve dependencies → run init (Pre, Inter, Post) → run, and
//! finally cancel/done before they are removed.
//!
//! What an operator does is given by its [`Behavior`]. Implement it and you
//! can be an operator:
//!
//! ```
//! # use runtree::prelude::*;
//! struct Gain {
//!     amount: f32,
//! }
//! impl Behavior for Gain {
//!     fn name(&self) -> &str {
//!         "gain"
//!     }
//!     fn duplicate(&self) -> Box<dyn Behavior> {
//!         Box::new(Gain { amount: self.amount })
//!     }
//!     fn run(&mut self, _ctx: &RunContext) -> OperatorStatus {
//!         OperatorStatus::Continue
//!     }
//! }
//! let mut graph = Graph::default();
//! let unit = graph.add_unit(UnitSettings::default());
//! graph.add_template(unit, Operator::template(Gain { amount: 0.5 }))?;
//! # Ok::<(), runtree::EngineError>(())
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use downcast_rs::{impl_downcast, Downcast};

use super::{Graph, Holder, RunGroupKey, RunInstanceKey, Stage, SubBufferKey};
use crate::Sample;

bitflags::bitflags! {
    /// What a run is for. Templates only produce clones for runs whose
    /// purposes intersect their own.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    #[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
    pub struct Purpose: u8 {
        #[allow(missing_docs)]
        const PLAYBACK = 1;
        #[allow(missing_docs)]
        const SEQUENCER = 1 << 1;
        #[allow(missing_docs)]
        const NOTATION = 1 << 2;
    }
}

/// Unique id of an [`Operator`]. Clones get their own id and remember the
/// id of their template.
pub type OperatorId = u64;

/// Get a unique id for an Operator from this by using `fetch_add`
static NEXT_OPERATOR_ID: AtomicU64 = AtomicU64::new(0);

/// Operators are shared between the graph and running [`RunPlan`](super::RunPlan)s.
pub type SharedOperator = Arc<Mutex<Operator>>;

/// Lock an operator, ignoring poisoning from a panicking behavior.
pub(crate) fn lock(operator: &SharedOperator) -> MutexGuard<'_, Operator> {
    operator.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
/// How a template is used
pub enum OperatorKind {
    /// Cloned once per run instance and run every period
    Run,
    /// One instance per holder, never cloned or run; peers can depend on it
    Shared,
}

/// Which operator list of a holder a template may produce clones for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub enum OperatorScope {
    /// Both lists
    #[default]
    Any,
    /// Only runs in a top level group
    Play,
    /// Only runs in a nested group
    Recall,
}

impl OperatorScope {
    fn admits(self, top_level: bool) -> bool {
        match self {
            OperatorScope::Any => true,
            OperatorScope::Play => top_level,
            OperatorScope::Recall => !top_level,
        }
    }
}

#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lifecycle {
    Template,
    Duplicated,
    DependencyResolved,
    RunInitialized,
    Running,
    Canceled,
    Done,
}

/// Returned from [`Behavior::run`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperatorStatus {
    /// Keep running next period
    Continue,
    /// This operator has finished and can be removed
    Done,
}

/// Where to look for a peer an operator depends on
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DependencyScope {
    /// Clones on the same holder
    Holder,
    /// Clones on the unit owning the holder
    Unit,
}

/// A peer an operator wants a handle to, found by behavior name.
#[derive(Clone, Debug, PartialEq)]
pub struct Dependency {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub scope: DependencyScope,
}

impl Dependency {
    #[allow(missing_docs)]
    pub fn new(name: impl Into<String>, scope: DependencyScope) -> Self {
        Self {
            name: name.into(),
            scope,
        }
    }
}

/// A [`Dependency`] after resolution. A missing peer is `None`; the
/// operator is expected to run degraded.
#[derive(Clone)]
pub struct ResolvedDependency {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub operator: Option<SharedOperator>,
}

/// Passed to a [`Behavior`] whenever it is initialised or run.
#[derive(Clone, Debug)]
pub struct RunContext {
    #[allow(missing_docs)]
    pub stage: Stage,
    #[allow(missing_docs)]
    pub sample_rate: Sample,
    /// Frames per period
    pub block_size: usize,
    #[allow(missing_docs)]
    pub holder: Holder,
    #[allow(missing_docs)]
    pub run_instance: RunInstanceKey,
    /// The first sub buffer of the run instance, if it has one
    pub sub_buffer: Option<SubBufferKey>,
}

/// Sent by a running operator that returned [`OperatorStatus::Done`] or
/// finished winding down after a cancel.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorDone {
    #[allow(missing_docs)]
    pub holder: Holder,
    #[allow(missing_docs)]
    pub operator: OperatorId,
}

/// A canceled operator whose run instance was discarded by an edit
pub(crate) struct Retired {
    pub(crate) holder: Holder,
    pub(crate) run_instance: RunInstanceKey,
    pub(crate) operator: SharedOperator,
}

/// The behavior of an operator.
///
/// Everything except [`Behavior::name`], [`Behavior::duplicate`] and
/// [`Behavior::run`] has a default doing nothing.
pub trait Behavior: Downcast + Send {
    /// Name peers use to declare a dependency on this behavior
    fn name(&self) -> &str;
    /// Fresh behavior for a clone, carrying over configuration but no run state
    fn duplicate(&self) -> Box<dyn Behavior>;
    /// Peers this behavior wants handles to
    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }
    /// Called once after duplication with one entry per declared dependency
    fn resolve_dependencies(&mut self, _resolved: Vec<ResolvedDependency>) {}
    /// Called once per stage before the first run
    fn run_init(&mut self, _ctx: &RunContext) {}
    /// Do the work of `ctx.stage` for one period
    fn run(&mut self, ctx: &RunContext) -> OperatorStatus;
    /// Advisory cancellation. Keep returning true from
    /// [`Behavior::has_pending_work`] until wound down.
    fn cancel(&mut self) {}
    #[allow(missing_docs)]
    fn has_pending_work(&self) -> bool {
        false
    }
}
impl_downcast!(Behavior);

/// A template or a clone of one, see the [module level documentation](self).
pub struct Operator {
    id: OperatorId,
    template_id: Option<OperatorId>,
    kind: OperatorKind,
    template: bool,
    scope: OperatorScope,
    purposes: Purpose,
    run_instance: Option<RunInstanceKey>,
    run_group: Option<RunGroupKey>,
    lifecycle: Lifecycle,
    init_stages: u8,
    hidden: bool,
    canceled: bool,
    behavior: Box<dyn Behavior>,
}

impl Operator {
    /// A template producing clones for every run that reaches its holder
    pub fn template(behavior: impl Behavior) -> Self {
        Self::from_boxed(Box::new(behavior), OperatorKind::Run)
    }
    /// A singleton per holder that is never cloned or run
    pub fn shared(behavior: impl Behavior) -> Self {
        Self::from_boxed(Box::new(behavior), OperatorKind::Shared)
    }
    /// A template from an already boxed behavior
    pub fn from_boxed(behavior: Box<dyn Behavior>, kind: OperatorKind) -> Self {
        Self {
            id: NEXT_OPERATOR_ID.fetch_add(1, Ordering::Relaxed),
            template_id: None,
            kind,
            template: true,
            scope: OperatorScope::Any,
            purposes: Purpose::all(),
            run_instance: None,
            run_group: None,
            lifecycle: Lifecycle::Template,
            init_stages: 0,
            hidden: false,
            canceled: false,
            behavior,
        }
    }
    /// Set the purposes this template produces clones for
    #[must_use]
    pub fn purposes(mut self, purposes: Purpose) -> Self {
        self.purposes = purposes;
        self
    }
    /// Restrict which list clones may go to
    #[must_use]
    pub fn scope(mut self, scope: OperatorScope) -> Self {
        self.scope = scope;
        self
    }
    #[allow(missing_docs)]
    pub fn id(&self) -> OperatorId {
        self.id
    }
    /// For a clone, the id of the template it was made from
    pub fn template_id(&self) -> Option<OperatorId> {
        self.template_id
    }
    #[allow(missing_docs)]
    pub fn kind(&self) -> OperatorKind {
        self.kind
    }
    #[allow(missing_docs)]
    pub fn is_template(&self) -> bool {
        self.template
    }
    #[allow(missing_docs)]
    pub fn purpose_flags(&self) -> Purpose {
        self.purposes
    }
    /// Which list clones of this template go to
    pub fn scope_flags(&self) -> OperatorScope {
        self.scope
    }
    #[allow(missing_docs)]
    pub fn run_instance(&self) -> Option<RunInstanceKey> {
        self.run_instance
    }
    #[allow(missing_docs)]
    pub fn run_group(&self) -> Option<RunGroupKey> {
        self.run_group
    }
    #[allow(missing_docs)]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }
    /// Hidden clones are skipped when running until their Pre init
    pub fn is_hidden(&self) -> bool {
        self.hidden
    }
    #[allow(missing_docs)]
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }
    /// True if `stage` has been initialised
    pub fn is_initialized(&self, stage: Stage) -> bool {
        self.init_stages & stage.bit() != 0
    }
    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        self.behavior.name()
    }
    #[allow(missing_docs)]
    pub fn behavior(&self) -> &dyn Behavior {
        self.behavior.as_ref()
    }
    #[allow(missing_docs)]
    pub fn behavior_mut(&mut self) -> &mut dyn Behavior {
        self.behavior.as_mut()
    }
    /// Reach the concrete behavior
    pub fn downcast_behavior<T: Behavior>(&self) -> Option<&T> {
        self.behavior.downcast_ref::<T>()
    }
    /// Reach the concrete behavior mutably
    pub fn downcast_behavior_mut<T: Behavior>(&mut self) -> Option<&mut T> {
        self.behavior.downcast_mut::<T>()
    }
    /// True until the operator is done and its behavior has nothing left to do
    pub fn has_pending_work(&self) -> bool {
        self.lifecycle != Lifecycle::Done && self.behavior.has_pending_work()
    }

    fn clone_for(
        &self,
        purposes: Purpose,
        run_instance: RunInstanceKey,
        group: RunGroupKey,
    ) -> Self {
        Self {
            id: NEXT_OPERATOR_ID.fetch_add(1, Ordering::Relaxed),
            template_id: Some(self.id),
            kind: self.kind,
            template: false,
            scope: self.scope,
            purposes: self.purposes & purposes,
            run_instance: Some(run_instance),
            run_group: Some(group),
            lifecycle: Lifecycle::Duplicated,
            init_stages: 0,
            hidden: true,
            canceled: false,
            behavior: self.behavior.duplicate(),
        }
    }

    fn resolve(&mut self, resolved: Vec<ResolvedDependency>) {
        if self.lifecycle == Lifecycle::Duplicated {
            self.behavior.resolve_dependencies(resolved);
            self.lifecycle = Lifecycle::DependencyResolved;
        }
    }

    /// Returns false if `stage` was already initialised
    fn run_init_stage(&mut self, ctx: &RunContext) -> bool {
        let bit = ctx.stage.bit();
        if self.template || self.init_stages & bit != 0 {
            return false;
        }
        if ctx.stage == Stage::Pre {
            self.hidden = false;
        }
        self.behavior.run_init(ctx);
        self.init_stages |= bit;
        if self.init_stages == 0b111 && self.lifecycle < Lifecycle::RunInitialized {
            self.lifecycle = Lifecycle::RunInitialized;
        }
        true
    }

    /// Run one stage. Returns true if the operator became done.
    pub(crate) fn run_stage(&mut self, ctx: &RunContext) -> bool {
        if self.template
            || self.hidden
            || self.kind == OperatorKind::Shared
            || self.lifecycle == Lifecycle::Done
        {
            return false;
        }
        let status = self.behavior.run(ctx);
        if matches!(
            self.lifecycle,
            Lifecycle::RunInitialized | Lifecycle::DependencyResolved
        ) {
            self.lifecycle = Lifecycle::Running;
        }
        if status == OperatorStatus::Done || (self.canceled && !self.behavior.has_pending_work()) {
            self.lifecycle = Lifecycle::Done;
            return true;
        }
        false
    }

    /// Returns true if the operator finished right away.
    pub(crate) fn cancel(&mut self) -> bool {
        if self.template || self.canceled || self.lifecycle == Lifecycle::Done {
            return false;
        }
        self.canceled = true;
        self.lifecycle = Lifecycle::Canceled;
        self.behavior.cancel();
        if !self.behavior.has_pending_work() {
            self.lifecycle = Lifecycle::Done;
            return true;
        }
        false
    }
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("id", &self.id)
            .field("name", &self.behavior.name())
            .field("template_id", &self.template_id)
            .field("kind", &self.kind)
            .field("lifecycle", &self.lifecycle)
            .field("run_instance", &self.run_instance)
            .finish()
    }
}

/// Error from an operator lifecycle call
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OperatorError {
    #[error("Operator `{operator}` depends on `{dependency}` which was not found. It will run without it.")]
    UnresolvedDependency { operator: String, dependency: String },
    #[error("Operator {0} still has pending work and cannot be removed yet.")]
    PendingWork(OperatorId),
    #[error("Operator {0} was not found on the holder.")]
    NotFound(OperatorId),
    #[error("The holder does not exist. It may have been removed already.")]
    HolderNotFound,
    #[error("The run instance does not exist. It may have been invalidated by an edit.")]
    RunInstanceNotFound,
}

impl Graph {
    /// Add a template or shared operator to a holder.
    pub fn add_template(
        &mut self,
        holder: impl Into<Holder>,
        mut operator: Operator,
    ) -> Result<SharedOperator, OperatorError> {
        let holder = holder.into();
        let attachments = self
            .attachments_mut(holder)
            .ok_or(OperatorError::HolderNotFound)?;
        operator.template = true;
        operator.lifecycle = Lifecycle::Template;
        tracing::debug!("add_template: \"{}\" on {holder:?}", operator.name());
        let shared = Arc::new(Mutex::new(operator));
        attachments.templates.push(shared.clone());
        Ok(shared)
    }

    /// The templates and shared operators of a holder
    pub fn templates(&self, holder: impl Into<Holder>) -> Vec<SharedOperator> {
        self.attachments(holder.into())
            .map(|a| a.templates.clone())
            .unwrap_or_default()
    }

    /// The clones bound to `run_instance` on `holder`
    pub fn operators(
        &self,
        holder: impl Into<Holder>,
        run_instance: RunInstanceKey,
    ) -> Vec<SharedOperator> {
        let holder = holder.into();
        let Some((attachments, top_level)) = self.list_for(holder, run_instance) else {
            return vec![];
        };
        attachments
            .list(top_level)
            .iter()
            .filter(|op| lock(op).run_instance == Some(run_instance))
            .cloned()
            .collect()
    }

    fn list_for(
        &self,
        holder: Holder,
        run_instance: RunInstanceKey,
    ) -> Option<(&super::Attachments, bool)> {
        let group = self.run_instances.get(run_instance)?.group;
        let top_level = self.run_groups.get(group)?.parent.is_none();
        Some((self.attachments(holder)?, top_level))
    }

    /// Clone every matching `Run` template of `holder` for `run_instance`.
    ///
    /// Clones go to the play list for top level groups and to the recall
    /// list otherwise. A template already cloned for this run instance is
    /// skipped, so calling this again is harmless. Returns the number of
    /// clones made.
    pub fn duplicate(
        &mut self,
        holder: impl Into<Holder>,
        purposes: Purpose,
        run_instance: RunInstanceKey,
    ) -> Result<usize, OperatorError> {
        let holder = holder.into();
        let group = self
            .run_instances
            .get(run_instance)
            .ok_or(OperatorError::RunInstanceNotFound)?
            .group;
        let top_level = self
            .run_groups
            .get(group)
            .ok_or(OperatorError::RunInstanceNotFound)?
            .parent
            .is_none();
        let attachments = self
            .attachments_mut(holder)
            .ok_or(OperatorError::HolderNotFound)?;
        let existing: Vec<OperatorId> = attachments
            .list(top_level)
            .iter()
            .filter_map(|op| {
                let op = lock(op);
                (op.run_instance == Some(run_instance))
                    .then_some(op.template_id)
                    .flatten()
            })
            .collect();
        let mut clones = vec![];
        for template in &attachments.templates {
            let template = lock(template);
            if template.kind != OperatorKind::Run
                || !template.purposes.intersects(purposes)
                || !template.scope.admits(top_level)
                || existing.contains(&template.id)
            {
                continue;
            }
            clones.push(Arc::new(Mutex::new(template.clone_for(
                purposes,
                run_instance,
                group,
            ))));
        }
        let count = clones.len();
        attachments.list_mut(top_level).extend(clones);
        Ok(count)
    }

    /// Hand every fresh clone bound to `run_instance` its declared peers.
    ///
    /// Peers are found by name among the clones of the same run group on the
    /// holder or its unit, and among shared operators. Missing peers are
    /// logged and returned but never stop the other operators from
    /// resolving.
    pub fn resolve_dependencies(
        &mut self,
        holder: impl Into<Holder>,
        run_instance: RunInstanceKey,
    ) -> Result<Vec<OperatorError>, OperatorError> {
        let holder = holder.into();
        if !self.contains_holder(holder) {
            return Err(OperatorError::HolderNotFound);
        }
        let group = self
            .run_instances
            .get(run_instance)
            .ok_or(OperatorError::RunInstanceNotFound)?
            .group;
        let mut unresolved = vec![];
        for operator in self.operators(holder, run_instance) {
            let (name, dependencies) = {
                let op = lock(&operator);
                if op.lifecycle != Lifecycle::Duplicated {
                    continue;
                }
                (op.name().to_string(), op.behavior.dependencies())
            };
            let mut resolved = Vec::with_capacity(dependencies.len());
            for dependency in dependencies {
                let peer = self.find_peer(holder, group, &operator, &dependency);
                if peer.is_none() {
                    tracing::warn!(
                        "operator \"{name}\" on {holder:?}: dependency \"{}\" not found",
                        dependency.name
                    );
                    unresolved.push(OperatorError::UnresolvedDependency {
                        operator: name.clone(),
                        dependency: dependency.name.clone(),
                    });
                }
                resolved.push(ResolvedDependency {
                    name: dependency.name,
                    operator: peer,
                });
            }
            lock(&operator).resolve(resolved);
        }
        Ok(unresolved)
    }

    fn find_peer(
        &self,
        holder: Holder,
        group: RunGroupKey,
        requester: &SharedOperator,
        dependency: &Dependency,
    ) -> Option<SharedOperator> {
        let search_holder = match dependency.scope {
            DependencyScope::Holder => holder,
            DependencyScope::Unit => Holder::Unit(self.unit_of(holder)?),
        };
        let attachments = self.attachments(search_holder)?;
        // Closest group first: a unit level peer may live in a parent group.
        let mut current = Some(group);
        while let Some(g) = current {
            let top_level = self.run_groups.get(g)?.parent.is_none();
            let found = attachments.list(top_level).iter().find(|candidate| {
                !Arc::ptr_eq(candidate, requester) && {
                    let c = lock(candidate);
                    c.run_group == Some(g) && c.name() == dependency.name
                }
            });
            if let Some(found) = found {
                return Some(found.clone());
            }
            current = self.run_groups.get(g).and_then(|g| g.parent);
        }
        attachments
            .templates
            .iter()
            .find(|candidate| {
                let c = lock(candidate);
                c.kind == OperatorKind::Shared && c.name() == dependency.name
            })
            .cloned()
    }

    pub(crate) fn run_context(
        &self,
        holder: Holder,
        run_instance: RunInstanceKey,
        stage: Stage,
    ) -> RunContext {
        RunContext {
            stage,
            sample_rate: self.settings().sample_rate,
            block_size: self.settings().block_size,
            holder,
            run_instance,
            sub_buffer: self
                .run_instances
                .get(run_instance)
                .and_then(|r| r.sub_buffer),
        }
    }

    /// Initialise one stage of every clone bound to `run_instance`. Stages
    /// already initialised are skipped. Returns the number initialised.
    pub fn run_init(
        &mut self,
        holder: impl Into<Holder>,
        run_instance: RunInstanceKey,
        stage: Stage,
    ) -> Result<usize, OperatorError> {
        let holder = holder.into();
        if !self.contains_holder(holder) {
            return Err(OperatorError::HolderNotFound);
        }
        if !self.run_instances.contains_key(run_instance) {
            return Err(OperatorError::RunInstanceNotFound);
        }
        let ctx = self.run_context(holder, run_instance, stage);
        Ok(self
            .operators(holder, run_instance)
            .iter()
            .filter(|op| lock(op).run_init_stage(&ctx))
            .count())
    }

    /// Run one stage of every clone bound to `run_instance` right away.
    ///
    /// [`RunPlan`](super::RunPlan) is the usual way to run; this is for
    /// driving a single holder. Returns the number of operators run.
    pub fn run(
        &mut self,
        holder: impl Into<Holder>,
        run_instance: RunInstanceKey,
        stage: Stage,
    ) -> Result<usize, OperatorError> {
        let holder = holder.into();
        if !self.contains_holder(holder) {
            return Err(OperatorError::HolderNotFound);
        }
        if !self.run_instances.contains_key(run_instance) {
            return Err(OperatorError::RunInstanceNotFound);
        }
        let ctx = self.run_context(holder, run_instance, stage);
        let done_sender = self.done_sender();
        let mut ran = 0;
        for operator in self.operators(holder, run_instance) {
            let mut op = lock(&operator);
            if op.hidden || op.lifecycle == Lifecycle::Done {
                continue;
            }
            ran += 1;
            if op.run_stage(&ctx) {
                let _ = done_sender.send(OperatorDone {
                    holder,
                    operator: op.id,
                });
            }
        }
        Ok(ran)
    }

    /// Ask every clone bound to `run_instance` to wind down. Returns the
    /// number of operators that finished right away.
    pub fn cancel(
        &mut self,
        holder: impl Into<Holder>,
        run_instance: RunInstanceKey,
    ) -> Result<usize, OperatorError> {
        let holder = holder.into();
        if !self.contains_holder(holder) {
            return Err(OperatorError::HolderNotFound);
        }
        let instance = self
            .run_instances
            .get(run_instance)
            .ok_or(OperatorError::RunInstanceNotFound)?;
        instance.state.cancel();
        Ok(self
            .operators(holder, run_instance)
            .iter()
            .filter(|op| lock(op).cancel())
            .count())
    }

    /// Detach an operator from its holder. Clones still winding down are
    /// refused with [`OperatorError::PendingWork`].
    pub fn remove(
        &mut self,
        holder: impl Into<Holder>,
        operator: OperatorId,
    ) -> Result<SharedOperator, OperatorError> {
        let holder = holder.into();
        let attachments = self
            .attachments_mut(holder)
            .ok_or(OperatorError::HolderNotFound)?;
        for list in [
            &mut attachments.play,
            &mut attachments.recall,
            &mut attachments.templates,
        ] {
            if let Some(index) = list.iter().position(|op| lock(op).id == operator) {
                if lock(&list[index]).has_pending_work() {
                    return Err(OperatorError::PendingWork(operator));
                }
                return Ok(list.remove(index));
            }
        }
        Err(OperatorError::NotFound(operator))
    }

    /// Find an operator by behavior name, looking at templates first
    pub fn find_operator(&self, holder: impl Into<Holder>, name: &str) -> Option<SharedOperator> {
        let attachments = self.attachments(holder.into())?;
        attachments
            .templates
            .iter()
            .chain(attachments.play.iter())
            .chain(attachments.recall.iter())
            .find(|op| lock(op).name() == name)
            .cloned()
    }

    /// Cancel and detach every clone bound to `run_instance`. Clones with
    /// pending work are kept until [`Graph::sweep_retired`] finds them done.
    pub(crate) fn retire_operators(&mut self, holder: Holder, run_instance: RunInstanceKey) {
        let Some(attachments) = self.attachments_mut(holder) else {
            return;
        };
        let mut retired = vec![];
        for list in [&mut attachments.play, &mut attachments.recall] {
            list.retain(|op| {
                if lock(op).run_instance == Some(run_instance) {
                    retired.push(op.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.retire(holder, retired);
    }

    /// Cancel operators leaving the graph and keep the ones with pending work
    /// running until they are done.
    pub(crate) fn retire(&mut self, holder: Holder, operators: Vec<SharedOperator>) {
        for operator in operators {
            let run_instance = {
                let mut op = lock(&operator);
                op.cancel();
                if op.lifecycle == Lifecycle::Done {
                    continue;
                }
                op.run_instance
            };
            let Some(run_instance) = run_instance else {
                continue;
            };
            self.retired.push(Retired {
                holder,
                run_instance,
                operator,
            });
        }
    }

    /// Run every stage of the retired operators still winding down. Their
    /// run instance is gone, so the context carries no sub buffer.
    pub fn run_retired(&self) {
        for stage in Stage::ALL {
            for retired in &self.retired {
                let ctx = RunContext {
                    stage,
                    sample_rate: self.settings.sample_rate,
                    block_size: self.settings.block_size,
                    holder: retired.holder,
                    run_instance: retired.run_instance,
                    sub_buffer: None,
                };
                if lock(&retired.operator).run_stage(&ctx) {
                    tracing::trace!("retired operator on {:?} wound down", retired.holder);
                }
            }
        }
    }

    /// Drop retired operators that have finished. Returns the number still
    /// winding down.
    pub fn sweep_retired(&mut self) -> usize {
        self.retired
            .retain(|retired| lock(&retired.operator).has_pending_work());
        self.retired.len()
    }
}
