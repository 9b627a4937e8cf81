//! Starting, running and canceling plays.
//!
//! A play is started on a node. From there it covers every holder towards
//! the leaves and the single path towards the root: that set is the
//! *arrangement*, computed the same way when a play starts and when an edit
//! is reconciled.
//!
//! Running happens in two steps, mirroring how the graph is edited from one
//! thread and run from another: [`StageRunner::plan`] snapshots the operators
//! of every holder in the play while the graph is borrowed, and the returned
//! [`RunPlan`] runs them without it. Within a stage, everything feeding an
//! input runs before the input, all inputs of an output run before the unit
//! and the output. Each run instance runs a stage at most once per period,
//! which is what keeps an ASYNC output from running once per input pad.

use std::collections::HashSet;
use std::sync::Arc;

use crossbeam_channel::Sender;
use rayon::prelude::*;

use super::operator::lock;
use super::{
    Graph, Holder, NodeKey, OperatorDone, OperatorError, Purpose, RunContext, RunGroupKey,
    RunInstanceKey, RunState, Side, Stage, SubBufferKey, SubBufferRange,
};
use crate::Sample;

/// Error starting or running a play
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum PlaybackError {
    #[error("The node to start playback on does not exist.")]
    NodeNotFound,
    #[error("The run instance does not exist. The play may have been removed.")]
    RunInstanceNotFound,
    #[error("The run instance is not the root of a play.")]
    NotARoot,
}

/// One holder and the nested groups it lives in, relative to the top level
/// group of a play.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Placement {
    pub(crate) holder: Holder,
    pub(crate) path: Vec<SubBufferRange>,
}

impl Graph {
    /// Every holder a play started on `origin` covers, parents before the
    /// holders they feed from.
    pub(crate) fn arrange(&self, origin: NodeKey) -> Vec<Placement> {
        let mut placements = vec![];
        let Some(node) = self.nodes.get(origin) else {
            return placements;
        };
        match node.side {
            Side::Output => {
                self.arrange_down(origin, vec![], true, &mut placements);
                self.arrange_up(node.link, &mut placements);
            }
            Side::Input => {
                placements.push(Placement {
                    holder: Holder::Node(origin),
                    path: vec![],
                });
                placements.push(Placement {
                    holder: Holder::Unit(node.unit),
                    path: vec![],
                });
                if let Some(link) = node.link {
                    self.arrange_down(link, vec![], false, &mut placements);
                }
                if let Some(output) = self.output_for(origin) {
                    placements.push(Placement {
                        holder: Holder::Node(output),
                        path: vec![],
                    });
                    self.arrange_up(self.nodes[output].link, &mut placements);
                }
            }
        }
        let mut seen = HashSet::new();
        placements.retain(|p| {
            let path: Vec<SubBufferKey> = p.path.iter().map(|r| r.first).collect();
            seen.insert((p.holder, path))
        });
        placements
    }

    fn arrange_down(
        &self,
        output: NodeKey,
        mut path: Vec<SubBufferRange>,
        is_origin: bool,
        placements: &mut Vec<Placement>,
    ) {
        let node = &self.nodes[output];
        let unit = &self.units[node.unit];
        if !is_origin && unit.owns_recycling(Side::Output) {
            path.extend(node.range);
        }
        placements.push(Placement {
            holder: Holder::Node(output),
            path: path.clone(),
        });
        placements.push(Placement {
            holder: Holder::Unit(node.unit),
            path: path.clone(),
        });
        for input in self.inputs_for(output) {
            let mut input_path = path.clone();
            if unit.owns_recycling(Side::Input) {
                input_path.extend(self.nodes[input].range);
            }
            placements.push(Placement {
                holder: Holder::Node(input),
                path: input_path.clone(),
            });
            if let Some(link) = self.nodes[input].link {
                self.arrange_down(link, input_path, false, placements);
            }
        }
    }

    fn arrange_up(&self, start: Option<NodeKey>, placements: &mut Vec<Placement>) {
        let mut next = start;
        let mut hops = 0;
        while let Some(input) = next {
            hops += 1;
            let Some(node) = self.nodes.get(input) else {
                break;
            };
            if hops > self.nodes.len() {
                debug_assert!(false, "loop in topology");
                break;
            }
            placements.push(Placement {
                holder: Holder::Node(input),
                path: vec![],
            });
            placements.push(Placement {
                holder: Holder::Unit(node.unit),
                path: vec![],
            });
            let Some(output) = self.output_for(input) else {
                break;
            };
            placements.push(Placement {
                holder: Holder::Node(output),
                path: vec![],
            });
            next = self.nodes[output].link;
        }
    }

    /// Find or create the nested group `path` leads to from `top`.
    pub(crate) fn resolve_group(
        &mut self,
        top: RunGroupKey,
        path: &[SubBufferRange],
    ) -> RunGroupKey {
        let mut group = top;
        for range in path {
            group = self.child_group(group, *range);
        }
        group
    }

    /// Resolve dependencies of fresh instances parents first, then initialise
    /// them stage by stage, leaves first.
    pub(crate) fn initialize_instances(
        &mut self,
        created: &[(Holder, RunInstanceKey)],
    ) -> Vec<OperatorError> {
        let mut unresolved = vec![];
        for (holder, key) in created {
            match self.resolve_dependencies(*holder, *key) {
                Ok(missing) => unresolved.extend(missing),
                Err(e) => tracing::warn!("resolve_dependencies on {holder:?}: {e}"),
            }
        }
        for stage in Stage::ALL {
            for (holder, key) in created.iter().rev() {
                if let Err(e) = self.run_init(*holder, *key, stage) {
                    tracing::warn!("run_init {stage:?} on {holder:?}: {e}");
                }
            }
        }
        unresolved
    }

    /// Start a play on `node`: create its top level group, attach a run
    /// instance to every holder in the arrangement, clone the operators for
    /// `purposes` and initialise them. Returns the root run instance.
    pub fn start_playback(
        &mut self,
        node: NodeKey,
        purposes: Purpose,
    ) -> Result<RunInstanceKey, PlaybackError> {
        if !self.nodes.contains_key(node) {
            return Err(PlaybackError::NodeNotFound);
        }
        let top = self.create_top_group(node, purposes);
        let mut created = vec![];
        for placement in self.arrange(node) {
            let group = self.resolve_group(top, &placement.path);
            if self.find_instance_in_group(placement.holder, group).is_some() {
                continue;
            }
            let Some(key) = self.attach_run_instance(placement.holder, group, purposes) else {
                continue;
            };
            if let Err(e) = self.duplicate(placement.holder, purposes, key) {
                tracing::warn!("start_playback: duplicate on {:?}: {e}", placement.holder);
            }
            created.push((placement.holder, key));
        }
        let root = self
            .find_instance_in_group(node, top)
            .ok_or(PlaybackError::RunInstanceNotFound)?;
        self.run_groups[top].owner = Some(root);
        self.initialize_instances(&created);
        tracing::debug!(
            "start_playback: {node:?} {purposes:?}, {} run instances",
            created.len()
        );
        Ok(root)
    }

    fn play_of_root(&self, root: RunInstanceKey) -> Result<RunGroupKey, PlaybackError> {
        let instance = self
            .run_instances
            .get(root)
            .ok_or(PlaybackError::RunInstanceNotFound)?;
        let group = self
            .run_groups
            .get(instance.group)
            .ok_or(PlaybackError::RunInstanceNotFound)?;
        if group.parent.is_some() || group.owner != Some(root) {
            return Err(PlaybackError::NotARoot);
        }
        Ok(instance.group)
    }

    /// Ask every operator of the play to wind down, in traversal order.
    /// Returns the number of operators that finished right away.
    pub fn cancel_playback(&mut self, root: RunInstanceKey) -> Result<usize, PlaybackError> {
        let top = self.play_of_root(root)?;
        let Some(origin) = self.run_groups[top].origin else {
            return Err(PlaybackError::NotARoot);
        };
        let mut finished = 0;
        let mut visited = vec![];
        for placement in self.arrange(origin) {
            let Some(group) = self.existing_group(top, &placement.path) else {
                continue;
            };
            if let Some(key) = self.find_instance_in_group(placement.holder, group) {
                visited.push(key);
                finished += self.cancel(placement.holder, key).unwrap_or(0);
            }
        }
        // Anything not reached through the topology any more
        for key in self.instances_of_play(top) {
            if !visited.contains(&key) {
                let holder = self.run_instances[key].holder;
                finished += self.cancel(holder, key).unwrap_or(0);
            }
        }
        tracing::debug!("cancel_playback: {root:?}");
        Ok(finished)
    }

    /// True once a canceled play has no operator left with pending work
    pub fn is_playback_finished(&self, root: RunInstanceKey) -> bool {
        let Ok(top) = self.play_of_root(root) else {
            return true;
        };
        self.instances_of_play(top).into_iter().all(|key| {
            let instance = &self.run_instances[key];
            instance.state.is_canceled()
                && self
                    .operators(instance.holder, key)
                    .iter()
                    .all(|op| !lock(op).has_pending_work())
        })
    }

    /// Remove a play right away with all its instances and groups
    pub fn stop_playback(&mut self, root: RunInstanceKey) -> Result<(), PlaybackError> {
        let top = self.play_of_root(root)?;
        self.remove_play(top);
        Ok(())
    }

    fn existing_group(&self, top: RunGroupKey, path: &[SubBufferRange]) -> Option<RunGroupKey> {
        let mut group = top;
        for range in path {
            group = self.find_child_group(group, range.first)?;
        }
        Some(group)
    }

    /// Snapshot and run one stage of the play rooted at `root`, outside of a
    /// period. See [`RunPlan::drive_stage`].
    pub fn run_stage(&self, root: RunInstanceKey, stage: Stage) -> Result<(), PlaybackError> {
        StageRunner::default().plan(self, root)?.drive_stage(stage);
        Ok(())
    }

    /// Snapshot and run a whole period of the play rooted at `root`
    pub fn run_period(&self, root: RunInstanceKey) -> Result<(), PlaybackError> {
        StageRunner::default().plan(self, root)?.run_period();
        Ok(())
    }
}

/// Builds [`RunPlan`]s.
#[derive(Clone, Debug, Default)]
pub struct StageRunner {
    parallel_fan_in: bool,
}

impl StageRunner {
    /// With `parallel_fan_in` the inputs of an ASYNC output run in parallel
    /// on the current rayon pool and are joined before the output runs.
    pub fn new(parallel_fan_in: bool) -> Self {
        Self { parallel_fan_in }
    }

    /// Snapshot the operators of the play rooted at `root`.
    pub fn plan(&self, graph: &Graph, root: RunInstanceKey) -> Result<RunPlan, PlaybackError> {
        let top = graph.play_of_root(root)?;
        let Holder::Node(origin) = graph.run_instances[root].holder else {
            return Err(PlaybackError::NotARoot);
        };
        let builder = PlanBuilder { graph };
        let origin_node = graph.nodes.get(origin).ok_or(PlaybackError::NodeNotFound)?;
        let down = match origin_node.side {
            Side::Output => builder
                .output_step(origin, top, true)
                .map(DownStep::Output),
            Side::Input => builder.input_step(origin, top).map(DownStep::Input),
        };
        let up = builder.up_batches(origin, top);
        Ok(RunPlan {
            root,
            down,
            up,
            env: PlanEnv {
                sample_rate: graph.settings().sample_rate,
                block_size: graph.settings().block_size,
                done: graph.done_sender(),
            },
            parallel_fan_in: self.parallel_fan_in,
        })
    }
}

struct PlanEnv {
    sample_rate: Sample,
    block_size: usize,
    done: Sender<OperatorDone>,
}

/// The operators of one run instance on one holder
struct Batch {
    holder: Holder,
    run_instance: RunInstanceKey,
    sub_buffer: Option<SubBufferKey>,
    state: Arc<RunState>,
    operators: Vec<super::SharedOperator>,
}

impl Batch {
    fn run(&self, stage: Stage, env: &PlanEnv) {
        if self.state.is_canceled() && self.is_finished() {
            return;
        }
        if !self.state.try_claim(stage) {
            return;
        }
        let ctx = RunContext {
            stage,
            sample_rate: env.sample_rate,
            block_size: env.block_size,
            holder: self.holder,
            run_instance: self.run_instance,
            sub_buffer: self.sub_buffer,
        };
        for operator in &self.operators {
            let mut op = lock(operator);
            if op.run_stage(&ctx) {
                let _ = env.done.send(OperatorDone {
                    holder: self.holder,
                    operator: op.id(),
                });
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.operators
            .iter()
            .all(|op| lock(op).lifecycle() == super::Lifecycle::Done)
    }

    fn cancel(&self, env: &PlanEnv) -> usize {
        self.state.cancel();
        let mut finished = 0;
        for operator in &self.operators {
            let mut op = lock(operator);
            if op.cancel() {
                finished += 1;
                let _ = env.done.send(OperatorDone {
                    holder: self.holder,
                    operator: op.id(),
                });
            }
        }
        finished
    }
}

struct OutputStep {
    inputs: Vec<InputStep>,
    unit: Option<Batch>,
    output: Batch,
}

impl OutputStep {
    fn run(&self, stage: Stage, env: &PlanEnv, parallel: bool) {
        if parallel && self.inputs.len() > 1 {
            self.inputs
                .par_iter()
                .for_each(|input| input.run(stage, env, parallel));
        } else {
            for input in &self.inputs {
                input.run(stage, env, parallel);
            }
        }
        if let Some(unit) = &self.unit {
            unit.run(stage, env);
        }
        self.output.run(stage, env);
    }
    fn visit<'a>(&'a self, batches: &mut Vec<&'a Batch>) {
        for input in &self.inputs {
            input.visit(batches);
        }
        batches.extend(self.unit.iter());
        batches.push(&self.output);
    }
}

struct InputStep {
    upstream: Option<Box<OutputStep>>,
    input: Batch,
}

impl InputStep {
    fn run(&self, stage: Stage, env: &PlanEnv, parallel: bool) {
        if let Some(upstream) = &self.upstream {
            upstream.run(stage, env, parallel);
        }
        self.input.run(stage, env);
    }
    fn visit<'a>(&'a self, batches: &mut Vec<&'a Batch>) {
        if let Some(upstream) = &self.upstream {
            upstream.visit(batches);
        }
        batches.push(&self.input);
    }
}

enum DownStep {
    Output(OutputStep),
    Input(InputStep),
}

struct PlanBuilder<'a> {
    graph: &'a Graph,
}

impl PlanBuilder<'_> {
    fn batch(&self, holder: Holder, group: RunGroupKey) -> Option<Batch> {
        let key = self.graph.find_instance_in_group(holder, group)?;
        let instance = &self.graph.run_instances[key];
        Some(Batch {
            holder,
            run_instance: key,
            sub_buffer: instance.sub_buffer,
            state: instance.state.clone(),
            operators: self.graph.operators(holder, key),
        })
    }

    fn output_step(
        &self,
        output: NodeKey,
        group: RunGroupKey,
        is_origin: bool,
    ) -> Option<OutputStep> {
        let node = self.graph.nodes.get(output)?;
        let unit = self.graph.units.get(node.unit)?;
        let group = if !is_origin && unit.owns_recycling(Side::Output) {
            match node.range {
                Some(range) => self.graph.find_child_group(group, range.first)?,
                None => group,
            }
        } else {
            group
        };
        let Some(output_batch) = self.batch(Holder::Node(output), group) else {
            tracing::trace!("plan: {output:?} has no run instance in {group:?}");
            return None;
        };
        let mut inputs = vec![];
        for input in self.graph.inputs_for(output) {
            let input_group = if unit.owns_recycling(Side::Input) {
                match self.graph.nodes[input].range {
                    Some(range) => match self.graph.find_child_group(group, range.first) {
                        Some(child) => child,
                        None => continue,
                    },
                    None => group,
                }
            } else {
                group
            };
            inputs.extend(self.input_step(input, input_group));
        }
        Some(OutputStep {
            inputs,
            unit: self.batch(Holder::Unit(node.unit), group),
            output: output_batch,
        })
    }

    fn input_step(&self, input: NodeKey, group: RunGroupKey) -> Option<InputStep> {
        let batch = self.batch(Holder::Node(input), group)?;
        let upstream = self
            .graph
            .nodes
            .get(input)?
            .link
            .and_then(|link| self.output_step(link, group, false))
            .map(Box::new);
        Some(InputStep {
            upstream,
            input: batch,
        })
    }

    fn up_batches(&self, origin: NodeKey, top: RunGroupKey) -> Vec<Batch> {
        let graph = self.graph;
        let mut batches = vec![];
        let origin_node = &graph.nodes[origin];
        let mut next = match origin_node.side {
            Side::Output => origin_node.link,
            Side::Input => {
                batches.extend(self.batch(Holder::Unit(origin_node.unit), top));
                let output = graph.output_for(origin);
                batches.extend(output.and_then(|o| self.batch(Holder::Node(o), top)));
                output.and_then(|o| graph.nodes[o].link)
            }
        };
        let mut hops = 0;
        while let Some(input) = next {
            hops += 1;
            if hops > graph.nodes.len() {
                break;
            }
            let Some(node) = graph.nodes.get(input) else {
                break;
            };
            batches.extend(self.batch(Holder::Node(input), top));
            batches.extend(self.batch(Holder::Unit(node.unit), top));
            let Some(output) = graph.output_for(input) else {
                break;
            };
            batches.extend(self.batch(Holder::Node(output), top));
            next = graph.nodes[output].link;
        }
        batches
    }
}

/// A snapshot of one play's operators, runnable without the [`Graph`].
///
/// Operators removed from the graph after the snapshot was taken still run
/// from here until the plan is dropped; they only stop once done.
pub struct RunPlan {
    root: RunInstanceKey,
    down: Option<DownStep>,
    up: Vec<Batch>,
    env: PlanEnv,
    parallel_fan_in: bool,
}

impl RunPlan {
    /// The root run instance of the play
    pub fn root(&self) -> RunInstanceKey {
        self.root
    }

    /// Run `stage` on every holder of the play: leaves first, then the path
    /// towards the root.
    pub fn run_stage(&self, stage: Stage) {
        match &self.down {
            Some(DownStep::Output(step)) => step.run(stage, &self.env, self.parallel_fan_in),
            Some(DownStep::Input(step)) => step.run(stage, &self.env, self.parallel_fan_in),
            None => {}
        }
        for batch in &self.up {
            batch.run(stage, &self.env);
        }
    }

    /// Run one stage on its own, as a device callback driving the stages one
    /// by one does. The claim on `stage` is cleared first so that every call
    /// runs it again, while holders shared within the play still run once.
    pub fn drive_stage(&self, stage: Stage) {
        for state in self.states() {
            state.clear_stage(stage);
        }
        self.run_stage(stage);
    }

    /// Clear the stage flags and run Pre, Inter and Post.
    pub fn run_period(&self) {
        for state in self.states() {
            state.clear();
        }
        for stage in Stage::ALL {
            self.run_stage(stage);
        }
    }

    /// Cancel every operator in the plan in traversal order and mark every
    /// run instance canceled. Returns the number of operators that finished
    /// right away.
    pub fn cancel(&self) -> usize {
        self.batches().iter().map(|b| b.cancel(&self.env)).sum()
    }

    /// True once every run instance is canceled and all operators are done
    pub fn is_finished(&self) -> bool {
        self.batches()
            .iter()
            .all(|b| b.state.is_canceled() && b.is_finished())
    }

    /// The shared state of every run instance in the plan
    pub fn states(&self) -> Vec<Arc<RunState>> {
        self.batches().iter().map(|b| b.state.clone()).collect()
    }

    /// The run instances in the plan in traversal order
    pub fn run_instances(&self) -> Vec<RunInstanceKey> {
        self.batches().iter().map(|b| b.run_instance).collect()
    }

    fn batches(&self) -> Vec<&Batch> {
        let mut batches = vec![];
        match &self.down {
            Some(DownStep::Output(step)) => step.visit(&mut batches),
            Some(DownStep::Input(step)) => step.visit(&mut batches),
            None => {}
        }
        batches.extend(self.up.iter());
        batches
    }

    /// Number of run instances in the plan
    pub fn len(&self) -> usize {
        self.batches().len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
