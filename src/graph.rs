//! [`Graph`] is the arena at the core of runtree. It holds the static
//! topology ([`Unit`]s, their Output and Input [`Node`]s and the
//! [`SubBuffer`] chain running through them) together with the dynamic run
//! identities ([`RunGroup`]s and [`RunInstance`]s) that operators are cloned
//! for.
//!
//! ```
//! # use runtree::prelude::*;
//! let mut graph = Graph::new(GraphSettings::default());
//! let synth = graph.add_unit(
//!     UnitSettings::default()
//!         .name("synth")
//!         .flags(UnitFlags::OWNS_OUTPUT_RECYCLING),
//! );
//! let mixer = graph.add_unit(
//!     UnitSettings::default()
//!         .name("mixer")
//!         .flags(UnitFlags::ASYNC)
//!         .input_pads(2),
//! );
//! let synth_out = graph.unit(synth).unwrap().outputs()[0];
//! let mixer_in = graph.unit(mixer).unwrap().inputs()[1];
//! graph.set_link(synth_out, Some(mixer_in))?;
//! // Start a run at the top of the tree; every holder below gets a RunInstance.
//! let mixer_out = graph.unit(mixer).unwrap().outputs()[0];
//! let root = graph.start_playback(mixer_out, Purpose::PLAYBACK)?;
//! graph.run_period(root)?;
//! # Ok::<(), runtree::EngineError>(())
//! ```
//!
//! Every cross reference is a typed slotmap key, `None` standing in for a
//! missing partner. The graph is edited through `&mut Graph`, so an edit and
//! the reconciliation it triggers form one transaction.

pub mod link;
mod node;
pub mod operator;
pub mod reset;
pub mod run_id;
pub mod stage_runner;
mod sub_buffer;
#[cfg(test)]
mod tests;
mod unit;

pub use link::LinkError;
pub use node::{Node, Side};
pub use operator::{
    Behavior, Dependency, DependencyScope, Lifecycle, Operator, OperatorDone, OperatorError,
    OperatorId, OperatorKind, OperatorScope, OperatorStatus, Purpose, ResolvedDependency,
    RunContext, SharedOperator,
};
pub use reset::ResetReport;
pub use run_id::{RunGroup, RunInstance, RunState, Stage};
pub use stage_runner::{PlaybackError, RunPlan, StageRunner};
pub use sub_buffer::{RangeChange, SubBuffer, SubBufferRange};
pub use unit::{Unit, UnitFlags, UnitSettings};

use crate::Sample;
use crossbeam_channel::{unbounded, Receiver, Sender};
use slotmap::{new_key_type, SlotMap};
use std::sync::atomic::{AtomicU64, Ordering};

new_key_type! {
    /// Key to a [`Unit`] in a [`Graph`]
    pub struct UnitKey;
    /// Key to an Output or Input [`Node`] in a [`Graph`]
    pub struct NodeKey;
    /// Key to a [`SubBuffer`] in a [`Graph`]
    pub struct SubBufferKey;
    /// Key to a [`RunGroup`] in a [`Graph`]
    pub struct RunGroupKey;
    /// Key to a [`RunInstance`] in a [`Graph`]
    pub struct RunInstanceKey;
}

/// Unique id identifying a [`Graph`]. Is set from an atomic any time a [`Graph`] is created.
pub type GraphId = u64;

/// Get a unique id for a Graph from this by using `fetch_add`
static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(0);

/// Anything operators and run instances can be attached to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Holder {
    #[allow(missing_docs)]
    Node(NodeKey),
    #[allow(missing_docs)]
    Unit(UnitKey),
}

impl From<NodeKey> for Holder {
    fn from(key: NodeKey) -> Self {
        Holder::Node(key)
    }
}
impl From<UnitKey> for Holder {
    fn from(key: UnitKey) -> Self {
        Holder::Unit(key)
    }
}

/// Operator lists and run instances carried by every [`Holder`].
#[derive(Default)]
pub(crate) struct Attachments {
    /// Templates and `Shared` operators. Never run.
    pub(crate) templates: Vec<SharedOperator>,
    /// Clones bound to a top level [`RunGroup`]
    pub(crate) play: Vec<SharedOperator>,
    /// Clones bound to a nested [`RunGroup`]
    pub(crate) recall: Vec<SharedOperator>,
    pub(crate) run_instances: Vec<RunInstanceKey>,
}

impl Attachments {
    pub(crate) fn list(&self, top_level: bool) -> &Vec<SharedOperator> {
        if top_level {
            &self.play
        } else {
            &self.recall
        }
    }
    pub(crate) fn list_mut(&mut self, top_level: bool) -> &mut Vec<SharedOperator> {
        if top_level {
            &mut self.play
        } else {
            &mut self.recall
        }
    }
}

/// Settings for a [`Graph`]
#[derive(Clone, Debug)]
pub struct GraphSettings {
    /// The name of the Graph
    pub name: String,
    /// The sample rate passed on to operators through [`RunContext`]
    pub sample_rate: Sample,
    /// The number of frames processed per period
    pub block_size: usize,
}

impl GraphSettings {
    /// Set the name to a new value
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
    /// Set the sample rate to a new value
    pub fn sample_rate(mut self, sample_rate: Sample) -> Self {
        self.sample_rate = sample_rate;
        self
    }
    /// Set the block size to a new value
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }
}

impl Default for GraphSettings {
    fn default() -> Self {
        GraphSettings {
            name: String::new(),
            sample_rate: 48000.0,
            block_size: 64,
        }
    }
}

/// The arena holding topology and run state.
///
/// Units own their Nodes; Nodes own the SubBuffers they introduce when their
/// Unit declares recycling ownership for that side. RunGroups form a tree per
/// running play and RunInstances attach that tree to individual holders.
pub struct Graph {
    id: GraphId,
    settings: GraphSettings,
    pub(crate) units: SlotMap<UnitKey, Unit>,
    pub(crate) nodes: SlotMap<NodeKey, Node>,
    pub(crate) sub_buffers: SlotMap<SubBufferKey, SubBuffer>,
    pub(crate) run_groups: SlotMap<RunGroupKey, RunGroup>,
    pub(crate) run_instances: SlotMap<RunInstanceKey, RunInstance>,
    /// Notifications from [`Graph::set_range`] not yet taken by anyone
    pub(crate) range_changes: Vec<RangeChange>,
    /// Operators detached from the graph that may still have pending work
    pub(crate) retired: Vec<operator::Retired>,
    done_sender: Sender<OperatorDone>,
    done_receiver: Receiver<OperatorDone>,
}

impl Graph {
    /// Create a new empty [`Graph`]
    pub fn new(settings: GraphSettings) -> Self {
        let (done_sender, done_receiver) = unbounded();
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            settings,
            units: SlotMap::with_key(),
            nodes: SlotMap::with_key(),
            sub_buffers: SlotMap::with_key(),
            run_groups: SlotMap::with_key(),
            run_instances: SlotMap::with_key(),
            range_changes: vec![],
            retired: vec![],
            done_sender,
            done_receiver,
        }
    }
    /// Return the unique id of this graph
    pub fn id(&self) -> GraphId {
        self.id
    }
    /// Return a copy of the [`GraphSettings`]
    pub fn settings(&self) -> &GraphSettings {
        &self.settings
    }

    /// Get a [`Unit`] if it exists
    pub fn unit(&self, key: UnitKey) -> Option<&Unit> {
        self.units.get(key)
    }
    /// Get a [`Node`] if it exists
    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(key)
    }
    /// Get a [`SubBuffer`] if it exists
    pub fn sub_buffer(&self, key: SubBufferKey) -> Option<&SubBuffer> {
        self.sub_buffers.get(key)
    }
    /// Get a [`RunGroup`] if it exists
    pub fn run_group(&self, key: RunGroupKey) -> Option<&RunGroup> {
        self.run_groups.get(key)
    }
    /// Get a [`RunInstance`] if it exists
    pub fn run_instance(&self, key: RunInstanceKey) -> Option<&RunInstance> {
        self.run_instances.get(key)
    }
    /// Iterate over all units
    pub fn units(&self) -> impl Iterator<Item = (UnitKey, &Unit)> {
        self.units.iter()
    }
    /// The number of units in the graph
    pub fn num_units(&self) -> usize {
        self.units.len()
    }
    /// The number of nodes in the graph
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }
    /// The number of live sub buffers in the graph
    pub fn num_sub_buffers(&self) -> usize {
        self.sub_buffers.len()
    }
    /// The number of live run groups in the graph
    pub fn num_run_groups(&self) -> usize {
        self.run_groups.len()
    }
    /// The number of live run instances in the graph
    pub fn num_run_instances(&self) -> usize {
        self.run_instances.len()
    }
    /// Return true if the holder still exists
    pub fn contains_holder(&self, holder: Holder) -> bool {
        match holder {
            Holder::Node(key) => self.nodes.contains_key(key),
            Holder::Unit(key) => self.units.contains_key(key),
        }
    }
    /// The run instances attached to a holder, in attachment order
    pub fn run_instances_of(&self, holder: impl Into<Holder>) -> &[RunInstanceKey] {
        self.attachments(holder.into())
            .map_or(&[], |a| a.run_instances.as_slice())
    }
    /// Take all [`RangeChange`] notifications emitted since the last call
    pub fn take_range_changes(&mut self) -> Vec<RangeChange> {
        std::mem::take(&mut self.range_changes)
    }

    /// The sender handed to every [`RunPlan`] for reporting finished operators
    pub(crate) fn done_sender(&self) -> Sender<OperatorDone> {
        self.done_sender.clone()
    }
    /// Drain the operators that reported themselves done while running
    pub fn take_done_operators(&mut self) -> Vec<OperatorDone> {
        self.done_receiver.try_iter().collect()
    }

    pub(crate) fn attachments(&self, holder: Holder) -> Option<&Attachments> {
        match holder {
            Holder::Node(key) => self.nodes.get(key).map(|n| &n.attachments),
            Holder::Unit(key) => self.units.get(key).map(|u| &u.attachments),
        }
    }
    pub(crate) fn attachments_mut(&mut self, holder: Holder) -> Option<&mut Attachments> {
        match holder {
            Holder::Node(key) => self.nodes.get_mut(key).map(|n| &mut n.attachments),
            Holder::Unit(key) => self.units.get_mut(key).map(|u| &mut u.attachments),
        }
    }

    /// The unit owning the holder. For a unit that is the unit itself.
    pub(crate) fn unit_of(&self, holder: Holder) -> Option<UnitKey> {
        match holder {
            Holder::Node(key) => self.nodes.get(key).map(|n| n.unit),
            Holder::Unit(key) => Some(key),
        }
    }

    /// The output a signal entering through `input` leaves its unit by.
    ///
    /// ASYNC units sum every pad of an audio channel into the output of that
    /// channel; SYNC units map input line to output line.
    pub fn output_for(&self, input: NodeKey) -> Option<NodeKey> {
        let node = self.nodes.get(input)?;
        if node.side != Side::Input {
            return None;
        }
        let unit = self.units.get(node.unit)?;
        if unit.is_async() {
            unit.outputs.get(node.audio_channel).copied()
        } else {
            unit.outputs.get(node.line).copied()
        }
    }

    /// The inputs feeding `output`, in pad order.
    pub fn inputs_for(&self, output: NodeKey) -> Vec<NodeKey> {
        let Some(node) = self.nodes.get(output) else {
            return vec![];
        };
        if node.side != Side::Output {
            return vec![];
        }
        let Some(unit) = self.units.get(node.unit) else {
            return vec![];
        };
        if unit.is_async() {
            if node.pad != 0 {
                return vec![];
            }
            unit.inputs
                .iter()
                .copied()
                .filter(|i| self.nodes[*i].audio_channel == node.audio_channel)
                .collect()
        } else {
            unit.inputs.get(node.line).copied().into_iter().collect()
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(GraphSettings::default())
    }
}
