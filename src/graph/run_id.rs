//! Run identities: a [`RunGroup`] tree per running play and the
//! [`RunInstance`]s attaching that tree to holders.

use std::sync::Arc;

#[cfg(loom)]
use loom::sync::atomic::{AtomicBool, AtomicU8, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use super::{
    Graph, Holder, NodeKey, Purpose, RunGroupKey, RunInstanceKey, SubBufferKey, SubBufferRange,
};

/// The fixed per period pipeline. Every operator runs its Pre part before
/// any Inter part of the same run group, and Inter before Post.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    #[allow(missing_docs)]
    Pre,
    #[allow(missing_docs)]
    Inter,
    #[allow(missing_docs)]
    Post,
}

impl Stage {
    /// All stages in execution order
    pub const ALL: [Stage; 3] = [Stage::Pre, Stage::Inter, Stage::Post];

    pub(crate) fn bit(self) -> u8 {
        match self {
            Stage::Pre => 1,
            Stage::Inter => 1 << 1,
            Stage::Post => 1 << 2,
        }
    }
}

/// Shared, lock free part of a [`RunInstance`]. A [`RunPlan`](super::RunPlan)
/// keeps its own `Arc` so it can claim stages without the graph.
#[derive(Debug)]
pub struct RunState {
    stage_flags: AtomicU8,
    canceled: AtomicBool,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self {
            stage_flags: AtomicU8::new(0),
            canceled: AtomicBool::new(false),
        }
    }
    /// Claim `stage` for this period. Returns true for exactly one caller
    /// until the stage is cleared again.
    pub fn try_claim(&self, stage: Stage) -> bool {
        let bit = stage.bit();
        self.stage_flags.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }
    /// True if `stage` has already run this period
    pub fn is_claimed(&self, stage: Stage) -> bool {
        self.stage_flags.load(Ordering::Acquire) & stage.bit() != 0
    }
    /// Make `stage` claimable again
    pub fn clear_stage(&self, stage: Stage) {
        self.stage_flags.fetch_and(!stage.bit(), Ordering::AcqRel);
    }
    /// Make every stage claimable again; done at the start of a period
    pub fn clear(&self) {
        self.stage_flags.store(0, Ordering::Release);
    }
    #[allow(missing_docs)]
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }
    #[allow(missing_docs)]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// A scope of sub buffers. Top level groups belong to one play and know the
/// node it was started on; nested groups appear where the traversal crosses
/// a node that owns its own buffer.
#[derive(Debug)]
pub struct RunGroup {
    pub(crate) parent: Option<RunGroupKey>,
    pub(crate) members: Vec<SubBufferKey>,
    pub(crate) children: Vec<RunGroupKey>,
    pub(crate) owner: Option<RunInstanceKey>,
    pub(crate) origin: Option<NodeKey>,
    pub(crate) purposes: Purpose,
}

impl RunGroup {
    #[allow(missing_docs)]
    pub fn parent(&self) -> Option<RunGroupKey> {
        self.parent
    }
    /// The sub buffers this group spans, in chain order
    pub fn members(&self) -> &[SubBufferKey] {
        &self.members
    }
    /// Nested groups, ordered by the position of their first member
    pub fn children(&self) -> &[RunGroupKey] {
        &self.children
    }
    /// The run instance that caused this group to be created
    pub fn owner(&self) -> Option<RunInstanceKey> {
        self.owner
    }
    /// The node a top level group was started on
    pub fn origin(&self) -> Option<NodeKey> {
        self.origin
    }
    #[allow(missing_docs)]
    pub fn purposes(&self) -> Purpose {
        self.purposes
    }
    #[allow(missing_docs)]
    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }
}

/// One holder's participation in one run group.
#[derive(Debug)]
pub struct RunInstance {
    pub(crate) group: RunGroupKey,
    pub(crate) holder: Holder,
    pub(crate) sub_buffer: Option<SubBufferKey>,
    pub(crate) purposes: Purpose,
    pub(crate) state: Arc<RunState>,
}

impl RunInstance {
    #[allow(missing_docs)]
    pub fn group(&self) -> RunGroupKey {
        self.group
    }
    #[allow(missing_docs)]
    pub fn holder(&self) -> Holder {
        self.holder
    }
    /// The first sub buffer of the holder when the instance was attached
    pub fn sub_buffer(&self) -> Option<SubBufferKey> {
        self.sub_buffer
    }
    #[allow(missing_docs)]
    pub fn purposes(&self) -> Purpose {
        self.purposes
    }
    #[allow(missing_docs)]
    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }
}

impl Graph {
    pub(crate) fn create_top_group(&mut self, origin: NodeKey, purposes: Purpose) -> RunGroupKey {
        let members = self
            .nodes
            .get(origin)
            .and_then(|n| n.range)
            .map(|r| self.sub_buffer_chain(r))
            .unwrap_or_default();
        self.run_groups.insert(RunGroup {
            parent: None,
            members,
            children: vec![],
            owner: None,
            origin: Some(origin),
            purposes,
        })
    }

    /// Find the child of `group` whose first member is `sub_buffer`.
    pub fn find_child_group(
        &self,
        group: RunGroupKey,
        sub_buffer: SubBufferKey,
    ) -> Option<RunGroupKey> {
        self.run_groups.get(group)?.children.iter().copied().find(|c| {
            self.run_groups
                .get(*c)
                .is_some_and(|g| g.members.first() == Some(&sub_buffer))
        })
    }

    /// Find or create the child of `group` spanning `range`.
    pub(crate) fn child_group(&mut self, group: RunGroupKey, range: SubBufferRange) -> RunGroupKey {
        if let Some(existing) = self.find_child_group(group, range.first) {
            return existing;
        }
        let members = self.sub_buffer_chain(range);
        let (purposes, position_in_parent) = {
            let parent = &self.run_groups[group];
            (
                parent.purposes,
                parent.members.iter().position(|m| *m == range.first),
            )
        };
        let child = self.run_groups.insert(RunGroup {
            parent: Some(group),
            members,
            children: vec![],
            owner: None,
            origin: None,
            purposes,
        });
        // Keep children in member order; children outside the parent span go last.
        let parent = &self.run_groups[group];
        let member_position = |c: &RunGroupKey| {
            self.run_groups[*c]
                .members
                .first()
                .and_then(|f| parent.members.iter().position(|m| m == f))
        };
        let insert_at = match position_in_parent {
            Some(pos) => parent
                .children
                .iter()
                .position(|c| member_position(c).map_or(true, |other| other > pos))
                .unwrap_or(parent.children.len()),
            None => parent.children.len(),
        };
        self.run_groups[group].children.insert(insert_at, child);
        child
    }

    /// Walk `group` up to the top level group of its play.
    pub fn top_group(&self, group: RunGroupKey) -> RunGroupKey {
        let mut current = group;
        while let Some(parent) = self.run_groups.get(current).and_then(|g| g.parent) {
            current = parent;
        }
        current
    }

    /// The first member of every nested group from the top down to `group`.
    pub(crate) fn group_path(&self, group: RunGroupKey) -> Vec<SubBufferKey> {
        let mut path = vec![];
        let mut current = group;
        while let Some(g) = self.run_groups.get(current) {
            if g.parent.is_none() {
                break;
            }
            if let Some(first) = g.members.first() {
                path.push(*first);
            }
            current = g.parent.unwrap_or(current);
        }
        path.reverse();
        path
    }

    pub(crate) fn attach_run_instance(
        &mut self,
        holder: Holder,
        group: RunGroupKey,
        purposes: Purpose,
    ) -> Option<RunInstanceKey> {
        let sub_buffer = match holder {
            Holder::Node(key) => self.nodes.get(key)?.range.map(|r| r.first),
            Holder::Unit(_) => self.run_groups.get(group)?.members.first().copied(),
        };
        let key = self.run_instances.insert(RunInstance {
            group,
            holder,
            sub_buffer,
            purposes,
            state: Arc::new(RunState::new()),
        });
        let Some(attachments) = self.attachments_mut(holder) else {
            self.run_instances.remove(key);
            return None;
        };
        attachments.run_instances.push(key);
        let run_group = &mut self.run_groups[group];
        if run_group.owner.is_none() {
            run_group.owner = Some(key);
        }
        tracing::trace!("attach_run_instance: {key:?} on {holder:?} in {group:?}");
        Some(key)
    }

    /// The instance `holder` has in exactly `group`
    pub fn find_instance_in_group(
        &self,
        holder: impl Into<Holder>,
        group: RunGroupKey,
    ) -> Option<RunInstanceKey> {
        self.attachments(holder.into())?
            .run_instances
            .iter()
            .copied()
            .find(|k| self.run_instances.get(*k).is_some_and(|r| r.group == group))
    }

    /// The instance `holder` has in `group` or the closest ancestor of it
    pub fn find_instance_in_parent_group(
        &self,
        holder: impl Into<Holder>,
        group: RunGroupKey,
    ) -> Option<RunInstanceKey> {
        let holder = holder.into();
        let mut current = Some(group);
        while let Some(g) = current {
            if let Some(found) = self.find_instance_in_group(holder, g) {
                return Some(found);
            }
            current = self.run_groups.get(g).and_then(|g| g.parent);
        }
        None
    }

    /// Instances in the child groups of `run_instance`'s group
    pub fn child_instances(&self, run_instance: RunInstanceKey) -> Vec<RunInstanceKey> {
        let Some(group) = self.run_instances.get(run_instance).map(|r| r.group) else {
            return vec![];
        };
        self.run_instances
            .iter()
            .filter(|(_, r)| self.run_groups.get(r.group).and_then(|g| g.parent) == Some(group))
            .map(|(k, _)| k)
            .collect()
    }

    /// Every instance belonging to the play of `top`
    pub fn instances_of_play(&self, top: RunGroupKey) -> Vec<RunInstanceKey> {
        self.run_instances
            .iter()
            .filter(|(_, r)| self.top_group(r.group) == top)
            .map(|(k, _)| k)
            .collect()
    }

    /// The root instances of all plays, one per top level group.
    pub fn playbacks(&self) -> Vec<RunInstanceKey> {
        self.run_groups
            .values()
            .filter(|g| g.parent.is_none())
            .filter_map(|g| g.owner)
            .collect()
    }

    /// Detach an instance from its holder, retire its operators and free it.
    /// Nested groups left without instances are pruned.
    pub(crate) fn discard_run_instance(&mut self, key: RunInstanceKey) {
        let Some(instance) = self.run_instances.get(key) else {
            return;
        };
        let (holder, group) = (instance.holder, instance.group);
        instance.state.cancel();
        let is_root = self
            .run_groups
            .get(group)
            .is_some_and(|g| g.parent.is_none() && g.owner == Some(key));
        if is_root {
            // The root of a play is gone, so is the play.
            self.remove_play(group);
            return;
        }
        self.retire_operators(holder, key);
        if let Some(attachments) = self.attachments_mut(holder) {
            attachments.run_instances.retain(|k| *k != key);
        }
        self.run_instances.remove(key);
        if let Some(g) = self.run_groups.get_mut(group) {
            if g.owner == Some(key) {
                g.owner = None;
            }
        }
        self.prune_group(group);
    }

    fn prune_group(&mut self, group: RunGroupKey) {
        let Some(g) = self.run_groups.get(group) else {
            return;
        };
        let Some(parent) = g.parent else {
            return;
        };
        let used = !g.children.is_empty()
            || self.run_instances.values().any(|r| r.group == group);
        if used {
            return;
        }
        self.run_groups.remove(group);
        if let Some(p) = self.run_groups.get_mut(parent) {
            p.children.retain(|c| *c != group);
        }
        self.prune_group(parent);
    }

    /// Remove every instance, operator clone and group of the play `top`.
    pub(crate) fn remove_play(&mut self, top: RunGroupKey) {
        for key in self.instances_of_play(top) {
            let Some(instance) = self.run_instances.remove(key) else {
                continue;
            };
            instance.state.cancel();
            self.retire_operators(instance.holder, key);
            if let Some(attachments) = self.attachments_mut(instance.holder) {
                attachments.run_instances.retain(|k| *k != key);
            }
        }
        let mut stack = vec![top];
        while let Some(group) = stack.pop() {
            if let Some(g) = self.run_groups.remove(group) {
                stack.extend(g.children);
            }
        }
        tracing::debug!("remove_play: {top:?}");
    }
}
