//! Incremental reconciliation of running plays after a link edit.
//!
//! Every play knows the node it was started on, so the set of holders it
//! should cover can be derived from the topology at any time. After an edit
//! only plays with an instance on one of the edited wire ends can have
//! changed; for those the current instances are compared with a fresh
//! arrangement. Instances that are still wanted keep their identity and
//! stage flags.

use std::collections::HashSet;

use super::{
    Graph, Holder, NodeKey, OperatorError, RunGroupKey, RunInstanceKey, SubBufferKey, UnitKey,
};

/// What a reconciliation did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResetReport {
    /// Instances that were detached and freed
    pub invalidated: Vec<RunInstanceKey>,
    /// Instances attached for new parts of a play
    pub created: Vec<RunInstanceKey>,
    /// Dependencies that could not be resolved for the new operators
    pub unresolved: Vec<OperatorError>,
}

impl ResetReport {
    /// True if the edit did not touch any running play
    pub fn is_empty(&self) -> bool {
        self.invalidated.is_empty() && self.created.is_empty()
    }
}

impl Graph {
    /// Reconcile run instances after the wire between `output` and `input`
    /// changed. `old_output_partner` and `old_input_partner` are the nodes
    /// the two ends were linked to before the edit.
    pub(crate) fn reset_run_instances(
        &mut self,
        output: NodeKey,
        input: Option<NodeKey>,
        old_output_partner: Option<NodeKey>,
        old_input_partner: Option<NodeKey>,
    ) -> ResetReport {
        let plays = self.plays_touching(
            [Some(output), input, old_output_partner, old_input_partner]
                .into_iter()
                .flatten(),
        );
        self.reconcile_plays(plays)
    }

    /// Reconcile every play with an instance on a node of `unit`, after its
    /// pads changed.
    pub(crate) fn reset_unit(&mut self, unit: UnitKey) -> ResetReport {
        let Some(u) = self.units.get(unit) else {
            return ResetReport::default();
        };
        let nodes: Vec<NodeKey> = u.outputs.iter().chain(u.inputs.iter()).copied().collect();
        let mut plays = self.plays_touching(nodes.into_iter());
        for key in self.run_instances_of(unit) {
            if let Some(instance) = self.run_instances.get(*key) {
                let top = self.top_group(instance.group);
                if !plays.contains(&top) {
                    plays.push(top);
                }
            }
        }
        self.reconcile_plays(plays)
    }

    fn reconcile_plays(&mut self, plays: Vec<RunGroupKey>) -> ResetReport {
        let mut report = ResetReport::default();
        let mut created: Vec<(Holder, RunInstanceKey)> = vec![];
        for top in plays {
            let Some(group) = self.run_groups.get(top) else {
                continue;
            };
            let (Some(origin), purposes) = (group.origin, group.purposes) else {
                continue;
            };
            let arrangement = self.arrange(origin);
            let wanted: HashSet<(Holder, Vec<SubBufferKey>)> = arrangement
                .iter()
                .map(|p| (p.holder, p.path.iter().map(|r| r.first).collect()))
                .collect();

            let invalid: Vec<RunInstanceKey> = self
                .instances_of_play(top)
                .into_iter()
                .filter(|key| {
                    let instance = &self.run_instances[*key];
                    !wanted.contains(&(instance.holder, self.group_path(instance.group)))
                })
                .collect();
            for key in &invalid {
                self.discard_run_instance(*key);
            }
            report.invalidated.extend(invalid);
            if !self.run_groups.contains_key(top) {
                // The root went with the invalid instances
                continue;
            }
            self.refresh_play(top, origin);

            for placement in arrangement {
                let group = self.resolve_group(top, &placement.path);
                if self.find_instance_in_group(placement.holder, group).is_some() {
                    continue;
                }
                let Some(key) = self.attach_run_instance(placement.holder, group, purposes) else {
                    continue;
                };
                if let Err(e) = self.duplicate(placement.holder, purposes, key) {
                    tracing::warn!("reset: duplicate on {:?} failed: {e}", placement.holder);
                }
                created.push((placement.holder, key));
            }
        }
        report.unresolved = self.initialize_instances(&created);
        report.created = created.into_iter().map(|(_, key)| key).collect();
        if !report.is_empty() {
            tracing::debug!(
                "reset: {} invalidated, {} created",
                report.invalidated.len(),
                report.created.len()
            );
        }
        report
    }

    /// Top level groups with an instance on any of `nodes`
    fn plays_touching(&self, nodes: impl Iterator<Item = NodeKey>) -> Vec<RunGroupKey> {
        let mut plays = vec![];
        for node in nodes {
            for key in self.run_instances_of(node) {
                let Some(instance) = self.run_instances.get(*key) else {
                    continue;
                };
                let top = self.top_group(instance.group);
                if !plays.contains(&top) {
                    plays.push(top);
                }
            }
        }
        plays
    }

    /// Bring the members of a top level group and the home sub buffer of
    /// every surviving instance in line with the current ranges.
    fn refresh_play(&mut self, top: RunGroupKey, origin: NodeKey) {
        let members = self
            .nodes
            .get(origin)
            .and_then(|n| n.range)
            .map(|r| self.sub_buffer_chain(r))
            .unwrap_or_default();
        if let Some(group) = self.run_groups.get_mut(top) {
            group.members = members;
        }
        for key in self.instances_of_play(top) {
            let holder = self.run_instances[key].holder;
            if let Holder::Node(node) = holder {
                let sub_buffer = self.nodes.get(node).and_then(|n| n.range).map(|r| r.first);
                self.run_instances[key].sub_buffer = sub_buffer;
            }
        }
    }
}
