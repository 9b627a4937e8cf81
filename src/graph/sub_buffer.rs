use std::collections::{HashSet, VecDeque};

use super::{Graph, LinkError, NodeKey, Side, SubBufferKey, UnitKey};

/// One segment of sample storage. Segments form a doubly linked chain that
/// runs across node boundaries wherever an ASYNC unit concatenates its input
/// pads.
pub struct SubBuffer {
    pub(crate) home: NodeKey,
    pub(crate) prev: Option<SubBufferKey>,
    pub(crate) next: Option<SubBufferKey>,
    pub(crate) parent: Option<SubBufferKey>,
}

impl SubBuffer {
    pub(super) fn new(home: NodeKey) -> Self {
        Self {
            home,
            prev: None,
            next: None,
            parent: None,
        }
    }
    /// The node that introduced this sub buffer
    pub fn home(&self) -> NodeKey {
        self.home
    }
    #[allow(missing_docs)]
    pub fn prev(&self) -> Option<SubBufferKey> {
        self.prev
    }
    #[allow(missing_docs)]
    pub fn next(&self) -> Option<SubBufferKey> {
        self.next
    }
    /// For a private input buffer: the first buffer of the linked output
    pub fn parent(&self) -> Option<SubBufferKey> {
        self.parent
    }
}

/// An inclusive `first..=last` span of the sub buffer chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubBufferRange {
    #[allow(missing_docs)]
    pub first: SubBufferKey,
    #[allow(missing_docs)]
    pub last: SubBufferKey,
}

impl SubBufferRange {
    /// A range of exactly one sub buffer
    pub fn single(key: SubBufferKey) -> Self {
        Self {
            first: key,
            last: key,
        }
    }
}

/// Emitted for every node whose range changed during one
/// [`Graph::set_range`] call.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeChange {
    #[allow(missing_docs)]
    pub node: NodeKey,
    /// Range stored on the node before the change
    pub old: Option<SubBufferRange>,
    /// Range stored on the node after the change
    pub new: Option<SubBufferRange>,
    /// The buffer found before the edited range when splicing
    pub splice_prev: Option<SubBufferKey>,
    /// The buffer found after the edited range when splicing
    pub splice_next: Option<SubBufferKey>,
}

impl Graph {
    /// Replace the range of `node` and everything that shares or derives
    /// from it.
    ///
    /// Pass-through nodes towards the leaves that held exactly the old range
    /// get the new one. Ranges towards the root are derived again until a
    /// node that owns its own buffer. The chain is spliced at the position
    /// found by searching sibling pads, climbing units while their outputs
    /// derive from their inputs.
    ///
    /// Returns `Ok(false)` when nothing changed.
    pub fn set_range(
        &mut self,
        node: NodeKey,
        range: Option<SubBufferRange>,
        force_update: bool,
        destroy_old: bool,
    ) -> Result<bool, LinkError> {
        let old = self.nodes.get(node).ok_or(LinkError::NodeNotFound)?.range;
        if !force_update && old == range {
            return Ok(false);
        }
        debug_assert!(
            range.map_or(true, |r| self.is_well_formed(r)),
            "set_range given a broken chain"
        );
        let old_chain = match (destroy_old, old) {
            (true, Some(old)) => self.sub_buffer_chain(old),
            _ => vec![],
        };
        let splice_prev = self.find_prev_sub_buffer(node);
        let splice_next = self.find_next_sub_buffer(node);

        if let Some(old) = old {
            if let Some(first) = self.sub_buffers.get_mut(old.first) {
                first.prev = None;
            }
            if let Some(last) = self.sub_buffers.get_mut(old.last) {
                last.next = None;
            }
        }
        match range {
            Some(new) => {
                if let Some(first) = self.sub_buffers.get_mut(new.first) {
                    first.prev = splice_prev;
                }
                if let Some(last) = self.sub_buffers.get_mut(new.last) {
                    last.next = splice_next;
                }
                if let Some(prev) = splice_prev.and_then(|k| self.sub_buffers.get_mut(k)) {
                    prev.next = Some(new.first);
                }
                if let Some(next) = splice_next.and_then(|k| self.sub_buffers.get_mut(k)) {
                    next.prev = Some(new.last);
                }
            }
            None => {
                if let Some(prev) = splice_prev.and_then(|k| self.sub_buffers.get_mut(k)) {
                    prev.next = splice_next;
                }
                if let Some(next) = splice_next.and_then(|k| self.sub_buffers.get_mut(k)) {
                    next.prev = splice_prev;
                }
            }
        }

        let mut changed = vec![(node, old, range)];
        self.nodes[node].range = range;
        if self.nodes[node].own_sub_buffer.is_none() {
            for source in self.pass_through_sources(node, old) {
                self.nodes[source].range = range;
                changed.push((source, old, range));
            }
        }
        changed.extend(self.propagate_root_ward(node));

        for (key, old, new) in changed {
            tracing::trace!("set_range: {key:?} {old:?} -> {new:?}");
            self.range_changes.push(RangeChange {
                node: key,
                old,
                new,
                splice_prev,
                splice_next,
            });
        }
        if destroy_old {
            self.release_unreachable(&old_chain);
        }
        Ok(true)
    }

    /// The range `node` should have given the ranges of its sources.
    pub(crate) fn derived_range(&self, node: NodeKey) -> Option<SubBufferRange> {
        let n = self.nodes.get(node)?;
        let unit = self.units.get(n.unit)?;
        if unit.owns_recycling(n.side) {
            return n.own_sub_buffer.map(SubBufferRange::single);
        }
        match n.side {
            Side::Input => n.link.and_then(|link| self.nodes.get(link)?.range),
            Side::Output if unit.is_async() => {
                let ranges: Vec<_> = self
                    .inputs_for(node)
                    .into_iter()
                    .filter_map(|i| self.nodes[i].range)
                    .collect();
                match (ranges.first(), ranges.last()) {
                    (Some(first), Some(last)) => Some(SubBufferRange {
                        first: first.first,
                        last: last.last,
                    }),
                    _ => None,
                }
            }
            Side::Output => unit
                .inputs
                .get(n.line)
                .and_then(|i| self.nodes.get(*i)?.range),
        }
    }

    /// The node whose range is derived directly from `node`.
    fn dependent(&self, node: NodeKey) -> Option<NodeKey> {
        let n = self.nodes.get(node)?;
        match n.side {
            Side::Input => {
                if self.units.get(n.unit)?.owns_recycling(Side::Output) {
                    return None;
                }
                self.output_for(node)
            }
            Side::Output => {
                let link = n.link?;
                let link_unit = self.units.get(self.nodes.get(link)?.unit)?;
                (!link_unit.owns_recycling(Side::Input)).then_some(link)
            }
        }
    }

    fn propagate_root_ward(
        &mut self,
        start: NodeKey,
    ) -> Vec<(NodeKey, Option<SubBufferRange>, Option<SubBufferRange>)> {
        let mut changes = vec![];
        self.update_private_parent(start);
        let mut queue: VecDeque<NodeKey> = self.dependent(start).into_iter().collect();
        while let Some(key) = queue.pop_front() {
            let derived = self.derived_range(key);
            let old = self.nodes[key].range;
            if derived != old {
                self.nodes[key].range = derived;
                changes.push((key, old, derived));
                self.update_private_parent(key);
                queue.extend(self.dependent(key));
            }
        }
        changes
    }

    /// Keep the parent pointer of a private input buffer on the other end of
    /// `output`'s link in step with the output's range.
    pub(crate) fn update_private_parent(&mut self, output: NodeKey) {
        let Some(n) = self.nodes.get(output) else {
            return;
        };
        if n.side != Side::Output {
            return;
        }
        let parent = n.range.map(|r| r.first);
        let Some(link) = n.link else {
            return;
        };
        if let Some(private) = self.nodes.get(link).and_then(|l| l.own_sub_buffer) {
            if let Some(sub_buffer) = self.sub_buffers.get_mut(private) {
                sub_buffer.parent = parent;
            }
        }
    }

    /// Walk towards the leaves through nodes that are plain pass-throughs
    /// of `old`.
    fn pass_through_sources(
        &self,
        node: NodeKey,
        old: Option<SubBufferRange>,
    ) -> Vec<NodeKey> {
        let mut sources = vec![];
        let Some(old) = old else {
            return sources;
        };
        let mut current = node;
        loop {
            let n = &self.nodes[current];
            let unit = &self.units[n.unit];
            if unit.owns_recycling(n.side) {
                break;
            }
            let next = match n.side {
                Side::Input => n.link,
                Side::Output => {
                    let mut holding = self
                        .inputs_for(current)
                        .into_iter()
                        .filter(|i| self.nodes[*i].range == Some(old));
                    match (holding.next(), holding.next()) {
                        (Some(only), None) => Some(only),
                        _ => None,
                    }
                }
            };
            match next {
                Some(source)
                    if self.nodes[source].range == Some(old)
                        && self.nodes[source].own_sub_buffer.is_none()
                        && !sources.contains(&source) =>
                {
                    sources.push(source);
                    current = source;
                }
                _ => break,
            }
        }
        sources
    }

    /// The last buffer before `node`'s position in its enclosing chain.
    pub(crate) fn find_prev_sub_buffer(&self, node: NodeKey) -> Option<SubBufferKey> {
        self.find_neighbor(node, |n| n.prev_pad, |r| r.last)
    }

    /// The first buffer after `node`'s position in its enclosing chain.
    pub(crate) fn find_next_sub_buffer(&self, node: NodeKey) -> Option<SubBufferKey> {
        self.find_neighbor(node, |n| n.next_pad, |r| r.first)
    }

    fn find_neighbor(
        &self,
        node: NodeKey,
        step: impl Fn(&super::Node) -> Option<NodeKey>,
        end: impl Fn(SubBufferRange) -> SubBufferKey,
    ) -> Option<SubBufferKey> {
        let mut current = node;
        // One hop per unit boundary; more hops than nodes means a loop.
        for _ in 0..=self.nodes.len() {
            let n = self.nodes.get(current)?;
            let unit = self.units.get(n.unit)?;
            match n.side {
                Side::Input => {
                    if unit.owns_recycling(Side::Output) {
                        return None;
                    }
                    if unit.is_async() {
                        let mut sibling = step(n);
                        while let Some(key) = sibling {
                            let sibling_node = self.nodes.get(key)?;
                            if let Some(range) = sibling_node.range {
                                return Some(end(range));
                            }
                            sibling = step(sibling_node);
                        }
                    }
                    current = self.output_for(current)?;
                }
                Side::Output => {
                    let link = n.link?;
                    if self
                        .units
                        .get(self.nodes.get(link)?.unit)?
                        .owns_recycling(Side::Input)
                    {
                        return None;
                    }
                    current = link;
                }
            }
        }
        debug_assert!(false, "loop in topology while searching sub buffers");
        None
    }

    /// The sub buffers of `range` in chain order.
    pub fn sub_buffer_chain(&self, range: SubBufferRange) -> Vec<SubBufferKey> {
        let mut chain = vec![range.first];
        let mut current = range.first;
        while current != range.last {
            match self.sub_buffers.get(current).and_then(|s| s.next) {
                Some(next) if chain.len() <= self.sub_buffers.len() => {
                    chain.push(next);
                    current = next;
                }
                _ => break,
            }
        }
        chain
    }

    /// Number of sub buffers in `range`
    pub fn range_len(&self, range: SubBufferRange) -> usize {
        self.sub_buffer_chain(range).len()
    }

    /// Index of `sub_buffer` within `range`
    pub fn position(&self, range: SubBufferRange, sub_buffer: SubBufferKey) -> Option<usize> {
        self.sub_buffer_chain(range)
            .iter()
            .position(|k| *k == sub_buffer)
    }

    /// True if walking `next` from `first` reaches `last` without a cycle and
    /// every `prev` agrees with the walk.
    pub fn is_well_formed(&self, range: SubBufferRange) -> bool {
        let mut seen = HashSet::new();
        let mut current = range.first;
        loop {
            if !seen.insert(current) {
                return false;
            }
            if current == range.last {
                return true;
            }
            let Some(next) = self.sub_buffers.get(current).and_then(|s| s.next) else {
                return false;
            };
            if self.sub_buffers.get(next).and_then(|s| s.prev) != Some(current) {
                return false;
            }
            current = next;
        }
    }

    /// The first node on `side` of `unit` that has a range
    pub fn first_with_recycling(&self, unit: UnitKey, side: Side) -> Option<NodeKey> {
        let unit = self.units.get(unit)?;
        unit.nodes(side)
            .iter()
            .copied()
            .find(|n| self.nodes[*n].range.is_some())
    }

    /// The last node on `side` of `unit` that has a range
    pub fn last_with_recycling(&self, unit: UnitKey, side: Side) -> Option<NodeKey> {
        let unit = self.units.get(unit)?;
        unit.nodes(side)
            .iter()
            .rev()
            .copied()
            .find(|n| self.nodes[*n].range.is_some())
    }

    fn release_unreachable(&mut self, candidates: &[SubBufferKey]) {
        let mut referenced = HashSet::new();
        for node in self.nodes.values() {
            if let Some(range) = node.range {
                referenced.extend(self.sub_buffer_chain(range));
            }
        }
        for key in candidates {
            let Some(sub_buffer) = self.sub_buffers.get(*key) else {
                continue;
            };
            let owned = self
                .nodes
                .get(sub_buffer.home)
                .is_some_and(|n| n.own_sub_buffer == Some(*key));
            if !owned && !referenced.contains(key) {
                self.sub_buffers.remove(*key);
                tracing::trace!("released sub buffer {key:?}");
            }
        }
    }
}
