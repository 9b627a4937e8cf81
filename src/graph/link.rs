//! Editing the wires between units.

use super::{Graph, NodeKey, ResetReport, Side, SubBufferRange};

/// Error making or breaking a link between two nodes
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum LinkError {
    #[error("Linking the nodes would make the signal flow back into the unit it comes from.")]
    LoopInLink,
    #[error("Both nodes are on the {0:?} side. A link goes from an output to an input.")]
    SameSide(Side),
    #[error("The node does not exist. It may have been removed together with its unit.")]
    NodeNotFound,
    #[error("The unit does not exist.")]
    UnitNotFound,
}

impl Graph {
    /// Link `node` to `link`, or unlink it when `link` is `None`.
    ///
    /// Old partners on both ends are detached, ranges are updated and every
    /// run touching the edited wires is reconciled before this returns. On
    /// error nothing has changed.
    pub fn set_link(
        &mut self,
        node: NodeKey,
        link: Option<NodeKey>,
    ) -> Result<ResetReport, LinkError> {
        let current = self.nodes.get(node).ok_or(LinkError::NodeNotFound)?.link;
        if current == link {
            return Ok(ResetReport::default());
        }
        let Some(link) = link else {
            return self.unlink(node);
        };
        let node_side = self.nodes[node].side;
        let link_side = self.nodes.get(link).ok_or(LinkError::NodeNotFound)?.side;
        if node_side == link_side {
            return Err(LinkError::SameSide(node_side));
        }
        let (output, input) = match node_side {
            Side::Output => (node, link),
            Side::Input => (link, node),
        };
        if self.would_loop(output, input) {
            tracing::debug!("set_link: {output:?} -> {input:?} refused, loop");
            return Err(LinkError::LoopInLink);
        }

        let old_output_partner = self.nodes[output].link;
        let old_input_partner = self.nodes[input].link;
        if let Some(old) = old_output_partner {
            self.nodes[old].link = None;
            self.input_link_changed(old)?;
        }
        if let Some(old) = old_input_partner {
            self.nodes[old].link = None;
            self.update_private_parent(old);
        }
        self.nodes[output].link = Some(input);
        self.nodes[input].link = Some(output);
        self.input_link_changed(input)?;
        tracing::debug!("set_link: {output:?} -> {input:?}");

        Ok(self.reset_run_instances(
            output,
            Some(input),
            old_output_partner,
            old_input_partner,
        ))
    }

    /// Break the link of `node`, if any.
    pub fn unlink(&mut self, node: NodeKey) -> Result<ResetReport, LinkError> {
        let n = self.nodes.get(node).ok_or(LinkError::NodeNotFound)?;
        let Some(partner) = n.link else {
            return Ok(ResetReport::default());
        };
        let (output, input) = match n.side {
            Side::Output => (node, partner),
            Side::Input => (partner, node),
        };
        self.nodes[output].link = None;
        self.nodes[input].link = None;
        self.input_link_changed(input)?;
        tracing::debug!("unlink: {output:?} -/- {input:?}");
        Ok(self.reset_run_instances(output, None, Some(input), None))
    }

    /// The node on the other end of `node`'s wire
    pub fn link_of(&self, node: NodeKey) -> Option<NodeKey> {
        self.nodes.get(node)?.link
    }

    /// Would linking `output` to `input` make a unit feed itself?
    ///
    /// Follows the signal from `input` towards the root, one unit at a time,
    /// looking for `output`'s unit.
    pub fn would_loop(&self, output: NodeKey, input: NodeKey) -> bool {
        let Some(target) = self.nodes.get(output).map(|n| n.unit) else {
            return false;
        };
        let mut current = Some(input);
        let mut hops = 0;
        while let Some(key) = current {
            let Some(node) = self.nodes.get(key) else {
                return false;
            };
            if node.unit == target {
                return true;
            }
            hops += 1;
            if hops > self.nodes.len() {
                debug_assert!(false, "existing loop in topology");
                return true;
            }
            current = self.output_for(key).and_then(|o| self.nodes[o].link);
        }
        false
    }

    /// An input's link changed; bring its range in line.
    fn input_link_changed(&mut self, input: NodeKey) -> Result<(), LinkError> {
        let (owns, link) = {
            let n = &self.nodes[input];
            (self.units[n.unit].owns_recycling(Side::Input), n.link)
        };
        if owns {
            let parent = link.and_then(|o| self.nodes[o].range).map(|r| r.first);
            if let Some(private) = self.nodes[input].own_sub_buffer {
                self.sub_buffers[private].parent = parent;
            }
            return Ok(());
        }
        let range: Option<SubBufferRange> = link.and_then(|o| self.nodes[o].range);
        self.set_range(input, range, false, false)?;
        Ok(())
    }
}
