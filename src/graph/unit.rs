use super::{Attachments, Graph, LinkError, Node, NodeKey, Side, SubBuffer, SubBufferRange, UnitKey};

bitflags::bitflags! {
    /// How a [`Unit`] composes its lines and which sides introduce their own
    /// sub buffers. SYNC is the absence of `ASYNC`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    #[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
    pub struct UnitFlags: u8 {
        /// Every input pad of an audio channel is summed into one output
        const ASYNC = 1;
        /// Each input node introduces a private sub buffer
        const OWNS_INPUT_RECYCLING = 1 << 1;
        /// Each output node introduces a private sub buffer
        const OWNS_OUTPUT_RECYCLING = 1 << 2;
    }
}

/// A processing unit: a grid of Output nodes and a grid of Input nodes, each
/// `pads * audio_channels` large and ordered by line.
pub struct Unit {
    pub(crate) name: String,
    pub(crate) flags: UnitFlags,
    pub(crate) audio_channels: usize,
    pub(crate) outputs: Vec<NodeKey>,
    pub(crate) inputs: Vec<NodeKey>,
    pub(crate) attachments: Attachments,
}

impl Unit {
    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.name
    }
    #[allow(missing_docs)]
    pub fn flags(&self) -> UnitFlags {
        self.flags
    }
    /// True if the unit sums its input pads per audio channel
    pub fn is_async(&self) -> bool {
        self.flags.contains(UnitFlags::ASYNC)
    }
    /// True if nodes on `side` introduce their own sub buffers
    pub fn owns_recycling(&self, side: Side) -> bool {
        match side {
            Side::Output => self.flags.contains(UnitFlags::OWNS_OUTPUT_RECYCLING),
            Side::Input => self.flags.contains(UnitFlags::OWNS_INPUT_RECYCLING),
        }
    }
    #[allow(missing_docs)]
    pub fn audio_channels(&self) -> usize {
        self.audio_channels
    }
    /// Number of pads on `side`
    pub fn pads(&self, side: Side) -> usize {
        if self.audio_channels == 0 {
            return 0;
        }
        self.nodes(side).len() / self.audio_channels
    }
    /// Output nodes ordered by line
    pub fn outputs(&self) -> &[NodeKey] {
        &self.outputs
    }
    /// Input nodes ordered by line
    pub fn inputs(&self) -> &[NodeKey] {
        &self.inputs
    }
    /// The nodes on one side, ordered by line
    pub fn nodes(&self, side: Side) -> &[NodeKey] {
        match side {
            Side::Output => &self.outputs,
            Side::Input => &self.inputs,
        }
    }
    /// The first node on `side`
    pub fn first(&self, side: Side) -> Option<NodeKey> {
        self.nodes(side).first().copied()
    }
    /// The last node on `side`
    pub fn last(&self, side: Side) -> Option<NodeKey> {
        self.nodes(side).last().copied()
    }
    /// The node at `line` on `side`
    pub fn nth(&self, side: Side, line: usize) -> Option<NodeKey> {
        self.nodes(side).get(line).copied()
    }
    /// The node at the first audio channel of `pad`
    pub fn pad_nth(&self, side: Side, pad: usize) -> Option<NodeKey> {
        self.nth(side, pad * self.audio_channels)
    }
    #[allow(missing_docs)]
    pub fn pad_first(&self, side: Side) -> Option<NodeKey> {
        self.pad_nth(side, 0)
    }
    /// The node at the first audio channel of the last pad
    pub fn pad_last(&self, side: Side) -> Option<NodeKey> {
        self.pads(side)
            .checked_sub(1)
            .and_then(|pad| self.pad_nth(side, pad))
    }
    fn nodes_mut(&mut self, side: Side) -> &mut Vec<NodeKey> {
        match side {
            Side::Output => &mut self.outputs,
            Side::Input => &mut self.inputs,
        }
    }
}

/// Settings for [`Graph::add_unit`]
#[derive(Clone, Debug)]
pub struct UnitSettings {
    /// Display name of the unit
    pub name: String,
    #[allow(missing_docs)]
    pub flags: UnitFlags,
    #[allow(missing_docs)]
    pub output_pads: usize,
    #[allow(missing_docs)]
    pub input_pads: usize,
    #[allow(missing_docs)]
    pub audio_channels: usize,
}

impl UnitSettings {
    /// Set the name to a new value
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
    /// Set the flags to a new value
    pub fn flags(mut self, flags: UnitFlags) -> Self {
        self.flags = flags;
        self
    }
    /// Set the number of output pads
    pub fn output_pads(mut self, pads: usize) -> Self {
        self.output_pads = pads;
        self
    }
    /// Set the number of input pads
    pub fn input_pads(mut self, pads: usize) -> Self {
        self.input_pads = pads;
        self
    }
    /// Set the number of audio channels
    pub fn audio_channels(mut self, audio_channels: usize) -> Self {
        self.audio_channels = audio_channels;
        self
    }
}

impl Default for UnitSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            flags: UnitFlags::empty(),
            output_pads: 1,
            input_pads: 1,
            audio_channels: 1,
        }
    }
}

impl Graph {
    /// Add a new unit with its nodes. Nodes on a side the unit owns
    /// recycling for get a private [`SubBuffer`] each.
    pub fn add_unit(&mut self, settings: UnitSettings) -> UnitKey {
        let unit_key = self.units.insert(Unit {
            name: settings.name,
            flags: settings.flags,
            audio_channels: settings.audio_channels,
            outputs: vec![],
            inputs: vec![],
            attachments: Attachments::default(),
        });
        for (side, pads) in [
            (Side::Input, settings.input_pads),
            (Side::Output, settings.output_pads),
        ] {
            // Only fails for missing nodes, and these were just inserted
            let grown = self.grow_side(unit_key, side, pads);
            debug_assert!(grown.is_ok(), "add_unit: {grown:?}");
            if let Err(e) = grown {
                tracing::error!("add_unit: growing {side:?} pads failed: {e}");
            }
        }
        tracing::debug!(
            "add_unit: {:?} {} in pads, {} out pads, {} channels",
            unit_key,
            settings.input_pads,
            settings.output_pads,
            settings.audio_channels
        );
        unit_key
    }

    /// Change the number of pads on one side of a unit.
    ///
    /// Removed nodes are unlinked first, which reconciles every run touching
    /// them, and their private sub buffers are released.
    pub fn set_pad_count(
        &mut self,
        unit: UnitKey,
        side: Side,
        pads: usize,
    ) -> Result<(), LinkError> {
        let current = self
            .units
            .get(unit)
            .ok_or(LinkError::UnitNotFound)?
            .pads(side);
        if pads > current {
            self.grow_side(unit, side, pads - current)?;
            self.reset_unit(unit);
        } else if pads < current {
            let audio_channels = self.units[unit].audio_channels;
            let removed: Vec<NodeKey> =
                self.units[unit].nodes(side)[pads * audio_channels..].to_vec();
            for node in &removed {
                self.set_link(*node, None)?;
            }
            for node in &removed {
                // Take private buffers out of the chain while the unit still lists the node
                if self.nodes[*node].own_sub_buffer.is_some() {
                    self.set_range(*node, None, false, false)?;
                }
            }
            self.units[unit].nodes_mut(side).truncate(pads * audio_channels);
            for node in removed {
                self.release_node(node);
            }
            self.relink_navigation(unit, side);
            self.reset_unit(unit);
        }
        Ok(())
    }

    /// Unlink every node of a unit and remove it with all its run state.
    pub fn remove_unit(&mut self, unit: UnitKey) -> Result<(), LinkError> {
        self.set_pad_count(unit, Side::Output, 0)?;
        self.set_pad_count(unit, Side::Input, 0)?;
        let keys: Vec<_> = self
            .units
            .get(unit)
            .map(|u| u.attachments.run_instances.clone())
            .unwrap_or_default();
        for key in keys {
            self.discard_run_instance(key);
        }
        if let Some(removed) = self.units.remove(unit) {
            let mut operators = removed.attachments.play;
            operators.extend(removed.attachments.recall);
            self.retire(unit.into(), operators);
            tracing::debug!("remove_unit: {:?} \"{}\"", unit, removed.name);
        }
        Ok(())
    }

    fn grow_side(
        &mut self,
        unit_key: UnitKey,
        side: Side,
        extra_pads: usize,
    ) -> Result<(), LinkError> {
        let (audio_channels, owns) = {
            let unit = &self.units[unit_key];
            (unit.audio_channels, unit.owns_recycling(side))
        };
        let first_pad = self.units[unit_key].pads(side);
        let mut created = vec![];
        for pad in first_pad..first_pad + extra_pads {
            for audio_channel in 0..audio_channels {
                let node = Node::new(unit_key, side, pad, audio_channel, audio_channels);
                let key = self.nodes.insert(node);
                created.push(key);
            }
        }
        self.units[unit_key].nodes_mut(side).extend(created.iter().copied());
        self.relink_navigation(unit_key, side);
        for &key in &created {
            if owns {
                let sub_buffer = self.sub_buffers.insert(SubBuffer::new(key));
                self.nodes[key].own_sub_buffer = Some(sub_buffer);
                // Splices the new buffer between its sibling pads and
                // updates derived output ranges.
                self.set_range(key, Some(SubBufferRange::single(sub_buffer)), true, false)?;
            } else if side == Side::Output {
                let derived = self.derived_range(key);
                self.set_range(key, derived, false, false)?;
            }
        }
        Ok(())
    }

    /// Recompute prev/next and prev_pad/next_pad of every node on one side.
    fn relink_navigation(&mut self, unit_key: UnitKey, side: Side) {
        let unit = &self.units[unit_key];
        let audio_channels = unit.audio_channels;
        let keys = unit.nodes(side).to_vec();
        for (line, &key) in keys.iter().enumerate() {
            let node = &mut self.nodes[key];
            node.line = line;
            node.prev = line.checked_sub(1).map(|l| keys[l]);
            node.next = keys.get(line + 1).copied();
            node.prev_pad = line.checked_sub(audio_channels).map(|l| keys[l]);
            node.next_pad = keys.get(line + audio_channels).copied();
        }
    }

    /// Drop a node that is no longer listed by its unit.
    fn release_node(&mut self, key: NodeKey) {
        let instances = self
            .nodes
            .get(key)
            .map(|n| n.attachments.run_instances.clone())
            .unwrap_or_default();
        for instance in instances {
            self.discard_run_instance(instance);
        }
        if let Some(node) = self.nodes.remove(key) {
            if let Some(sub_buffer) = node.own_sub_buffer {
                self.sub_buffers.remove(sub_buffer);
            }
            let mut operators = node.attachments.play;
            operators.extend(node.attachments.recall);
            self.retire(key.into(), operators);
        }
    }
}
