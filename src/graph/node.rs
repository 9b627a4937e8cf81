use super::{Attachments, NodeKey, SubBufferKey, SubBufferRange, UnitKey};

/// Which side of a [`Unit`](super::Unit) a [`Node`] sits on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub enum Side {
    /// Signal leaves the unit here, towards the root of the tree
    Output,
    /// Signal enters the unit here, from the leaves
    Input,
}

impl Side {
    /// The side a link from this side must go to
    pub fn opposite(self) -> Self {
        match self {
            Side::Output => Side::Input,
            Side::Input => Side::Output,
        }
    }
}

/// One line of a unit, on its Output or Input side.
///
/// `prev`/`next` walk the flattened line order, `prev_pad`/`next_pad` stay on
/// the same audio channel and step a whole pad.
pub struct Node {
    pub(crate) unit: UnitKey,
    pub(crate) side: Side,
    pub(crate) pad: usize,
    pub(crate) audio_channel: usize,
    pub(crate) line: usize,
    pub(crate) prev: Option<NodeKey>,
    pub(crate) next: Option<NodeKey>,
    pub(crate) prev_pad: Option<NodeKey>,
    pub(crate) next_pad: Option<NodeKey>,
    pub(crate) link: Option<NodeKey>,
    pub(crate) range: Option<SubBufferRange>,
    /// Private sub buffer if the unit owns recycling on this side
    pub(crate) own_sub_buffer: Option<SubBufferKey>,
    pub(crate) attachments: Attachments,
}

impl Node {
    pub(super) fn new(
        unit: UnitKey,
        side: Side,
        pad: usize,
        audio_channel: usize,
        audio_channels: usize,
    ) -> Self {
        Self {
            unit,
            side,
            pad,
            audio_channel,
            line: pad * audio_channels + audio_channel,
            prev: None,
            next: None,
            prev_pad: None,
            next_pad: None,
            link: None,
            range: None,
            own_sub_buffer: None,
            attachments: Attachments::default(),
        }
    }
    #[allow(missing_docs)]
    pub fn unit(&self) -> UnitKey {
        self.unit
    }
    #[allow(missing_docs)]
    pub fn side(&self) -> Side {
        self.side
    }
    #[allow(missing_docs)]
    pub fn pad(&self) -> usize {
        self.pad
    }
    #[allow(missing_docs)]
    pub fn audio_channel(&self) -> usize {
        self.audio_channel
    }
    /// `pad * audio_channels + audio_channel`
    pub fn line(&self) -> usize {
        self.line
    }
    /// Previous line on the same side
    pub fn prev(&self) -> Option<NodeKey> {
        self.prev
    }
    /// Next line on the same side
    pub fn next(&self) -> Option<NodeKey> {
        self.next
    }
    /// Same audio channel, previous pad
    pub fn prev_pad(&self) -> Option<NodeKey> {
        self.prev_pad
    }
    /// Same audio channel, next pad
    pub fn next_pad(&self) -> Option<NodeKey> {
        self.next_pad
    }
    /// The node on the other end of the wire, if any
    pub fn link(&self) -> Option<NodeKey> {
        self.link
    }
    /// The sub buffers this node reads from or writes to
    pub fn range(&self) -> Option<SubBufferRange> {
        self.range
    }
    /// The private sub buffer this node introduced, if any
    pub fn own_sub_buffer(&self) -> Option<SubBufferKey> {
        self.own_sub_buffer
    }
}
