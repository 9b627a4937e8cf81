//! Hosting effect plugins as operators.
//!
//! Loading plugin binaries is left to a [`PluginHost`] implementation; this
//! module only defines the interface and [`PluginOperator`], which wraps one
//! hosted instance per run instance. Port metadata is passed through as the
//! host reports it.

use std::sync::Arc;

use bitflags::bitflags;

use crate::graph::{Behavior, Graph, Holder, Operator, RunContext, SharedOperator, Stage};
use crate::graph::{OperatorStatus, Purpose};
use crate::{EngineError, Sample};

/// Error loading or driving a plugin
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum PluginError {
    #[error("The host does not support the plugin format `{0}`.")]
    UnsupportedFormat(String),
    #[error("Failed to instantiate plugin `{0}`.")]
    Instantiate(String),
    #[error("The plugin does not support program changes.")]
    ProgramChangeUnsupported,
}

bitflags! {
    /// Hints about the range and scale of a control port
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
    pub struct PortHints: u8 {
        #[allow(missing_docs)]
        const TOGGLED = 1;
        #[allow(missing_docs)]
        const INTEGER = 1 << 1;
        #[allow(missing_docs)]
        const LOGARITHMIC = 1 << 2;
        #[allow(missing_docs)]
        const BOUNDED_BELOW = 1 << 3;
        #[allow(missing_docs)]
        const BOUNDED_ABOVE = 1 << 4;
    }
}

#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub enum PortDirection {
    Input,
    Output,
}

#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub enum PortKind {
    Audio,
    Control,
}

/// One port of a plugin as reported by its host
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub struct PortDescriptor {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub direction: PortDirection,
    #[allow(missing_docs)]
    pub kind: PortKind,
    #[allow(missing_docs)]
    pub hints: PortHints,
    /// Initial value of a control port
    pub default: Sample,
    /// Only meaningful with [`PortHints::BOUNDED_BELOW`]
    pub lower: Sample,
    /// Only meaningful with [`PortHints::BOUNDED_ABOVE`]
    pub upper: Sample,
}

impl PortDescriptor {
    /// An audio port without hints
    pub fn audio(name: impl Into<String>, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            direction,
            kind: PortKind::Audio,
            hints: PortHints::empty(),
            default: 0.0,
            lower: 0.0,
            upper: 0.0,
        }
    }
    /// A control input port
    pub fn control(name: impl Into<String>, default: Sample) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Input,
            kind: PortKind::Control,
            hints: PortHints::empty(),
            default,
            lower: 0.0,
            upper: 0.0,
        }
    }
    /// Set hints and bounds
    pub fn hints(mut self, hints: PortHints, lower: Sample, upper: Sample) -> Self {
        self.hints = hints;
        self.lower = lower;
        self.upper = upper;
        self
    }
    /// Bring `value` into the range the hints allow
    pub fn constrain(&self, value: Sample) -> Sample {
        let mut value = value;
        if self.hints.contains(PortHints::BOUNDED_BELOW) {
            value = value.max(self.lower);
        }
        if self.hints.contains(PortHints::BOUNDED_ABOVE) {
            value = value.min(self.upper);
        }
        if self.hints.contains(PortHints::TOGGLED) {
            value = if value > 0.0 { 1.0 } else { 0.0 };
        } else if self.hints.contains(PortHints::INTEGER) {
            value = value.round();
        }
        value
    }
}

/// What a host needs to find and instantiate a plugin
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub struct PluginDescriptor {
    /// e.g. "ladspa" or "lv2"
    pub format: String,
    /// Unique within the format, e.g. a file name plus effect label
    pub id: String,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub ports: Vec<PortDescriptor>,
}

impl PluginDescriptor {
    /// Indices of the ports matching `direction` and `kind`, in port order
    pub fn port_indices(&self, direction: PortDirection, kind: PortKind) -> Vec<usize> {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.direction == direction && p.kind == kind)
            .map(|(i, _)| i)
            .collect()
    }
}

/// The buffer behind one port while the plugin runs
#[derive(Clone, Debug, PartialEq)]
pub enum PortBuffer {
    #[allow(missing_docs)]
    Audio(Vec<Sample>),
    #[allow(missing_docs)]
    Control(Sample),
}

/// A timed event passed to [`PluginInstance::run`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PluginEvent {
    /// Frame within the block
    pub frame: usize,
    /// Raw MIDI bytes
    pub data: [u8; 3],
}

/// Loads plugins. Implementations wrap a plugin format such as LADSPA or LV2.
pub trait PluginHost: Send + Sync {
    /// Create a new instance of the plugin
    fn instantiate(
        &self,
        descriptor: &PluginDescriptor,
        sample_rate: Sample,
        buffer_size: usize,
    ) -> Result<Box<dyn PluginInstance>, PluginError>;
}

/// A live plugin instance.
///
/// The host connects every port once before activating. At every
/// [`PluginInstance::run`] the buffers are passed in port order.
pub trait PluginInstance: Send {
    /// Tell the instance that `port` will be present in the buffers passed to
    /// [`PluginInstance::run`].
    fn connect_port(&mut self, port: usize, descriptor: &PortDescriptor);
    #[allow(missing_docs)]
    fn activate(&mut self);
    #[allow(missing_docs)]
    fn deactivate(&mut self);
    /// Process `frames` frames
    fn run(&mut self, ports: &mut [PortBuffer], frames: usize, events: &[PluginEvent]);
    /// Switch program. Most formats do not support this.
    fn change_program(&mut self, _bank: u32, _program: u32) -> Result<(), PluginError> {
        Err(PluginError::ProgramChangeUnsupported)
    }
}

/// An operator running a hosted plugin.
///
/// The template only holds the descriptor and the control values; each clone
/// instantiates its own plugin when initialised. A clone whose plugin fails
/// to instantiate is bypassed: its audio inputs are copied to its outputs.
pub struct PluginOperator {
    host: Arc<dyn PluginHost>,
    descriptor: Arc<PluginDescriptor>,
    instance: Option<Box<dyn PluginInstance>>,
    ports: Vec<PortBuffer>,
    events: Vec<PluginEvent>,
    active: bool,
    bypassed: bool,
}

impl PluginOperator {
    #[allow(missing_docs)]
    pub fn new(host: Arc<dyn PluginHost>, descriptor: PluginDescriptor) -> Self {
        let ports = descriptor
            .ports
            .iter()
            .map(|p| match p.kind {
                PortKind::Audio => PortBuffer::Audio(vec![]),
                PortKind::Control => PortBuffer::Control(p.constrain(p.default)),
            })
            .collect();
        Self {
            host,
            descriptor: Arc::new(descriptor),
            instance: None,
            ports,
            events: vec![],
            active: false,
            bypassed: false,
        }
    }

    #[allow(missing_docs)]
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// True if the plugin failed to instantiate and audio passes through
    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// True between a successful instantiation and cancel
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Set a control port, constrained by its hints
    pub fn set_control(&mut self, port: usize, value: Sample) {
        let Some(descriptor) = self.descriptor.ports.get(port) else {
            return;
        };
        if let Some(PortBuffer::Control(v)) = self.ports.get_mut(port) {
            *v = descriptor.constrain(value);
        }
    }

    #[allow(missing_docs)]
    pub fn control(&self, port: usize) -> Option<Sample> {
        match self.ports.get(port)? {
            PortBuffer::Control(v) => Some(*v),
            PortBuffer::Audio(_) => None,
        }
    }

    /// The buffer of an audio port, sized to the block after initialisation
    pub fn audio(&self, port: usize) -> Option<&[Sample]> {
        match self.ports.get(port)? {
            PortBuffer::Audio(b) => Some(b),
            PortBuffer::Control(_) => None,
        }
    }

    #[allow(missing_docs)]
    pub fn audio_mut(&mut self, port: usize) -> Option<&mut [Sample]> {
        match self.ports.get_mut(port)? {
            PortBuffer::Audio(b) => Some(b),
            PortBuffer::Control(_) => None,
        }
    }

    /// Queue an event for the next run
    pub fn push_event(&mut self, event: PluginEvent) {
        self.events.push(event);
    }

    /// Switch program on the running instance
    pub fn change_program(&mut self, bank: u32, program: u32) -> Result<(), PluginError> {
        match &mut self.instance {
            Some(instance) => instance.change_program(bank, program),
            None => Err(PluginError::ProgramChangeUnsupported),
        }
    }

    fn instantiate(&mut self, sample_rate: Sample, block_size: usize) {
        for port in &mut self.ports {
            if let PortBuffer::Audio(buffer) = port {
                buffer.resize(block_size, 0.0);
            }
        }
        match self
            .host
            .instantiate(&self.descriptor, sample_rate, block_size)
        {
            Ok(mut instance) => {
                for (i, port) in self.descriptor.ports.iter().enumerate() {
                    instance.connect_port(i, port);
                }
                instance.activate();
                self.instance = Some(instance);
                self.active = true;
            }
            Err(e) => {
                tracing::warn!("plugin \"{}\" bypassed: {e}", self.descriptor.name);
                self.bypassed = true;
            }
        }
    }

    fn pass_through(&mut self) {
        let inputs = self
            .descriptor
            .port_indices(PortDirection::Input, PortKind::Audio);
        let outputs = self
            .descriptor
            .port_indices(PortDirection::Output, PortKind::Audio);
        for (input, output) in inputs.into_iter().zip(outputs) {
            let source = match &self.ports[input] {
                PortBuffer::Audio(b) => b.clone(),
                PortBuffer::Control(_) => continue,
            };
            if let PortBuffer::Audio(target) = &mut self.ports[output] {
                for (t, s) in target.iter_mut().zip(&source) {
                    *t = *s;
                }
            }
        }
    }

    fn deactivate(&mut self) {
        if self.active {
            if let Some(instance) = &mut self.instance {
                instance.deactivate();
            }
            self.active = false;
        }
    }
}

impl Behavior for PluginOperator {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn duplicate(&self) -> Box<dyn Behavior> {
        Box::new(PluginOperator {
            host: self.host.clone(),
            descriptor: self.descriptor.clone(),
            instance: None,
            ports: self.ports.clone(),
            events: vec![],
            active: false,
            bypassed: false,
        })
    }

    fn run_init(&mut self, ctx: &RunContext) {
        if ctx.stage == Stage::Pre && self.instance.is_none() && !self.bypassed {
            self.instantiate(ctx.sample_rate, ctx.block_size);
        }
    }

    fn run(&mut self, ctx: &RunContext) -> OperatorStatus {
        if ctx.stage != Stage::Inter {
            return OperatorStatus::Continue;
        }
        let events = std::mem::take(&mut self.events);
        if self.active {
            if let Some(instance) = &mut self.instance {
                instance.run(&mut self.ports, ctx.block_size, &events);
                return OperatorStatus::Continue;
            }
        }
        self.pass_through();
        OperatorStatus::Continue
    }

    fn cancel(&mut self) {
        self.deactivate();
    }
}

impl Drop for PluginOperator {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl Graph {
    /// Add a plugin template to `holder`.
    ///
    /// The plugin is instantiated once to check that the host can load it; a
    /// plugin that fails is never added, so it is never cloned.
    pub fn add_plugin_template(
        &mut self,
        holder: impl Into<Holder>,
        host: Arc<dyn PluginHost>,
        descriptor: PluginDescriptor,
        purposes: Purpose,
    ) -> Result<SharedOperator, EngineError> {
        let settings = self.settings();
        if let Err(e) = host.instantiate(&descriptor, settings.sample_rate, settings.block_size) {
            tracing::warn!("plugin template \"{}\" skipped: {e}", descriptor.name);
            return Err(e.into());
        }
        let operator = Operator::template(PluginOperator::new(host, descriptor)).purposes(purposes);
        Ok(self.add_template(holder, operator)?)
    }
}
