pub use crate::controller::{
    print_error_handler, Commands, Controller, EngineSettings, GraphCommands, PlaybackId,
};
pub use crate::graph::{
    Behavior, Dependency, DependencyScope, Graph, GraphSettings, Holder, LinkError, NodeKey,
    Operator, OperatorScope, OperatorStatus, Purpose, RunContext, RunInstanceKey, Side, Stage,
    StageRunner, UnitFlags, UnitKey, UnitSettings,
};
pub use crate::plugin::{PluginHost, PluginInstance, PluginOperator, PortDescriptor, PortHints};
pub use crate::{EngineError, Sample};
