//! # runtree - run identity and recycling engine for modular audio graphs
//!
//! runtree keeps track of *who is running where* in a graph of audio units
//! that can be rewired while it plays. Units have Output and Input nodes;
//! linking an output to an input routes the signal. Every running play gets a
//! tree of [`RunGroup`](graph::RunGroup)s and a
//! [`RunInstance`](graph::RunInstance) on each holder it covers, and
//! operators (the per unit processing logic) are cloned per run instance from
//! templates.
//!
//! ## Architecture
//!
//! The core is the [`Graph`](graph::Graph) arena and the
//! [`Behavior`](graph::Behavior) trait. Edits such as
//! [`Graph::set_link`](graph::Graph::set_link) update the chain of
//! [`SubBuffer`](graph::SubBuffer)s describing which buffers feed which node
//! and then reconcile every play touching the edited wires: instances that
//! are no longer reachable are canceled and freed, new parts of the topology
//! get fresh instances and cloned operators, and everything else keeps its
//! identity.
//!
//! Running is done from [`RunPlan`](graph::RunPlan)s: snapshots of the
//! operators of one play that can run Pre, Inter and Post stages without
//! holding on to the graph. The [`Controller`](controller::Controller) ties it
//! together for multi threaded use: it owns the graph, applies queued
//! commands at period boundaries and runs every play on a rayon pool.
//!

#![deny(rustdoc::broken_intra_doc_links)] // error if there are broken intra-doc links
#![warn(missing_docs)]

pub mod controller;
pub mod graph;
pub mod inspection;
pub mod plugin;
pub mod prelude;
pub mod test_utils;

/// The sample type used throughout runtree
pub type Sample = f32;

/// Every error runtree can return, for code that does not care which part
/// of the engine it came from.
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("There was an error linking or unlinking nodes: {0}")]
    LinkError(#[from] graph::LinkError),
    #[error("There was an error with an operator: {0}")]
    OperatorError(#[from] graph::OperatorError),
    #[error("There was an error with a playback: {0}")]
    PlaybackError(#[from] graph::PlaybackError),
    #[error("There was an error hosting a plugin: {0}")]
    PluginError(#[from] plugin::PluginError),
    #[error("Failed to build the worker pool: {0}")]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
}
