//! Multi threaded use of a [`Graph`].
//!
//! The [`Controller`] owns the graph and is driven once per period, usually
//! from the audio callback or a thread mirroring it. Everything else talks
//! to it through [`Commands`], which can be cloned and sent to any thread.
//! Commands are queued and applied at the start of the next period so that
//! an edit never lands in the middle of a stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use rayon::prelude::*;

use crate::graph::{
    Graph, NodeKey, OperatorError, PlaybackError, Purpose, RunInstanceKey, RunPlan, Stage,
    StageRunner,
};
use crate::EngineError;

/// Identifies a play started through [`GraphCommands::start_playback`]. Is
/// handed out before the play exists so it can be used right away.
pub type PlaybackId = u64;

static NEXT_PLAYBACK_ID: AtomicU64 = AtomicU64::new(0);

type Task = Box<dyn FnOnce(&mut Graph) + Send>;

/// Encodes commands sent from [`Commands`]
enum Command {
    SetLink {
        node: NodeKey,
        link: Option<NodeKey>,
    },
    Unlink(NodeKey),
    StartPlayback {
        id: PlaybackId,
        node: NodeKey,
        purposes: Purpose,
    },
    Cancel(PlaybackId),
    Task(Task),
}

/// Everything that can be queued for the [`Controller`].
pub trait GraphCommands {
    /// Link `node` to `link`, or unlink it for `None`. See [`Graph::set_link`].
    fn set_link(&mut self, node: NodeKey, link: Option<NodeKey>);
    /// Break the link of `node`
    fn unlink(&mut self, node: NodeKey);
    /// Start a play on `node`. The returned id can be canceled at once.
    fn start_playback(&mut self, node: NodeKey, purposes: Purpose) -> PlaybackId;
    /// Cancel a play. It is removed once all its operators are done.
    fn cancel(&mut self, playback: PlaybackId);
    /// Run `task` on the graph at the next period boundary
    fn schedule_task(&mut self, task: impl FnOnce(&mut Graph) + Send + 'static);
}

/// Sends commands to a [`Controller`].
///
/// This can safely be cloned and sent to a different thread for use.
#[derive(Clone)]
pub struct Commands {
    sender: Sender<Command>,
}

impl Commands {
    fn send(&self, command: Command) {
        if self.sender.send(command).is_err() {
            tracing::warn!("Commands: the Controller has been dropped, command ignored");
        }
    }
}

impl GraphCommands for Commands {
    fn set_link(&mut self, node: NodeKey, link: Option<NodeKey>) {
        self.send(Command::SetLink { node, link });
    }
    fn unlink(&mut self, node: NodeKey) {
        self.send(Command::Unlink(node));
    }
    fn start_playback(&mut self, node: NodeKey, purposes: Purpose) -> PlaybackId {
        let id = NEXT_PLAYBACK_ID.fetch_add(1, Ordering::Relaxed);
        self.send(Command::StartPlayback { id, node, purposes });
        id
    }
    fn cancel(&mut self, playback: PlaybackId) {
        self.send(Command::Cancel(playback));
    }
    fn schedule_task(&mut self, task: impl FnOnce(&mut Graph) + Send + 'static) {
        self.send(Command::Task(Box::new(task)));
    }
}

/// Settings for a [`Controller`]
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Threads in the pool running plays. 0 lets rayon decide.
    pub num_workers: usize,
    /// Run the inputs of an ASYNC output in parallel
    pub parallel_fan_in: bool,
    /// The maximum number of commands applied per period. The rest wait for
    /// the next one.
    pub max_commands_per_period: usize,
}

impl EngineSettings {
    /// Set the number of workers to a new value
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }
    /// Turn parallel fan in on or off
    pub fn parallel_fan_in(mut self, parallel_fan_in: bool) -> Self {
        self.parallel_fan_in = parallel_fan_in;
        self
    }
    /// Set the command limit to a new value
    pub fn max_commands_per_period(mut self, max: usize) -> Self {
        self.max_commands_per_period = max;
        self
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            num_workers: 0,
            parallel_fan_in: false,
            max_commands_per_period: 300,
        }
    }
}

/// Receives commands from one or several [`Commands`] that may be on
/// different threads, applies them to the [`Graph`] and runs every play once
/// per period.
pub struct Controller {
    graph: Arc<RwLock<Graph>>,
    settings: EngineSettings,
    pool: rayon::ThreadPool,
    runner: StageRunner,
    command_receiver: Receiver<Command>,
    command_sender: Sender<Command>,
    playbacks: HashMap<PlaybackId, RunInstanceKey>,
    /// Canceled plays waiting for their operators to finish
    canceled: Vec<RunInstanceKey>,
    error_handler: Box<dyn FnMut(EngineError) + Send>,
}

impl Controller {
    /// Creates a new [`Controller`] taking the [`Graph`] to which commands
    /// will be applied and an error handler.
    pub fn new(
        graph: Graph,
        settings: EngineSettings,
        error_handler: impl FnMut(EngineError) + Send + 'static,
    ) -> Result<Self, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.num_workers)
            .thread_name(|i| format!("runtree-worker-{i}"))
            .build()?;
        let (command_sender, command_receiver) = unbounded();
        Ok(Self {
            graph: Arc::new(RwLock::new(graph)),
            runner: StageRunner::new(settings.parallel_fan_in),
            settings,
            pool,
            command_receiver,
            command_sender,
            playbacks: HashMap::new(),
            canceled: vec![],
            error_handler: Box::new(error_handler),
        })
    }

    /// A handle to the graph. Taking the write lock blocks the next period.
    pub fn graph(&self) -> Arc<RwLock<Graph>> {
        self.graph.clone()
    }

    /// The root run instance of a play started through [`Commands`], once
    /// the command has been applied.
    pub fn playback(&self, id: PlaybackId) -> Option<RunInstanceKey> {
        self.playbacks.get(&id).copied()
    }

    #[allow(missing_docs)]
    pub fn commands(&self) -> Commands {
        Commands {
            sender: self.command_sender.clone(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Graph> {
        self.graph.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Graph> {
        self.graph.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_command(&mut self, command: Command) {
        let result: Result<(), EngineError> = match command {
            Command::SetLink { node, link } => self
                .write()
                .set_link(node, link)
                .map(|report| log_unresolved(&report.unresolved))
                .map_err(From::from),
            Command::Unlink(node) => self
                .write()
                .unlink(node)
                .map(|report| log_unresolved(&report.unresolved))
                .map_err(From::from),
            Command::StartPlayback { id, node, purposes } => {
                let started = self.write().start_playback(node, purposes);
                match started {
                    Ok(root) => {
                        self.playbacks.insert(id, root);
                        Ok(())
                    }
                    Err(e) => Err(From::from(e)),
                }
            }
            Command::Cancel(id) => match self.playbacks.get(&id).copied() {
                Some(root) => {
                    let result = self.write().cancel_playback(root);
                    match result {
                        Ok(_) => {
                            self.canceled.push(root);
                            Ok(())
                        }
                        Err(e) => Err(From::from(e)),
                    }
                }
                None => Err(PlaybackError::RunInstanceNotFound.into()),
            },
            Command::Task(task) => {
                task(&mut *self.write());
                Ok(())
            }
        };

        if let Err(e) = result {
            (*self.error_handler)(e);
        }
    }

    // Receive commands and apply them to the graph. Returns true if all
    // commands in the queue were processed.
    fn receive_and_apply_commands(&mut self, max_commands: usize) -> bool {
        for _ in 0..max_commands {
            match self.command_receiver.try_recv() {
                Ok(command) => self.apply_command(command),
                Err(_) => return true,
            }
        }
        self.command_receiver.is_empty()
    }

    /// Drop finished operators and remove canceled plays that have wound
    /// down.
    fn run_maintenance(&mut self) {
        let mut graph = self.graph.write().unwrap_or_else(PoisonError::into_inner);
        for done in graph.take_done_operators() {
            match graph.remove(done.holder, done.operator) {
                Ok(_) => tracing::trace!("removed done operator {}", done.operator),
                // Retired with its run instance, the sweep takes it
                Err(OperatorError::NotFound(_)) | Err(OperatorError::HolderNotFound) => {}
                Err(e) => (*self.error_handler)(e.into()),
            }
        }
        let winding_down = graph.sweep_retired();
        if winding_down > 0 {
            tracing::trace!("{winding_down} retired operators still winding down");
        }
        let mut finished = vec![];
        self.canceled.retain(|root| {
            if graph.is_playback_finished(*root) {
                finished.push(*root);
                false
            } else {
                true
            }
        });
        for root in finished {
            match graph.stop_playback(root) {
                Ok(()) => {}
                // Already gone if an edit removed the origin
                Err(PlaybackError::RunInstanceNotFound) => {}
                Err(e) => (*self.error_handler)(e.into()),
            }
            self.playbacks.retain(|_, r| *r != root);
            tracing::debug!("playback {root:?} finished");
        }
    }

    /// Apply queued commands, run maintenance and then run one period of
    /// every play on the worker pool. Operators dropped by an edit keep
    /// running until they have wound down.
    ///
    /// Returns true if all commands in the queue were processed.
    pub fn process_period(&mut self) -> bool {
        let all_commands_received =
            self.receive_and_apply_commands(self.settings.max_commands_per_period);
        self.run_maintenance();
        let plans = self.plans();
        self.pool
            .install(|| plans.par_iter().for_each(RunPlan::run_period));
        self.read().run_retired();
        all_commands_received
    }

    /// Run one stage of one play right away, outside of the period loop.
    /// Calling this for Pre, Inter and Post in turn runs a full period.
    pub fn run_stage(&mut self, root: RunInstanceKey, stage: Stage) -> Result<(), EngineError> {
        let plan = self.runner.plan(&self.read(), root)?;
        self.pool.install(|| plan.drive_stage(stage));
        Ok(())
    }

    fn plans(&mut self) -> Vec<RunPlan> {
        let graph = self.graph.read().unwrap_or_else(PoisonError::into_inner);
        let mut plans = vec![];
        for root in graph.playbacks() {
            match self.runner.plan(&graph, root) {
                Ok(plan) => plans.push(plan),
                Err(e) => (*self.error_handler)(e.into()),
            }
        }
        plans
    }

    /// Consumes the [`Controller`] and moves it to a new thread where it will
    /// run one period per `block_size` frames of the graph's sample rate.
    pub fn start_on_new_thread(self) -> Commands {
        let commands = self.commands();
        let period = {
            let graph = self.read();
            let settings = graph.settings();
            Duration::from_secs_f64(settings.block_size as f64 / settings.sample_rate as f64)
        };
        let mut controller = self;
        std::thread::spawn(move || loop {
            controller.process_period();
            std::thread::sleep(period);
        });
        commands
    }
}

fn log_unresolved(unresolved: &[OperatorError]) {
    for e in unresolved {
        tracing::debug!("{e}");
    }
}

/// The default error handler: logs the error
pub fn print_error_handler(e: EngineError) {
    tracing::error!("Error in Controller: {e}");
}
