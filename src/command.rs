use core::fmt;
use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::scheduler::Context;
use crate::subsystem::{SubsystemRef, MAX_SUBSYSTEMS};

/// Priority reserved for default commands. User commands always schedule at 1
/// or above; the scheduler forces this value when seeding a subsystem's
/// default command.
pub const DEFAULT_COMMAND_PRIORITY: u8 = 0;

/// What the scheduler should do with a command. `Idle` means not yet
/// initialized; `Running` follows the first `initialize()`; `Finished` and
/// `Interrupted` are terminal for one run cycle, after which the same command
/// may be submitted again and re-enters at `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Idle,
    Running,
    Finished,
    Interrupted,
}

/// Shared handle to any schedulable behavior.
pub type CommandRef = Rc<RefCell<dyn Command>>;

/// A deduplicated set of subsystem handles. Bounded by the subsystem registry
/// capacity: a requirement set can never name more subsystems than exist.
pub type RequirementSet = heapless::Vec<SubsystemRef, MAX_SUBSYSTEMS>;

/// Bookkeeping embedded in every command implementation: lifecycle status,
/// arbitration priority, and the declared subsystem requirements.
///
/// Status transitions are driven by the scheduler; implementations read their
/// own status but never write it.
pub struct CommandState {
    status: Status,
    priority: u8,
    requirements: RequirementSet,
}

impl CommandState {
    /// State for a regular command at the lowest user priority.
    pub fn new() -> Self {
        Self {
            status: Status::Idle,
            priority: 1,
            requirements: RequirementSet::new(),
        }
    }

    /// State with an explicit priority. Priority 0 is reserved for default
    /// commands, so user-supplied values are clamped to at least 1.
    pub fn with_priority(priority: u8) -> Self {
        Self {
            priority: priority.max(1),
            ..Self::new()
        }
    }

    /// Declares that the owning command requires exclusive use of a
    /// subsystem. Adding the same subsystem twice is a no-op. Call before the
    /// command first runs (conventionally from the constructor); requirement
    /// changes mid-run take effect at the next arbitration pass.
    pub fn require(&mut self, subsystem: &SubsystemRef) {
        if self.requirements.iter().any(|s| Rc::ptr_eq(s, subsystem)) {
            return;
        }
        debug_assert!(
            !self.requirements.is_full(),
            "requirement set at capacity {}",
            MAX_SUBSYSTEMS
        );
        let _ = self.requirements.push(subsystem.clone());
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn requirements(&self) -> &[SubsystemRef] {
        &self.requirements
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Rewrites this state as a default command of `owner`: priority 0 and a
    /// requirement set of exactly the owning subsystem.
    pub(crate) fn make_default_of(&mut self, owner: &SubsystemRef) {
        self.priority = DEFAULT_COMMAND_PRIORITY;
        self.requirements.clear();
        let _ = self.requirements.push(owner.clone());
    }
}

impl Default for CommandState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandState")
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("requirements", &self.requirements.len())
            .finish()
    }
}

/// A unit of behavior with a lifecycle, a priority, and a set of subsystem
/// requirements.
///
/// Commands are submitted with [`crate::Scheduler::run`] and arbitrated once
/// per tick: the first winning tick calls `initialize()` then `execute()`,
/// every further winning tick calls `execute()`, and `is_finished()` is
/// consulted after each `execute()`. Exactly one of `end()` or
/// `interrupted()` closes a run cycle: `end()` when `is_finished()` reports
/// true, `interrupted()` when the command is displaced by a conflicting
/// higher-priority command or explicitly stopped.
///
/// Implementations embed a [`CommandState`] and expose it through `state()` /
/// `state_mut()`; everything else has a default where the contract allows one.
pub trait Command {
    fn state(&self) -> &CommandState;
    fn state_mut(&mut self) -> &mut CommandState;

    /// Consulted before every arbitration pass in which this command is a
    /// candidate. Must be a pure predicate: no scheduler state may change.
    fn can_run(&self) -> bool {
        true
    }

    /// Called once per transition into `Running`.
    fn initialize(&mut self) {}

    /// Called every tick the command remains admitted and running. The
    /// context accepts `run`/`stop` requests, which land in the scheduler's
    /// pending buffers and take effect at the next compaction point; leaf
    /// commands usually ignore it.
    fn execute(&mut self, ctx: &mut Context<'_>);

    /// Consulted immediately after each `execute()`.
    fn is_finished(&self) -> bool;

    /// Called once, the tick `is_finished()` first reports true.
    fn end(&mut self) {}

    /// Called once when a running command is displaced or stopped.
    fn interrupted(&mut self, _ctx: &mut Context<'_>) {}

    /// The subsystems this command needs exclusive use of, this tick.
    /// Composite commands override this with a computed set.
    fn requirements(&self) -> RequirementSet {
        self.state().requirements.clone()
    }

    fn status(&self) -> Status {
        self.state().status()
    }

    fn priority(&self) -> u8 {
        self.state().priority()
    }

    /// Label used in trace output.
    fn name(&self) -> &str {
        "command"
    }

    /// Composite commands (groups) are queued and arbitrated separately from
    /// leaf commands. Not meant to be overridden outside this crate.
    #[doc(hidden)]
    fn is_composite(&self) -> bool {
        false
    }
}

/// Wraps a command into the shared-handle form the scheduler works with.
pub fn command_ref<C: Command + 'static>(command: C) -> CommandRef {
    Rc::new(RefCell::new(command))
}
