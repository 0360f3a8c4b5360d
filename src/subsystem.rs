use std::cell::RefCell;
use std::rc::Rc;

use crate::command::CommandRef;

/// Upper bound on registered subsystems. Requirement sets share this bound: a
/// command can never require more subsystems than can exist.
pub const MAX_SUBSYSTEMS: usize = 8;

/// An exclusively-ownable resource domain, one mechanism that at most one
/// command may control per tick.
///
/// Subsystems have identity, not value equality: two handles refer to the
/// same subsystem only if they share an allocation. Register every subsystem
/// with [`crate::Scheduler::track_subsystem`] at construction, before any
/// command requires it; subsystems live for the process lifetime.
pub trait Subsystem {
    /// The command to run whenever no other command holds this subsystem.
    /// Asked once per run-session, the first `update()` after a reset that
    /// re-arms defaults. The scheduler forces the returned command's priority
    /// to 0 and its requirement set to exactly this subsystem.
    fn default_command(&self) -> Option<CommandRef> {
        None
    }

    /// Label used in trace output.
    fn name(&self) -> &str {
        "subsystem"
    }
}

/// Shared handle to a subsystem. Commands hold these in their requirement
/// sets; the scheduler compares them by allocation address.
pub type SubsystemRef = Rc<RefCell<dyn Subsystem>>;

/// Wraps a subsystem into the shared-handle form commands require against.
pub fn subsystem_ref<S: Subsystem + 'static>(subsystem: S) -> SubsystemRef {
    Rc::new(RefCell::new(subsystem))
}
