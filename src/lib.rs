//! # Command Bus
//!
//! A cooperative command-scheduling core for periodically-polled control
//! loops, providing priority arbitration over shared subsystems, a
//! six-hook command lifecycle, and composable sequential/parallel command
//! groups.
//!
//! ## Features
//!
//! - **Per-tick arbitration**: conflicting resource requirements resolved by
//!   priority, once per `update()`
//! - **Command lifecycle**: `initialize`/`execute`/`is_finished`/`end` with
//!   exclusive `interrupted` notification on displacement
//! - **Command groups**: ordered sequential steps of parallel commands,
//!   themselves schedulable and freely nestable
//! - **Default commands**: priority-0 fallbacks that hold a subsystem
//!   whenever nothing else claims it
//! - **Polled triggers**: edge/level condition sources mapped to run/stop
//!   requests
//! - **Embedded-friendly**: bounded queues, no allocation on the tick path
//!
//! ## Quick Start
//!
//! ```rust
//! use cmdbus::{command_ref, subsystem_ref, Command, CommandState, Context, Scheduler, Status, Subsystem};
//!
//! struct Chassis;
//! impl Subsystem for Chassis {}
//!
//! struct Spin {
//!     state: CommandState,
//!     ticks: u32,
//! }
//!
//! impl Command for Spin {
//!     fn state(&self) -> &CommandState { &self.state }
//!     fn state_mut(&mut self) -> &mut CommandState { &mut self.state }
//!     fn execute(&mut self, _ctx: &mut Context<'_>) { self.ticks += 1; }
//!     fn is_finished(&self) -> bool { self.ticks >= 3 }
//! }
//!
//! let mut scheduler = Scheduler::new();
//! let chassis = subsystem_ref(Chassis);
//! scheduler.track_subsystem(&chassis).unwrap();
//!
//! let mut state = CommandState::new();
//! state.require(&chassis);
//! let spin = command_ref(Spin { state, ticks: 0 });
//!
//! scheduler.run(&spin);
//! for _ in 0..4 {
//!     scheduler.update();
//! }
//! assert_eq!(spin.borrow().status(), Status::Finished);
//! ```
//!
//! ## Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`scheduler`] - The arbiter: pending buffers, live queues, the per-tick
//!   algorithm
//! - [`command`] - Lifecycle status, bookkeeping state, and the `Command`
//!   trait
//! - [`group`] - Composite commands sequencing/parallelizing children
//! - [`subsystem`] - Resource-domain identity and default commands
//! - [`listener`] - Polled triggers translating conditions into admissions
//!
//! The host drives the loop: call [`Scheduler::update`] at a fixed cadence
//! (conventionally every 10-50 ms) and [`Scheduler::reset`] on every
//! control-mode transition. Everything runs on the caller's thread; no
//! callback may block.

#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod command;
pub mod group;
pub mod listener;
pub mod scheduler;
pub mod subsystem;

// Re-export main public types for convenience
pub use command::{
    command_ref, Command, CommandRef, CommandState, RequirementSet, Status,
    DEFAULT_COMMAND_PRIORITY,
};
pub use group::CommandGroup;
pub use listener::{
    listener_ref, Action, Condition, EventListener, ListenerRef, ThresholdTrigger, Trigger,
};
pub use scheduler::{Context, Scheduler, SchedulerError, SchedulerStats};
pub use subsystem::{subsystem_ref, Subsystem, SubsystemRef};
