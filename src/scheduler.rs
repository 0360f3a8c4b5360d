use core::mem;
use std::rc::Rc;
use std::vec::Vec as StdVec;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, warn};

use crate::command::{CommandRef, RequirementSet, Status, DEFAULT_COMMAND_PRIORITY};
use crate::listener::ListenerRef;
use crate::subsystem::{SubsystemRef, MAX_SUBSYSTEMS};

/// Upper bound on leaf commands held across the pending buffer and live queue.
pub const MAX_COMMANDS: usize = 32;
/// Upper bound on top-level command groups.
pub const MAX_GROUPS: usize = 16;
/// Upper bound on registered listeners.
pub const MAX_LISTENERS: usize = 16;

const_assert!(MAX_GROUPS <= MAX_COMMANDS);
const_assert!(MAX_SUBSYSTEMS <= MAX_COMMANDS);

type CommandQueue = heapless::Vec<CommandRef, MAX_COMMANDS>;
type GroupQueue = heapless::Vec<CommandRef, MAX_GROUPS>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("subsystem registry full (capacity {0})")]
    SubsystemRegistryFull(usize),
    #[error("listener registry full (capacity {0})")]
    ListenerRegistryFull(usize),
}

/// Counters describing scheduler activity since construction. Queue depths
/// are refreshed at the end of every tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct SchedulerStats {
    pub ticks: u32,
    pub commands_started: u32,
    pub commands_finished: u32,
    pub commands_interrupted: u32,
    pub groups_started: u32,
    pub groups_finished: u32,
    pub groups_interrupted: u32,
    pub arbitration_losses: u32,
    pub requests_dropped: u32,
    pub queued_commands: u8,
    pub queued_groups: u8,
}

/// Admission surface handed to callbacks invoked from within a tick.
///
/// `run` and `stop` only append to the scheduler's pending buffers, so they
/// are safe to call from listener polls and command callbacks: the live
/// queues being iterated are never touched, and the request takes effect at
/// the next compaction point within the same tick or the next tick.
pub struct Context<'a> {
    command_buffer: &'a mut CommandQueue,
    group_buffer: &'a mut GroupQueue,
    stop_requests: &'a mut CommandQueue,
    command_queue: &'a CommandQueue,
    group_queue: &'a GroupQueue,
    stats: &'a mut SchedulerStats,
}

impl Context<'_> {
    /// Requests admission for a command or group. Idempotent: a target
    /// already pending or live is left untouched. Must not be called with a
    /// handle to the command currently executing.
    pub fn run(&mut self, target: &CommandRef) {
        if target.borrow().is_composite() {
            if contains(self.group_buffer, target) || contains(self.group_queue, target) {
                return;
            }
            if self.group_buffer.is_full() {
                self.stats.requests_dropped += 1;
                warn!("group buffer full; dropping admission request");
                return;
            }
            target.borrow_mut().state_mut().set_status(Status::Idle);
            let _ = self.group_buffer.push(target.clone());
        } else {
            if contains(self.command_buffer, target) || contains(self.command_queue, target) {
                return;
            }
            if self.command_buffer.is_full() {
                self.stats.requests_dropped += 1;
                warn!("command buffer full; dropping admission request");
                return;
            }
            target.borrow_mut().state_mut().set_status(Status::Idle);
            let _ = self.command_buffer.push(target.clone());
        }
    }

    /// Requests removal of a command or group. Idempotent; a target absent
    /// from the scheduler is silently ignored. Targets that had reached
    /// `Running` receive exactly one `interrupted()` when the request is
    /// processed.
    pub fn stop(&mut self, target: &CommandRef) {
        if contains(self.stop_requests, target) {
            return;
        }
        if self.stop_requests.is_full() {
            self.stats.requests_dropped += 1;
            warn!("stop buffer full; dropping removal request");
            return;
        }
        let _ = self.stop_requests.push(target.clone());
    }
}

fn contains<const N: usize>(list: &heapless::Vec<CommandRef, N>, target: &CommandRef) -> bool {
    list.iter().any(|entry| Rc::ptr_eq(entry, target))
}

fn remove_entry<const N: usize>(
    list: &mut heapless::Vec<CommandRef, N>,
    target: &CommandRef,
) -> bool {
    match list.iter().position(|entry| Rc::ptr_eq(entry, target)) {
        Some(index) => {
            list.remove(index);
            true
        }
        None => false,
    }
}

fn context<'a>(
    command_buffer: &'a mut CommandQueue,
    group_buffer: &'a mut GroupQueue,
    stop_requests: &'a mut CommandQueue,
    command_queue: &'a CommandQueue,
    group_queue: &'a GroupQueue,
    stats: &'a mut SchedulerStats,
) -> Context<'a> {
    Context {
        command_buffer,
        group_buffer,
        stop_requests,
        command_queue,
        group_queue,
        stats,
    }
}

/// The arbiter. Holds pending-admission buffers and live queues for commands
/// and command groups; each tick, drains buffers, resolves requirement
/// conflicts by priority, advances lifecycle state machines, and prunes
/// finished or displaced entries.
///
/// One instance per control loop, owned by the driver and ticked via
/// [`Scheduler::update`] at a fixed cadence. Strictly single-threaded: every
/// callback runs to completion inside `update()`.
pub struct Scheduler {
    subsystems: heapless::Vec<SubsystemRef, MAX_SUBSYSTEMS>,
    listeners: heapless::Vec<ListenerRef, MAX_LISTENERS>,
    command_buffer: CommandQueue,
    command_queue: CommandQueue,
    group_buffer: GroupQueue,
    group_queue: GroupQueue,
    stop_requests: CommandQueue,
    defaults_seeded: bool,
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            subsystems: heapless::Vec::new(),
            listeners: heapless::Vec::new(),
            command_buffer: CommandQueue::new(),
            command_queue: CommandQueue::new(),
            group_buffer: GroupQueue::new(),
            group_queue: GroupQueue::new(),
            stop_requests: CommandQueue::new(),
            defaults_seeded: false,
            stats: SchedulerStats::default(),
        }
    }

    /// Registers a subsystem. Call exactly once per subsystem, at
    /// construction, before any command requires it. Re-registering the same
    /// handle is a no-op.
    pub fn track_subsystem(&mut self, subsystem: &SubsystemRef) -> Result<(), SchedulerError> {
        if self.subsystems.iter().any(|s| Rc::ptr_eq(s, subsystem)) {
            return Ok(());
        }
        self.subsystems
            .push(subsystem.clone())
            .map_err(|_| SchedulerError::SubsystemRegistryFull(MAX_SUBSYSTEMS))
    }

    /// Registers a listener to be polled at the top of every tick.
    pub fn add_listener(&mut self, listener: &ListenerRef) -> Result<(), SchedulerError> {
        if self.listeners.iter().any(|l| Rc::ptr_eq(l, listener)) {
            return Ok(());
        }
        self.listeners
            .push(listener.clone())
            .map_err(|_| SchedulerError::ListenerRegistryFull(MAX_LISTENERS))
    }

    /// Requests admission for a command or group; see [`Context::run`].
    pub fn run(&mut self, target: &CommandRef) {
        let Self {
            command_buffer,
            group_buffer,
            stop_requests,
            command_queue,
            group_queue,
            stats,
            ..
        } = self;
        context(
            command_buffer,
            group_buffer,
            stop_requests,
            command_queue,
            group_queue,
            stats,
        )
        .run(target);
    }

    /// Requests removal of a command or group; see [`Context::stop`]. The
    /// request is processed early in the next `update()`, before arbitration.
    pub fn stop(&mut self, target: &CommandRef) {
        let Self {
            command_buffer,
            group_buffer,
            stop_requests,
            command_queue,
            group_queue,
            stats,
            ..
        } = self;
        context(
            command_buffer,
            group_buffer,
            stop_requests,
            command_queue,
            group_queue,
            stats,
        )
        .stop(target);
    }

    /// Whether a command or group is currently pending or live.
    pub fn is_scheduled(&self, target: &CommandRef) -> bool {
        contains(&self.command_buffer, target)
            || contains(&self.command_queue, target)
            || contains(&self.group_buffer, target)
            || contains(&self.group_queue, target)
    }

    pub fn pending_commands(&self) -> usize {
        self.command_buffer.len()
    }

    pub fn active_commands(&self) -> usize {
        self.command_queue.len()
    }

    pub fn pending_groups(&self) -> usize {
        self.group_buffer.len()
    }

    pub fn active_groups(&self) -> usize {
        self.group_queue.len()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Hard reset, used on control-mode transitions. Every entry that had
    /// reached `Running` receives exactly one `interrupted()`; all buffers
    /// and queues end empty. With `include_defaults` the next `update()`
    /// reseeds every subsystem's default command; without it defaults stay
    /// withheld for the run-session (e.g. while disabled).
    pub fn reset(&mut self, include_defaults: bool) {
        debug!(include_defaults, "scheduler reset");
        let mut active: StdVec<CommandRef> = StdVec::new();
        active.extend(self.command_buffer.iter().cloned());
        active.extend(self.command_queue.iter().cloned());
        active.extend(self.group_buffer.iter().cloned());
        active.extend(self.group_queue.iter().cloned());

        let Self {
            command_buffer,
            command_queue,
            group_buffer,
            group_queue,
            stop_requests,
            stats,
            defaults_seeded,
            ..
        } = self;
        command_buffer.clear();
        command_queue.clear();
        group_buffer.clear();
        group_queue.clear();
        stop_requests.clear();

        for entry in &active {
            if entry.borrow().status() != Status::Running {
                continue;
            }
            let composite = entry.borrow().is_composite();
            entry.borrow_mut().state_mut().set_status(Status::Interrupted);
            if composite {
                stats.groups_interrupted += 1;
            } else {
                stats.commands_interrupted += 1;
            }
            let mut ctx = context(
                command_buffer,
                group_buffer,
                stop_requests,
                command_queue,
                group_queue,
                stats,
            );
            entry.borrow_mut().interrupted(&mut ctx);
        }
        // Cancellation fallout from group teardown has nothing left to target.
        stop_requests.clear();
        stats.queued_commands = 0;
        stats.queued_groups = 0;
        *defaults_seeded = !include_defaults;
    }

    /// One tick. Polls listeners, seeds default commands once per
    /// run-session, drains pending buffers, arbitrates groups then commands
    /// by priority and requirement conflict, invokes lifecycle callbacks, and
    /// prunes finished or displaced entries.
    ///
    /// Within the command pass, every loser's `interrupted()` fires before
    /// any winner's `initialize()` or `execute()`, so a displaced command
    /// never observes half-updated shared state from its successor.
    pub fn update(&mut self) {
        self.stats.ticks += 1;
        self.poll_listeners();
        self.seed_default_commands();
        self.process_stop_requests();
        self.promote_groups();
        self.arbitrate_groups();
        self.process_stop_requests();
        self.promote_commands();
        self.arbitrate_commands();
        self.stats.queued_commands = self.command_queue.len() as u8;
        self.stats.queued_groups = self.group_queue.len() as u8;
    }

    fn poll_listeners(&mut self) {
        let Self {
            listeners,
            command_buffer,
            group_buffer,
            stop_requests,
            command_queue,
            group_queue,
            stats,
            ..
        } = self;
        for index in 0..listeners.len() {
            let listener = listeners[index].clone();
            let mut ctx = context(
                command_buffer,
                group_buffer,
                stop_requests,
                command_queue,
                group_queue,
                stats,
            );
            listener.borrow_mut().check_conditions(&mut ctx);
        }
    }

    fn seed_default_commands(&mut self) {
        if self.defaults_seeded {
            return;
        }
        self.defaults_seeded = true;
        let Self {
            subsystems,
            command_buffer,
            group_buffer,
            stop_requests,
            command_queue,
            group_queue,
            stats,
            ..
        } = self;
        for index in 0..subsystems.len() {
            let subsystem = subsystems[index].clone();
            let default = subsystem.borrow().default_command();
            let Some(command) = default else {
                continue;
            };
            command.borrow_mut().state_mut().make_default_of(&subsystem);
            debug!(
                subsystem = subsystem.borrow().name(),
                command = command.borrow().name(),
                "seeding default command"
            );
            let mut ctx = context(
                command_buffer,
                group_buffer,
                stop_requests,
                command_queue,
                group_queue,
                stats,
            );
            ctx.run(&command);
        }
    }

    fn process_stop_requests(&mut self) {
        loop {
            if self.stop_requests.is_empty() {
                break;
            }
            let pending = mem::take(&mut self.stop_requests);
            for target in pending {
                self.discharge(&target);
            }
        }
    }

    /// Removes a stop target from whichever buffer or queue holds it. Only
    /// targets that had reached `Running` are notified; a pending entry that
    /// never ran is excised silently, and an absent target is a no-op.
    fn discharge(&mut self, target: &CommandRef) {
        let Self {
            command_buffer,
            command_queue,
            group_buffer,
            group_queue,
            stop_requests,
            stats,
            ..
        } = self;
        let mut found = remove_entry(command_buffer, target);
        found |= remove_entry(command_queue, target);
        found |= remove_entry(group_buffer, target);
        found |= remove_entry(group_queue, target);
        if !found {
            return;
        }
        if target.borrow().status() != Status::Running {
            return;
        }
        let composite = target.borrow().is_composite();
        target.borrow_mut().state_mut().set_status(Status::Interrupted);
        if composite {
            stats.groups_interrupted += 1;
        } else {
            stats.commands_interrupted += 1;
        }
        debug!(command = target.borrow().name(), "stopped while running");
        let mut ctx = context(
            command_buffer,
            group_buffer,
            stop_requests,
            command_queue,
            group_queue,
            stats,
        );
        target.borrow_mut().interrupted(&mut ctx);
    }

    fn promote_groups(&mut self) {
        let drained = mem::take(&mut self.group_buffer);
        for group in drained {
            if self.group_queue.push(group).is_err() {
                self.stats.requests_dropped += 1;
                warn!("group queue full; dropping admission");
            }
        }
    }

    /// Group pass: newest first, so recency wins requirement ties. Groups
    /// that reported interruption (a starved or cancelled member) are
    /// notified and removed; winners claim their step's requirements and get
    /// a lifecycle turn; running losers are interrupted, never-admitted
    /// losers dropped silently.
    fn arbitrate_groups(&mut self) {
        if self.group_queue.is_empty() {
            return;
        }
        let Self {
            command_buffer,
            command_queue,
            group_buffer,
            group_queue,
            stop_requests,
            stats,
            ..
        } = self;
        let mut claimed = RequirementSet::new();
        let mut removals: heapless::Vec<usize, MAX_GROUPS> = heapless::Vec::new();

        for index in (0..group_queue.len()).rev() {
            let group = group_queue[index].clone();
            let status = group.borrow().status();

            if status == Status::Interrupted {
                stats.groups_interrupted += 1;
                debug!(group = group.borrow().name(), "group interrupted");
                let mut ctx = context(
                    command_buffer,
                    group_buffer,
                    stop_requests,
                    command_queue,
                    group_queue,
                    stats,
                );
                group.borrow_mut().interrupted(&mut ctx);
                let _ = removals.push(index);
                continue;
            }

            let (can_run, requirements) = {
                let entry = group.borrow();
                (entry.can_run(), entry.requirements())
            };
            let blocked = requirements
                .iter()
                .any(|required| claimed.iter().any(|held| Rc::ptr_eq(held, required)));

            if can_run && !blocked {
                for required in &requirements {
                    if !claimed.iter().any(|held| Rc::ptr_eq(held, required)) {
                        let _ = claimed.push(required.clone());
                    }
                }
                let mut entry = group.borrow_mut();
                if entry.status() != Status::Running {
                    entry.initialize();
                    entry.state_mut().set_status(Status::Running);
                    stats.groups_started += 1;
                }
                let mut ctx = context(
                    command_buffer,
                    group_buffer,
                    stop_requests,
                    command_queue,
                    group_queue,
                    stats,
                );
                entry.execute(&mut ctx);
                if entry.is_finished() {
                    entry.end();
                    entry.state_mut().set_status(Status::Finished);
                    stats.groups_finished += 1;
                    let _ = removals.push(index);
                }
            } else {
                stats.arbitration_losses += 1;
                if status == Status::Running {
                    stats.groups_interrupted += 1;
                    group.borrow_mut().state_mut().set_status(Status::Interrupted);
                    let mut ctx = context(
                        command_buffer,
                        group_buffer,
                        stop_requests,
                        command_queue,
                        group_queue,
                        stats,
                    );
                    group.borrow_mut().interrupted(&mut ctx);
                }
                let _ = removals.push(index);
            }
        }

        // Indices were collected in descending order, so removal is stable.
        for &index in removals.iter() {
            group_queue.remove(index);
        }
    }

    /// Keeps the live queue sorted ascending by priority. A drained command
    /// is inserted before the first strictly-greater priority, landing after
    /// existing equals so the tail-first arbitration scan sees newer
    /// submissions first.
    fn promote_commands(&mut self) {
        let drained = mem::take(&mut self.command_buffer);
        for command in drained {
            let priority = command.borrow().priority();
            let position = self
                .command_queue
                .iter()
                .position(|queued| queued.borrow().priority() > priority)
                .unwrap_or(self.command_queue.len());
            if self.command_queue.insert(position, command).is_err() {
                self.stats.requests_dropped += 1;
                warn!("command queue full; dropping admission");
            }
        }
    }

    /// Command pass, tail (highest priority) to head. Winners are collected
    /// and executed only after every loser's `interrupted()` has fired.
    /// Default commands are never removed, only skipped for the tick.
    fn arbitrate_commands(&mut self) {
        if self.command_queue.is_empty() {
            return;
        }
        let Self {
            subsystems,
            command_buffer,
            command_queue,
            group_buffer,
            group_queue,
            stop_requests,
            stats,
            ..
        } = self;
        let total_subsystems = subsystems.len();
        let depth = command_queue.len();
        let mut claimed = RequirementSet::new();
        let mut keep: heapless::Vec<bool, MAX_COMMANDS> = heapless::Vec::new();
        let _ = keep.resize(depth, true);
        let mut winners: heapless::Vec<usize, MAX_COMMANDS> = heapless::Vec::new();

        for index in (0..depth).rev() {
            let command = command_queue[index].clone();
            let (mut eligible, requirements, priority, status) = {
                let entry = command.borrow();
                (
                    entry.can_run(),
                    entry.requirements(),
                    entry.priority(),
                    entry.status(),
                )
            };
            // Once every registered subsystem is claimed, nothing that
            // requires one can still win this tick.
            if eligible && claimed.len() == total_subsystems && !requirements.is_empty() {
                eligible = false;
            }
            if eligible
                && requirements
                    .iter()
                    .any(|required| claimed.iter().any(|held| Rc::ptr_eq(held, required)))
            {
                eligible = false;
            }

            if eligible {
                for required in &requirements {
                    if !claimed.iter().any(|held| Rc::ptr_eq(held, required)) {
                        let _ = claimed.push(required.clone());
                    }
                }
                let _ = winners.push(index);
            } else {
                stats.arbitration_losses += 1;
                if status == Status::Running {
                    stats.commands_interrupted += 1;
                    command.borrow_mut().state_mut().set_status(Status::Interrupted);
                    debug!(command = command.borrow().name(), "displaced by arbitration");
                    let mut ctx = context(
                        command_buffer,
                        group_buffer,
                        stop_requests,
                        command_queue,
                        group_queue,
                        stats,
                    );
                    command.borrow_mut().interrupted(&mut ctx);
                }
                if priority > DEFAULT_COMMAND_PRIORITY {
                    keep[index] = false;
                }
            }
        }

        for &index in winners.iter() {
            let command = command_queue[index].clone();
            let mut entry = command.borrow_mut();
            if entry.status() != Status::Running {
                entry.initialize();
                entry.state_mut().set_status(Status::Running);
                stats.commands_started += 1;
            }
            let mut ctx = context(
                command_buffer,
                group_buffer,
                stop_requests,
                command_queue,
                group_queue,
                stats,
            );
            entry.execute(&mut ctx);
            if entry.is_finished() {
                entry.end();
                entry.state_mut().set_status(Status::Finished);
                stats.commands_finished += 1;
                if entry.priority() > DEFAULT_COMMAND_PRIORITY {
                    keep[index] = false;
                }
            }
        }

        let survivors = mem::take(command_queue);
        for (index, command) in survivors.into_iter().enumerate() {
            if keep[index] {
                let _ = command_queue.push(command);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
