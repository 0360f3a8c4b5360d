use std::rc::Rc;

use arrayvec::ArrayString;
use tracing::trace;

use crate::command::{Command, CommandRef, CommandState, RequirementSet, Status};
use crate::scheduler::Context;

/// Upper bound on sequential steps per group.
pub const MAX_STEPS: usize = 16;
/// Upper bound on parallel members per step.
pub const MAX_STEP_MEMBERS: usize = 8;

const MAX_NAME_LEN: usize = 32;

struct Member {
    command: CommandRef,
    admitted: bool,
    wait_until_finished: bool,
}

type Step = heapless::Vec<Member, MAX_STEP_MEMBERS>;

/// An ordered sequence of parallel steps of commands, itself schedulable as a
/// command.
///
/// All members of a step run logically in parallel; steps run in addition
/// order. A step completes once every member flagged `wait_until_finished`
/// has finished (unflagged members are fire-and-forget and keep running into
/// later steps). A step is considered interrupted when any member was
/// interrupted, or was admitted but starved of arbitration by a conflicting
/// higher-priority command; the group then cancels downward and parks at
/// `Idle` with its bookkeeping reset, so a later `run()` replays it from the
/// first step.
///
/// The group's requirement set is computed, not stored: it is the union of
/// the current step's member requirements, so it changes as steps advance.
/// Groups nest: a member that is itself a group is driven by its parent
/// rather than re-entering the scheduler.
pub struct CommandGroup {
    state: CommandState,
    label: ArrayString<MAX_NAME_LEN>,
    steps: heapless::Vec<Step, MAX_STEPS>,
    sequential_index: usize,
}

impl CommandGroup {
    pub fn new() -> Self {
        Self::named("group")
    }

    pub fn named(label: &str) -> Self {
        let mut name = ArrayString::new();
        for ch in label.chars() {
            if name.try_push(ch).is_err() {
                break;
            }
        }
        Self {
            state: CommandState::new(),
            label: name,
            steps: heapless::Vec::new(),
            sequential_index: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.state = CommandState::with_priority(priority);
        self
    }

    /// Appends a new sequential step containing only this command.
    pub fn add_sequential(&mut self, command: &CommandRef, wait_until_finished: bool) {
        debug_assert!(!self.steps.is_full(), "group at step capacity {}", MAX_STEPS);
        if self.steps.is_full() {
            return;
        }
        let mut step = Step::new();
        let _ = step.push(Member {
            command: command.clone(),
            admitted: false,
            wait_until_finished,
        });
        let _ = self.steps.push(step);
    }

    /// Appends this command to the most recently added step. With no step yet
    /// this behaves like [`CommandGroup::add_sequential`].
    pub fn add_parallel(&mut self, command: &CommandRef, wait_until_finished: bool) {
        let Some(step) = self.steps.last_mut() else {
            self.add_sequential(command, wait_until_finished);
            return;
        };
        debug_assert!(!step.is_full(), "step at member capacity {}", MAX_STEP_MEMBERS);
        let _ = step.push(Member {
            command: command.clone(),
            admitted: false,
            wait_until_finished,
        });
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Index of the step currently executing; equals `step_count()` once the
    /// group has finished.
    pub fn current_step(&self) -> usize {
        self.sequential_index
    }
}

impl Default for CommandGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// One lifecycle turn for a nested group, mirroring what the scheduler does
/// for top-level entries.
fn drive(member: &CommandRef, ctx: &mut Context<'_>, first: bool) {
    let mut entry = member.borrow_mut();
    if first {
        entry.initialize();
        entry.state_mut().set_status(Status::Running);
    }
    if entry.status() == Status::Running {
        entry.execute(ctx);
        if entry.status() == Status::Running && entry.is_finished() {
            entry.end();
            entry.state_mut().set_status(Status::Finished);
        }
    }
    if entry.status() == Status::Interrupted {
        entry.interrupted(ctx);
    }
}

impl Command for CommandGroup {
    fn state(&self) -> &CommandState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut CommandState {
        &mut self.state
    }

    /// A group can run only if every member of its current step can.
    fn can_run(&self) -> bool {
        match self.steps.get(self.sequential_index) {
            Some(step) => step.iter().all(|m| m.command.borrow().can_run()),
            None => true,
        }
    }

    fn initialize(&mut self) {
        self.state.set_status(Status::Running);
        self.sequential_index = 0;
        for step in self.steps.iter_mut() {
            for member in step.iter_mut() {
                member.admitted = false;
            }
        }
    }

    fn execute(&mut self, ctx: &mut Context<'_>) {
        loop {
            if self.sequential_index >= self.steps.len() {
                return;
            }
            let index = self.sequential_index;
            let mut step_finished = true;
            let mut step_interrupted = false;

            for slot in 0..self.steps[index].len() {
                let (command, admitted, wait) = {
                    let member = &self.steps[index][slot];
                    (
                        member.command.clone(),
                        member.admitted,
                        member.wait_until_finished,
                    )
                };
                let composite = command.borrow().is_composite();

                if !admitted {
                    self.steps[index][slot].admitted = true;
                    step_finished = false;
                    if composite {
                        drive(&command, ctx, true);
                    } else {
                        ctx.run(&command);
                    }
                    continue;
                }

                if composite && command.borrow().status() == Status::Running {
                    drive(&command, ctx, false);
                }

                let status = command.borrow().status();
                if status != Status::Finished && wait {
                    step_finished = false;
                }
                // Idle after admission means the member never won arbitration:
                // starved by a conflicting higher-priority command.
                if status == Status::Interrupted || status == Status::Idle {
                    step_interrupted = true;
                }
            }

            if step_interrupted {
                self.state.set_status(Status::Interrupted);
                return;
            }
            if !step_finished {
                return;
            }
            self.sequential_index += 1;
            trace!(
                group = self.label.as_str(),
                step = self.sequential_index,
                "step complete"
            );
            // Fall through so the next step's members are admitted this tick.
        }
    }

    fn is_finished(&self) -> bool {
        self.sequential_index >= self.steps.len()
    }

    fn end(&mut self) {
        self.state.set_status(Status::Finished);
    }

    /// Stops everything still active in the current step, then resets so the
    /// group can be replayed from the first step.
    fn interrupted(&mut self, ctx: &mut Context<'_>) {
        if let Some(step) = self.steps.get(self.sequential_index) {
            for member in step.iter() {
                let composite = member.command.borrow().is_composite();
                if composite {
                    let mut entry = member.command.borrow_mut();
                    if entry.status() == Status::Running {
                        entry.state_mut().set_status(Status::Interrupted);
                        entry.interrupted(ctx);
                    }
                } else {
                    ctx.stop(&member.command);
                }
            }
        }
        self.sequential_index = 0;
        self.state.set_status(Status::Idle);
    }

    /// Union, without duplicates, of the current step's member requirements.
    fn requirements(&self) -> RequirementSet {
        let mut union = RequirementSet::new();
        if let Some(step) = self.steps.get(self.sequential_index) {
            for member in step.iter() {
                for required in member.command.borrow().requirements().iter() {
                    if !union.iter().any(|held| Rc::ptr_eq(held, required)) {
                        let _ = union.push(required.clone());
                    }
                }
            }
        }
        union
    }

    fn name(&self) -> &str {
        self.label.as_str()
    }

    fn is_composite(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::command_ref;
    use crate::subsystem::{subsystem_ref, Subsystem, SubsystemRef};

    struct Axle;
    impl Subsystem for Axle {}

    struct Hold {
        state: CommandState,
    }

    impl Command for Hold {
        fn state(&self) -> &CommandState {
            &self.state
        }
        fn state_mut(&mut self) -> &mut CommandState {
            &mut self.state
        }
        fn execute(&mut self, _ctx: &mut Context<'_>) {}
        fn is_finished(&self) -> bool {
            false
        }
    }

    fn hold(requirements: &[&SubsystemRef]) -> CommandRef {
        let mut state = CommandState::new();
        for subsystem in requirements {
            state.require(subsystem);
        }
        command_ref(Hold { state })
    }

    #[test]
    fn test_add_parallel_without_step_creates_one() {
        let mut group = CommandGroup::new();
        group.add_parallel(&hold(&[]), false);
        assert_eq!(group.step_count(), 1);
    }

    #[test]
    fn test_steps_accumulate_in_order() {
        let mut group = CommandGroup::new();
        group.add_sequential(&hold(&[]), true);
        group.add_parallel(&hold(&[]), false);
        group.add_sequential(&hold(&[]), true);
        assert_eq!(group.step_count(), 2);
        assert_eq!(group.current_step(), 0);
    }

    #[test]
    fn test_requirements_union_current_step_only() {
        let axle = subsystem_ref(Axle);
        let other = subsystem_ref(Axle);

        let mut group = CommandGroup::new();
        group.add_sequential(&hold(&[&axle]), true);
        group.add_parallel(&hold(&[&axle, &other]), true);
        group.add_sequential(&hold(&[&other]), true);

        let requirements = Command::requirements(&group);
        assert_eq!(requirements.len(), 2);

        // Once the group is past its last step the union is empty.
        group.sequential_index = group.step_count();
        assert!(Command::requirements(&group).is_empty());
        assert!(group.is_finished());
    }

    #[test]
    fn test_group_is_composite_and_named() {
        let group = CommandGroup::named("auton");
        assert!(group.is_composite());
        assert_eq!(Command::name(&group), "auton");
        assert_eq!(group.status(), Status::Idle);
    }

    #[test]
    fn test_long_label_truncates() {
        let group = CommandGroup::named(
            "a-very-long-label-that-does-not-fit-in-the-backing-buffer-at-all",
        );
        assert_eq!(Command::name(&group).len(), 32);
    }
}
