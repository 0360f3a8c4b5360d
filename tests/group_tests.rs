use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use cmdbus::*;

#[derive(Clone, Default)]
struct Probe {
    initialized: Rc<Cell<u32>>,
    executed: Rc<Cell<u32>>,
    ended: Rc<Cell<u32>>,
    interrupted: Rc<Cell<u32>>,
}

struct Rig;
impl Subsystem for Rig {}

struct Probed {
    state: CommandState,
    probe: Probe,
    finish_after: Option<u32>,
    executes_this_run: u32,
}

impl Command for Probed {
    fn state(&self) -> &CommandState {
        &self.state
    }
    fn state_mut(&mut self) -> &mut CommandState {
        &mut self.state
    }
    fn initialize(&mut self) {
        self.executes_this_run = 0;
        self.probe.initialized.set(self.probe.initialized.get() + 1);
    }
    fn execute(&mut self, _ctx: &mut Context<'_>) {
        self.executes_this_run += 1;
        self.probe.executed.set(self.probe.executed.get() + 1);
    }
    fn is_finished(&self) -> bool {
        self.finish_after
            .map_or(false, |limit| self.executes_this_run >= limit)
    }
    fn end(&mut self) {
        self.probe.ended.set(self.probe.ended.get() + 1);
    }
    fn interrupted(&mut self, _ctx: &mut Context<'_>) {
        self.probe.interrupted.set(self.probe.interrupted.get() + 1);
    }
}

fn probed(
    priority: u8,
    requirements: &[&SubsystemRef],
    finish_after: Option<u32>,
) -> (CommandRef, Probe) {
    let probe = Probe::default();
    let mut state = CommandState::with_priority(priority);
    for subsystem in requirements {
        state.require(subsystem);
    }
    let command = command_ref(Probed {
        state,
        probe: probe.clone(),
        finish_after,
        executes_this_run: 0,
    });
    (command, probe)
}

fn group_ref(group: CommandGroup) -> CommandRef {
    Rc::new(RefCell::new(group))
}

#[test]
fn test_steps_run_in_sequence() {
    let mut scheduler = Scheduler::new();
    let rig_a = subsystem_ref(Rig);
    let rig_b = subsystem_ref(Rig);
    scheduler.track_subsystem(&rig_a).unwrap();
    scheduler.track_subsystem(&rig_b).unwrap();

    let (first, first_probe) = probed(1, &[&rig_a], Some(2));
    let (second, second_probe) = probed(1, &[&rig_a], Some(1));
    let (third, third_probe) = probed(1, &[&rig_b], Some(1));

    let mut group = CommandGroup::named("sequence");
    group.add_sequential(&first, true);
    group.add_sequential(&second, true);
    group.add_parallel(&third, true);
    let group = group_ref(group);

    scheduler.run(&group);

    // Tick 1: the group admits its first step; nothing from step two runs.
    scheduler.update();
    assert_eq!(first_probe.initialized.get(), 1);
    assert_eq!(second_probe.initialized.get(), 0);
    assert_eq!(third_probe.initialized.get(), 0);

    // Tick 2: the first member finishes.
    scheduler.update();
    assert_eq!(first_probe.ended.get(), 1);
    assert_eq!(second_probe.initialized.get(), 0);

    // Tick 3: the step is observed complete, and both members of the next
    // step are admitted in the same tick.
    scheduler.update();
    assert_eq!(second_probe.initialized.get(), 1);
    assert_eq!(third_probe.initialized.get(), 1);
    assert_eq!(second_probe.ended.get(), 1);
    assert_eq!(third_probe.ended.get(), 1);

    // Tick 4: both waited-on members are done, so the group finishes.
    scheduler.update();
    assert_eq!(group.borrow().status(), Status::Finished);
    assert!(!scheduler.is_scheduled(&group));
    assert_eq!(scheduler.stats().groups_finished, 1);
}

#[test]
fn test_fire_and_forget_member_does_not_block_step() {
    let mut scheduler = Scheduler::new();
    let rig_a = subsystem_ref(Rig);
    let rig_b = subsystem_ref(Rig);
    let rig_c = subsystem_ref(Rig);
    scheduler.track_subsystem(&rig_a).unwrap();
    scheduler.track_subsystem(&rig_b).unwrap();
    scheduler.track_subsystem(&rig_c).unwrap();

    let (quick, quick_probe) = probed(1, &[&rig_a], Some(1));
    let (forever, forever_probe) = probed(1, &[&rig_b], None);
    let (next, next_probe) = probed(1, &[&rig_c], Some(1));

    let mut group = CommandGroup::new();
    group.add_sequential(&quick, true);
    group.add_parallel(&forever, false);
    group.add_sequential(&next, true);
    let group = group_ref(group);

    scheduler.run(&group);
    scheduler.update();
    scheduler.update();

    // The unwaited member is still running, yet the step advanced.
    assert_eq!(quick_probe.ended.get(), 1);
    assert_eq!(next_probe.initialized.get(), 1);
    assert!(scheduler.is_scheduled(&forever));
    assert_eq!(forever_probe.interrupted.get(), 0);

    scheduler.update();
    assert_eq!(group.borrow().status(), Status::Finished);
    // The fire-and-forget member outlives the group.
    assert!(scheduler.is_scheduled(&forever));
}

#[test]
fn test_starved_member_interrupts_group() {
    let mut scheduler = Scheduler::new();
    let rig = subsystem_ref(Rig);
    scheduler.track_subsystem(&rig).unwrap();

    let (hog, hog_probe) = probed(5, &[&rig], None);
    scheduler.run(&hog);
    scheduler.update();
    assert_eq!(hog_probe.initialized.get(), 1);

    let (member, member_probe) = probed(1, &[&rig], None);
    let mut group = CommandGroup::named("starved");
    group.add_sequential(&member, true);
    let group = group_ref(group);
    scheduler.run(&group);

    // Tick 2: the group admits its member, which loses arbitration to the
    // higher-priority command and never starts.
    scheduler.update();
    assert_eq!(member_probe.initialized.get(), 0);

    // Tick 3: the group observes the starved member and reports interrupted.
    scheduler.update();
    assert_eq!(group.borrow().status(), Status::Interrupted);

    // Tick 4: the scheduler tears the group down; it parks replayable.
    scheduler.update();
    assert!(!scheduler.is_scheduled(&group));
    assert_eq!(group.borrow().status(), Status::Idle);
    assert_eq!(member_probe.interrupted.get(), 0);
    assert_eq!(hog_probe.interrupted.get(), 0);
}

#[test]
fn test_stopping_group_cancels_members() {
    let mut scheduler = Scheduler::new();
    let rig_a = subsystem_ref(Rig);
    let rig_b = subsystem_ref(Rig);
    scheduler.track_subsystem(&rig_a).unwrap();
    scheduler.track_subsystem(&rig_b).unwrap();

    let (left, left_probe) = probed(1, &[&rig_a], None);
    let (right, right_probe) = probed(1, &[&rig_b], None);
    let mut group = CommandGroup::new();
    group.add_sequential(&left, true);
    group.add_parallel(&right, true);
    let group = group_ref(group);

    scheduler.run(&group);
    scheduler.update();
    scheduler.update();
    assert_eq!(left.borrow().status(), Status::Running);
    assert_eq!(right.borrow().status(), Status::Running);

    scheduler.stop(&group);
    scheduler.update();

    // Cancellation propagates downward before any further execution.
    assert_eq!(left_probe.interrupted.get(), 1);
    assert_eq!(right_probe.interrupted.get(), 1);
    assert!(!scheduler.is_scheduled(&group));
    assert!(!scheduler.is_scheduled(&left));
    assert!(!scheduler.is_scheduled(&right));
    assert_eq!(group.borrow().status(), Status::Idle);
}

#[test]
fn test_interrupted_group_replays_from_first_step() {
    let mut scheduler = Scheduler::new();
    let rig = subsystem_ref(Rig);
    scheduler.track_subsystem(&rig).unwrap();

    let (member, member_probe) = probed(1, &[&rig], Some(3));
    let mut group = CommandGroup::new();
    group.add_sequential(&member, true);
    let group = group_ref(group);

    scheduler.run(&group);
    scheduler.update();
    assert_eq!(member_probe.initialized.get(), 1);

    scheduler.stop(&group);
    scheduler.update();
    assert_eq!(member_probe.interrupted.get(), 1);

    // Replay re-admits the first step from scratch.
    scheduler.run(&group);
    scheduler.update();
    assert_eq!(member_probe.initialized.get(), 2);
    assert_eq!(group.borrow().status(), Status::Running);
}

#[test]
fn test_nested_group_runs_inline() {
    let mut scheduler = Scheduler::new();
    let rig_a = subsystem_ref(Rig);
    let rig_b = subsystem_ref(Rig);
    scheduler.track_subsystem(&rig_a).unwrap();
    scheduler.track_subsystem(&rig_b).unwrap();

    let (outer_member, outer_probe) = probed(1, &[&rig_a], Some(1));
    let (inner_member, inner_probe) = probed(1, &[&rig_b], Some(1));

    let mut inner = CommandGroup::named("inner");
    inner.add_sequential(&inner_member, true);
    let inner = group_ref(inner);

    let mut outer = CommandGroup::named("outer");
    outer.add_sequential(&outer_member, true);
    outer.add_sequential(&inner, true);
    let outer = group_ref(outer);

    scheduler.run(&outer);

    // Tick 1: first step runs and finishes.
    scheduler.update();
    assert_eq!(outer_probe.ended.get(), 1);
    assert_eq!(inner_probe.initialized.get(), 0);

    // Tick 2: the nested group starts inline and admits its own member; the
    // nested group never enters the scheduler's queues itself.
    scheduler.update();
    assert_eq!(inner_probe.initialized.get(), 1);
    assert!(!scheduler.is_scheduled(&inner));
    assert_eq!(inner.borrow().status(), Status::Running);

    // Tick 3: the nested group completes, which completes the outer group.
    scheduler.update();
    assert_eq!(inner.borrow().status(), Status::Finished);
    assert_eq!(outer.borrow().status(), Status::Finished);
    assert!(!scheduler.is_scheduled(&outer));
    assert_eq!(inner_probe.ended.get(), 1);
}

#[test]
fn test_reset_interrupts_group_and_members() {
    let mut scheduler = Scheduler::new();
    let rig = subsystem_ref(Rig);
    scheduler.track_subsystem(&rig).unwrap();

    let (member, member_probe) = probed(1, &[&rig], None);
    let mut group = CommandGroup::new();
    group.add_sequential(&member, true);
    let group = group_ref(group);

    scheduler.run(&group);
    scheduler.update();
    scheduler.update();
    assert_eq!(member.borrow().status(), Status::Running);

    scheduler.reset(true);
    assert_eq!(member_probe.interrupted.get(), 1);
    assert_eq!(scheduler.active_groups(), 0);
    assert_eq!(scheduler.active_commands(), 0);
    assert_eq!(group.borrow().status(), Status::Idle);
}

#[test]
fn test_group_requirements_follow_current_step() {
    let mut scheduler = Scheduler::new();
    let rig_a = subsystem_ref(Rig);
    let rig_b = subsystem_ref(Rig);
    scheduler.track_subsystem(&rig_a).unwrap();
    scheduler.track_subsystem(&rig_b).unwrap();

    let (first, _) = probed(1, &[&rig_a], Some(1));
    let (second, _) = probed(1, &[&rig_b], None);
    let mut group = CommandGroup::new();
    group.add_sequential(&first, true);
    group.add_sequential(&second, true);
    let group = group_ref(group);

    scheduler.run(&group);
    scheduler.update();

    let requirements = group.borrow().requirements();
    assert_eq!(requirements.len(), 1);
    assert!(Rc::ptr_eq(&requirements[0], &rig_a));

    scheduler.update();
    scheduler.update();
    let requirements = group.borrow().requirements();
    assert_eq!(requirements.len(), 1);
    assert!(Rc::ptr_eq(&requirements[0], &rig_b));
}
