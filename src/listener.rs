use std::cell::RefCell;
use std::rc::Rc;

use crate::command::CommandRef;
use crate::scheduler::Context;

/// Upper bound on command bindings per trigger.
pub const MAX_TRIGGER_BINDINGS: usize = 8;

/// A polled condition source. Listeners are polled at the top of every tick,
/// before arbitration; any `run`/`stop` they issue lands in the pending
/// buffers and is arbitrated in the same tick.
pub trait EventListener {
    fn check_conditions(&mut self, ctx: &mut Context<'_>);
}

/// Shared handle to a listener.
pub type ListenerRef = Rc<RefCell<dyn EventListener>>;

/// Wraps a listener into the shared-handle form the scheduler polls.
pub fn listener_ref<L: EventListener + 'static>(listener: L) -> ListenerRef {
    Rc::new(RefCell::new(listener))
}

/// Which observed transition of a boolean source a binding reacts to.
/// `Activated`/`Deactivated` fire on edges; `Active`/`Inactive` fire on every
/// tick the level holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Activated,
    Deactivated,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Stop,
}

fn classify(last: bool, current: bool) -> Condition {
    match (last, current) {
        (false, true) => Condition::Activated,
        (true, false) => Condition::Deactivated,
        (true, true) => Condition::Active,
        (false, false) => Condition::Inactive,
    }
}

/// Maps a polled boolean condition's edge and level transitions to `run` or
/// `stop` requests on bound commands. The source is any closure sampling the
/// condition, so no device I/O enters the core.
pub struct Trigger<F: FnMut() -> bool> {
    source: F,
    last_state: bool,
    bindings: heapless::Vec<(Condition, Action, CommandRef), MAX_TRIGGER_BINDINGS>,
}

impl<F: FnMut() -> bool> Trigger<F> {
    pub fn new(source: F) -> Self {
        Self {
            source,
            last_state: false,
            bindings: heapless::Vec::new(),
        }
    }

    /// Fires once on the false→true edge.
    pub fn when_activated(&mut self, command: &CommandRef, action: Action) {
        self.bind(Condition::Activated, action, command);
    }

    /// Fires every tick the source stays true.
    pub fn while_active(&mut self, command: &CommandRef, action: Action) {
        self.bind(Condition::Active, action, command);
    }

    /// Fires once on the true→false edge.
    pub fn when_deactivated(&mut self, command: &CommandRef, action: Action) {
        self.bind(Condition::Deactivated, action, command);
    }

    /// Fires every tick the source stays false.
    pub fn while_inactive(&mut self, command: &CommandRef, action: Action) {
        self.bind(Condition::Inactive, action, command);
    }

    fn bind(&mut self, condition: Condition, action: Action, command: &CommandRef) {
        debug_assert!(
            !self.bindings.is_full(),
            "trigger at binding capacity {}",
            MAX_TRIGGER_BINDINGS
        );
        let _ = self.bindings.push((condition, action, command.clone()));
    }
}

impl<F: FnMut() -> bool> EventListener for Trigger<F> {
    fn check_conditions(&mut self, ctx: &mut Context<'_>) {
        let current = (self.source)();
        let condition = classify(self.last_state, current);
        for (bound, action, command) in self.bindings.iter() {
            if *bound != condition {
                continue;
            }
            match action {
                Action::Run => ctx.run(command),
                Action::Stop => ctx.stop(command),
            }
        }
        self.last_state = current;
    }
}

/// Runs a command every tick a sampled analog value's magnitude exceeds a
/// threshold.
pub struct ThresholdTrigger<F: FnMut() -> i32> {
    source: F,
    threshold: i32,
    command: Option<CommandRef>,
}

impl<F: FnMut() -> i32> ThresholdTrigger<F> {
    pub fn new(source: F) -> Self {
        Self {
            source,
            threshold: 0,
            command: None,
        }
    }

    pub fn while_past_threshold(&mut self, command: &CommandRef, threshold: i32) {
        self.command = Some(command.clone());
        self.threshold = threshold.abs();
    }
}

impl<F: FnMut() -> i32> EventListener for ThresholdTrigger<F> {
    fn check_conditions(&mut self, ctx: &mut Context<'_>) {
        let Some(command) = &self.command else {
            return;
        };
        let value = (self.source)();
        if value > self.threshold || value < -self.threshold {
            ctx.run(command);
        }
    }
}
