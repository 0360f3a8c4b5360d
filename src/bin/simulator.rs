use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use clap::{App, Arg};
use colored::Colorize;
use tokio::time;
use tracing::info;

use cmdbus::{
    command_ref, listener_ref, Action, Command, CommandGroup, CommandRef, CommandState, Context,
    Scheduler, Subsystem, SubsystemRef, Trigger,
};

struct Drivetrain {
    power: i16,
    default: Option<CommandRef>,
}

impl Drivetrain {
    fn new() -> Self {
        Self {
            power: 0,
            default: None,
        }
    }
}

impl Subsystem for Drivetrain {
    fn default_command(&self) -> Option<CommandRef> {
        self.default.clone()
    }

    fn name(&self) -> &str {
        "drivetrain"
    }
}

struct Claw {
    open: bool,
}

impl Subsystem for Claw {
    fn name(&self) -> &str {
        "claw"
    }
}

/// Default command: zero the drivetrain whenever nothing else owns it.
struct IdleDrive {
    state: CommandState,
    drive: Rc<RefCell<Drivetrain>>,
}

impl Command for IdleDrive {
    fn state(&self) -> &CommandState {
        &self.state
    }
    fn state_mut(&mut self) -> &mut CommandState {
        &mut self.state
    }
    fn execute(&mut self, _ctx: &mut Context<'_>) {
        self.drive.borrow_mut().power = 0;
    }
    fn is_finished(&self) -> bool {
        false
    }
    fn name(&self) -> &str {
        "idle-drive"
    }
}

/// Timed open-loop drive segment.
struct DriveSegment {
    state: CommandState,
    drive: Rc<RefCell<Drivetrain>>,
    power: i16,
    duration_ticks: u32,
    elapsed: u32,
    label: &'static str,
}

impl Command for DriveSegment {
    fn state(&self) -> &CommandState {
        &self.state
    }
    fn state_mut(&mut self) -> &mut CommandState {
        &mut self.state
    }
    fn initialize(&mut self) {
        self.elapsed = 0;
        info!(segment = self.label, power = self.power, "segment start");
    }
    fn execute(&mut self, _ctx: &mut Context<'_>) {
        self.drive.borrow_mut().power = self.power;
        self.elapsed += 1;
    }
    fn is_finished(&self) -> bool {
        self.elapsed >= self.duration_ticks
    }
    fn end(&mut self) {
        self.drive.borrow_mut().power = 0;
        info!(segment = self.label, "segment complete");
    }
    fn interrupted(&mut self, _ctx: &mut Context<'_>) {
        self.drive.borrow_mut().power = 0;
        info!(segment = self.label, "segment interrupted");
    }
    fn name(&self) -> &str {
        self.label
    }
}

/// One-shot claw actuation.
struct SetClaw {
    state: CommandState,
    claw: Rc<RefCell<Claw>>,
    open: bool,
    done: bool,
}

impl Command for SetClaw {
    fn state(&self) -> &CommandState {
        &self.state
    }
    fn state_mut(&mut self) -> &mut CommandState {
        &mut self.state
    }
    fn initialize(&mut self) {
        self.done = false;
    }
    fn execute(&mut self, _ctx: &mut Context<'_>) {
        self.claw.borrow_mut().open = self.open;
        self.done = true;
    }
    fn is_finished(&self) -> bool {
        self.done
    }
    fn name(&self) -> &str {
        "set-claw"
    }
}

/// Operator drive, held while the (scripted) stick is deflected.
struct OperatorDrive {
    state: CommandState,
    drive: Rc<RefCell<Drivetrain>>,
    stick: Rc<Cell<i16>>,
}

impl Command for OperatorDrive {
    fn state(&self) -> &CommandState {
        &self.state
    }
    fn state_mut(&mut self) -> &mut CommandState {
        &mut self.state
    }
    fn execute(&mut self, _ctx: &mut Context<'_>) {
        self.drive.borrow_mut().power = self.stick.get();
    }
    fn is_finished(&self) -> bool {
        false
    }
    fn interrupted(&mut self, _ctx: &mut Context<'_>) {
        self.drive.borrow_mut().power = 0;
    }
    fn name(&self) -> &str {
        "operator-drive"
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("cmdbus-sim")
        .version("0.1.0")
        .author("Robot Systems Engineering Team")
        .about("Simulated robot control loop driving the cmdbus scheduler")
        .arg(
            Arg::with_name("ticks")
                .long("ticks")
                .value_name("N")
                .help("Ticks per control mode")
                .takes_value(true)
                .default_value("40"),
        )
        .arg(
            Arg::with_name("tick-ms")
                .long("tick-ms")
                .value_name("MS")
                .help("Tick period in milliseconds")
                .takes_value(true)
                .default_value("20"),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Dump scheduler stats as JSON on exit"),
        )
        .get_matches();

    let ticks: u32 = matches.value_of("ticks").unwrap_or("40").parse()?;
    let tick_ms: u64 = matches.value_of("tick-ms").unwrap_or("20").parse()?;

    println!("{}", "cmdbus robot simulator".bold());
    println!("======================");

    // Hardware-side state. The concrete handles stay with the commands; the
    // coerced handles are what the scheduler arbitrates over.
    let drivetrain = Rc::new(RefCell::new(Drivetrain::new()));
    let claw = Rc::new(RefCell::new(Claw { open: false }));
    let drivetrain_ref: SubsystemRef = drivetrain.clone();
    let claw_ref: SubsystemRef = claw.clone();

    let mut scheduler = Scheduler::new();
    scheduler.track_subsystem(&drivetrain_ref)?;
    scheduler.track_subsystem(&claw_ref)?;

    // Default command for the drivetrain; the scheduler forces priority 0
    // and the self-requirement when it seeds.
    let idle = command_ref(IdleDrive {
        state: CommandState::new(),
        drive: drivetrain.clone(),
    });
    drivetrain.borrow_mut().default = Some(idle.clone());

    // Autonomous routine: drive out, grab, close up while backing out.
    let forward = {
        let mut state = CommandState::with_priority(2);
        state.require(&drivetrain_ref);
        command_ref(DriveSegment {
            state,
            drive: drivetrain.clone(),
            power: 80,
            duration_ticks: 10,
            elapsed: 0,
            label: "drive-forward",
        })
    };
    let grab = {
        let mut state = CommandState::with_priority(2);
        state.require(&claw_ref);
        command_ref(SetClaw {
            state,
            claw: claw.clone(),
            open: false,
            done: false,
        })
    };
    let reverse = {
        let mut state = CommandState::with_priority(2);
        state.require(&drivetrain_ref);
        command_ref(DriveSegment {
            state,
            drive: drivetrain.clone(),
            power: -60,
            duration_ticks: 8,
            elapsed: 0,
            label: "drive-reverse",
        })
    };

    let mut routine = CommandGroup::named("auto-routine");
    routine.add_sequential(&forward, true);
    routine.add_sequential(&grab, true);
    routine.add_parallel(&reverse, true);
    let routine: CommandRef = Rc::new(RefCell::new(routine));

    // Teleop bindings: a scripted stick stands in for operator input.
    let stick = Rc::new(Cell::new(0i16));
    let operator = {
        let mut state = CommandState::with_priority(3);
        state.require(&drivetrain_ref);
        command_ref(OperatorDrive {
            state,
            drive: drivetrain.clone(),
            stick: stick.clone(),
        })
    };
    let trigger_stick = stick.clone();
    let mut deflected = Trigger::new(move || trigger_stick.get().abs() > 10);
    deflected.while_active(&operator, Action::Run);
    deflected.when_deactivated(&operator, Action::Stop);
    scheduler.add_listener(&listener_ref(deflected))?;

    let mut interval = time::interval(Duration::from_millis(tick_ms));

    println!("{} {}", "mode:".bold(), "autonomous".cyan());
    scheduler.reset(true);
    scheduler.run(&routine);
    for _ in 0..ticks {
        interval.tick().await;
        scheduler.update();
    }
    println!(
        "  routine scheduled: {}  drive power: {}  claw open: {}",
        scheduler.is_scheduled(&routine),
        drivetrain.borrow().power,
        claw.borrow().open,
    );

    println!("{} {}", "mode:".bold(), "teleop".cyan());
    scheduler.reset(true);
    for tick in 0..ticks {
        interval.tick().await;
        // Scripted operator: deflect the stick through the middle of the period.
        if tick > ticks / 4 && tick < (3 * ticks) / 4 {
            stick.set(64);
        } else {
            stick.set(0);
        }
        scheduler.update();
    }

    println!("{} {}", "mode:".bold(), "disabled".cyan());
    scheduler.reset(false);
    scheduler.update();

    let stats = scheduler.stats();
    println!("{}", "summary".bold());
    println!("  ticks:                {}", stats.ticks);
    println!(
        "  commands started:     {}",
        stats.commands_started.to_string().green()
    );
    println!(
        "  commands finished:    {}",
        stats.commands_finished.to_string().green()
    );
    println!(
        "  commands interrupted: {}",
        stats.commands_interrupted.to_string().yellow()
    );
    println!(
        "  groups finished:      {}",
        stats.groups_finished.to_string().green()
    );
    println!("  arbitration losses:   {}", stats.arbitration_losses);

    if matches.is_present("json") {
        println!("{}", serde_json::to_string_pretty(stats)?);
    }

    Ok(())
}
