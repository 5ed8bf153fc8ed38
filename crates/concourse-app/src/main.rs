use anyhow::Result;
use clap::Parser;
use concourse_app::{
    CommandReceiver, ControlHandle, SharedWorld, create_command_bus, drain_pending_commands,
    make_command_submit,
};
use concourse_core::{LayoutId, SimulationConfig, WorldState};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Fixed simulation step matching the render frame cadence.
const STEP_SECONDS: f32 = 1.0 / 60.0;

/// Ticks between progress log lines.
const REPORT_INTERVAL: u64 = 300;

#[derive(Debug, Parser)]
#[command(name = "concourse", about = "Headless crowd-simulation driver")]
struct Args {
    /// Builtin floor layout to load.
    #[arg(long, default_value_t = LayoutId::Gallery)]
    layout: LayoutId,

    /// Agent population target.
    #[arg(long, default_value_t = 24)]
    population: usize,

    /// Global simulation speed multiplier.
    #[arg(long, default_value_t = 1.0)]
    speed: f32,

    /// RNG seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Number of fixed-step ticks to run.
    #[arg(long, default_value_t = 3_600)]
    ticks: u64,

    /// Record agent trails while running.
    #[arg(long)]
    trails: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let world = bootstrap_world(&args)?;
    let (sender, receiver) = create_command_bus(64);
    let handle = ControlHandle::new(Arc::clone(&world), make_command_submit(sender));

    info!(
        layout = %args.layout,
        population = args.population,
        ticks = args.ticks,
        "starting concourse simulation"
    );
    run_loop(&world, &receiver, args.ticks);

    match handle.status() {
        Ok(status) => info!(
            tick = status.tick,
            agents = status.agent_count,
            inside = status.census.inside,
            waiting = status.census.waiting,
            "simulation finished"
        ),
        Err(error) => warn!(%error, "simulation finished without a final status"),
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn bootstrap_world(args: &Args) -> Result<SharedWorld> {
    let config = SimulationConfig {
        rng_seed: args.seed,
        population_target: args.population.max(1),
        speed_multiplier: if args.speed > 0.0 { args.speed } else { 1.0 },
        trails_visible: args.trails,
        ..SimulationConfig::default()
    };
    let world = WorldState::with_layout(config, args.layout)?;
    Ok(Arc::new(Mutex::new(world)))
}

fn run_loop(world: &SharedWorld, receiver: &CommandReceiver, ticks: u64) {
    for step in 0..ticks {
        let mut guard = match world.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("world mutex poisoned; stopping the run");
                return;
            }
        };
        drain_pending_commands(receiver, &mut guard);
        guard.tick(STEP_SECONDS);
        if step % REPORT_INTERVAL == 0 {
            if let Some(summary) = guard.history().last() {
                info!(
                    tick = summary.tick.0,
                    agents = summary.agent_count,
                    wandering = summary.census.wandering,
                    inside = summary.census.inside,
                    waiting = summary.census.waiting,
                    avg_speed = summary.average_speed,
                    "progress"
                );
            }
        }
    }
}
