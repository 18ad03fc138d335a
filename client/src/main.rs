use std::time::{Duration, Instant};

use clap::Parser;
use glam::Vec3;
use log::info;

use client::{ConnectionStatus, CreateParams, EntityBehavior, EntityCtx, PrefabRegistry, Session};
use shared::schema::FieldRegistry;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:7777")]
    server: String,

    /// Login name
    #[arg(short, long, default_value = "wanderer")]
    username: String,

    /// Login password
    #[arg(short, long, default_value = "hunter2")]
    password: String,

    /// Interest radius requested from the server
    #[arg(short, long, default_value = "50.0")]
    render_range: f32,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Stop after this many seconds (0 runs forever)
    #[arg(long, default_value = "0")]
    run_for: u64,

    /// Radius of the demo walk circle
    #[arg(long, default_value = "8.0")]
    orbit: f32,
}

/// Demo avatar: walks a fixed circle when it is ours, and counts its laps
/// in a replicated field so every observer sees the same number.
struct DemoPlayer {
    orbit: f32,
    heading: f32,
}

impl EntityBehavior for DemoPlayer {
    fn register_fields(&mut self, registry: &mut FieldRegistry) {
        let laps = registry.add_int("laps", 0);
        registry.on_change(laps, |value| info!("Laps now {:?}", value));
    }

    fn on_network_tick(&mut self, ctx: &mut EntityCtx) {
        if !ctx.local {
            return;
        }
        let before = self.heading;
        self.heading += ctx.dt * 0.5;
        ctx.transform.position = Vec3::new(
            self.heading.cos() * self.orbit,
            0.0,
            self.heading.sin() * self.orbit,
        );
        let full_turn = std::f32::consts::TAU;
        if (before % full_turn) > (self.heading % full_turn) {
            let laps = ctx.fields.by_index(3).as_int();
            ctx.fields.by_index_mut(3).set((laps + 1).into());
        }
    }
}

/// Scenery the demo can bump into; replicated but inert.
struct Scenery;

impl EntityBehavior for Scenery {}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let orbit = args.orbit;
    let mut prefabs = PrefabRegistry::new();
    prefabs.register("player", move || {
        Box::new(DemoPlayer {
            orbit,
            heading: 0.0,
        })
    });
    prefabs.register("rock", || Box::new(Scenery));

    let mut session = Session::new(prefabs);
    session.set_render_range(args.render_range);
    session.connect(&args.server, &args.username, &args.password)?;
    info!("Connected to {} as '{}'", args.server, args.username);

    let tick = Duration::from_secs_f32(1.0 / args.tick_rate as f32);
    let deadline = (args.run_for > 0).then(|| Instant::now() + Duration::from_secs(args.run_for));
    let mut last_status = session.status();
    let mut last_report = Instant::now();
    let mut placed_rock = false;

    while session.is_connected() {
        let started = Instant::now();
        session.tick(tick.as_secs_f32());

        let status = session.status();
        if status != last_status {
            info!("Session status: {}", status);
            last_status = status;
        }
        if status == ConnectionStatus::Connected && !placed_rock {
            let rock = session.create(CreateParams::new("rock", Vec3::new(3.0, 0.0, 3.0)));
            info!("Placed a rock near spawn (provisional id {})", rock);
            placed_rock = true;
        }
        if last_report.elapsed() >= Duration::from_secs(2) {
            info!(
                "{} entities in view, player id {:?}",
                session.entity_count(),
                session.player_id()
            );
            last_report = Instant::now();
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        let elapsed = started.elapsed();
        if elapsed < tick {
            std::thread::sleep(tick - elapsed);
        }
    }

    if session.is_connected() {
        session.disconnect()?;
    }
    info!("Session ended: {}", session.status());
    Ok(())
}
