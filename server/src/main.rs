use std::time::{Duration, Instant};

use clap::Parser;
use glam::Vec3;
use log::{error, info};

use server::{ServerConfig, ServerEngine};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "7777")]
    port: u16,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// World name; saves land under <data-dir>/saves/<world>
    #[arg(short, long, default_value = "world")]
    world: String,

    /// Directory holding save data
    #[arg(short, long, default_value = "./data")]
    data_dir: String,

    /// Seconds between autosaves (0 disables autosaving)
    #[arg(long, default_value = "60")]
    autosave: u64,

    /// Spawn position for fresh player avatars, as x,y,z
    #[arg(long, default_value = "0,0,0")]
    spawn: String,

    /// Prefab instantiated for a player's own avatar
    #[arg(long, default_value = "player")]
    player_prefab: String,

    /// Prefab other clients instantiate for that avatar (defaults to the
    /// local one)
    #[arg(long)]
    player_remote_prefab: Option<String>,

    /// Interest radius for clients that never send a render range
    #[arg(long, default_value = "50.0")]
    render_range: f32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        world_name: args.world.clone(),
        data_dir: args.data_dir.clone().into(),
        spawn_position: parse_spawn(&args.spawn)?,
        player_local_prefab: args.player_prefab.clone(),
        player_remote_prefab: args
            .player_remote_prefab
            .clone()
            .unwrap_or_else(|| args.player_prefab.clone()),
        default_render_range: args.render_range,
    };

    let mut engine = ServerEngine::new(&format!("{}:{}", args.host, args.port), config)?;
    info!(
        "World '{}' up at {} ticks/s, autosave every {}s",
        args.world, args.tick_rate, args.autosave
    );

    let tick = Duration::from_secs_f32(1.0 / args.tick_rate as f32);
    let autosave = (args.autosave > 0).then(|| Duration::from_secs(args.autosave));
    let mut last_save = Instant::now();

    loop {
        let started = Instant::now();
        engine.tick();

        if let Some(interval) = autosave {
            if last_save.elapsed() >= interval {
                match engine.save() {
                    Ok(()) => info!("Autosaved world '{}'", args.world),
                    Err(e) => error!("Autosave failed: {}", e),
                }
                last_save = Instant::now();
            }
        }

        let elapsed = started.elapsed();
        if elapsed < tick {
            std::thread::sleep(tick - elapsed);
        }
    }
}

/// Parses "x,y,z" into a vector.
fn parse_spawn(text: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = text.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("spawn must be x,y,z, got '{}'", text));
    }
    let mut components = [0.0f32; 3];
    for (slot, part) in components.iter_mut().zip(&parts) {
        *slot = part
            .trim()
            .parse()
            .map_err(|e| format!("bad spawn component '{}': {}", part, e))?;
    }
    Ok(Vec3::from_array(components))
}
