//! World persistence: one file per representation.
//!
//! Files live under `<data_dir>/saves/<world_name>/` and are named
//! `<order>_<tag>[_<username>]` with tag `player`, `rep`, or `inrep`. The
//! order prefix increases strictly in parent-before-child order, so loading
//! files in numeric order always finds a representation's parent already
//! registered. File contents are exactly the representation's full wire
//! serialization, the same bytes a CREATE_LOCAL payload carries.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use thiserror::Error;

use shared::message::RepSnapshot;

use crate::representation::Representation;
use crate::world::World;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed save file name '{0}'")]
    BadFileName(String),
    #[error("save file '{0}' references parent {1} which was not loaded first")]
    MissingParent(String, i32),
}

pub fn save_dir(data_dir: &Path, world_name: &str) -> PathBuf {
    data_dir.join("saves").join(world_name)
}

/// Writes every representation to disk: connected players first (file names
/// carry the username), then the remaining active representations, then
/// inactive (logged-out) players. Each root's whole subtree is written
/// top-down before the next root. The directory is rebuilt from scratch so
/// deleted entities do not survive as stale files.
pub fn save_world(world: &World, data_dir: &Path, world_name: &str) -> Result<(), PersistError> {
    let dir = save_dir(data_dir, world_name);
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;

    let username_of: HashMap<i32, &str> = world
        .players()
        .iter()
        .map(|(username, &id)| (id, username.as_str()))
        .collect();
    let mut player_roots: Vec<i32> = world
        .active_root_ids()
        .into_iter()
        .filter(|id| username_of.contains_key(id))
        .collect();
    player_roots.sort_by_key(|id| username_of[id]);

    let mut order = 0usize;
    for root in &player_roots {
        let tag = format!("player_{}", username_of[root]);
        write_subtree(world, &dir, *root, &tag, &mut order)?;
    }
    for root in world.active_root_ids() {
        if !username_of.contains_key(&root) {
            write_subtree(world, &dir, root, "rep", &mut order)?;
        }
    }
    for root in world.inactive_root_ids() {
        let tag = match username_of.get(&root) {
            Some(username) => format!("inrep_{}", username),
            None => "inrep".to_owned(),
        };
        write_subtree(world, &dir, root, &tag, &mut order)?;
    }

    info!("Saved {} representations to {}", order, dir.display());
    Ok(())
}

/// Loads a saved world, or returns `Ok(None)` if no save directory exists.
///
/// Players load into the inactive set regardless of the state they were
/// saved in: nobody is connected when the server starts. The world's id
/// counter ends up past every loaded id.
pub fn load_world(data_dir: &Path, world_name: &str) -> Result<Option<World>, PersistError> {
    let dir = save_dir(data_dir, world_name);
    if !dir.exists() {
        return Ok(None);
    }

    let mut files: Vec<(u64, String, Option<String>, PathBuf)> = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let (order, tag, username) = parse_file_name(&name)?;
        files.push((order, tag, username, entry.path()));
    }
    files.sort_by_key(|(order, _, _, _)| *order);

    let mut world = World::new();
    for (_, tag, username, path) in files {
        let bytes = fs::read(&path)?;
        let rep = Representation::from_snapshot(RepSnapshot::decode(&bytes));
        let id = rep.network_id;
        if let Some(parent_id) = rep.parent {
            if !world.contains(parent_id) {
                let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
                return Err(PersistError::MissingParent(name, parent_id));
            }
        }
        world.insert(rep, tag == "rep");
        if let Some(username) = username {
            world.bind_player(&username, id);
        }
    }

    info!(
        "Loaded {} representations for world '{}' ({} players)",
        world.rep_count(),
        world_name,
        world.players().len()
    );
    Ok(Some(world))
}

fn write_subtree(
    world: &World,
    dir: &Path,
    root: i32,
    root_tag: &str,
    order: &mut usize,
) -> Result<(), PersistError> {
    for id in world.subtree_top_down(root) {
        let Some(rep) = world.get(id) else { continue };
        let tag = if id == root { root_tag } else { "rep" };
        let path = dir.join(format!("{}_{}", order, tag));
        fs::write(path, rep.snapshot().encode())?;
        *order += 1;
    }
    Ok(())
}

fn parse_file_name(name: &str) -> Result<(u64, String, Option<String>), PersistError> {
    let mut parts = name.splitn(3, '_');
    let order = parts
        .next()
        .and_then(|part| part.parse::<u64>().ok())
        .ok_or_else(|| PersistError::BadFileName(name.to_owned()))?;
    let tag = match parts.next() {
        Some(tag @ ("player" | "rep" | "inrep")) => tag.to_owned(),
        _ => return Err(PersistError::BadFileName(name.to_owned())),
    };
    let username = parts.next().map(str::to_owned);
    Ok((order, tag, username))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use shared::field::FieldValue;
    use tempfile::TempDir;

    #[test]
    fn test_load_without_save_directory_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(load_world(dir.path(), "nowhere").unwrap().is_none());
    }

    #[test]
    fn test_save_load_reproduces_structure_and_fields() {
        let dir = TempDir::new().unwrap();
        let mut world = World::new();

        // A connected player with a child, a plain active rep, and a
        // logged-out player.
        let player = world.allocate_id();
        world.insert(make_rep(player, None, Vec3::new(1.0, 2.0, 3.0)), true);
        world.bind_player("ada", player);
        let child = world.allocate_id();
        world.insert(make_rep(child, Some(player), Vec3::ZERO), true);
        let rock = world.allocate_id();
        world.insert(make_rep(rock, None, Vec3::new(-9.0, 0.0, 4.0)), true);
        let parked = world.allocate_id();
        world.insert(make_rep(parked, None, Vec3::splat(7.0)), false);
        world.bind_player("grace", parked);
        world.get_mut(rock).unwrap().set_field(3, FieldValue::Int(42).encode());

        save_world(&world, dir.path(), "earth").unwrap();
        let loaded = load_world(dir.path(), "earth").unwrap().unwrap();

        assert_eq!(loaded.rep_count(), 4);
        assert_eq!(loaded.get(child).unwrap().parent, Some(player));
        assert_eq!(loaded.get(player).unwrap().children, vec![child]);
        assert_eq!(loaded.get(rock).unwrap().field_bytes(3), FieldValue::Int(42).encode().as_slice());
        assert_eq!(loaded.get(player).unwrap().position(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(loaded.player_id("ada"), Some(player));
        assert_eq!(loaded.player_id("grace"), Some(parked));

        // Players park inactive on load; the plain rep stays active.
        assert_eq!(loaded.active_root_ids(), vec![rock]);
        assert_eq!(loaded.inactive_root_ids(), vec![player, parked]);
    }

    #[test]
    fn test_loaded_world_seeds_id_counter_past_saved_ids() {
        let dir = TempDir::new().unwrap();
        let mut world = World::new();
        world.insert(make_rep(31, None, Vec3::ZERO), true);
        save_world(&world, dir.path(), "earth").unwrap();

        let mut loaded = load_world(dir.path(), "earth").unwrap().unwrap();
        assert!(loaded.allocate_id() > 31);
    }

    #[test]
    fn test_file_order_is_parent_before_child() {
        let dir = TempDir::new().unwrap();
        let mut world = World::new();
        world.insert(make_rep(1, None, Vec3::ZERO), true);
        world.insert(make_rep(2, Some(1), Vec3::ZERO), true);
        world.insert(make_rep(3, Some(2), Vec3::ZERO), true);
        save_world(&world, dir.path(), "earth").unwrap();

        let mut names: Vec<(u64, i32)> = Vec::new();
        for entry in fs::read_dir(save_dir(dir.path(), "earth")).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().into_owned();
            let (order, _, _) = parse_file_name(&name).unwrap();
            let snap = RepSnapshot::decode(&fs::read(entry.path()).unwrap());
            names.push((order, snap.network_id));
        }
        names.sort();
        let ids: Vec<i32> = names.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_resave_replaces_stale_files() {
        let dir = TempDir::new().unwrap();
        let mut world = World::new();
        world.insert(make_rep(1, None, Vec3::ZERO), true);
        world.insert(make_rep(2, None, Vec3::ZERO), true);
        save_world(&world, dir.path(), "earth").unwrap();

        world.remove_subtree(2);
        save_world(&world, dir.path(), "earth").unwrap();

        let loaded = load_world(dir.path(), "earth").unwrap().unwrap();
        assert_eq!(loaded.rep_count(), 1);
        assert!(!loaded.contains(2));
    }

    #[test]
    fn test_malformed_file_name_is_an_error() {
        assert!(parse_file_name("banana").is_err());
        assert!(parse_file_name("0_banana").is_err());
        assert!(parse_file_name("x_rep").is_err());
        assert!(parse_file_name("3_player_ada").is_ok());
        assert!(parse_file_name("4_inrep").is_ok());
    }

    // HELPER FUNCTIONS

    fn make_rep(id: i32, parent: Option<i32>, position: Vec3) -> Representation {
        let fields = vec![
            FieldValue::Float(position.x).encode(),
            FieldValue::Float(position.y).encode(),
            FieldValue::Float(position.z).encode(),
            FieldValue::Int(0).encode(),
        ];
        Representation::new(id, parent, "rock".into(), "rock".into(), fields)
    }
}
