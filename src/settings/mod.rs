use clap::{Parser, value_parser};
use glam::DVec3;
use itertools::Itertools;
use std::str::FromStr;
use std::time::Duration;

use crate::builder::BuildProperties;
use crate::manager::Capabilities;

/// Producer side configuration.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// How long the producer sleeps when there is nothing to do before re-checking its state.
    pub idle_wait: Duration,
    pub edit_lock_attempts: u32,
    pub edit_lock_backoff: Duration,
    pub capabilities: Capabilities,
    pub thread_name: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_millis(100),
            edit_lock_attempts: 50,
            edit_lock_backoff: Duration::from_millis(1),
            capabilities: Capabilities::empty(),
            thread_name: "Scene Manager".to_string(),
        }
    }
}

/// Consumer side configuration.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_frames_per_tick: u32,
    pub max_builds_per_tick: u32,
    pub request_timeout: Duration,
    /// How long [`crate::dispatch::Dispatcher::tick`] waits for a frame. Zero never blocks.
    pub fetch_timeout: Duration,
    /// Node types that intentionally have no visual representation. Missing factories for these
    /// are not worth a warning.
    pub no_visual_types: Vec<String>,
    pub build_properties: BuildProperties,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub screen_width: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_frames_per_tick: 10,
            max_builds_per_tick: 500,
            request_timeout: Duration::from_secs(2),
            fetch_timeout: Duration::ZERO,
            no_visual_types: vec!["Group".to_string(), "Lod".to_string(), "Switch".to_string()],
            build_properties: BuildProperties::default(),
            viewport_width: 1000,
            viewport_height: 1000,
            screen_width: 1000,
        }
    }
}

impl DispatchSettings {
    pub fn has_visual(&self, type_name: &str) -> bool {
        !self.no_visual_types.iter().any(|ty| ty == type_name)
    }
}

#[derive(Parser, Debug)]
#[command(name = "scenesync")]
#[command(version)]
#[command(about = "Streams a demo scene graph through the producer/consumer synchronisation core")]
pub struct CliArgs {
    /// Map urls to load, can be given multiple times.
    #[arg(long = "map", env = "SCENESYNC_MAP", value_delimiter = ',', default_value = "demo://city")]
    pub maps: Vec<String>,

    #[arg(long, value_parser = value_parser!(Vector3), default_value = "(336424, 131, -6580704)")]
    pub camera: Vector3,

    #[arg(long, default_value_t = 20)]
    pub ticks: u32,

    #[arg(long, default_value_t = 500)]
    pub max_builds: u32,

    #[arg(long, default_value_t = false)]
    pub omni_traverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<Vector3> for DVec3 {
    fn from(value: Vector3) -> Self {
        DVec3::new(value.x, value.y, value.z)
    }
}

fn trim_brackets(input: &str) -> &str {
    let mut chars = input.chars();
    chars.next(); // skip first
    chars.next_back(); // skip last
    chars.as_str()
}

impl FromStr for Vector3 {
    type Err = String;

    // (-a, b, c)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let string: String = s.chars().filter(|&c| !c.is_whitespace()).collect();
        if !string.starts_with('(') || !string.ends_with(')') {
            return Err("Missing start or end bracket".to_string());
        }

        let splits = trim_brackets(string.as_str()).split(',').collect_vec();
        if splits.len() != 3 {
            return Err(format!(
                "Comma splitting resulted in {} splits, not 3!",
                splits.len()
            ));
        }

        let components: Vec<f64> = splits
            .iter()
            .map(|&split| {
                split
                    .parse::<f64>()
                    .map_err(|err| format!("Failed to parse component {:?}: {}", split, err))
            })
            .try_collect()?;

        Ok(Vector3 {
            x: components[0],
            y: components[1],
            z: components[2],
        })
    }
}
