use std::{fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// Requested card state for the load/unload knobs and for explicit
// switch commands
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardState {
    On,
    Off,
    #[default]
    Unchanged,
}

// Daemon configuration:
// - load_state: card state applied right after initialization
// - unload_state: card state applied during shutdown
// - skip_optimus_dsm: skip the Optimus _DSM probe and go straight to
//   the legacy protocol (quirk knob for firmware with a broken
//   Optimus handshake)
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub load_state: CardState,
    pub unload_state: CardState,
    pub skip_optimus_dsm: bool,
}

impl Config {
    // Parse the Json configuration file, falling back to the defaults
    // when no file exists at the given path
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No configuration file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        debug!("Parsing config file at: {:?}", path);

        let file = File::open(path)
            .with_context(|| "Failed to open Json configuration file")?;
        let buf = BufReader::new(file);

        serde_json::from_reader(buf)
            .with_context(|| "Failed to parse Json configuration file")
    }
}
