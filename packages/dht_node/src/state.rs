//! The JSON state document a host can persist between runs.

use crate::errors::{ErrorKind, Result};
use failure::ResultExt;
use routing_table::NodeSnapshot;
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// `{K, id, nodes}`: bucket capacity, the node's own ID in hex, and the
/// flat contact list.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct DhtState {
    #[serde(rename = "K")]
    pub k: usize,

    pub id: String,

    pub nodes: Vec<NodeSnapshot>,
}

impl DhtState {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|_| ErrorKind::MalformedState)?;

        fs::write(path, json).with_context(|_| ErrorKind::StateFile {
            path: path.display().to_string(),
        })?;

        Ok(())
    }

    pub fn load(path: &Path) -> Result<DhtState> {
        let json = fs::read_to_string(path).with_context(|_| ErrorKind::StateFile {
            path: path.display().to_string(),
        })?;

        Ok(serde_json::from_str(&json).map_err(|_| ErrorKind::MalformedState)?)
    }
}
