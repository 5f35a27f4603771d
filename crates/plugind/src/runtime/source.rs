//! Where a local plugin comes from.
//!
//! Package decoding lives outside this crate; a [`PluginSource`] only has to
//! supply the declaration to run and a checksum that keys the plugin's
//! working directory.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::RuntimeError;
use crate::config::PluginDeclaration;

pub trait PluginSource: Send + Sync {
    fn declaration(&self) -> &PluginDeclaration;

    /// Stable digest of the plugin contents.
    fn checksum(&self) -> Result<String, RuntimeError>;

    fn identity(&self) -> String {
        self.declaration().identity()
    }

    /// Whether the package signature was checked by the decoder.
    fn verified(&self) -> bool {
        false
    }
}

/// A configured declaration is its own source; its checksum is the sha256
/// of its JSON form, so any change to command, args or env gets a fresh
/// working directory.
impl PluginSource for PluginDeclaration {
    fn declaration(&self) -> &PluginDeclaration {
        self
    }

    fn checksum(&self) -> Result<String, RuntimeError> {
        let encoded =
            serde_json::to_vec(self).map_err(|e| RuntimeError::Source(e.to_string()))?;
        Ok(format!("{:x}", Sha256::digest(&encoded)))
    }
}

/// `<root>/<identity with ':' replaced by '-'>@<checksum>`.
pub fn working_path(root: &Path, source: &dyn PluginSource) -> Result<PathBuf, RuntimeError> {
    let identity = source.identity().replace(':', "-");
    let checksum = source.checksum()?;
    Ok(root.join(format!("{identity}@{checksum}")))
}
