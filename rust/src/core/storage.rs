// Small persisted session flags (`session_flags.json`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

use super::AppCore;

const FLAGS_FILE: &str = "session_flags.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct SessionFlags {
    /// Set by an explicit disconnect; suppresses auto-restore until the next connect.
    pub(crate) explicitly_disconnected: bool,
}

fn flags_path(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join(FLAGS_FILE)
}

pub(crate) fn load_session_flags(data_dir: &str) -> SessionFlags {
    std::fs::read(flags_path(data_dir))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

pub(crate) fn save_session_flags(data_dir: &str, flags: &SessionFlags) -> Result<(), StoreError> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(flags_path(data_dir), serde_json::to_vec(flags)?)?;
    Ok(())
}

impl AppCore {
    pub(super) fn explicitly_disconnected(&self) -> bool {
        load_session_flags(&self.data_dir).explicitly_disconnected
    }

    pub(super) fn persist_explicit_disconnect(&self, value: bool) {
        let flags = SessionFlags {
            explicitly_disconnected: value,
        };
        if let Err(e) = save_session_flags(&self.data_dir, &flags) {
            tracing::warn!(err = %e, "failed to persist session flags");
        }
    }
}
