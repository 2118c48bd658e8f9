//! Hidden-conversation markers: a local key-value seam plus a JSON file default.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use crate::state::{now_millis, Address, HiddenMarker};

pub trait HiddenConversationStore: Send + Sync + 'static {
    fn get(&self) -> Vec<HiddenMarker>;
    fn add(&self, marker: HiddenMarker) -> Result<(), StoreError>;
    fn remove(&self, peer: &Address, group_name: Option<&str>) -> Result<(), StoreError>;
}

pub type SharedHiddenStore = Arc<dyn HiddenConversationStore>;

pub fn is_hidden(markers: &[HiddenMarker], peer: &Address, group_name: Option<&str>) -> bool {
    markers.iter().any(|m| m.matches(peer, group_name))
}

pub fn marker_for(peer: &Address, group_name: Option<&str>) -> HiddenMarker {
    HiddenMarker {
        peer_address: peer.clone(),
        group_name: group_name.map(ToString::to_string),
        hidden_at: now_millis(),
    }
}

/// `<data_dir>/hidden_conversations.json`. Unreadable or corrupt files read as empty.
pub struct JsonHiddenStore {
    path: PathBuf,
    // Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl JsonHiddenStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("hidden_conversations.json"),
            lock: Mutex::new(()),
        }
    }

    fn read(&self) -> Vec<HiddenMarker> {
        let Ok(data) = std::fs::read(&self.path) else {
            return vec![];
        };
        serde_json::from_slice(&data).unwrap_or_default()
    }

    fn write(&self, markers: &[HiddenMarker]) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, serde_json::to_vec(markers)?)?;
        Ok(())
    }
}

impl HiddenConversationStore for JsonHiddenStore {
    fn get(&self) -> Vec<HiddenMarker> {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.read()
    }

    fn add(&self, marker: HiddenMarker) -> Result<(), StoreError> {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut markers = self.read();
        markers.retain(|m| !m.matches(&marker.peer_address, marker.group_name.as_deref()));
        markers.push(marker);
        self.write(&markers)
    }

    fn remove(&self, peer: &Address, group_name: Option<&str>) -> Result<(), StoreError> {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut markers = self.read();
        let before = markers.len();
        markers.retain(|m| !m.matches(peer, group_name));
        if markers.len() == before {
            return Ok(());
        }
        self.write(&markers)
    }
}
