use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// User choices remembered between sessions.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Preferences {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub audio_device_id: Option<String>,
    #[serde(default)]
    pub video_device_id: Option<String>,
}

/// JSON-backed preferences file (`preferences.json` in the data dir).
///
/// Writes are best-effort: a failed save is logged and the in-memory
/// value is kept.
pub struct PreferencesStore {
    prefs: Mutex<Preferences>,
    file_path: PathBuf,
}

impl PreferencesStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("preferences.json");
        let prefs = Self::load(&file_path);
        Self {
            prefs: Mutex::new(prefs),
            file_path,
        }
    }

    pub fn get(&self) -> Preferences {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.lock().display_name = name;
        self.save();
    }

    pub fn set_room_name(&self, room: Option<String>) {
        self.lock().room_name = room;
        self.save();
    }

    pub fn set_audio_device_id(&self, device_id: Option<String>) {
        self.lock().audio_device_id = device_id;
        self.save();
    }

    pub fn set_video_device_id(&self, device_id: Option<String>) {
        self.lock().video_device_id = device_id;
        self.save();
    }

    /// Forget both saved devices so the next join prompts again.
    pub fn reset_devices(&self) {
        {
            let mut prefs = self.lock();
            prefs.audio_device_id = None;
            prefs.video_device_id = None;
        }
        self.save();
    }

    fn lock(&self) -> MutexGuard<'_, Preferences> {
        self.prefs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self) {
        let prefs = self.get();
        if let Some(parent) = self.file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("cannot create preferences dir {}: {e}", parent.display());
                return;
            }
        }
        match serde_json::to_string_pretty(&prefs) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("cannot write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("cannot serialize preferences: {e}"),
        }
    }

    fn load(path: &Path) -> Preferences {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable preferences {}: {e}", path.display());
                Preferences::default()
            }),
            Err(_) => Preferences::default(),
        }
    }
}
