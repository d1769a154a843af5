//! Application settings
//!
//! Loaded from `firefly.json` in the working directory. A missing file means
//! defaults; a malformed file is logged and replaced by defaults rather than
//! aborting startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::effects::firefly::FireflyParams;
use crate::landmarks::LandmarkModel;

pub const SETTINGS_FILE: &str = "firefly.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Size of the particle pool, fixed for the session
    pub particle_count: usize,
    /// Landmark model driving the effect
    pub model: LandmarkModel,
    /// Maximum number of tracked objects to request from the detector
    pub max_tracked: u32,
    /// Render loop target frame rate
    pub target_fps: u32,
    /// Camera to open on the start gesture
    pub camera_index: u32,
    /// Requested capture resolution and frame rate
    pub camera_width: u32,
    pub camera_height: u32,
    pub camera_fps: u32,
    /// Physics tuning
    pub physics: FireflyParams,
    /// Pin the particle random source for reproducible runs
    pub seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            particle_count: 2000,
            model: LandmarkModel::default(),
            max_tracked: 2,
            target_fps: 60,
            camera_index: 0,
            camera_width: 1280,
            camera_height: 720,
            camera_fps: 30,
            physics: FireflyParams::default(),
            seed: None,
        }
    }
}

impl Settings {
    /// Load settings from `firefly.json`, falling back to defaults
    pub fn load() -> Self {
        Self::load_from(Path::new(SETTINGS_FILE))
    }

    fn load_from(path: &Path) -> Self {
        let settings = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
                Ok(settings) => {
                    log::info!("Loaded settings from {:?}", path);
                    settings
                }
                Err(e) => {
                    log::warn!("Ignoring malformed {:?}: {e}", path);
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        };
        settings.sanitized()
    }

    /// Clamp values the rest of the app assumes to be nonzero
    fn sanitized(mut self) -> Self {
        self.particle_count = self.particle_count.max(1);
        self.max_tracked = self.max_tracked.max(1);
        self.target_fps = self.target_fps.clamp(1, 240);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::firefly::SteeringLaw;

    #[test]
    fn test_parse_settings_with_steering_law() {
        let json = r#"{
            "particle_count": 500,
            "model": "pose",
            "physics": {
                "wind_scale": 1.5,
                "steering": { "law": "nudge", "factor": 10.0, "jitter": 4.0 }
            }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.particle_count, 500);
        assert_eq!(settings.model, LandmarkModel::Pose);
        assert_eq!(settings.physics.wind_scale, 1.5);
        assert_eq!(
            settings.physics.steering,
            SteeringLaw::Nudge {
                factor: 10.0,
                jitter: 4.0
            }
        );
        // Unspecified fields fall back to defaults
        assert_eq!(settings.max_tracked, 2);
        assert_eq!(settings.physics.max_grown_size, 50.0);
    }

    #[test]
    fn test_sanitize_rejects_zero_counts() {
        let settings = Settings {
            particle_count: 0,
            max_tracked: 0,
            target_fps: 0,
            ..Settings::default()
        }
        .sanitized();
        assert_eq!(settings.particle_count, 1);
        assert_eq!(settings.max_tracked, 1);
        assert_eq!(settings.target_fps, 1);
    }
}
