//! Runtime font loading for label rendering.

use rusttype::Font;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Fallback locations scanned when no font is configured.
const SYSTEM_FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/roboto/unhinted/RobotoTTF/Roboto-Regular.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/noto/NotoSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
];

/// Loads and caches fonts by path.
///
/// Failed loads are cached too, so a missing font file is hit on disk once
/// per run, not once per composed tile.
pub struct FontStore {
    default_path: Option<PathBuf>,
    cache: Mutex<HashMap<PathBuf, Option<Arc<Font<'static>>>>>,
}

impl FontStore {
    pub fn new(default_path: Option<PathBuf>) -> Self {
        Self {
            default_path,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a label's font reference: explicit path, then the configured
    /// default, then the first loadable system font.
    pub fn resolve(&self, path: Option<&Path>) -> Option<Arc<Font<'static>>> {
        if let Some(path) = path {
            if let Some(font) = self.load_cached(path) {
                return Some(font);
            }
        }
        if let Some(default) = self.default_path.clone() {
            if let Some(font) = self.load_cached(&default) {
                return Some(font);
            }
        }
        for candidate in SYSTEM_FONT_PATHS {
            if let Some(font) = self.load_cached(Path::new(candidate)) {
                return Some(font);
            }
        }
        None
    }

    fn load_cached(&self, path: &Path) -> Option<Arc<Font<'static>>> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(_) => return Self::load(path),
        };
        if let Some(entry) = cache.get(path) {
            return entry.clone();
        }
        let loaded = Self::load(path);
        cache.insert(path.to_path_buf(), loaded.clone());
        loaded
    }

    fn load(path: &Path) -> Option<Arc<Font<'static>>> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                debug!("Font {:?} not readable: {}", path, e);
                return None;
            }
        };
        match Font::try_from_vec(data) {
            Some(font) => {
                debug!("Loaded font {:?}", path);
                Some(Arc::new(font))
            }
            None => {
                warn!("Font {:?} could not be parsed", path);
                None
            }
        }
    }
}
