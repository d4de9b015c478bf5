use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{RoidbError, RoidbResult};
use crate::pipeline::config::FrcnConfig;
use crate::rcnn::roidb::RegionDatabase;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RoidbError {
    let path = path.to_path_buf();
    move |source| RoidbError::Io { path, source }
}

/// Identifies one built region database.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheKey {
    pub year: String,
    pub image_set: String,
    pub add_flipped: bool,
    pub overlap_thre: f32,
}

impl CacheKey {
    pub fn new(year: &str, image_set: &str, config: &FrcnConfig) -> Self {
        CacheKey {
            year: year.to_string(),
            image_set: image_set.to_string(),
            add_flipped: config.add_flipped,
            overlap_thre: config.overlap_thre,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "voc_{}_{}_flip_{}_ovlp_{}.json",
            self.year, self.image_set, self.add_flipped, self.overlap_thre
        )
    }
}

pub trait CacheStore {
    fn load(&self, key: &CacheKey) -> RoidbResult<Option<RegionDatabase>>;

    fn save(&self, key: &CacheKey, roidb: &RegionDatabase) -> RoidbResult<()>;
}

/// One serde_json file per key inside `dir`.
#[derive(Debug, Clone)]
pub struct JsonCacheStore {
    dir: PathBuf,
}

impl JsonCacheStore {
    pub fn new(dir: &Path) -> Self {
        JsonCacheStore {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl CacheStore for JsonCacheStore {
    fn load(&self, key: &CacheKey) -> RoidbResult<Option<RegionDatabase>> {
        let path = self.path(key);
        if !path.exists() {
            debug!(path = %path.display(), "no cached region database");
            return Ok(None);
        }
        let file = File::open(&path).map_err(|e| RoidbError::Io {
            path: path.clone(),
            source: e,
        })?;
        let roidb = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| RoidbError::Json { path, source: e })?;
        Ok(Some(roidb))
    }

    /// Writes to a sibling temporary file first and renames it into place.
    /// The temporary file is removed if either step fails.
    fn save(&self, key: &CacheKey, roidb: &RegionDatabase) -> RoidbResult<()> {
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        let path = self.path(key);
        let tmp_path = self.dir.join(format!("{}.tmp", key.file_name()));

        let result = write_json(&tmp_path, roidb)
            .and_then(|()| fs::rename(&tmp_path, &path).map_err(io_error(&path)));
        if let Err(e) = result {
            if tmp_path.exists() {
                if let Err(cleanup) = fs::remove_file(&tmp_path) {
                    warn!(path = %tmp_path.display(), error = %cleanup, "could not remove temporary cache file");
                }
            }
            return Err(e);
        }
        debug!(path = %path.display(), "region database cached");
        Ok(())
    }
}

fn write_json(path: &Path, roidb: &RegionDatabase) -> RoidbResult<()> {
    let file = File::create(path).map_err(io_error(path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, roidb).map_err(|e| RoidbError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    writer.flush().map_err(io_error(path))
}
