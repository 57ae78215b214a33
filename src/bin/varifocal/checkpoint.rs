use log::info;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};
use tch::nn::VarStore;
use thiserror::Error;

const EXTENSION: &str = "ot";
/// Records the file name of the last checkpoint saved into a directory.
const STATE_FILE: &str = "checkpoint";
const STATE_KEY: &str = "model_checkpoint_path";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("no checkpoint found in {0:?}")]
    NotFound(PathBuf),
    #[error("tch error: {0:?}")]
    Tch(#[from] tch::TchError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Splits `<prefix>-<step>.ot` into its prefix and step.
pub fn parse_checkpoint_name(path: &Path) -> Option<(String, usize)> {
    if path.extension()? != EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (prefix, step) = stem.rsplit_once('-')?;
    Some((prefix.to_owned(), step.parse().ok()?))
}

fn list_checkpoints(dir: &Path) -> Result<Vec<(String, usize, PathBuf)>, CheckpointError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some((prefix, step)) = parse_checkpoint_name(&path) {
            checkpoints.push((prefix, step, path));
        }
    }
    checkpoints.sort_by_key(|(_, step, _)| *step);

    Ok(checkpoints)
}

fn read_state(dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    let state = dir.join(STATE_FILE);
    if !state.is_file() {
        return Ok(None);
    }

    let text = std::fs::read_to_string(state)?;
    let name = text.lines().find_map(|line| {
        let value = line.strip_prefix(STATE_KEY)?.trim_start().strip_prefix(':')?;
        Some(value.trim().trim_matches('"').to_owned())
    });

    Ok(name
        .map(|name| dir.join(name))
        .filter(|path| path.is_file() && parse_checkpoint_name(path).is_some()))
}

fn write_state(dir: &Path, path: &Path) -> Result<(), CheckpointError> {
    let name = path.file_name().map(|name| name.to_string_lossy()).unwrap_or_default();
    std::fs::write(dir.join(STATE_FILE), format!("{}: \"{}\"\n", STATE_KEY, name))?;
    Ok(())
}

/// Last checkpoint saved into `dir`. Without a state file, or when it names a
/// missing file, the checkpoint with the highest step, whatever its prefix.
pub fn latest(dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    if let Some(path) = read_state(dir)? {
        return Ok(Some(path));
    }
    Ok(list_checkpoints(dir)?.pop().map(|(_, _, path)| path))
}

/// Loads the newest checkpoint of `dir` into `vs`.
pub fn restore(vs: &mut VarStore, dir: &Path) -> Result<PathBuf, CheckpointError> {
    let path = latest(dir)?.ok_or_else(|| CheckpointError::NotFound(dir.to_path_buf()))?;
    vs.load(&path)?;
    info!("model restored from {:?}", path);
    Ok(path)
}

/// Saves numbered checkpoints, keeping only the newest `max_to_keep`.
#[derive(Debug)]
pub struct Checkpointer {
    dir: PathBuf,
    prefix: String,
    max_to_keep: usize,
    kept: VecDeque<PathBuf>,
}

impl Checkpointer {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: &str,
        max_to_keep: usize,
    ) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        // pick up checkpoints of an earlier run so they count towards the limit
        let kept = list_checkpoints(&dir)?
            .into_iter()
            .filter(|(p, _, _)| p == prefix)
            .map(|(_, _, path)| path)
            .collect();

        Ok(Self {
            dir,
            prefix: prefix.to_owned(),
            max_to_keep,
            kept,
        })
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{}-{}.{}", self.prefix, step, EXTENSION))
    }

    pub fn save(&mut self, vs: &VarStore, step: usize) -> Result<PathBuf, CheckpointError> {
        let path = self.path_for(step);
        vs.save(&path)?;
        write_state(&self.dir, &path)?;

        self.kept.retain(|kept| kept != &path);
        self.kept.push_back(path.clone());
        while self.kept.len() > self.max_to_keep.max(1) {
            if let Some(old) = self.kept.pop_front() {
                if old.exists() {
                    std::fs::remove_file(&old)?;
                }
            }
        }

        Ok(path)
    }
}
