//! Per event type resume points.
//!
//! A checkpoint maps every event type to the timestamp the next run should
//! start from: one past the highest timestamp this process has attempted to
//! publish. Values only ever move forward. The whole mapping is persisted as
//! a single JSON object and replaced atomically, so a reader sees either the
//! previous checkpoint or the new one, never a torn write.
use crate::datapoint::{EventType, Timestamp};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::error;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

/// Checkpoint load and flush errors.
#[derive(Debug)]
pub enum CheckpointError {
    /// The checkpoint file could not be read or written.
    Io(io::Error),
    /// The checkpoint file exists but is not a JSON object of integers.
    Malformed(serde_json::Error),
    /// The checkpoint could not be serialized.
    Encoding(serde_json::Error),
    /// The checkpoint key does not name a plain file.
    InvalidKey(String),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CheckpointError::Io(ref e) => write!(f, "checkpoint i/o error: {}", e),
            CheckpointError::Malformed(ref e) => write!(f, "malformed checkpoint: {}", e),
            CheckpointError::Encoding(ref e) => {
                write!(f, "could not encode checkpoint: {}", e)
            }
            CheckpointError::InvalidKey(ref key) => {
                write!(f, "checkpoint key {:?} is not a plain file name", key)
            }
        }
    }
}

impl error::Error for CheckpointError {}

impl From<io::Error> for CheckpointError {
    fn from(e: io::Error) -> CheckpointError {
        CheckpointError::Io(e)
    }
}

/// Check that `key` names a single file inside the checkpoint directory.
///
/// Empty keys, `.` and `..`, and anything holding a path separator or NUL
/// are refused.
pub fn validate_key(key: &str) -> Result<(), CheckpointError> {
    let invalid = || CheckpointError::InvalidKey(key.to_string());
    if key.is_empty() || key.contains(|c: char| c == '/' || c == '\\' || c == '\0') {
        return Err(invalid());
    }
    let mut components = Path::new(key).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == OsStr::new(key) => Ok(()),
        _ => Err(invalid()),
    }
}

/// Next timestamp to start from, per event type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint {
    time_starts: BTreeMap<EventType, Timestamp>,
}

impl Checkpoint {
    /// An empty checkpoint.
    pub fn new() -> Checkpoint {
        Checkpoint::default()
    }

    /// Read the checkpoint stored at `path`. A missing file is an empty
    /// checkpoint.
    pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let fp = match File::open(path) {
            Ok(fp) => fp,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No checkpoint at {}, starting empty", path.display());
                return Ok(Checkpoint::new());
            }
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint =
            serde_json::from_reader(io::BufReader::new(fp)).map_err(|e| {
                if e.is_io() {
                    CheckpointError::Io(e.into())
                } else {
                    CheckpointError::Malformed(e)
                }
            })?;
        trace!(
            "Loaded checkpoint of {} event types from {}",
            checkpoint.len(),
            path.display()
        );
        Ok(checkpoint)
    }

    /// The next start of `event_type`, if it has ever been advanced.
    pub fn get(&self, event_type: &str) -> Option<Timestamp> {
        self.time_starts.get(event_type).cloned()
    }

    /// Record that `event_type` was attempted up to and including
    /// `max_seen`.
    ///
    /// The next start moves to `max_seen + 1` unless it is already at or past
    /// it. Returns true if the value moved.
    pub fn advance(&mut self, event_type: &str, max_seen: Timestamp) -> bool {
        let next = max_seen.saturating_add(1);
        match self.time_starts.get_mut(event_type) {
            Some(start) => {
                if next > *start {
                    *start = next;
                    true
                } else {
                    false
                }
            }
            None => {
                self.time_starts.insert(event_type.to_string(), next);
                true
            }
        }
    }

    /// Persist to `path`, replacing whatever is there.
    ///
    /// The checkpoint is written to a sibling temporary file, synced and then
    /// renamed over `path`.
    pub fn flush(&self, path: &Path) -> Result<(), CheckpointError> {
        let buf = serde_json::to_vec(self).map_err(CheckpointError::Encoding)?;
        let tmp = tmp_path(path);
        {
            let mut fp = File::create(&tmp)?;
            fp.write_all(&buf)?;
            fp.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(
            "Flushed checkpoint of {} event types to {}",
            self.len(),
            path.display()
        );
        Ok(())
    }

    /// Iterate event types and their next starts, in event type order.
    pub fn iter(&self) -> btree_map::Iter<EventType, Timestamp> {
        self.time_starts.iter()
    }

    /// Number of event types tracked.
    pub fn len(&self) -> usize {
        self.time_starts.len()
    }

    /// True if no event type has been advanced.
    pub fn is_empty(&self) -> bool {
        self.time_starts.is_empty()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(OsString::new);
    name.push(".tmp");
    path.with_file_name(name)
}
