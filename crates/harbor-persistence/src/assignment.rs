//! Durable assignment log.
//!
//! Each assignment table lives in its own file inside one data directory.
//! Writes go to a `.tmp` sibling first and are atomically renamed on
//! completion, so a crash mid-write never corrupts the previous copy.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::format::{self, FormatError};

/// The files kept by the assignment log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignmentFile {
    /// Full slot assignment table (controller and candidates).
    SlotsAllocation,
    /// Full replica assignment table (controller and candidates).
    SlotsReplicaAllocation,
    /// Owner → backing node index (controller and candidates).
    ReplicaNodeIds,
    /// This node's own primary ranges.
    NodeSlots,
    /// Ranges this node backs up for others.
    NodeSlotsReplicas,
}

impl AssignmentFile {
    pub const ALL: [AssignmentFile; 5] = [
        AssignmentFile::SlotsAllocation,
        AssignmentFile::SlotsReplicaAllocation,
        AssignmentFile::ReplicaNodeIds,
        AssignmentFile::NodeSlots,
        AssignmentFile::NodeSlotsReplicas,
    ];

    /// File name inside the data directory.
    pub fn file_name(self) -> &'static str {
        match self {
            AssignmentFile::SlotsAllocation => "slots_allocation",
            AssignmentFile::SlotsReplicaAllocation => "slots_replica_allocation",
            AssignmentFile::ReplicaNodeIds => "replica_node_ids",
            AssignmentFile::NodeSlots => "node_slots",
            AssignmentFile::NodeSlotsReplicas => "node_slots_replicas",
        }
    }
}

impl std::fmt::Display for AssignmentFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Reads and writes checksummed assignment files in one directory.
#[derive(Debug, Clone)]
pub struct AssignmentLog {
    dir: PathBuf,
}

impl AssignmentLog {
    /// Opens the log, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, FormatError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Returns the full path of an assignment file.
    pub fn path(&self, file: AssignmentFile) -> PathBuf {
        self.dir.join(file.file_name())
    }

    /// Atomically replaces `file` with a record holding `payload`.
    pub fn write(&self, file: AssignmentFile, payload: &[u8]) -> Result<(), FormatError> {
        let final_path = self.path(file);
        let tmp = TempFile::create(final_path.with_extension("tmp"))?;

        {
            let mut writer = BufWriter::new(&tmp.file);
            format::write_record(&mut writer, payload)?;
            writer.flush()?;
        }
        tmp.file.sync_all()?;
        tmp.persist(&final_path)?;

        debug!(file = %file, bytes = payload.len(), "assignment file written");
        Ok(())
    }

    /// Reads `file`. Returns `Ok(None)` when it has never been written.
    pub fn read(&self, file: AssignmentFile) -> Result<Option<Vec<u8>>, FormatError> {
        let f = match File::open(self.path(file)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(f);
        format::read_record(&mut reader).map(Some)
    }

}

/// A temp file that removes itself unless it was renamed into place.
struct TempFile {
    path: PathBuf,
    file: File,
    persisted: bool,
}

impl TempFile {
    fn create(path: PathBuf) -> io::Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file,
            persisted: false,
        })
    }

    fn persist(mut self, to: &Path) -> io::Result<()> {
        fs::rename(&self.path, to)?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.persisted {
            // best-effort cleanup of the incomplete temp file
            let _ = fs::remove_file(&self.path);
        }
    }
}
