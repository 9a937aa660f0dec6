use super::{Engine, ReadView, ScanIterator, Status, WriteBatch};
use crate::error::{Error, Result};

use fs4::FileExt as _;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read as _, Seek as _, SeekFrom, Write as _};
use std::ops::Bound;
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A very simple variant of BitCask, itself a very simple log-structured
/// key-value engine used e.g. by the Riak database. It is not compatible with
/// BitCask databases generated by other implementations. See:
/// https://riak.com/assets/bitcask-intro.pdf
///
/// BitCask writes key-value pairs to an append-only log file, and keeps a
/// mapping of keys to file positions in memory. All live keys must fit in
/// memory. Deletes write a tombstone value to the log file. To remove old
/// garbage, logs can be compacted by writing out a new log file containing
/// only live data.
///
/// Unlike the original paper, mutations are grouped into write batches that
/// are framed in the log: a frame either replays fully on startup or is
/// discarded as a torn write, which makes batches atomic across crashes. The
/// in-memory keydir is an ordered map, so scans come for free; snapshots
/// clone the keydir and read the immutable log tail through a shared file
/// handle.
pub struct BitCask {
    /// The active append-only log file.
    log: Log,
    /// Maps keys to a value position and length in the log file.
    keydir: KeyDir,
}

/// Maps keys to a value position and length in the log file.
type KeyDir = BTreeMap<Vec<u8>, (u64, u32)>;

impl BitCask {
    /// Opens or creates a BitCask database in the given file.
    pub fn new(path: PathBuf) -> Result<Self> {
        info!("Opening database {}", path.display());
        let mut log = Log::new(path)?;
        let keydir = log.build_keydir()?;
        Ok(Self { log, keydir })
    }

    /// Opens a BitCask database, and automatically compacts it if the amount
    /// of garbage exceeds the given ratio and byte size when opened.
    pub fn new_compact(path: PathBuf, garbage_min_fraction: f64, garbage_min_bytes: u64) -> Result<Self> {
        let mut s = Self::new(path)?;

        let status = s.status()?;
        if status.garbage_disk_size >= garbage_min_bytes
            && status.garbage_disk_size as f64 / status.total_disk_size as f64
                >= garbage_min_fraction
        {
            info!(
                "Compacting {} to remove {:.0}% garbage ({} MB out of {} MB)",
                s.log.path.display(),
                status.garbage_disk_size as f64 / status.total_disk_size as f64 * 100.0,
                status.garbage_disk_size / 1024 / 1024,
                status.total_disk_size / 1024 / 1024
            );
            s.compact()?;
            info!("Compacted {} to size {} MB", s.log.path.display(), s.log.size()? / 1024 / 1024);
        }

        Ok(s)
    }

    /// Writes out a new log file with the live entries of the current log
    /// file and replaces the current file with it.
    fn compact_log(&mut self) -> Result<()> {
        let mut tmp_path = self.log.path.clone();
        tmp_path.set_extension("new");
        let (mut new_log, new_keydir) = self.write_log(tmp_path)?;

        std::fs::rename(&new_log.path, &self.log.path)?;
        new_log.path = self.log.path.clone();

        self.log = new_log;
        self.keydir = new_keydir;
        Ok(())
    }

    /// Writes out a new log file at the given path with the live entries of
    /// the current log file.
    fn write_log(&mut self, path: PathBuf) -> Result<(Log, KeyDir)> {
        let mut new_keydir = KeyDir::new();
        let mut new_log = Log::new(path)?;
        new_log.file.set_len(0)?; // in case a previous compaction crashed

        // Write out each live entry as its own single-op frame.
        for (key, (pos, len)) in &self.keydir {
            let value = self.log.read_value(*pos, *len)?;
            let mut batch = WriteBatch::new();
            batch.put(key, value);
            let positions = new_log.write_frame(&batch, false)?;
            new_keydir.insert(key.clone(), positions[0].expect("put must have a position"));
        }
        new_log.file.sync_all()?;
        Ok((new_log, new_keydir))
    }
}

impl std::fmt::Display for BitCask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bitcask")
    }
}

impl Engine for BitCask {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.keydir.get(key).map(|(pos, len)| self.log.read_value(*pos, *len)).transpose()
    }

    fn write(&mut self, batch: WriteBatch, sync: bool) -> Result<()> {
        let positions = self.log.write_frame(&batch, sync)?;
        for ((key, _), position) in batch.ops.iter().zip(positions) {
            match position {
                Some(position) => {
                    self.keydir.insert(key.clone(), position);
                }
                None => {
                    self.keydir.remove(key);
                }
            }
        }
        Ok(())
    }

    fn scan_from(&mut self, start: &[u8]) -> Box<dyn ScanIterator + '_> {
        let log = &self.log;
        Box::new(
            self.keydir
                .range((Bound::Included(start.to_vec()), Bound::Unbounded))
                .map(move |(k, (pos, len))| Ok((k.clone(), log.read_value(*pos, *len)?))),
        )
    }

    fn snapshot(&mut self) -> Box<dyn ReadView> {
        Box::new(BitCaskSnapshot { file: self.log.file_handle(), keydir: self.keydir.clone() })
    }

    fn flush(&mut self) -> Result<()> {
        // Don't fsync in tests, to speed them up. It's tempting to only fsync
        // here and not in write(), but the fsync policy belongs to callers.
        #[cfg(not(test))]
        self.log.file.sync_all()?;
        Ok(())
    }

    fn checkpoint(&mut self, path: &Path) -> Result<()> {
        if path.exists() {
            return Err(Error::InvalidInput(format!(
                "checkpoint target {} already exists",
                path.display()
            )));
        }
        std::fs::create_dir_all(path)?;
        self.log.file.sync_all()?;
        let filename = self
            .log
            .path
            .file_name()
            .ok_or_else(|| Error::IO("log file has no name".to_string()))?;
        std::fs::copy(&self.log.path, path.join(filename))?;
        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        self.compact_log()
    }

    fn status(&mut self) -> Result<Status> {
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .iter()
            .map(|(key, (_, vlen))| (key.len() + *vlen as usize) as u64)
            .sum();
        let total_disk_size = self.log.size()?;
        let live_disk_size = size + 12 * keys; // account for length prefixes
        let garbage_disk_size = total_disk_size.saturating_sub(live_disk_size);
        Ok(Status {
            name: self.to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size,
            garbage_disk_size,
        })
    }
}

impl Drop for BitCask {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!("failed to flush log file: {err}")
        }
    }
}

/// A point-in-time view of a BitCask engine: a keydir copy plus a shared
/// handle on the log file. Entries referenced by the keydir are immutable
/// (the log is append-only and compaction writes a new file), so positional
/// reads through the old handle stay valid.
struct BitCaskSnapshot {
    file: Arc<File>,
    keydir: KeyDir,
}

impl ReadView for BitCaskSnapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.keydir
            .get(key)
            .map(|(pos, len)| {
                let mut value = vec![0; *len as usize];
                self.file.read_exact_at(&mut value, *pos)?;
                Ok(value)
            })
            .transpose()
    }

    fn scan_from(&self, start: &[u8]) -> Box<dyn ScanIterator + '_> {
        Box::new(self.keydir.range((Bound::Included(start.to_vec()), Bound::Unbounded)).map(
            move |(k, (pos, len))| {
                let mut value = vec![0; *len as usize];
                self.file.read_exact_at(&mut value, *pos)?;
                Ok((k.clone(), value))
            },
        ))
    }
}

/// A BitCask append-only log file, containing a sequence of write-batch
/// frames:
///
/// frame  = op-count u32 ‖ op*
/// op     = key-length u32 ‖ value-length i32 ‖ key ‖ value
///
/// A value length of -1 marks a tombstone (delete). All integers are
/// big-endian. A frame that is cut short by a crash is truncated on startup.
struct Log {
    /// Path to the log file.
    path: PathBuf,
    /// The opened file containing the log. Kept in an Arc so snapshots can
    /// share the handle for positional reads.
    file: Arc<File>,
}

impl Log {
    /// Opens a log file, or creates one if it does not exist. Takes out an
    /// exclusive lock on the file until it is closed, or errors if the lock
    /// is already held.
    fn new(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?
        }
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.try_lock_exclusive()?;
        Ok(Self { path, file: Arc::new(file) })
    }

    /// Returns a shared handle on the log file.
    fn file_handle(&self) -> Arc<File> {
        self.file.clone()
    }

    /// Returns the size of the log file.
    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Builds a keydir by scanning the log file. If a frame is incomplete
    /// (e.g. due to a crash before the full frame was written), the log file
    /// is truncated to the last complete frame.
    fn build_keydir(&mut self) -> Result<KeyDir> {
        let mut len_buf = [0u8; 4];
        let mut keydir = KeyDir::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(self.file.as_ref());
        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            let frame_start = pos;
            // Read the frame, returning the post-frame position on success.
            let result = (|| -> std::result::Result<u64, std::io::Error> {
                r.read_exact(&mut len_buf)?;
                let op_count = u32::from_be_bytes(len_buf);
                let mut pos = frame_start + 4;
                let mut updates = Vec::with_capacity(op_count as usize);
                for _ in 0..op_count {
                    r.read_exact(&mut len_buf)?;
                    let key_len = u32::from_be_bytes(len_buf);
                    r.read_exact(&mut len_buf)?;
                    let value_len = i32::from_be_bytes(len_buf);
                    let mut key = vec![0; key_len as usize];
                    r.read_exact(&mut key)?;
                    let value_pos = pos + 8 + key_len as u64;
                    if value_len >= 0 {
                        r.seek_relative(value_len as i64)?; // avoid discarding buffer
                        updates.push((key, Some((value_pos, value_len as u32))));
                        pos = value_pos + value_len as u64;
                    } else {
                        updates.push((key, None));
                        pos = value_pos;
                    }
                }
                // The frame is complete, apply it.
                for (key, position) in updates {
                    match position {
                        Some(position) => {
                            keydir.insert(key, position);
                        }
                        None => {
                            keydir.remove(&key);
                        }
                    }
                }
                Ok(pos)
            })();

            match result {
                Ok(new_pos) => pos = new_pos,
                // If a frame is torn at the end of the file, truncate it.
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!("Found incomplete frame at log offset {frame_start}, truncating file");
                    self.file.set_len(frame_start)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(keydir)
    }

    /// Reads a value from the log file.
    fn read_value(&self, value_pos: u64, value_len: u32) -> Result<Vec<u8>> {
        let mut value = vec![0; value_len as usize];
        self.file.read_exact_at(&mut value, value_pos)?;
        Ok(value)
    }

    /// Appends a write batch as a single frame, returning the position and
    /// length of each written value (None for tombstones). The frame is
    /// buffered in memory and written with a single system call, so a crash
    /// cannot persist part of it without the truncation check catching it.
    fn write_frame(&mut self, batch: &WriteBatch, sync: bool) -> Result<Vec<Option<(u64, u32)>>> {
        let mut file = self.file.as_ref();
        let frame_start = file.seek(SeekFrom::End(0))?;

        let mut len: usize = 4;
        for (key, value) in batch.iter() {
            len += 8 + key.len() + value.map_or(0, |v| v.len());
        }
        let mut frame = Vec::with_capacity(len);
        frame.extend_from_slice(&(batch.len() as u32).to_be_bytes());

        let mut positions = Vec::with_capacity(batch.len());
        for (key, value) in batch.iter() {
            frame.extend_from_slice(&(key.len() as u32).to_be_bytes());
            frame.extend_from_slice(&value.map_or(-1i32, |v| v.len() as i32).to_be_bytes());
            frame.extend_from_slice(key);
            let value_pos = frame_start + frame.len() as u64;
            if let Some(value) = value {
                frame.extend_from_slice(value);
                positions.push(Some((value_pos, value.len() as u32)));
            } else {
                positions.push(None);
            }
        }

        file.write_all(&frame)?;
        if sync {
            file.sync_data()?;
        }
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    super::super::engine::tests::test_engine!({
        let path = tempfile::TempDir::with_prefix("quarkdb")?.into_path().join("bitcask");
        BitCask::new(path)?
    });

    /// Writes various batches, reopens the database, and verifies the state
    /// survived.
    #[test]
    fn reopen_persists_batches() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("quarkdb")?;
        let path = dir.path().join("bitcask");

        let mut s = BitCask::new(path.clone())?;
        s.set(b"a", vec![1])?;
        let mut batch = WriteBatch::new();
        batch.put(b"b", vec![2]);
        batch.put(b"c", vec![3]);
        batch.delete(b"a");
        s.write(batch, true)?;
        drop(s);

        let mut s = BitCask::new(path)?;
        assert_eq!(s.get(b"a")?, None);
        assert_eq!(s.get(b"b")?, Some(vec![2]));
        assert_eq!(s.get(b"c")?, Some(vec![3]));
        Ok(())
    }

    /// Compaction must preserve live entries and drop garbage.
    #[test]
    fn compact_preserves_state() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("quarkdb")?;
        let mut s = BitCask::new(dir.path().join("bitcask"))?;
        for i in 0..10_u8 {
            s.set(b"key", vec![i])?;
            s.set(&[i], vec![i])?;
        }
        s.delete(&[3])?;

        let before = s.status()?;
        assert!(before.garbage_disk_size > 0);
        s.compact()?;
        let after = s.status()?;
        assert_eq!(after.garbage_disk_size, 0);

        assert_eq!(s.get(b"key")?, Some(vec![9]));
        assert_eq!(s.get(&[3])?, None);
        assert_eq!(s.get(&[4])?, Some(vec![4]));
        Ok(())
    }

    /// A torn frame at the end of the log must be discarded in full on
    /// reopen, including any complete ops inside it.
    #[test]
    fn torn_frame_is_discarded() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("quarkdb")?;
        let path = dir.path().join("bitcask");

        let mut s = BitCask::new(path.clone())?;
        s.set(b"a", vec![1])?;
        let size = s.log.size()?;
        let mut batch = WriteBatch::new();
        batch.put(b"b", vec![2]);
        batch.put(b"c", vec![3]);
        s.write(batch, false)?;
        let full = s.log.size()?;
        drop(s);

        // Cut the second frame short, leaving its first op intact.
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(full - 2)?;
        drop(file);

        let mut s = BitCask::new(path)?;
        assert_eq!(s.get(b"a")?, Some(vec![1]));
        assert_eq!(s.get(b"b")?, None);
        assert_eq!(s.get(b"c")?, None);
        assert_eq!(s.log.size()?, size);
        Ok(())
    }
}
