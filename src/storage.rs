use crate::constants::{CANONICAL_FIELDS, STORE_EXTENSION};
use crate::error::{CostError, Result};
use crate::table::{header_field, load_table, CostTable};
use crate::types::CanonicalRecord;
use metrics::counter;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument, warn};

/// Append-only CSV stores under one data directory.
///
/// Appends hold the write lock for the whole batch and reads hold the read
/// lock, so a query never sees a batch half written.
pub struct CsvStore {
    root: PathBuf,
    lock: RwLock<()>,
}

impl CsvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: RwLock::new(()),
        }
    }

    /// Open a store directory that must already exist.
    pub fn open_existing(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(CostError::Config(format!(
                "Data folder not found: {}",
                root.display()
            )));
        }
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, store: &str) -> PathBuf {
        self.root.join(format!("{store}.{STORE_EXTENSION}"))
    }

    pub fn exists(&self, store: &str) -> bool {
        self.path_for(store).is_file()
    }

    /// Append canonical records to `store`, writing the header on first use.
    ///
    /// An empty batch is a no-op and creates nothing. Returns the number of
    /// rows appended.
    pub fn save(&self, records: &[CanonicalRecord], store: &str) -> Result<usize> {
        self.save_all(&[(store, records)])
    }

    /// Append several batches under one write lock.
    ///
    /// Every target store is checked before any of them is written, so a
    /// header mismatch in one store leaves all of them untouched. A store whose
    /// last row lacks a line terminator gets one before the new rows.
    #[instrument(skip_all, fields(stores = batches.len()))]
    pub fn save_all(&self, batches: &[(&str, &[CanonicalRecord])]) -> Result<usize> {
        let batches: Vec<_> = batches.iter().filter(|(_, records)| !records.is_empty()).collect();
        if batches.is_empty() {
            debug!("empty batch, nothing to persist");
            return Ok(0);
        }
        for (store, _) in &batches {
            validate_store_name(store)?;
        }

        let _guard = self.write_guard();
        fs::create_dir_all(&self.root)?;

        let mut pending = Vec::with_capacity(batches.len());
        let mut planned: Vec<PathBuf> = Vec::new();
        for &&(store, records) in &batches {
            let path = self.path_for(store);
            let state = if planned.contains(&path) {
                FileState::Terminated
            } else {
                inspect(&path, store)?
            };
            planned.push(path.clone());
            pending.push((store, path, records, state));
        }

        let mut total = 0;
        for (store, path, records, state) in pending {
            if state == FileState::Unterminated {
                warn!(path = %path.display(), "store did not end with a newline, terminating last row");
            }
            let buf = encode_batch(records, state)?;
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&buf)?;
            file.flush()?;

            counter!("finops_store_rows_appended_total", "store" => store.to_string())
                .increment(records.len() as u64);
            let header = state == FileState::Absent;
            info!(path = %path.display(), rows = records.len(), header, "appended batch");
            total += records.len();
        }
        Ok(total)
    }

    /// Load a store through the tabular loader, `None` when it does not exist.
    pub fn load(&self, store: &str) -> Result<Option<CostTable>> {
        validate_store_name(store)?;
        let _guard = self.read_guard();
        let path = self.path_for(store);
        if !path.is_file() {
            return Ok(None);
        }
        load_table(&path, store).map(Some)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate_store_name(store: &str) -> Result<()> {
    let ok = !store.is_empty()
        && store
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(CostError::Validation(format!("invalid store name '{store}'")))
    }
}

/// What an append has to write ahead of its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    /// No file, or one without a header: write the header.
    Absent,
    /// Header matches and the last row is terminated.
    Terminated,
    /// Header matches but the last row has no line terminator.
    Unterminated,
}

fn inspect(path: &Path, store: &str) -> Result<FileState> {
    let Some(existing) = read_header(path)? else {
        return Ok(FileState::Absent);
    };
    if existing != CANONICAL_FIELDS {
        return Err(CostError::integrity(
            store,
            format!(
                "header [{}] does not match batch fields [{}]",
                existing.join(","),
                CANONICAL_FIELDS.join(",")
            ),
        ));
    }
    if ends_with_newline(path)? {
        Ok(FileState::Terminated)
    } else {
        Ok(FileState::Unterminated)
    }
}

/// Header fields of an existing, non-empty store file, parsed the same way
/// the tabular loader parses them.
fn read_header(path: &Path) -> Result<Option<Vec<String>>> {
    if !path.is_file() {
        return Ok(None);
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let fields: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| header_field(h).to_string())
        .collect();
    if fields.iter().all(String::is_empty) {
        return Ok(None);
    }
    Ok(Some(fields))
}

fn ends_with_newline(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Serialize a whole batch up front so it reaches the file in one write.
fn encode_batch(records: &[CanonicalRecord], state: FileState) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if state == FileState::Unterminated {
        buf.push(b'\n');
    }
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(buf);
    if state == FileState::Absent {
        writer.write_record(CANONICAL_FIELDS)?;
    }
    for record in records {
        writer.serialize(record)?;
    }
    writer.into_inner().map_err(|e| CostError::Io(e.into_error()))
}
