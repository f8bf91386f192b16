//! On-disk form of an index build: a binary vector file plus a JSON mapping
//! sidecar at `<index>.mapping.json`.
//!
//! Index layout (little-endian):
//!
//! | bytes | field |
//! |---|---|
//! | 8 | magic `RAGFLAT1` |
//! | 4 | format version (`u32`) |
//! | 4 | dimension (`u32`) |
//! | 8 | vector count (`u64`) |
//! | 32 | blake3 digest of the payload |
//! | count × dim × 4 | `f32` payload, row-major |
//!
//! The mapping records the payload digest, so an index and a mapping from
//! different builds are rejected on load. Both files are written to temp
//! files in the destination directory and renamed into place.

use std::ffi::OsString;
use std::fs;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use ragdb_core::error::{Error, Result};
use ragdb_core::traits::VectorIndex;
use ragdb_core::types::Mapping;

use crate::flat::FlatL2Index;

pub const INDEX_MAGIC: &[u8; 8] = b"RAGFLAT1";
pub const FORMAT_VERSION: u32 = 1;
pub const MAPPING_SUFFIX: &str = ".mapping.json";
const HEADER_LEN: usize = 8 + 4 + 4 + 8 + 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub index: PathBuf,
    pub mapping: PathBuf,
}

impl ArtifactPaths {
    /// The mapping path is the index path with [`MAPPING_SUFFIX`] appended.
    pub fn for_index(index: impl Into<PathBuf>) -> Self {
        let index = index.into();
        let mut mapping = OsString::from(index.as_os_str());
        mapping.push(MAPPING_SUFFIX);
        Self { index, mapping: PathBuf::from(mapping) }
    }

    fn parent_dir(&self) -> &Path {
        match self.index.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub version: u32,
    pub dim: usize,
    pub count: usize,
    pub checksum: [u8; 32],
}

impl IndexHeader {
    pub fn checksum_hex(&self) -> String {
        blake3::Hash::from(self.checksum).to_hex().to_string()
    }

    fn payload_len(&self) -> Option<usize> {
        self.count.checked_mul(self.dim)?.checked_mul(4)
    }
}

/// The mapping sidecar as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub version: u32,
    pub embedder_id: String,
    pub dim: usize,
    pub count: usize,
    pub index_checksum: String,
    pub built_at: DateTime<Utc>,
    pub ids: Vec<String>,
    pub texts: Vec<String>,
}

impl MappingRecord {
    fn into_mapping(self) -> Mapping {
        Mapping { ids: self.ids, texts: self.texts }
    }
}

/// A fully validated artifact pair.
#[derive(Debug, Clone)]
pub struct LoadedArtifact {
    pub index: FlatL2Index,
    pub mapping: Mapping,
    pub embedder_id: String,
    pub built_at: DateTime<Utc>,
}

pub fn encode_index(index: &FlatL2Index) -> (Vec<u8>, blake3::Hash) {
    let payload: Vec<u8> = index.as_slice().iter().flat_map(|x| x.to_le_bytes()).collect();
    let checksum = blake3::hash(&payload);
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(INDEX_MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(index.dim() as u32).to_le_bytes());
    bytes.extend_from_slice(&(index.len() as u64).to_le_bytes());
    bytes.extend_from_slice(checksum.as_bytes());
    bytes.extend_from_slice(&payload);
    (bytes, checksum)
}

fn parse_header(path: &Path, bytes: &[u8]) -> Result<IndexHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::corrupt(path, format!("truncated header ({} bytes)", bytes.len())));
    }
    if &bytes[0..8] != INDEX_MAGIC {
        return Err(Error::corrupt(path, "not a ragdb index file (bad magic)"));
    }
    let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let version = u32_at(8);
    if version != FORMAT_VERSION {
        return Err(Error::corrupt(path, format!("unsupported format version {version}")));
    }
    let dim = u32_at(12) as usize;
    let mut count = [0u8; 8];
    count.copy_from_slice(&bytes[16..24]);
    let count = usize::try_from(u64::from_le_bytes(count))
        .map_err(|_| Error::corrupt(path, "vector count does not fit in memory"))?;
    let mut checksum = [0u8; 32];
    checksum.copy_from_slice(&bytes[24..HEADER_LEN]);
    if dim == 0 && count > 0 {
        return Err(Error::corrupt(path, "zero dimension with non-zero vector count"));
    }
    Ok(IndexHeader { version, dim, count, checksum })
}

pub fn decode_index(path: &Path, bytes: &[u8]) -> Result<(IndexHeader, FlatL2Index)> {
    let header = parse_header(path, bytes)?;
    let payload = &bytes[HEADER_LEN..];
    let expected = header.payload_len().ok_or_else(|| Error::corrupt(path, "payload size overflows"))?;
    if payload.len() != expected {
        return Err(Error::corrupt(
            path,
            format!(
                "payload is {} bytes, header promises {} vectors of dim {}",
                payload.len(),
                header.count,
                header.dim
            ),
        ));
    }
    if blake3::hash(payload).as_bytes() != &header.checksum {
        return Err(Error::corrupt(path, "payload checksum mismatch"));
    }
    let data = payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((header, FlatL2Index::from_raw(header.dim, data)))
}

/// Reads only the fixed-size header: answers "how many vectors, what dimension"
/// without loading the payload.
pub fn read_header(path: impl AsRef<Path>) -> Result<IndexHeader> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|e| read_failure(path, "index", &e))?;
    let mut buf = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64).read_to_end(&mut buf).map_err(|e| read_failure(path, "index", &e))?;
    parse_header(path, &buf)
}

pub fn read_mapping(path: impl AsRef<Path>) -> Result<MappingRecord> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| read_failure(path, "mapping", &e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::corrupt(path, format!("unreadable mapping: {e}")))
}

fn read_failure(path: &Path, what: &str, e: &std::io::Error) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::corrupt(path, format!("{what} file is missing"))
    } else {
        Error::corrupt(path, format!("cannot read {what} file: {e}"))
    }
}

/// Loads both parts and checks that they describe the same build and that
/// `ids`, `texts` and the vectors line up one-to-one.
pub fn read_pair(paths: &ArtifactPaths) -> Result<LoadedArtifact> {
    let bytes = fs::read(&paths.index).map_err(|e| read_failure(&paths.index, "index", &e))?;
    let (header, index) = decode_index(&paths.index, &bytes)?;
    let record = read_mapping(&paths.mapping)?;

    let corrupt = |reason: String| Error::corrupt(&paths.mapping, reason);
    if record.version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported mapping version {}", record.version)));
    }
    if record.ids.len() != record.texts.len() {
        return Err(corrupt(format!("{} ids but {} texts", record.ids.len(), record.texts.len())));
    }
    if record.ids.len() != header.count || record.count != header.count {
        return Err(corrupt(format!("mapping has {} entries, index has {} vectors", record.ids.len(), header.count)));
    }
    if record.dim != header.dim {
        return Err(corrupt(format!("mapping dim {} differs from index dim {}", record.dim, header.dim)));
    }
    if record.index_checksum != header.checksum_hex() {
        return Err(corrupt("mapping belongs to a different index build".to_string()));
    }

    let embedder_id = record.embedder_id.clone();
    let built_at = record.built_at;
    Ok(LoadedArtifact { index, mapping: record.into_mapping(), embedder_id, built_at })
}

/// Writes the index and its mapping as one unit. Nothing becomes visible at
/// the destination until both temp files are fully written and synced, and a
/// failed mapping rename puts the previous index back.
pub fn write_pair(
    paths: &ArtifactPaths,
    index: &FlatL2Index,
    mapping: &Mapping,
    embedder_id: &str,
) -> Result<MappingRecord> {
    let dir = paths.parent_dir();
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let (bytes, checksum) = encode_index(index);
    let record = MappingRecord {
        version: FORMAT_VERSION,
        embedder_id: embedder_id.to_string(),
        dim: index.dim(),
        count: index.len(),
        index_checksum: checksum.to_hex().to_string(),
        built_at: Utc::now(),
        ids: mapping.ids.clone(),
        texts: mapping.texts.clone(),
    };

    let mut index_tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    index_tmp.write_all(&bytes).map_err(|e| Error::io(index_tmp.path(), e))?;
    index_tmp.as_file().sync_all().map_err(|e| Error::io(index_tmp.path(), e))?;

    let mut mapping_tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    {
        let mut writer = BufWriter::new(&mut mapping_tmp);
        serde_json::to_writer(&mut writer, &record).map_err(|e| Error::io(&paths.mapping, e.into()))?;
        writer.flush().map_err(|e| Error::io(&paths.mapping, e))?;
    }
    mapping_tmp.as_file().sync_all().map_err(|e| Error::io(mapping_tmp.path(), e))?;

    // The previous index stays reachable until the mapping is in place.
    let backup = tempfile::Builder::new().prefix(".ragdb-prev").tempdir_in(dir).map_err(|e| Error::io(dir, e))?;
    let previous = keep_previous(&paths.index, backup.path())?;

    // Index first: a crash before the mapping rename leaves a checksum mismatch, never a silent mix.
    index_tmp.persist(&paths.index).map_err(|e| Error::io(&paths.index, e.error))?;
    if let Err(e) = mapping_tmp.persist(&paths.mapping) {
        restore_previous(&paths.index, previous.as_deref());
        return Err(Error::io(&paths.mapping, e.error));
    }
    debug!(
        index = %paths.index.display(),
        mapping = %paths.mapping.display(),
        bytes = bytes.len(),
        "artifact pair written"
    );
    Ok(record)
}

/// Links (or copies) an existing index into `backup_dir`.
fn keep_previous(index: &Path, backup_dir: &Path) -> Result<Option<PathBuf>> {
    if !index.is_file() {
        return Ok(None);
    }
    let saved = backup_dir.join("index");
    if fs::hard_link(index, &saved).is_err() {
        fs::copy(index, &saved).map_err(|e| Error::io(index, e))?;
    }
    Ok(Some(saved))
}

fn restore_previous(index: &Path, previous: Option<&Path>) {
    let restored = match previous {
        Some(saved) => fs::rename(saved, index),
        None => fs::remove_file(index),
    };
    match restored {
        Ok(()) => warn!(index = %index.display(), "mapping write failed, index rolled back"),
        Err(e) => {
            warn!(index = %index.display(), error = %e, "mapping write failed and the index could not be rolled back")
        }
    }
}
