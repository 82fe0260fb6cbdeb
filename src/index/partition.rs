//! Index Partitions
//!
//! Immutable column-grouped files holding runs of index rows, plus the
//! atomically rewritten manifest that lists what is installed. The file is
//! self-describing: a JSON header names every column, its type, and its byte
//! range, so selective scans decode only the columns they filter on. Each
//! column block is bincode-encoded and independently compressed; the whole
//! file is integrity-checked by the SHA-256 hash recorded in the manifest.
//!
//! Layout:
//!
//! ```text
//! magic "TSP1" | u32 header_len | header JSON | column blocks...
//! ```

use crate::cache::compression::{CompressionAlgorithm, Compressor};
use crate::cache::heat::now_ms;
use crate::error::{Error, Result};
use crate::index::record::{FieldValue, IndexRecord, Predicate};
use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const PARTITION_MAGIC: &[u8; 4] = b"TSP1";
const FORMAT_VERSION: u32 = 1;

/// SHA-256 of a byte slice as lowercase hex
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// =============================================================================
// Column Model
// =============================================================================

/// Physical column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Str,
    OptStr,
    U64,
    OptU64,
    F64,
    /// One JSON document per row (maps and sets)
    Json,
}

/// Column order is fixed; the header repeats it so readers never guess
const COLUMNS: &[(&str, ColumnType)] = &[
    ("fingerprint", ColumnType::Str),
    ("codec", ColumnType::Str),
    ("hash_algorithm", ColumnType::Str),
    ("size_bytes", ColumnType::U64),
    ("block_count", ColumnType::U64),
    ("location_set", ColumnType::Json),
    ("access_count", ColumnType::U64),
    ("last_access_ms", ColumnType::U64),
    ("heat_score", ColumnType::F64),
    ("created_at_ms", ColumnType::U64),
    ("updated_at_ms", ColumnType::U64),
    ("mime_type", ColumnType::OptStr),
    ("name", ColumnType::OptStr),
    ("tags", ColumnType::Json),
    ("properties", ColumnType::Json),
    ("deleted_at_ms", ColumnType::OptU64),
];

/// Decoded column vector
#[derive(Debug, Clone)]
pub enum ColumnData {
    Str(Vec<String>),
    OptStr(Vec<Option<String>>),
    U64(Vec<u64>),
    OptU64(Vec<Option<u64>>),
    F64(Vec<f64>),
    Json(Vec<String>),
}

impl ColumnData {
    fn len(&self) -> usize {
        match self {
            ColumnData::Str(v) => v.len(),
            ColumnData::OptStr(v) => v.len(),
            ColumnData::U64(v) => v.len(),
            ColumnData::OptU64(v) => v.len(),
            ColumnData::F64(v) => v.len(),
            ColumnData::Json(v) => v.len(),
        }
    }

    /// Scalar view of one row, for predicate evaluation
    fn field_value(&self, row: usize) -> Option<FieldValue> {
        match self {
            ColumnData::Str(v) => Some(FieldValue::Str(v[row].clone())),
            ColumnData::OptStr(v) => v[row].clone().map(FieldValue::Str),
            ColumnData::U64(v) => Some(FieldValue::U64(v[row])),
            ColumnData::OptU64(v) => v[row].map(FieldValue::U64),
            ColumnData::F64(v) => Some(FieldValue::F64(v[row])),
            ColumnData::Json(_) => None,
        }
    }
}

// =============================================================================
// Header
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColumnDesc {
    name: String,
    ty: ColumnType,
    /// Byte offset of the block, relative to the data section
    offset: u64,
    /// Encoded block length in bytes
    length: u64,
    compression: CompressionAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PartitionHeader {
    format_version: u32,
    partition_id: u64,
    row_count: usize,
    created_at_ms: u64,
    columns: Vec<ColumnDesc>,
}

// =============================================================================
// Writing
// =============================================================================

/// Manifest entry describing one installed partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub partition_id: u64,
    pub file_name: String,
    pub row_count: usize,
    pub content_hash: String,
    pub created_at_ms: u64,
}

fn encode_column(name: &str, ty: ColumnType, rows: &[IndexRecord]) -> Result<Vec<u8>> {
    let encoded = match (name, ty) {
        ("fingerprint", _) => bincode::serialize(
            &rows
                .iter()
                .map(|r| r.fingerprint.to_canonical_string())
                .collect::<Vec<_>>(),
        )?,
        ("codec", _) => bincode::serialize(&rows.iter().map(|r| r.codec.clone()).collect::<Vec<_>>())?,
        ("hash_algorithm", _) => bincode::serialize(
            &rows.iter().map(|r| r.hash_algorithm.clone()).collect::<Vec<_>>(),
        )?,
        ("size_bytes", _) => {
            bincode::serialize(&rows.iter().map(|r| r.size_bytes).collect::<Vec<_>>())?
        }
        ("block_count", _) => {
            bincode::serialize(&rows.iter().map(|r| r.block_count).collect::<Vec<_>>())?
        }
        ("location_set", _) => {
            let docs: Vec<String> = rows
                .iter()
                .map(|r| serde_json::to_string(&r.location_set))
                .collect::<std::result::Result<_, _>>()?;
            bincode::serialize(&docs)?
        }
        ("access_count", _) => {
            bincode::serialize(&rows.iter().map(|r| r.access_count).collect::<Vec<_>>())?
        }
        ("last_access_ms", _) => {
            bincode::serialize(&rows.iter().map(|r| r.last_access_ms).collect::<Vec<_>>())?
        }
        ("heat_score", _) => {
            bincode::serialize(&rows.iter().map(|r| r.heat_score).collect::<Vec<_>>())?
        }
        ("created_at_ms", _) => {
            bincode::serialize(&rows.iter().map(|r| r.created_at_ms).collect::<Vec<_>>())?
        }
        ("updated_at_ms", _) => {
            bincode::serialize(&rows.iter().map(|r| r.updated_at_ms).collect::<Vec<_>>())?
        }
        ("mime_type", _) => {
            bincode::serialize(&rows.iter().map(|r| r.mime_type.clone()).collect::<Vec<_>>())?
        }
        ("name", _) => bincode::serialize(&rows.iter().map(|r| r.name.clone()).collect::<Vec<_>>())?,
        ("tags", _) => {
            let docs: Vec<String> = rows
                .iter()
                .map(|r| serde_json::to_string(&r.tags))
                .collect::<std::result::Result<_, _>>()?;
            bincode::serialize(&docs)?
        }
        ("properties", _) => {
            let docs: Vec<String> = rows
                .iter()
                .map(|r| serde_json::to_string(&r.properties))
                .collect::<std::result::Result<_, _>>()?;
            bincode::serialize(&docs)?
        }
        ("deleted_at_ms", _) => {
            bincode::serialize(&rows.iter().map(|r| r.deleted_at_ms).collect::<Vec<_>>())?
        }
        (other, _) => {
            return Err(Error::Internal(format!("unknown partition column {}", other)))
        }
    };
    Ok(encoded)
}

fn decode_column(ty: ColumnType, bytes: &[u8]) -> Result<ColumnData> {
    Ok(match ty {
        ColumnType::Str => ColumnData::Str(bincode::deserialize(bytes)?),
        ColumnType::OptStr => ColumnData::OptStr(bincode::deserialize(bytes)?),
        ColumnType::U64 => ColumnData::U64(bincode::deserialize(bytes)?),
        ColumnType::OptU64 => ColumnData::OptU64(bincode::deserialize(bytes)?),
        ColumnType::F64 => ColumnData::F64(bincode::deserialize(bytes)?),
        ColumnType::Json => ColumnData::Json(bincode::deserialize(bytes)?),
    })
}

/// Serialize rows into a partition file under `dir/file_name`.
///
/// The file is assembled in memory, hashed, then staged and atomically
/// renamed, so a crash can never leave a half-written partition visible.
pub async fn write_partition(
    dir: &Path,
    file_name: &str,
    partition_id: u64,
    rows: &[IndexRecord],
    compressor: &Compressor,
) -> Result<ManifestEntry> {
    let mut descs = Vec::with_capacity(COLUMNS.len());
    let mut data = Vec::new();

    for (name, ty) in COLUMNS {
        let raw = encode_column(name, *ty, rows)?;
        let (block, compression) = compressor.compress(&raw);
        descs.push(ColumnDesc {
            name: (*name).to_string(),
            ty: *ty,
            offset: data.len() as u64,
            length: block.len() as u64,
            compression,
        });
        data.extend_from_slice(&block);
    }

    let header = PartitionHeader {
        format_version: FORMAT_VERSION,
        partition_id,
        row_count: rows.len(),
        created_at_ms: now_ms(),
        columns: descs,
    };
    let header_json = serde_json::to_vec(&header)?;

    let mut file = Vec::with_capacity(8 + header_json.len() + data.len());
    file.extend_from_slice(PARTITION_MAGIC);
    file.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
    file.extend_from_slice(&header_json);
    file.extend_from_slice(&data);

    let hash = content_hash(&file);

    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    let tmp = dir.join(format!("{}.tmp", file_name));
    tokio::fs::write(&tmp, &file).await?;
    tokio::fs::rename(&tmp, &path).await?;

    Ok(ManifestEntry {
        partition_id,
        file_name: file_name.to_string(),
        row_count: rows.len(),
        content_hash: hash,
        created_at_ms: header.created_at_ms,
    })
}

// =============================================================================
// Reading
// =============================================================================

/// Reader over one immutable partition file
pub struct PartitionFile {
    path: PathBuf,
    header: PartitionHeader,
    /// Byte offset where column blocks begin
    data_start: u64,
}

impl PartitionFile {
    /// Open a partition and parse its header
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = tokio::fs::File::open(&path).await?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).await.map_err(|_| {
            Error::Corruption(format!("{}: truncated partition", path.display()))
        })?;
        if &magic != PARTITION_MAGIC {
            return Err(Error::Corruption(format!(
                "{}: bad partition magic",
                path.display()
            )));
        }

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf).await?;
        let header_len = u32::from_le_bytes(len_buf) as usize;

        let mut header_buf = vec![0u8; header_len];
        file.read_exact(&mut header_buf).await?;
        let header: PartitionHeader = serde_json::from_slice(&header_buf)
            .map_err(|e| Error::Corruption(format!("{}: bad header: {}", path.display(), e)))?;

        if header.format_version != FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "{}: unsupported partition format {}",
                path.display(),
                header.format_version
            )));
        }

        Ok(Self {
            path,
            data_start: (8 + header_len) as u64,
            header,
        })
    }

    pub fn partition_id(&self) -> u64 {
        self.header.partition_id
    }

    pub fn row_count(&self) -> usize {
        self.header.row_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decode one column without touching the others
    pub async fn read_column(&self, name: &str) -> Result<ColumnData> {
        let desc = self
            .header
            .columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                Error::Internal(format!("{}: no column {}", self.path.display(), name))
            })?;

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.data_start + desc.offset)).await?;
        let mut block = vec![0u8; desc.length as usize];
        file.read_exact(&mut block).await.map_err(|_| {
            Error::Corruption(format!("{}: truncated column {}", self.path.display(), name))
        })?;

        let compressor = Compressor::default();
        let raw = compressor.decompress(&block, desc.compression)?;
        let data = decode_column(desc.ty, &raw)?;
        if data.len() != self.header.row_count {
            return Err(Error::Corruption(format!(
                "{}: column {} has {} rows, expected {}",
                self.path.display(),
                name,
                data.len(),
                self.header.row_count
            )));
        }
        Ok(data)
    }

    /// Scan with predicates: filter columns are decoded first, then only the
    /// matching rows are materialized.
    pub async fn scan(&self, predicates: &[Predicate]) -> Result<Vec<IndexRecord>> {
        self.scan_projected(predicates, None).await
    }

    /// Like [`scan`](Self::scan), but decoding only the named columns for the
    /// materialized rows (identity and resolution columns are always read;
    /// unselected fields come back as defaults).
    pub async fn scan_projected(
        &self,
        predicates: &[Predicate],
        projection: Option<&std::collections::BTreeSet<String>>,
    ) -> Result<Vec<IndexRecord>> {
        if self.header.row_count == 0 {
            return Ok(Vec::new());
        }
        if predicates.is_empty() {
            return self.materialize(None, projection).await;
        }

        let mut matching: Vec<bool> = vec![true; self.header.row_count];
        for predicate in predicates {
            if predicate.column == "tags" {
                let tags = self.read_column("tags").await?;
                let ColumnData::Json(docs) = tags else {
                    return Err(Error::Corruption("tags column has wrong type".into()));
                };
                for (row, doc) in docs.iter().enumerate() {
                    if !matching[row] {
                        continue;
                    }
                    let set: std::collections::BTreeSet<String> =
                        serde_json::from_str(doc).unwrap_or_default();
                    let hit = predicate.values.iter().any(|v| match v {
                        FieldValue::Str(tag) => set.contains(tag),
                        _ => false,
                    });
                    let keep = match predicate.op {
                        crate::index::record::CompareOp::Ne => !hit,
                        _ => hit,
                    };
                    matching[row] = keep;
                }
                continue;
            }

            let column = self.read_column(&predicate.column).await?;
            for (row, keep) in matching.iter_mut().enumerate() {
                if !*keep {
                    continue;
                }
                *keep = scalar_matches(column.field_value(row), predicate);
            }
        }

        let indices: Vec<usize> = matching
            .iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect();
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        self.materialize(Some(&indices), projection).await
    }

    /// Columns a projected read must always decode: identity plus the fields
    /// the read path needs for newest-row resolution and tombstones.
    const MANDATORY_COLUMNS: &'static [&'static str] =
        &["fingerprint", "codec", "hash_algorithm", "updated_at_ms", "deleted_at_ms"];

    /// Decode every row (or a subset) back into records
    async fn materialize(
        &self,
        indices: Option<&[usize]>,
        projection: Option<&std::collections::BTreeSet<String>>,
    ) -> Result<Vec<IndexRecord>> {
        let mut columns: BTreeMap<&str, ColumnData> = BTreeMap::new();
        for (name, _) in COLUMNS {
            let wanted = match projection {
                None => true,
                Some(set) => set.contains(*name) || Self::MANDATORY_COLUMNS.contains(name),
            };
            if wanted {
                columns.insert(name, self.read_column(name).await?);
            }
        }

        let rows: Vec<usize> = match indices {
            Some(subset) => subset.to_vec(),
            None => (0..self.header.row_count).collect(),
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(self.record_at(&columns, row)?);
        }
        Ok(records)
    }

    fn record_at(&self, columns: &BTreeMap<&str, ColumnData>, row: usize) -> Result<IndexRecord> {
        // Mandatory columns must decode; projected-out columns default.
        macro_rules! req {
            ($name:expr, $variant:ident) => {
                match columns.get($name) {
                    Some(ColumnData::$variant(v)) => v,
                    _ => {
                        return Err(Error::Corruption(format!(
                            "{}: column {} missing or mistyped",
                            self.path.display(),
                            $name
                        )))
                    }
                }
            };
        }
        macro_rules! opt {
            ($name:expr, $variant:ident, $default:expr) => {
                match columns.get($name) {
                    Some(ColumnData::$variant(v)) => v[row].clone(),
                    _ => $default,
                }
            };
        }
        macro_rules! opt_json {
            ($name:expr) => {
                match columns.get($name) {
                    Some(ColumnData::Json(v)) => serde_json::from_str(&v[row])?,
                    _ => Default::default(),
                }
            };
        }

        let fingerprint: crate::fingerprint::Fingerprint = req!("fingerprint", Str)[row]
            .parse()
            .map_err(|e| Error::Corruption(format!("bad fingerprint in partition: {}", e)))?;

        Ok(IndexRecord {
            fingerprint,
            codec: req!("codec", Str)[row].clone(),
            hash_algorithm: req!("hash_algorithm", Str)[row].clone(),
            size_bytes: opt!("size_bytes", U64, 0),
            block_count: opt!("block_count", U64, 0),
            location_set: opt_json!("location_set"),
            access_count: opt!("access_count", U64, 0),
            last_access_ms: opt!("last_access_ms", U64, 0),
            heat_score: opt!("heat_score", F64, 0.0),
            created_at_ms: opt!("created_at_ms", U64, 0),
            updated_at_ms: req!("updated_at_ms", U64)[row],
            mime_type: opt!("mime_type", OptStr, None),
            name: opt!("name", OptStr, None),
            tags: opt_json!("tags"),
            properties: opt_json!("properties"),
            deleted_at_ms: req!("deleted_at_ms", OptU64)[row],
        })
    }

    /// All tombstone rows in this partition.
    ///
    /// Tombstones never match user predicates, but reads must still let them
    /// veto older matching rows; this decodes only the columns that takes.
    pub async fn tombstones(&self) -> Result<Vec<IndexRecord>> {
        if self.header.row_count == 0 {
            return Ok(Vec::new());
        }
        let deleted = match self.read_column("deleted_at_ms").await? {
            ColumnData::OptU64(v) => v,
            _ => return Err(Error::Corruption("deleted_at_ms column mistyped".into())),
        };
        let indices: Vec<usize> = deleted
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.is_some().then_some(i))
            .collect();
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let projection: std::collections::BTreeSet<String> =
            ["deleted_at_ms"].iter().map(|s| s.to_string()).collect();
        self.materialize(Some(&indices), Some(&projection)).await
    }

    /// Re-hash the file and compare against the manifest's record
    pub async fn verify_content_hash(&self, expected: &str) -> Result<()> {
        let bytes = tokio::fs::read(&self.path).await?;
        let actual = content_hash(&bytes);
        if actual != expected {
            return Err(Error::Corruption(format!(
                "{}: content hash {} != manifest {}",
                self.path.display(),
                actual,
                expected
            )));
        }
        Ok(())
    }
}

fn scalar_matches(field: Option<FieldValue>, predicate: &Predicate) -> bool {
    use crate::index::record::CompareOp;
    let field = match field {
        Some(f) => f,
        None => return predicate.op == CompareOp::Ne,
    };
    match predicate.op {
        CompareOp::In => predicate.values.iter().any(|v| field == *v),
        op => match field.compare(&predicate.values[0]) {
            None => false,
            Some(ord) => match op {
                CompareOp::Eq => ord.is_eq(),
                CompareOp::Ne => ord.is_ne(),
                CompareOp::Lt => ord.is_lt(),
                CompareOp::Le => ord.is_le(),
                CompareOp::Gt => ord.is_gt(),
                CompareOp::Ge => ord.is_ge(),
                CompareOp::In => unreachable!(),
            },
        },
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// Canonical list of installed partitions, rewritten atomically
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub partitions: BTreeMap<u64, ManifestEntry>,
}

impl Manifest {
    /// Load from disk; a missing manifest is an empty one
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic rewrite: temp file + rename
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub fn highest_partition_id(&self) -> u64 {
        self.partitions.keys().next_back().copied().unwrap_or(0)
    }
}
