//! Atomic Parquet persistence for cumulative tables and daily change stores.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{Array, ArrayRef, Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, SchemaRef};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, SecondsFormat};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use rwatch_core::{
    ChangeKind, ChangeLog, ChangeLogRow, CumulativeTable, DayKey, EntityId, EntityRecord,
    PreviousValues,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

const COL_ID: &str = "id";
const COL_NAME: &str = "name";
const COL_METRIC: &str = "metric";
const COL_LICENSE: &str = "license";
const COL_URL: &str = "url";
const COL_CREATED_AT: &str = "created_at";
const COL_UPDATED_AT: &str = "updated_at";
const COL_FIRST_SEEN_AT: &str = "first_seen_at";
const COL_LAST_SEEN_AT: &str = "last_seen_at";
const COL_PREVIOUS_METRIC: &str = "previous_metric";
const COL_PREVIOUS_UPDATED_AT: &str = "previous_updated_at";
const COL_DELTA: &str = "delta";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store {} is malformed: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("encoding {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: ParquetError,
    },
}

impl StoreError {
    fn io(context: String, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

/// Outcome of one durable table write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTable {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: usize,
    pub rows: usize,
}

/// Directory-backed store: `total/<category>_total.parquet` and
/// `changes/<kind>_<category>_<YYYYMMDD>.parquet` under one root.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn total_path(&self, category: &str) -> PathBuf {
        self.root
            .join("total")
            .join(format!("{}_total.parquet", store_slug(category)))
    }

    pub fn change_path(&self, category: &str, kind: ChangeKind, day: DayKey) -> PathBuf {
        self.root
            .join("changes")
            .join(format!("{}_{}_{}.parquet", kind, store_slug(category), day))
    }

    /// Loads the cumulative table; `Ok(None)` means the category was never persisted.
    pub async fn load_total(&self, category: &str) -> Result<Option<CumulativeTable>, StoreError> {
        let path = self.total_path(category);
        let Some(bytes) = read_if_exists(&path).await? else {
            return Ok(None);
        };
        decode_total(&path, bytes).map(Some)
    }

    pub async fn save_total(
        &self,
        category: &str,
        table: &CumulativeTable,
    ) -> Result<StoredTable, StoreError> {
        let path = self.total_path(category);
        let records = table.records().collect::<Vec<_>>();
        let batch = entity_batch(&records, None).map_err(|err| encode_error(&path, err))?;
        self.write_batch(path, batch, records.len()).await
    }

    pub async fn load_change_log(
        &self,
        category: &str,
        kind: ChangeKind,
        day: DayKey,
    ) -> Result<Option<ChangeLog>, StoreError> {
        let path = self.change_path(category, kind, day);
        let Some(bytes) = read_if_exists(&path).await? else {
            return Ok(None);
        };
        decode_change_log(&path, kind, bytes).map(Some)
    }

    pub async fn save_change_log(
        &self,
        category: &str,
        day: DayKey,
        log: &ChangeLog,
    ) -> Result<StoredTable, StoreError> {
        let path = self.change_path(category, log.kind(), day);
        let rows = log.rows().collect::<Vec<_>>();
        let records = rows.iter().map(|row| &row.record).collect::<Vec<_>>();
        let previous = match log.kind() {
            ChangeKind::New => None,
            ChangeKind::Changed => Some(rows.iter().map(|row| row.previous.as_ref()).collect()),
        };
        let batch = entity_batch(&records, previous).map_err(|err| encode_error(&path, err))?;
        self.write_batch(path, batch, rows.len()).await
    }

    async fn write_batch(
        &self,
        path: PathBuf,
        batch: RecordBatch,
        rows: usize,
    ) -> Result<StoredTable, StoreError> {
        let bytes = encode_parquet(&path, &batch)?;
        write_atomic(&path, &bytes).await?;
        let stored = StoredTable {
            sha256: Self::sha256_hex(&bytes),
            bytes: bytes.len(),
            rows,
            path,
        };
        debug!(path = %stored.path.display(), rows, bytes = stored.bytes, "table persisted");
        Ok(stored)
    }
}

/// Lower-case, dash-separated form of a category label used in file names.
pub fn store_slug(label: &str) -> String {
    label
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

async fn read_if_exists(path: &Path) -> Result<Option<Bytes>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(Bytes::from(bytes))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(format!("reading {}", path.display()), err)),
    }
}

/// Replace `path` with `bytes` via a temp file in the same directory and a rename,
/// so readers only ever see the previous or the complete new content.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::malformed(path, "store path has no parent directory"))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|err| StoreError::io(format!("creating directory {}", parent.display()), err))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(
            format!(
                "atomically replacing {} via {}",
                path.display(),
                temp_path.display()
            ),
            err,
        ));
    }
    Ok(())
}

fn encode_error(path: &Path, err: ArrowError) -> StoreError {
    StoreError::Encode {
        path: path.to_path_buf(),
        source: ParquetError::from(err),
    }
}

fn format_ts(ts: &DateTime<FixedOffset>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn entity_fields() -> Vec<ArrowField> {
    vec![
        ArrowField::new(COL_ID, DataType::UInt64, false),
        ArrowField::new(COL_NAME, DataType::Utf8, false),
        ArrowField::new(COL_METRIC, DataType::Int64, false),
        ArrowField::new(COL_LICENSE, DataType::Utf8, false),
        ArrowField::new(COL_URL, DataType::Utf8, false),
        ArrowField::new(COL_CREATED_AT, DataType::Utf8, false),
        ArrowField::new(COL_UPDATED_AT, DataType::Utf8, false),
        ArrowField::new(COL_FIRST_SEEN_AT, DataType::Utf8, false),
        ArrowField::new(COL_LAST_SEEN_AT, DataType::Utf8, false),
    ]
}

fn change_fields() -> Vec<ArrowField> {
    vec![
        ArrowField::new(COL_PREVIOUS_METRIC, DataType::Int64, true),
        ArrowField::new(COL_PREVIOUS_UPDATED_AT, DataType::Utf8, true),
        ArrowField::new(COL_DELTA, DataType::Utf8, true),
    ]
}

fn timestamp_column<'a>(
    records: &[&'a EntityRecord],
    pick: impl Fn(&'a EntityRecord) -> &'a DateTime<FixedOffset>,
) -> ArrayRef {
    Arc::new(StringArray::from(
        records
            .iter()
            .map(|r| Some(format_ts(pick(*r))))
            .collect::<Vec<_>>(),
    ))
}

fn entity_batch(
    records: &[&EntityRecord],
    previous: Option<Vec<Option<&PreviousValues>>>,
) -> Result<RecordBatch, ArrowError> {
    let mut fields = entity_fields();
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(
            records.iter().map(|r| r.id.0).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| Some(r.name.as_str())).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            records.iter().map(|r| r.metric).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| Some(r.license.as_str())).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| Some(r.url.as_str())).collect::<Vec<_>>(),
        )),
        timestamp_column(records, |r| &r.created_at),
        timestamp_column(records, |r| &r.updated_at),
        timestamp_column(records, |r| &r.first_seen_at),
        timestamp_column(records, |r| &r.last_seen_at),
    ];

    if let Some(previous) = previous {
        fields.extend(change_fields());
        columns.push(Arc::new(Int64Array::from(
            previous.iter().map(|p| p.map(|p| p.metric)).collect::<Vec<_>>(),
        )));
        columns.push(Arc::new(StringArray::from(
            previous
                .iter()
                .map(|p| p.map(|p| format_ts(&p.updated_at)))
                .collect::<Vec<_>>(),
        )));
        columns.push(Arc::new(StringArray::from(
            previous
                .iter()
                .map(|p| p.map(|p| p.delta.as_str()))
                .collect::<Vec<_>>(),
        )));
    }

    let schema: SchemaRef = Arc::new(Schema::new(fields));
    RecordBatch::try_new(schema, columns)
}

fn encode_parquet(path: &Path, batch: &RecordBatch) -> Result<Vec<u8>, StoreError> {
    let encode = || -> Result<Vec<u8>, ParquetError> {
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)?;
        writer.write(batch)?;
        writer.close()?;
        Ok(buffer)
    };
    encode().map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })
}

fn read_batches(path: &Path, bytes: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>), StoreError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .map_err(|err| StoreError::malformed(path, format!("unreadable parquet: {err}")))?;
    let schema = builder.schema().clone();
    if schema.column_with_name(COL_ID).is_none() {
        return Err(StoreError::malformed(path, "missing identity column `id`"));
    }
    let reader = builder
        .build()
        .map_err(|err| StoreError::malformed(path, format!("unreadable parquet: {err}")))?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| StoreError::malformed(path, format!("unreadable row group: {err}")))?;
    Ok((schema, batches))
}

/// Column accessor for one decoded batch, reporting schema drift as malformed.
struct BatchColumns<'a> {
    path: &'a Path,
    batch: &'a RecordBatch,
}

impl<'a> BatchColumns<'a> {
    fn column(&self, name: &str) -> Result<&'a ArrayRef, StoreError> {
        self.batch
            .column_by_name(name)
            .ok_or_else(|| StoreError::malformed(self.path, format!("missing column `{name}`")))
    }

    fn ids(&self) -> Result<Vec<EntityId>, StoreError> {
        let column = self.column(COL_ID)?;
        let non_coercible = |row: usize| {
            StoreError::malformed(self.path, format!("row {row}: id is not a catalog identifier"))
        };
        let mut ids = Vec::with_capacity(column.len());
        match column.data_type() {
            DataType::UInt64 => {
                let values = downcast::<UInt64Array>(self.path, column, COL_ID)?;
                for row in 0..values.len() {
                    if values.is_null(row) {
                        return Err(non_coercible(row));
                    }
                    ids.push(EntityId(values.value(row)));
                }
            }
            DataType::Int64 => {
                let values = downcast::<Int64Array>(self.path, column, COL_ID)?;
                for row in 0..values.len() {
                    let id = (!values.is_null(row))
                        .then(|| u64::try_from(values.value(row)).ok())
                        .flatten()
                        .ok_or_else(|| non_coercible(row))?;
                    ids.push(EntityId(id));
                }
            }
            DataType::Utf8 => {
                let values = downcast::<StringArray>(self.path, column, COL_ID)?;
                for row in 0..values.len() {
                    let id = (!values.is_null(row))
                        .then(|| values.value(row).trim().parse::<u64>().ok())
                        .flatten()
                        .ok_or_else(|| non_coercible(row))?;
                    ids.push(EntityId(id));
                }
            }
            other => {
                return Err(StoreError::malformed(
                    self.path,
                    format!("identity column has unsupported type {other}"),
                ))
            }
        }
        Ok(ids)
    }

    fn strings(&self, name: &str) -> Result<&'a StringArray, StoreError> {
        downcast::<StringArray>(self.path, self.column(name)?, name)
    }

    fn ints(&self, name: &str) -> Result<&'a Int64Array, StoreError> {
        downcast::<Int64Array>(self.path, self.column(name)?, name)
    }

    fn text(&self, values: &StringArray, name: &str, row: usize) -> Result<String, StoreError> {
        if values.is_null(row) {
            return Err(StoreError::malformed(
                self.path,
                format!("row {row}: `{name}` is null"),
            ));
        }
        Ok(values.value(row).to_string())
    }

    fn timestamp(
        &self,
        values: &StringArray,
        name: &str,
        row: usize,
    ) -> Result<DateTime<FixedOffset>, StoreError> {
        let raw = self.text(values, name, row)?;
        DateTime::parse_from_rfc3339(&raw).map_err(|err| {
            StoreError::malformed(self.path, format!("row {row}: `{name}` {raw:?}: {err}"))
        })
    }

    fn records(&self) -> Result<Vec<EntityRecord>, StoreError> {
        let ids = self.ids()?;
        let names = self.strings(COL_NAME)?;
        let metrics = self.ints(COL_METRIC)?;
        let licenses = self.strings(COL_LICENSE)?;
        let urls = self.strings(COL_URL)?;
        let created = self.strings(COL_CREATED_AT)?;
        let updated = self.strings(COL_UPDATED_AT)?;
        let first_seen = self.strings(COL_FIRST_SEEN_AT)?;
        let last_seen = self.strings(COL_LAST_SEEN_AT)?;

        ids.into_iter()
            .enumerate()
            .map(|(row, id)| {
                if metrics.is_null(row) {
                    return Err(StoreError::malformed(
                        self.path,
                        format!("row {row}: `{COL_METRIC}` is null"),
                    ));
                }
                Ok(EntityRecord {
                    id,
                    name: self.text(names, COL_NAME, row)?,
                    url: self.text(urls, COL_URL, row)?,
                    license: self.text(licenses, COL_LICENSE, row)?,
                    metric: metrics.value(row),
                    created_at: self.timestamp(created, COL_CREATED_AT, row)?,
                    updated_at: self.timestamp(updated, COL_UPDATED_AT, row)?,
                    first_seen_at: self.timestamp(first_seen, COL_FIRST_SEEN_AT, row)?,
                    last_seen_at: self.timestamp(last_seen, COL_LAST_SEEN_AT, row)?,
                })
            })
            .collect()
    }

    fn previous(&self, row: usize) -> Result<Option<PreviousValues>, StoreError> {
        if self.batch.column_by_name(COL_PREVIOUS_METRIC).is_none() {
            return Ok(None);
        }
        let metrics = self.ints(COL_PREVIOUS_METRIC)?;
        if metrics.is_null(row) {
            return Ok(None);
        }
        let updated = self.strings(COL_PREVIOUS_UPDATED_AT)?;
        let deltas = self.strings(COL_DELTA)?;
        Ok(Some(PreviousValues {
            metric: metrics.value(row),
            updated_at: self.timestamp(updated, COL_PREVIOUS_UPDATED_AT, row)?,
            delta: if deltas.is_null(row) {
                String::new()
            } else {
                deltas.value(row).to_string()
            },
        }))
    }
}

fn downcast<'a, T: 'static>(
    path: &Path,
    column: &'a ArrayRef,
    name: &str,
) -> Result<&'a T, StoreError> {
    column.as_any().downcast_ref::<T>().ok_or_else(|| {
        StoreError::malformed(
            path,
            format!("column `{name}` has unexpected type {}", column.data_type()),
        )
    })
}

fn decode_total(path: &Path, bytes: Bytes) -> Result<CumulativeTable, StoreError> {
    let (_schema, batches) = read_batches(path, bytes)?;
    let mut records = Vec::new();
    for batch in &batches {
        records.extend(BatchColumns { path, batch }.records()?);
    }
    CumulativeTable::try_from_records(records)
        .map_err(|err| StoreError::malformed(path, err.to_string()))
}

fn decode_change_log(path: &Path, kind: ChangeKind, bytes: Bytes) -> Result<ChangeLog, StoreError> {
    let (_schema, batches) = read_batches(path, bytes)?;
    let mut rows = Vec::new();
    for batch in &batches {
        let columns = BatchColumns { path, batch };
        for (row, record) in columns.records()?.into_iter().enumerate() {
            rows.push(ChangeLogRow {
                record,
                previous: columns.previous(row)?,
            });
        }
    }
    Ok(ChangeLog::from_rows(kind, rows))
}
