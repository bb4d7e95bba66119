//! Render a registry snapshot as a trace artifact
//!
//! Supports:
//! - Text (CSV, one row per site, fixed slot columns)
//! - JSON (`{"format": ..., "events": [...]}`, one object per site)
//!
//! Every site known to the catalog appears exactly once, in site-id order.
//! Sites that never fired get empty placeholders; recorded sites the catalog
//! does not know get empty metadata.

use crate::recording::catalog::{SiteCatalog, SiteInfo};
use crate::recording::registry::SharedBuffer;
use crate::recording::site_buffer::{BufferColumns, SiteBuffer};
use crate::utils::errors::{Result, TraceError};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::debug;

/// Format tag written at the top of JSON traces
pub const FORMAT_NAME: &str = "latest";

/// Static columns preceding the buffer columns in text traces
const SITE_COLUMNS: [&str; 9] = [
    "cname", "mname", "mdesc", "mhash", "line", "inst", "attr", "event", "vtype",
];

/// Export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Comma-separated text
    #[default]
    Text,

    /// Structured JSON document
    Json,
}

impl ExportFormat {
    /// File extension of artifacts in this format
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Text => "txt",
            ExportFormat::Json => "json",
        }
    }
}

/// One site of a snapshot: metadata plus its buffer, if it ever fired
pub struct TraceRow {
    pub info: SiteInfo,
    pub buffer: Option<SharedBuffer>,
}

/// Join catalog metadata with a registry snapshot, in site-id order
pub fn collect_rows(catalog: &SiteCatalog, snapshot: Vec<(usize, SharedBuffer)>) -> Vec<TraceRow> {
    let mut rows: BTreeMap<usize, TraceRow> = catalog
        .sites()
        .into_iter()
        .map(|info| (info.site_id, TraceRow { info, buffer: None }))
        .collect();

    for (site, buffer) in snapshot {
        match rows.get_mut(&site) {
            Some(row) => row.buffer = Some(buffer),
            None => {
                let kind = buffer.lock().kind();
                rows.insert(
                    site,
                    TraceRow {
                        info: SiteInfo::unknown(site, kind),
                        buffer: Some(buffer),
                    },
                );
            }
        }
    }

    rows.into_values().collect()
}

/// Writes snapshots in one format
#[derive(Debug, Clone)]
pub struct Exporter {
    format: ExportFormat,
    /// Slot columns per text row
    width: usize,
}

impl Exporter {
    /// Create a new exporter; `width` is the configured per-site buffer size
    pub fn new(format: ExportFormat, width: usize) -> Self {
        Self { format, width }
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    /// Write `rows` to `writer`
    pub fn export<W: Write>(&self, rows: &[TraceRow], writer: W) -> Result<()> {
        debug!("Exporting {} sites to {:?} format", rows.len(), self.format);

        match self.format {
            ExportFormat::Text => self.export_text(rows, writer),
            ExportFormat::Json => self.export_json(rows, writer),
        }
    }

    /// Render `rows` into memory
    pub fn export_to_vec(&self, rows: &[TraceRow]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.export(rows, &mut out)?;
        Ok(out)
    }

    fn export_text<W: Write>(&self, rows: &[TraceRow], writer: W) -> Result<()> {
        let mut csv = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(writer);

        let header = SITE_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(SiteBuffer::column_names(self.width));
        csv.write_record(header).map_err(text_error)?;

        for row in rows {
            let info = &row.info;
            let mut record = vec![
                info.class_name.clone(),
                info.method_name.clone(),
                info.method_desc.clone(),
                info.method_hash.clone(),
                info.line.to_string(),
                info.instruction_index.to_string(),
                info.attributes_cell(),
                info.event_kind.clone(),
                info.value_kind.to_string(),
            ];
            match &row.buffer {
                Some(buffer) => record.extend(buffer.lock().csv_cells(self.width)),
                None => record.extend(SiteBuffer::empty_cells(self.width)),
            }
            csv.write_record(&record).map_err(text_error)?;
        }

        csv.flush()?;
        Ok(())
    }

    fn export_json<W: Write>(&self, rows: &[TraceRow], writer: W) -> Result<()> {
        let events: Vec<SiteRecord<'_>> = rows
            .iter()
            .map(|row| {
                let skip_values = row.info.skips_values();
                let columns = match &row.buffer {
                    Some(buffer) => buffer.lock().columns(skip_values),
                    None => BufferColumns::empty(skip_values),
                };
                SiteRecord {
                    info: &row.info,
                    columns,
                }
            })
            .collect();

        let document = TraceDocument {
            format: FORMAT_NAME,
            events,
        };
        serde_json::to_writer(writer, &document).map_err(|e| {
            TraceError::SerializationFailed(format!("JSON serialization error: {}", e))
        })
    }
}

fn text_error(e: csv::Error) -> TraceError {
    if e.is_io_error() {
        match e.into_kind() {
            csv::ErrorKind::Io(io) => TraceError::Io(io),
            other => TraceError::SerializationFailed(format!("CSV error: {:?}", other)),
        }
    } else {
        TraceError::SerializationFailed(format!("CSV error: {}", e))
    }
}

// JSON document structures
#[derive(Serialize)]
struct TraceDocument<'a> {
    format: &'a str,
    events: Vec<SiteRecord<'a>>,
}

struct SiteRecord<'a> {
    info: &'a SiteInfo,
    columns: BufferColumns,
}

impl Serialize for SiteRecord<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let info = self.info;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("cname", &info.class_name)?;
        map.serialize_entry("mname", &info.method_name)?;
        map.serialize_entry("mdesc", &info.method_desc)?;
        map.serialize_entry("mhash", &info.method_hash)?;
        map.serialize_entry("line", &info.line)?;
        map.serialize_entry("inst", &info.instruction_index)?;
        map.serialize_entry("event", &info.event_kind)?;
        map.serialize_entry("attr", &Attributes(&info.attributes))?;
        map.serialize_entry("vtype", &info.value_kind.to_string())?;
        map.serialize_entry("freq", &self.columns.freq)?;
        map.serialize_entry("record", &self.columns.record)?;
        if let Some(values) = &self.columns.value {
            map.serialize_entry("value", values)?;
        }
        map.serialize_entry("seqnum", &self.columns.seqnum)?;
        map.serialize_entry("thread", &self.columns.thread)?;
        map.end()
    }
}

/// Attribute pairs as a JSON object, keeping their order
struct Attributes<'a>(&'a [(String, String)]);

impl Serialize for Attributes<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}
