//! Dataset encoders and the streaming export service.
//!
//! Portals are exported as KML (one placemark per portal, grouped in a
//! folder named after the dataset) or CSV with configurable formatting.
//! Both encoders consume [`PortalStore::list_stream`] record by record.
//!
//! # Example
//!
//! ```ignore
//! use discoverer_core::export::{DatasetFormat, ExportConfig, ExportService};
//! use std::io::stdout;
//!
//! let export_service = ExportService::new(store);
//! let mut writer = stdout().lock();
//! let count = export_service
//!     .export_to_writer(&mut writer, DatasetFormat::Csv, &ExportConfig::default(), Utc::now())
//!     .await?;
//! println!("Exported {} portals", count);
//! ```
//!
//! Note: This example uses `ignore` because it requires a concrete
//! [`PortalStore`] implementation which cannot be easily provided in a doctest.

use std::io::Write;

use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::geo::Polygon;
use crate::identity::sha256_hex;
use crate::models::PortalRecord;
use crate::traits::PortalStore;

/// Supported dataset formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFormat {
    /// KML document with an `ingressportal` schema.
    Kml,
    /// Comma (or otherwise) separated values.
    Csv,
}

impl DatasetFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetFormat::Kml => "kml",
            DatasetFormat::Csv => "csv",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            DatasetFormat::Kml => "application/vnd.google-earth.kml+xml",
            DatasetFormat::Csv => "text/csv; charset=utf-8",
        }
    }
}

impl std::fmt::Display for DatasetFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown dataset format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDatasetFormatError(String);

impl std::fmt::Display for ParseDatasetFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid dataset format: '{}' (expected kml or csv)", self.0)
    }
}

impl std::error::Error for ParseDatasetFormatError {}

impl std::str::FromStr for DatasetFormat {
    type Err = ParseDatasetFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kml" => Ok(DatasetFormat::Kml),
            "csv" => Ok(DatasetFormat::Csv),
            _ => Err(ParseDatasetFormatError(s.to_string())),
        }
    }
}

// =============================================================================
// Export configuration
// =============================================================================

/// CSV formatting options.
///
/// Quoting is minimal: a field is quoted only when it contains the
/// delimiter, the quote character, or a line break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvOptions {
    pub delimiter: char,
    pub quote_char: char,
    pub line_terminator: String,
    /// Double embedded quote characters. When false, `escape_char` is used instead.
    pub double_quote: bool,
    pub escape_char: Option<char>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote_char: '"',
            line_terminator: "\r\n".to_string(),
            double_quote: true,
            escape_char: None,
        }
    }
}

impl CsvOptions {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.delimiter == self.quote_char {
            return Err(AppError::ConfigError(
                "CSV delimiter and quote character must differ".to_string(),
            ));
        }
        if self.line_terminator.is_empty() {
            return Err(AppError::ConfigError(
                "CSV line terminator must not be empty".to_string(),
            ));
        }
        if !self.double_quote && self.escape_char.is_none() {
            return Err(AppError::ConfigError(
                "CSV escape character is required when double_quote is off".to_string(),
            ));
        }
        Ok(())
    }

    fn needs_quoting(&self, field: &str) -> bool {
        field
            .chars()
            .any(|c| c == self.delimiter || c == self.quote_char || c == '\n' || c == '\r')
    }

    fn escape_field(&self, field: &str) -> String {
        if !self.needs_quoting(field) {
            return field.to_string();
        }

        let mut out = String::with_capacity(field.len() + 2);
        out.push(self.quote_char);
        for c in field.chars() {
            if c == self.quote_char {
                match (self.double_quote, self.escape_char) {
                    (true, _) => out.push(self.quote_char),
                    (false, Some(escape)) => out.push(escape),
                    (false, None) => {}
                }
            } else if Some(c) == self.escape_char {
                out.push(c);
            }
            out.push(c);
        }
        out.push(self.quote_char);
        out
    }

    fn write_row<W: Write>(&self, writer: &mut W, fields: &[String]) -> Result<(), AppError> {
        let mut line = String::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                line.push(self.delimiter);
            }
            line.push_str(&self.escape_field(field));
        }
        line.push_str(&self.line_terminator);
        writer.write_all(line.as_bytes()).map_err(io_error)
    }
}

/// Everything besides the format that determines a dataset's content.
///
/// Two requests with equal configs (and format, and source token) share an
/// artifact; see [`ExportConfig::config_hash`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Folder name in KML output. Defaults to `OPS-mmddyy` of the build date.
    pub title: Option<String>,
    pub csv: CsvOptions,
    /// Only portals discovered on or after this date.
    pub discovered_after: Option<NaiveDate>,
    /// Only portals tagged with this region.
    pub region: Option<String>,
    /// Only portals inside this polygon.
    pub bounds: Option<Polygon>,
}

impl ExportConfig {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_discovered_after(mut self, date: NaiveDate) -> Self {
        self.discovered_after = Some(date);
        self
    }

    pub fn with_bounds(mut self, bounds: Polygon) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// SHA-256 of the canonical JSON encoding of this config.
    pub fn config_hash(&self) -> Result<String, AppError> {
        let canonical = serde_json::to_vec(self)?;
        Ok(sha256_hex(&canonical))
    }

    /// Returns true if the record passes every configured filter.
    pub fn matches(&self, record: &PortalRecord) -> bool {
        if let Some(after) = self.discovered_after {
            if record.discovered_at.date_naive() < after {
                return false;
            }
        }
        if let Some(region) = &self.region {
            if record.region.as_deref() != Some(region.as_str()) {
                return false;
            }
        }
        if let Some(bounds) = &self.bounds {
            if !bounds.contains(record.location) {
                return false;
            }
        }
        true
    }

    /// Title used for the dataset when none is configured.
    pub fn resolved_title(&self, built_at: DateTime<Utc>) -> String {
        match &self.title {
            Some(title) => title.clone(),
            None => default_dataset_title(built_at),
        }
    }
}

/// `OPS-mmddyy` of the given date.
pub fn default_dataset_title(at: DateTime<Utc>) -> String {
    format!("OPS-{}", at.format("%m%d%y"))
}

// =============================================================================
// Encoders
// =============================================================================

const CSV_HEADER: [&str; 6] = [
    "guid",
    "name",
    "longitude",
    "latitude",
    "score_region",
    "discovery date",
];

/// Incremental writer for one dataset format.
enum Encoder<'a> {
    Kml { title: String },
    Csv { options: &'a CsvOptions },
}

impl<'a> Encoder<'a> {
    fn new(format: DatasetFormat, config: &'a ExportConfig, built_at: DateTime<Utc>) -> Self {
        match format {
            DatasetFormat::Kml => Encoder::Kml {
                title: config.resolved_title(built_at),
            },
            DatasetFormat::Csv => Encoder::Csv {
                options: &config.csv,
            },
        }
    }

    fn begin<W: Write>(&self, writer: &mut W) -> Result<(), AppError> {
        match self {
            Encoder::Kml { title } => {
                write!(
                    writer,
                    concat!(
                        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
                        "<kml xmlns=\"http://www.opengis.net/kml/2.2\">\n",
                        "<Document>\n",
                        "<Schema name=\"ingressportal\" id=\"ip\">\n",
                        "<SimpleField name=\"LAT\" type=\"float\"/>\n",
                        "<SimpleField name=\"LNG\" type=\"float\"/>\n",
                        "<SimpleField name=\"REGION\" type=\"string\"/>\n",
                        "<SimpleField name=\"GUID\" type=\"string\"/>\n",
                        "</Schema>\n",
                        "<Folder>\n",
                        "<name>{}</name>\n"
                    ),
                    escape_xml(title)
                )
                .map_err(io_error)
            }
            Encoder::Csv { options } => {
                let header: Vec<String> = CSV_HEADER.iter().map(|h| h.to_string()).collect();
                options.write_row(writer, &header)
            }
        }
    }

    fn encode<W: Write>(&self, writer: &mut W, record: &PortalRecord) -> Result<(), AppError> {
        match self {
            Encoder::Kml { .. } => write_placemark(writer, record),
            Encoder::Csv { options } => {
                let row = vec![
                    record.guid.clone().unwrap_or_default(),
                    record.name.clone(),
                    format!("{:.6}", record.location.lng()),
                    format!("{:.6}", record.location.lat()),
                    record.region.clone().unwrap_or_default(),
                    discovery_date(record).format("%Y-%m-%d %H:%M:%S").to_string(),
                ];
                options.write_row(writer, &row)
            }
        }
    }

    fn finish<W: Write>(&self, writer: &mut W) -> Result<(), AppError> {
        match self {
            Encoder::Kml { .. } => {
                writer
                    .write_all(b"</Folder>\n</Document>\n</kml>\n")
                    .map_err(io_error)?;
            }
            Encoder::Csv { .. } => {}
        }
        writer.flush().map_err(io_error)
    }
}

fn write_placemark<W: Write>(writer: &mut W, record: &PortalRecord) -> Result<(), AppError> {
    let lat = format!("{:.6}", record.location.lat());
    let lng = format!("{:.6}", record.location.lng());

    let mut schema_data = format!(
        "<SimpleData name=\"LNG\">{}</SimpleData><SimpleData name=\"LAT\">{}</SimpleData>",
        lng, lat
    );
    if let Some(region) = &record.region {
        schema_data.push_str(&format!(
            "<SimpleData name=\"REGION\">{}</SimpleData>",
            escape_xml(region)
        ));
    }
    if let Some(guid) = &record.guid {
        schema_data.push_str(&format!(
            "<SimpleData name=\"GUID\">{}</SimpleData>",
            escape_xml(guid)
        ));
    }

    write!(
        writer,
        concat!(
            "<Placemark>\n",
            "<name>{name}</name>\n",
            "<description>{description}</description>\n",
            "<Point><coordinates>{lng},{lat}</coordinates></Point>\n",
            "<TimeStamp><when>{when}</when></TimeStamp>\n",
            "<ExtendedData><SchemaData schemaUrl=\"#ip\">{schema_data}</SchemaData></ExtendedData>\n",
            "</Placemark>\n"
        ),
        name = escape_xml(&record.name),
        description = escape_xml(&record.intel_url()),
        lng = lng,
        lat = lat,
        when = discovery_date(record).format("%Y-%m-%d"),
        schema_data = schema_data,
    )
    .map_err(io_error)
}

/// Timestamp of the first recorded observation.
fn discovery_date(record: &PortalRecord) -> DateTime<Utc> {
    record
        .history
        .first()
        .map(|v| v.observed_at)
        .unwrap_or(record.discovered_at)
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn io_error(e: std::io::Error) -> AppError {
    AppError::StorageError(e.to_string())
}

// =============================================================================
// Export service
// =============================================================================

/// Service for rendering portal datasets in streaming mode.
///
/// Uses [`PortalStore::list_stream`] to fetch records incrementally.
pub struct ExportService<S>
where
    S: PortalStore,
{
    store: S,
}

impl<S> Clone for ExportService<S>
where
    S: PortalStore + Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S> ExportService<S>
where
    S: PortalStore,
{
    /// Creates a new export service with the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Writes every record matching `config` to `writer`.
    ///
    /// Returns the number of portals exported.
    pub async fn export_to_writer<W: Write>(
        &self,
        writer: &mut W,
        format: DatasetFormat,
        config: &ExportConfig,
        built_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        if format == DatasetFormat::Csv {
            config.csv.validate()?;
        }

        let encoder = Encoder::new(format, config, built_at);
        let mut stream = self.store.list_stream();
        let mut count = 0u64;

        encoder.begin(writer)?;
        while let Some(result) = stream.next().await {
            let record = result?;
            if !config.matches(&record) {
                continue;
            }
            encoder.encode(writer, &record)?;
            count += 1;
        }
        encoder.finish(writer)?;

        Ok(count)
    }

    /// Renders a complete dataset payload into memory.
    pub async fn render(
        &self,
        format: DatasetFormat,
        config: &ExportConfig,
        built_at: DateTime<Utc>,
    ) -> Result<Vec<u8>, AppError> {
        let mut buf = Vec::new();
        self.export_to_writer(&mut buf, format, config, built_at)
            .await?;
        Ok(buf)
    }
}
