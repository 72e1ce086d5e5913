//! Streaming scanner-report parser.
//!
//! Walks `Results[*].Vulnerabilities[*]` of the vendor JSON report without
//! ever materializing the outer `Results` array - that axis is unbounded
//! (hundreds of megabytes for a large repository), while each inner entry
//! is small. At any moment the parser holds one vendor entry plus at most
//! one in-flight batch of mapped records.
//!
//! Only entries with `Severity == "CRITICAL"` survive; vendor PascalCase
//! fields map to the internal shape with `"unknown"` defaults for missing
//! identifiers and `""` for missing narrative fields.

use std::fmt;
use std::io::Read;

use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserializer;
use vulnd_core::scan::Vulnerability;

/// The only severity that enters the system.
pub const CRITICAL_SEVERITY: &str = "CRITICAL";

/// Report parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The report file could not be read.
    #[error("failed to read scanner report: {0}")]
    Io(#[from] std::io::Error),

    /// The report is not the expected JSON shape.
    #[error("malformed scanner report: {0}")]
    Json(#[from] serde_json::Error),

    /// The batch consumer refused a batch (e.g. the IPC channel closed).
    #[error("batch delivery failed: {0}")]
    Sink(String),
}

/// Vendor vulnerability entry. Everything is optional upstream.
#[derive(Debug, serde::Deserialize)]
struct RawVulnerability {
    #[serde(rename = "VulnerabilityID")]
    vulnerability_id: Option<String>,
    #[serde(rename = "PkgName")]
    pkg_name: Option<String>,
    #[serde(rename = "InstalledVersion")]
    installed_version: Option<String>,
    #[serde(rename = "FixedVersion")]
    fixed_version: Option<String>,
    #[serde(rename = "Severity")]
    severity: Option<String>,
    #[serde(rename = "Title")]
    title: Option<String>,
    #[serde(rename = "Description")]
    description: Option<String>,
}

fn map_vulnerability(raw: RawVulnerability) -> Vulnerability {
    Vulnerability {
        id: raw.vulnerability_id.unwrap_or_else(|| "unknown".to_string()),
        package: raw.pkg_name.unwrap_or_else(|| "unknown".to_string()),
        installed_version: raw
            .installed_version
            .unwrap_or_else(|| "unknown".to_string()),
        fixed_version: raw.fixed_version,
        severity: CRITICAL_SEVERITY.to_string(),
        title: raw.title.unwrap_or_default(),
        description: raw.description.unwrap_or_default(),
    }
}

/// Parse a scanner report from `reader`, delivering CRITICAL entries to
/// `on_batch` in batches of at most `batch_size`, in report order. The tail
/// batch is flushed at end-of-stream. Returns the number of delivered
/// records.
///
/// # Errors
///
/// Returns [`ParseError::Json`] for malformed reports, [`ParseError::Io`]
/// for read failures, and [`ParseError::Sink`] when `on_batch` refuses a
/// batch (parsing stops immediately).
pub fn parse_report<R, F>(reader: R, batch_size: usize, on_batch: F) -> Result<u64, ParseError>
where
    R: Read,
    F: FnMut(Vec<Vulnerability>) -> Result<(), String>,
{
    let mut walker = Walker {
        batch_size: batch_size.max(1),
        batch: Vec::new(),
        on_batch,
        delivered: 0,
        sink_error: None,
    };

    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    let result = ReportSeed {
        walker: &mut walker,
    }
    .deserialize(&mut deserializer);

    if let Err(json_error) = result {
        if let Some(message) = walker.sink_error.take() {
            return Err(ParseError::Sink(message));
        }
        return Err(ParseError::Json(json_error));
    }

    walker.flush().map_err(ParseError::Sink)?;
    Ok(walker.delivered)
}

/// Accumulates filtered records and pushes full batches to the consumer.
struct Walker<F> {
    batch_size: usize,
    batch: Vec<Vulnerability>,
    on_batch: F,
    delivered: u64,
    sink_error: Option<String>,
}

impl<F> Walker<F>
where
    F: FnMut(Vec<Vulnerability>) -> Result<(), String>,
{
    fn push(&mut self, vulnerability: Vulnerability) -> Result<(), String> {
        self.batch.push(vulnerability);
        if self.batch.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), String> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.batch);
        let count = batch.len() as u64;
        match (self.on_batch)(batch) {
            Ok(()) => {
                self.delivered += count;
                Ok(())
            },
            Err(message) => {
                self.sink_error = Some(message.clone());
                Err(message)
            },
        }
    }
}

/// Seed for the top-level report object: finds `Results`, skips the rest.
struct ReportSeed<'w, F> {
    walker: &'w mut Walker<F>,
}

impl<'de, F> DeserializeSeed<'de> for ReportSeed<'_, F>
where
    F: FnMut(Vec<Vulnerability>) -> Result<(), String>,
{
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de, F> Visitor<'de> for ReportSeed<'_, F>
where
    F: FnMut(Vec<Vulnerability>) -> Result<(), String>,
{
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a scanner report object")
    }

    fn visit_map<A>(self, mut map: A) -> Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<String>()? {
            if key == "Results" {
                map.next_value_seed(ResultsSeed {
                    walker: &mut *self.walker,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

/// Seed for the `Results` array. `null` is valid (no results).
struct ResultsSeed<'w, F> {
    walker: &'w mut Walker<F>,
}

impl<'de, F> DeserializeSeed<'de> for ResultsSeed<'_, F>
where
    F: FnMut(Vec<Vulnerability>) -> Result<(), String>,
{
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }
}

impl<'de, F> Visitor<'de> for ResultsSeed<'_, F>
where
    F: FnMut(Vec<Vulnerability>) -> Result<(), String>,
{
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a Results array or null")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while seq
            .next_element_seed(ResultEntrySeed {
                walker: &mut *self.walker,
            })?
            .is_some()
        {}
        Ok(())
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_none<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }
}

/// Seed for one `Results` entry: finds `Vulnerabilities`, skips the rest.
struct ResultEntrySeed<'w, F> {
    walker: &'w mut Walker<F>,
}

impl<'de, F> DeserializeSeed<'de> for ResultEntrySeed<'_, F>
where
    F: FnMut(Vec<Vulnerability>) -> Result<(), String>,
{
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de, F> Visitor<'de> for ResultEntrySeed<'_, F>
where
    F: FnMut(Vec<Vulnerability>) -> Result<(), String>,
{
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a Results entry object")
    }

    fn visit_map<A>(self, mut map: A) -> Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<String>()? {
            if key == "Vulnerabilities" {
                map.next_value_seed(VulnerabilityListSeed {
                    walker: &mut *self.walker,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

/// Seed for one `Vulnerabilities` array. `null` is valid (clean target).
struct VulnerabilityListSeed<'w, F> {
    walker: &'w mut Walker<F>,
}

impl<'de, F> DeserializeSeed<'de> for VulnerabilityListSeed<'_, F>
where
    F: FnMut(Vec<Vulnerability>) -> Result<(), String>,
{
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }
}

impl<'de, F> Visitor<'de> for VulnerabilityListSeed<'_, F>
where
    F: FnMut(Vec<Vulnerability>) -> Result<(), String>,
{
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a Vulnerabilities array or null")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while let Some(raw) = seq.next_element::<RawVulnerability>()? {
            if raw.severity.as_deref() != Some(CRITICAL_SEVERITY) {
                continue;
            }
            self.walker
                .push(map_vulnerability(raw))
                .map_err(de::Error::custom)?;
        }
        Ok(())
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_none<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }
}
