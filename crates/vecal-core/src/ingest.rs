// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Record Ingestion & Validation
// ─────────────────────────────────────────────────────────────────────
//! Delimited dyno log → validated [`SensorRecord`]s.
//!
//! Decoding accepts UTF-8 (BOM optional) and falls back to Windows-1252.
//! The delimiter is picked from the header row among comma, tab and
//! semicolon. Out-of-range rows are dropped and tallied by reason; they
//! never abort the run.

use std::path::Path;

use serde::{Deserialize, Serialize};

use vecal_artifacts::{detect_delimiter, split_fields};
use vecal_types::{
    AfrPair, Bank, CalibrationConfig, LoadProxy, PhysicalLimits, RejectReason, RejectionTally,
    SensorRecord, VecalError, VecalResult, BANK_COUNT,
};

use crate::dialect::{select_dialect, ColumnMap, LoadKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    Utf8,
    Utf8Bom,
    Windows1252,
}

/// Decode raw log bytes. Invalid UTF-8 is re-read as Windows-1252.
pub fn decode_text(bytes: &[u8]) -> (String, TextEncoding) {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        if let Ok(text) = std::str::from_utf8(rest) {
            return (text.to_string(), TextEncoding::Utf8Bom);
        }
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), TextEncoding::Utf8),
        Err(_) => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            log::warn!("log is not valid UTF-8; decoded as Windows-1252");
            (text.into_owned(), TextEncoding::Windows1252)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub dialect: String,
    pub delimiter: String,
    pub encoding: TextEncoding,
    pub columns: Vec<String>,
    /// Banks with a complete commanded/measured AFR pair in the header.
    pub banks: Vec<Bank>,
    pub rows_read: usize,
    pub records_accepted: usize,
    pub rejections: RejectionTally,
}

#[derive(Debug, Clone)]
pub struct IngestOutput {
    pub records: Vec<SensorRecord>,
    pub report: IngestReport,
}

/// Parse and validate a whole log held in memory. `source` names the log
/// in error messages.
pub fn ingest_bytes(
    bytes: &[u8],
    source: &str,
    config: &CalibrationConfig,
) -> VecalResult<IngestOutput> {
    let (text, encoding) = decode_text(bytes);
    let mut lines = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty());

    let header_line = lines
        .next()
        .ok_or_else(|| VecalError::EmptyInput(format!("{source}: no header row")))?;
    let delimiter = detect_delimiter(header_line);
    let columns = split_fields(header_line, delimiter).ok_or_else(|| {
        VecalError::Format(format!("{source}: unterminated quote in header row"))
    })?;
    let map = select_dialect(&columns)?;
    log::info!(
        "{source}: dialect={} delimiter={:?} encoding={:?} banks={}",
        map.dialect,
        delimiter,
        encoding,
        map.banks().count()
    );

    let mut records = Vec::new();
    let mut rejections = RejectionTally::new();
    let mut rows_read = 0usize;
    for line in lines {
        rows_read += 1;
        match parse_row(line, delimiter, &map, &config.limits) {
            Ok(record) => records.push(record),
            Err(reason) => rejections.record(reason),
        }
    }
    if rows_read == 0 {
        return Err(VecalError::EmptyInput(format!(
            "{source}: header present but no data rows"
        )));
    }

    if !rejections.is_empty() {
        for (reason, count) in rejections.iter() {
            log::warn!("{source}: rejected {count} rows ({})", reason.as_str());
        }
    }
    log::info!(
        "{source}: {} of {rows_read} rows accepted",
        records.len()
    );

    let report = IngestReport {
        dialect: map.dialect.to_string(),
        delimiter: delimiter.to_string(),
        encoding,
        columns,
        banks: map.banks().collect(),
        rows_read,
        records_accepted: records.len(),
        rejections,
    };
    Ok(IngestOutput { records, report })
}

pub fn ingest_path(path: &Path, config: &CalibrationConfig) -> VecalResult<IngestOutput> {
    let bytes = std::fs::read(path).map_err(|e| VecalError::io(path, e))?;
    ingest_bytes(&bytes, &path.display().to_string(), config)
}

// ── Row validation ──────────────────────────────────────────────────

fn parse_required(text: &str) -> Result<f64, RejectReason> {
    let v: f64 = text.parse().map_err(|_| RejectReason::Unparseable)?;
    if v.is_finite() {
        Ok(v)
    } else {
        Err(RejectReason::Unparseable)
    }
}

fn parse_optional(fields: &[String], col: Option<usize>) -> Result<Option<f64>, RejectReason> {
    match col.map(|i| fields[i].as_str()) {
        None | Some("") => Ok(None),
        Some(text) => parse_required(text).map(Some),
    }
}

/// Validate one data row. The first failing check decides the reason.
pub fn parse_row(
    line: &str,
    delimiter: char,
    map: &ColumnMap,
    limits: &PhysicalLimits,
) -> Result<SensorRecord, RejectReason> {
    let fields = split_fields(line, delimiter).ok_or(RejectReason::Malformed)?;
    if fields.len() != map.width {
        return Err(RejectReason::Malformed);
    }

    let rpm = parse_required(&fields[map.rpm])?;
    let map_kpa = parse_required(&fields[map.map_kpa])?;
    let (load_kind, load_col) = map.load;
    if fields[load_col].is_empty() {
        return Err(RejectReason::LoadInvalid);
    }
    let load_value = parse_required(&fields[load_col])?;

    let mut afr: [Option<AfrPair>; BANK_COUNT] = [None; BANK_COUNT];
    for bank in Bank::ALL {
        if let Some(cols) = map.afr[bank.index()] {
            let commanded = parse_optional(&fields, Some(cols.commanded))?;
            let measured = parse_optional(&fields, Some(cols.measured))?;
            if let (Some(commanded), Some(measured)) = (commanded, measured) {
                afr[bank.index()] = Some(AfrPair {
                    commanded,
                    measured,
                });
            }
        }
    }
    let knock_retard_deg = parse_optional(&fields, map.knock_retard)?;
    let iat_f = parse_optional(&fields, map.iat)?;
    let tps_pct = parse_optional(&fields, map.tps)?;

    if !limits.rpm.contains(rpm) {
        return Err(RejectReason::RpmInvalid);
    }
    if !limits.map_kpa.contains(map_kpa) {
        return Err(RejectReason::MapOutOfRange);
    }
    let load = match load_kind {
        LoadKind::Torque => LoadProxy::TorqueFtLb(load_value),
        LoadKind::Horsepower => LoadProxy::Horsepower(load_value),
    };
    if afr
        .iter()
        .flatten()
        .any(|p| !limits.afr.contains(p.commanded) || !limits.afr.contains(p.measured))
    {
        return Err(RejectReason::AfrOutOfRange);
    }
    if iat_f.is_some_and(|v| !limits.iat_f.contains(v)) {
        return Err(RejectReason::IatOutOfRange);
    }
    if tps_pct.is_some_and(|v| !limits.tps_pct.contains(v)) {
        return Err(RejectReason::TpsOutOfRange);
    }

    Ok(SensorRecord {
        rpm,
        map_kpa,
        load,
        afr,
        knock_retard_deg,
        iat_f,
        tps_pct,
    })
}
