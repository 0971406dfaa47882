// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Table File Formats
// ─────────────────────────────────────────────────────────────────────
//! Comma-separated RPM × kPa tables.
//!
//! ```text
//! RPM/kPa,20,40,60,80,100
//! 1000,62.1000,64.5000,,70.2500,72.0000
//! ```
//!
//! VE tables carry absolute values with exactly four decimals; correction
//! grids carry signed percentages with two decimals; coverage grids carry
//! integer counts. An empty cell is "no data" and round-trips as empty.

use vecal_types::{BinAxes, CoverageGrid, Grid, ValueGrid, VecalError, VecalResult};
use vecal_types::numeric::round_places;

/// Fixed first cell of the header row.
pub const HEADER_LABEL: &str = "RPM/kPa";

/// Leading characters spreadsheet tools treat as formula triggers.
const FORMULA_TRIGGERS: [char; 6] = ['=', '+', '-', '@', '\t', '\r'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellFormat {
    /// Absolute VE, `{:.4}`.
    Ve,
    /// Signed percentage, `{:+.2}`.
    SignedPct,
}

impl CellFormat {
    fn places(self) -> u32 {
        match self {
            CellFormat::Ve => 4,
            CellFormat::SignedPct => 2,
        }
    }

    pub fn render(self, value: f64) -> String {
        // Adding 0.0 folds -0.0 into +0.0.
        let v = round_places(value, self.places()) + 0.0;
        match self {
            CellFormat::Ve => format!("{v:.4}"),
            CellFormat::SignedPct => format!("{v:+.2}"),
        }
    }
}

/// Prefix a neutral quote onto text a spreadsheet could evaluate.
/// Well-formed numbers are left alone so signed percentages stay numeric.
pub fn escape_cell(text: &str) -> String {
    match text.chars().next() {
        Some(c) if FORMULA_TRIGGERS.contains(&c) && !is_plain_number(text) => {
            format!("'{text}")
        }
        _ => text.to_string(),
    }
}

fn unescape_cell(text: &str) -> &str {
    text.strip_prefix('\'').unwrap_or(text)
}

fn is_plain_number(text: &str) -> bool {
    let body = text.strip_prefix(['+', '-']).unwrap_or(text);
    !body.is_empty()
        && body.chars().all(|c| c.is_ascii_digit() || c == '.')
        && body.chars().filter(|c| *c == '.').count() <= 1
        && body.chars().any(|c| c.is_ascii_digit())
}

fn axis_label(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

fn header_line(axes: &BinAxes) -> String {
    let mut cells = vec![escape_cell(HEADER_LABEL)];
    cells.extend(axes.kpa.iter().map(|k| escape_cell(&axis_label(*k))));
    cells.join(",")
}

/// Render an optional-value grid in the given cell format.
pub fn render_value_grid(grid: &ValueGrid, format: CellFormat) -> String {
    let axes = grid.axes();
    let mut out = header_line(axes);
    out.push('\n');
    for (row, rpm) in axes.rpm.iter().enumerate() {
        let mut cells = vec![escape_cell(&axis_label(*rpm))];
        for col in 0..axes.cols() {
            let cell = grid.value(vecal_types::CellIndex { row, col });
            cells.push(match cell {
                Some(v) => escape_cell(&format.render(v)),
                None => String::new(),
            });
        }
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

pub fn render_coverage_grid(grid: &CoverageGrid) -> String {
    let axes = grid.axes();
    let mut out = header_line(axes);
    out.push('\n');
    for (row, rpm) in axes.rpm.iter().enumerate() {
        let mut cells = vec![escape_cell(&axis_label(*rpm))];
        for col in 0..axes.cols() {
            cells.push(grid.get(vecal_types::CellIndex { row, col }).to_string());
        }
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

/// Parse a table/grid file into an optional-value grid.
///
/// `source` names the file in error messages.
pub fn parse_value_grid(text: &str, source: &str) -> VecalResult<ValueGrid> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut lines = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| VecalError::Format(format!("{source}: empty table")))?;
    let header_cells: Vec<&str> = header.split(',').map(str::trim).collect();
    if header_cells.len() < 2 {
        return Err(VecalError::Format(format!(
            "{source}: header needs a label and at least one kPa bin"
        )));
    }
    let corner = unescape_cell(header_cells[0]);
    if !corner.eq_ignore_ascii_case(HEADER_LABEL) {
        return Err(VecalError::Format(format!(
            "{source}: header label '{corner}' is not '{HEADER_LABEL}'"
        )));
    }
    let kpa = header_cells[1..]
        .iter()
        .map(|c| parse_number(unescape_cell(c), source, "kPa bin"))
        .collect::<VecalResult<Vec<f64>>>()?;

    let mut rpm = Vec::new();
    let mut cells = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let row: Vec<&str> = line.split(',').map(str::trim).collect();
        if row.len() != header_cells.len() {
            return Err(VecalError::Format(format!(
                "{source}: data row {} has {} cells, header has {}",
                line_no + 1,
                row.len(),
                header_cells.len()
            )));
        }
        rpm.push(parse_number(unescape_cell(row[0]), source, "rpm bin")?);
        for cell in &row[1..] {
            let cell = unescape_cell(cell);
            if cell.is_empty() {
                cells.push(None);
            } else {
                cells.push(Some(parse_number(cell, source, "cell")?));
            }
        }
    }
    if rpm.is_empty() {
        return Err(VecalError::Format(format!("{source}: table has no data rows")));
    }

    let axes = BinAxes::new(rpm, kpa)
        .map_err(|e| VecalError::Format(format!("{source}: {e}")))?;
    Grid::from_cells(axes, cells)
}

fn parse_number(text: &str, source: &str, what: &str) -> VecalResult<f64> {
    let value: f64 = text
        .parse()
        .map_err(|_| VecalError::Format(format!("{source}: invalid {what} '{text}'")))?;
    if !value.is_finite() {
        return Err(VecalError::Format(format!(
            "{source}: non-finite {what} '{text}'"
        )));
    }
    Ok(value)
}

/// Named absolute VE table. Read-only reference data; apply always
/// produces a new table.
#[derive(Debug, Clone, PartialEq)]
pub struct VeTable {
    pub name: String,
    pub grid: ValueGrid,
}

impl VeTable {
    pub fn parse(name: &str, text: &str) -> VecalResult<Self> {
        let grid = parse_value_grid(text, name)?;
        if let Some((idx, v)) = grid
            .iter()
            .find_map(|(idx, v)| v.filter(|x| *x <= 0.0).map(|x| (idx, x)))
        {
            return Err(VecalError::Format(format!(
                "{name}: VE must be positive, found {v} at row {} col {}",
                idx.row, idx.col
            )));
        }
        Ok(Self {
            name: name.to_string(),
            grid,
        })
    }

    pub fn render(&self) -> String {
        render_value_grid(&self.grid, CellFormat::Ve)
    }
}

/// Signed percentage VE corrections on the same axes as a VE table.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionGrid {
    pub grid: ValueGrid,
}

impl CorrectionGrid {
    pub fn parse(name: &str, text: &str) -> VecalResult<Self> {
        let grid = parse_value_grid(text, name)?;
        if let Some(v) = grid.cells().iter().flatten().find(|v| **v <= -100.0) {
            return Err(VecalError::Format(format!(
                "{name}: correction {v}% would zero or invert VE"
            )));
        }
        Ok(Self { grid })
    }

    pub fn render(&self) -> String {
        render_value_grid(&self.grid, CellFormat::SignedPct)
    }
}
