// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Delimited Text
// ─────────────────────────────────────────────────────────────────────
//! Delimiter sniffing and quote-aware field splitting, shared by log
//! ingestion and manifest shape measurement.

const CANDIDATE_DELIMITERS: [char; 3] = [',', '\t', ';'];

/// Most frequent candidate delimiter outside quotes. Ties keep the
/// earlier candidate; a header with none of them is treated as comma.
pub fn detect_delimiter(header: &str) -> char {
    let mut counts = [0usize; CANDIDATE_DELIMITERS.len()];
    let mut in_quotes = false;
    for c in header.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if !in_quotes {
            if let Some(i) = CANDIDATE_DELIMITERS.iter().position(|d| *d == c) {
                counts[i] += 1;
            }
        }
    }
    let mut best = 0;
    for i in 1..counts.len() {
        if counts[i] > counts[best] {
            best = i;
        }
    }
    CANDIDATE_DELIMITERS[best]
}

/// Split one line on `delim`, honouring double quotes (`""` inside a
/// quoted field is a literal quote). Returns `None` for an unterminated
/// quote. Fields are trimmed.
pub fn split_fields(line: &str, delim: char) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == delim {
            fields.push(field.trim().to_string());
            field.clear();
        } else {
            field.push(c);
        }
    }
    if in_quotes {
        return None;
    }
    fields.push(field.trim().to_string());
    Some(fields)
}
