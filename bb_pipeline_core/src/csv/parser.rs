// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Streaming CSV parser (C6)
//!
//! A bounded-memory, state-machine parser over file paths, byte streams,
//! or in-memory strings, with BOM-based encoding auto-detection and
//! cooperative pause/resume/stop for the async worker mode (spec.md §4.6).

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bb_pipeline_domain::error::CoreError;
use bb_pipeline_domain::value_objects::ParsedRow;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Utf16Le,
    Utf16Be,
    Ascii,
    AutoDetect,
}

#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub delimiter: u8,
    pub quote_char: u8,
    pub has_header: bool,
    pub strict_mode: bool,
    pub trim_whitespace: bool,
    pub skip_empty_rows: bool,
    pub buffer_size: usize,
    pub max_field_size: usize,
    pub max_row_size: usize,
    pub encoding: Encoding,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote_char: b'"',
            has_header: true,
            strict_mode: false,
            trim_whitespace: true,
            skip_empty_rows: true,
            buffer_size: 8192,
            max_field_size: 1024 * 1024,
            max_row_size: 10 * 1024 * 1024,
            encoding: Encoding::AutoDetect,
        }
    }
}

/// Row parser state machine (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowState {
    FieldStart,
    InUnquoted,
    InQuoted,
    QuoteInQuoted,
}

#[derive(Debug, Clone, Default)]
pub struct ParserStatsSnapshot {
    pub rows_parsed: u64,
    pub rows_skipped: u64,
    pub rows_with_errors: u64,
    pub bytes_read: u64,
    pub min_field_count: u64,
    pub max_field_count: u64,
    pub average_field_count: f64,
    pub parse_duration: Duration,
}

impl ParserStatsSnapshot {
    pub fn rows_per_second(&self) -> f64 {
        let secs = self.parse_duration.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.rows_parsed as f64 / secs
        }
    }

    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.parse_duration.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.bytes_read as f64 / secs
        }
    }
}

#[derive(Default)]
struct ParserStats {
    rows_parsed: AtomicU64,
    rows_skipped: AtomicU64,
    rows_with_errors: AtomicU64,
    bytes_read: AtomicU64,
    total_field_count: AtomicU64,
    min_field_count: AtomicU64,
    max_field_count: AtomicU64,
    duration: Mutex<Duration>,
}

impl ParserStats {
    fn new() -> Self {
        Self {
            min_field_count: AtomicU64::new(u64::MAX),
            ..Default::default()
        }
    }

    fn record_field_count(&self, count: u64) {
        self.total_field_count.fetch_add(count, Ordering::Relaxed);
        self.min_field_count.fetch_min(count, Ordering::Relaxed);
        self.max_field_count.fetch_max(count, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ParserStatsSnapshot {
        let rows_parsed = self.rows_parsed.load(Ordering::Relaxed);
        let min_field_count = self.min_field_count.load(Ordering::Relaxed);
        ParserStatsSnapshot {
            rows_parsed,
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            rows_with_errors: self.rows_with_errors.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            min_field_count: if min_field_count == u64::MAX { 0 } else { min_field_count },
            max_field_count: self.max_field_count.load(Ordering::Relaxed),
            average_field_count: if rows_parsed == 0 {
                0.0
            } else {
                self.total_field_count.load(Ordering::Relaxed) as f64 / rows_parsed as f64
            },
            parse_duration: *self.duration.lock(),
        }
    }
}

pub type RowCallback<'a> = dyn FnMut(&ParsedRow, Option<&CoreError>) -> bool + Send + 'a;
pub type ProgressCallback<'a> = dyn Fn(u64, u64, f64) + Send + 'a;
pub type ErrorCallback<'a> = dyn Fn(&CoreError, u64) + Send + 'a;

/// Cooperative control surface for the async worker mode: `pause`/`resume`
/// are observed at row boundaries via a condition variable, `stop` via an
/// atomic flag (spec.md §4.6).
#[derive(Clone)]
pub struct ParserControl {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    paused: Mutex<bool>,
    resume_signal: Condvar,
    should_stop: AtomicBool,
}

impl Default for ParserControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserControl {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                paused: Mutex::new(false),
                resume_signal: Condvar::new(),
                should_stop: AtomicBool::new(false),
            }),
        }
    }

    pub fn pause(&self) {
        *self.inner.paused.lock() = true;
    }

    pub fn resume(&self) {
        *self.inner.paused.lock() = false;
        self.inner.resume_signal.notify_all();
    }

    pub fn stop(&self) {
        self.inner.should_stop.store(true, Ordering::SeqCst);
        self.resume();
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.lock()
    }

    pub fn should_stop(&self) -> bool {
        self.inner.should_stop.load(Ordering::SeqCst)
    }

    fn wait_if_paused(&self) {
        let mut paused = self.inner.paused.lock();
        while *paused && !self.should_stop() {
            self.inner.resume_signal.wait(&mut paused);
        }
    }
}

/// C6. One parser instance is single-use: `run_*` consumes a fresh byte
/// source and dispatches rows through the registered callbacks.
pub struct StreamingParser<'a> {
    config: ParserConfig,
    stats: ParserStats,
    row_callback: Option<Box<RowCallback<'a>>>,
    progress_callback: Option<Box<ProgressCallback<'a>>>,
    error_callback: Option<Box<ErrorCallback<'a>>>,
    control: ParserControl,
}

impl<'a> StreamingParser<'a> {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            stats: ParserStats::new(),
            row_callback: None,
            progress_callback: None,
            error_callback: None,
            control: ParserControl::new(),
        }
    }

    pub fn control(&self) -> ParserControl {
        self.control.clone()
    }

    pub fn on_row(&mut self, callback: impl FnMut(&ParsedRow, Option<&CoreError>) -> bool + Send + 'a) {
        self.row_callback = Some(Box::new(callback));
    }

    pub fn on_progress(&mut self, callback: impl Fn(u64, u64, f64) + Send + 'a) {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn on_error(&mut self, callback: impl Fn(&CoreError, u64) + Send + 'a) {
        self.error_callback = Some(Box::new(callback));
    }

    pub fn stats(&self) -> ParserStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.rows_parsed.store(0, Ordering::Relaxed);
        self.stats.rows_skipped.store(0, Ordering::Relaxed);
        self.stats.rows_with_errors.store(0, Ordering::Relaxed);
        self.stats.bytes_read.store(0, Ordering::Relaxed);
        self.stats.total_field_count.store(0, Ordering::Relaxed);
        self.stats.min_field_count.store(u64::MAX, Ordering::Relaxed);
        self.stats.max_field_count.store(0, Ordering::Relaxed);
        *self.stats.duration.lock() = Duration::ZERO;
    }

    pub fn parse_file(&mut self, path: impl AsRef<Path>) -> Result<(), CoreError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CoreError::FileNotFound(path.display().to_string()),
            _ => CoreError::FileReadError(e.to_string()),
        })?;
        let total_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.parse_reader(BufReader::new(file), total_size)
    }

    pub fn parse_string(&mut self, content: &str) -> Result<(), CoreError> {
        let bytes = content.as_bytes().to_vec();
        let len = bytes.len() as u64;
        self.parse_reader(std::io::Cursor::new(bytes), len)
    }

    pub fn parse_reader<R: Read>(&mut self, mut reader: R, total_size: u64) -> Result<(), CoreError> {
        let start = Instant::now();
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).map_err(CoreError::from)?;
        self.stats.bytes_read.fetch_add(raw.len() as u64, Ordering::Relaxed);

        let decoded = decode_with_bom(&raw, self.config.encoding)?;
        let result = self.parse_decoded(&decoded, total_size);
        *self.stats.duration.lock() = start.elapsed();
        result
    }

    fn parse_decoded(&mut self, content: &str, total_size: u64) -> Result<(), CoreError> {
        let mut header: Option<Vec<String>> = None;
        let mut row_number: u64 = 0;
        let mut bytes_consumed: u64 = 0;
        let rows = RowSplitter::new(content, self.config.quote_char as char);

        for raw_row in rows {
            self.control.wait_if_paused();
            if self.control.should_stop() {
                break;
            }

            bytes_consumed += raw_row.len() as u64;
            if raw_row.len() > self.config.max_row_size {
                let err = CoreError::BufferOverflow(format!("row exceeds max_row_size ({} bytes)", raw_row.len()));
                self.report_error(&err, row_number);
                if self.config.strict_mode {
                    return Err(err);
                }
                continue;
            }

            let fields = match self.split_fields(raw_row) {
                Ok(fields) => fields,
                Err(err) => {
                    self.stats.rows_with_errors.fetch_add(1, Ordering::Relaxed);
                    self.report_error(&err, row_number);
                    if self.config.strict_mode {
                        return Err(err);
                    }
                    continue;
                }
            };

            if self.config.skip_empty_rows && fields.len() == 1 && fields[0].is_empty() {
                self.stats.rows_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if row_number == 0 && self.config.has_header && header.is_none() {
                header = Some(fields);
                row_number += 1;
                self.stats.rows_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            row_number += 1;
            self.stats.record_field_count(fields.len() as u64);
            let parsed = ParsedRow::new(row_number, fields, header.clone());

            let keep_going = match &mut self.row_callback {
                Some(callback) => callback(&parsed, None),
                None => true,
            };
            self.stats.rows_parsed.fetch_add(1, Ordering::Relaxed);

            if row_number % 1000 == 0 {
                self.report_progress(row_number, bytes_consumed, total_size);
            }
            if !keep_going {
                break;
            }
        }

        self.report_progress(row_number, bytes_consumed, total_size);
        Ok(())
    }

    /// Drives the field-level state machine over one already-extracted
    /// row (a full logical row, quoted newlines included).
    fn split_fields(&self, row: &str) -> Result<Vec<String>, CoreError> {
        let quote = self.config.quote_char as char;
        let delimiter = self.config.delimiter as char;
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut state = RowState::FieldStart;

        for ch in row.chars() {
            match state {
                RowState::FieldStart => {
                    if ch == quote {
                        state = RowState::InQuoted;
                    } else if ch == delimiter {
                        fields.push(self.finish_field(std::mem::take(&mut field))?);
                    } else {
                        field.push(ch);
                        state = RowState::InUnquoted;
                    }
                }
                RowState::InUnquoted => {
                    if ch == delimiter {
                        fields.push(self.finish_field(std::mem::take(&mut field))?);
                        state = RowState::FieldStart;
                    } else {
                        field.push(ch);
                    }
                }
                RowState::InQuoted => {
                    if ch == quote {
                        state = RowState::QuoteInQuoted;
                    } else {
                        field.push(ch);
                    }
                }
                RowState::QuoteInQuoted => {
                    if ch == quote {
                        field.push(quote);
                        state = RowState::InQuoted;
                    } else if ch == delimiter {
                        fields.push(self.finish_field(std::mem::take(&mut field))?);
                        state = RowState::FieldStart;
                    } else {
                        field.push(ch);
                        state = RowState::InUnquoted;
                    }
                }
            }
            if field.len() > self.config.max_field_size {
                return Err(CoreError::BufferOverflow(format!("field exceeds max_field_size ({} bytes)", field.len())));
            }
        }
        fields.push(self.finish_field(field)?);
        Ok(fields)
    }

    fn finish_field(&self, field: String) -> Result<String, CoreError> {
        if field.len() > self.config.max_field_size {
            return Err(CoreError::BufferOverflow(format!("field exceeds max_field_size ({} bytes)", field.len())));
        }
        Ok(if self.config.trim_whitespace {
            field.trim().to_string()
        } else {
            field
        })
    }

    fn report_error(&self, err: &CoreError, row_number: u64) {
        if let Some(callback) = &self.error_callback {
            callback(err, row_number);
        }
    }

    fn report_progress(&self, rows: u64, bytes: u64, total_size: u64) {
        if let Some(callback) = &self.progress_callback {
            let percent = if total_size == 0 { 100.0 } else { (bytes as f64 / total_size as f64 * 100.0).min(100.0) };
            callback(rows, bytes, percent);
        }
    }
}

/// Splits decoded content into logical rows, tracking quote state across
/// `\n` so a newline inside a quoted field never ends the row (spec.md
/// §4.6 row extraction rule).
struct RowSplitter<'a> {
    remaining: &'a str,
    quote: char,
}

impl<'a> RowSplitter<'a> {
    fn new(content: &'a str, quote: char) -> Self {
        Self { remaining: content, quote }
    }
}

impl<'a> Iterator for RowSplitter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let mut in_quotes = false;
        let mut end = self.remaining.len();
        let mut found = false;
        for (idx, ch) in self.remaining.char_indices() {
            if ch == self.quote {
                in_quotes = !in_quotes;
            } else if ch == '\n' && !in_quotes {
                end = idx;
                found = true;
                break;
            }
        }
        let row = &self.remaining[..end];
        let row = row.strip_suffix('\r').unwrap_or(row);
        self.remaining = if found { &self.remaining[end + 1..] } else { "" };
        Some(row)
    }
}

/// Detects a UTF-8/UTF-16-LE/UTF-16-BE byte-order mark and decodes
/// accordingly; falls back to lossy UTF-8 when `encoding` forces it or no
/// BOM is present (spec.md §4.6).
fn decode_with_bom(raw: &[u8], encoding: Encoding) -> Result<String, CoreError> {
    match encoding {
        Encoding::Utf16Le => return decode_utf16(raw, false),
        Encoding::Utf16Be => return decode_utf16(raw, true),
        Encoding::Ascii | Encoding::Utf8 => return Ok(String::from_utf8_lossy(strip_utf8_bom(raw)).into_owned()),
        Encoding::AutoDetect => {}
    }
    if raw.starts_with(&[0xFF, 0xFE]) {
        decode_utf16(&raw[2..], false)
    } else if raw.starts_with(&[0xFE, 0xFF]) {
        decode_utf16(&raw[2..], true)
    } else {
        Ok(String::from_utf8_lossy(strip_utf8_bom(raw)).into_owned())
    }
}

fn strip_utf8_bom(raw: &[u8]) -> &[u8] {
    raw.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(raw)
}

fn decode_utf16(raw: &[u8], big_endian: bool) -> Result<String, CoreError> {
    if raw.len() % 2 != 0 {
        return Err(CoreError::EncodingError("odd-length UTF-16 byte stream".to_string()));
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|chunk| if big_endian { u16::from_be_bytes([chunk[0], chunk[1]]) } else { u16::from_le_bytes([chunk[0], chunk[1]]) })
        .collect();
    String::from_utf16(&units).map_err(|e| CoreError::EncodingError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_rows(csv: &str, config: ParserConfig) -> Vec<ParsedRow> {
        let mut parser = StreamingParser::new(config);
        let rows = Arc::new(Mutex::new(Vec::new()));
        let sink = rows.clone();
        parser.on_row(move |row, _| {
            sink.lock().push(row.clone());
            true
        });
        parser.parse_string(csv).unwrap();
        Arc::try_unwrap(rows).unwrap().into_inner()
    }

    #[test]
    fn splits_unquoted_fields_on_delimiter() {
        let rows = collect_rows("a,b,c\n1,2,3\n", ParserConfig { has_header: true, ..Default::default() });
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields, vec!["1", "2", "3"]);
    }

    #[test]
    fn newline_inside_quotes_does_not_end_the_row() {
        let rows = collect_rows(
            "col\n\"line1\nline2\",ok\n",
            ParserConfig { has_header: true, ..Default::default() },
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields[0], "line1\nline2");
        assert_eq!(rows[0].fields[1], "ok");
    }

    #[test]
    fn doubled_quote_in_quoted_field_becomes_a_literal_quote() {
        let rows = collect_rows("col\n\"she said \"\"hi\"\"\"\n", ParserConfig { has_header: true, ..Default::default() });
        assert_eq!(rows[0].fields[0], "she said \"hi\"");
    }

    #[test]
    fn header_row_is_captured_and_not_dispatched() {
        let rows = collect_rows("url,status\nexample.com,200\n", ParserConfig { has_header: true, ..Default::default() });
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].field_by_name("status"), Some("200"));
    }

    #[test]
    fn malformed_oversized_field_is_lenient_by_default() {
        let config = ParserConfig {
            has_header: false,
            max_field_size: 4,
            ..Default::default()
        };
        let mut parser = StreamingParser::new(config);
        parser.parse_string("short\ntoolongvalue\nok\n").unwrap();
        let stats = parser.stats();
        assert_eq!(stats.rows_with_errors, 1);
        assert_eq!(stats.rows_parsed, 2);
    }

    #[test]
    fn strict_mode_aborts_on_first_malformed_row() {
        let config = ParserConfig {
            has_header: false,
            max_field_size: 4,
            strict_mode: true,
            ..Default::default()
        };
        let mut parser = StreamingParser::new(config);
        let result = parser.parse_string("short\ntoolongvalue\nok\n");
        assert!(result.is_err());
    }

    #[test]
    fn utf8_bom_is_stripped() {
        let mut raw = vec![0xEF, 0xBB, 0xBF];
        raw.extend_from_slice(b"a,b\n1,2\n");
        let decoded = decode_with_bom(&raw, Encoding::AutoDetect).unwrap();
        assert!(decoded.starts_with("a,b"));
    }

    #[test]
    fn stop_control_halts_parsing_before_all_rows_are_dispatched() {
        let config = ParserConfig { has_header: false, ..Default::default() };
        let mut parser = StreamingParser::new(config);
        let control = parser.control();
        let seen = Arc::new(Mutex::new(0u32));
        let seen_clone = seen.clone();
        parser.on_row(move |_, _| {
            let mut count = seen_clone.lock();
            *count += 1;
            if *count == 2 {
                control.stop();
            }
            true
        });
        parser.parse_string("1\n2\n3\n4\n5\n").unwrap();
        assert!(*seen.lock() < 5);
    }

    #[test]
    fn s5_csv_round_trip_with_an_embedded_comma_and_a_header() {
        let rows = collect_rows("name,age\n\"Smith, J.\",30\nJane,25\n", ParserConfig { has_header: true, ..Default::default() });
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fields, vec!["Smith, J.", "30"]);
        assert_eq!(rows[1].fields, vec!["Jane", "25"]);

        let mut parser = StreamingParser::new(ParserConfig { has_header: true, ..Default::default() });
        parser.parse_string("name,age\n\"Smith, J.\",30\nJane,25\n").unwrap();
        let stats = parser.stats();
        assert_eq!(stats.rows_parsed, 2);
        assert_eq!(stats.rows_skipped, 1);
        assert_eq!(stats.rows_with_errors, 0);
    }

    #[test]
    fn empty_rows_are_skipped_by_default() {
        let rows = collect_rows("a\n1\n\n2\n", ParserConfig { has_header: true, ..Default::default() });
        assert_eq!(rows.len(), 2);
    }
}
