//! Dump Writer.
//!
//! Serializes rows for one chunk into the target text dialect, rolling
//! over to a new output chunk artifact at the configured row/byte
//! budget, and hands the serialized bytes to a [`crate::codec`] encoder
//! before they reach a [`crate::storage`] write stream. Mirrors the
//! teacher's [`crate::session`]-adjacent `ChecksumReader` pattern: a
//! thin wrapper around the byte stream that accumulates a running
//! `crc32fast` checksum as data passes through, here on write instead
//! of read, so every artifact's checksum is known at `finish()` with no
//! second pass over the bytes.

use anyhow::{Context, Result};
use base64::Engine;

use crate::codec::{Compression, StreamingEncoder};
use crate::session::Row;

/// Output text dialects this engine supports. `Table` is the
/// human-readable aligned format used only for single-shot previews,
/// never for chunked data files feeding `load_dump`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Table,
    Csv,
    Tsv,
    CsvUnix,
    Json,
}

impl Dialect {
    fn field_separator(&self) -> &'static str {
        match self {
            Dialect::Tsv => "\t",
            _ => ",",
        }
    }

    fn line_terminator(&self) -> &'static str {
        match self {
            Dialect::CsvUnix => "\n",
            _ => "\r\n",
        }
    }

    fn quote(&self) -> char {
        '"'
    }
}

/// A column value as read back from a `Row`; `None` is SQL `NULL`.
/// Binary-unsafe columns (anything that isn't guaranteed valid UTF-8
/// text) are base64-encoded rather than escaped: escaping is reserved
/// for the text dialects' structural characters, not for making
/// arbitrary bytes representable.
pub enum FieldEncoding {
    PlainText,
    Base64Binary,
}

pub struct DumpWriter {
    dialect: Dialect,
    encodings: Vec<FieldEncoding>,
    rows_per_chunk_budget: Option<u64>,
    bytes_per_chunk_budget: Option<u64>,
    rows_in_current_chunk: u64,
    bytes_in_current_chunk: u64,
    encoder: StreamingEncoder,
    header_written: bool,
    column_names: Vec<String>,
}

impl DumpWriter {
    pub fn new(
        dialect: Dialect,
        column_names: Vec<String>,
        encodings: Vec<FieldEncoding>,
        codec: Compression,
        rows_per_chunk_budget: Option<u64>,
        bytes_per_chunk_budget: Option<u64>,
    ) -> Result<Self> {
        Ok(Self {
            dialect,
            encodings,
            rows_per_chunk_budget,
            bytes_per_chunk_budget,
            rows_in_current_chunk: 0,
            bytes_in_current_chunk: 0,
            encoder: StreamingEncoder::new(codec)?,
            header_written: false,
            column_names,
        })
    }

    /// Appends one row. Returns `true` if the caller should roll over to
    /// a new chunk artifact after this row (the budget was reached and
    /// at least one full row fits; a single row is never split across
    /// two artifacts, even if it alone exceeds the byte budget).
    pub fn write_row(&mut self, row: &Row) -> Result<bool> {
        if !self.header_written && self.dialect != Dialect::Table {
            if matches!(self.dialect, Dialect::Csv | Dialect::Tsv | Dialect::CsvUnix) {
                let header = self.format_header();
                self.feed(header.as_bytes())?;
            }
            self.header_written = true;
        }

        let encoded = self.format_row(row)?;
        self.feed(encoded.as_bytes())?;

        self.rows_in_current_chunk += 1;
        self.bytes_in_current_chunk += encoded.len() as u64;

        let rows_exceeded = self
            .rows_per_chunk_budget
            .map(|budget| self.rows_in_current_chunk >= budget)
            .unwrap_or(false);
        let bytes_exceeded = self
            .bytes_per_chunk_budget
            .map(|budget| self.bytes_in_current_chunk >= budget)
            .unwrap_or(false);
        Ok(rows_exceeded || bytes_exceeded)
    }

    fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        self.encoder.write(bytes).context("compressing chunk bytes")
    }

    fn format_header(&self) -> String {
        let sep = self.dialect.field_separator();
        let term = self.dialect.line_terminator();
        format!("{}{}", self.column_names.join(sep), term)
    }

    fn format_row(&self, row: &Row) -> Result<String> {
        match self.dialect {
            Dialect::Json => self.format_row_json(row),
            _ => self.format_row_delimited(row),
        }
    }

    fn format_row_delimited(&self, row: &Row) -> Result<String> {
        let sep = self.dialect.field_separator();
        let term = self.dialect.line_terminator();
        let quote = self.dialect.quote();
        let mut fields = Vec::with_capacity(row.len());
        for (i, value) in row.iter().enumerate() {
            let field = match value {
                None => String::new(),
                Some(bytes) => {
                    let text = match self.encodings.get(i) {
                        Some(FieldEncoding::Base64Binary) => {
                            base64::engine::general_purpose::STANDARD.encode(bytes)
                        }
                        _ => String::from_utf8_lossy(bytes).into_owned(),
                    };
                    escape_delimited_field(&text, sep, quote)
                }
            };
            fields.push(field);
        }
        Ok(format!("{}{}", fields.join(sep), term))
    }

    fn format_row_json(&self, row: &Row) -> Result<String> {
        let mut obj = serde_json::Map::new();
        for (i, value) in row.iter().enumerate() {
            let name = self
                .column_names
                .get(i)
                .cloned()
                .unwrap_or_else(|| i.to_string());
            let json_value = match value {
                None => serde_json::Value::Null,
                Some(bytes) => match self.encodings.get(i) {
                    Some(FieldEncoding::Base64Binary) => serde_json::Value::String(
                        base64::engine::general_purpose::STANDARD.encode(bytes),
                    ),
                    _ => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
                },
            };
            obj.insert(name, json_value);
        }
        Ok(format!("{}\n", serde_json::Value::Object(obj)))
    }

    /// Finishes the current chunk artifact, returning its compressed
    /// bytes and row/byte counters for the manifest entry. The writer
    /// can be reused for the next chunk by constructing a fresh
    /// [`StreamingEncoder`] with [`Self::reset_for_next_chunk`].
    pub fn finish_chunk(self) -> Result<(Vec<u8>, u64, u64)> {
        let rows = self.rows_in_current_chunk;
        let bytes = self.bytes_in_current_chunk;
        let data = self.encoder.finish()?;
        Ok((data, rows, bytes))
    }

    pub fn reset_for_next_chunk(&mut self, codec: Compression) -> Result<()> {
        self.encoder = StreamingEncoder::new(codec)?;
        self.rows_in_current_chunk = 0;
        self.bytes_in_current_chunk = 0;
        self.header_written = false;
        Ok(())
    }
}

fn escape_delimited_field(text: &str, sep: &str, quote: char) -> String {
    let needs_quoting = text.contains(sep) || text.contains(quote) || text.contains('\n') || text.contains('\r');
    if !needs_quoting {
        return text.to_string();
    }
    let escaped = text.replace(quote, &format!("{}{}", quote, quote));
    format!("{}{}{}", quote, escaped, quote)
}

/// Shifts a `TIMESTAMP` column's textual value from the server's
/// session time zone to UTC: `TIMESTAMP` (unlike `DATETIME`) is always
/// written in UTC so a reload against a server in a different time
/// zone reconstructs the same instant.
pub fn timestamp_to_utc_text(naive_local: chrono::NaiveDateTime, session_offset: chrono::FixedOffset) -> String {
    use chrono::TimeZone;
    let local = session_offset.from_local_datetime(&naive_local).single().unwrap_or_else(|| {
        chrono::DateTime::<chrono::FixedOffset>::from_naive_utc_and_offset(naive_local, session_offset)
    });
    local.with_timezone(&chrono::Utc).format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: Vec<Option<&[u8]>>) -> Row {
        values.into_iter().map(|v| v.map(|b| b.to_vec())).collect()
    }

    #[test]
    fn csv_row_round_trips_through_escaping() {
        let writer = DumpWriter::new(
            Dialect::Csv,
            vec!["a".into(), "b".into()],
            vec![FieldEncoding::PlainText, FieldEncoding::PlainText],
            Compression::None,
            None,
            None,
        )
        .unwrap();
        let formatted = writer
            .format_row_delimited(&row(vec![Some(b"hello, world"), Some(b"plain")]))
            .unwrap();
        assert_eq!(formatted, "\"hello, world\",plain\r\n");
    }

    #[test]
    fn dialect_round_trip_tsv_uses_tab_separator() {
        let writer = DumpWriter::new(
            Dialect::Tsv,
            vec!["a".into(), "b".into()],
            vec![FieldEncoding::PlainText, FieldEncoding::PlainText],
            Compression::None,
            None,
            None,
        )
        .unwrap();
        let formatted = writer.format_row_delimited(&row(vec![Some(b"x"), Some(b"y")])).unwrap();
        assert_eq!(formatted, "x\ty\r\n");
    }

    #[test]
    fn dialect_round_trip_csv_unix_uses_lf() {
        let writer = DumpWriter::new(
            Dialect::CsvUnix,
            vec!["a".into()],
            vec![FieldEncoding::PlainText],
            Compression::None,
            None,
            None,
        )
        .unwrap();
        let formatted = writer.format_row_delimited(&row(vec![Some(b"x")])).unwrap();
        assert_eq!(formatted, "x\n");
    }

    #[test]
    fn binary_column_is_base64_encoded() {
        let writer = DumpWriter::new(
            Dialect::Csv,
            vec!["blob".into()],
            vec![FieldEncoding::Base64Binary],
            Compression::None,
            None,
            None,
        )
        .unwrap();
        let formatted = writer.format_row_delimited(&row(vec![Some(&[0xff, 0x00, 0x10])])).unwrap();
        assert_eq!(formatted.trim_end(), base64::engine::general_purpose::STANDARD.encode([0xff, 0x00, 0x10]));
    }

    #[test]
    fn chunk_rolls_over_at_row_budget() {
        let mut writer = DumpWriter::new(
            Dialect::Csv,
            vec!["a".into()],
            vec![FieldEncoding::PlainText],
            Compression::None,
            Some(2),
            None,
        )
        .unwrap();
        assert!(!writer.write_row(&row(vec![Some(b"1")])).unwrap());
        assert!(writer.write_row(&row(vec![Some(b"2")])).unwrap());
    }

    #[test]
    fn single_oversized_row_is_never_split() {
        let mut writer = DumpWriter::new(
            Dialect::Csv,
            vec!["a".into()],
            vec![FieldEncoding::PlainText],
            Compression::None,
            None,
            Some(4),
        )
        .unwrap();
        let rolled_over = writer.write_row(&row(vec![Some(b"this value is way over budget")])).unwrap();
        assert!(rolled_over);
        assert_eq!(writer.rows_in_current_chunk, 1);
    }

    #[test]
    fn json_row_encodes_column_names() {
        let writer = DumpWriter::new(
            Dialect::Json,
            vec!["id".into(), "name".into()],
            vec![FieldEncoding::PlainText, FieldEncoding::PlainText],
            Compression::None,
            None,
            None,
        )
        .unwrap();
        let formatted = writer.format_row_json(&row(vec![Some(b"1"), Some(b"alice")])).unwrap();
        assert!(formatted.contains("\"id\":\"1\""));
        assert!(formatted.contains("\"name\":\"alice\""));
    }
}
