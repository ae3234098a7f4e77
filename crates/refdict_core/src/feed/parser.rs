//! Snapshot document to dictionary entries.
//!
//! # Responsibility
//! - Decode feed bytes (declared encoding, BOM or UTF-8).
//! - Walk the XML once and map entry sub-elements onto `DictionaryEntry`.
//!
//! # Invariants
//! - Missing or blank fields fall back to defaults; present but malformed
//!   fields reject the whole document.
//! - Entries come out in document order, duplicates included.
//! - Only the first occurrence of a field inside one entry is used.

use crate::feed::layout::{EntryField, FeedLayout, HeaderField};
use crate::model::dictionary::{DictionaryEntry, EARLIEST_DATE, OPEN_ENDED, UNKNOWN_NAME};
use crate::model::record::{RecordId, UNASSIGNED_ID};
use chrono::NaiveDate;
use encoding_rs::{Encoding, UTF_8};
use log::{debug, info, warn};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Date layouts seen in feeds; a trailing time part is ignored.
const FEED_DATE_FORMATS: [&str; 2] = ["%d.%m.%Y", "%Y-%m-%d"];
/// How far into the document to look for an XML declaration.
const DECLARATION_SCAN_BYTES: usize = 256;

pub type FeedResult<T> = Result<T, FeedError>;

/// Snapshot rejection. Nothing has been written when one of these is raised.
#[derive(Debug)]
pub enum FeedError {
    UnsupportedEncoding(String),
    MalformedEncoding { encoding: &'static str },
    Xml(quick_xml::Error),
    MissingRoot {
        expected: String,
        found: Option<String>,
    },
    InvalidField {
        /// 1-based position of the entry in the document.
        entry: usize,
        tag: String,
        value: String,
        reason: &'static str,
    },
}

impl Display for FeedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedEncoding(label) => write!(f, "unsupported feed encoding `{label}`"),
            Self::MalformedEncoding { encoding } => {
                write!(f, "feed bytes are not valid {encoding}")
            }
            Self::Xml(err) => write!(f, "malformed feed xml: {err}"),
            Self::MissingRoot { expected, found } => match found {
                Some(found) => write!(f, "feed root is `{found}`, expected `{expected}`"),
                None => write!(f, "feed has no `{expected}` root element"),
            },
            Self::InvalidField {
                entry,
                tag,
                value,
                reason,
            } => write!(f, "entry #{entry}: invalid `{tag}` value `{value}`: {reason}"),
        }
    }
}

impl Error for FeedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Xml(err) => Some(err),
            _ => None,
        }
    }
}

impl From<quick_xml::Error> for FeedError {
    fn from(value: quick_xml::Error) -> Self {
        Self::Xml(value)
    }
}

/// Feed header block (`<zglv>` in the medical care form feed).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedHeader {
    pub kind: Option<String>,
    pub version: Option<String>,
    pub date: Option<String>,
}

/// Fully materialized snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub header: Option<FeedHeader>,
    pub entries: Vec<DictionaryEntry>,
    /// Name of the encoding the bytes were decoded with.
    pub encoding: &'static str,
}

/// Layout-driven feed parser.
#[derive(Debug, Clone, Default)]
pub struct FeedParser {
    layout: FeedLayout,
}

#[derive(Debug, Default)]
struct RawEntry {
    id: Option<String>,
    code: Option<String>,
    name: Option<String>,
    begin_date: Option<String>,
    end_date: Option<String>,
}

impl RawEntry {
    fn slot(&mut self, field: EntryField) -> &mut Option<String> {
        match field {
            EntryField::Id => &mut self.id,
            EntryField::Code => &mut self.code,
            EntryField::Name => &mut self.name,
            EntryField::BeginDate => &mut self.begin_date,
            EntryField::EndDate => &mut self.end_date,
        }
    }

    /// Opens `field`; returns false when it was already seen in this entry.
    fn open(&mut self, field: EntryField) -> bool {
        let slot = self.slot(field);
        if slot.is_some() {
            return false;
        }
        *slot = Some(String::new());
        true
    }
}

enum Capture {
    Nothing,
    Entry(EntryField),
    Header(HeaderField),
}

impl FeedParser {
    pub fn new(layout: FeedLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &FeedLayout {
        &self.layout
    }

    /// Parses a whole snapshot document.
    pub fn parse(&self, bytes: &[u8]) -> FeedResult<FeedSnapshot> {
        let started_at = Instant::now();
        let result = self.parse_inner(bytes);
        match &result {
            Ok(snapshot) => info!(
                "event=feed_parse module=feed status=ok entries={} encoding={} bytes={} duration_ms={}",
                snapshot.entries.len(),
                snapshot.encoding,
                bytes.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => warn!(
                "event=feed_parse module=feed status=rejected bytes={} duration_ms={} error={err}",
                bytes.len(),
                started_at.elapsed().as_millis()
            ),
        }
        result
    }

    /// Parses a snapshot and keeps only its entries.
    pub fn parse_entries(&self, bytes: &[u8]) -> FeedResult<Vec<DictionaryEntry>> {
        Ok(self.parse(bytes)?.entries)
    }

    fn parse_inner(&self, bytes: &[u8]) -> FeedResult<FeedSnapshot> {
        let (text, encoding) = decode_document(bytes)?;
        let (header, raw_entries) = self.collect(&text)?;

        let entries = raw_entries
            .into_iter()
            .enumerate()
            .map(|(index, raw)| self.build_entry(index + 1, raw))
            .collect::<FeedResult<Vec<_>>>()?;

        Ok(FeedSnapshot {
            header,
            entries,
            encoding: encoding.name(),
        })
    }

    fn collect(&self, text: &str) -> FeedResult<(Option<FeedHeader>, Vec<RawEntry>)> {
        let layout = &self.layout;
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut depth = 0usize;
        let mut saw_root = false;
        let mut header: Option<FeedHeader> = None;
        let mut in_header = false;
        let mut current: Option<RawEntry> = None;
        let mut capture = Capture::Nothing;
        let mut entries = Vec::new();

        loop {
            match reader.read_event()? {
                Event::Start(element) => {
                    let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                    match depth {
                        0 => {
                            check_root(layout, &name)?;
                            saw_root = true;
                        }
                        1 if name == layout.entry => current = Some(RawEntry::default()),
                        1 if name == layout.header => {
                            in_header = true;
                            header.get_or_insert_with(FeedHeader::default);
                        }
                        2 => capture = open_capture(layout, &name, current.as_mut(), in_header, header.as_mut()),
                        _ => {}
                    }
                    depth += 1;
                }
                Event::Empty(element) => {
                    let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                    match depth {
                        0 => {
                            check_root(layout, &name)?;
                            saw_root = true;
                        }
                        1 if name == layout.entry => entries.push(RawEntry::default()),
                        2 => {
                            // Present-but-empty field: remember it was seen, keep it blank.
                            open_capture(layout, &name, current.as_mut(), in_header, header.as_mut());
                        }
                        _ => {}
                    }
                }
                Event::Text(content) if depth == 3 => {
                    let value = content.unescape()?;
                    append_capture(&capture, &value, current.as_mut(), header.as_mut());
                }
                Event::CData(content) if depth == 3 => {
                    let raw = content.into_inner();
                    let value = String::from_utf8_lossy(&raw);
                    append_capture(&capture, &value, current.as_mut(), header.as_mut());
                }
                Event::End(_) => {
                    depth = depth.saturating_sub(1);
                    match depth {
                        2 => capture = Capture::Nothing,
                        1 => {
                            if let Some(entry) = current.take() {
                                entries.push(entry);
                            }
                            in_header = false;
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !saw_root {
            return Err(FeedError::MissingRoot {
                expected: layout.root.clone(),
                found: None,
            });
        }
        debug!(
            "event=feed_scan module=feed status=ok entries={} header={}",
            entries.len(),
            header.is_some()
        );
        Ok((header, entries))
    }

    fn build_entry(&self, position: usize, raw: RawEntry) -> FeedResult<DictionaryEntry> {
        let layout = &self.layout;

        let code = match non_blank(raw.code.as_deref()) {
            None => 0,
            Some(value) => value.parse::<i32>().map_err(|_| FeedError::InvalidField {
                entry: position,
                tag: layout.code.clone(),
                value: value.to_string(),
                reason: "expected an integer code",
            })?,
        };

        let name = non_blank(raw.name.as_deref()).unwrap_or(UNKNOWN_NAME);

        let begin_date = match non_blank(raw.begin_date.as_deref()) {
            None => EARLIEST_DATE,
            Some(value) => parse_feed_date(value).ok_or_else(|| FeedError::InvalidField {
                entry: position,
                tag: layout.begin_date.clone(),
                value: value.to_string(),
                reason: "expected a dd.mm.yyyy or yyyy-mm-dd date",
            })?,
        };

        let end_date = match non_blank(raw.end_date.as_deref()) {
            None => OPEN_ENDED,
            Some(value) => parse_feed_date(value).ok_or_else(|| FeedError::InvalidField {
                entry: position,
                tag: layout.end_date.clone(),
                value: value.to_string(),
                reason: "expected a dd.mm.yyyy or yyyy-mm-dd date",
            })?,
        };

        let id = match (&layout.id, non_blank(raw.id.as_deref())) {
            (Some(tag), Some(value)) => parse_record_id(value).ok_or_else(|| FeedError::InvalidField {
                entry: position,
                tag: tag.clone(),
                value: value.to_string(),
                reason: "expected a positive integer id",
            })?,
            (Some(_), None) => UNASSIGNED_ID,
            (None, _) if code > 0 => RecordId::from(code),
            (None, _) => UNASSIGNED_ID,
        };

        Ok(DictionaryEntry::with_id(id, code, name, begin_date, end_date))
    }
}

fn check_root(layout: &FeedLayout, name: &str) -> FeedResult<()> {
    if name == layout.root {
        return Ok(());
    }
    Err(FeedError::MissingRoot {
        expected: layout.root.clone(),
        found: Some(name.to_string()),
    })
}

fn open_capture(
    layout: &FeedLayout,
    name: &str,
    entry: Option<&mut RawEntry>,
    in_header: bool,
    header: Option<&mut FeedHeader>,
) -> Capture {
    if let Some(entry) = entry {
        return match layout.field_for(name) {
            Some(field) if entry.open(field) => Capture::Entry(field),
            _ => Capture::Nothing,
        };
    }
    if !in_header {
        return Capture::Nothing;
    }

    let Some(field) = layout.header_field_for(name) else {
        return Capture::Nothing;
    };
    if let Some(header) = header {
        let slot = header_slot(header, field);
        if slot.is_some() {
            return Capture::Nothing;
        }
        *slot = Some(String::new());
    }
    Capture::Header(field)
}

fn append_capture(
    capture: &Capture,
    value: &str,
    entry: Option<&mut RawEntry>,
    header: Option<&mut FeedHeader>,
) {
    let slot = match (capture, entry, header) {
        (Capture::Entry(field), Some(entry), _) => entry.slot(*field),
        (Capture::Header(field), _, Some(header)) => header_slot(header, *field),
        _ => return,
    };
    slot.get_or_insert_with(String::new).push_str(value);
}

fn header_slot(header: &mut FeedHeader, field: HeaderField) -> &mut Option<String> {
    match field {
        HeaderField::Kind => &mut header.kind,
        HeaderField::Version => &mut header.version,
        HeaderField::Date => &mut header.date,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn parse_record_id(value: &str) -> Option<RecordId> {
    value.parse::<RecordId>().ok().filter(|id| *id > 0)
}

/// Parses a feed date, ignoring any time-of-day suffix.
pub fn parse_feed_date(value: &str) -> Option<NaiveDate> {
    let date_part = value
        .split(|c: char| c == 'T' || c.is_whitespace())
        .next()
        .unwrap_or(value);
    FEED_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(date_part, format).ok())
}

fn decode_document(bytes: &[u8]) -> FeedResult<(String, &'static Encoding)> {
    let declared = match declared_encoding_label(bytes) {
        Some(label) => Some(
            Encoding::for_label(label.as_bytes())
                .ok_or_else(|| FeedError::UnsupportedEncoding(label.to_string()))?,
        ),
        None => None,
    };

    // A byte order mark overrides the declaration.
    let (text, used, had_errors) = declared.unwrap_or(UTF_8).decode(bytes);
    if had_errors {
        return Err(FeedError::MalformedEncoding {
            encoding: used.name(),
        });
    }
    Ok((text.into_owned(), used))
}

fn declared_encoding_label(bytes: &[u8]) -> Option<&str> {
    let head = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let head = &head[..head.len().min(DECLARATION_SCAN_BYTES)];
    if !head.starts_with(b"<?xml") {
        return None;
    }

    let end = head.windows(2).position(|pair| pair == b"?>")?;
    let declaration = std::str::from_utf8(&head[..end]).ok()?;
    let after_key = &declaration[declaration.find("encoding")? + "encoding".len()..];
    let value = after_key.trim_start().strip_prefix('=')?.trim_start();
    let quote = value.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &value[1..];
    Some(&value[..value.find(quote)?])
}

#[cfg(test)]
mod tests {
    use super::{declared_encoding_label, parse_feed_date};
    use chrono::NaiveDate;

    #[test]
    fn feed_dates_accept_locale_iso_and_time_suffix() {
        let expected = NaiveDate::from_ymd_opt(2013, 1, 1).unwrap();
        assert_eq!(parse_feed_date("01.01.2013"), Some(expected));
        assert_eq!(parse_feed_date("2013-01-01"), Some(expected));
        assert_eq!(parse_feed_date("01.01.2013 0:00:00"), Some(expected));
        assert_eq!(parse_feed_date("2013-01-01T00:00:00"), Some(expected));
        assert_eq!(parse_feed_date("31.02.2013"), None);
        assert_eq!(parse_feed_date("soon"), None);
    }

    #[test]
    fn declaration_label_is_extracted_with_either_quote() {
        assert_eq!(
            declared_encoding_label(br#"<?xml version="1.0" encoding="windows-1251"?><packet/>"#),
            Some("windows-1251")
        );
        assert_eq!(
            declared_encoding_label(b"<?xml version='1.0' encoding = 'UTF-8' ?><packet/>"),
            Some("UTF-8")
        );
        assert_eq!(declared_encoding_label(b"<?xml version=\"1.0\"?><packet/>"), None);
        assert_eq!(declared_encoding_label(b"<packet/>"), None);
    }
}
