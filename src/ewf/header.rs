//! `header` and `header2` sections: tab-separated case metadata, deflated.
//!
//! `header` is ASCII with CRLF line ends and timestamps as `YYYY M D h m s`
//! in local time. `header2` is UTF-16LE with a byte order mark, LF line ends,
//! Unix-epoch timestamps and two extra categories (`srce`, `sub`).

use std::io::{self, Write};

use chrono::{DateTime, Datelike, Local, Timelike};
use uuid::Uuid;

use super::section::{SectionHeader, SectionType};
use crate::codec::zlib_compress;

const HEADER_IDENTIFIERS: [&str; 11] = ["c", "n", "a", "e", "t", "sn", "av", "ov", "m", "u", "p"];
const HEADER2_IDENTIFIERS: [&str; 13] =
    ["c", "n", "a", "e", "t", "md", "sn", "av", "ov", "m", "u", "p", "dc"];
const SRCE_IDENTIFIERS: [&str; 10] = ["p", "n", "id", "ev", "tb", "lo", "po", "ah", "gu", "aq"];
const SUB_IDENTIFIERS: [&str; 6] = ["p", "n", "id", "nu", "co", "gu"];

/// Values that end up in both header sections.
#[derive(Debug, Clone)]
pub struct HeaderInfo {
    pub description:     String,
    pub case_number:     String,
    pub evidence_number: String,
    pub examiner:        String,
    pub notes:           String,
    pub serial_number:   String,
    pub model:           String,
    pub tool_version:    String,
    pub platform:        String,
    pub acquired:        DateTime<Local>,
    pub total_bytes:     u64,
    pub guid:            Uuid,
}

impl HeaderInfo {
    pub fn new(total_bytes: u64, guid: Uuid) -> Self {
        Self {
            description:     String::new(),
            case_number:     String::new(),
            evidence_number: String::new(),
            examiner:        String::new(),
            notes:           String::new(),
            serial_number:   String::new(),
            model:           String::new(),
            tool_version:    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            platform:        std::env::consts::OS.to_owned(),
            acquired:        Local::now(),
            total_bytes,
            guid,
        }
    }

    fn value(&self, identifier: &str, dates: DateStyle) -> String {
        let raw = match identifier {
            "c" | "nu"       => self.case_number.clone(),
            "n" | "ev"       => self.evidence_number.clone(),
            "a" | "id"       => self.description.clone(),
            "e"              => self.examiner.clone(),
            "t" | "co"       => self.notes.clone(),
            "md"             => self.model.clone(),
            "sn"             => self.serial_number.clone(),
            "av"             => self.tool_version.clone(),
            "ov"             => self.platform.clone(),
            "m" | "u" | "aq" => dates.render(&self.acquired),
            "p"              => "0".to_owned(),
            "tb"             => self.total_bytes.to_string(),
            "lo" | "po"      => "0".to_owned(),
            "gu"             => self.guid.simple().to_string().to_uppercase(),
            _                => String::new(),
        };
        sanitize(&raw)
    }

    fn values_line(&self, identifiers: &[&str], dates: DateStyle) -> String {
        identifiers
            .iter()
            .map(|id| self.value(id, dates))
            .collect::<Vec<_>>()
            .join("\t")
    }

    /// Plain text of the `header` section before encoding.
    pub fn header_text(&self) -> String {
        let lines = [
            "1".to_owned(),
            "main".to_owned(),
            HEADER_IDENTIFIERS.join("\t"),
            self.values_line(&HEADER_IDENTIFIERS, DateStyle::Fields),
            String::new(),
        ];
        lines.iter().map(|l| format!("{l}\r\n")).collect()
    }

    /// Plain text of the `header2` section before encoding (no BOM).
    pub fn header2_text(&self) -> String {
        let lines = [
            "3".to_owned(),
            "main".to_owned(),
            HEADER2_IDENTIFIERS.join("\t"),
            self.values_line(&HEADER2_IDENTIFIERS, DateStyle::Epoch),
            String::new(),
            "srce".to_owned(),
            "0\t1".to_owned(),
            SRCE_IDENTIFIERS.join("\t"),
            "0\t0".to_owned(),
            self.values_line(&SRCE_IDENTIFIERS, DateStyle::Epoch),
            String::new(),
            "sub".to_owned(),
            "0\t1".to_owned(),
            SUB_IDENTIFIERS.join("\t"),
            "0\t0".to_owned(),
            self.values_line(&SUB_IDENTIFIERS, DateStyle::Epoch),
            String::new(),
        ];
        lines.iter().map(|l| format!("{l}\n")).collect()
    }

    /// Deflated ASCII body of the `header` section.
    pub fn encode_header(&self) -> io::Result<Vec<u8>> {
        let ascii: Vec<u8> = self
            .header_text()
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect();
        zlib_compress(&ascii, 6)
    }

    /// Deflated UTF-16LE body of the `header2` section.
    pub fn encode_header2(&self) -> io::Result<Vec<u8>> {
        let mut utf16 = vec![0xFF, 0xFE];
        for unit in self.header2_text().encode_utf16() {
            utf16.extend_from_slice(&unit.to_le_bytes());
        }
        zlib_compress(&utf16, 6)
    }
}

#[derive(Debug, Clone, Copy)]
enum DateStyle {
    Fields,
    Epoch,
}

impl DateStyle {
    fn render(self, at: &DateTime<Local>) -> String {
        match self {
            DateStyle::Fields => format!(
                "{} {} {} {} {} {}",
                at.year(),
                at.month(),
                at.day(),
                at.hour(),
                at.minute(),
                at.second()
            ),
            DateStyle::Epoch => at.timestamp().to_string(),
        }
    }
}

/// Tabs and line breaks would shift every following column.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if matches!(c, '\t' | '\r' | '\n') { ' ' } else { c })
        .collect()
}

/// A `header` or `header2` section ready to be written.
#[derive(Debug, Clone)]
pub struct HeaderSection {
    pub header: SectionHeader,
    pub body:   Vec<u8>,
}

impl HeaderSection {
    pub fn header(info: &HeaderInfo, offset: u64) -> io::Result<Self> {
        let body = info.encode_header()?;
        Ok(Self { header: SectionHeader::with_body(SectionType::Header, offset, body.len() as u64), body })
    }

    pub fn header2(info: &HeaderInfo, offset: u64) -> io::Result<Self> {
        let body = info.encode_header2()?;
        Ok(Self { header: SectionHeader::with_body(SectionType::Header2, offset, body.len() as u64), body })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.header.write(&mut writer)?;
        writer.write_all(&self.body)
    }
}
