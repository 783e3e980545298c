use std::io::{self, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use super::section::{push_checksummed, split_checksummed, SectionError, SectionHeader, SectionType};

const PREFIX_SIZE: usize = 4 + 512;

/// A run of consecutive unreadable sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SectorRun {
    pub first: u32,
    pub count: u32,
}

/// `error2` section listing unreadable sector runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Error2Section {
    pub runs: Vec<SectorRun>,
}

/// Sorted, deduplicated `(first, count)` runs over the full sector range.
pub fn sector_runs(sectors: &[u64]) -> Vec<(u64, u64)> {
    let mut sorted = sectors.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<(u64, u64)> = Vec::new();
    for sector in sorted {
        match runs.last_mut() {
            Some((first, count)) if *first + *count == sector => *count += 1,
            _ => runs.push((sector, 1)),
        }
    }
    runs
}

impl Error2Section {
    /// Collapse individual sector numbers into runs. Input order and
    /// duplicates do not matter. Sectors from `u32::MAX` upward cannot be
    /// addressed by the on-disk entry; they are counted into one run starting
    /// at `u32::MAX` so the total stays right.
    pub fn from_sectors(sectors: &[u64]) -> Self {
        let limit = u64::from(u32::MAX);
        let mut runs = Vec::new();
        let mut clamped: u64 = 0;
        for (first, count) in sector_runs(sectors) {
            let end = first + count;
            if first < limit {
                let kept = end.min(limit) - first;
                runs.push(SectorRun { first: first as u32, count: kept as u32 });
            }
            clamped += end.saturating_sub(first.max(limit));
        }
        if clamped > 0 {
            warn!(sectors = clamped, "bad sectors beyond the 32-bit error2 range, recorded as one clamped run");
            runs.push(SectorRun { first: u32::MAX, count: clamped.min(limit) as u32 });
        }
        Self { runs }
    }

    pub fn sector_total(&self) -> u64 {
        self.runs.iter().map(|r| u64::from(r.count)).sum()
    }

    pub fn body_bytes(&self) -> io::Result<Vec<u8>> {
        let mut prefix = Vec::with_capacity(PREFIX_SIZE);
        prefix.write_u32::<LittleEndian>(self.runs.len() as u32)?;
        prefix.write_all(&[0u8; 512])?;

        let mut entries = Vec::with_capacity(self.runs.len() * 8);
        for run in &self.runs {
            entries.write_u32::<LittleEndian>(run.first)?;
            entries.write_u32::<LittleEndian>(run.count)?;
        }

        let mut body = Vec::with_capacity(PREFIX_SIZE + 4 + entries.len() + 4);
        push_checksummed(&mut body, &prefix)?;
        push_checksummed(&mut body, &entries)?;
        Ok(body)
    }

    pub fn write<W: Write>(&self, mut writer: W, offset: u64) -> io::Result<u64> {
        let body = self.body_bytes()?;
        let header = SectionHeader::with_body(SectionType::Error2, offset, body.len() as u64);
        header.write(&mut writer)?;
        writer.write_all(&body)?;
        Ok(header.next_offset)
    }

    pub fn parse(body: &[u8]) -> Result<Self, SectionError> {
        let malformed = |reason: String| SectionError::Malformed { what: "error2".into(), reason };
        let prefix_end = PREFIX_SIZE + 4;
        let prefix = body
            .get(..prefix_end)
            .ok_or_else(|| malformed(format!("{} bytes is too short", body.len())))?;
        let mut prefix = split_checksummed(prefix, "error2 prefix")?;
        let count = prefix.read_u32::<LittleEndian>()? as usize;

        let end = prefix_end + count * 8 + 4;
        let entries = body
            .get(prefix_end..end)
            .ok_or_else(|| malformed(format!("{count} runs do not fit in {} bytes", body.len())))?;
        let mut entries = split_checksummed(entries, "error2 entries")?;
        let mut runs = Vec::with_capacity(count);
        for _ in 0..count {
            let first = entries.read_u32::<LittleEndian>()?;
            let count = entries.read_u32::<LittleEndian>()?;
            runs.push(SectorRun { first, count });
        }
        Ok(Self { runs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn collapses_runs() {
        let section = Error2Section::from_sectors(&[102, 100, 101, 7, 500, 501, 100]);
        assert_eq!(
            section.runs,
            vec![
                SectorRun { first: 7, count: 1 },
                SectorRun { first: 100, count: 3 },
                SectorRun { first: 500, count: 2 },
            ]
        );
        assert_eq!(section.sector_total(), 6);
        let body = section.body_bytes().unwrap();
        assert_eq!(body.len(), 520 + 3 * 8 + 4);
        assert_eq!(Error2Section::parse(&body).unwrap(), section);
    }

    #[test]
    fn sectors_past_32_bits_are_clamped_not_dropped() {
        let far = (1u64 << 32) + 7;
        let section = Error2Section::from_sectors(&[5, far, far + 1, u64::from(u32::MAX)]);
        assert_eq!(
            section.runs,
            vec![SectorRun { first: 5, count: 1 }, SectorRun { first: u32::MAX, count: 3 }]
        );
        assert_eq!(section.sector_total(), 4);
        assert_eq!(sector_runs(&[far + 1, 5, far]), vec![(5, 1), (far, 2)]);
    }

    #[test]
    fn empty_list() {
        let section = Error2Section::from_sectors(&[]);
        assert!(section.runs.is_empty());
        assert_eq!(Error2Section::parse(&section.body_bytes().unwrap()).unwrap(), section);
    }

    proptest! {
        #[test]
        fn runs_cover_exactly_the_input(sectors in proptest::collection::vec(0u64..2000, 0..200)) {
            let section = Error2Section::from_sectors(&sectors);
            let mut expanded: Vec<u64> = section
                .runs
                .iter()
                .flat_map(|r| (r.first..r.first + r.count).map(u64::from))
                .collect();
            let mut expected = sectors.clone();
            expected.sort_unstable();
            expected.dedup();
            prop_assert_eq!(&expanded, &expected);
            expanded.dedup();
            for pair in section.runs.windows(2) {
                prop_assert!(pair[0].first + pair[0].count < pair[1].first);
            }
        }
    }
}
