use std::{fs, path::PathBuf};

use log::debug;
use thiserror::Error;

/// One contiguous loadable memory region.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Section {
    /// Address of the data during execution
    pub vaddr: u64,
    /// Physical location of the data in flash/ROM
    pub paddr: u64,
    /// Offset of the data in the file it was read from
    pub file_offset: u64,
    pub data: Vec<u8>,
}

impl Section {
    /// A section that lives at the same virtual and physical address, as
    /// produced for raw binaries.
    pub fn raw(paddr: u64, data: Vec<u8>) -> Self {
        Self {
            vaddr: paddr,
            paddr,
            file_offset: 0,
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// First physical address past the end of the section, if it is
    /// representable.
    pub fn end(&self) -> Option<u64> {
        self.paddr.checked_add(self.data.len() as u64)
    }
}

#[derive(Error, Debug)]
pub enum SectionError {
    #[error("bad '{0}' in the include list, expected BIN:ADDR")]
    BadInclude(String),
    #[error("bad address in '{0}'")]
    BadAddress(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Ordered collection of sections. Insertion order carries no meaning.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sections(Vec<Section>);

impl Sections {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, section: Section) {
        self.0.push(section);
    }

    pub fn extend(&mut self, other: Sections) {
        self.0.extend(other.0);
    }

    pub fn sort_by_paddr(&mut self) {
        self.0.sort_unstable_by_key(|s| s.paddr);
    }

    /// Sum of the section lengths, gaps not included.
    pub fn size(&self) -> usize {
        self.0.iter().map(Section::len).sum()
    }

    /// Lowest physical address of all sections.
    pub fn lowest_paddr(&self) -> Option<u64> {
        self.0.iter().map(|s| s.paddr).min()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Section> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Section] {
        &self.0
    }
}

impl From<Vec<Section>> for Sections {
    fn from(sections: Vec<Section>) -> Self {
        Self(sections)
    }
}

impl FromIterator<Section> for Sections {
    fn from_iter<I: IntoIterator<Item = Section>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Sections {
    type Item = Section;
    type IntoIter = std::vec::IntoIter<Section>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Sections {
    type Item = &'a Section;
    type IntoIter = std::slice::Iter<'a, Section>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Parses an unsigned integer in decimal, or with a `0x`, `0o` or `0b` prefix.
pub fn parse_int(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, radix) = match s.get(..2) {
        Some("0x") | Some("0X") => (&s[2..], 16),
        Some("0o") | Some("0O") => (&s[2..], 8),
        Some("0b") | Some("0B") => (&s[2..], 2),
        _ => (s, 10),
    };
    let digits = digits.replace('_', "");
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(&digits, radix).ok()
}

/// A raw binary file to be placed at a physical address, written `path:addr`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Include {
    pub path: PathBuf,
    pub paddr: u64,
}

impl std::str::FromStr for Include {
    type Err = SectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split at the last colon so Windows drive letters survive
        let (path, addr) = match s.rfind(':') {
            Some(i) if i > 0 => (&s[..i], &s[i + 1..]),
            _ => return Err(SectionError::BadInclude(s.to_string())),
        };
        let paddr = parse_int(addr).ok_or_else(|| SectionError::BadAddress(addr.to_string()))?;

        Ok(Self {
            path: PathBuf::from(path),
            paddr,
        })
    }
}

/// Parses a `BIN1:ADDR1,BIN2:ADDR2,...` list.
pub fn parse_includes(list: &str) -> Result<Vec<Include>, SectionError> {
    list.split(',').map(str::parse).collect()
}

/// Reads every included file into a section at its physical address.
pub fn read_includes(includes: &[Include]) -> Result<Sections, SectionError> {
    includes
        .iter()
        .map(|inc| {
            let data = fs::read(&inc.path).map_err(|source| SectionError::Read {
                path: inc.path.clone(),
                source,
            })?;
            debug!(
                "Including {} ({} bytes) at {:#010x}",
                inc.path.display(),
                data.len(),
                inc.paddr
            );
            Ok(Section::raw(inc.paddr, data))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbers_in_all_bases() {
        assert_eq!(parse_int("4096"), Some(4096));
        assert_eq!(parse_int("0x1000_0000"), Some(0x1000_0000));
        assert_eq!(parse_int("0o17"), Some(0o17));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("0x"), None);
        assert_eq!(parse_int("boot"), None);
    }

    #[test]
    fn parses_include_list() {
        let incs = parse_includes("boot.bin:0x60000000,C:\\fw\\data.bin:4096").unwrap();
        assert_eq!(incs.len(), 2);
        assert_eq!(incs[0].path, PathBuf::from("boot.bin"));
        assert_eq!(incs[0].paddr, 0x6000_0000);
        assert_eq!(incs[1].path, PathBuf::from("C:\\fw\\data.bin"));
        assert_eq!(incs[1].paddr, 4096);
    }

    #[test]
    fn rejects_bad_includes() {
        assert!(matches!(
            parse_includes("boot.bin"),
            Err(SectionError::BadInclude(_))
        ));
        assert!(matches!(
            parse_includes(":0x100"),
            Err(SectionError::BadInclude(_))
        ));
        assert!(matches!(
            parse_includes("boot.bin:zero"),
            Err(SectionError::BadAddress(_))
        ));
    }

    #[test]
    fn missing_include_file_is_reported() {
        let incs = parse_includes("/nonexistent/mcuflash/blob.bin:0x0").unwrap();
        assert!(matches!(
            read_includes(&incs),
            Err(SectionError::Read { .. })
        ));
    }

    #[test]
    fn sorts_by_physical_address() {
        let mut sections: Sections = vec![
            Section::raw(0x2000, vec![2]),
            Section::raw(0x1000, vec![1, 1]),
        ]
        .into();
        sections.sort_by_paddr();
        let addrs: Vec<u64> = sections.iter().map(|s| s.paddr).collect();
        assert_eq!(addrs, [0x1000, 0x2000]);
        assert_eq!(sections.size(), 3);
        assert_eq!(sections.lowest_paddr(), Some(0x1000));
    }
}
