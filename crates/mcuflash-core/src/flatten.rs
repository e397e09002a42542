use std::io::{self, Write};

use log::debug;
use thiserror::Error;

use crate::section::Sections;

pub const DEFAULT_PAD: u8 = 0xff;

/// Largest image the flattener builds, gaps included.
pub const MAX_IMAGE_SIZE: u64 = 256 << 20;

const ADDR_SPACE_END: u64 = 1 << 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FlattenError {
    #[error(
        "overlapping sections: {prev_start:#010x}..{prev_end:#010x} and {next_start:#010x}..{next_end:#010x}"
    )]
    Overlap {
        prev_start: u64,
        prev_end: u64,
        next_start: u64,
        next_end: u64,
    },
    #[error("section at {start:#x} ({len} bytes) is outside the 32-bit address space")]
    OutOfRange { start: u64, len: usize },
    #[error("sections span {start:#010x}..{end:#010x}, more than 256 MiB")]
    TooLarge { start: u64, end: u64 },
}

/// Contiguous byte image that starts at `base_addr`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlatImage {
    pub base_addr: u64,
    pub bytes: Vec<u8>,
}

impl FlatImage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Right-pads the image with `pad` up to a multiple of `align`.
    pub fn pad_to(&mut self, align: usize, pad: u8) {
        let rem = self.bytes.len() % align;
        if rem != 0 {
            self.bytes.resize(self.bytes.len() + align - rem, pad);
        }
    }

    /// Writes the raw binary form of the image.
    pub fn write_bin(&self, mut output: impl Write) -> io::Result<()> {
        output.write_all(&self.bytes)?;
        output.flush()
    }
}

/// Sorts the sections by physical address and lays them out in one buffer,
/// filling the gaps with `pad`.
pub fn flatten(sections: &mut Sections, pad: u8) -> Result<FlatImage, FlattenError> {
    sections.sort_by_paddr();

    let mut ends = Vec::with_capacity(sections.len());
    for section in sections.iter() {
        match section.end() {
            Some(end) if end <= ADDR_SPACE_END => ends.push(end),
            _ => {
                return Err(FlattenError::OutOfRange {
                    start: section.paddr,
                    len: section.len(),
                })
            }
        }
    }

    let (first, last_end) = match (sections.as_slice().first(), ends.iter().max()) {
        (Some(first), Some(&last_end)) => (first, last_end),
        _ => return Ok(FlatImage::default()),
    };
    if last_end - first.paddr > MAX_IMAGE_SIZE {
        return Err(FlattenError::TooLarge {
            start: first.paddr,
            end: last_end,
        });
    }

    let mut bytes = Vec::with_capacity((last_end - first.paddr) as usize);
    bytes.extend_from_slice(&first.data);
    let mut prev = (first, ends[0]);

    for (next, &next_end) in sections.iter().zip(&ends).skip(1) {
        let (prev_section, prev_end) = prev;
        if next.paddr < prev_end {
            return Err(FlattenError::Overlap {
                prev_start: prev_section.paddr,
                prev_end,
                next_start: next.paddr,
                next_end,
            });
        }

        let gap = next.paddr - prev_end;
        if gap > 0 {
            debug!(
                "Padding {} bytes between {:#010x} and {:#010x}",
                gap, prev_end, next.paddr
            );
            bytes.resize(bytes.len() + gap as usize, pad);
        }
        bytes.extend_from_slice(&next.data);
        prev = (next, next_end);
    }

    Ok(FlatImage {
        base_addr: first.paddr,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::Section;

    #[test]
    fn fills_gaps_with_pad() {
        let mut sections: Sections = vec![
            Section::raw(0x1004, vec![0xbb]),
            Section::raw(0x1000, vec![0xaa]),
        ]
        .into();
        let image = flatten(&mut sections, 0xff).unwrap();
        assert_eq!(image.base_addr, 0x1000);
        assert_eq!(image.bytes, [0xaa, 0xff, 0xff, 0xff, 0xbb]);
    }

    #[test]
    fn contiguous_sections_are_not_padded() {
        let mut sections: Sections = vec![
            Section::raw(0x1000, vec![1, 2, 3, 4]),
            Section::raw(0x1004, vec![0x5a, 6]),
            Section::raw(0x1006, vec![7; 10]),
        ]
        .into();
        let image = flatten(&mut sections, 0x5a).unwrap();
        assert_eq!(image.len(), sections.size());
        // The only pad-valued byte is the one carried by section content
        assert_eq!(image.bytes.iter().filter(|&&b| b == 0x5a).count(), 1);
    }

    #[test]
    fn overlap_is_fatal() {
        let mut sections: Sections = vec![
            Section::raw(0x1000, vec![0; 16]),
            Section::raw(0x1008, vec![0; 16]),
        ]
        .into();
        assert_eq!(
            flatten(&mut sections, 0xff),
            Err(FlattenError::Overlap {
                prev_start: 0x1000,
                prev_end: 0x1010,
                next_start: 0x1008,
                next_end: 0x1018,
            })
        );
    }

    #[test]
    fn equal_addresses_overlap() {
        let mut sections: Sections = vec![
            Section::raw(0x2000, vec![1]),
            Section::raw(0x2000, vec![2]),
        ]
        .into();
        assert!(flatten(&mut sections, 0xff).is_err());
    }

    #[test]
    fn sections_past_32_bits_are_rejected() {
        let mut sections: Sections = vec![
            Section::raw(0x1000, vec![1]),
            Section::raw(u64::MAX - 1, vec![2, 3, 4]),
        ]
        .into();
        assert_eq!(
            flatten(&mut sections, 0xff),
            Err(FlattenError::OutOfRange {
                start: u64::MAX - 1,
                len: 3
            })
        );

        let mut sections: Sections = vec![Section::raw(0xffff_fffe, vec![0; 4])].into();
        assert!(matches!(
            flatten(&mut sections, 0xff),
            Err(FlattenError::OutOfRange { .. })
        ));

        // ending exactly at the top of the address space is fine
        let mut sections: Sections = vec![Section::raw(0xffff_fffe, vec![0; 2])].into();
        assert_eq!(flatten(&mut sections, 0xff).unwrap().len(), 2);
    }

    #[test]
    fn huge_gaps_are_rejected() {
        let mut sections: Sections = vec![
            Section::raw(0x0800_0000, vec![1]),
            Section::raw(0x2000_0000, vec![2]),
        ]
        .into();
        assert_eq!(
            flatten(&mut sections, 0xff),
            Err(FlattenError::TooLarge {
                start: 0x0800_0000,
                end: 0x2000_0001
            })
        );
    }

    #[test]
    fn empty_input_gives_empty_image() {
        let image = flatten(&mut Sections::new(), 0xff).unwrap();
        assert!(image.is_empty());
        assert_eq!(image.base_addr, 0);
    }

    #[test]
    fn pads_to_alignment() {
        let mut image = FlatImage {
            base_addr: 0x1000_0000,
            bytes: vec![0; 5000],
        };
        image.pad_to(4096, 0xff);
        assert_eq!(image.len(), 8192);
        assert!(image.bytes[5000..].iter().all(|&b| b == 0xff));

        image.pad_to(4096, 0xff);
        assert_eq!(image.len(), 8192);
    }
}
