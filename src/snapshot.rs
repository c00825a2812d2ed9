//! Reconstruction of an on-disk PE file from an image mapped by the loader.
//!
//! After static initialization the decrypted metadata of a packed module lives in its
//! mapped image. Reading each section from its virtual address and placing it at its raw
//! file offset yields a file the module loader can open, with every structure the packer
//! fixed up in memory preserved.

use goblin::pe::{
    header::{Header, SIZEOF_COFF_HEADER, SIZEOF_PE_MAGIC},
    section_table::{SectionTable, SIZEOF_SECTION_TABLE},
};

use crate::{file::io::read_le, runtime::memory::MemoryAccess, Result};

const DOS_HEADER_SIZE: usize = 0x40;
const PE_POINTER_OFFSET: usize = 0x3C;

/// Upper bound of the header span read from memory before it is validated.
const MAX_HEADER_SPAN: usize = 0x1_0000;

/// Parsed layout of a mapped image.
#[derive(Debug)]
pub struct ImageLayout {
    /// `SizeOfHeaders` of the optional header
    pub size_of_headers: usize,
    /// Section table in file order
    pub sections: Vec<SectionTable>,
}

impl ImageLayout {
    /// Reads and parses the PE headers of the image mapped at `base`.
    ///
    /// # Errors
    /// Returns a memory error if the headers are not readable, a
    /// [`crate::Error::GoblinErr`] if they do not parse, or [`crate::Error::Malformed`] for
    /// images without an optional header.
    pub fn read(memory: &dyn MemoryAccess, base: usize) -> Result<Self> {
        let dos = memory.read_vec(base, DOS_HEADER_SIZE)?;
        let pe_pointer = read_le::<u32>(&dos[PE_POINTER_OFFSET..])? as usize;

        let coff_end = pe_pointer + SIZEOF_PE_MAGIC + SIZEOF_COFF_HEADER;
        if coff_end > MAX_HEADER_SPAN {
            return Err(malformed_error!(
                "PE header at 0x{:X} lies outside of the header span",
                pe_pointer
            ));
        }
        let prefix = memory.read_vec(base, coff_end)?;
        let section_count = read_le::<u16>(&prefix[pe_pointer + SIZEOF_PE_MAGIC + 2..])?;
        let optional_size = read_le::<u16>(&prefix[pe_pointer + SIZEOF_PE_MAGIC + 16..])?;

        let table_offset = coff_end + usize::from(optional_size);
        let span = table_offset + usize::from(section_count) * SIZEOF_SECTION_TABLE;
        if span > MAX_HEADER_SPAN {
            return Err(malformed_error!(
                "{} sections do not fit the header span",
                section_count
            ));
        }

        let headers = memory.read_vec(base, span)?;
        let header = Header::parse(&headers)?;
        let Some(optional_header) = header.optional_header else {
            return Err(malformed_error!("Image at 0x{:X} has no optional header", base));
        };

        let mut offset = table_offset;
        let sections = header.coff_header.sections(&headers, &mut offset)?;

        Ok(ImageLayout {
            size_of_headers: optional_header.windows_fields.size_of_headers as usize,
            sections,
        })
    }

    /// Size of the reconstructed file.
    #[must_use]
    pub fn file_size(&self) -> usize {
        self.sections
            .iter()
            .map(|section| section.pointer_to_raw_data as usize + section.size_of_raw_data as usize)
            .fold(self.size_of_headers, usize::max)
    }
}

/// Bytes of a section that are copied: its virtual size capped at its raw size, or the
/// raw size when no virtual size is recorded.
fn copy_length(section: &SectionTable) -> usize {
    let raw = section.size_of_raw_data as usize;
    match section.virtual_size as usize {
        0 => raw,
        virtual_size => virtual_size.min(raw),
    }
}

/// Rebuilds the file image of the module mapped at `base`.
///
/// # Errors
/// Returns an error if the headers do not parse or a section is not readable.
pub fn reconstruct(memory: &dyn MemoryAccess, base: usize) -> Result<Vec<u8>> {
    let layout = ImageLayout::read(memory, base)?;
    let mut file = vec![0u8; layout.file_size()];

    memory.read(base, &mut file[..layout.size_of_headers])?;

    for section in &layout.sections {
        let length = copy_length(section);
        let start = section.pointer_to_raw_data as usize;
        log::debug!(
            "Section {} - RVA 0x{:X} -> file 0x{:X} (0x{:X} bytes)",
            section.name().unwrap_or("?"),
            section.virtual_address,
            start,
            length
        );

        memory.read(
            base + section.virtual_address as usize,
            &mut file[start..start + length],
        )?;
    }

    log::info!(
        "Reconstructed 0x{:X} byte image from 0x{:X} ({} sections)",
        file.len(),
        base,
        layout.sections.len()
    );
    Ok(file)
}
