use crate::error::{Error, Result};
use crate::reader::Reader;

const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;
const CLI_HEADER_DIRECTORY: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_pointer: u32,
    pub raw_size: u32,
}

impl Section {
    fn contains(&self, rva: u32) -> bool {
        let extent = self.virtual_size.max(self.raw_size);
        rva >= self.virtual_address && rva - self.virtual_address < extent
    }
}

/// The parts of a PE image needed to reach the CLI metadata.
#[derive(Debug, Clone)]
pub struct PeImage<'a> {
    bytes: &'a [u8],
    pub sections: Vec<Section>,
    pub cli_header: DataDirectory,
    pub metadata: DataDirectory,
    pub cli_flags: u32,
}

impl<'a> PeImage<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < 0x40 || &bytes[..2] != b"MZ" {
            return Err(Error::InvalidDosHeader);
        }
        let mut dos = Reader::at(bytes, 0x3C)?;
        let pe_offset = dos.read_u4()? as usize;

        let mut reader = Reader::at(bytes, pe_offset)?;
        let signature = reader.read_u4()?;
        if signature != 0x0000_4550 {
            return Err(Error::InvalidPeSignature(signature));
        }

        // COFF file header.
        let _machine = reader.read_u2()?;
        let section_count = reader.read_u2()? as usize;
        reader.skip(12)?;
        let optional_header_size = reader.read_u2()? as usize;
        let _characteristics = reader.read_u2()?;

        let optional_start = reader.position();
        let magic = reader.read_u2()?;
        let (count_offset, directories_offset) = match magic {
            PE32_MAGIC => (92, 96),
            PE32_PLUS_MAGIC => (108, 112),
            other => return Err(Error::InvalidOptionalHeaderMagic(other)),
        };

        let mut count_reader = Reader::at(bytes, optional_start + count_offset)?;
        let directory_count = count_reader.read_u4()? as usize;
        if directory_count <= CLI_HEADER_DIRECTORY {
            return Err(Error::NotManaged);
        }
        let mut dir_reader =
            Reader::at(bytes, optional_start + directories_offset + CLI_HEADER_DIRECTORY * 8)?;
        let cli_header = DataDirectory {
            rva: dir_reader.read_u4()?,
            size: dir_reader.read_u4()?,
        };
        if cli_header.rva == 0 || cli_header.size == 0 {
            return Err(Error::NotManaged);
        }

        let mut section_reader = Reader::at(bytes, optional_start + optional_header_size)?;
        let mut sections = Vec::with_capacity(section_count);
        for _ in 0..section_count {
            let raw_name = section_reader.read_bytes(8)?;
            let name_len = raw_name.iter().position(|b| *b == 0).unwrap_or(8);
            let name = String::from_utf8_lossy(&raw_name[..name_len]).into_owned();
            let virtual_size = section_reader.read_u4()?;
            let virtual_address = section_reader.read_u4()?;
            let raw_size = section_reader.read_u4()?;
            let raw_pointer = section_reader.read_u4()?;
            section_reader.skip(16)?;
            sections.push(Section {
                name,
                virtual_address,
                virtual_size,
                raw_pointer,
                raw_size,
            });
        }

        let mut image = Self {
            bytes,
            sections,
            cli_header,
            metadata: DataDirectory { rva: 0, size: 0 },
            cli_flags: 0,
        };

        // CLI header (II.25.3.3): cb, runtime version, metadata directory, flags.
        let cli = image.slice(cli_header.rva, cli_header.size.max(24))?;
        let mut cli_reader = Reader::new(cli);
        cli_reader.skip(8)?;
        image.metadata = DataDirectory {
            rva: cli_reader.read_u4()?,
            size: cli_reader.read_u4()?,
        };
        image.cli_flags = cli_reader.read_u4()?;
        if image.metadata.rva == 0 || image.metadata.size == 0 {
            return Err(Error::MissingStream("metadata"));
        }

        Ok(image)
    }

    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        let section = self
            .sections
            .iter()
            .find(|s| s.contains(rva))
            .ok_or(Error::RvaOutOfRange(rva))?;
        Ok((rva - section.virtual_address) as usize + section.raw_pointer as usize)
    }

    /// Returns `len` bytes of the file starting at `rva`.
    pub fn slice(&self, rva: u32, len: u32) -> Result<&'a [u8]> {
        let start = self.rva_to_offset(rva)?;
        let end = start
            .checked_add(len as usize)
            .ok_or(Error::RvaOutOfRange(rva))?;
        self.bytes.get(start..end).ok_or(Error::UnexpectedEof)
    }

    pub fn metadata_bytes(&self) -> Result<&'a [u8]> {
        self.slice(self.metadata.rva, self.metadata.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_pe_input() {
        assert_eq!(
            PeImage::parse(b"definitely not an assembly, just some text padding it out to 64 bytes")
                .unwrap_err(),
            Error::InvalidDosHeader
        );
    }

    #[test]
    fn rejects_bad_pe_signature() {
        let mut bytes = vec![0u8; 0x100];
        bytes[0] = b'M';
        bytes[1] = b'Z';
        bytes[0x3C] = 0x80;
        bytes[0x80..0x84].copy_from_slice(b"NE\0\0");
        assert!(matches!(
            PeImage::parse(&bytes),
            Err(Error::InvalidPeSignature(_))
        ));
    }
}
