use crate::error::{Error, Result};
use crate::reader::Reader;

/// `#Strings`: null-terminated UTF-8 identifiers.
#[derive(Debug, Clone, Copy)]
pub struct StringsHeap<'a>(&'a [u8]);

impl<'a> StringsHeap<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self(bytes)
    }

    pub fn get(&self, index: u32) -> Result<&'a str> {
        let start = index as usize;
        let tail = self.0.get(start..).ok_or(Error::InvalidHeapIndex {
            heap: "#Strings",
            index,
        })?;
        let len = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..len]).map_err(|_| Error::InvalidUtf8)
    }
}

/// `#Blob`: length-prefixed byte strings.
#[derive(Debug, Clone, Copy)]
pub struct BlobHeap<'a>(&'a [u8]);

impl<'a> BlobHeap<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self(bytes)
    }

    pub fn get(&self, index: u32) -> Result<&'a [u8]> {
        if index == 0 && self.0.is_empty() {
            return Ok(&[]);
        }
        let mut reader = Reader::at(self.0, index as usize).map_err(|_| Error::InvalidHeapIndex {
            heap: "#Blob",
            index,
        })?;
        let len = reader.read_compressed_u32()?;
        reader.read_bytes(len as usize)
    }
}

/// `#GUID`: 16-byte entries addressed from 1.
#[derive(Debug, Clone, Copy)]
pub struct GuidHeap<'a>(&'a [u8]);

impl<'a> GuidHeap<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self(bytes)
    }

    pub fn get(&self, index: u32) -> Result<Option<&'a [u8]>> {
        if index == 0 {
            return Ok(None);
        }
        let start = (index as usize - 1) * 16;
        self.0
            .get(start..start + 16)
            .map(Some)
            .ok_or(Error::InvalidHeapIndex {
                heap: "#GUID",
                index,
            })
    }
}

/// Stream locations inside the metadata root (II.24.2.1).
#[derive(Debug, Clone, Default)]
pub(crate) struct Streams<'a> {
    pub version: String,
    pub tables: Option<&'a [u8]>,
    pub uncompressed_tables: bool,
    pub strings: &'a [u8],
    pub blob: &'a [u8],
    pub guid: &'a [u8],
}

pub(crate) const METADATA_SIGNATURE: u32 = 0x424A_5342;

impl<'a> Streams<'a> {
    pub(crate) fn parse(metadata: &'a [u8]) -> Result<Self> {
        let mut reader = Reader::new(metadata);
        let signature = reader.read_u4()?;
        if signature != METADATA_SIGNATURE {
            return Err(Error::InvalidMetadataSignature(signature));
        }
        let _major = reader.read_u2()?;
        let _minor = reader.read_u2()?;
        let _reserved = reader.read_u4()?;
        let version_len = reader.read_u4()? as usize;
        let raw_version = reader.read_bytes(version_len)?;
        let end = raw_version.iter().position(|b| *b == 0).unwrap_or(version_len);
        let version = String::from_utf8_lossy(&raw_version[..end]).into_owned();
        reader.align_to(4)?;
        let _flags = reader.read_u2()?;
        let stream_count = reader.read_u2()?;

        let mut streams = Streams {
            version,
            ..Streams::default()
        };
        for _ in 0..stream_count {
            let offset = reader.read_u4()? as usize;
            let size = reader.read_u4()? as usize;
            let name = read_stream_name(&mut reader)?;
            let data = offset
                .checked_add(size)
                .and_then(|end| metadata.get(offset..end))
                .ok_or(Error::UnexpectedEof)?;
            match name {
                "#~" => streams.tables = Some(data),
                "#-" => {
                    streams.tables = Some(data);
                    streams.uncompressed_tables = true;
                }
                "#Strings" => streams.strings = data,
                "#Blob" => streams.blob = data,
                "#GUID" => streams.guid = data,
                // #US and vendor streams never contribute to the API surface.
                _ => {}
            }
        }
        Ok(streams)
    }
}

fn read_stream_name<'a>(reader: &mut Reader<'a>) -> Result<&'a str> {
    let raw = reader.read_cstr(32)?;
    reader.align_to(4)?;
    std::str::from_utf8(raw).map_err(|_| Error::InvalidUtf8)
}
