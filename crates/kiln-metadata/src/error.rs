use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    UnexpectedEof,
    InvalidDosHeader,
    InvalidPeSignature(u32),
    InvalidOptionalHeaderMagic(u16),
    /// The image has no CLI header, i.e. it is a native binary.
    NotManaged,
    RvaOutOfRange(u32),
    InvalidMetadataSignature(u32),
    MissingStream(&'static str),
    UnknownTable(u8),
    InvalidTableIndex { table: &'static str, index: u32 },
    InvalidHeapIndex { heap: &'static str, index: u32 },
    InvalidUtf8,
    InvalidCompressedInteger,
    InvalidSignature(&'static str),
    InvalidCodedIndex { kind: &'static str, tag: u32 },
    RecursionLimit,
    Other(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnexpectedEof => write!(f, "unexpected end of input"),
            Error::InvalidDosHeader => write!(f, "missing MZ header"),
            Error::InvalidPeSignature(sig) => write!(f, "invalid PE signature: 0x{sig:08x}"),
            Error::InvalidOptionalHeaderMagic(magic) => {
                write!(f, "invalid optional header magic: 0x{magic:04x}")
            }
            Error::NotManaged => write!(f, "image has no CLI header (not a managed assembly)"),
            Error::RvaOutOfRange(rva) => write!(f, "RVA 0x{rva:08x} is not mapped by any section"),
            Error::InvalidMetadataSignature(sig) => {
                write!(f, "invalid metadata root signature: 0x{sig:08x}")
            }
            Error::MissingStream(name) => write!(f, "metadata stream {name} is missing"),
            Error::UnknownTable(id) => write!(f, "unknown metadata table 0x{id:02x}"),
            Error::InvalidTableIndex { table, index } => {
                write!(f, "row {index} is out of range for table {table}")
            }
            Error::InvalidHeapIndex { heap, index } => {
                write!(f, "offset {index} is out of range for heap {heap}")
            }
            Error::InvalidUtf8 => write!(f, "invalid UTF-8 in #Strings heap"),
            Error::InvalidCompressedInteger => write!(f, "invalid compressed integer"),
            Error::InvalidSignature(what) => write!(f, "invalid signature blob: {what}"),
            Error::InvalidCodedIndex { kind, tag } => {
                write!(f, "invalid {kind} coded index tag {tag}")
            }
            Error::RecursionLimit => write!(f, "signature nesting is too deep"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {}
