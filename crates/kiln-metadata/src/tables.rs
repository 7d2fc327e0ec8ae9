//! The `#~` table stream (ECMA-335 II.24.2.6) and the table schema of II.22.
//!
//! Every table is sized even when nothing reads it, otherwise the offsets of
//! the tables that follow it cannot be computed.

use crate::error::{Error, Result};
use crate::reader::Reader;

macro_rules! tables {
    ($($name:ident = $id:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum TableId {
            $($name = $id),*
        }

        impl TableId {
            pub const ALL: &'static [TableId] = &[$(TableId::$name),*];

            pub fn from_u8(id: u8) -> Option<Self> {
                match id {
                    $($id => Some(TableId::$name),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(TableId::$name => stringify!($name),)*
                }
            }
        }
    };
}

tables! {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    Constant = 0x0B,
    CustomAttribute = 0x0C,
    FieldMarshal = 0x0D,
    DeclSecurity = 0x0E,
    ClassLayout = 0x0F,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    ImplMap = 0x1C,
    FieldRva = 0x1D,
    EncLog = 0x1E,
    EncMap = 0x1F,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOs = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOs = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
}

const TABLE_SLOTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodedIndex {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
}

impl CodedIndex {
    fn tables(self) -> &'static [Option<TableId>] {
        use TableId::*;
        match self {
            CodedIndex::TypeDefOrRef => &[Some(TypeDef), Some(TypeRef), Some(TypeSpec)],
            CodedIndex::HasConstant => &[Some(Field), Some(Param), Some(Property)],
            CodedIndex::HasCustomAttribute => &[
                Some(MethodDef),
                Some(Field),
                Some(TypeRef),
                Some(TypeDef),
                Some(Param),
                Some(InterfaceImpl),
                Some(MemberRef),
                Some(Module),
                Some(DeclSecurity),
                Some(Property),
                Some(Event),
                Some(StandAloneSig),
                Some(ModuleRef),
                Some(TypeSpec),
                Some(Assembly),
                Some(AssemblyRef),
                Some(File),
                Some(ExportedType),
                Some(ManifestResource),
                Some(GenericParam),
                Some(GenericParamConstraint),
                Some(MethodSpec),
            ],
            CodedIndex::HasFieldMarshal => &[Some(Field), Some(Param)],
            CodedIndex::HasDeclSecurity => &[Some(TypeDef), Some(MethodDef), Some(Assembly)],
            CodedIndex::MemberRefParent => &[
                Some(TypeDef),
                Some(TypeRef),
                Some(ModuleRef),
                Some(MethodDef),
                Some(TypeSpec),
            ],
            CodedIndex::HasSemantics => &[Some(Event), Some(Property)],
            CodedIndex::MethodDefOrRef => &[Some(MethodDef), Some(MemberRef)],
            CodedIndex::MemberForwarded => &[Some(Field), Some(MethodDef)],
            CodedIndex::Implementation => &[Some(File), Some(AssemblyRef), Some(ExportedType)],
            CodedIndex::CustomAttributeType => {
                &[None, None, Some(MethodDef), Some(MemberRef), None]
            }
            CodedIndex::ResolutionScope => {
                &[Some(Module), Some(ModuleRef), Some(AssemblyRef), Some(TypeRef)]
            }
            CodedIndex::TypeOrMethodDef => &[Some(TypeDef), Some(MethodDef)],
        }
    }

    fn tag_bits(self) -> u32 {
        let n = self.tables().len() as u32;
        32 - (n - 1).leading_zeros()
    }

    pub fn name(self) -> &'static str {
        match self {
            CodedIndex::TypeDefOrRef => "TypeDefOrRef",
            CodedIndex::HasConstant => "HasConstant",
            CodedIndex::HasCustomAttribute => "HasCustomAttribute",
            CodedIndex::HasFieldMarshal => "HasFieldMarshal",
            CodedIndex::HasDeclSecurity => "HasDeclSecurity",
            CodedIndex::MemberRefParent => "MemberRefParent",
            CodedIndex::HasSemantics => "HasSemantics",
            CodedIndex::MethodDefOrRef => "MethodDefOrRef",
            CodedIndex::MemberForwarded => "MemberForwarded",
            CodedIndex::Implementation => "Implementation",
            CodedIndex::CustomAttributeType => "CustomAttributeType",
            CodedIndex::ResolutionScope => "ResolutionScope",
            CodedIndex::TypeOrMethodDef => "TypeOrMethodDef",
        }
    }

    /// Decodes a raw column value. A zero row means "no reference".
    pub fn decode(self, raw: u32) -> Result<Option<Token>> {
        let bits = self.tag_bits();
        let tag = raw & ((1 << bits) - 1);
        let row = raw >> bits;
        let table = self
            .tables()
            .get(tag as usize)
            .copied()
            .flatten()
            .ok_or(Error::InvalidCodedIndex {
                kind: self.name(),
                tag,
            })?;
        Ok((row != 0).then_some(Token { table, row }))
    }

    /// Encodes a token; the inverse of [`CodedIndex::decode`].
    pub fn encode(self, token: Token) -> Option<u32> {
        let tag = self
            .tables()
            .iter()
            .position(|t| *t == Some(token.table))?;
        Some((token.row << self.tag_bits()) | tag as u32)
    }
}

/// A (table, 1-based row) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    pub table: TableId,
    pub row: u32,
}

impl Token {
    pub fn new(table: TableId, row: u32) -> Self {
        Self { table, row }
    }
}

#[derive(Debug, Clone, Copy)]
enum Column {
    U16,
    U32,
    Str,
    Guid,
    Blob,
    Index(TableId),
    Coded(CodedIndex),
}

fn schema(table: TableId) -> &'static [Column] {
    use CodedIndex as C;
    use Column::*;
    use TableId as T;
    match table {
        T::Module => &[U16, Str, Guid, Guid, Guid],
        T::TypeRef => &[Coded(C::ResolutionScope), Str, Str],
        T::TypeDef => &[
            U32,
            Str,
            Str,
            Coded(C::TypeDefOrRef),
            Index(T::Field),
            Index(T::MethodDef),
        ],
        T::FieldPtr => &[Index(T::Field)],
        T::Field => &[U16, Str, Blob],
        T::MethodPtr => &[Index(T::MethodDef)],
        T::MethodDef => &[U32, U16, U16, Str, Blob, Index(T::Param)],
        T::ParamPtr => &[Index(T::Param)],
        T::Param => &[U16, U16, Str],
        T::InterfaceImpl => &[Index(T::TypeDef), Coded(C::TypeDefOrRef)],
        T::MemberRef => &[Coded(C::MemberRefParent), Str, Blob],
        T::Constant => &[U16, Coded(C::HasConstant), Blob],
        T::CustomAttribute => &[
            Coded(C::HasCustomAttribute),
            Coded(C::CustomAttributeType),
            Blob,
        ],
        T::FieldMarshal => &[Coded(C::HasFieldMarshal), Blob],
        T::DeclSecurity => &[U16, Coded(C::HasDeclSecurity), Blob],
        T::ClassLayout => &[U16, U32, Index(T::TypeDef)],
        T::FieldLayout => &[U32, Index(T::Field)],
        T::StandAloneSig => &[Blob],
        T::EventMap => &[Index(T::TypeDef), Index(T::Event)],
        T::EventPtr => &[Index(T::Event)],
        T::Event => &[U16, Str, Coded(C::TypeDefOrRef)],
        T::PropertyMap => &[Index(T::TypeDef), Index(T::Property)],
        T::PropertyPtr => &[Index(T::Property)],
        T::Property => &[U16, Str, Blob],
        T::MethodSemantics => &[U16, Index(T::MethodDef), Coded(C::HasSemantics)],
        T::MethodImpl => &[
            Index(T::TypeDef),
            Coded(C::MethodDefOrRef),
            Coded(C::MethodDefOrRef),
        ],
        T::ModuleRef => &[Str],
        T::TypeSpec => &[Blob],
        T::ImplMap => &[U16, Coded(C::MemberForwarded), Str, Index(T::ModuleRef)],
        T::FieldRva => &[U32, Index(T::Field)],
        T::EncLog => &[U32, U32],
        T::EncMap => &[U32],
        T::Assembly => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
        T::AssemblyProcessor => &[U32],
        T::AssemblyOs => &[U32, U32, U32],
        T::AssemblyRef => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
        T::AssemblyRefProcessor => &[U32, Index(T::AssemblyRef)],
        T::AssemblyRefOs => &[U32, U32, U32, Index(T::AssemblyRef)],
        T::File => &[U32, Str, Blob],
        T::ExportedType => &[U32, U32, Str, Str, Coded(C::Implementation)],
        T::ManifestResource => &[U32, U32, Str, Coded(C::Implementation)],
        T::NestedClass => &[Index(T::TypeDef), Index(T::TypeDef)],
        T::GenericParam => &[U16, U16, Coded(C::TypeOrMethodDef), Str],
        T::MethodSpec => &[Coded(C::MethodDefOrRef), Blob],
        T::GenericParamConstraint => &[Index(T::GenericParam), Coded(C::TypeDefOrRef)],
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ColumnLayout {
    offset: usize,
    wide: bool,
}

#[derive(Debug, Clone, Default)]
struct TableData<'a> {
    rows: u32,
    row_size: usize,
    columns: Vec<ColumnLayout>,
    data: &'a [u8],
}

/// Heap-size flags from the table stream header.
const HEAP_STRINGS_WIDE: u8 = 0x01;
const HEAP_GUID_WIDE: u8 = 0x02;
const HEAP_BLOB_WIDE: u8 = 0x04;
const HEAP_EXTRA_DATA: u8 = 0x40;

#[derive(Debug, Clone)]
pub struct Tables<'a> {
    tables: Vec<TableData<'a>>,
}

impl<'a> Tables<'a> {
    pub fn parse(stream: &'a [u8]) -> Result<Self> {
        let mut reader = Reader::new(stream);
        let _reserved = reader.read_u4()?;
        let _major = reader.read_u1()?;
        let _minor = reader.read_u1()?;
        let heap_sizes = reader.read_u1()?;
        let _reserved = reader.read_u1()?;
        let valid = reader.read_u8()?;
        let _sorted = reader.read_u8()?;

        let mut row_counts = [0u32; TABLE_SLOTS];
        for (id, count) in row_counts.iter_mut().enumerate() {
            if valid & (1u64 << id) == 0 {
                continue;
            }
            if TableId::from_u8(id as u8).is_none() {
                return Err(Error::UnknownTable(id as u8));
            }
            *count = reader.read_u4()?;
        }
        if heap_sizes & HEAP_EXTRA_DATA != 0 {
            reader.skip(4)?;
        }

        let row_count = |table: TableId| row_counts[table as usize];
        let index_wide = |table: TableId| row_count(table) > 0xFFFF;
        let coded_wide = |coded: CodedIndex| {
            let limit = 1u32 << (16 - coded.tag_bits());
            coded
                .tables()
                .iter()
                .flatten()
                .any(|table| row_count(*table) >= limit)
        };

        let mut tables = Vec::with_capacity(TableId::ALL.len());
        for &table in TableId::ALL {
            let mut offset = 0usize;
            let mut columns = Vec::new();
            for column in schema(table) {
                let (size, wide) = match column {
                    Column::U16 => (2, false),
                    Column::U32 => (4, true),
                    Column::Str => wide_pair(heap_sizes & HEAP_STRINGS_WIDE != 0),
                    Column::Guid => wide_pair(heap_sizes & HEAP_GUID_WIDE != 0),
                    Column::Blob => wide_pair(heap_sizes & HEAP_BLOB_WIDE != 0),
                    Column::Index(target) => wide_pair(index_wide(*target)),
                    Column::Coded(coded) => wide_pair(coded_wide(*coded)),
                };
                columns.push(ColumnLayout { offset, wide });
                offset += size;
            }

            let rows = row_count(table);
            let len = (rows as usize)
                .checked_mul(offset)
                .ok_or(Error::UnexpectedEof)?;
            let data = reader.read_bytes(len)?;
            tables.push(TableData {
                rows,
                row_size: offset,
                columns,
                data,
            });
        }

        Ok(Self { tables })
    }

    pub fn row_count(&self, table: TableId) -> u32 {
        self.tables[table as usize].rows
    }

    /// Returns row `rid` (1-based) of `table`.
    pub fn row(&self, table: TableId, rid: u32) -> Result<Row<'_, 'a>> {
        let data = &self.tables[table as usize];
        if rid == 0 || rid > data.rows {
            return Err(Error::InvalidTableIndex {
                table: table.name(),
                index: rid,
            });
        }
        let start = (rid as usize - 1) * data.row_size;
        let all: &'a [u8] = data.data;
        Ok(Row {
            table,
            layout: data,
            bytes: &all[start..start + data.row_size],
        })
    }

    pub fn rows(&self, table: TableId) -> impl Iterator<Item = Result<Row<'_, 'a>>> + '_ {
        (1..=self.row_count(table)).map(move |rid| self.row(table, rid))
    }
}

fn wide_pair(wide: bool) -> (usize, bool) {
    if wide {
        (4, true)
    } else {
        (2, false)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Row<'t, 'a> {
    table: TableId,
    layout: &'t TableData<'a>,
    bytes: &'a [u8],
}

impl<'t, 'a> Row<'t, 'a> {
    pub fn table(&self) -> TableId {
        self.table
    }

    /// Raw value of column `column` (0-based).
    pub fn get(&self, column: usize) -> u32 {
        let ColumnLayout { offset, wide } = self.layout.columns[column];
        let schema = schema(self.table);
        match schema[column] {
            Column::U16 => u32::from(u16::from_le_bytes([
                self.bytes[offset],
                self.bytes[offset + 1],
            ])),
            _ if wide => u32::from_le_bytes([
                self.bytes[offset],
                self.bytes[offset + 1],
                self.bytes[offset + 2],
                self.bytes[offset + 3],
            ]),
            _ => u32::from(u16::from_le_bytes([
                self.bytes[offset],
                self.bytes[offset + 1],
            ])),
        }
    }

    pub fn coded(&self, column: usize) -> Result<Option<Token>> {
        match schema(self.table)[column] {
            Column::Coded(kind) => kind.decode(self.get(column)),
            _ => Err(Error::Other("column is not a coded index")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coded_index_tag_widths() {
        assert_eq!(CodedIndex::TypeDefOrRef.tag_bits(), 2);
        assert_eq!(CodedIndex::HasCustomAttribute.tag_bits(), 5);
        assert_eq!(CodedIndex::CustomAttributeType.tag_bits(), 3);
        assert_eq!(CodedIndex::HasSemantics.tag_bits(), 1);
        assert_eq!(CodedIndex::ResolutionScope.tag_bits(), 2);
    }

    #[test]
    fn coded_index_decode() {
        // TypeRef row 5.
        assert_eq!(
            CodedIndex::TypeDefOrRef.decode((5 << 2) | 1).unwrap(),
            Some(Token::new(TableId::TypeRef, 5))
        );
        assert_eq!(CodedIndex::TypeDefOrRef.decode(0).unwrap(), None);
        assert!(CodedIndex::CustomAttributeType.decode(1 << 3).is_err());
        assert!(CodedIndex::TypeDefOrRef.decode(3).is_err());
    }

    #[test]
    fn coded_index_round_trips_assembly_parent() {
        let token = Token::new(TableId::Assembly, 1);
        let raw = CodedIndex::HasCustomAttribute.encode(token).unwrap();
        assert_eq!(raw, (1 << 5) | 14);
        assert_eq!(
            CodedIndex::HasCustomAttribute.decode(raw).unwrap(),
            Some(token)
        );
    }

    #[test]
    fn empty_table_stream_parses() {
        let mut stream = vec![0u8; 24];
        stream[4] = 2;
        let tables = Tables::parse(&stream).unwrap();
        assert_eq!(tables.row_count(TableId::TypeDef), 0);
        assert!(tables.row(TableId::TypeDef, 1).is_err());
    }

    #[test]
    fn rejects_unknown_tables() {
        let mut stream = vec![0u8; 24];
        // Bit 0x30 is a portable-PDB table, never valid in an assembly.
        stream[8..16].copy_from_slice(&(1u64 << 0x30).to_le_bytes());
        stream.extend_from_slice(&1u32.to_le_bytes());
        assert_eq!(Tables::parse(&stream).unwrap_err(), Error::UnknownTable(0x30));
    }

    #[test]
    fn row_columns_respect_heap_widths() {
        // Valid: Module only; wide strings heap.
        let mut stream = vec![0u8; 24];
        stream[6] = HEAP_STRINGS_WIDE;
        stream[8..16].copy_from_slice(&1u64.to_le_bytes());
        stream.extend_from_slice(&1u32.to_le_bytes());
        // Module row: generation u16, name u32 (wide), 3 guids u16.
        stream.extend_from_slice(&7u16.to_le_bytes());
        stream.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        stream.extend_from_slice(&[1, 0, 0, 0, 0, 0]);
        let tables = Tables::parse(&stream).unwrap();
        let row = tables.row(TableId::Module, 1).unwrap();
        assert_eq!(row.get(0), 7);
        assert_eq!(row.get(1), 0x0001_0000);
        assert_eq!(row.get(2), 1);
    }
}
