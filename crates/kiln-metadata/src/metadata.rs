use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::heaps::{BlobHeap, GuidHeap, Streams, StringsHeap};
use crate::pe::PeImage;
use crate::reader::Reader;
use crate::signature::{self, MethodSig, TypeNames};
use crate::tables::{TableId, Tables, Token};

const INTERNALS_VISIBLE_TO: &str = "System.Runtime.CompilerServices.InternalsVisibleToAttribute";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyIdentity {
    pub name: String,
    pub version: [u16; 4],
    pub culture: String,
    pub public_key: Vec<u8>,
}

impl AssemblyIdentity {
    pub fn version_string(&self) -> String {
        let [a, b, c, d] = self.version;
        format!("{a}.{b}.{c}.{d}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDefRow<'a> {
    pub rid: u32,
    pub flags: u32,
    pub name: &'a str,
    pub namespace: &'a str,
    pub extends: Option<Token>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRow<'a> {
    pub rid: u32,
    pub flags: u16,
    pub name: &'a str,
    pub signature: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodRow<'a> {
    pub rid: u32,
    pub rva: u32,
    pub impl_flags: u16,
    pub flags: u16,
    pub name: &'a str,
    pub signature: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRow<'a> {
    pub rid: u32,
    pub flags: u16,
    pub sequence: u16,
    pub name: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyRow<'a> {
    pub rid: u32,
    pub flags: u16,
    pub name: &'a str,
    pub signature: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRow<'a> {
    pub rid: u32,
    pub flags: u16,
    pub name: &'a str,
    pub event_type: Option<Token>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericParamRow<'a> {
    pub rid: u32,
    pub number: u16,
    pub flags: u16,
    pub name: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomAttributeRow<'a> {
    pub constructor: Token,
    pub value: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantRow<'a> {
    pub element_type: u8,
    pub value: &'a [u8],
}

/// Reverse indexes over tables whose rows point at their owner.
#[derive(Debug, Default)]
struct Indexes {
    enclosing: HashMap<u32, u32>,
    method_owner: HashMap<u32, u32>,
    field_owner: HashMap<u32, u32>,
    custom_attributes: HashMap<Token, Vec<u32>>,
    constants: HashMap<Token, u32>,
    interfaces: HashMap<u32, Vec<u32>>,
    generic_params: HashMap<Token, Vec<u32>>,
    generic_constraints: HashMap<u32, Vec<u32>>,
    semantics: HashMap<Token, Vec<(u16, u32)>>,
    class_layout: HashMap<u32, (u16, u32)>,
}

/// A parsed managed assembly: the table stream plus its heaps.
#[derive(Debug)]
pub struct Metadata<'a> {
    image: PeImage<'a>,
    version: String,
    tables: Tables<'a>,
    strings: StringsHeap<'a>,
    blobs: BlobHeap<'a>,
    guids: GuidHeap<'a>,
    indexes: Indexes,
}

impl<'a> Metadata<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let image = PeImage::parse(bytes)?;
        let streams = Streams::parse(image.metadata_bytes()?)?;
        let tables = Tables::parse(streams.tables.ok_or(Error::MissingStream("#~"))?)?;
        let mut metadata = Self {
            image,
            version: streams.version,
            tables,
            strings: StringsHeap::new(streams.strings),
            blobs: BlobHeap::new(streams.blob),
            guids: GuidHeap::new(streams.guid),
            indexes: Indexes::default(),
        };
        metadata.indexes = metadata.build_indexes()?;
        Ok(metadata)
    }

    pub fn image(&self) -> &PeImage<'a> {
        &self.image
    }

    /// Runtime version string from the metadata root, e.g. `v4.0.30319`.
    pub fn runtime_version(&self) -> &str {
        &self.version
    }

    pub fn tables(&self) -> &Tables<'a> {
        &self.tables
    }

    pub fn string(&self, index: u32) -> Result<&'a str> {
        self.strings.get(index)
    }

    pub fn blob(&self, index: u32) -> Result<&'a [u8]> {
        self.blobs.get(index)
    }

    pub fn module_mvid(&self) -> Result<Option<&'a [u8]>> {
        if self.tables.row_count(TableId::Module) == 0 {
            return Ok(None);
        }
        let row = self.tables.row(TableId::Module, 1)?;
        self.guids.get(row.get(2))
    }

    pub fn assembly(&self) -> Result<Option<AssemblyIdentity>> {
        if self.tables.row_count(TableId::Assembly) == 0 {
            return Ok(None);
        }
        let row = self.tables.row(TableId::Assembly, 1)?;
        Ok(Some(AssemblyIdentity {
            name: self.string(row.get(7))?.to_string(),
            version: [
                row.get(1) as u16,
                row.get(2) as u16,
                row.get(3) as u16,
                row.get(4) as u16,
            ],
            culture: self.string(row.get(8))?.to_string(),
            public_key: self.blob(row.get(6))?.to_vec(),
        }))
    }

    pub fn type_def_count(&self) -> u32 {
        self.tables.row_count(TableId::TypeDef)
    }

    pub fn type_def(&self, rid: u32) -> Result<TypeDefRow<'a>> {
        let row = self.tables.row(TableId::TypeDef, rid)?;
        Ok(TypeDefRow {
            rid,
            flags: row.get(0),
            name: self.string(row.get(1))?,
            namespace: self.string(row.get(2))?,
            extends: row.coded(3)?,
        })
    }

    pub fn field(&self, rid: u32) -> Result<FieldRow<'a>> {
        let row = self.tables.row(TableId::Field, rid)?;
        Ok(FieldRow {
            rid,
            flags: row.get(0) as u16,
            name: self.string(row.get(1))?,
            signature: self.blob(row.get(2))?,
        })
    }

    pub fn method(&self, rid: u32) -> Result<MethodRow<'a>> {
        let row = self.tables.row(TableId::MethodDef, rid)?;
        Ok(MethodRow {
            rid,
            rva: row.get(0),
            impl_flags: row.get(1) as u16,
            flags: row.get(2) as u16,
            name: self.string(row.get(3))?,
            signature: self.blob(row.get(4))?,
        })
    }

    pub fn param(&self, rid: u32) -> Result<ParamRow<'a>> {
        let row = self.tables.row(TableId::Param, rid)?;
        Ok(ParamRow {
            rid,
            flags: row.get(0) as u16,
            sequence: row.get(1) as u16,
            name: self.string(row.get(2))?,
        })
    }

    pub fn property(&self, rid: u32) -> Result<PropertyRow<'a>> {
        let row = self.tables.row(TableId::Property, rid)?;
        Ok(PropertyRow {
            rid,
            flags: row.get(0) as u16,
            name: self.string(row.get(1))?,
            signature: self.blob(row.get(2))?,
        })
    }

    pub fn event(&self, rid: u32) -> Result<EventRow<'a>> {
        let row = self.tables.row(TableId::Event, rid)?;
        Ok(EventRow {
            rid,
            flags: row.get(0) as u16,
            name: self.string(row.get(1))?,
            event_type: row.coded(2)?,
        })
    }

    pub fn generic_param(&self, rid: u32) -> Result<GenericParamRow<'a>> {
        let row = self.tables.row(TableId::GenericParam, rid)?;
        Ok(GenericParamRow {
            rid,
            number: row.get(0) as u16,
            flags: row.get(1) as u16,
            name: self.string(row.get(3))?,
        })
    }

    pub fn enclosing_type(&self, rid: u32) -> Option<u32> {
        self.indexes.enclosing.get(&rid).copied()
    }

    pub fn method_owner(&self, method: u32) -> Option<u32> {
        self.indexes.method_owner.get(&method).copied()
    }

    pub fn field_owner(&self, field: u32) -> Option<u32> {
        self.indexes.field_owner.get(&field).copied()
    }

    pub fn fields_of(&self, type_rid: u32) -> Result<Vec<u32>> {
        self.member_list(TableId::TypeDef, type_rid, 4, TableId::Field, TableId::FieldPtr)
    }

    pub fn methods_of(&self, type_rid: u32) -> Result<Vec<u32>> {
        self.member_list(TableId::TypeDef, type_rid, 5, TableId::MethodDef, TableId::MethodPtr)
    }

    pub fn params_of(&self, method_rid: u32) -> Result<Vec<u32>> {
        self.member_list(TableId::MethodDef, method_rid, 5, TableId::Param, TableId::ParamPtr)
    }

    pub fn properties_of(&self, type_rid: u32) -> Result<Vec<u32>> {
        self.mapped_list(type_rid, TableId::PropertyMap, TableId::Property, TableId::PropertyPtr)
    }

    pub fn events_of(&self, type_rid: u32) -> Result<Vec<u32>> {
        self.mapped_list(type_rid, TableId::EventMap, TableId::Event, TableId::EventPtr)
    }

    pub fn interfaces_of(&self, type_rid: u32) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        for rid in self.indexes.interfaces.get(&type_rid).into_iter().flatten() {
            let row = self.tables.row(TableId::InterfaceImpl, *rid)?;
            out.extend(row.coded(1)?);
        }
        Ok(out)
    }

    pub fn generic_params_of(&self, owner: Token) -> Result<Vec<GenericParamRow<'a>>> {
        let mut out = Vec::new();
        for rid in self.indexes.generic_params.get(&owner).into_iter().flatten() {
            out.push(self.generic_param(*rid)?);
        }
        out.sort_by_key(|p| p.number);
        Ok(out)
    }

    pub fn generic_constraints_of(&self, param_rid: u32) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        for rid in self.indexes.generic_constraints.get(&param_rid).into_iter().flatten() {
            let row = self.tables.row(TableId::GenericParamConstraint, *rid)?;
            out.extend(row.coded(1)?);
        }
        Ok(out)
    }

    pub fn custom_attributes_of(&self, parent: Token) -> Result<Vec<CustomAttributeRow<'a>>> {
        let mut out = Vec::new();
        for rid in self.indexes.custom_attributes.get(&parent).into_iter().flatten() {
            let row = self.tables.row(TableId::CustomAttribute, *rid)?;
            let constructor = row
                .coded(1)?
                .ok_or(Error::InvalidSignature("custom attribute without constructor"))?;
            out.push(CustomAttributeRow {
                constructor,
                value: self.blob(row.get(2))?,
            });
        }
        Ok(out)
    }

    pub fn constant_of(&self, parent: Token) -> Result<Option<ConstantRow<'a>>> {
        let Some(rid) = self.indexes.constants.get(&parent) else {
            return Ok(None);
        };
        let row = self.tables.row(TableId::Constant, *rid)?;
        Ok(Some(ConstantRow {
            element_type: (row.get(0) & 0xFF) as u8,
            value: self.blob(row.get(2))?,
        }))
    }

    /// `(semantics, method rid)` pairs for a property or event.
    pub fn accessors_of(&self, association: Token) -> &[(u16, u32)] {
        self.indexes
            .semantics
            .get(&association)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// `(packing, class size)` when the type has an explicit layout row.
    pub fn class_layout_of(&self, type_rid: u32) -> Option<(u16, u32)> {
        self.indexes.class_layout.get(&type_rid).copied()
    }

    /// Full name of a type definition; nested types use `Outer/Inner`.
    pub fn type_def_name(&self, rid: u32) -> Result<String> {
        let mut chain = vec![rid];
        let mut current = rid;
        while let Some(outer) = self.enclosing_type(current) {
            if chain.contains(&outer) || chain.len() > 64 {
                return Err(Error::Other("cyclic type nesting"));
            }
            chain.push(outer);
            current = outer;
        }
        let mut name = String::new();
        for (i, rid) in chain.iter().rev().enumerate() {
            let row = self.type_def(*rid)?;
            if i > 0 {
                name.push('/');
            }
            push_qualified(&mut name, row.namespace, row.name);
        }
        Ok(name)
    }

    /// Name of a type reference. With `with_scope`, references resolved
    /// through an assembly reference are prefixed with `[Assembly]`.
    pub fn type_ref_name(&self, rid: u32, with_scope: bool) -> Result<String> {
        self.type_ref_name_at_depth(rid, with_scope, 0)
    }

    fn type_ref_name_at_depth(&self, rid: u32, with_scope: bool, depth: usize) -> Result<String> {
        if depth > 64 {
            return Err(Error::RecursionLimit);
        }
        let row = self.tables.row(TableId::TypeRef, rid)?;
        let name = self.string(row.get(1))?;
        let namespace = self.string(row.get(2))?;
        let mut out = String::new();
        match row.coded(0)? {
            Some(Token {
                table: TableId::TypeRef,
                row: outer,
            }) => {
                out.push_str(&self.type_ref_name_at_depth(outer, with_scope, depth + 1)?);
                out.push('/');
            }
            Some(Token {
                table: TableId::AssemblyRef,
                row: scope,
            }) if with_scope => {
                let assembly = self.tables.row(TableId::AssemblyRef, scope)?;
                let _ = write!(out, "[{}]", self.string(assembly.get(6))?);
            }
            Some(Token {
                table: TableId::ModuleRef,
                row: scope,
            }) if with_scope => {
                let module = self.tables.row(TableId::ModuleRef, scope)?;
                let _ = write!(out, "[.module {}]", self.string(module.get(0))?);
            }
            _ => {}
        }
        push_qualified(&mut out, namespace, name);
        Ok(out)
    }

    /// Renders the constructor of a custom attribute as
    /// `<declaring type>::<name><signature>`.
    pub fn constructor_name(&self, constructor: Token) -> Result<String> {
        match constructor.table {
            TableId::MethodDef => {
                let method = self.method(constructor.row)?;
                let owner = self
                    .method_owner(constructor.row)
                    .ok_or(Error::Other("method without declaring type"))?;
                let sig = signature::decode_method(method.signature)?;
                Ok(format!(
                    "{}::{} {}",
                    self.type_def_name(owner)?,
                    method.name,
                    sig.render(self)?
                ))
            }
            TableId::MemberRef => {
                let row = self.tables.row(TableId::MemberRef, constructor.row)?;
                let parent = row
                    .coded(0)?
                    .ok_or(Error::Other("member reference without parent"))?;
                let name = self.string(row.get(1))?;
                let sig = signature::decode_method(self.blob(row.get(2))?)?;
                Ok(format!(
                    "{}::{} {}",
                    self.member_ref_parent_name(parent)?,
                    name,
                    sig.render(self)?
                ))
            }
            _ => Err(Error::Other("custom attribute constructor is not a method")),
        }
    }

    fn member_ref_parent_name(&self, parent: Token) -> Result<String> {
        match parent.table {
            TableId::TypeDef | TableId::TypeRef | TableId::TypeSpec => self.type_name(parent),
            TableId::ModuleRef => {
                let module = self.tables.row(TableId::ModuleRef, parent.row)?;
                Ok(format!("[.module {}]", self.string(module.get(0))?))
            }
            TableId::MethodDef => {
                let owner = self
                    .method_owner(parent.row)
                    .ok_or(Error::Other("method without declaring type"))?;
                Ok(format!(
                    "{}::{}",
                    self.type_def_name(owner)?,
                    self.method(parent.row)?.name
                ))
            }
            _ => Err(Error::Other("unexpected member reference parent")),
        }
    }

    /// Declaring type of an attribute constructor, without assembly scope.
    fn attribute_type_name(&self, constructor: Token) -> Result<Option<String>> {
        match constructor.table {
            TableId::MethodDef => match self.method_owner(constructor.row) {
                Some(owner) => self.type_def_name(owner).map(Some),
                None => Ok(None),
            },
            TableId::MemberRef => {
                let row = self.tables.row(TableId::MemberRef, constructor.row)?;
                match row.coded(0)? {
                    Some(Token {
                        table: TableId::TypeRef,
                        row,
                    }) => self.type_ref_name(row, false).map(Some),
                    Some(Token {
                        table: TableId::TypeDef,
                        row,
                    }) => self.type_def_name(row).map(Some),
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    /// Assembly names granted access to this assembly's internals.
    ///
    /// The public key part of each declaration is dropped; names are
    /// returned in declaration order without duplicates.
    pub fn internals_visible_to(&self) -> Result<Vec<String>> {
        let mut friends: Vec<String> = Vec::new();
        if self.tables.row_count(TableId::Assembly) == 0 {
            return Ok(friends);
        }
        for attribute in self.custom_attributes_of(Token::new(TableId::Assembly, 1))? {
            if self.attribute_type_name(attribute.constructor)?.as_deref()
                != Some(INTERNALS_VISIBLE_TO)
            {
                continue;
            }
            let Some(value) = read_first_string_argument(attribute.value)? else {
                continue;
            };
            let name = value.split(',').next().unwrap_or_default().trim();
            if !name.is_empty() && !friends.iter().any(|f| f == name) {
                friends.push(name.to_string());
            }
        }
        Ok(friends)
    }

    fn member_list(
        &self,
        owner: TableId,
        owner_rid: u32,
        column: usize,
        target: TableId,
        indirection: TableId,
    ) -> Result<Vec<u32>> {
        let start = self.tables.row(owner, owner_rid)?.get(column);
        let next = if owner_rid < self.tables.row_count(owner) {
            Some(self.tables.row(owner, owner_rid + 1)?.get(column))
        } else {
            None
        };
        self.resolve_list(start, next, target, indirection)
    }

    fn mapped_list(
        &self,
        type_rid: u32,
        map: TableId,
        target: TableId,
        indirection: TableId,
    ) -> Result<Vec<u32>> {
        let count = self.tables.row_count(map);
        for map_rid in 1..=count {
            let row = self.tables.row(map, map_rid)?;
            if row.get(0) != type_rid {
                continue;
            }
            let start = row.get(1);
            let next = if map_rid < count {
                Some(self.tables.row(map, map_rid + 1)?.get(1))
            } else {
                None
            };
            return self.resolve_list(start, next, target, indirection);
        }
        Ok(Vec::new())
    }

    /// Resolves a `[start, next)` run of a list column, following the
    /// `*Ptr` table when one is present.
    fn resolve_list(
        &self,
        start: u32,
        next: Option<u32>,
        target: TableId,
        indirection: TableId,
    ) -> Result<Vec<u32>> {
        let indirect = self.tables.row_count(indirection) > 0;
        let len = if indirect {
            self.tables.row_count(indirection)
        } else {
            self.tables.row_count(target)
        };
        let start = start.max(1);
        let end = next.unwrap_or(len + 1).min(len + 1);
        let mut out = Vec::new();
        for index in start..end {
            if indirect {
                out.push(self.tables.row(indirection, index)?.get(0));
            } else {
                out.push(index);
            }
        }
        Ok(out)
    }

    fn build_indexes(&self) -> Result<Indexes> {
        let mut indexes = Indexes::default();
        let tables = &self.tables;

        for row in tables.rows(TableId::NestedClass) {
            let row = row?;
            indexes.enclosing.insert(row.get(0), row.get(1));
        }
        for type_rid in 1..=tables.row_count(TableId::TypeDef) {
            for method in self.methods_of(type_rid)? {
                indexes.method_owner.insert(method, type_rid);
            }
            for field in self.fields_of(type_rid)? {
                indexes.field_owner.insert(field, type_rid);
            }
        }
        for (rid, row) in (1..).zip(tables.rows(TableId::CustomAttribute)) {
            if let Some(parent) = row?.coded(0)? {
                indexes.custom_attributes.entry(parent).or_default().push(rid);
            }
        }
        for (rid, row) in (1..).zip(tables.rows(TableId::Constant)) {
            if let Some(parent) = row?.coded(1)? {
                indexes.constants.insert(parent, rid);
            }
        }
        for (rid, row) in (1..).zip(tables.rows(TableId::InterfaceImpl)) {
            indexes.interfaces.entry(row?.get(0)).or_default().push(rid);
        }
        for (rid, row) in (1..).zip(tables.rows(TableId::GenericParam)) {
            if let Some(owner) = row?.coded(2)? {
                indexes.generic_params.entry(owner).or_default().push(rid);
            }
        }
        for (rid, row) in (1..).zip(tables.rows(TableId::GenericParamConstraint)) {
            indexes
                .generic_constraints
                .entry(row?.get(0))
                .or_default()
                .push(rid);
        }
        for row in tables.rows(TableId::MethodSemantics) {
            let row = row?;
            if let Some(association) = row.coded(2)? {
                indexes
                    .semantics
                    .entry(association)
                    .or_default()
                    .push((row.get(0) as u16, row.get(1)));
            }
        }
        for row in tables.rows(TableId::ClassLayout) {
            let row = row?;
            indexes
                .class_layout
                .insert(row.get(2), (row.get(0) as u16, row.get(1)));
        }
        Ok(indexes)
    }
}

impl TypeNames for Metadata<'_> {
    fn type_name(&self, token: Token) -> Result<String> {
        self.type_name_at_depth(token, 0)
    }
}

impl Metadata<'_> {
    /// A `TypeSpec` blob may name further type specs, including itself.
    /// `depth` counts the specs currently being rendered.
    fn type_name_at_depth(&self, token: Token, depth: usize) -> Result<String> {
        match token.table {
            TableId::TypeDef => self.type_def_name(token.row),
            TableId::TypeRef => self.type_ref_name(token.row, true),
            TableId::TypeSpec => {
                if depth >= MAX_TYPE_SPEC_DEPTH {
                    return Err(Error::RecursionLimit);
                }
                let row = self.tables.row(TableId::TypeSpec, token.row)?;
                let nested = NestedSpecNames {
                    metadata: self,
                    depth: depth + 1,
                };
                signature::decode_type_spec(self.blob(row.get(0))?)?.render(&nested)
            }
            _ => Err(Error::InvalidSignature("token is not a type")),
        }
    }
}

const MAX_TYPE_SPEC_DEPTH: usize = 64;

struct NestedSpecNames<'m, 'a> {
    metadata: &'m Metadata<'a>,
    depth: usize,
}

impl TypeNames for NestedSpecNames<'_, '_> {
    fn type_name(&self, token: Token) -> Result<String> {
        self.metadata.type_name_at_depth(token, self.depth)
    }
}

impl<'a> Metadata<'a> {
    pub fn method_signature(&self, method: &MethodRow<'a>) -> Result<MethodSig> {
        signature::decode_method(method.signature)
    }
}

fn push_qualified(out: &mut String, namespace: &str, name: &str) {
    if !namespace.is_empty() {
        out.push_str(namespace);
        out.push('.');
    }
    out.push_str(name);
}

/// Reads the first fixed argument of a custom attribute blob as a
/// `SerString` (II.23.3). `None` for a null string.
fn read_first_string_argument(value: &[u8]) -> Result<Option<String>> {
    let mut reader = Reader::new(value);
    if reader.read_u2()? != 0x0001 {
        return Err(Error::InvalidSignature("custom attribute prolog"));
    }
    if reader.peek_u1()? == 0xFF {
        return Ok(None);
    }
    let len = reader.read_compressed_u32()?;
    let bytes = reader.read_bytes(len as usize)?;
    std::str::from_utf8(bytes)
        .map(|s| Some(s.to_string()))
        .map_err(|_| Error::InvalidUtf8)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_string_argument() {
        let mut blob = vec![0x01, 0x00, 0x05];
        blob.extend_from_slice(b"Other");
        blob.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(
            read_first_string_argument(&blob).unwrap().as_deref(),
            Some("Other")
        );
        assert_eq!(read_first_string_argument(&[0x01, 0x00, 0xFF]).unwrap(), None);
        assert!(read_first_string_argument(&[0x02, 0x00, 0x00]).is_err());
    }

    #[test]
    fn hex_is_lowercase() {
        assert_eq!(hex(&[0x00, 0xAB, 0x7f]), "00ab7f");
    }
}
