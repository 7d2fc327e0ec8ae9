//! A writer for small but well-formed managed assemblies.
//!
//! The images carry real PE headers, a CLI header, IL method bodies and the
//! ECMA-335 tables needed to describe classes, structs, interfaces, nested
//! types, fields (with constants), methods, parameters, properties and
//! `InternalsVisibleTo` declarations. Every index fits in two bytes, which
//! keeps the table layout simple; that caps an image at 64K rows per table.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

const SECTION_RVA: u32 = 0x2000;
const FILE_ALIGNMENT: u32 = 0x200;
const PE_OFFSET: usize = 0x80;
const CLI_HEADER_SIZE: u32 = 72;

const TABLE_MODULE: u8 = 0x00;
const TABLE_TYPE_REF: u8 = 0x01;
const TABLE_TYPE_DEF: u8 = 0x02;
const TABLE_FIELD: u8 = 0x04;
const TABLE_METHOD_DEF: u8 = 0x06;
const TABLE_PARAM: u8 = 0x08;
const TABLE_MEMBER_REF: u8 = 0x0A;
const TABLE_CONSTANT: u8 = 0x0B;
const TABLE_CUSTOM_ATTRIBUTE: u8 = 0x0C;
const TABLE_PROPERTY_MAP: u8 = 0x15;
const TABLE_PROPERTY: u8 = 0x17;
const TABLE_METHOD_SEMANTICS: u8 = 0x18;
const TABLE_TYPE_SPEC: u8 = 0x1B;
const TABLE_ASSEMBLY: u8 = 0x20;
const TABLE_ASSEMBLY_REF: u8 = 0x23;
const TABLE_NESTED_CLASS: u8 = 0x29;

const TYPE_REF_OBJECT: u32 = 1;
const TYPE_REF_VALUE_TYPE: u32 = 2;
const TYPE_REF_IVT: u32 = 3;

/// Member accessibility, in C# terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Private,
    PrivateProtected,
    Internal,
    Protected,
    ProtectedInternal,
    Public,
}

impl Access {
    fn flags(self) -> u16 {
        match self {
            Access::Private => 1,
            Access::PrivateProtected => 2,
            Access::Internal => 3,
            Access::Protected => 4,
            Access::ProtectedInternal => 5,
            Access::Public => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeVisibility {
    Public,
    Internal,
    /// Only meaningful for nested types.
    Protected,
    /// Only meaningful for nested types.
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Class,
    Struct,
    Interface,
}

/// Types usable in field, method and property signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigType {
    Void,
    Bool,
    Int32,
    Int64,
    String,
    Object,
    Array(Box<SigType>),
    /// A type defined in the same image, by simple name.
    Named(String),
    /// A class type given by a row of the image's `TypeSpec` table.
    Spec(u32),
}

impl SigType {
    pub fn array(element: SigType) -> Self {
        SigType::Array(Box::new(element))
    }

    pub fn named(name: impl Into<String>) -> Self {
        SigType::Named(name.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    name: String,
    access: Access,
    is_static: bool,
    ty: SigType,
    constant: Option<i32>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, access: Access, ty: SigType) -> Self {
        Self {
            name: name.into(),
            access,
            is_static: false,
            ty,
            constant: None,
        }
    }

    pub fn as_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// A `const int` field: static, literal, with a Constant row.
    pub fn constant(mut self, value: i32) -> Self {
        self.is_static = true;
        self.ty = SigType::Int32;
        self.constant = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDefinition {
    name: String,
    access: Access,
    is_static: bool,
    returns: SigType,
    params: Vec<(String, SigType)>,
    body: Vec<u8>,
}

impl MethodDefinition {
    /// An instance method returning `void` whose body is a single `ret`.
    pub fn new(name: impl Into<String>, access: Access) -> Self {
        Self {
            name: name.into(),
            access,
            is_static: false,
            returns: SigType::Void,
            params: Vec::new(),
            body: vec![0x2A],
        }
    }

    pub fn as_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn returns(mut self, ty: SigType) -> Self {
        self.returns = ty;
        self
    }

    pub fn param(mut self, name: impl Into<String>, ty: SigType) -> Self {
        self.params.push((name.into(), ty));
        self
    }

    /// Raw IL for the method body.
    pub fn body(mut self, il: impl Into<Vec<u8>>) -> Self {
        self.body = il.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDefinition {
    name: String,
    ty: SigType,
    getter: String,
}

impl PropertyDefinition {
    /// A read-only instance property backed by the method named `getter`
    /// on the same type.
    pub fn new(name: impl Into<String>, ty: SigType, getter: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty,
            getter: getter.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefinition {
    namespace: String,
    name: String,
    kind: TypeKind,
    visibility: TypeVisibility,
    enclosing: Option<String>,
    fields: Vec<FieldDefinition>,
    methods: Vec<MethodDefinition>,
    properties: Vec<PropertyDefinition>,
}

impl TypeDefinition {
    fn new(namespace: &str, name: &str, kind: TypeKind) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind,
            visibility: TypeVisibility::Public,
            enclosing: None,
            fields: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn class(namespace: &str, name: &str) -> Self {
        Self::new(namespace, name, TypeKind::Class)
    }

    pub fn structure(namespace: &str, name: &str) -> Self {
        Self::new(namespace, name, TypeKind::Struct)
    }

    pub fn interface(namespace: &str, name: &str) -> Self {
        Self::new(namespace, name, TypeKind::Interface)
    }

    pub fn visibility(mut self, visibility: TypeVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Nests this type inside the type with simple name `outer`.
    pub fn nested_in(mut self, outer: &str) -> Self {
        self.namespace.clear();
        self.enclosing = Some(outer.to_string());
        self
    }

    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    pub fn method(mut self, method: MethodDefinition) -> Self {
        self.methods.push(method);
        self
    }

    pub fn property(mut self, property: PropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }

    fn flags(&self) -> u32 {
        let nested = self.enclosing.is_some();
        let visibility = match (self.visibility, nested) {
            (TypeVisibility::Public, false) => 0x1,
            (TypeVisibility::Public, true) => 0x2,
            (TypeVisibility::Internal, true) => 0x5,
            (TypeVisibility::Protected, true) => 0x4,
            (TypeVisibility::Private, true) => 0x3,
            (_, false) => 0x0,
        };
        let kind = match self.kind {
            // BeforeFieldInit
            TypeKind::Class => 0x0010_0000,
            // SequentialLayout | Sealed | BeforeFieldInit
            TypeKind::Struct => 0x0010_0108,
            // Interface | Abstract
            TypeKind::Interface => 0x0000_00A0,
        };
        visibility | kind
    }
}

/// Builder for a managed assembly image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyImage {
    name: String,
    version: [u16; 4],
    friends: Vec<String>,
    types: Vec<TypeDefinition>,
    type_specs: Vec<Vec<u8>>,
}

impl AssemblyImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: [1, 0, 0, 0],
            friends: Vec::new(),
            types: Vec::new(),
            type_specs: Vec::new(),
        }
    }

    pub fn version(mut self, version: [u16; 4]) -> Self {
        self.version = version;
        self
    }

    /// Adds an `[assembly: InternalsVisibleTo(value)]` declaration. `value`
    /// is written verbatim, so it may carry a `, PublicKey=...` suffix.
    pub fn internals_visible_to(mut self, value: impl Into<String>) -> Self {
        self.friends.push(value.into());
        self
    }

    /// Appends a `TypeSpec` row holding `blob` verbatim. Rows are numbered
    /// from 1 in the order they are added.
    pub fn type_spec(mut self, blob: impl Into<Vec<u8>>) -> Self {
        self.type_specs.push(blob.into());
        self
    }

    pub fn with_type(mut self, ty: TypeDefinition) -> Self {
        self.types.push(ty);
        self
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut text = vec![0u8; CLI_HEADER_SIZE as usize];

        // Method bodies follow the CLI header.
        let mut body_rvas = Vec::new();
        for ty in &self.types {
            for method in &ty.methods {
                if ty.kind == TypeKind::Interface {
                    body_rvas.push(0);
                    continue;
                }
                align(&mut text, 4);
                body_rvas.push(SECTION_RVA + text.len() as u32);
                write_body(&mut text, &method.body);
            }
        }

        align(&mut text, 4);
        let metadata_rva = SECTION_RVA + text.len() as u32;
        let metadata = self.metadata(&body_rvas);
        let metadata_size = metadata.len() as u32;
        text.extend_from_slice(&metadata);

        // CLI header.
        put_u32(&mut text, 0, CLI_HEADER_SIZE);
        put_u16(&mut text, 4, 2);
        put_u16(&mut text, 6, 5);
        put_u32(&mut text, 8, metadata_rva);
        put_u32(&mut text, 12, metadata_size);
        // COMIMAGE_FLAGS_ILONLY
        put_u32(&mut text, 16, 1);

        let virtual_size = text.len() as u32;
        align(&mut text, FILE_ALIGNMENT as usize);
        self.pe_file(&text, virtual_size)
    }

    fn pe_file(&self, text: &[u8], virtual_size: u32) -> Vec<u8> {
        let mut file = vec![0u8; FILE_ALIGNMENT as usize];
        file[0] = b'M';
        file[1] = b'Z';
        put_u32(&mut file, 0x3C, PE_OFFSET as u32);

        let coff = PE_OFFSET + 4;
        file[PE_OFFSET..coff].copy_from_slice(b"PE\0\0");
        put_u16(&mut file, coff, 0x014C);
        put_u16(&mut file, coff + 2, 1);
        put_u16(&mut file, coff + 16, 0xE0);
        // EXECUTABLE_IMAGE | 32BIT_MACHINE | DLL
        put_u16(&mut file, coff + 18, 0x2102);

        let optional = coff + 20;
        let image_size = SECTION_RVA + round_up(virtual_size, 0x2000);
        put_u16(&mut file, optional, 0x010B);
        put_u32(&mut file, optional + 4, text.len() as u32);
        put_u32(&mut file, optional + 20, SECTION_RVA);
        put_u32(&mut file, optional + 28, 0x1000_0000);
        put_u32(&mut file, optional + 32, 0x2000);
        put_u32(&mut file, optional + 36, FILE_ALIGNMENT);
        put_u16(&mut file, optional + 40, 4);
        put_u16(&mut file, optional + 48, 4);
        put_u32(&mut file, optional + 56, image_size);
        put_u32(&mut file, optional + 60, FILE_ALIGNMENT);
        // IMAGE_SUBSYSTEM_WINDOWS_CUI
        put_u16(&mut file, optional + 68, 3);
        put_u32(&mut file, optional + 92, 16);
        let cli_directory = optional + 96 + 14 * 8;
        put_u32(&mut file, cli_directory, SECTION_RVA);
        put_u32(&mut file, cli_directory + 4, CLI_HEADER_SIZE);

        let section = optional + 0xE0;
        file[section..section + 5].copy_from_slice(b".text");
        put_u32(&mut file, section + 8, virtual_size);
        put_u32(&mut file, section + 12, SECTION_RVA);
        put_u32(&mut file, section + 16, text.len() as u32);
        put_u32(&mut file, section + 20, FILE_ALIGNMENT);
        // CODE | EXECUTE | READ
        put_u32(&mut file, section + 36, 0x6000_0020);

        file.extend_from_slice(text);
        file
    }

    fn type_rid(&self, name: &str) -> u32 {
        let index = self
            .types
            .iter()
            .position(|t| t.name == name)
            .unwrap_or_else(|| panic!("unknown type `{name}` in signature"));
        index as u32 + 2
    }

    fn encode_type(&self, ty: &SigType, out: &mut Vec<u8>) {
        match ty {
            SigType::Void => out.push(0x01),
            SigType::Bool => out.push(0x02),
            SigType::Int32 => out.push(0x08),
            SigType::Int64 => out.push(0x0A),
            SigType::String => out.push(0x0E),
            SigType::Object => out.push(0x1C),
            SigType::Array(element) => {
                out.push(0x1D);
                self.encode_type(element, out);
            }
            SigType::Named(name) => {
                let rid = self.type_rid(name);
                let is_struct = self.types[rid as usize - 2].kind == TypeKind::Struct;
                out.push(if is_struct { 0x11 } else { 0x12 });
                compress(rid << 2, out);
            }
            SigType::Spec(rid) => {
                out.push(0x12);
                compress((rid << 2) | 2, out);
            }
        }
    }

    fn metadata(&self, body_rvas: &[u32]) -> Vec<u8> {
        let mut heaps = Heaps::new();
        let mut tables: Vec<(u8, u32, Vec<u8>)> = Vec::new();
        let mut push_table = |id: u8, rows: u32, data: Vec<u8>| {
            if rows > 0 {
                tables.push((id, rows, data));
            }
        };

        let mvid = self.mvid();
        let mvid_index = heaps.guid(mvid);
        let module_name = heaps.string(&format!("{}.dll", self.name));
        let mut module = Vec::new();
        row(&mut module, &[0, module_name, mvid_index, 0, 0]);
        push_table(TABLE_MODULE, 1, module);

        // TypeRefs resolved through the System.Runtime assembly reference.
        let scope = (1 << 2) | 2;
        let mut type_refs = Vec::new();
        for (namespace, name) in [
            ("System", "Object"),
            ("System", "ValueType"),
            ("System.Runtime.CompilerServices", "InternalsVisibleToAttribute"),
        ] {
            let name = heaps.string(name);
            let namespace = heaps.string(namespace);
            row(&mut type_refs, &[scope, name, namespace]);
        }
        push_table(TABLE_TYPE_REF, 3, type_refs);

        let mut type_defs = Vec::new();
        let module_type = heaps.string("<Module>");
        row(&mut type_defs, &[0, 0, module_type, 0, 0, 1, 1]);
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        let mut params = Vec::new();
        let mut constants: Vec<(u32, Vec<u8>)> = Vec::new();
        let mut property_maps = Vec::new();
        let mut properties = Vec::new();
        let mut semantics: Vec<(u32, Vec<u8>)> = Vec::new();
        let mut nested = Vec::new();
        let (mut field_rid, mut method_rid) = (1u32, 1u32);
        let (mut param_rid, mut property_rid) = (1u32, 1u32);
        let mut bodies = body_rvas.iter();

        for (index, ty) in self.types.iter().enumerate() {
            let type_rid = index as u32 + 2;
            let extends = match ty.kind {
                TypeKind::Class => (TYPE_REF_OBJECT << 2) | 1,
                TypeKind::Struct => (TYPE_REF_VALUE_TYPE << 2) | 1,
                TypeKind::Interface => 0,
            };
            let flags = ty.flags();
            let name = heaps.string(&ty.name);
            let namespace = heaps.string(&ty.namespace);
            row(
                &mut type_defs,
                &[flags & 0xFFFF, flags >> 16, name, namespace, extends, field_rid, method_rid],
            );

            for field in &ty.fields {
                let mut flags = field.access.flags();
                if field.is_static {
                    flags |= 0x0010;
                }
                if field.constant.is_some() {
                    // Literal | HasDefault
                    flags |= 0x0040 | 0x8000;
                }
                let mut sig = vec![0x06];
                self.encode_type(&field.ty, &mut sig);
                let name = heaps.string(&field.name);
                let sig = heaps.blob(&sig);
                row(&mut fields, &[u32::from(flags), name, sig]);
                if let Some(value) = field.constant {
                    let value = heaps.blob(&value.to_le_bytes());
                    let mut constant = Vec::new();
                    row(&mut constant, &[0x08, field_rid << 2, value]);
                    constants.push((field_rid << 2, constant));
                }
                field_rid += 1;
            }

            let first_method = method_rid;
            for method in &ty.methods {
                let rva = bodies.next().copied().unwrap_or(0);
                let mut flags = method.access.flags() | 0x0080;
                if method.is_static {
                    flags |= 0x0010;
                }
                if ty.kind == TypeKind::Interface {
                    // Virtual | NewSlot | Abstract
                    flags |= 0x0040 | 0x0100 | 0x0400;
                }
                let mut sig = vec![if method.is_static { 0x00 } else { 0x20 }];
                compress(method.params.len() as u32, &mut sig);
                self.encode_type(&method.returns, &mut sig);
                for (_, ty) in &method.params {
                    self.encode_type(ty, &mut sig);
                }
                let name = heaps.string(&method.name);
                let sig = heaps.blob(&sig);
                let rva_lo = rva & 0xFFFF;
                let rva_hi = rva >> 16;
                row(
                    &mut methods,
                    &[rva_lo, rva_hi, 0, u32::from(flags), name, sig, param_rid],
                );
                for (sequence, (name, _)) in method.params.iter().enumerate() {
                    let name = heaps.string(name);
                    row(&mut params, &[0, sequence as u32 + 1, name]);
                    param_rid += 1;
                }
                method_rid += 1;
            }

            if !ty.properties.is_empty() {
                row(&mut property_maps, &[type_rid, property_rid]);
            }
            for property in &ty.properties {
                let mut sig = vec![0x28, 0x00];
                self.encode_type(&property.ty, &mut sig);
                let name = heaps.string(&property.name);
                let sig = heaps.blob(&sig);
                row(&mut properties, &[0, name, sig]);
                let getter = ty
                    .methods
                    .iter()
                    .position(|m| m.name == property.getter)
                    .unwrap_or_else(|| panic!("unknown getter `{}`", property.getter));
                let association = (property_rid << 1) | 1;
                let mut semantic = Vec::new();
                row(
                    &mut semantic,
                    &[0x0002, first_method + getter as u32, association],
                );
                semantics.push((association, semantic));
                property_rid += 1;
            }

            if let Some(outer) = &ty.enclosing {
                row(&mut nested, &[type_rid, self.type_rid(outer)]);
            }
        }

        let type_count = self.types.len() as u32 + 1;
        push_table(TABLE_TYPE_DEF, type_count, type_defs);
        push_table(TABLE_FIELD, field_rid - 1, fields);
        push_table(TABLE_METHOD_DEF, method_rid - 1, methods);
        push_table(TABLE_PARAM, param_rid - 1, params);

        if !self.friends.is_empty() {
            let mut member_refs = Vec::new();
            let ctor = heaps.string(".ctor");
            let sig = heaps.blob(&[0x20, 0x01, 0x01, 0x0E]);
            row(&mut member_refs, &[(TYPE_REF_IVT << 3) | 1, ctor, sig]);
            push_table(TABLE_MEMBER_REF, 1, member_refs);
        }

        constants.sort_by_key(|(parent, _)| *parent);
        let constant_count = constants.len() as u32;
        push_table(
            TABLE_CONSTANT,
            constant_count,
            constants.into_iter().flat_map(|(_, row)| row).collect(),
        );

        let mut attributes = Vec::new();
        for friend in &self.friends {
            let mut value = vec![0x01, 0x00];
            compress(friend.len() as u32, &mut value);
            value.extend_from_slice(friend.as_bytes());
            value.extend_from_slice(&[0x00, 0x00]);
            let value = heaps.blob(&value);
            // Parent: Assembly row 1; constructor: MemberRef row 1.
            row(&mut attributes, &[(1 << 5) | 14, (1 << 3) | 3, value]);
        }
        push_table(TABLE_CUSTOM_ATTRIBUTE, self.friends.len() as u32, attributes);

        let property_map_count = (property_maps.len() / 4) as u32;
        push_table(TABLE_PROPERTY_MAP, property_map_count, property_maps);
        push_table(TABLE_PROPERTY, property_rid - 1, properties);
        semantics.sort_by_key(|(association, _)| *association);
        let semantics_count = semantics.len() as u32;
        push_table(
            TABLE_METHOD_SEMANTICS,
            semantics_count,
            semantics.into_iter().flat_map(|(_, row)| row).collect(),
        );

        let mut assembly = Vec::new();
        let name = heaps.string(&self.name);
        let [major, minor, build, revision] = self.version.map(u32::from);
        // HashAlgId is a 4-byte column; split into two 2-byte cells.
        row(
            &mut assembly,
            &[0x8004, 0, major, minor, build, revision, 0, 0, 0, name, 0],
        );
        push_table(TABLE_ASSEMBLY, 1, assembly);

        let mut assembly_refs = Vec::new();
        let runtime = heaps.string("System.Runtime");
        row(&mut assembly_refs, &[8, 0, 0, 0, 0, 0, 0, runtime, 0, 0]);
        push_table(TABLE_ASSEMBLY_REF, 1, assembly_refs);

        let mut type_specs = Vec::new();
        for blob in &self.type_specs {
            row(&mut type_specs, &[heaps.blob(blob)]);
        }
        push_table(TABLE_TYPE_SPEC, self.type_specs.len() as u32, type_specs);

        let nested_count = (nested.len() / 4) as u32;
        push_table(TABLE_NESTED_CLASS, nested_count, nested);

        let table_stream = table_stream(&tables);
        metadata_root(&[
            ("#~", table_stream),
            ("#Strings", heaps.strings),
            ("#US", vec![0]),
            ("#GUID", heaps.guids),
            ("#Blob", heaps.blobs),
        ])
    }

    /// A module id derived from the whole image, so that images differing
    /// only in method bodies still get different MVIDs, as a compiler would.
    fn mvid(&self) -> [u8; 16] {
        let low = fnv1a(0xCBF2_9CE4_8422_2325, format!("{self:?}").as_bytes());
        let high = fnv1a(low, b"mvid");
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&low.to_le_bytes());
        out[8..].copy_from_slice(&high.to_le_bytes());
        out
    }
}

fn fnv1a(mut state: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        state ^= u64::from(*byte);
        state = state.wrapping_mul(0x0000_0100_0000_01B3);
    }
    state
}

struct Heaps {
    strings: Vec<u8>,
    string_offsets: HashMap<String, u32>,
    blobs: Vec<u8>,
    guids: Vec<u8>,
}

impl Heaps {
    fn new() -> Self {
        Self {
            strings: vec![0],
            string_offsets: HashMap::new(),
            blobs: vec![0],
            guids: Vec::new(),
        }
    }

    fn string(&mut self, value: &str) -> u32 {
        if value.is_empty() {
            return 0;
        }
        if let Some(offset) = self.string_offsets.get(value) {
            return *offset;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(value.as_bytes());
        self.strings.push(0);
        self.string_offsets.insert(value.to_string(), offset);
        offset
    }

    fn blob(&mut self, value: &[u8]) -> u32 {
        let offset = self.blobs.len() as u32;
        compress(value.len() as u32, &mut self.blobs);
        self.blobs.extend_from_slice(value);
        offset
    }

    fn guid(&mut self, value: [u8; 16]) -> u32 {
        self.guids.extend_from_slice(&value);
        (self.guids.len() / 16) as u32
    }
}

/// Appends one table row made of 2-byte cells.
fn row(out: &mut Vec<u8>, cells: &[u32]) {
    for cell in cells {
        let cell = u16::try_from(*cell).expect("table cell exceeds two bytes");
        out.extend_from_slice(&cell.to_le_bytes());
    }
}

fn table_stream(tables: &[(u8, u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0u32.to_le_bytes());
    out.push(2);
    out.push(0);
    // HeapSizes: every heap index is two bytes.
    out.push(0);
    out.push(1);
    let valid = tables.iter().fold(0u64, |mask, (id, _, _)| mask | (1 << id));
    out.extend_from_slice(&valid.to_le_bytes());
    out.extend_from_slice(&0x0000_1600_3301_FA00u64.to_le_bytes());
    let mut sorted = tables.to_vec();
    sorted.sort_by_key(|(id, _, _)| *id);
    for (_, rows, _) in &sorted {
        out.extend_from_slice(&rows.to_le_bytes());
    }
    for (_, _, data) in &sorted {
        out.extend_from_slice(data);
    }
    align(&mut out, 4);
    out
}

fn metadata_root(streams: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let version = b"v4.0.30319\0\0";
    let mut header = Vec::new();
    header.extend_from_slice(&0x424A_5342u32.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(&(version.len() as u32).to_le_bytes());
    header.extend_from_slice(version);
    header.extend_from_slice(&0u16.to_le_bytes());
    header.extend_from_slice(&(streams.len() as u16).to_le_bytes());

    let headers_len: usize = streams
        .iter()
        .map(|(name, _)| 8 + round_up(name.len() as u32 + 1, 4) as usize)
        .sum();
    let mut offset = header.len() + headers_len;
    let mut data = Vec::new();
    for (name, bytes) in streams {
        let mut bytes = bytes.clone();
        align(&mut bytes, 4);
        header.extend_from_slice(&(offset as u32).to_le_bytes());
        header.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        header.extend_from_slice(name.as_bytes());
        header.push(0);
        align(&mut header, 4);
        offset += bytes.len();
        data.extend_from_slice(&bytes);
    }
    header.extend_from_slice(&data);
    header
}

fn write_body(out: &mut Vec<u8>, il: &[u8]) {
    if il.len() < 64 {
        out.push(((il.len() as u8) << 2) | 0x2);
    } else {
        // Fat header: flags 0x3003 (size 3 dwords), max stack 8.
        out.extend_from_slice(&0x3003u16.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(&(il.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
    }
    out.extend_from_slice(il);
}

fn compress(value: u32, out: &mut Vec<u8>) {
    match value {
        0..=0x7F => out.push(value as u8),
        0x80..=0x3FFF => out.extend_from_slice(&((value as u16) | 0x8000).to_be_bytes()),
        _ => out.extend_from_slice(&(value | 0xC000_0000).to_be_bytes()),
    }
}

fn align(out: &mut Vec<u8>, alignment: usize) {
    while out.len() % alignment != 0 {
        out.push(0);
    }
}

fn round_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

fn put_u16(out: &mut [u8], offset: usize, value: u16) {
    out[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut [u8], offset: usize, value: u32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
