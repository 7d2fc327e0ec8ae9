//! Canonical text rendering of an assembly's compile-time surface.
//!
//! Every line is self-describing (it starts with the full name of the type it
//! belongs to) and the set is sorted, so neither table order nor row indexes
//! affect the result. Method bodies, RVAs, implementation flags, the MVID,
//! and members a consumer cannot see are left out.

use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::metadata::{hex, Metadata, TypeDefRow};
use crate::signature::{self, TypeNames};
use crate::tables::{TableId, Token};

const TYPE_VISIBILITY_MASK: u32 = 0x07;
const TYPE_FLAGS_MASK: u32 = 0x05BF;
const FIELD_FLAGS_MASK: u16 = 0x0007 | 0x0010 | 0x0020 | 0x0040;
const FIELD_STATIC: u16 = 0x0010;
const METHOD_FLAGS_MASK: u16 = 0x0DF7;
const PARAM_FLAGS_MASK: u16 = 0x0001 | 0x0002 | 0x0010 | 0x1000;
const PROPERTY_FLAGS_MASK: u16 = 0x1600;
const EVENT_FLAGS_MASK: u16 = 0x0600;
const MEMBER_ACCESS_MASK: u16 = 0x07;

/// Which consumers the surface is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Any other assembly: public, protected and protected-internal members.
    Public,
    /// A friend assembly: additionally internal and private-protected members.
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Access {
    Hidden,
    Internal,
    Public,
}

impl Visibility {
    fn admits(self, access: Access) -> bool {
        match self {
            Visibility::Public => access == Access::Public,
            Visibility::Internal => access >= Access::Internal,
        }
    }
}

fn type_access(flags: u32) -> Access {
    match flags & TYPE_VISIBILITY_MASK {
        // Public, NestedPublic, NestedFamily, NestedFamORAssem.
        1 | 2 | 4 | 7 => Access::Public,
        // NotPublic, NestedAssembly, NestedFamANDAssem.
        0 | 5 | 6 => Access::Internal,
        _ => Access::Hidden,
    }
}

fn member_access(flags: u16) -> Access {
    match flags & MEMBER_ACCESS_MASK {
        // Public, Family, FamORAssem.
        6 | 4 | 5 => Access::Public,
        // Assembly, FamANDAssem.
        3 | 2 => Access::Internal,
        _ => Access::Hidden,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiSurface {
    lines: Vec<String>,
}

impl ApiSurface {
    pub fn build(metadata: &Metadata<'_>, visibility: Visibility) -> Result<Self> {
        let mut builder = SurfaceBuilder {
            metadata,
            visibility,
            lines: Vec::new(),
        };
        builder.assembly()?;
        for rid in 1..=metadata.type_def_count() {
            builder.type_def(rid)?;
        }
        let mut lines = builder.lines;
        lines.sort();
        lines.dedup();
        Ok(Self { lines })
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Newline-terminated lines, the form that gets hashed.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
        out
    }
}

struct SurfaceBuilder<'m, 'a> {
    metadata: &'m Metadata<'a>,
    visibility: Visibility,
    lines: Vec<String>,
}

impl SurfaceBuilder<'_, '_> {
    fn assembly(&mut self) -> Result<()> {
        if let Some(identity) = self.metadata.assembly()? {
            self.lines.push(format!(
                "assembly {} version={} culture={} publickey={}",
                identity.name,
                identity.version_string(),
                identity.culture,
                hex(&identity.public_key)
            ));
        }
        Ok(())
    }

    /// Access of a type combined with every type enclosing it.
    fn effective_access(&self, rid: u32) -> Result<Access> {
        let mut access = Access::Public;
        let mut current = rid;
        let mut depth = 0;
        loop {
            access = access.min(type_access(self.metadata.type_def(current)?.flags));
            match self.metadata.enclosing_type(current) {
                Some(outer) if depth < 64 => {
                    current = outer;
                    depth += 1;
                }
                Some(_) => return Err(Error::Other("cyclic type nesting")),
                None => return Ok(access),
            }
        }
    }

    fn base_name(&self, token: Token) -> Result<String> {
        match token.table {
            TableId::TypeRef => self.metadata.type_ref_name(token.row, false),
            _ => self.metadata.type_name(token),
        }
    }

    fn is_value_type(&self, ty: &TypeDefRow<'_>, full_name: &str) -> Result<bool> {
        let Some(base) = ty.extends else {
            return Ok(false);
        };
        if base.table == TableId::TypeSpec {
            return Ok(false);
        }
        let base = self.base_name(base)?;
        Ok((base == "System.ValueType" && full_name != "System.Enum") || base == "System.Enum")
    }

    fn type_def(&mut self, rid: u32) -> Result<()> {
        let md = self.metadata;
        let ty = md.type_def(rid)?;
        if ty.name == "<Module>" && ty.namespace.is_empty() {
            return Ok(());
        }
        // Compiler-generated types cannot be named from source.
        if ty.name.starts_with('<') {
            return Ok(());
        }
        if !self.visibility.admits(self.effective_access(rid)?) {
            return Ok(());
        }

        let name = md.type_def_name(rid)?;
        let extends = match ty.extends {
            Some(base) => md.type_name(base)?,
            None => "-".to_string(),
        };
        self.lines.push(format!(
            "type {name} flags={:#x} extends={extends}",
            ty.flags & TYPE_FLAGS_MASK
        ));
        if let Some((packing, size)) = md.class_layout_of(rid) {
            self.lines
                .push(format!("type {name} layout pack={packing} size={size}"));
        }
        for interface in md.interfaces_of(rid)? {
            self.lines
                .push(format!("type {name} implements {}", md.type_name(interface)?));
        }
        let prefix = format!("type {name}");
        self.generic_params(&prefix, Token::new(TableId::TypeDef, rid))?;
        self.attributes(&prefix, Token::new(TableId::TypeDef, rid))?;

        let value_type = self.is_value_type(&ty, &name)?;
        let mut instance_field = 0usize;
        for field_rid in md.fields_of(rid)? {
            let field = md.field(field_rid)?;
            let sig = signature::decode_field(field.signature)?.render(md)?;
            if value_type && field.flags & FIELD_STATIC == 0 {
                self.lines
                    .push(format!("type {name} instance-field #{instance_field} {sig}"));
                instance_field += 1;
            }
            if !self.visibility.admits(member_access(field.flags)) {
                continue;
            }
            let mut line = format!(
                "type {name} field {} flags={:#x} {sig}",
                field.name,
                field.flags & FIELD_FLAGS_MASK
            );
            self.push_constant(&mut line, Token::new(TableId::Field, field_rid))?;
            self.lines.push(line);
            let prefix = format!("type {name} field {}", field.name);
            self.attributes(&prefix, Token::new(TableId::Field, field_rid))?;
        }

        for method_rid in md.methods_of(rid)? {
            self.method(&name, method_rid)?;
        }
        for property_rid in md.properties_of(rid)? {
            self.property(&name, property_rid)?;
        }
        for event_rid in md.events_of(rid)? {
            self.event(&name, event_rid)?;
        }
        Ok(())
    }

    fn method_visible(&self, method_rid: u32) -> Result<bool> {
        let method = self.metadata.method(method_rid)?;
        Ok(self.visibility.admits(member_access(method.flags)))
    }

    fn method(&mut self, type_name: &str, method_rid: u32) -> Result<()> {
        let md = self.metadata;
        let method = md.method(method_rid)?;
        if !self.visibility.admits(member_access(method.flags)) {
            return Ok(());
        }
        let sig = md.method_signature(&method)?;
        let params = md
            .params_of(method_rid)?
            .into_iter()
            .map(|rid| md.param(rid))
            .collect::<Result<Vec<_>>>()?;
        let mut param_names = vec![String::new(); sig.params.len()];
        for param in &params {
            if let Some(slot) = (param.sequence as usize)
                .checked_sub(1)
                .and_then(|i| param_names.get_mut(i))
            {
                *slot = param.name.to_string();
            }
        }

        let key = format!(
            "type {type_name} method {} {}",
            method.name,
            sig.render_named(md, &param_names)?
        );
        self.lines.push(format!(
            "{key} flags={:#x}",
            method.flags & METHOD_FLAGS_MASK
        ));
        for param in &params {
            let token = Token::new(TableId::Param, param.rid);
            let flags = param.flags & PARAM_FLAGS_MASK;
            let mut line = format!("{key} param {} flags={flags:#x}", param.sequence);
            let had_constant = self.push_constant(&mut line, token)?;
            if flags != 0 || had_constant {
                self.lines.push(line);
            }
            let prefix = format!("{key} param {}", param.sequence);
            self.attributes(&prefix, token)?;
        }
        self.generic_params(&key, Token::new(TableId::MethodDef, method_rid))?;
        self.attributes(&key, Token::new(TableId::MethodDef, method_rid))?;
        Ok(())
    }

    /// Lines for the accessors of a property or event, or `None` when none
    /// of them is visible.
    fn accessors(&self, prefix: &str, association: Token) -> Result<Option<Vec<String>>> {
        let md = self.metadata;
        let mut visible = false;
        let mut lines = Vec::new();
        for (semantics, method_rid) in md.accessors_of(association) {
            let role = match *semantics {
                0x0001 => "set",
                0x0002 => "get",
                0x0008 => "add",
                0x0010 => "remove",
                0x0020 => "fire",
                _ => "other",
            };
            if self.method_visible(*method_rid)? {
                visible = true;
                lines.push(format!(
                    "{prefix} {role} {}",
                    md.method(*method_rid)?.name
                ));
            }
        }
        Ok(visible.then_some(lines))
    }

    fn property(&mut self, type_name: &str, property_rid: u32) -> Result<()> {
        let md = self.metadata;
        let property = md.property(property_rid)?;
        let token = Token::new(TableId::Property, property_rid);
        let sig = signature::decode_property(property.signature)?.render(md)?;
        let prefix = format!("type {type_name} property {} {sig}", property.name);
        let Some(accessors) = self.accessors(&prefix, token)? else {
            return Ok(());
        };
        let mut line = format!(
            "{prefix} flags={:#x}",
            property.flags & PROPERTY_FLAGS_MASK
        );
        self.push_constant(&mut line, token)?;
        self.lines.push(line);
        self.lines.extend(accessors);
        self.attributes(&prefix, token)?;
        Ok(())
    }

    fn event(&mut self, type_name: &str, event_rid: u32) -> Result<()> {
        let md = self.metadata;
        let event = md.event(event_rid)?;
        let token = Token::new(TableId::Event, event_rid);
        let event_type = match event.event_type {
            Some(ty) => md.type_name(ty)?,
            None => "-".to_string(),
        };
        let prefix = format!("type {type_name} event {} {event_type}", event.name);
        let Some(accessors) = self.accessors(&prefix, token)? else {
            return Ok(());
        };
        self.lines.push(format!(
            "{prefix} flags={:#x}",
            event.flags & EVENT_FLAGS_MASK
        ));
        self.lines.extend(accessors);
        self.attributes(&prefix, token)?;
        Ok(())
    }

    fn generic_params(&mut self, prefix: &str, owner: Token) -> Result<()> {
        let md = self.metadata;
        for param in md.generic_params_of(owner)? {
            self.lines.push(format!(
                "{prefix} generic {} {} flags={:#x}",
                param.number, param.name, param.flags
            ));
            for constraint in md.generic_constraints_of(param.rid)? {
                self.lines.push(format!(
                    "{prefix} generic {} constraint {}",
                    param.number,
                    md.type_name(constraint)?
                ));
            }
        }
        Ok(())
    }

    fn attributes(&mut self, prefix: &str, parent: Token) -> Result<()> {
        let md = self.metadata;
        for attribute in md.custom_attributes_of(parent)? {
            self.lines.push(format!(
                "{prefix} attribute {} {}",
                md.constructor_name(attribute.constructor)?,
                hex(attribute.value)
            ));
        }
        Ok(())
    }

    fn push_constant(&self, line: &mut String, parent: Token) -> Result<bool> {
        match self.metadata.constant_of(parent)? {
            Some(constant) => {
                let _ = write!(
                    line,
                    " = {:02x}:{}",
                    constant.element_type,
                    hex(constant.value)
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
