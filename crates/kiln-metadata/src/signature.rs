//! Signature blobs (ECMA-335 II.23.2).
//!
//! Signatures are decoded into a small tree and rendered back to text with
//! type *names* substituted for table tokens, so the rendering of a member
//! does not depend on where its types happen to sit in the tables.

use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::tables::{CodedIndex, Token};

const MAX_DEPTH: usize = 64;

pub(crate) const CALLCONV_GENERIC: u8 = 0x10;
pub(crate) const CALLCONV_HASTHIS: u8 = 0x20;
pub(crate) const CALLCONV_EXPLICITTHIS: u8 = 0x40;
const SIG_FIELD: u8 = 0x06;
const SIG_PROPERTY: u8 = 0x08;

const ELEMENT_SENTINEL: u8 = 0x41;
const ELEMENT_PINNED: u8 = 0x45;
const ELEMENT_CMOD_REQD: u8 = 0x1F;
const ELEMENT_CMOD_OPT: u8 = 0x20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSig {
    Primitive(&'static str),
    Class(Token),
    ValueType(Token),
    SzArray(Box<TypeSig>),
    Array {
        element: Box<TypeSig>,
        rank: u32,
        sizes: Vec<u32>,
        lower_bounds: Vec<i32>,
    },
    Pointer(Box<TypeSig>),
    ByRef(Box<TypeSig>),
    Pinned(Box<TypeSig>),
    GenericInst {
        value_type: bool,
        base: Token,
        args: Vec<TypeSig>,
    },
    Var(u32),
    MVar(u32),
    FnPtr(Box<MethodSig>),
    Modified {
        required: bool,
        modifier: Token,
        inner: Box<TypeSig>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSig {
    pub calling_convention: u8,
    pub generic_params: u32,
    pub ret: TypeSig,
    pub params: Vec<TypeSig>,
    /// Index into `params` where the vararg sentinel appeared.
    pub sentinel: Option<usize>,
}

impl MethodSig {
    pub fn has_this(&self) -> bool {
        self.calling_convention & CALLCONV_HASTHIS != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySig {
    pub has_this: bool,
    pub ty: TypeSig,
    pub params: Vec<TypeSig>,
}

/// Resolves `TypeDef`/`TypeRef`/`TypeSpec` tokens to display names.
pub trait TypeNames {
    fn type_name(&self, token: Token) -> Result<String>;
}

pub fn decode_method(blob: &[u8]) -> Result<MethodSig> {
    let mut reader = Reader::new(blob);
    read_method(&mut reader, 0)
}

pub fn decode_field(blob: &[u8]) -> Result<TypeSig> {
    let mut reader = Reader::new(blob);
    let kind = reader.read_u1()?;
    if kind & 0x0F != SIG_FIELD {
        return Err(Error::InvalidSignature("expected field signature"));
    }
    read_type(&mut reader, 0)
}

pub fn decode_property(blob: &[u8]) -> Result<PropertySig> {
    let mut reader = Reader::new(blob);
    let kind = reader.read_u1()?;
    if kind & 0x0F != SIG_PROPERTY {
        return Err(Error::InvalidSignature("expected property signature"));
    }
    let count = reader.read_compressed_u32()?;
    let ty = read_type(&mut reader, 0)?;
    let mut params = Vec::with_capacity(count.min(256) as usize);
    for _ in 0..count {
        params.push(read_type(&mut reader, 0)?);
    }
    Ok(PropertySig {
        has_this: kind & CALLCONV_HASTHIS != 0,
        ty,
        params,
    })
}

pub fn decode_type_spec(blob: &[u8]) -> Result<TypeSig> {
    let mut reader = Reader::new(blob);
    read_type(&mut reader, 0)
}

fn read_method(reader: &mut Reader<'_>, depth: usize) -> Result<MethodSig> {
    let calling_convention = reader.read_u1()?;
    let generic_params = if calling_convention & CALLCONV_GENERIC != 0 {
        reader.read_compressed_u32()?
    } else {
        0
    };
    let count = reader.read_compressed_u32()?;
    let ret = read_type(reader, depth + 1)?;
    let mut params = Vec::with_capacity(count.min(256) as usize);
    let mut sentinel = None;
    for _ in 0..count {
        if reader.peek_u1()? == ELEMENT_SENTINEL {
            reader.skip(1)?;
            sentinel = Some(params.len());
        }
        params.push(read_type(reader, depth + 1)?);
    }
    Ok(MethodSig {
        calling_convention,
        generic_params,
        ret,
        params,
        sentinel,
    })
}

fn read_token(reader: &mut Reader<'_>) -> Result<Token> {
    let raw = reader.read_compressed_u32()?;
    CodedIndex::TypeDefOrRef
        .decode(raw)?
        .ok_or(Error::InvalidSignature("null type token"))
}

fn read_type(reader: &mut Reader<'_>, depth: usize) -> Result<TypeSig> {
    if depth > MAX_DEPTH {
        return Err(Error::RecursionLimit);
    }
    let next = depth + 1;
    let element = reader.read_u1()?;
    let sig = match element {
        0x01 => TypeSig::Primitive("void"),
        0x02 => TypeSig::Primitive("bool"),
        0x03 => TypeSig::Primitive("char"),
        0x04 => TypeSig::Primitive("int8"),
        0x05 => TypeSig::Primitive("uint8"),
        0x06 => TypeSig::Primitive("int16"),
        0x07 => TypeSig::Primitive("uint16"),
        0x08 => TypeSig::Primitive("int32"),
        0x09 => TypeSig::Primitive("uint32"),
        0x0A => TypeSig::Primitive("int64"),
        0x0B => TypeSig::Primitive("uint64"),
        0x0C => TypeSig::Primitive("float32"),
        0x0D => TypeSig::Primitive("float64"),
        0x0E => TypeSig::Primitive("string"),
        0x0F => TypeSig::Pointer(Box::new(read_type(reader, next)?)),
        0x10 => TypeSig::ByRef(Box::new(read_type(reader, next)?)),
        0x11 => TypeSig::ValueType(read_token(reader)?),
        0x12 => TypeSig::Class(read_token(reader)?),
        0x13 => TypeSig::Var(reader.read_compressed_u32()?),
        0x14 => {
            let element = Box::new(read_type(reader, next)?);
            let rank = reader.read_compressed_u32()?;
            let size_count = reader.read_compressed_u32()?;
            let mut sizes = Vec::with_capacity(size_count.min(32) as usize);
            for _ in 0..size_count {
                sizes.push(reader.read_compressed_u32()?);
            }
            let bound_count = reader.read_compressed_u32()?;
            let mut lower_bounds = Vec::with_capacity(bound_count.min(32) as usize);
            for _ in 0..bound_count {
                lower_bounds.push(reader.read_compressed_i32()?);
            }
            TypeSig::Array {
                element,
                rank,
                sizes,
                lower_bounds,
            }
        }
        0x15 => {
            let value_type = match reader.read_u1()? {
                0x11 => true,
                0x12 => false,
                _ => return Err(Error::InvalidSignature("generic instance base")),
            };
            let base = read_token(reader)?;
            let count = reader.read_compressed_u32()?;
            let mut args = Vec::with_capacity(count.min(64) as usize);
            for _ in 0..count {
                args.push(read_type(reader, next)?);
            }
            TypeSig::GenericInst {
                value_type,
                base,
                args,
            }
        }
        0x16 => TypeSig::Primitive("typedref"),
        0x18 => TypeSig::Primitive("native int"),
        0x19 => TypeSig::Primitive("native uint"),
        0x1B => TypeSig::FnPtr(Box::new(read_method(reader, next)?)),
        0x1C => TypeSig::Primitive("object"),
        0x1D => TypeSig::SzArray(Box::new(read_type(reader, next)?)),
        0x1E => TypeSig::MVar(reader.read_compressed_u32()?),
        ELEMENT_CMOD_REQD | ELEMENT_CMOD_OPT => {
            let modifier = read_token(reader)?;
            TypeSig::Modified {
                required: element == ELEMENT_CMOD_REQD,
                modifier,
                inner: Box::new(read_type(reader, next)?),
            }
        }
        ELEMENT_PINNED => TypeSig::Pinned(Box::new(read_type(reader, next)?)),
        _ => return Err(Error::InvalidSignature("unknown element type")),
    };
    Ok(sig)
}

impl TypeSig {
    pub fn render(&self, names: &dyn TypeNames) -> Result<String> {
        let mut out = String::new();
        self.render_into(names, &mut out)?;
        Ok(out)
    }

    fn render_into(&self, names: &dyn TypeNames, out: &mut String) -> Result<()> {
        match self {
            TypeSig::Primitive(name) => out.push_str(name),
            TypeSig::Class(token) => {
                out.push_str("class ");
                out.push_str(&names.type_name(*token)?);
            }
            TypeSig::ValueType(token) => {
                out.push_str("valuetype ");
                out.push_str(&names.type_name(*token)?);
            }
            TypeSig::SzArray(element) => {
                element.render_into(names, out)?;
                out.push_str("[]");
            }
            TypeSig::Array {
                element,
                rank,
                sizes,
                lower_bounds,
            } => {
                element.render_into(names, out)?;
                out.push('[');
                for dim in 0..*rank as usize {
                    if dim > 0 {
                        out.push(',');
                    }
                    let lower = lower_bounds.get(dim).copied();
                    let size = sizes.get(dim).copied();
                    match (lower, size) {
                        (Some(lo), Some(n)) => {
                            let _ = write!(out, "{lo}...{}", i64::from(lo) + i64::from(n) - 1);
                        }
                        (Some(lo), None) => {
                            let _ = write!(out, "{lo}...");
                        }
                        (None, Some(n)) => {
                            let _ = write!(out, "{n}");
                        }
                        (None, None) => {}
                    }
                }
                out.push(']');
            }
            TypeSig::Pointer(inner) => {
                inner.render_into(names, out)?;
                out.push('*');
            }
            TypeSig::ByRef(inner) => {
                inner.render_into(names, out)?;
                out.push('&');
            }
            TypeSig::Pinned(inner) => {
                inner.render_into(names, out)?;
                out.push_str(" pinned");
            }
            TypeSig::GenericInst {
                value_type,
                base,
                args,
            } => {
                out.push_str(if *value_type { "valuetype " } else { "class " });
                out.push_str(&names.type_name(*base)?);
                out.push('<');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    arg.render_into(names, out)?;
                }
                out.push('>');
            }
            TypeSig::Var(n) => {
                let _ = write!(out, "!{n}");
            }
            TypeSig::MVar(n) => {
                let _ = write!(out, "!!{n}");
            }
            TypeSig::FnPtr(method) => {
                out.push_str("method ");
                out.push_str(&method.render(names)?);
            }
            TypeSig::Modified {
                required,
                modifier,
                inner,
            } => {
                inner.render_into(names, out)?;
                out.push_str(if *required { " modreq(" } else { " modopt(" });
                out.push_str(&names.type_name(*modifier)?);
                out.push(')');
            }
        }
        Ok(())
    }
}

impl MethodSig {
    /// `[instance] [explicit] <ret>(<params>)`, with the generic arity
    /// when the method is generic.
    pub fn render(&self, names: &dyn TypeNames) -> Result<String> {
        self.render_named(names, &[])
    }

    pub fn render_named(&self, names: &dyn TypeNames, param_names: &[String]) -> Result<String> {
        let mut out = String::new();
        if self.has_this() {
            out.push_str("instance ");
        }
        if self.calling_convention & CALLCONV_EXPLICITTHIS != 0 {
            out.push_str("explicit ");
        }
        match self.calling_convention & 0x0F {
            0x00 => {}
            0x05 => out.push_str("vararg "),
            other => {
                let _ = write!(out, "callconv({other}) ");
            }
        }
        out.push_str(&self.ret.render(names)?);
        if self.generic_params > 0 {
            let _ = write!(out, " `{}", self.generic_params);
        }
        out.push('(');
        out.push_str(&self.render_params(names, param_names)?);
        out.push(')');
        Ok(out)
    }

    /// Renders the parameter list, naming each parameter when `param_names`
    /// has an entry for it.
    pub fn render_params(&self, names: &dyn TypeNames, param_names: &[String]) -> Result<String> {
        let mut out = String::new();
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            if self.sentinel == Some(i) {
                out.push_str("..., ");
            }
            out.push_str(&param.render(names)?);
            if let Some(name) = param_names.get(i).filter(|n| !n.is_empty()) {
                out.push(' ');
                out.push_str(name);
            }
        }
        Ok(out)
    }
}

impl PropertySig {
    pub fn render(&self, names: &dyn TypeNames) -> Result<String> {
        let mut out = String::new();
        if self.has_this {
            out.push_str("instance ");
        }
        out.push_str(&self.ty.render(names)?);
        if !self.params.is_empty() {
            out.push('[');
            for (i, param) in self.params.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&param.render(names)?);
            }
            out.push(']');
        }
        Ok(out)
    }
}
