//! Reader for the metadata of managed (.NET) assemblies.
//!
//! [`Metadata::parse`] walks the PE headers to the CLI metadata and exposes
//! its tables; [`ApiSurface`] renders what another assembly's compiler can
//! observe of it.

#![forbid(unsafe_code)]

mod error;
mod heaps;
mod metadata;
mod pe;
mod reader;
mod signature;
mod surface;
mod tables;

pub use crate::error::{Error, Result};
pub use crate::heaps::{BlobHeap, GuidHeap, StringsHeap};
pub use crate::metadata::{
    AssemblyIdentity, ConstantRow, CustomAttributeRow, EventRow, FieldRow, GenericParamRow,
    Metadata, MethodRow, ParamRow, PropertyRow, TypeDefRow,
};
pub use crate::pe::{DataDirectory, PeImage, Section};
pub use crate::signature::{
    decode_field, decode_method, decode_property, decode_type_spec, MethodSig, PropertySig,
    TypeNames, TypeSig,
};
pub use crate::surface::{ApiSurface, Visibility};
pub use crate::tables::{CodedIndex, Row, TableId, Tables, Token};

/// Both surfaces of an assembly plus its friend list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblySurfaces {
    pub assembly_name: Option<String>,
    pub public: ApiSurface,
    /// Only rendered when some assembly is granted internals access.
    pub internal: Option<ApiSurface>,
    pub internals_visible_to: Vec<String>,
}

/// Parses `bytes` and renders its surfaces.
///
/// The internal surface is skipped when the assembly declares no
/// `InternalsVisibleTo` friends, since no consumer could observe it.
pub fn read_surfaces(bytes: &[u8]) -> Result<AssemblySurfaces> {
    let metadata = Metadata::parse(bytes)?;
    let internals_visible_to = metadata.internals_visible_to()?;
    let public = ApiSurface::build(&metadata, Visibility::Public)?;
    let internal = if internals_visible_to.is_empty() {
        None
    } else {
        Some(ApiSurface::build(&metadata, Visibility::Internal)?)
    };
    Ok(AssemblySurfaces {
        assembly_name: metadata.assembly()?.map(|a| a.name),
        public,
        internal,
        internals_visible_to,
    })
}
