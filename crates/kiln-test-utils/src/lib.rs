//! Utilities shared by Kiln tests.
//!
//! [`AssemblyImage`] writes genuine managed assemblies so reference trimming
//! can be exercised without a .NET toolchain; [`ProjectFixture`] lays out a
//! throwaway project directory with sources, references and outputs.

mod assembly;
mod project;

pub use assembly::{
    Access, AssemblyImage, FieldDefinition, MethodDefinition, PropertyDefinition, SigType,
    TypeDefinition, TypeKind, TypeVisibility,
};
pub use project::ProjectFixture;
