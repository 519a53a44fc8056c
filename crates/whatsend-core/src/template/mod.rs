//! Template handling for campaign sends

pub mod components;
pub mod placeholders;

pub use components::{build_components, resolve_binding, ComponentParameters, Parameter};
pub use placeholders::{extract_variables, validate_mapping, MappingValidation, TemplateVariable};
