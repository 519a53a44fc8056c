//! Template component builder
//!
//! Turns a template definition plus one recipient into the substitution
//! parameters the provider expects for a template send.

use serde::{Serialize, Serializer};
use whatsend_common::types::{
    ComponentKind, TemplateComponent, VariableBinding, VariableMapping, VariableSource,
};
use whatsend_storage::models::Recipient;

use super::placeholders::placeholders_in;

/// One substitution parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Parameter {
    Text { text: String },
}

impl Parameter {
    pub fn text(value: impl Into<String>) -> Self {
        Parameter::Text { text: value.into() }
    }
}

/// A component as sent with a template message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentParameters {
    #[serde(rename = "type", serialize_with = "serialize_kind")]
    pub kind: ComponentKind,
    pub parameters: Vec<Parameter>,
}

fn serialize_kind<S: Serializer>(kind: &ComponentKind, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(kind.as_str())
}

/// Value for one placeholder: the bound recipient field, else the literal,
/// else an empty string
pub fn resolve_binding(binding: Option<&VariableBinding>, recipient: &Recipient) -> String {
    let Some(binding) = binding else {
        return String::new();
    };

    let field = match binding.source {
        Some(VariableSource::Name) => recipient.name.as_deref(),
        Some(VariableSource::LastName) => recipient.last_name.as_deref(),
        Some(VariableSource::Phone) => Some(recipient.phone.as_str()),
        Some(VariableSource::Email) => recipient.email.as_deref(),
        Some(VariableSource::Literal) | None => None,
    };

    field
        .filter(|v| !v.is_empty())
        .or(binding.value.as_deref())
        .unwrap_or_default()
        .to_string()
}

fn text_parameters(
    text: Option<&str>,
    mapping: &VariableMapping,
    recipient: &Recipient,
) -> Vec<Parameter> {
    placeholders_in(text.unwrap_or_default())
        .into_iter()
        .map(|n| Parameter::text(resolve_binding(mapping.get(&n), recipient)))
        .collect()
}

/// Build the outgoing components for one recipient.
///
/// Media headers are sent without parameters so the provider uses the media
/// stored with the template. Buttons are never sent. Returns `None` when no
/// component needs to be included.
pub fn build_components(
    components: &[TemplateComponent],
    mapping: &VariableMapping,
    recipient: &Recipient,
) -> Option<Vec<ComponentParameters>> {
    let mut built = Vec::new();

    for component in components {
        let parameters = match component.kind {
            ComponentKind::Buttons => continue,
            ComponentKind::Header if component.format.is_some_and(|f| f.is_media()) => {
                Vec::new()
            }
            ComponentKind::Header | ComponentKind::Body | ComponentKind::Footer => {
                let parameters = text_parameters(component.text.as_deref(), mapping, recipient);
                if parameters.is_empty() {
                    continue;
                }
                parameters
            }
        };

        built.push(ComponentParameters {
            kind: component.kind,
            parameters,
        });
    }

    if built.is_empty() {
        None
    } else {
        Some(built)
    }
}
