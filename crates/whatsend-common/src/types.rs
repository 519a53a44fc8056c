//! Common types for Whatsend

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for campaign messages
pub type CampaignMessageId = Uuid;

/// Unique identifier for contacts (recipients)
pub type ContactId = Uuid;

/// Template component type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComponentKind {
    Header,
    Body,
    Footer,
    Buttons,
}

impl ComponentKind {
    /// Lowercase name used in outgoing payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Header => "header",
            ComponentKind::Body => "body",
            ComponentKind::Footer => "footer",
            ComponentKind::Buttons => "buttons",
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Template component format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComponentFormat {
    Text,
    Image,
    Video,
    Document,
    /// Formats this build does not know about (e.g. LOCATION)
    #[serde(other)]
    Other,
}

impl ComponentFormat {
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            ComponentFormat::Image | ComponentFormat::Video | ComponentFormat::Document
        )
    }
}

/// One component of a provider template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateComponent {
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ComponentFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Button definitions, resolved by the provider from the stored template
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<serde_json::Value>,
}

impl TemplateComponent {
    pub fn text(kind: ComponentKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            format: if kind == ComponentKind::Header {
                Some(ComponentFormat::Text)
            } else {
                None
            },
            text: Some(text.into()),
            buttons: Vec::new(),
        }
    }

    pub fn media_header(format: ComponentFormat) -> Self {
        Self {
            kind: ComponentKind::Header,
            format: Some(format),
            text: None,
            buttons: Vec::new(),
        }
    }
}

/// A provider-registered message template, immutable for one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub components: Vec<TemplateComponent>,
}

/// Recipient field a placeholder resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableSource {
    Name,
    #[serde(alias = "lastname", alias = "last-name")]
    LastName,
    Phone,
    Email,
    /// Use the binding's literal value
    #[serde(alias = "custom", alias = "fixed")]
    Literal,
}

/// Resolution rule for one `{{n}}` placeholder
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VariableBinding {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<VariableSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl VariableBinding {
    pub fn field(source: VariableSource) -> Self {
        Self {
            source: Some(source),
            value: None,
        }
    }

    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            source: Some(VariableSource::Literal),
            value: Some(value.into()),
        }
    }

    /// Whether the binding can produce a value for some recipient
    pub fn is_resolvable(&self) -> bool {
        let has_literal = self.value.as_deref().is_some_and(|v| !v.trim().is_empty());
        match self.source {
            Some(VariableSource::Literal) | None => has_literal,
            Some(_) => true,
        }
    }
}

/// Placeholder number (as written inside `{{n}}`) to resolution rule
pub type VariableMapping = BTreeMap<u32, VariableBinding>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_template_definition_from_provider_json() {
        let json = serde_json::json!({
            "name": "order_update",
            "language": "es",
            "components": [
                {"type": "HEADER", "format": "IMAGE"},
                {"type": "BODY", "text": "Hola {{1}}"},
                {"type": "BUTTONS", "buttons": [{"type": "URL", "text": "Ver"}]}
            ]
        });

        let template: TemplateDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(template.components.len(), 3);
        assert_eq!(template.components[0].format, Some(ComponentFormat::Image));
        assert_eq!(template.components[1].kind, ComponentKind::Body);
        assert_eq!(template.components[2].buttons.len(), 1);
    }

    #[test]
    fn test_unknown_format_is_tolerated() {
        let component: TemplateComponent =
            serde_json::from_value(serde_json::json!({"type": "HEADER", "format": "LOCATION"}))
                .unwrap();
        assert_eq!(component.format, Some(ComponentFormat::Other));
        assert!(!ComponentFormat::Other.is_media());
    }

    #[test]
    fn test_variable_mapping_from_stored_json() {
        let json = serde_json::json!({
            "1": {"type": "name"},
            "2": {"type": "literal", "value": "42"},
            "3": {"value": "fallback"}
        });

        let mapping: VariableMapping = serde_json::from_value(json).unwrap();
        assert_eq!(mapping[&1], VariableBinding::field(VariableSource::Name));
        assert_eq!(mapping[&2], VariableBinding::literal("42"));
        assert!(mapping[&3].is_resolvable());
    }

    #[test]
    fn test_binding_resolvability() {
        assert!(VariableBinding::field(VariableSource::Email).is_resolvable());
        assert!(!VariableBinding::default().is_resolvable());
        assert!(!VariableBinding {
            source: Some(VariableSource::Literal),
            value: Some("  ".to_string()),
        }
        .is_resolvable());
    }
}
