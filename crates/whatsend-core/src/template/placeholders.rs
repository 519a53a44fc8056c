//! Placeholder extraction and variable mapping validation

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use whatsend_common::types::{ComponentKind, TemplateComponent, VariableMapping};

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(\d+)\}\}").expect("placeholder pattern is valid"))
}

/// Placeholder numbers in `text`, ascending and de-duplicated
pub fn placeholders_in(text: &str) -> Vec<u32> {
    let mut numbers: Vec<u32> = placeholder_regex()
        .captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();
    numbers.sort_unstable();
    numbers.dedup();
    numbers
}

/// Whether placeholders in this component are substituted at send time
pub(crate) fn carries_variables(kind: ComponentKind) -> bool {
    matches!(
        kind,
        ComponentKind::Header | ComponentKind::Body | ComponentKind::Footer
    )
}

/// A `{{n}}` placeholder found in a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub number: u32,
    /// Component the placeholder first appears in
    pub location: ComponentKind,
    pub required: bool,
}

/// Scan header, body and footer text for placeholders.
///
/// Each number is reported once, at its first location, in ascending order.
pub fn extract_variables(components: &[TemplateComponent]) -> Vec<TemplateVariable> {
    let mut found: BTreeMap<u32, ComponentKind> = BTreeMap::new();

    for component in components {
        if !carries_variables(component.kind) {
            continue;
        }
        let Some(text) = component.text.as_deref() else {
            continue;
        };
        for number in placeholders_in(text) {
            found.entry(number).or_insert(component.kind);
        }
    }

    found
        .into_iter()
        .map(|(number, location)| TemplateVariable {
            number,
            location,
            required: true,
        })
        .collect()
}

/// Outcome of checking a mapping against a template's placeholders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl MappingValidation {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Check that every required placeholder has a resolvable binding
pub fn validate_mapping(
    required: &[TemplateVariable],
    provided: Option<&VariableMapping>,
) -> MappingValidation {
    let Some(mapping) = provided else {
        return MappingValidation::from_errors(vec![
            "No variable mapping was provided".to_string()
        ]);
    };

    let errors = required
        .iter()
        .filter(|v| v.required)
        .filter_map(|variable| match mapping.get(&variable.number) {
            None => Some(format!(
                "Variable {{{{{}}}}} in {} has no mapping",
                variable.number, variable.location
            )),
            Some(binding) if !binding.is_resolvable() => Some(format!(
                "Variable {{{{{}}}}} in {} needs a recipient field or a literal value",
                variable.number, variable.location
            )),
            Some(_) => None,
        })
        .collect();

    MappingValidation::from_errors(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use whatsend_common::types::{VariableBinding, VariableSource};

    fn components() -> Vec<TemplateComponent> {
        vec![
            TemplateComponent::text(ComponentKind::Header, "Order {{3}}"),
            TemplateComponent::text(ComponentKind::Body, "Hi {{1}}, code {{2}} for {{3}} {{1}}"),
            TemplateComponent::text(ComponentKind::Footer, "Reply STOP"),
            TemplateComponent::text(ComponentKind::Buttons, "{{9}}"),
        ]
    }

    #[test]
    fn test_extract_sorted_and_deduplicated() {
        let variables = extract_variables(&components());
        let numbers: Vec<(u32, ComponentKind)> =
            variables.iter().map(|v| (v.number, v.location)).collect();

        assert_eq!(
            numbers,
            vec![
                (1, ComponentKind::Body),
                (2, ComponentKind::Body),
                (3, ComponentKind::Header),
            ]
        );
        assert!(variables.iter().all(|v| v.required));
    }

    #[test]
    fn test_numeric_not_lexical_order() {
        assert_eq!(placeholders_in("{{10}} {{2}} {{1}}"), vec![1, 2, 10]);
        assert!(placeholders_in("{{name}} {1} {{ 1 }}").is_empty());
    }

    #[test]
    fn test_validate_complete_mapping() {
        let required = extract_variables(&components());
        let mut mapping = VariableMapping::new();
        mapping.insert(1, VariableBinding::field(VariableSource::Name));
        mapping.insert(2, VariableBinding::literal("42"));
        mapping.insert(3, VariableBinding::field(VariableSource::Phone));

        let result = validate_mapping(&required, Some(&mapping));
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_validate_reports_each_problem() {
        let required = extract_variables(&components());
        let mut mapping = VariableMapping::new();
        mapping.insert(1, VariableBinding::field(VariableSource::Name));
        mapping.insert(2, VariableBinding::default());

        let result = validate_mapping(&required, Some(&mapping));
        assert!(!result.valid);
        assert_eq!(
            result.errors,
            vec![
                "Variable {{2}} in body needs a recipient field or a literal value".to_string(),
                "Variable {{3}} in header has no mapping".to_string(),
            ]
        );
    }

    #[test]
    fn test_validate_missing_mapping() {
        let result = validate_mapping(&[], None);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
    }
}
