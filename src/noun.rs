//! # Noun Schemas
//!
//! A *noun* is a declared entity type: a PascalCase name, a set of typed
//! fields, and a set of verbs (each stored with its full conjugation). The
//! full noun-definition language is parsed upstream of the engine; what
//! arrives here is its tokenized form: a map from field name to a compact
//! descriptor string:
//!
//! ```text
//! "name":  "string!"                 required string
//! "email": "string?#"                optional, indexed
//! "stage": "Lead|Qualified|Customer" enum
//! "owner": "->User"                  relationship (to-many with [])
//! "tags":  "string[]"                array
//! "tier":  "string = Free"           default value
//! "close": "verb"                    custom verb
//! "delete": "disabled"               disabled-verb marker
//! ```
//!
//! Modifiers: `!` required, `?` optional, `#` indexed, `*` unique, `[]`
//! array. Indexed and unique are advisory metadata; the storage layer does
//! not enforce them.
//!
//! Every noun gets the default verbs `create`, `update`, and `delete` unless
//! a disabled marker names them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::conjugate::{conjugate, Conjugation};
use crate::error::{Error, Result};

// =============================================================================
// Name Validation
// =============================================================================

/// True for PascalCase noun names: leading ASCII uppercase, alphanumeric
/// remainder.
pub fn is_pascal_case(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => chars.all(|c| c.is_ascii_alphanumeric()),
        _ => false,
    }
}

/// Lowercase singular form: `DealRoom` → `dealroom`.
fn singular_of(name: &str) -> String {
    name.to_lowercase()
}

/// Plural form of the singular, by the same suffix morphology the
/// conjugator uses for third person: `company` → `companies`, `box` →
/// `boxes`, `contact` → `contacts`.
fn plural_of(singular: &str) -> String {
    let is_vowel = |c: char| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u');
    let chars: Vec<char> = singular.chars().collect();
    let n = chars.len();
    if singular.ends_with('s')
        || singular.ends_with('x')
        || singular.ends_with('z')
        || singular.ends_with("ch")
        || singular.ends_with("sh")
    {
        format!("{}es", singular)
    } else if n >= 2 && chars[n - 1] == 'y' && !is_vowel(chars[n - 2]) {
        format!("{}ies", &singular[..singular.len() - 1])
    } else {
        format!("{}s", singular)
    }
}

/// Kebab-case slug: `DealRoom` → `deal-room`.
fn slug_of(name: &str) -> String {
    let mut slug = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            slug.push('-');
        }
        slug.push(c.to_ascii_lowercase());
    }
    slug
}

// =============================================================================
// Field Descriptors
// =============================================================================

/// Scalar field kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    String,
    Number,
    Boolean,
    Date,
    Json,
}

impl ScalarKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(ScalarKind::String),
            "number" => Some(ScalarKind::Number),
            "boolean" => Some(ScalarKind::Boolean),
            "date" => Some(ScalarKind::Date),
            "json" => Some(ScalarKind::Json),
            _ => None,
        }
    }
}

/// What a field holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum FieldKind {
    Scalar { scalar: ScalarKind },
    Enum { variants: Vec<String> },
    Relationship { target: String },
}

/// A parsed field descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    /// Advisory; not enforced by the entity store.
    #[serde(default)]
    pub indexed: bool,
    /// Advisory; not enforced by the entity store.
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub array: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Outcome of parsing one definition entry.
enum ParsedEntry {
    Field(FieldDef),
    Verb,
    Disabled,
}

fn parse_descriptor(field: &str, descriptor: &str) -> Result<ParsedEntry> {
    let descriptor = descriptor.trim();
    if descriptor == "verb" {
        return Ok(ParsedEntry::Verb);
    }
    if descriptor == "disabled" {
        return Ok(ParsedEntry::Disabled);
    }

    // Trailing `= literal` default value.
    let (head, default) = match descriptor.split_once('=') {
        Some((lhs, rhs)) => {
            let raw = rhs.trim();
            let value = serde_json::from_str::<Value>(raw)
                .unwrap_or_else(|_| Value::String(raw.to_string()));
            (lhs.trim(), Some(value))
        }
        None => (descriptor, None),
    };

    // Suffix modifiers, any order.
    let mut core = head;
    let mut required = false;
    let mut indexed = false;
    let mut unique = false;
    let mut array = false;
    loop {
        if let Some(rest) = core.strip_suffix("[]") {
            array = true;
            core = rest;
        } else if let Some(rest) = core.strip_suffix('!') {
            required = true;
            core = rest;
        } else if let Some(rest) = core.strip_suffix('?') {
            core = rest;
        } else if let Some(rest) = core.strip_suffix('#') {
            indexed = true;
            core = rest;
        } else if let Some(rest) = core.strip_suffix('*') {
            unique = true;
            core = rest;
        } else {
            break;
        }
    }
    let core = core.trim();

    let kind = if let Some(target) = core.strip_prefix("->") {
        let target = target.trim();
        if !is_pascal_case(target) {
            return Err(Error::BadInput(format!(
                "field '{}': relationship target '{}' is not PascalCase",
                field, target
            )));
        }
        FieldKind::Relationship { target: target.to_string() }
    } else if core.contains('|') {
        let variants: Vec<String> = core
            .split('|')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if variants.len() < 2 {
            return Err(Error::BadInput(format!(
                "field '{}': enum needs at least two variants",
                field
            )));
        }
        FieldKind::Enum { variants }
    } else {
        match ScalarKind::parse(core) {
            Some(scalar) => FieldKind::Scalar { scalar },
            None => {
                return Err(Error::BadInput(format!(
                    "field '{}': unknown type '{}'",
                    field, core
                )))
            }
        }
    };

    Ok(ParsedEntry::Field(FieldDef { kind, required, indexed, unique, array, default }))
}

// =============================================================================
// Noun Schema
// =============================================================================

/// Verbs every noun carries unless explicitly disabled.
pub const DEFAULT_VERBS: &[&str] = &["create", "update", "delete"];

/// A registered noun schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NounSchema {
    /// PascalCase name, the registry key.
    pub name: String,
    pub singular: String,
    pub plural: String,
    pub slug: String,
    pub fields: BTreeMap<String, FieldDef>,
    /// Verb name → full conjugation, defaults included.
    pub verbs: BTreeMap<String, Conjugation>,
    /// Verb names a disabled marker removed.
    pub disabled: BTreeSet<String>,
}

/// How a verb lookup by arbitrary form resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerbResolution {
    /// Matched a verb's action form.
    Action(String),
    /// Matched an activity form; carries the action form to use instead.
    Activity(String),
    /// Matched an event form; carries the action form to use instead.
    Event(String),
    Unknown,
}

impl NounSchema {
    /// Builds a schema from a definition map. Rejects non-PascalCase names;
    /// injects default verbs unless disabled; conjugates every verb.
    pub fn define(name: &str, definition: &Map<String, Value>) -> Result<Self> {
        if !is_pascal_case(name) {
            return Err(Error::BadInput(format!(
                "noun name '{}' must be PascalCase",
                name
            )));
        }

        let mut fields = BTreeMap::new();
        let mut verbs: BTreeMap<String, Conjugation> = BTreeMap::new();
        let mut disabled = BTreeSet::new();

        for (key, value) in definition {
            let descriptor = value.as_str().ok_or_else(|| {
                Error::BadInput(format!("field '{}': descriptor must be a string", key))
            })?;
            match parse_descriptor(key, descriptor)? {
                ParsedEntry::Field(def) => {
                    fields.insert(key.clone(), def);
                }
                ParsedEntry::Verb => {
                    verbs.insert(key.clone(), conjugate(key));
                }
                ParsedEntry::Disabled => {
                    disabled.insert(key.clone());
                }
            }
        }

        for verb in DEFAULT_VERBS {
            if !disabled.contains(*verb) {
                verbs.entry((*verb).to_string()).or_insert_with(|| conjugate(verb));
            }
        }
        // A marker can also disable a custom verb declared in the same map.
        for verb in &disabled {
            verbs.remove(verb);
        }

        let singular = singular_of(name);
        let plural = plural_of(&singular);
        Ok(Self {
            name: name.to_string(),
            singular,
            plural,
            slug: slug_of(name),
            fields,
            verbs,
            disabled,
        })
    }

    /// True when a disabled marker names the verb.
    pub fn is_disabled(&self, verb: &str) -> bool {
        self.disabled.contains(verb)
    }

    /// The conjugation of an enabled verb, if declared.
    pub fn verb(&self, name: &str) -> Option<&Conjugation> {
        self.verbs.get(name)
    }

    /// Resolves a verb given in any form. Action forms resolve directly;
    /// activity/event forms resolve to a redirect so the executor can tell
    /// the caller which action form to use.
    pub fn resolve_verb(&self, given: &str) -> VerbResolution {
        if self.verbs.contains_key(given) {
            return VerbResolution::Action(given.to_string());
        }
        for (action, conj) in &self.verbs {
            if conj.activity == given {
                return VerbResolution::Activity(action.clone());
            }
            if conj.event == given {
                return VerbResolution::Event(action.clone());
            }
        }
        VerbResolution::Unknown
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_pascal_case() {
        assert!(is_pascal_case("Contact"));
        assert!(is_pascal_case("DealRoom"));
        assert!(is_pascal_case("A1"));
        assert!(!is_pascal_case("contact"));
        assert!(!is_pascal_case("Deal_Room"));
        assert!(!is_pascal_case(""));
        assert!(!is_pascal_case("1Deal"));
    }

    #[test]
    fn test_scenario_definition() {
        let schema = NounSchema::define(
            "Contact",
            &definition(json!({
                "name": "string!",
                "email": "string?#",
                "stage": "Lead|Qualified|Customer",
            })),
        )
        .unwrap();

        let name = &schema.fields["name"];
        assert!(name.required);
        assert_eq!(name.kind, FieldKind::Scalar { scalar: ScalarKind::String });

        let email = &schema.fields["email"];
        assert!(!email.required);
        assert!(email.indexed);

        let stage = &schema.fields["stage"];
        assert_eq!(
            stage.kind,
            FieldKind::Enum {
                variants: vec!["Lead".into(), "Qualified".into(), "Customer".into()]
            }
        );

        // Default verbs are present and conjugated.
        assert_eq!(schema.verbs["create"].event, "created");
        assert_eq!(schema.verbs["delete"].event, "deleted");
        assert_eq!(schema.singular, "contact");
        assert_eq!(schema.plural, "contacts");
        assert_eq!(schema.slug, "contact");
    }

    #[test]
    fn test_custom_and_disabled_verbs() {
        let schema = NounSchema::define(
            "Deal",
            &definition(json!({
                "amount": "number",
                "close": "verb",
                "delete": "disabled",
            })),
        )
        .unwrap();
        assert!(schema.verbs.contains_key("close"));
        assert_eq!(schema.verbs["close"].activity, "closing");
        assert!(schema.is_disabled("delete"));
        assert!(!schema.verbs.contains_key("delete"));
        assert!(schema.verbs.contains_key("create"));
        assert!(schema.verbs.contains_key("update"));
    }

    #[test]
    fn test_relationship_array_default() {
        let schema = NounSchema::define(
            "Issue",
            &definition(json!({
                "assignee": "->User",
                "labels": "string[]",
                "priority": "string = Medium",
                "sku": "string*",
            })),
        )
        .unwrap();
        assert_eq!(
            schema.fields["assignee"].kind,
            FieldKind::Relationship { target: "User".into() }
        );
        assert!(schema.fields["labels"].array);
        assert_eq!(schema.fields["priority"].default, Some(json!("Medium")));
        assert!(schema.fields["sku"].unique);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(NounSchema::define("contact", &definition(json!({}))).is_err());
        assert!(
            NounSchema::define("Contact", &definition(json!({"x": "gibberish"}))).is_err()
        );
        assert!(NounSchema::define("Contact", &definition(json!({"x": 7}))).is_err());
        assert!(
            NounSchema::define("Contact", &definition(json!({"rel": "->user"}))).is_err()
        );
    }

    #[test]
    fn test_resolve_verb_forms() {
        let schema = NounSchema::define(
            "Deal",
            &definition(json!({"close": "verb"})),
        )
        .unwrap();
        assert_eq!(schema.resolve_verb("close"), VerbResolution::Action("close".into()));
        assert_eq!(schema.resolve_verb("closing"), VerbResolution::Activity("close".into()));
        assert_eq!(schema.resolve_verb("closed"), VerbResolution::Event("close".into()));
        assert_eq!(schema.resolve_verb("reopen"), VerbResolution::Unknown);
    }

    #[test]
    fn test_schema_json_roundtrip() {
        let schema = NounSchema::define(
            "Company",
            &definition(json!({"name": "string!", "tier": "Free|Paid"})),
        )
        .unwrap();
        let encoded = serde_json::to_string(&schema).unwrap();
        let decoded: NounSchema = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.name, "Company");
        assert_eq!(decoded.plural, "companies");
        assert_eq!(decoded.fields.len(), 2);
        assert_eq!(decoded.verbs.len(), 3);
    }
}
