use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::object::EntityKind;
use crate::value::{AttributeValue, Attributes, ValueKind};

/// Definition of one stored attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub kind: ValueKind,
    /// Optional attributes accept `Null` and may be omitted at creation.
    #[serde(default)]
    pub optional: bool,
    /// Value used when the attribute is omitted at creation.
    #[serde(default)]
    pub default: Option<AttributeValue>,
}

impl AttributeDef {
    /// A required attribute of the given kind.
    pub fn required(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            default: None,
        }
    }

    /// An optional attribute of the given kind.
    pub fn optional(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            optional: true,
            ..Self::required(name, kind)
        }
    }

    /// Set the value filled in when the attribute is omitted at creation.
    pub fn with_default(mut self, value: impl Into<AttributeValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Check that `value` may be stored in this slot.
    pub fn check(&self, value: &AttributeValue) -> Result<(), TypeError> {
        match value.kind() {
            None if self.optional => Ok(()),
            None => Err(TypeError::MissingRequired {
                attribute: self.name.clone(),
            }),
            Some(actual) if self.kind.accepts(actual) => Ok(()),
            Some(actual) => Err(TypeError::KindMismatch {
                attribute: self.name.clone(),
                expected: self.kind,
                actual,
            }),
        }
    }
}

/// The attribute layout of one entity kind.
///
/// Schemas are registered once per kind; accessor tables are generated from
/// them at registration time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub kind: EntityKind,
    pub attributes: Vec<AttributeDef>,
}

impl EntitySchema {
    /// An empty schema for `kind`.
    pub fn new(kind: impl Into<EntityKind>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    /// Append an attribute definition.
    pub fn with_attribute(mut self, def: AttributeDef) -> Self {
        self.attributes.push(def);
        self
    }

    /// Look up an attribute definition by name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Attribute names in declaration order.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    /// Reject schemas that define the same attribute twice.
    pub fn validate(&self) -> Result<(), TypeError> {
        let mut seen = HashSet::new();
        for def in &self.attributes {
            if !seen.insert(def.name.as_str()) {
                return Err(TypeError::DuplicateAttribute {
                    attribute: def.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Check a value against the named attribute.
    pub fn check_value(&self, name: &str, value: &AttributeValue) -> Result<(), TypeError> {
        self.attribute(name)
            .ok_or_else(|| self.unknown(name))?
            .check(value)
    }

    /// Resolve the full attribute map for a new instance.
    ///
    /// Supplied values are kind-checked, omitted attributes take their
    /// default (or `Null` when optional), and unknown names are rejected.
    pub fn resolve_initial(&self, mut initial: Attributes) -> Result<Attributes, TypeError> {
        if let Some(name) = initial.keys().find(|n| self.attribute(n).is_none()) {
            return Err(self.unknown(name));
        }

        let mut resolved = Attributes::new();
        for def in &self.attributes {
            let value = match initial.remove(&def.name) {
                Some(value) => value,
                None => match (&def.default, def.optional) {
                    (Some(default), _) => default.clone(),
                    (None, true) => AttributeValue::Null,
                    (None, false) => {
                        return Err(TypeError::MissingRequired {
                            attribute: def.name.clone(),
                        })
                    }
                },
            };
            def.check(&value)?;
            resolved.insert(def.name.clone(), value);
        }
        Ok(resolved)
    }

    fn unknown(&self, name: &str) -> TypeError {
        TypeError::UnknownAttribute {
            kind: self.kind.to_string(),
            attribute: name.to_string(),
        }
    }
}
