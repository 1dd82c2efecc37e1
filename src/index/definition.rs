use super::analyzers::{self, DEFAULT_ANALYZER};
use crate::error::{Result, SyncdexError};
use crate::types::IndexKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, STORED, STRING,
};
use tantivy::tokenizer::TokenizerManager;
use tantivy::{TantivyDocument, Term};

/// Name of the stored key field every repository schema carries.
pub const KEY_FIELD: &str = "_key";

/// Field name that indexes the whole entry value instead of a path into it.
/// Useful when the store holds plain strings.
pub const VALUE_FIELD: &str = "__value";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Dotted path into the entry value, e.g. `address.city`.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        FieldSpec {
            name: name.into(),
            analyzer: None,
        }
    }

    pub fn with_analyzer(name: impl Into<String>, analyzer: impl Into<String>) -> Self {
        FieldSpec {
            name: name.into(),
            analyzer: Some(analyzer.into()),
        }
    }

    pub fn analyzer(&self) -> &str {
        self.analyzer.as_deref().unwrap_or(DEFAULT_ANALYZER)
    }
}

/// What to index for one store. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub store: String,
    pub fields: Vec<FieldSpec>,
    /// Field used for unqualified query terms. First field when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_field: Option<String>,
}

impl IndexDefinition {
    pub fn builder(name: impl Into<String>, store: impl Into<String>) -> IndexDefinitionBuilder {
        IndexDefinitionBuilder {
            def: IndexDefinition {
                name: name.into(),
                store: store.into(),
                fields: Vec::new(),
                default_field: None,
            },
        }
    }

    pub fn key(&self) -> IndexKey {
        IndexKey::new(&self.name, &self.store)
    }

    pub fn default_field(&self) -> Option<&str> {
        self.default_field
            .as_deref()
            .or_else(|| self.fields.first().map(|f| f.name.as_str()))
    }

    pub fn validate(&self, tokenizers: &TokenizerManager) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SyncdexError::InvalidDefinition(
                "index name must not be empty".to_string(),
            ));
        }
        if self.store.trim().is_empty() {
            return Err(SyncdexError::InvalidDefinition(
                "store name must not be empty".to_string(),
            ));
        }
        if self.fields.is_empty() {
            return Err(SyncdexError::InvalidDefinition(format!(
                "index '{}' has no fields",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() || field.name == KEY_FIELD {
                return Err(SyncdexError::InvalidDefinition(format!(
                    "invalid field name '{}'",
                    field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SyncdexError::InvalidDefinition(format!(
                    "field '{}' listed twice",
                    field.name
                )));
            }
            if !analyzers::is_known(tokenizers, field.analyzer()) {
                return Err(SyncdexError::InvalidDefinition(format!(
                    "unknown analyzer '{}' on field '{}'",
                    field.analyzer(),
                    field.name
                )));
            }
        }
        if let Some(default) = &self.default_field {
            if !seen.contains(default.as_str()) {
                return Err(SyncdexError::InvalidDefinition(format!(
                    "default field '{}' is not an indexed field",
                    default
                )));
            }
        }
        Ok(())
    }

    /// Deterministic tantivy schema: `_key` first, then one text field per
    /// indexed field in definition order.
    pub fn schema(&self) -> IndexSchema {
        let mut builder = Schema::builder();
        let key_field = builder.add_text_field(KEY_FIELD, STRING | STORED);
        let mut fields = Vec::with_capacity(self.fields.len());
        for spec in &self.fields {
            let indexing = TextFieldIndexing::default()
                .set_tokenizer(spec.analyzer())
                .set_index_option(IndexRecordOption::WithFreqsAndPositions);
            let options = TextOptions::default().set_indexing_options(indexing);
            let field = builder.add_text_field(&spec.name, options);
            fields.push((spec.name.clone(), field));
        }
        IndexSchema {
            schema: builder.build(),
            key_field,
            fields,
        }
    }
}

pub struct IndexDefinitionBuilder {
    def: IndexDefinition,
}

impl IndexDefinitionBuilder {
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.def.fields.push(FieldSpec::new(name));
        self
    }

    pub fn field_with_analyzer(
        mut self,
        name: impl Into<String>,
        analyzer: impl Into<String>,
    ) -> Self {
        self.def.fields.push(FieldSpec::with_analyzer(name, analyzer));
        self
    }

    pub fn default_field(mut self, name: impl Into<String>) -> Self {
        self.def.default_field = Some(name.into());
        self
    }

    pub fn build(self) -> IndexDefinition {
        self.def
    }
}

/// A definition's tantivy schema plus resolved field handles.
#[derive(Clone)]
pub struct IndexSchema {
    pub schema: Schema,
    pub key_field: Field,
    fields: Vec<(String, Field)>,
}

impl IndexSchema {
    pub fn field(&self, name: &str) -> Option<Field> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| *f)
    }

    pub fn text_fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.fields.iter().map(|(_, f)| *f)
    }

    pub fn key_term(&self, key: &str) -> Term {
        Term::from_field_text(self.key_field, key)
    }

    /// Build the document indexed for `key`. Fields missing from the value
    /// are simply absent; the entry is still findable by key.
    pub fn to_document(&self, key: &str, value: &Value) -> TantivyDocument {
        let mut doc = TantivyDocument::default();
        doc.add_text(self.key_field, key);
        for (name, field) in &self.fields {
            let found = if name == VALUE_FIELD {
                Some(value)
            } else {
                lookup(value, name)
            };
            if let Some(v) = found {
                add_value(&mut doc, *field, v);
            }
        }
        doc
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(direct) = value.get(path) {
        return Some(direct);
    }
    let mut current = value;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn add_value(doc: &mut TantivyDocument, field: Field, value: &Value) {
    match value {
        Value::String(s) => doc.add_text(field, s),
        Value::Number(n) => doc.add_text(field, n.to_string()),
        Value::Bool(b) => doc.add_text(field, if *b { "true" } else { "false" }),
        Value::Array(items) => {
            for item in items {
                add_value(doc, field, item);
            }
        }
        Value::Object(_) | Value::Null => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tantivy::schema::Value as _;

    fn people() -> IndexDefinition {
        IndexDefinition::builder("people_idx", "people")
            .field("text")
            .field_with_analyzer("address.city", "simple")
            .build()
    }

    #[test]
    fn default_field_falls_back_to_first_field() {
        let def = people();
        assert_eq!(def.default_field(), Some("text"));
        def.validate(&analyzers::tokenizer_manager()).unwrap();
    }

    #[test]
    fn unknown_analyzer_is_rejected() {
        let def = IndexDefinition::builder("i", "s")
            .field_with_analyzer("text", "nope")
            .build();
        let err = def.validate(&analyzers::tokenizer_manager()).unwrap_err();
        assert_eq!(err.kind(), "invalid_definition");
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn default_field_must_be_indexed() {
        let def = IndexDefinition::builder("i", "s")
            .field("text")
            .default_field("other")
            .build();
        assert!(def.validate(&analyzers::tokenizer_manager()).is_err());
    }

    #[test]
    fn duplicate_and_reserved_fields_are_rejected() {
        let tokenizers = analyzers::tokenizer_manager();
        let dup = IndexDefinition::builder("i", "s").field("a").field("a").build();
        assert!(dup.validate(&tokenizers).is_err());
        let reserved = IndexDefinition::builder("i", "s").field(KEY_FIELD).build();
        assert!(reserved.validate(&tokenizers).is_err());
    }

    #[test]
    fn schema_is_deterministic() {
        let a = people().schema();
        let b = people().schema();
        assert_eq!(a.field("text"), b.field("text"));
        assert_eq!(a.field("address.city"), b.field("address.city"));
        assert!(a.field("missing").is_none());
    }

    #[test]
    fn document_follows_dotted_paths() {
        let schema = people().schema();
        let doc = schema.to_document(
            "7",
            &json!({"text": "hello", "address": {"city": "Lisbon"}, "age": 3}),
        );
        let key = doc.get_first(schema.key_field).and_then(|v| v.as_str());
        assert_eq!(key, Some("7"));
        let city_field = schema.field("address.city").unwrap();
        let city = doc.get_first(city_field).and_then(|v| v.as_str());
        assert_eq!(city, Some("Lisbon"));
    }

    #[test]
    fn whole_value_field_indexes_plain_strings() {
        let def = IndexDefinition::builder("i", "s").field(VALUE_FIELD).build();
        let schema = def.schema();
        let doc = schema.to_document("k", &json!("just a string"));
        let field = schema.field(VALUE_FIELD).unwrap();
        assert_eq!(
            doc.get_first(field).and_then(|v| v.as_str()),
            Some("just a string")
        );
    }
}
