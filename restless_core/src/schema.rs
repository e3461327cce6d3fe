use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Structural defects found while loading a schema.
///
/// Every variant is fatal: a schema that fails validation never reaches the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Method name must not be empty")]
    EmptyMethodName,

    #[error("Method '{0}' is declared more than once")]
    DuplicateMethod(String),

    #[error("Field '{field}' is declared more than once in '{owner}'")]
    DuplicateField { owner: String, field: String },

    #[error("Field '{field}' in '{owner}' references undeclared type '{type_name}'")]
    UndeclaredType {
        owner: String,
        field: String,
        type_name: String,
    },

    #[error("Field '{field}' in '{owner}' is required but declares no type")]
    RequiredWithoutType { owner: String, field: String },

    #[error("Field '{field}' in '{owner}' is a resource reference without a resource kind")]
    MissingResourceKind { owner: String, field: String },

    #[error("List field '{field}' in '{owner}' declares no item type")]
    MissingListItems { owner: String, field: String },

    #[error("Method '{method}' path references undeclared parameter '{param}'")]
    UndeclaredPathParameter { method: String, param: String },

    #[error("Output '{output}' of method '{method}' has an invalid extraction rule: {reason}")]
    InvalidExtractionRule {
        method: String,
        output: String,
        reason: String,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVerb::Get => "GET",
            HttpVerb::Post => "POST",
            HttpVerb::Put => "PUT",
            HttpVerb::Patch => "PATCH",
            HttpVerb::Delete => "DELETE",
            HttpVerb::Head => "HEAD",
        }
    }

    /// Whether non-path inputs travel in a JSON body rather than the query string.
    pub fn carries_body(&self) -> bool {
        matches!(self, HttpVerb::Post | HttpVerb::Put | HttpVerb::Patch)
    }
}

impl fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The declared type of an input or output field.
///
/// Names outside the built-in vocabulary refer to composite types declared in the
/// schema's `types` table.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    String,
    Integer,
    Boolean,
    Resource,
    Object,
    List,
    Named(String),
}

impl FieldType {
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "string" | "str" => FieldType::String,
            "integer" | "int" => FieldType::Integer,
            "boolean" | "bool" => FieldType::Boolean,
            "resource" | "resource-reference" => FieldType::Resource,
            "object" => FieldType::Object,
            "list" | "array" => FieldType::List,
            other => FieldType::Named(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Resource => "resource",
            FieldType::Object => "object",
            FieldType::List => "list",
            FieldType::Named(name) => name,
        }
    }
}

impl From<String> for FieldType {
    fn from(value: String) -> Self {
        FieldType::from_name(&value)
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.name().to_string()
    }
}

/// One declared input of a method, possibly nested.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InputSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub resource_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<InputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<InputSpec>>,
}

impl InputSpec {
    fn typed(name: &str, field_type: Option<FieldType>) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: false,
            resource_kind: None,
            children: Vec::new(),
            items: None,
        }
    }

    pub fn string(name: &str) -> Self {
        Self::typed(name, Some(FieldType::String))
    }

    pub fn integer(name: &str) -> Self {
        Self::typed(name, Some(FieldType::Integer))
    }

    pub fn boolean(name: &str) -> Self {
        Self::typed(name, Some(FieldType::Boolean))
    }

    pub fn resource(name: &str, kind: &str) -> Self {
        let mut spec = Self::typed(name, Some(FieldType::Resource));
        spec.resource_kind = Some(kind.to_string());
        spec
    }

    pub fn object(name: &str, children: Vec<InputSpec>) -> Self {
        let mut spec = Self::typed(name, Some(FieldType::Object));
        spec.children = children;
        spec
    }

    pub fn list(name: &str, items: InputSpec) -> Self {
        let mut spec = Self::typed(name, Some(FieldType::List));
        spec.items = Some(Box::new(items));
        spec
    }

    pub fn named(name: &str, type_name: &str) -> Self {
        Self::typed(name, Some(FieldType::from_name(type_name)))
    }

    /// A field with no declared type; any JSON value is acceptable for it.
    pub fn untyped(name: &str) -> Self {
        Self::typed(name, None)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A parsed accessor into a JSON response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// Tagged accessor descriptor such as `data.items[0].id` or `servers[*].id`.
///
/// An empty rule (`""` or `"$"`) addresses the whole body.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct ExtractionRule {
    segments: Vec<PathSegment>,
}

impl ExtractionRule {
    pub fn key(name: &str) -> Self {
        Self {
            segments: vec![PathSegment::Key(name.to_string())],
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let trimmed = text.trim();
        let body = trimmed.strip_prefix('$').unwrap_or(trimmed);
        let body = body.strip_prefix('.').unwrap_or(body);
        let mut segments = Vec::new();
        if body.is_empty() {
            return Ok(Self { segments });
        }

        for part in body.split('.') {
            if part.is_empty() {
                return Err(format!("empty path segment in '{text}'"));
            }
            let (key, mut rest) = match part.find('[') {
                Some(idx) => (&part[..idx], &part[idx..]),
                None => (part, ""),
            };
            if !key.is_empty() {
                segments.push(PathSegment::Key(key.to_string()));
            }
            while !rest.is_empty() {
                let Some(open) = rest.strip_prefix('[') else {
                    return Err(format!("unexpected '{rest}' in '{text}'"));
                };
                let Some(close) = open.find(']') else {
                    return Err(format!("unterminated index in '{text}'"));
                };
                let inner = open[..close].trim();
                if inner == "*" {
                    segments.push(PathSegment::Wildcard);
                } else {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| format!("invalid index '{inner}' in '{text}'"))?;
                    segments.push(PathSegment::Index(index));
                }
                rest = &open[close + 1..];
            }
        }
        Ok(Self { segments })
    }

    /// Applies the rule to a parsed body, returning every value it addresses.
    pub fn evaluate<'a>(&self, body: &'a JsonValue) -> Vec<&'a JsonValue> {
        let mut current = vec![body];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in current {
                match segment {
                    PathSegment::Key(key) => next.extend(value.get(key.as_str())),
                    PathSegment::Index(index) => next.extend(value.get(*index)),
                    PathSegment::Wildcard => match value {
                        JsonValue::Array(items) => next.extend(items.iter()),
                        JsonValue::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                }
            }
            current = next;
        }
        current
    }
}

impl TryFrom<String> for ExtractionRule {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ExtractionRule::parse(&value)
    }
}

impl From<ExtractionRule> for String {
    fn from(value: ExtractionRule) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ExtractionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("$");
        }
        for (position, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if position == 0 => write!(f, "{key}")?,
                PathSegment::Key(key) => write!(f, ".{key}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
                PathSegment::Wildcard => f.write_str("[*]")?,
            }
        }
        Ok(())
    }
}

/// One declared output of a method.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_output_type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub resource_kind: Option<String>,
    #[serde(default)]
    pub extract: Option<ExtractionRule>,
}

fn default_output_type() -> FieldType {
    FieldType::String
}

impl OutputSpec {
    pub fn resource(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::Resource,
            resource_kind: Some(kind.to_string()),
            extract: None,
        }
    }

    pub fn with_rule(mut self, rule: ExtractionRule) -> Self {
        self.extract = Some(rule);
        self
    }

    /// The extraction rule, defaulting to a top-level key named after the output.
    pub fn rule(&self) -> ExtractionRule {
        self.extract
            .clone()
            .unwrap_or_else(|| ExtractionRule::key(&self.name))
    }

    /// The resource kind this output registers into, if it is a resource reference.
    pub fn registered_kind(&self) -> Option<&str> {
        match self.field_type {
            FieldType::Resource => self.resource_kind.as_deref(),
            _ => None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MethodSpec {
    pub name: String,
    pub verb: HttpVerb,
    pub path: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

impl MethodSpec {
    pub fn new(name: &str, verb: HttpVerb, path: &str) -> Self {
        Self {
            name: name.to_string(),
            verb,
            path: path.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|input| input.name == name)
    }

    /// Names of the `{placeholder}` segments in the path template, in order.
    pub fn path_parameters(&self) -> Vec<&str> {
        let mut params = Vec::new();
        let mut rest = self.path.as_str();
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                break;
            };
            params.push(after[..close].trim());
            rest = &after[close + 1..];
        }
        params
    }
}

/// On-disk shape of a schema, before validation.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SchemaDocument {
    #[serde(default)]
    pub methods: Vec<MethodSpec>,
    #[serde(default)]
    pub types: BTreeMap<String, Vec<InputSpec>>,
}

/// Validated, immutable collection of methods keyed by name.
#[derive(Debug, Clone)]
pub struct SchemaModel {
    methods: Vec<MethodSpec>,
    index: HashMap<String, usize>,
    types: BTreeMap<String, Vec<InputSpec>>,
}

impl SchemaModel {
    pub fn new(
        methods: Vec<MethodSpec>,
        types: BTreeMap<String, Vec<InputSpec>>,
    ) -> Result<Self, SchemaError> {
        Self::from_document(SchemaDocument { methods, types })
    }

    pub fn from_document(document: SchemaDocument) -> Result<Self, SchemaError> {
        let SchemaDocument { methods, types } = document;

        for (type_name, fields) in &types {
            validate_fields(type_name, fields, &types)?;
        }

        let mut index = HashMap::with_capacity(methods.len());
        for (position, method) in methods.iter().enumerate() {
            if method.name.trim().is_empty() {
                return Err(SchemaError::EmptyMethodName);
            }
            if index.insert(method.name.clone(), position).is_some() {
                return Err(SchemaError::DuplicateMethod(method.name.clone()));
            }
            validate_method(method, &types)?;
        }

        Ok(Self {
            methods,
            index,
            types,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, anyhow::Error> {
        let document: SchemaDocument = toml::from_str(text)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML schema: {}", e))?;
        Ok(Self::from_document(document)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, anyhow::Error> {
        let document: SchemaDocument = serde_json::from_str(text)
            .map_err(|e| anyhow::anyhow!("Failed to parse JSON schema: {}", e))?;
        Ok(Self::from_document(document)?)
    }

    /// Loads a schema file, picking JSON or TOML by extension.
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read schema file at {:?}: {}", path, e))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let loaded = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        };
        loaded.map_err(|e| anyhow::anyhow!("Invalid schema {:?}: {}", path, e))
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.index.get(name).map(|&position| &self.methods[position])
    }

    pub fn methods(&self) -> &[MethodSpec] {
        &self.methods
    }

    pub fn named_type(&self, name: &str) -> Option<&[InputSpec]> {
        self.types.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

fn validate_method(
    method: &MethodSpec,
    types: &BTreeMap<String, Vec<InputSpec>>,
) -> Result<(), SchemaError> {
    validate_fields(&method.name, &method.inputs, types)?;

    for param in method.path_parameters() {
        if method.input(param).is_none() {
            return Err(SchemaError::UndeclaredPathParameter {
                method: method.name.clone(),
                param: param.to_string(),
            });
        }
    }

    for output in &method.outputs {
        if let FieldType::Named(type_name) = &output.field_type {
            if !types.contains_key(type_name) {
                return Err(SchemaError::UndeclaredType {
                    owner: method.name.clone(),
                    field: output.name.clone(),
                    type_name: type_name.clone(),
                });
            }
        }
        if output.field_type == FieldType::Resource && output.resource_kind.is_none() {
            return Err(SchemaError::MissingResourceKind {
                owner: method.name.clone(),
                field: output.name.clone(),
            });
        }
        if let Some(rule) = &output.extract {
            if rule.segments().is_empty() && output.field_type == FieldType::Resource {
                return Err(SchemaError::InvalidExtractionRule {
                    method: method.name.clone(),
                    output: output.name.clone(),
                    reason: "a resource output must address a value inside the body".to_string(),
                });
            }
        }
    }
    Ok(())
}

fn validate_fields(
    owner: &str,
    fields: &[InputSpec],
    types: &BTreeMap<String, Vec<InputSpec>>,
) -> Result<(), SchemaError> {
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(field.name.as_str()) {
            return Err(SchemaError::DuplicateField {
                owner: owner.to_string(),
                field: field.name.clone(),
            });
        }
        validate_field(owner, field, types)?;
    }
    Ok(())
}

fn validate_field(
    owner: &str,
    field: &InputSpec,
    types: &BTreeMap<String, Vec<InputSpec>>,
) -> Result<(), SchemaError> {
    let Some(field_type) = &field.field_type else {
        if field.required {
            return Err(SchemaError::RequiredWithoutType {
                owner: owner.to_string(),
                field: field.name.clone(),
            });
        }
        return Ok(());
    };

    match field_type {
        FieldType::Resource if field.resource_kind.is_none() => {
            Err(SchemaError::MissingResourceKind {
                owner: owner.to_string(),
                field: field.name.clone(),
            })
        }
        FieldType::Object => {
            let nested_owner = format!("{owner}.{}", field.name);
            validate_fields(&nested_owner, &field.children, types)
        }
        FieldType::List => match &field.items {
            Some(items) => {
                let nested_owner = format!("{owner}.{}", field.name);
                validate_field(&nested_owner, items, types)
            }
            None => Err(SchemaError::MissingListItems {
                owner: owner.to_string(),
                field: field.name.clone(),
            }),
        },
        FieldType::Named(type_name) if !types.contains_key(type_name) => {
            Err(SchemaError::UndeclaredType {
                owner: owner.to_string(),
                field: field.name.clone(),
                type_name: type_name.clone(),
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn widget_method() -> MethodSpec {
        MethodSpec::new("create_widget", HttpVerb::Post, "/widgets")
            .with_input(InputSpec::string("name").required())
            .with_input(InputSpec::boolean("enabled"))
            .with_output(OutputSpec::resource("widget_id", "widget"))
    }

    #[test]
    fn valid_schema_exposes_methods_by_name() {
        let get = MethodSpec::new("get_widget", HttpVerb::Get, "/widgets/{widget_id}")
            .with_input(InputSpec::resource("widget_id", "widget").required());
        let schema = SchemaModel::new(vec![widget_method(), get], BTreeMap::new()).unwrap();

        assert_eq!(schema.len(), 2);
        assert_eq!(schema.method_names(), vec!["create_widget", "get_widget"]);
        let method = schema.method("get_widget").expect("method should be present");
        assert_eq!(method.verb, HttpVerb::Get);
        assert_eq!(method.path_parameters(), vec!["widget_id"]);
        assert!(schema.method("missing").is_none());
    }

    #[test]
    fn duplicate_method_names_are_rejected() {
        let result = SchemaModel::new(vec![widget_method(), widget_method()], BTreeMap::new());
        assert_eq!(
            result.unwrap_err(),
            SchemaError::DuplicateMethod("create_widget".to_string())
        );
    }

    #[test]
    fn undeclared_nested_type_is_rejected() {
        let method = MethodSpec::new("create_server", HttpVerb::Post, "/servers")
            .with_input(InputSpec::named("network", "NetworkSpec"));
        match SchemaModel::new(vec![method], BTreeMap::new()) {
            Err(SchemaError::UndeclaredType { type_name, .. }) => {
                assert_eq!(type_name, "NetworkSpec")
            }
            other => panic!("Expected UndeclaredType, got {other:?}"),
        }
    }

    #[test]
    fn misspelled_output_type_is_rejected() {
        let method = MethodSpec::new("create_widget", HttpVerb::Post, "/widgets").with_output(
            OutputSpec {
                name: "widget_id".to_string(),
                field_type: FieldType::Named("resourse".to_string()),
                resource_kind: Some("widget".to_string()),
                extract: None,
            },
        );
        match SchemaModel::new(vec![method], BTreeMap::new()) {
            Err(SchemaError::UndeclaredType { field, type_name, .. }) => {
                assert_eq!((field.as_str(), type_name.as_str()), ("widget_id", "resourse"))
            }
            other => panic!("Expected UndeclaredType, got {other:?}"),
        }
    }

    #[test]
    fn declared_nested_type_is_accepted() {
        let mut types = BTreeMap::new();
        types.insert(
            "NetworkSpec".to_string(),
            vec![InputSpec::string("cidr").required()],
        );
        let method = MethodSpec::new("create_server", HttpVerb::Post, "/servers")
            .with_input(InputSpec::named("network", "NetworkSpec"));
        let schema = SchemaModel::new(vec![method], types).unwrap();
        assert_eq!(schema.named_type("NetworkSpec").map(<[_]>::len), Some(1));
    }

    #[test]
    fn required_field_without_type_is_rejected() {
        let method = MethodSpec::new("m", HttpVerb::Post, "/m")
            .with_input(InputSpec::untyped("anything").required());
        assert!(matches!(
            SchemaModel::new(vec![method], BTreeMap::new()),
            Err(SchemaError::RequiredWithoutType { .. })
        ));
    }

    #[test]
    fn optional_untyped_field_is_accepted() {
        let method =
            MethodSpec::new("m", HttpVerb::Post, "/m").with_input(InputSpec::untyped("extra"));
        assert!(SchemaModel::new(vec![method], BTreeMap::new()).is_ok());
    }

    #[test]
    fn nested_undeclared_type_inside_list_is_rejected() {
        let method = MethodSpec::new("m", HttpVerb::Post, "/m").with_input(InputSpec::list(
            "rules",
            InputSpec::object("rule", vec![InputSpec::named("port", "PortRange")]),
        ));
        assert!(matches!(
            SchemaModel::new(vec![method], BTreeMap::new()),
            Err(SchemaError::UndeclaredType { .. })
        ));
    }

    #[test]
    fn path_parameter_must_be_declared() {
        let method = MethodSpec::new("get", HttpVerb::Get, "/widgets/{id}");
        assert!(matches!(
            SchemaModel::new(vec![method], BTreeMap::new()),
            Err(SchemaError::UndeclaredPathParameter { .. })
        ));
    }

    #[test]
    fn resource_fields_need_a_kind() {
        let mut input = InputSpec::resource("id", "widget");
        input.resource_kind = None;
        let method = MethodSpec::new("m", HttpVerb::Post, "/m").with_input(input);
        assert!(matches!(
            SchemaModel::new(vec![method], BTreeMap::new()),
            Err(SchemaError::MissingResourceKind { .. })
        ));
    }

    #[test]
    fn extraction_rule_parses_and_renders() {
        let rule = ExtractionRule::parse("$.data.items[*].id").unwrap();
        assert_eq!(
            rule.segments(),
            &[
                PathSegment::Key("data".into()),
                PathSegment::Key("items".into()),
                PathSegment::Wildcard,
                PathSegment::Key("id".into()),
            ]
        );
        assert_eq!(rule.to_string(), "data.items[*].id");
        assert!(ExtractionRule::parse("a..b").is_err());
        assert!(ExtractionRule::parse("a[1").is_err());
        assert!(ExtractionRule::parse("a[x]").is_err());
        assert!(ExtractionRule::parse("$").unwrap().segments().is_empty());
    }

    #[test]
    fn extraction_rule_evaluates_against_body() {
        let body = json!({"server": {"id": "s-1"}, "items": [{"id": 1}, {"id": 2}]});
        let single = ExtractionRule::parse("server.id").unwrap();
        assert_eq!(single.evaluate(&body), vec![&json!("s-1")]);

        let all = ExtractionRule::parse("items[*].id").unwrap();
        assert_eq!(all.evaluate(&body), vec![&json!(1), &json!(2)]);

        let indexed = ExtractionRule::parse("items[1].id").unwrap();
        assert_eq!(indexed.evaluate(&body), vec![&json!(2)]);

        let missing = ExtractionRule::parse("server.name").unwrap();
        assert!(missing.evaluate(&body).is_empty());
    }

    #[test]
    fn toml_document_round_trips_through_validation() {
        let text = r#"
            [[methods]]
            name = "create_widget"
            verb = "POST"
            path = "/widgets"

            [[methods.inputs]]
            name = "name"
            type = "string"
            required = true

            [[methods.inputs]]
            name = "spec"
            type = "WidgetSpec"

            [[methods.outputs]]
            name = "widget_id"
            type = "resource"
            resource-kind = "widget"
            extract = "widget.id"

            [[types.WidgetSpec]]
            name = "size"
            type = "integer"
        "#;
        let schema = SchemaModel::from_toml_str(text).unwrap();
        let method = schema.method("create_widget").unwrap();
        assert_eq!(method.inputs.len(), 2);
        assert_eq!(
            method.outputs[0].rule(),
            ExtractionRule::parse("widget.id").unwrap()
        );
        assert_eq!(method.outputs[0].registered_kind(), Some("widget"));
    }

    #[test]
    fn json_document_is_accepted() {
        let text = r#"{"methods": [{"name": "list", "verb": "GET", "path": "/things",
            "inputs": [{"name": "limit", "type": "integer"}]}]}"#;
        let schema = SchemaModel::from_json_str(text).unwrap();
        assert_eq!(
            schema.method("list").unwrap().inputs[0].field_type,
            Some(FieldType::Integer)
        );
    }

    proptest! {
        #[test]
        fn duplicate_names_always_rejected(names in proptest::collection::vec("[a-z]{1,6}", 1..8)) {
            let mut methods: Vec<MethodSpec> = names
                .iter()
                .map(|n| MethodSpec::new(n, HttpVerb::Get, "/x"))
                .collect();
            methods.push(MethodSpec::new(&names[0], HttpVerb::Post, "/y"));
            let result = SchemaModel::new(methods, BTreeMap::new());
            prop_assert!(matches!(result, Err(SchemaError::DuplicateMethod(_))));
        }

        #[test]
        fn undeclared_types_always_rejected(type_name in "[A-Z][a-zA-Z]{2,10}") {
            let method = MethodSpec::new("m", HttpVerb::Post, "/m")
                .with_input(InputSpec::named("field", &type_name));
            let result = SchemaModel::new(vec![method], BTreeMap::new());
            prop_assert!(
                matches!(result, Err(SchemaError::UndeclaredType { .. })),
                "unexpected result for type {}: {:?}", type_name, result
            );
        }
    }
}
