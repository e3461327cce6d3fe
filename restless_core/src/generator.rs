use crate::resources::ResourceStore;
use crate::schema::{FieldType, InputSpec, MethodSpec, SchemaModel};
use rand::Rng;
use rand::seq::IndexedRandom;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Generated inputs for one invocation, keyed by input name.
pub type Payload = Map<String, JsonValue>;

/// Integers the generator favours, since services tend to mishandle them.
const INTEGER_BOUNDARIES: [i64; 9] = [
    0,
    1,
    -1,
    i64::MIN,
    i64::MAX,
    i32::MIN as i64,
    i32::MAX as i64,
    u32::MAX as i64,
    u16::MAX as i64,
];

const TOKEN_WORDS: [&str; 12] = [
    "alpha", "bravo", "widget", "server", "volume", "network", "admin", "test", "default",
    "public", "tenant", "node",
];

const ADVERSARIAL_STRINGS: [&str; 14] = [
    "",
    " ",
    "null",
    "None",
    "0",
    "-1",
    "../../../../etc/passwd",
    "' OR '1'='1",
    "%s%s%s%n",
    "<script>alert(1)</script>",
    "${jndi:ldap://localhost/a}",
    "\u{0}",
    "\u{202e}gnp.exe",
    "\u{1F600}\u{1F600}\u{1F600}",
];

/// Chance that a structured token is drawn from [`ADVERSARIAL_STRINGS`].
const ADVERSARIAL_TOKEN_PROBABILITY: f64 = 0.2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("Field '{field}' declares unknown type '{type_name}'")]
    UnknownType { field: String, type_name: String },

    #[error("List field '{0}' declares no item type")]
    MissingListItems(String),

    #[error("Field '{0}' is a resource reference without a resource kind")]
    MissingResourceKind(String),
}

/// Tunables for [`InputGenerator`]. Probabilities are in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorSettings {
    /// Chance of ignoring the declared type and emitting a value of another type.
    pub chaos_probability: f64,
    pub max_string_length: usize,
    pub max_list_length: usize,
    /// Minimum chance of reusing a registered identifier when one exists.
    pub reuse_probability: f64,
    /// Chance that an optional field is left out of its object.
    pub omit_optional_probability: f64,
    /// Chance that an integer is drawn from the boundary table instead of uniformly.
    pub boundary_probability: f64,
    /// Chance that a string is a short token rather than random bytes.
    pub structured_string_probability: f64,
    /// Nesting depth past which composites are generated empty.
    pub max_depth: usize,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            chaos_probability: 0.05,
            max_string_length: 256,
            max_list_length: 8,
            reuse_probability: 0.9,
            omit_optional_probability: 0.3,
            boundary_probability: 0.25,
            structured_string_probability: 0.6,
            max_depth: 6,
        }
    }
}

/// The shape of a generated JSON value, used to pick a different one in chaos mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    String,
    Integer,
    Float,
    Boolean,
    Null,
    List,
    Object,
}

const ALL_SHAPES: [Shape; 7] = [
    Shape::String,
    Shape::Integer,
    Shape::Float,
    Shape::Boolean,
    Shape::Null,
    Shape::List,
    Shape::Object,
];

/// A field type after named types have been looked up.
enum Resolved<'a> {
    Any,
    String,
    Integer,
    Boolean,
    Resource(&'a str),
    Object(&'a [InputSpec]),
    List(&'a InputSpec),
}

impl Resolved<'_> {
    fn shape(&self) -> Option<Shape> {
        match self {
            Resolved::Any => None,
            Resolved::String | Resolved::Resource(_) => Some(Shape::String),
            Resolved::Integer => Some(Shape::Integer),
            Resolved::Boolean => Some(Shape::Boolean),
            Resolved::Object(_) => Some(Shape::Object),
            Resolved::List(_) => Some(Shape::List),
        }
    }
}

/// Type-directed generator of adversarial inputs.
///
/// Reads the [`ResourceStore`] to reuse identifiers but never writes to it.
pub struct InputGenerator {
    schema: Arc<SchemaModel>,
    resources: Arc<ResourceStore>,
    settings: GeneratorSettings,
}

impl InputGenerator {
    pub fn new(
        schema: Arc<SchemaModel>,
        resources: Arc<ResourceStore>,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            schema,
            resources,
            settings,
        }
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    /// Resolves every input type of every method without generating anything, so a
    /// schema defect surfaces before the first request is sent.
    pub fn preflight(&self, schema: &SchemaModel) -> Result<(), GeneratorError> {
        let mut visited = HashSet::new();
        for method in schema.methods() {
            for input in &method.inputs {
                self.check(input, &mut visited)?;
            }
        }
        Ok(())
    }

    fn check<'a>(
        &'a self,
        spec: &'a InputSpec,
        visited: &mut HashSet<&'a str>,
    ) -> Result<(), GeneratorError> {
        if let Some(FieldType::Named(name)) = &spec.field_type {
            if !visited.insert(name.as_str()) {
                return Ok(());
            }
        }
        match self.resolve(spec)? {
            Resolved::Object(children) => {
                for child in children {
                    self.check(child, visited)?;
                }
                Ok(())
            }
            Resolved::List(items) => self.check(items, visited),
            _ => Ok(()),
        }
    }

    fn resolve<'a>(&'a self, spec: &'a InputSpec) -> Result<Resolved<'a>, GeneratorError> {
        let Some(field_type) = &spec.field_type else {
            return Ok(Resolved::Any);
        };
        Ok(match field_type {
            FieldType::String => Resolved::String,
            FieldType::Integer => Resolved::Integer,
            FieldType::Boolean => Resolved::Boolean,
            FieldType::Resource => {
                let kind = spec
                    .resource_kind
                    .as_deref()
                    .ok_or_else(|| GeneratorError::MissingResourceKind(spec.name.clone()))?;
                Resolved::Resource(kind)
            }
            FieldType::Object => Resolved::Object(&spec.children),
            FieldType::List => {
                let items = spec
                    .items
                    .as_deref()
                    .ok_or_else(|| GeneratorError::MissingListItems(spec.name.clone()))?;
                Resolved::List(items)
            }
            FieldType::Named(name) => match self.schema.named_type(name) {
                Some(fields) => Resolved::Object(fields),
                None => {
                    return Err(GeneratorError::UnknownType {
                        field: spec.name.clone(),
                        type_name: name.clone(),
                    });
                }
            },
        })
    }

    /// Generates one value for `spec`, descending into composites.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        spec: &InputSpec,
        rng: &mut R,
    ) -> Result<JsonValue, GeneratorError> {
        self.generate_at(spec, rng, 0)
    }

    /// Builds the full set of inputs for `method`.
    ///
    /// Optional inputs are sometimes omitted; path parameters are always present.
    pub fn generate_payload<R: Rng + ?Sized>(
        &self,
        method: &MethodSpec,
        rng: &mut R,
    ) -> Result<Payload, GeneratorError> {
        let path_params = method.path_parameters();
        let mut payload = Payload::new();
        for input in &method.inputs {
            let is_path_param = path_params.contains(&input.name.as_str());
            if !input.required && !is_path_param && self.omit(rng) {
                continue;
            }
            payload.insert(input.name.clone(), self.generate(input, rng)?);
        }
        Ok(payload)
    }

    fn omit<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        rng.random_bool(self.settings.omit_optional_probability)
    }

    fn generate_at<R: Rng + ?Sized>(
        &self,
        spec: &InputSpec,
        rng: &mut R,
        depth: usize,
    ) -> Result<JsonValue, GeneratorError> {
        let resolved = self.resolve(spec)?;

        if rng.random_bool(self.settings.chaos_probability) {
            let candidates: Vec<Shape> = ALL_SHAPES
                .iter()
                .copied()
                .filter(|shape| Some(*shape) != resolved.shape())
                .collect();
            if let Some(shape) = candidates.choose(rng) {
                return Ok(self.value_of_shape(*shape, rng, depth));
            }
        }

        Ok(match resolved {
            Resolved::Any => {
                let shape = ALL_SHAPES.choose(rng).copied().unwrap_or(Shape::Null);
                self.value_of_shape(shape, rng, depth)
            }
            Resolved::String => JsonValue::String(self.string_value(rng)),
            Resolved::Integer => JsonValue::from(self.integer_value(rng)),
            Resolved::Boolean => JsonValue::Bool(rng.random_bool(0.5)),
            Resolved::Resource(kind) => JsonValue::String(self.identifier_value(kind, rng)),
            Resolved::Object(children) => {
                let mut map = Map::new();
                if depth < self.settings.max_depth {
                    for child in children {
                        if !child.required && self.omit(rng) {
                            continue;
                        }
                        map.insert(child.name.clone(), self.generate_at(child, rng, depth + 1)?);
                    }
                }
                JsonValue::Object(map)
            }
            Resolved::List(items) => {
                let mut values = Vec::new();
                if depth < self.settings.max_depth {
                    let len = rng.random_range(0..=self.settings.max_list_length);
                    for _ in 0..len {
                        values.push(self.generate_at(items, rng, depth + 1)?);
                    }
                }
                JsonValue::Array(values)
            }
        })
    }

    fn string_value<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        if rng.random_bool(self.settings.structured_string_probability) {
            structured_token(rng)
        } else {
            random_bytes_lossy(rng, self.settings.max_string_length)
        }
    }

    fn integer_value<R: Rng + ?Sized>(&self, rng: &mut R) -> i64 {
        if rng.random_bool(self.settings.boundary_probability) {
            INTEGER_BOUNDARIES.choose(rng).copied().unwrap_or(0)
        } else {
            rng.random::<i64>()
        }
    }

    fn identifier_value<R: Rng + ?Sized>(&self, kind: &str, rng: &mut R) -> String {
        if rng.random_bool(self.settings.reuse_probability) {
            if let Some(id) = self.resources.pick(kind, rng) {
                return id;
            }
        }
        synthesize_identifier(rng)
    }

    fn value_of_shape<R: Rng + ?Sized>(&self, shape: Shape, rng: &mut R, depth: usize) -> JsonValue {
        match shape {
            Shape::String => JsonValue::String(self.string_value(rng)),
            Shape::Integer => JsonValue::from(self.integer_value(rng)),
            Shape::Float => JsonValue::from(rng.random_range(-1.0e9..1.0e9_f64)),
            Shape::Boolean => JsonValue::Bool(rng.random_bool(0.5)),
            Shape::Null => JsonValue::Null,
            Shape::List => {
                let len = rng.random_range(0..=self.settings.max_list_length.min(4));
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    values.push(JsonValue::String(self.string_value(rng)));
                }
                JsonValue::Array(values)
            }
            Shape::Object => {
                let mut map = Map::new();
                if depth < self.settings.max_depth && rng.random_bool(0.5) {
                    map.insert(structured_token(rng), JsonValue::String(self.string_value(rng)));
                }
                JsonValue::Object(map)
            }
        }
    }
}

fn structured_token<R: Rng + ?Sized>(rng: &mut R) -> String {
    if rng.random_bool(ADVERSARIAL_TOKEN_PROBABILITY) {
        return ADVERSARIAL_STRINGS
            .choose(rng)
            .map(|s| s.to_string())
            .unwrap_or_default();
    }
    let word = TOKEN_WORDS.choose(rng).copied().unwrap_or("token");
    let separator = ["-", "_", "."].choose(rng).copied().unwrap_or("-");
    format!("{word}{separator}{}", rng.random_range(0..100_000u32))
}

/// Random bytes of random length; invalid UTF-8 becomes U+FFFD instead of failing.
fn random_bytes_lossy<R: Rng + ?Sized>(rng: &mut R, max_len: usize) -> String {
    let len = rng.random_range(0..=max_len);
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// A well-formed identifier that is almost certainly unknown to the service.
fn synthesize_identifier<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string()
}
