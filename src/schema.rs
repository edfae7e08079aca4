//! Schema analysis and change tracking.
//!
//! The subscription root of a schema is flattened into a sorted list of
//! dotted leaf paths, and an [`Update`] is a bitmap over that list marking
//! which leaves changed. Because updates travel between cluster nodes, their
//! JSON form spells out the full field list so a receiving node can verify
//! that both sides analysed the same schema.

use std::sync::Arc;

use async_trait::async_trait;
use derive_more::{Display, Error};
use graphql_parser::{
    query,
    schema::{Definition, Document, ObjectType, Type, TypeDefinition},
};
use serde::{Deserialize, Serialize, Serializer};

use crate::{
    client_message::StartPayload,
    server_message::{DataPayload, GraphQLError},
};

/// The seam to the embedding GraphQL engine.
///
/// The transport parses query documents itself (it needs the AST to derive
/// subscription field sets), but execution and semantic validation belong to
/// the engine that owns the schema.
#[async_trait]
pub trait Schema: Send + Sync + 'static {
    /// The schema's SDL document. A server analyses this once at
    /// construction; the analysed form is immutable afterwards.
    fn document(&self) -> &Document<'static, String>;

    /// Executes one operation and returns its data and errors. Executor
    /// errors are results, not failures, which is why this is infallible.
    async fn execute(&self, payload: &StartPayload) -> DataPayload;

    /// Validates a parsed query document against the schema. The default
    /// accepts everything; engines wire their real validator here.
    fn validate(&self, _document: &query::Document<'_, String>) -> Result<(), GraphQLError> {
        Ok(())
    }
}

/// Errors from schema analysis and [`Update`] handling.
#[derive(Clone, Debug, Display, Error, PartialEq)]
pub enum SchemaError {
    /// A requested field is not part of the analysed subscription tree.
    #[display("field '{_0}' does not exist in the schema")]
    UnknownField(#[error(not(source))] String),

    /// An update refers to a different schema than the local one.
    #[display("update doesn't match schema")]
    Mismatch,

    /// Two leaves of the subscription tree flatten to the same dotted path.
    #[display("duplicate field path '{_0}' in the subscription schema")]
    DuplicateField(#[error(not(source))] String),

    /// An update payload could not be decoded at all.
    #[display("failed to decode update: {_0}")]
    InvalidJson(#[error(not(source))] String),
}

/// The analysed form of a schema: every scalar leaf reachable from the
/// subscription root as a sorted list of dotted paths, with stable indices
/// that [`Update`]s refer to.
#[derive(Clone, Debug)]
pub struct SchemaIndex {
    document: Document<'static, String>,
    fields: Arc<[String]>,
}

impl SchemaIndex {
    /// Flattens the document's subscription root. Object fields and
    /// list-of-object fields are recursed into; everything else terminates a
    /// dotted path. Analysing the same document twice yields identical field
    /// lists.
    pub fn analyse(document: &Document<'static, String>) -> Result<Self, SchemaError> {
        let mut fields = Vec::new();
        if let Some(root) = subscription_root(document) {
            collect_leaves(document, root, String::new(), &mut fields);
        }
        fields.sort();
        for pair in fields.windows(2) {
            if pair[0] == pair[1] {
                return Err(SchemaError::DuplicateField(pair[0].clone()));
            }
        }
        Ok(Self {
            document: document.clone(),
            fields: fields.into(),
        })
    }

    /// The sorted leaf paths of the subscription root.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Builds an update marking the given leaf paths as relevant.
    pub fn new_update<I, S>(&self, fields: I) -> Result<Update, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut update = Update::empty(self.fields.clone());
        for field in fields {
            let field = field.as_ref();
            let index = self
                .fields
                .binary_search_by(|candidate| candidate.as_str().cmp(field))
                .map_err(|_| SchemaError::UnknownField(field.into()))?;
            update.set(index);
        }
        Ok(update)
    }

    /// Builds an update covering every leaf reachable through the named
    /// object type. An object that appears at several positions under the
    /// subscription root contributes the leaves of all of them.
    pub fn update_from_object(&self, type_name: &str) -> Result<Update, SchemaError> {
        let mut fields = Vec::new();
        if let Some(root) = subscription_root(&self.document) {
            flatten_object(
                &self.document,
                root,
                type_name,
                String::new(),
                false,
                &mut fields,
            );
        }
        self.new_update(fields)
    }

    /// Reconstructs an update from its JSON form, verifying that the sender
    /// analysed the same schema: the entry list must match the local field
    /// list exactly, in length and in spelling.
    pub fn update_from_json(&self, data: &[u8]) -> Result<Update, SchemaError> {
        let wire: UpdateWire = serde_json::from_slice(data)
            .map_err(|error| SchemaError::InvalidJson(error.to_string()))?;
        if wire.schema.len() != self.fields.len() {
            return Err(SchemaError::Mismatch);
        }
        let mut update = Update::empty(self.fields.clone());
        for (index, entry) in wire.schema.iter().enumerate() {
            if entry.field != self.fields[index] {
                return Err(SchemaError::Mismatch);
            }
            if entry.relevant {
                update.set(index);
            }
        }
        Ok(update)
    }
}

/// A bitmap over a schema's analysed field set; bit `i` marks field `i` as
/// relevant. Updates are cheap to clone and compare, so front-loading the
/// analysis work keeps publish fan-out fast.
#[derive(Clone, Debug)]
pub struct Update {
    fields: Arc<[String]>,
    bitmap: Vec<u8>,
}

impl Update {
    fn empty(fields: Arc<[String]>) -> Self {
        Self {
            bitmap: vec![0; fields.len().div_ceil(8)],
            fields,
        }
    }

    fn set(&mut self, index: usize) {
        self.bitmap[index / 8] |= 1 << (index % 8);
    }

    /// Whether the field at `index` of the analysed field list is marked.
    pub fn relevant(&self, index: usize) -> bool {
        self.bitmap
            .get(index / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    /// True iff the two updates share at least one relevant field. Both
    /// operands must be built against the same analysed schema.
    pub fn overlaps(&self, other: &Update) -> Result<bool, SchemaError> {
        if !Arc::ptr_eq(&self.fields, &other.fields) && *self.fields != *other.fields {
            return Err(SchemaError::Mismatch);
        }
        Ok(self
            .bitmap
            .iter()
            .zip(&other.bitmap)
            .any(|(a, b)| a & b != 0))
    }
}

impl Serialize for Update {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        UpdateWireRef {
            schema: self
                .fields
                .iter()
                .enumerate()
                .map(|(index, field)| UpdateEntryRef {
                    field: field.as_str(),
                    relevant: self.relevant(index),
                })
                .collect(),
        }
        .serialize(serializer)
    }
}

#[derive(Serialize)]
struct UpdateWireRef<'a> {
    schema: Vec<UpdateEntryRef<'a>>,
}

#[derive(Serialize)]
struct UpdateEntryRef<'a> {
    field: &'a str,
    relevant: bool,
}

#[derive(Deserialize)]
struct UpdateWire {
    schema: Vec<UpdateEntry>,
}

#[derive(Deserialize)]
struct UpdateEntry {
    field: String,
    relevant: bool,
}

fn subscription_root<'d>(
    document: &'d Document<'static, String>,
) -> Option<&'d ObjectType<'static, String>> {
    let mut name = None;
    for definition in &document.definitions {
        if let Definition::SchemaDefinition(schema) = definition {
            if let Some(subscription) = &schema.subscription {
                name = Some(subscription.as_str());
            }
        }
    }
    object_type(document, name.unwrap_or("Subscription"))
}

fn object_type<'d>(
    document: &'d Document<'static, String>,
    name: &str,
) -> Option<&'d ObjectType<'static, String>> {
    document.definitions.iter().find_map(|definition| match definition {
        Definition::TypeDefinition(TypeDefinition::Object(object)) if object.name == name => {
            Some(object)
        }
        _ => None,
    })
}

/// Resolves a field type to the object type it should recurse into, if any.
/// Objects and lists of objects recurse; scalars, enums, and lists of scalars
/// terminate the path.
fn object_of_type<'d>(
    document: &'d Document<'static, String>,
    field_type: &Type<'static, String>,
) -> Option<&'d ObjectType<'static, String>> {
    match field_type {
        Type::NamedType(name) => object_type(document, name),
        Type::ListType(inner) | Type::NonNullType(inner) => object_of_type(document, inner),
    }
}

fn collect_leaves(
    document: &Document<'static, String>,
    object: &ObjectType<'static, String>,
    prefix: String,
    out: &mut Vec<String>,
) {
    for field in &object.fields {
        let path = format!("{prefix}{}", field.name);
        match object_of_type(document, &field.field_type) {
            Some(child) => collect_leaves(document, child, format!("{path}."), out),
            None => out.push(path),
        }
    }
}

fn flatten_object(
    document: &Document<'static, String>,
    object: &ObjectType<'static, String>,
    target: &str,
    prefix: String,
    active: bool,
    out: &mut Vec<String>,
) {
    // passing the flag by value restores it on exit, so an object nested
    // under the target stays active while its siblings do not
    let active = active || object.name == target;
    for field in &object.fields {
        let path = format!("{prefix}{}", field.name);
        match object_of_type(document, &field.field_type) {
            Some(child) => {
                flatten_object(document, child, target, format!("{path}."), active, out)
            }
            None => {
                if active {
                    out.push(path);
                }
            }
        }
    }
}
