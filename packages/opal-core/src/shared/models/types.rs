//! Record type declarations (`deftype`) and the type-level ownership graph
//!
//! Shape analysis decides which fields are `Weak`; the registry records the
//! result so codegen can emit `release_<Type>` functions that skip weak
//! fields.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::shared::models::Span;

/// Index of a `deftype` in the registry
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TypeId(pub u32);

/// Edge strength in the ownership graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldStrength {
    /// Contributes to the transitive free traversal of the owning value
    Strong,
    /// Nullified when the target is freed, never traversed
    Weak,
}

/// Declared field type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeRef {
    Int,
    Float,
    Char,
    Str,
    /// Any value (untyped slot)
    Any,
    /// Another `deftype` by name
    Named(String),
}

impl TypeRef {
    pub fn parse(name: &str) -> TypeRef {
        match name {
            "int" => TypeRef::Int,
            "float" => TypeRef::Float,
            "char" => TypeRef::Char,
            "str" | "string" => TypeRef::Str,
            "any" => TypeRef::Any,
            other => TypeRef::Named(other.to_string()),
        }
    }

    pub fn named(&self) -> Option<&str> {
        match self {
            TypeRef::Named(n) => Some(n),
            _ => None,
        }
    }
}

/// One declared field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: TypeRef,
    pub strength: FieldStrength,
    /// User wrote `^weak` on this field
    pub weak_annotated: bool,
}

/// One `deftype` declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    /// Any field's type mentions this type transitively
    pub is_recursive: bool,
    /// A field setter for this type appears somewhere in the program
    pub is_mutated: bool,
    pub span: Option<Span>,
}

impl TypeDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Fields that participate in the transitive free traversal
    pub fn strong_fields(&self) -> impl Iterator<Item = (usize, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.strength == FieldStrength::Strong)
    }

    pub fn has_weak_fields(&self) -> bool {
        self.fields.iter().any(|f| f.strength == FieldStrength::Weak)
    }
}

/// Ownership edge `T.f -> U`, one per record field whose type is a record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipEdge {
    pub from: TypeId,
    pub field_index: usize,
    pub to: TypeId,
    /// The field would otherwise close a cycle; declared or inferred `Weak`
    pub is_back_edge: bool,
}

/// Registry of all record types in a compilation unit
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TypeRegistry {
    types: Vec<TypeDef>,
    #[serde(skip)]
    by_name: FxHashMap<String, TypeId>,
    /// Filled by shape analysis
    pub ownership_edges: Vec<OwnershipEdge>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a declaration. Returns `None` when the name is taken.
    pub fn declare(&mut self, def: TypeDef) -> Option<TypeId> {
        if self.by_name.contains_key(&def.name) {
            return None;
        }
        let id = TypeId(self.types.len() as u32);
        self.by_name.insert(def.name.clone(), id);
        self.types.push(def);
        Some(id)
    }

    pub fn resolve(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: TypeId) -> &TypeDef {
        &self.types[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut TypeDef {
        &mut self.types[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeDef)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| (TypeId(i as u32), t))
    }

    /// Rebuild the name index after deserialization
    pub fn reindex(&mut self) {
        self.by_name = self
            .types
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), TypeId(i as u32)))
            .collect();
    }
}
