//! Read-only entity metadata.
//!
//! The tracker consumes a small description of each entity type: its
//! scalar properties, keys, foreign keys and the navigations those foreign
//! keys expose. Descriptors are assembled with builder methods and frozen by
//! [`ModelBuilder::build`], which resolves indices and cross references once.

use crate::error::{Error, ModelErrorKind, Result};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// When the store produces a value for a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueGenerated {
    /// Never; the client always supplies the value.
    #[default]
    Never,
    /// On insert (identity columns, defaults).
    OnAdd,
    /// On insert and on every update (computed columns, row versions).
    OnAddOrUpdate,
}

/// How changes to instances of an entity type are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeTrackingStrategy {
    /// Diff current values against snapshots taken when tracking started.
    #[default]
    Snapshot,
    /// The host reports `property_changed`; snapshots are still taken eagerly.
    ChangedNotifications,
    /// The host reports `property_changing` and `property_changed`;
    /// snapshots are taken lazily from the changing notification.
    ChangingAndChangedNotifications,
}

/// What happens to tracked dependents when their principal is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteBehavior {
    /// Removing a principal with live dependents is an error.
    #[default]
    Restrict,
    /// Dependents are removed too.
    Cascade,
    /// Dependent foreign key properties are set to NULL.
    SetNull,
}

/// Metadata about one scalar property.
#[derive(Debug, Clone)]
pub struct PropertyInfo {
    /// Property name as exposed by the entity
    pub name: &'static str,
    /// Database column name
    pub column_name: &'static str,
    /// Whether NULL is a legal value
    pub nullable: bool,
    /// Whether the original value is used as an update/delete predicate
    pub concurrency_token: bool,
    /// When the store generates this value
    pub value_generated: ValueGenerated,
    /// Whether a client-side generator must produce a value on add
    pub requires_value_generator: bool,
    /// The "not yet set" value of the property type (e.g. `Int(0)`)
    pub default_value: Value,
    index: usize,
    original_value_index: Option<usize>,
    is_primary_key: bool,
    is_key: bool,
    is_foreign_key: bool,
}

impl PropertyInfo {
    /// Create a property whose column has the same name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            column_name: name,
            nullable: false,
            concurrency_token: false,
            value_generated: ValueGenerated::Never,
            requires_value_generator: false,
            default_value: Value::Null,
            index: 0,
            original_value_index: None,
            is_primary_key: false,
            is_key: false,
            is_foreign_key: false,
        }
    }

    /// Set the database column name.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column_name = name;
        self
    }

    /// Set nullability.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Mark as an optimistic concurrency token.
    pub const fn concurrency_token(mut self) -> Self {
        self.concurrency_token = true;
        self
    }

    /// Set when the store generates the value.
    pub const fn generated(mut self, when: ValueGenerated) -> Self {
        self.value_generated = when;
        self
    }

    /// Require a client-side value generator on add.
    pub const fn with_value_generator(mut self) -> Self {
        self.requires_value_generator = true;
        self
    }

    /// Set the type default (the value meaning "not set yet").
    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = value.into();
        self
    }

    /// Position of this property in its entity type.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Slot in the original-values sidecar, if originals are tracked.
    pub fn original_value_index(&self) -> Option<usize> {
        self.original_value_index
    }

    pub fn is_primary_key(&self) -> bool {
        self.is_primary_key
    }

    /// Part of the primary key or an alternate key.
    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn is_foreign_key(&self) -> bool {
        self.is_foreign_key
    }

    /// Whether a value must be generated or propagated when the entity is added.
    pub fn requires_value_generation(&self) -> bool {
        self.requires_value_generator || self.value_generated != ValueGenerated::Never
    }

    /// Whether `value` still means "not set" for this property.
    pub fn is_default(&self, value: &Value) -> bool {
        value.is_null() || *value == self.default_value
    }

    pub fn is_store_generated_on_add(&self) -> bool {
        self.value_generated != ValueGenerated::Never
    }

    pub fn is_store_generated_on_update(&self) -> bool {
        self.value_generated == ValueGenerated::OnAddOrUpdate
    }
}

/// A primary or alternate key.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub name: &'static str,
    pub properties: Vec<&'static str>,
    pub is_primary: bool,
}

impl KeyInfo {
    pub fn contains(&self, property: &str) -> bool {
        self.properties.iter().any(|p| *p == property)
    }
}

/// A foreign key declared on the dependent entity type.
#[derive(Debug, Clone)]
pub struct ForeignKeyInfo {
    pub name: &'static str,
    /// Dependent properties, in principal-key order
    pub properties: Vec<&'static str>,
    pub principal_type: &'static str,
    /// Principal key name; `None` selects the principal's primary key
    pub principal_key: Option<&'static str>,
    pub delete_behavior: DeleteBehavior,
    /// Reference navigation on the dependent pointing at the principal
    pub dependent_to_principal: Option<&'static str>,
    /// Navigation on the principal pointing at its dependents
    pub principal_to_dependent: Option<&'static str>,
    /// One-to-one: the principal navigation is a reference, not a collection
    pub unique: bool,
    required: bool,
}

impl ForeignKeyInfo {
    pub fn new(
        name: &'static str,
        properties: &[&'static str],
        principal_type: &'static str,
    ) -> Self {
        Self {
            name,
            properties: properties.to_vec(),
            principal_type,
            principal_key: None,
            delete_behavior: DeleteBehavior::Restrict,
            dependent_to_principal: None,
            principal_to_dependent: None,
            unique: false,
            required: false,
        }
    }

    /// Reference navigation from dependent to principal.
    #[must_use]
    pub fn navigation(mut self, name: &'static str) -> Self {
        self.dependent_to_principal = Some(name);
        self
    }

    /// Navigation from principal to dependents.
    #[must_use]
    pub fn inverse(mut self, name: &'static str) -> Self {
        self.principal_to_dependent = Some(name);
        self
    }

    /// Target an alternate key of the principal.
    #[must_use]
    pub fn principal_key(mut self, key: &'static str) -> Self {
        self.principal_key = Some(key);
        self
    }

    #[must_use]
    pub fn on_delete(mut self, behavior: DeleteBehavior) -> Self {
        self.delete_behavior = behavior;
        self
    }

    /// Make the relationship one-to-one.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Whether every dependent property is non-nullable.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Name of the principal key after model resolution.
    pub fn principal_key_name(&self) -> &'static str {
        self.principal_key.unwrap_or(PRIMARY_KEY_NAME)
    }
}

const PRIMARY_KEY_NAME: &str = "PK";

/// A navigation exposed by a foreign key.
#[derive(Debug, Clone)]
pub struct NavigationInfo {
    pub name: &'static str,
    pub target_type: &'static str,
    pub is_collection: bool,
    /// Foreign key backing this navigation
    pub foreign_key: &'static str,
    /// Entity type declaring `foreign_key`
    pub foreign_key_owner: &'static str,
    /// True on the dependent side (the navigation points at the principal)
    pub points_to_principal: bool,
}

/// A scalar property or a navigation.
#[derive(Debug, Clone, Copy)]
pub enum PropertyBase<'a> {
    Scalar(&'a PropertyInfo),
    Navigation(&'a NavigationInfo),
}

impl PropertyBase<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            PropertyBase::Scalar(p) => p.name,
            PropertyBase::Navigation(n) => n.name,
        }
    }
}

/// Metadata about one entity type.
#[derive(Debug, Clone)]
pub struct EntityType {
    name: &'static str,
    table: &'static str,
    schema: Option<&'static str>,
    properties: Vec<PropertyInfo>,
    keys: Vec<KeyInfo>,
    foreign_keys: Vec<ForeignKeyInfo>,
    navigations: Vec<NavigationInfo>,
    strategy: ChangeTrackingStrategy,
    property_index: HashMap<&'static str, usize>,
    original_value_count: usize,
}

impl EntityType {
    /// Create an entity type mapped to a table of the same name.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            table: name,
            schema: None,
            properties: Vec::new(),
            keys: Vec::new(),
            foreign_keys: Vec::new(),
            navigations: Vec::new(),
            strategy: ChangeTrackingStrategy::Snapshot,
            property_index: HashMap::new(),
            original_value_count: 0,
        }
    }

    #[must_use]
    pub fn table(mut self, table: &'static str) -> Self {
        self.table = table;
        self
    }

    #[must_use]
    pub fn schema(mut self, schema: &'static str) -> Self {
        self.schema = Some(schema);
        self
    }

    #[must_use]
    pub fn property(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    #[must_use]
    pub fn primary_key(mut self, properties: &[&'static str]) -> Self {
        self.keys.retain(|k| !k.is_primary);
        self.keys.insert(
            0,
            KeyInfo {
                name: PRIMARY_KEY_NAME,
                properties: properties.to_vec(),
                is_primary: true,
            },
        );
        self
    }

    #[must_use]
    pub fn alternate_key(mut self, name: &'static str, properties: &[&'static str]) -> Self {
        self.keys.push(KeyInfo {
            name,
            properties: properties.to_vec(),
            is_primary: false,
        });
        self
    }

    #[must_use]
    pub fn foreign_key(mut self, foreign_key: ForeignKeyInfo) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    #[must_use]
    pub fn change_tracking(mut self, strategy: ChangeTrackingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn table_name(&self) -> &'static str {
        self.table
    }

    pub fn schema_name(&self) -> Option<&'static str> {
        self.schema
    }

    pub fn properties(&self) -> &[PropertyInfo] {
        &self.properties
    }

    pub fn property_named(&self, name: &str) -> Option<&PropertyInfo> {
        self.property_index.get(name).map(|&i| &self.properties[i])
    }

    /// The primary key. Always present once the model is built.
    pub fn primary_key_info(&self) -> &KeyInfo {
        &self.keys[0]
    }

    /// Primary key first, then alternate keys.
    pub fn keys(&self) -> &[KeyInfo] {
        &self.keys
    }

    pub fn key_named(&self, name: &str) -> Option<&KeyInfo> {
        self.keys.iter().find(|k| k.name == name)
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyInfo] {
        &self.foreign_keys
    }

    pub fn foreign_key_named(&self, name: &str) -> Option<&ForeignKeyInfo> {
        self.foreign_keys.iter().find(|fk| fk.name == name)
    }

    pub fn navigations(&self) -> &[NavigationInfo] {
        &self.navigations
    }

    pub fn navigation_named(&self, name: &str) -> Option<&NavigationInfo> {
        self.navigations.iter().find(|n| n.name == name)
    }

    /// Look up a scalar property or navigation by name.
    pub fn member(&self, name: &str) -> Option<PropertyBase<'_>> {
        self.property_named(name)
            .map(PropertyBase::Scalar)
            .or_else(|| self.navigation_named(name).map(PropertyBase::Navigation))
    }

    pub fn keys_containing<'a>(&'a self, property: &'a str) -> impl Iterator<Item = &'a KeyInfo> {
        self.keys.iter().filter(move |k| k.contains(property))
    }

    pub fn foreign_keys_containing<'a>(
        &'a self,
        property: &'a str,
    ) -> impl Iterator<Item = &'a ForeignKeyInfo> {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.properties.iter().any(|p| *p == property))
    }

    pub fn strategy(&self) -> ChangeTrackingStrategy {
        self.strategy
    }

    /// Whether scalar changes are reported by the host instead of diffed.
    pub fn has_change_notifications(&self) -> bool {
        self.strategy != ChangeTrackingStrategy::Snapshot
    }

    /// Whether snapshots must be taken as soon as tracking starts.
    pub fn uses_eager_snapshots(&self) -> bool {
        self.strategy != ChangeTrackingStrategy::ChangingAndChangedNotifications
    }

    /// Number of slots needed in the original-values sidecar.
    pub fn original_value_count(&self) -> usize {
        self.original_value_count
    }

    /// Whether any member needs a relationship snapshot.
    pub fn needs_relationship_snapshot(&self) -> bool {
        !self.keys.is_empty() || !self.foreign_keys.is_empty() || !self.navigations.is_empty()
    }

    fn resolve_properties(&mut self) -> Result<()> {
        if self.keys.first().is_none_or(|k| !k.is_primary) {
            return Err(self.invalid("entity type has no primary key"));
        }

        self.property_index = self
            .properties
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name, i))
            .collect();
        if self.property_index.len() != self.properties.len() {
            return Err(self.invalid("duplicate property name"));
        }

        let mut missing = None;
        for name in self
            .keys
            .iter()
            .flat_map(|k| k.properties.iter())
            .chain(self.foreign_keys.iter().flat_map(|fk| fk.properties.iter()))
        {
            if !self.property_index.contains_key(name) {
                missing = Some(*name);
            }
        }
        if let Some(name) = missing {
            return Err(self.invalid(format!("key references unknown property '{name}'")));
        }

        let snapshot_all = self.strategy == ChangeTrackingStrategy::Snapshot;
        let mut next_original = 0;
        for (i, property) in self.properties.iter_mut().enumerate() {
            property.index = i;
            property.is_primary_key = self.keys[0].contains(property.name);
            property.is_key = self.keys.iter().any(|k| k.contains(property.name));
            property.is_foreign_key = self
                .foreign_keys
                .iter()
                .any(|fk| fk.properties.contains(&property.name));
            // Notification types only need originals for predicates and keys.
            let tracks_original = snapshot_all || property.concurrency_token || property.is_key;
            property.original_value_index = tracks_original.then(|| {
                let slot = next_original;
                next_original += 1;
                slot
            });
        }
        self.original_value_count = next_original;

        for fk in &mut self.foreign_keys {
            fk.required = fk
                .properties
                .iter()
                .all(|p| !self.properties[self.property_index[p]].nullable);
        }
        Ok(())
    }

    fn invalid(&self, message: impl Into<String>) -> Error {
        Error::model(ModelErrorKind::InvalidModel, Some(self.name), message)
    }
}

/// A frozen set of entity types.
#[derive(Debug, Clone, Default)]
pub struct Model {
    entity_types: Vec<Arc<EntityType>>,
    by_name: HashMap<&'static str, usize>,
    /// principal type -> (dependent type, foreign key name)
    referencing: HashMap<&'static str, Vec<(&'static str, &'static str)>>,
}

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    pub fn entity_type(&self, name: &str) -> Option<&Arc<EntityType>> {
        self.by_name.get(name).map(|&i| &self.entity_types[i])
    }

    /// Like [`Model::entity_type`] but with a model error for unknown names.
    pub fn find_entity_type(&self, name: &str) -> Result<&Arc<EntityType>> {
        self.entity_type(name).ok_or_else(|| {
            Error::model(
                ModelErrorKind::UnknownEntityType,
                None,
                format!("entity type '{name}' is not part of the model"),
            )
        })
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.entity_types.iter()
    }

    /// Foreign keys whose principal is `principal_type`.
    pub fn referencing_foreign_keys<'a>(
        &'a self,
        principal_type: &str,
    ) -> impl Iterator<Item = (&'a Arc<EntityType>, &'a ForeignKeyInfo)> + use<'a> {
        self.referencing
            .get(principal_type)
            .into_iter()
            .flatten()
            .filter_map(|(dependent, fk)| {
                let dependent = self.entity_type(dependent)?;
                let fk = dependent.foreign_key_named(fk)?;
                Some((dependent, fk))
            })
    }
}

/// Collects entity types and resolves them into a [`Model`].
#[derive(Debug, Default)]
pub struct ModelBuilder {
    entity_types: Vec<EntityType>,
}

impl ModelBuilder {
    #[must_use]
    pub fn entity(mut self, entity_type: EntityType) -> Self {
        self.entity_types.push(entity_type);
        self
    }

    /// Validate keys and relationships and derive navigations.
    pub fn build(self) -> Result<Model> {
        let mut types = self.entity_types;
        for et in &mut types {
            et.resolve_properties()?;
        }

        let by_name: HashMap<&'static str, usize> =
            types.iter().enumerate().map(|(i, et)| (et.name, i)).collect();
        if by_name.len() != types.len() {
            return Err(Error::model(
                ModelErrorKind::InvalidModel,
                None,
                "duplicate entity type name",
            ));
        }

        let mut referencing: HashMap<&'static str, Vec<(&'static str, &'static str)>> =
            HashMap::new();
        let mut inverse_navigations = Vec::new();
        for et in &types {
            for fk in &et.foreign_keys {
                let Some(&principal_index) = by_name.get(fk.principal_type) else {
                    return Err(et.invalid(format!(
                        "foreign key '{}' targets unknown entity type '{}'",
                        fk.name, fk.principal_type
                    )));
                };
                let principal = &types[principal_index];
                let Some(key) = principal.key_named(fk.principal_key_name()) else {
                    return Err(et.invalid(format!(
                        "foreign key '{}' targets unknown key '{}' on '{}'",
                        fk.name,
                        fk.principal_key_name(),
                        principal.name
                    )));
                };
                if key.properties.len() != fk.properties.len() {
                    return Err(et.invalid(format!(
                        "foreign key '{}' has {} properties but principal key has {}",
                        fk.name,
                        fk.properties.len(),
                        key.properties.len()
                    )));
                }
                referencing
                    .entry(principal.name)
                    .or_default()
                    .push((et.name, fk.name));
                if let Some(name) = fk.principal_to_dependent {
                    inverse_navigations.push((
                        principal_index,
                        NavigationInfo {
                            name,
                            target_type: et.name,
                            is_collection: !fk.unique,
                            foreign_key: fk.name,
                            foreign_key_owner: et.name,
                            points_to_principal: false,
                        },
                    ));
                }
            }
        }

        for et in &mut types {
            let owned: Vec<NavigationInfo> = et
                .foreign_keys
                .iter()
                .filter_map(|fk| {
                    fk.dependent_to_principal.map(|name| NavigationInfo {
                        name,
                        target_type: fk.principal_type,
                        is_collection: false,
                        foreign_key: fk.name,
                        foreign_key_owner: et.name,
                        points_to_principal: true,
                    })
                })
                .collect();
            et.navigations = owned;
        }
        for (index, navigation) in inverse_navigations {
            types[index].navigations.push(navigation);
        }

        tracing::debug!(
            entity_types = types.len(),
            foreign_keys = types.iter().map(|et| et.foreign_keys.len()).sum::<usize>(),
            "Model built"
        );
        Ok(Model {
            entity_types: types.into_iter().map(Arc::new).collect(),
            by_name,
            referencing,
        })
    }
}
