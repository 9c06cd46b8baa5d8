//! Value generation for Added entries.
//!
//! Before an Added entry can be written, every property that needs a
//! generated value and still holds its default receives one, either
//! propagated from the principal on the other side of a foreign key or
//! produced by a per-property [`ValueGenerator`]. Placeholder values are
//! flagged temporary; the store's real value replaces them on read-back.

use crate::state_manager::{StateManager, WriteKind};
use sqltrack_core::{EntityState, EntityType, EntryId, Error, ModelErrorKind, PropertyInfo, Result, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Produces values for one property.
pub trait ValueGenerator: Send {
    /// Next value, shaped after `template` (the property's current value).
    /// `None` means the generator is exhausted.
    fn next(&mut self, template: &Value) -> Option<Value>;

    /// Whether produced values are placeholders the store will overwrite.
    fn generates_temporary_values(&self) -> bool;
}

/// Counts down from -1. Used for store-generated keys until the store
/// assigns the real value.
#[derive(Debug, Default)]
pub struct TemporaryValueGenerator {
    current: i64,
}

impl ValueGenerator for TemporaryValueGenerator {
    fn next(&mut self, template: &Value) -> Option<Value> {
        self.current = self.current.checked_sub(1)?;
        template.integer_like(self.current)
    }

    fn generates_temporary_values(&self) -> bool {
        true
    }
}

/// Client-side counter producing permanent values.
#[derive(Debug)]
pub struct SequenceValueGenerator {
    next: i64,
}

impl SequenceValueGenerator {
    pub fn new(start: i64) -> Self {
        Self { next: start }
    }
}

impl Default for SequenceValueGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ValueGenerator for SequenceValueGenerator {
    fn next(&mut self, template: &Value) -> Option<Value> {
        let value = template.integer_like(self.next)?;
        self.next = self.next.checked_add(1)?;
        Some(value)
    }

    fn generates_temporary_values(&self) -> bool {
        false
    }
}

/// Per-property generator registry.
///
/// Properties without a registered generator get a default one on first
/// use: store-generated properties a [`TemporaryValueGenerator`], properties
/// that only require a client generator a [`SequenceValueGenerator`].
#[derive(Default)]
pub struct ValueGenerationManager {
    generators: HashMap<(&'static str, &'static str), Box<dyn ValueGenerator>>,
}

impl std::fmt::Debug for ValueGenerationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueGenerationManager")
            .field("generators", &self.generators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ValueGenerationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `generator` for `entity_type.property`.
    pub fn register(
        &mut self,
        entity_type: &'static str,
        property: &'static str,
        generator: impl ValueGenerator + 'static,
    ) {
        self.generators
            .insert((entity_type, property), Box::new(generator));
    }

    pub fn generator_for(
        &mut self,
        entity_type: &EntityType,
        property: &PropertyInfo,
    ) -> Option<&mut Box<dyn ValueGenerator>> {
        let key = (entity_type.name(), property.name);
        if !self.generators.contains_key(&key) {
            let generator: Box<dyn ValueGenerator> = if property.is_store_generated_on_add() {
                Box::new(TemporaryValueGenerator::default())
            } else if property.requires_value_generator {
                Box::new(SequenceValueGenerator::default())
            } else {
                return None;
            };
            self.generators.insert(key, generator);
        }
        self.generators.get_mut(&key)
    }
}

impl StateManager {
    /// Register a generator for one property.
    pub fn register_value_generator(
        &mut self,
        entity_type: &'static str,
        property: &'static str,
        generator: impl ValueGenerator + 'static,
    ) {
        self.value_generation.register(entity_type, property, generator);
    }

    /// Assign generated or propagated values to an entry's unset properties.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn generate_values(&mut self, id: EntryId) -> Result<()> {
        let et = Arc::clone(self.try_entry(id)?.entity_type());
        for property in et
            .properties()
            .iter()
            .filter(|p| p.requires_value_generation())
        {
            let current = self.try_entry(id)?.current_value(property);
            if !property.is_default(&current) {
                continue;
            }

            if property.is_foreign_key() {
                if let Some((value, temporary)) = self.propagated_value(id, &et, property) {
                    tracing::trace!(entry = %id, property = property.name, value = %value, "Propagated value");
                    self.write_property(id, property, value, WriteKind::Generated { temporary })?;
                    continue;
                }
            }

            let Some(generator) = self.value_generation.generator_for(&et, property) else {
                continue;
            };
            let temporary = generator.generates_temporary_values();
            let value = generator.next(&current).ok_or_else(|| {
                Error::model(
                    ModelErrorKind::InvalidModel,
                    Some(et.name()),
                    format!("value generator for '{}' produced no value", property.name),
                )
            })?;
            tracing::trace!(
                entry = %id,
                property = property.name,
                value = %value,
                temporary,
                "Generated value"
            );
            self.write_property(id, property, value, WriteKind::Generated { temporary })?;
        }
        Ok(())
    }

    /// Re-run generation for every Added entry whose values are still unset.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn generate_pending_values(&mut self) -> Result<()> {
        let added: Vec<EntryId> = self
            .entries()
            .filter(|e| e.state() == EntityState::Added)
            .map(|e| e.id())
            .collect();
        for id in added {
            self.generate_values(id)?;
        }
        Ok(())
    }

    fn propagated_value(
        &self,
        id: EntryId,
        et: &EntityType,
        property: &PropertyInfo,
    ) -> Option<(Value, bool)> {
        for fk in et.foreign_keys_containing(property.name) {
            let Some(principal) = self.find_principal(id, fk).and_then(|p| self.entry(p)) else {
                continue;
            };
            let principal_type = principal.entity_type();
            let key = principal_type.key_named(fk.principal_key_name())?;
            let position = fk.properties.iter().position(|p| *p == property.name)?;
            let source = principal_type.property_named(key.properties.get(position)?)?;
            let value = principal.current_value(source);
            if !value.is_null() {
                return Some((value, principal.is_temporary(source)));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_values_count_down_and_keep_width() {
        let mut generator = TemporaryValueGenerator::default();
        assert!(generator.generates_temporary_values());
        assert_eq!(generator.next(&Value::Null), Some(Value::BigInt(-1)));
        assert_eq!(generator.next(&Value::Int(0)), Some(Value::Int(-2)));
    }

    #[test]
    fn sequence_values_are_permanent() {
        let mut generator = SequenceValueGenerator::new(10);
        assert!(!generator.generates_temporary_values());
        assert_eq!(generator.next(&Value::Null), Some(Value::BigInt(10)));
        assert_eq!(generator.next(&Value::Null), Some(Value::BigInt(11)));
    }

    #[test]
    fn sequence_reports_exhaustion_for_narrow_types() {
        let mut generator = SequenceValueGenerator::new(200);
        assert_eq!(generator.next(&Value::TinyInt(0)), None);
    }

    #[test]
    fn default_generators_follow_metadata() {
        let et = EntityType::new("Row")
            .property(PropertyInfo::new("id").generated(sqltrack_core::ValueGenerated::OnAdd))
            .property(PropertyInfo::new("code").with_value_generator())
            .property(PropertyInfo::new("name"))
            .primary_key(&["id"]);
        let model = sqltrack_core::Model::builder().entity(et).build().unwrap();
        let et = model.entity_type("Row").unwrap();
        let mut manager = ValueGenerationManager::new();

        let id = et.property_named("id").unwrap();
        let code = et.property_named("code").unwrap();
        let name = et.property_named("name").unwrap();
        assert!(
            manager
                .generator_for(et, id)
                .unwrap()
                .generates_temporary_values()
        );
        assert!(
            !manager
                .generator_for(et, code)
                .unwrap()
                .generates_temporary_values()
        );
        assert!(manager.generator_for(et, name).is_none());
    }
}
