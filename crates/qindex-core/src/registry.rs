//! A static, in-memory entity registry.
//!
//! Hosts with dynamic registration implement [`EntityRegistry`]
//! themselves; this implementation covers single-process workers and
//! tests, where the entity set is known at startup.

use crate::entity::EntityType;
use crate::traits::EntityRegistry;
use std::collections::HashMap;

/// One registered entity.
#[derive(Debug, Clone)]
struct Registration {
    table: String,
    label: String,
    custom_entity: bool,
}

/// Fixed registration table.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    order: Vec<EntityType>,
    entries: HashMap<String, Registration>,
}

impl StaticRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity backed by a base table.
    #[must_use]
    pub fn with_entity(
        mut self,
        entity_type: EntityType,
        table: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        self.entries.insert(
            entity_type.as_str().to_string(),
            Registration {
                table: table.into(),
                label: label.into(),
                custom_entity: false,
            },
        );
        self.order.push(entity_type);
        self
    }

    /// Register a custom entity living in the shared storage table.
    #[must_use]
    pub fn with_custom_entity(
        mut self,
        entity_type: EntityType,
        label: impl Into<String>,
    ) -> Self {
        self.entries.insert(
            entity_type.as_str().to_string(),
            Registration {
                table: String::new(),
                label: label.into(),
                custom_entity: true,
            },
        );
        self.order.push(entity_type);
        self
    }
}

impl EntityRegistry for StaticRegistry {
    fn table_name(&self, entity_type: &EntityType) -> Option<String> {
        self.entries
            .get(entity_type.as_str())
            .filter(|r| !r.custom_entity)
            .map(|r| r.table.clone())
    }

    fn entity_types(&self) -> Vec<EntityType> {
        self.order.clone()
    }

    fn is_custom_entity(&self, entity_type: &EntityType) -> bool {
        self.entries
            .get(entity_type.as_str())
            .is_some_and(|r| r.custom_entity)
    }

    fn label(&self, entity_type: &EntityType) -> String {
        self.entries
            .get(entity_type.as_str())
            .map_or_else(|| entity_type.to_string(), |r| r.label.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let todo = EntityType::new("example:todo").unwrap();
        let ticket = EntityType::new("custom:ticket").unwrap();
        let registry = StaticRegistry::new()
            .with_entity(todo.clone(), "todos", "Todos")
            .with_custom_entity(ticket.clone(), "Tickets");

        assert_eq!(registry.table_name(&todo).as_deref(), Some("todos"));
        assert_eq!(registry.table_name(&ticket), None);
        assert!(registry.is_custom_entity(&ticket));
        assert!(!registry.is_custom_entity(&todo));
        assert_eq!(registry.entity_types().len(), 2);
        assert_eq!(registry.label(&todo), "Todos");
    }
}
