//! CRUD bridge.
//!
//! Listens to every `<module>.<entity>.<action>` event a producer emits
//! and translates it into `query_index.upsert_one` / `delete_one` after
//! filling missing scope columns from the base row and checking that the
//! entity has custom fields worth indexing. Handlers are idempotent and
//! tolerate out-of-order delivery; the unique-key upsert converges on
//! last-writer-wins.

use async_trait::async_trait;
use qindex_core::{
    events, CrudAction, EntityRegistry, EntityType, EventBus, EventHandler, QindexResult, Scope,
};
use qindex_indexer::DocumentBuilder;
use qindex_migrations::{ColumnCache, IndexPool};
use serde_json::{json, Value};
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, warn};

/// Translates producer CRUD events into index maintenance events.
pub struct CrudBridge {
    pool: IndexPool,
    registry: Arc<dyn EntityRegistry>,
    columns: ColumnCache,
    builder: Arc<DocumentBuilder>,
    bus: Arc<dyn EventBus>,
}

impl CrudBridge {
    /// Create the bridge.
    #[must_use]
    pub fn new(
        pool: IndexPool,
        registry: Arc<dyn EntityRegistry>,
        columns: ColumnCache,
        builder: Arc<DocumentBuilder>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            pool,
            registry,
            columns,
            builder,
            bus,
        }
    }

    /// Parse `<module>.<entity>.<action>` into an entity type and action.
    fn parse_event(event: &str) -> Option<(EntityType, CrudAction)> {
        let (rest, action_raw) = event.rsplit_once('.')?;
        let action = CrudAction::from_event_suffix(action_raw)?;
        let (module, entity) = rest.split_once('.')?;
        if module == "query_index" {
            return None;
        }
        let entity_type = EntityType::new(format!("{module}:{}", entity.replace('.', ":"))).ok()?;
        Some((entity_type, action))
    }

    /// Fill missing scope columns from the base row.
    async fn resolve_scope(
        &self,
        entity_type: &EntityType,
        record_id: &str,
        organization_id: Option<String>,
        tenant_id: Option<String>,
    ) -> (Option<String>, Option<String>) {
        if organization_id.is_some() && tenant_id.is_some() {
            return (organization_id, tenant_id);
        }
        let Some(table) = self.registry.table_name(entity_type) else {
            return (organization_id, tenant_id);
        };
        let Ok(cols) = self.columns.scope_columns(&self.pool, &table).await else {
            return (organization_id, tenant_id);
        };

        let mut selects: Vec<&str> = Vec::new();
        if cols.has_organization {
            selects.push("organization_id::text AS organization_id");
        }
        if cols.has_tenant {
            selects.push("tenant_id::text AS tenant_id");
        }
        if selects.is_empty() {
            return (organization_id, tenant_id);
        }

        let sql = format!(
            "SELECT {} FROM {table} WHERE id::text = $1",
            selects.join(", ")
        );
        match sqlx::query(&sql)
            .bind(record_id)
            .fetch_optional(self.pool.inner())
            .await
        {
            Ok(Some(row)) => {
                let row_org = if cols.has_organization {
                    row.get::<Option<String>, _>("organization_id")
                } else {
                    None
                };
                let row_tenant = if cols.has_tenant {
                    row.get::<Option<String>, _>("tenant_id")
                } else {
                    None
                };
                (organization_id.or(row_org), tenant_id.or(row_tenant))
            }
            Ok(None) => (organization_id, tenant_id),
            Err(e) => {
                warn!(entity_type = %entity_type, error = %e, "Scope backfill failed");
                (organization_id, tenant_id)
            }
        }
    }
}

#[async_trait]
impl EventHandler for CrudBridge {
    async fn handle(&self, event: &str, payload: Value) -> QindexResult<()> {
        let Some((entity_type, action)) = Self::parse_event(event) else {
            return Ok(());
        };
        if self.registry.table_name(&entity_type).is_none() {
            return Ok(());
        }

        let Some(record_id) = payload
            .get("id")
            .and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        else {
            debug!(event, "CRUD event without id, ignoring");
            return Ok(());
        };

        let organization_id = payload
            .get("organizationId")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let tenant_id = payload
            .get("tenantId")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let (organization_id, tenant_id) = self
            .resolve_scope(&entity_type, &record_id, organization_id, tenant_id)
            .await;

        if action == CrudAction::Deleted {
            let delete = json!({
                "entityType": entity_type.as_str(),
                "recordId": record_id,
                "organizationId": organization_id,
                "tenantId": tenant_id,
            });
            return self.bus.emit(events::DELETE_ONE, delete, false).await;
        }

        // Entities without active custom-field definitions are served
        // from their base table alone; skip indexing them.
        let scope = Scope::new(
            tenant_id.clone().unwrap_or_default(),
            organization_id.clone(),
        );
        match self
            .builder
            .has_active_custom_fields(&entity_type, &scope)
            .await
        {
            Ok(false) => {
                debug!(entity_type = %entity_type, "No active custom fields, skipping indexing");
                return Ok(());
            }
            Ok(true) => {}
            Err(e) => {
                warn!(entity_type = %entity_type, error = %e, "Custom-field check failed, indexing anyway");
            }
        }

        let upsert = json!({
            "entityType": entity_type.as_str(),
            "recordId": record_id,
            "organizationId": organization_id,
            "tenantId": tenant_id,
            "crudAction": action,
        });
        self.bus.emit(events::UPSERT_ONE, upsert, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_shapes() {
        let (entity, action) = CrudBridge::parse_event("example.todo.created").unwrap();
        assert_eq!(entity.as_str(), "example:todo");
        assert_eq!(action, CrudAction::Created);

        let (entity, action) = CrudBridge::parse_event("crm.customer.person.updated").unwrap();
        assert_eq!(entity.as_str(), "crm:customer:person");
        assert_eq!(action, CrudAction::Updated);

        assert!(CrudBridge::parse_event("query_index.upsert_one").is_none());
        assert!(CrudBridge::parse_event("example.todo.renamed").is_none());
        assert!(CrudBridge::parse_event("created").is_none());
        assert!(CrudBridge::parse_event("todo.created").is_none());
    }
}
