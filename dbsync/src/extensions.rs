//! Per-model hook registration without dynamic types: extensions are
//! records of optional boxed functions keyed by model name, installed at
//! bootstrap and iterated at the hook sites. A hook returning
//! [`Error::SkipOperation`] suppresses the surrounding tracking or apply.

use std::collections::BTreeMap;

use crate::error::{Error, SyncResult};
use crate::oplog::{Command, Operation};
use crate::store::value::{Row, Value};

/// Bucket applying to every model, consulted before model-specific hooks.
pub const ANY_MODEL: &str = "Any";

pub type TrackingHook = Box<dyn Fn(Command, &Row) -> SyncResult<()> + Send + Sync>;
pub type OperationHook = Box<dyn Fn(&Operation, &mut Row, Option<&Row>) -> SyncResult<()> + Send + Sync>;
pub type AfterHook = Box<dyn Fn(&Operation, &Row) -> SyncResult<()> + Send + Sync>;
pub type FilterOperationsFn =
    Box<dyn Fn(&PullContext, Vec<Operation>) -> SyncResult<Vec<Operation>> + Send + Sync>;

pub type LoadFn = Box<dyn Fn(&Row) -> SyncResult<Value> + Send + Sync>;
pub type SaveFn = Box<dyn Fn(&Row, &Value) -> SyncResult<()> + Send + Sync>;
pub type DeleteFn = Box<dyn Fn(&Row, Option<&Row>) -> SyncResult<()> + Send + Sync>;
pub type SendPayloadFn = Box<dyn Fn(&Row) -> SyncResult<Vec<u8>> + Send + Sync>;
pub type ReceivePayloadFn = Box<dyn Fn(&Operation, &mut Row, Vec<u8>) -> SyncResult<()> + Send + Sync>;

/// Caller identity and request data available to `filter_operations`.
#[derive(Debug, Clone, Default)]
pub struct PullContext {
    pub node_id: Option<u32>,
    pub extra_data: serde_json::Value,
}

/// Extends a model with a field of the given name.
///
/// `loadfn` populates the extended column when a row is projected into a
/// message payload. `savefn` persists the field after commit; `deletefn`
/// reverts its side effects, called with the previous state and the current
/// one (`None` after a delete). `send_payload`/`receive_payload` stream the
/// field's bytes out-of-band during apply: the hooks produce and consume
/// whole byte buffers, the engine does the framing on the wire.
#[derive(Default)]
pub struct ExtensionField {
    pub loadfn: Option<LoadFn>,
    pub savefn: Option<SaveFn>,
    pub deletefn: Option<DeleteFn>,
    pub send_payload: Option<SendPayloadFn>,
    pub receive_payload: Option<ReceivePayloadFn>,
}

/// All before_* hooks can skip the operation by returning `SkipOperation`.
#[derive(Default)]
pub struct Extension {
    /// Called before an object is tracked.
    pub before_tracking: Option<TrackingHook>,
    /// Called after an object is tracked.
    pub after_tracking: Option<AfterHook>,
    /// Called before an object is inserted/updated/deleted during apply.
    pub before_operation: Option<OperationHook>,
    pub before_insert: Option<OperationHook>,
    pub before_update: Option<OperationHook>,
    pub before_delete: Option<OperationHook>,
    /// Called after an apply took effect and was versioned.
    pub after_operation: Option<AfterHook>,
    pub after_insert: Option<AfterHook>,
    pub after_update: Option<AfterHook>,
    pub after_delete: Option<AfterHook>,
    /// Called before the object is added to a push message on the client.
    pub before_client_add_object: Option<AfterHook>,
    /// Called before an operation is added to a pull message on the server.
    pub before_server_add_operation: Option<AfterHook>,
    /// Narrows the operation set returned by a pull (authorization).
    pub filter_operations: Option<FilterOperationsFn>,

    pub fields: BTreeMap<String, ExtensionField>,
}

impl Extension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, field: ExtensionField) -> Self {
        self.fields.insert(name.to_owned(), field);
        self
    }
}

#[derive(Default)]
pub struct ExtensionRegistry {
    by_model: BTreeMap<String, Vec<Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, model_name: &str, extension: Extension) {
        self.by_model.entry(model_name.to_owned()).or_default().push(extension);
    }

    /// Extensions applying to the model: the `Any` bucket first, then the
    /// model's own.
    pub fn for_model<'a>(&'a self, model_name: &str) -> impl Iterator<Item = &'a Extension> + 'a {
        let any = if model_name != ANY_MODEL {
            self.by_model.get(ANY_MODEL).map(|v| v.as_slice()).unwrap_or(&[])
        } else {
            &[]
        };
        any.iter().chain(self.by_model.get(model_name).into_iter().flatten())
    }

    pub fn call_before_tracking(&self, model: &str, command: Command, row: &Row) -> SyncResult<()> {
        for ext in self.for_model(model) {
            if let Some(hook) = &ext.before_tracking {
                hook(command, row)?;
            }
        }
        Ok(())
    }

    pub fn call_after_tracking(&self, model: &str, op: &Operation, row: &Row) -> SyncResult<()> {
        for ext in self.for_model(model) {
            if let Some(hook) = &ext.after_tracking {
                hook(op, row)?;
            }
        }
        Ok(())
    }

    /// Runs `before_operation` plus the per-command variant.
    pub fn call_before_operation(
        &self,
        model: &str,
        op: &Operation,
        row: &mut Row,
        old: Option<&Row>,
    ) -> SyncResult<()> {
        for ext in self.for_model(model) {
            if let Some(hook) = &ext.before_operation {
                hook(op, row, old)?;
            }
            let per_command = match op.command {
                Command::Insert => &ext.before_insert,
                Command::Update => &ext.before_update,
                Command::Delete => &ext.before_delete,
            };
            if let Some(hook) = per_command {
                hook(op, row, old)?;
            }
        }
        Ok(())
    }

    pub fn call_after_operation(&self, model: &str, op: &Operation, row: &Row) -> SyncResult<()> {
        for ext in self.for_model(model) {
            if let Some(hook) = &ext.after_operation {
                hook(op, row)?;
            }
            let per_command = match op.command {
                Command::Insert => &ext.after_insert,
                Command::Update => &ext.after_update,
                Command::Delete => &ext.after_delete,
            };
            if let Some(hook) = per_command {
                hook(op, row)?;
            }
        }
        Ok(())
    }

    pub fn call_before_client_add_object(&self, model: &str, op: &Operation, row: &Row) -> SyncResult<()> {
        for ext in self.for_model(model) {
            if let Some(hook) = &ext.before_client_add_object {
                hook(op, row)?;
            }
        }
        Ok(())
    }

    pub fn call_before_server_add_operation(&self, model: &str, op: &Operation, row: &Row) -> SyncResult<()> {
        for ext in self.for_model(model) {
            if let Some(hook) = &ext.before_server_add_operation {
                hook(op, row)?;
            }
        }
        Ok(())
    }

    /// Folds the pull operation set through every registered filter. Only
    /// filters in the `Any` bucket run, since the set spans models.
    pub fn filter_operations(&self, ctx: &PullContext, mut ops: Vec<Operation>) -> SyncResult<Vec<Operation>> {
        for ext in self.by_model.get(ANY_MODEL).into_iter().flatten() {
            if let Some(filter) = &ext.filter_operations {
                ops = filter(ctx, ops)?;
            }
        }
        Ok(ops)
    }

    /// Projects extended columns into `row` via the model's `loadfn`s.
    pub fn load_fields(&self, model: &str, row: &mut Row) -> SyncResult<()> {
        for ext in self.for_model(model) {
            for (name, field) in &ext.fields {
                if let Some(loadfn) = &field.loadfn {
                    let value = loadfn(row)?;
                    row.insert(name.clone(), value);
                }
            }
        }
        Ok(())
    }

    /// Executes the save procedures for the extensions of the given object.
    pub fn save_fields(&self, model: &str, row: &Row) {
        for ext in self.for_model(model) {
            for (name, field) in &ext.fields {
                if let Some(savefn) = &field.savefn {
                    let value = row.get(name).cloned().unwrap_or(Value::Null);
                    if let Err(err) = savefn(row, &value) {
                        log::error!("couldn't save extension {} for {}: {}", name, model, err);
                    }
                }
            }
        }
    }

    /// Executes the delete procedures for the extensions of the given
    /// object. `old` is the previous state, `new` the current one (`None`
    /// if the object was deleted).
    pub fn delete_fields(&self, model: &str, old: &Row, new: Option<&Row>) {
        for ext in self.for_model(model) {
            for (name, field) in &ext.fields {
                if let Some(deletefn) = &field.deletefn {
                    if let Err(err) = deletefn(old, new) {
                        log::error!("couldn't delete extension {} for {}: {}", name, model, err);
                    }
                }
            }
        }
    }

    pub fn has_delete_fields(&self, model: &str) -> bool {
        self.for_model(model).any(|ext| ext.fields.values().any(|f| f.deletefn.is_some()))
    }

    pub fn has_save_fields(&self, model: &str) -> bool {
        self.for_model(model).any(|ext| ext.fields.values().any(|f| f.savefn.is_some()))
    }

    /// Field names of the model that expect a streamed payload on apply.
    pub fn receive_payload_fields(&self, model: &str) -> Vec<String> {
        self.for_model(model)
            .flat_map(|ext| ext.fields.iter())
            .filter(|(_, f)| f.receive_payload.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn receive_payload(
        &self,
        model: &str,
        field_name: &str,
        op: &Operation,
        row: &mut Row,
        bytes: Vec<u8>,
    ) -> SyncResult<()> {
        for ext in self.for_model(model) {
            if let Some(field) = ext.fields.get(field_name) {
                if let Some(hook) = &field.receive_payload {
                    return hook(op, row, bytes);
                }
            }
        }
        Err(Error::Registry(format!("no receive_payload hook for {}.{}", model, field_name)))
    }

    /// Produces the streamed bytes for a requested field, if a hook exists.
    pub fn send_payload(&self, model: &str, field_name: &str, row: &Row) -> SyncResult<Vec<u8>> {
        for ext in self.for_model(model) {
            if let Some(field) = ext.fields.get(field_name) {
                if let Some(hook) = &field.send_payload {
                    return hook(row);
                }
            }
        }
        Err(Error::Registry(format!("no send_payload hook for {}.{}", model, field_name)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn skip_operation_propagates() {
        let mut reg = ExtensionRegistry::new();
        let mut ext = Extension::new();
        ext.before_tracking = Some(Box::new(|_, row| {
            if row.get("name") == Some(&Value::Text("donttrack".into())) {
                return Err(Error::SkipOperation);
            }
            Ok(())
        }));
        reg.add("A", ext);

        let mut row = Row::new();
        row.insert("name".into(), Value::Text("donttrack".into()));
        assert!(matches!(
            reg.call_before_tracking("A", Command::Insert, &row),
            Err(Error::SkipOperation)
        ));
        row.insert("name".into(), Value::Text("fine".into()));
        assert!(reg.call_before_tracking("A", Command::Insert, &row).is_ok());
        // hooks of other models don't fire
        row.insert("name".into(), Value::Text("donttrack".into()));
        assert!(reg.call_before_tracking("B", Command::Insert, &row).is_ok());
    }

    #[test]
    fn any_bucket_applies_to_every_model() {
        let mut reg = ExtensionRegistry::new();
        let mut ext = Extension::new();
        ext.before_tracking = Some(Box::new(|_, _| Err(Error::SkipOperation)));
        reg.add(ANY_MODEL, ext);
        assert!(reg.call_before_tracking("Whatever", Command::Delete, &Row::new()).is_err());
    }

    #[test]
    fn load_fields_projects_extended_columns() -> SyncResult<()> {
        let mut reg = ExtensionRegistry::new();
        let ext = Extension::new().field(
            "shouted",
            ExtensionField {
                loadfn: Some(Box::new(|row| match row.get("name") {
                    Some(Value::Text(s)) => Ok(Value::Text(s.to_uppercase())),
                    _ => Ok(Value::Null),
                })),
                ..Default::default()
            },
        );
        reg.add("A", ext);

        let mut row = Row::new();
        row.insert("name".into(), Value::Text("quiet".into()));
        reg.load_fields("A", &mut row)?;
        assert_eq!(row.get("shouted"), Some(&Value::Text("QUIET".into())));
        Ok(())
    }
}
