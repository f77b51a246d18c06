//! Published forms, keyed by id and version

use crate::schema::CompiledForm;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FormKey {
    pub form_id: String,
    pub version: u32,
}

impl FormKey {
    pub fn new(form_id: impl Into<String>, version: u32) -> Self {
        Self {
            form_id: form_id.into(),
            version,
        }
    }
}

impl fmt::Display for FormKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.form_id, self.version)
    }
}

/// Thread-safe map of compiled forms
///
/// A published version is never replaced; a changed schema is published
/// under a new version.
#[derive(Debug, Default)]
pub struct FormRegistry {
    forms: RwLock<BTreeMap<FormKey, Arc<CompiledForm>>>,
}

impl FormRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a form; returns the already published form if the key is taken
    pub fn insert(&self, form: CompiledForm) -> Result<Arc<CompiledForm>, Arc<CompiledForm>> {
        let mut forms = self.forms.write();
        if let Some(existing) = forms.get(form.key()) {
            return Err(existing.clone());
        }
        let form = Arc::new(form);
        forms.insert(form.key().clone(), form.clone());
        Ok(form)
    }

    pub fn get(&self, key: &FormKey) -> Option<Arc<CompiledForm>> {
        self.forms.read().get(key).cloned()
    }

    /// Highest published version of a form
    pub fn latest(&self, form_id: &str) -> Option<Arc<CompiledForm>> {
        self.forms
            .read()
            .range(FormKey::new(form_id, 0)..=FormKey::new(form_id, u32::MAX))
            .next_back()
            .map(|(_, form)| form.clone())
    }

    pub fn versions(&self, form_id: &str) -> Vec<u32> {
        self.forms
            .read()
            .range(FormKey::new(form_id, 0)..=FormKey::new(form_id, u32::MAX))
            .map(|(key, _)| key.version)
            .collect()
    }

    pub fn remove(&self, key: &FormKey) -> Option<Arc<CompiledForm>> {
        self.forms.write().remove(key)
    }

    pub fn keys(&self) -> Vec<FormKey> {
        self.forms.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.forms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.forms.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDefinition, FormSchema};
    use formcalc_expr::ExpressionEngine;

    fn compiled(id: &str, version: u32) -> CompiledForm {
        FormSchema::new(id, version)
            .with_field(FieldDefinition::calculated("x", "1 + 1"))
            .compile(&ExpressionEngine::default())
            .unwrap()
    }

    #[test]
    fn test_versions_and_latest() {
        let registry = FormRegistry::new();
        registry.insert(compiled("order", 2)).unwrap();
        registry.insert(compiled("order", 10)).unwrap();
        registry.insert(compiled("order-extra", 1)).unwrap();
        registry.insert(compiled("a", 7)).unwrap();

        assert_eq!(registry.versions("order"), vec![2, 10]);
        assert_eq!(registry.latest("order").unwrap().key().version, 10);
        assert!(registry.latest("missing").is_none());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_published_version_is_immutable() {
        let registry = FormRegistry::new();
        let first = registry.insert(compiled("order", 1)).unwrap();
        let existing = registry.insert(compiled("order", 1)).unwrap_err();
        assert!(Arc::ptr_eq(&first, &existing));

        assert!(registry.remove(&FormKey::new("order", 1)).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(FormKey::new("order", 3).to_string(), "order@v3");
    }
}
