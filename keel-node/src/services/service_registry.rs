// Service Factory Table
//
// Explicit, ordered list of named service factories handed to a ServiceManager.
// Registration order is the tie-break order of the manager's dependency sort.

use std::fmt;
use std::sync::Arc;

use crate::services::abstract_service::Service;

pub type ServiceFactory = Arc<dyn Fn() -> Arc<dyn Service> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ServiceFactoryTable {
    factories: Vec<(String, ServiceFactory)>,
}

impl ServiceFactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A second factory under the same name replaces the first
    /// and keeps its position.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Service> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory: ServiceFactory = Arc::new(factory);
        match self.factories.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = factory,
            None => self.factories.push((name, factory)),
        }
    }

    pub fn with_factory<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Service> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceFactory)> {
        self.factories.iter().map(|(name, factory)| (name.as_str(), factory))
    }
}

impl fmt::Debug for ServiceFactoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::abstract_service::ServiceAttributes;

    struct Named(ServiceAttributes);

    impl Service for Named {
        fn attributes(&self) -> &ServiceAttributes {
            &self.0
        }
    }

    #[test]
    fn test_registration_keeps_order_and_replaces() {
        let table = ServiceFactoryTable::new()
            .with_factory("B", || Arc::new(Named(ServiceAttributes::new("B"))) as Arc<dyn Service>)
            .with_factory("A", || Arc::new(Named(ServiceAttributes::new("A"))) as Arc<dyn Service>)
            .with_factory("B", || {
                Arc::new(Named(ServiceAttributes::new("B").with_dependencies(["A"]))) as Arc<dyn Service>
            });

        assert_eq!(table.names(), vec!["B", "A"]);
        let (_, factory) = table.iter().next().unwrap();
        assert_eq!(factory().attributes().dependencies, vec!["A".to_string()]);
    }
}
