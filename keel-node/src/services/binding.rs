// Service Binding Module
//
// A ServiceBinding is a scoped usage handle to a running service. While any valid
// binding exists the service (and, transitively, its dependencies) stays running.
// Releasing the last binding stops it. Bindings move but never copy.

use std::fmt;
use std::sync::Arc;

use crate::services::service_base::ServiceBase;

type UnbindAction = Box<dyn FnOnce() + Send>;

pub struct ServiceBinding {
    service: Option<Arc<ServiceBase>>,
    unbind: Option<UnbindAction>,
    dependencies: Vec<ServiceBinding>,
}

impl ServiceBinding {
    pub(crate) fn new(service: Arc<ServiceBase>, unbind: UnbindAction, dependencies: Vec<ServiceBinding>) -> Self {
        Self {
            service: Some(service),
            unbind: Some(unbind),
            dependencies,
        }
    }

    /// A binding to nothing, returned when binding failed
    pub fn invalid() -> Self {
        Self {
            service: None,
            unbind: None,
            dependencies: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.service.is_some()
    }

    /// The bound service, `None` for invalid or released bindings
    pub fn service(&self) -> Option<&Arc<ServiceBase>> {
        self.service.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.service.as_ref().map(|service| service.name())
    }

    /// Release the binding: this service first, then its dependencies in reverse
    /// bind order. Releasing twice is a no-op.
    pub fn release(&mut self) {
        self.service = None;
        if let Some(unbind) = self.unbind.take() {
            unbind();
        }
        while let Some(mut dependency) = self.dependencies.pop() {
            dependency.release();
        }
    }
}

impl Default for ServiceBinding {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Drop for ServiceBinding {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ServiceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBinding")
            .field("service", &self.name())
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::abstract_service::{Service, ServiceAttributes};
    use keel_common::logging::{Component, Logger};
    use parking_lot::Mutex;

    struct Idle {
        attributes: ServiceAttributes,
    }

    impl Service for Idle {
        fn attributes(&self) -> &ServiceAttributes {
            &self.attributes
        }
    }

    fn base(name: &str) -> Arc<ServiceBase> {
        let service = Arc::new(Idle {
            attributes: ServiceAttributes::new(name),
        });
        ServiceBase::new(service, &Logger::new_root(Component::Test, "binding-test"))
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &str) -> UnbindAction {
        let log = log.clone();
        let name = name.to_string();
        Box::new(move || log.lock().push(name))
    }

    #[test]
    fn test_release_order_and_idempotence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = ServiceBinding::new(base("A"), recording(&log, "A"), Vec::new());
        let second = ServiceBinding::new(base("B"), recording(&log, "B"), Vec::new());
        let mut top = ServiceBinding::new(base("C"), recording(&log, "C"), vec![first, second]);

        assert!(top.is_valid());
        assert_eq!(top.name(), Some("C"));
        top.release();
        assert!(!top.is_valid());
        top.release();
        drop(top);

        assert_eq!(*log.lock(), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_moved_binding_releases_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let binding = ServiceBinding::new(base("A"), recording(&log, "A"), Vec::new());
        let moved = binding;
        assert!(moved.is_valid());
        drop(moved);
        assert_eq!(*log.lock(), vec!["A"]);

        let invalid = ServiceBinding::invalid();
        assert!(!invalid.is_valid());
        assert!(invalid.service().is_none());
    }
}
