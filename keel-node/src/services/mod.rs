// Services Module
//
// INTENTION:
// Everything a single service needs to exist inside a manager: the capability trait
// concrete services implement, the per-service function and event registries, the
// generic lifecycle/dispatch wrapper and the scoped usage handle.
//
// ARCHITECTURAL PRINCIPLES:
// 1. Declarative Services - a service declares schemas and handlers, the base does the rest
// 2. Ordered Execution - calls, events and remote requests run on per-service serial groups
// 3. Explicit Lifetimes - a service runs exactly while bindings to it exist

pub mod abstract_service;
pub mod binding;
pub mod event_registry;
pub mod function_future;
pub mod function_registry;
pub(crate) mod rollback;
pub mod service_base;
pub mod service_registry;

pub use abstract_service::{Service, ServiceAttributes, ServiceContext, ServiceState};
pub use binding::ServiceBinding;
pub use event_registry::{EventRegistry, EventSlot, EventSubscription};
pub use function_future::{function_promise, FunctionFuture, FunctionPromise};
pub use function_registry::{
    FunctionHandler, FunctionHandlerMap, FunctionParameters, FunctionRegistry, HandlerResult,
};
pub use service_base::{ServiceBase, ServiceGroups};
pub use service_registry::{ServiceFactory, ServiceFactoryTable};
