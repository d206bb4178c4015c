// Logging utilities for the Keel framework
//
// This module provides a component-based logging layer on top of the `log` facade:
// - Compile-time cheap macros (see `crate::macros`)
// - Component prefixes with parent inheritance
// - Root id tracking through child loggers
// - Optional service scope plus action/event path tracing
//
// The backend is `env_logger`, installed through `LoggingConfig::apply`.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt::{self, Arguments, Display, Formatter};

/// Predefined components for logging categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Manager,
    Service,
    Registry,
    Scheduler,
    Rpc,
    Test,
    Custom(&'static str),
}

impl Component {
    /// Get the string representation of the component
    pub fn as_str(&self) -> &str {
        match self {
            Component::Manager => "Manager",
            Component::Service => "Service",
            Component::Registry => "Registry",
            Component::Scheduler => "Scheduler",
            Component::Rpc => "Rpc",
            Component::Test => "Test",
            Component::Custom(name) => name,
        }
    }
}

impl Display for Component {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Lightweight Display helper so the *_args methods never allocate a prefix String
struct PrefixDisplay<'a>(&'a Logger);

impl Display for PrefixDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let logger = self.0;
        match logger.parent_component {
            Some(parent) if parent != Component::Manager => {
                write!(f, "{}.{}", parent.as_str(), logger.component.as_str())?
            }
            _ => write!(f, "{}", logger.component.as_str())?,
        }
        if let Some(scope) = &logger.scope {
            write!(f, "({scope})")?;
        }
        if let Some(path) = &logger.action_path {
            write!(f, "|action={path}")?;
        }
        if let Some(path) = &logger.event_path {
            write!(f, "|event={path}")?;
        }
        Ok(())
    }
}

/// A component-specific logger that carries the root id of its owner
#[derive(Clone, Debug)]
pub struct Logger {
    /// Component this logger is for
    component: Component,
    /// Root id (normally the manager's node id)
    root_id: String,
    /// Parent component for hierarchical logging (if any)
    parent_component: Option<Component>,
    /// Dynamic scope such as a service name
    scope: Option<String>,
    /// Action path for function call tracing
    action_path: Option<String>,
    /// Event path for event publication tracing
    event_path: Option<String>,
}

impl Logger {
    /// Create a new root logger for a component and root id
    pub fn new_root(component: Component, root_id: &str) -> Self {
        Self {
            component,
            root_id: root_id.to_string(),
            parent_component: None,
            scope: None,
            action_path: None,
            event_path: None,
        }
    }

    /// Create a child logger with the same root id but a different component
    pub fn with_component(&self, component: Component) -> Self {
        Self {
            component,
            root_id: self.root_id.clone(),
            parent_component: Some(self.component),
            scope: self.scope.clone(),
            action_path: self.action_path.clone(),
            event_path: self.event_path.clone(),
        }
    }

    /// Create a logger scoped to a dynamic name, e.g. a service
    pub fn with_scope(&self, scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            ..self.clone()
        }
    }

    /// Create a logger with an action path
    pub fn with_action_path(&self, path: impl Into<String>) -> Self {
        Self {
            action_path: Some(path.into()),
            ..self.clone()
        }
    }

    /// Create a logger with an event path
    pub fn with_event_path(&self, path: impl Into<String>) -> Self {
        Self {
            event_path: Some(path.into()),
            ..self.clone()
        }
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn action_path(&self) -> Option<&str> {
        self.action_path.as_deref()
    }

    pub fn event_path(&self) -> Option<&str> {
        self.event_path.as_deref()
    }

    fn is_bare_root(&self) -> bool {
        self.component == Component::Manager
            && self.parent_component.is_none()
            && self.scope.is_none()
    }

    /// Log a debug message
    pub fn debug(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Debug) {
            self.debug_args(format_args!("{}", message.into()));
        }
    }

    /// Log a debug message using fmt::Arguments (avoids allocating message String)
    pub fn debug_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Debug) {
            if self.is_bare_root() {
                debug!("[{}] {}", self.root_id, args);
            } else {
                debug!("[{}][{}] {}", self.root_id, PrefixDisplay(self), args);
            }
        }
    }

    /// Log an info message
    pub fn info(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Info) {
            self.info_args(format_args!("{}", message.into()));
        }
    }

    /// Log an info message using fmt::Arguments
    pub fn info_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Info) {
            if self.is_bare_root() {
                info!("[{}] {}", self.root_id, args);
            } else {
                info!("[{}][{}] {}", self.root_id, PrefixDisplay(self), args);
            }
        }
    }

    /// Log a warning message
    pub fn warn(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Warn) {
            self.warn_args(format_args!("{}", message.into()));
        }
    }

    /// Log a warning using fmt::Arguments
    pub fn warn_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Warn) {
            if self.is_bare_root() {
                warn!("[{}] {}", self.root_id, args);
            } else {
                warn!("[{}][{}] {}", self.root_id, PrefixDisplay(self), args);
            }
        }
    }

    /// Log an error message
    pub fn error(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Error) {
            self.error_args(format_args!("{}", message.into()));
        }
    }

    /// Log an error using fmt::Arguments
    pub fn error_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Error) {
            if self.is_bare_root() {
                error!("[{}] {}", self.root_id, args);
            } else {
                error!("[{}][{}] {}", self.root_id, PrefixDisplay(self), args);
            }
        }
    }
}

/// Log levels accepted by `LoggingConfig`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    Off,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Off => log::LevelFilter::Off,
        }
    }
}

/// Logging configuration
///
/// INTENTION: Give a host application one place to pick the default level and
/// per-component overrides before the framework starts emitting records.
/// The global filter is the most verbose of all configured levels.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub default_level: LogLevel,
    pub component_levels: HashMap<Component, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_level: LogLevel::Info,
            component_levels: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_level(mut self, level: LogLevel) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_component_level(mut self, component: Component, level: LogLevel) -> Self {
        self.component_levels.insert(component, level);
        self
    }

    /// Effective level for a component
    pub fn level_for(&self, component: Component) -> LogLevel {
        self.component_levels
            .get(&component)
            .copied()
            .unwrap_or(self.default_level)
    }

    /// Install the `env_logger` backend.
    ///
    /// The most verbose configured level becomes the global filter. Calling this
    /// more than once (common in tests) keeps the first installed backend.
    pub fn apply(&self) {
        let max_level = self
            .component_levels
            .values()
            .map(|level| level.to_level_filter())
            .chain(std::iter::once(self.default_level.to_level_filter()))
            .max()
            .unwrap_or(log::LevelFilter::Info);

        let _ = env_logger::Builder::new()
            .filter_level(max_level)
            .format_timestamp_millis()
            .is_test(cfg!(test))
            .try_init();
    }
}

impl Display for LoggingConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "LoggingConfig(default={:?}", self.default_level)?;
        for (component, level) in &self.component_levels {
            write!(f, ", {component}={level:?}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_logger_inherits_root_and_paths() {
        let root = Logger::new_root(Component::Manager, "node-1");
        let child = root
            .with_component(Component::Service)
            .with_scope("Wifi")
            .with_action_path("Wifi/get_connect_ap");

        assert_eq!(child.root_id(), "node-1");
        assert_eq!(child.component(), Component::Service);
        assert_eq!(child.scope(), Some("Wifi"));
        assert_eq!(child.action_path(), Some("Wifi/get_connect_ap"));
        assert_eq!(format!("{}", PrefixDisplay(&child)), "Service(Wifi)|action=Wifi/get_connect_ap");

        let nested = child.with_component(Component::Registry);
        assert_eq!(format!("{}", PrefixDisplay(&nested)), "Service.Registry(Wifi)|action=Wifi/get_connect_ap");
    }

    #[test]
    fn test_component_level_override() {
        let config = LoggingConfig::new()
            .with_default_level(LogLevel::Warn)
            .with_component_level(Component::Rpc, LogLevel::Debug);

        assert_eq!(config.level_for(Component::Rpc), LogLevel::Debug);
        assert_eq!(config.level_for(Component::Manager), LogLevel::Warn);
    }
}
