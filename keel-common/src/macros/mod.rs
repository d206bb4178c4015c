// keel_common/src/macros/mod.rs
//
// Declarative macros shared by every Keel crate.
//
// The log_* macros forward to `Logger::*_args` behind a level check so that
// disabled records never pay for formatting.

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {{
        if ::log::log_enabled!(::log::Level::Debug) {
            ($logger).debug_args(format_args!($($arg)*));
        }
    }}
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {{
        if ::log::log_enabled!(::log::Level::Info) {
            ($logger).info_args(format_args!($($arg)*));
        }
    }}
}

#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)*) => {{
        if ::log::log_enabled!(::log::Level::Warn) {
            ($logger).warn_args(format_args!($($arg)*));
        }
    }}
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {{
        if ::log::log_enabled!(::log::Level::Error) {
            ($logger).error_args(format_args!($($arg)*));
        }
    }}
}

/// Create a `HashMap<String, _>` from key-value pairs
///
/// ```
/// use keel_common::hmap;
/// let map = hmap!("a" => 1, "b" => 2);
/// assert_eq!(map.len(), 2);
/// let empty: std::collections::HashMap<String, i32> = hmap!{};
/// assert!(empty.is_empty());
/// ```
#[macro_export]
macro_rules! hmap {
    {} => {
        {
            let map: ::std::collections::HashMap<String, _> = ::std::collections::HashMap::new();
            map
        }
    };

    { $($key:expr => $value:expr),* $(,)? } => {
        {
            let mut map = ::std::collections::HashMap::new();
            $(map.insert($key.to_string(), $value);)*
            map
        }
    };
}

/// Create a `FunctionParameterMap` (or `EventItemMap`) with every value
/// converted through `FunctionValue::from`.
///
/// ```
/// use keel_common::params;
/// use keel_common::types::FunctionValue;
/// let params = params!("ssid" => "office", "retries" => 3);
/// assert_eq!(params.get("ssid"), Some(&FunctionValue::String("office".into())));
/// ```
#[macro_export]
macro_rules! params {
    {} => {
        $crate::types::FunctionParameterMap::new()
    };

    { $($key:expr => $value:expr),* $(,)? } => {
        {
            let mut map = $crate::types::FunctionParameterMap::new();
            $(map.insert($key.to_string(), $crate::types::FunctionValue::from($value));)*
            map
        }
    };
}
