// WiFi fixture: remembers the access point it was told to join and announces changes.

use keel_common::params;
use keel_common::types::{
    EventItemSchema, EventSchema, FunctionParameterMap, FunctionSchema, FunctionValue,
    ParameterSchema, ValueType,
};
use keel_node::services::{
    FunctionHandlerMap, HandlerResult, Service, ServiceAttributes, ServiceContext,
};
use parking_lot::RwLock;
use std::sync::Arc;

use super::text;

pub const WIFI_SERVICE_NAME: &str = "Wifi";
pub const CONNECT_AP_CHANGED_EVENT: &str = "connect_ap_changed";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessPoint {
    pub ssid: String,
    pub password: String,
}

pub struct WifiService {
    attributes: ServiceAttributes,
    access_point: RwLock<AccessPoint>,
}

impl WifiService {
    pub fn new() -> Arc<Self> {
        Self::with_attributes(ServiceAttributes::new(WIFI_SERVICE_NAME))
    }

    pub fn with_attributes(attributes: ServiceAttributes) -> Arc<Self> {
        Arc::new(Self {
            attributes,
            access_point: RwLock::new(AccessPoint::default()),
        })
    }

    pub fn access_point(&self) -> AccessPoint {
        self.access_point.read().clone()
    }
}

impl Service for WifiService {
    fn attributes(&self) -> &ServiceAttributes {
        &self.attributes
    }

    fn function_schemas(&self) -> Vec<FunctionSchema> {
        vec![
            FunctionSchema::new("SetConnectAp")
                .with_description("Join an access point")
                .with_parameter(ParameterSchema::new("ssid", ValueType::String))
                .with_parameter(ParameterSchema::new("password", ValueType::String).with_default("")),
            FunctionSchema::new("GetConnectAp").with_description("SSID of the access point currently joined"),
        ]
    }

    fn event_schemas(&self) -> Vec<EventSchema> {
        vec![EventSchema::new(CONNECT_AP_CHANGED_EVENT)
            .with_item(EventItemSchema::new("ssid", ValueType::String))]
    }

    fn function_handlers(self: Arc<Self>, context: &ServiceContext) -> FunctionHandlerMap {
        let mut handlers = FunctionHandlerMap::new();

        let wifi = self.clone();
        let publisher = context.clone();
        handlers.insert(
            "SetConnectAp".to_string(),
            Arc::new(move |params: FunctionParameterMap| -> HandlerResult {
                let ssid = text(&params, "ssid")?.to_string();
                let password = text(&params, "password")?.to_string();
                let changed = {
                    let mut current = wifi.access_point.write();
                    let changed = current.ssid != ssid;
                    *current = AccessPoint { ssid: ssid.clone(), password };
                    changed
                };
                if changed {
                    publisher.publish_event(CONNECT_AP_CHANGED_EVENT, params!("ssid" => ssid));
                }
                Ok(None)
            }),
        );

        let wifi = self;
        handlers.insert(
            "GetConnectAp".to_string(),
            Arc::new(move |_: FunctionParameterMap| -> HandlerResult {
                Ok(Some(FunctionValue::from(wifi.access_point().ssid)))
            }),
        );

        handlers
    }
}
