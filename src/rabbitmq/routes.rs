use std::any::{type_name, TypeId};
use std::collections::HashMap;

use serde::{de::DeserializeOwned, Serialize};

use super::errors::{MessageBusError, Result};

/// Anything that can travel over the bus as a JSON body.
///
/// Field names are expected to be camelCase on the wire, so message types
/// should carry `#[serde(rename_all = "camelCase")]`.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> BusMessage for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Where messages of one type are published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRoute {
    pub message_type: &'static str,
    pub exchange: String,
    pub routing_key: String,
}

/// Publish routes keyed by message type, one route per type.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: HashMap<TypeId, PublishRoute>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with [`MessageBusError::DuplicateRoute`] if `T` already has a route.
    pub fn register<T: BusMessage>(&mut self, exchange: &str, routing_key: &str) -> Result<()> {
        let message_type = type_name::<T>();
        if self.routes.contains_key(&TypeId::of::<T>()) {
            return Err(MessageBusError::DuplicateRoute { message_type });
        }

        self.routes.insert(
            TypeId::of::<T>(),
            PublishRoute {
                message_type,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            },
        );
        Ok(())
    }

    pub fn resolve<T: BusMessage>(&self) -> Result<&PublishRoute> {
        self.routes
            .get(&TypeId::of::<T>())
            .ok_or(MessageBusError::RouteNotRegistered {
                message_type: type_name::<T>(),
            })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
