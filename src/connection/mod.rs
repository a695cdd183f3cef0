//! Connections to monitored targets
//!
//! The collector only talks to a target through [`Connection`]; the bundled
//! implementation speaks the Jolokia HTTP/JSON protocol.

pub mod jolokia;
pub mod parser;

use std::sync::Arc;

use async_trait::async_trait;

use crate::bean::Bean;
use crate::config::InstanceConfig;
use crate::error::ConnectionError;
use crate::value::JmxValue;

pub use jolokia::{JolokiaConnection, JolokiaConnectionFactory};

/// Name and declared type of one bean attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    pub name: String,
    pub type_name: String,
}

impl AttributeInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Access to one monitored target
#[async_trait]
pub trait Connection: Send + Sync {
    /// Bean names matching `scope` (a bean name pattern), or every bean
    async fn query_bean_names(&self, scope: Option<&str>) -> Result<Vec<Bean>, ConnectionError>;

    /// Attributes declared by a bean
    async fn list_attributes(&self, bean: &Bean) -> Result<Vec<AttributeInfo>, ConnectionError>;

    /// Current value of one attribute
    async fn get_attribute(&self, bean: &Bean, attribute: &str) -> Result<JmxValue, ConnectionError>;

    /// Implementation class of a bean
    async fn get_class_name(&self, bean: &Bean) -> Result<String, ConnectionError>;

    /// Whether the target still answers
    async fn is_alive(&self) -> bool;

    /// Release the connection
    async fn close(&self);

    /// Drop cached state and reconnect
    async fn force_reconnect(&self) -> Result<(), ConnectionError>;
}

/// Builds connections for configured instances
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, instance: &InstanceConfig) -> Result<Arc<dyn Connection>, ConnectionError>;
}
