//! Shared fixtures: an in-memory JMX server with failure injection and a
//! reporter that records everything it receives

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jmx_collector::bean::Bean;
use jmx_collector::config::InstanceConfig;
use jmx_collector::connection::{AttributeInfo, Connection, ConnectionFactory};
use jmx_collector::error::ConnectionError;
use jmx_collector::metric::MetricType;
use jmx_collector::reporter::{Reporter, ServiceCheckStatus};
use jmx_collector::value::JmxValue;

#[derive(Debug, Clone)]
struct FakeBean {
    class_name: String,
    attributes: BTreeMap<String, (String, JmxValue)>,
}

/// In-memory MBean server
#[derive(Debug, Default)]
pub struct FakeJmx {
    beans: Mutex<BTreeMap<String, FakeBean>>,
    failing: Mutex<HashSet<(String, String)>>,
    down: AtomicBool,
    auth_rejected: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
    queries: AtomicUsize,
    reads: AtomicUsize,
}

impl FakeJmx {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_bean(&self, name: &str, class_name: &str) {
        self.beans.lock().unwrap().insert(
            name.to_string(),
            FakeBean {
                class_name: class_name.to_string(),
                attributes: BTreeMap::new(),
            },
        );
    }

    pub fn remove_bean(&self, name: &str) {
        self.beans.lock().unwrap().remove(name);
    }

    /// Set an attribute, creating the bean when needed
    pub fn set(&self, bean: &str, attribute: &str, type_name: &str, value: JmxValue) {
        let mut beans = self.beans.lock().unwrap();
        let entry = beans.entry(bean.to_string()).or_insert_with(|| FakeBean {
            class_name: "test.Fake".to_string(),
            attributes: BTreeMap::new(),
        });
        entry
            .attributes
            .insert(attribute.to_string(), (type_name.to_string(), value));
    }

    pub fn set_long(&self, bean: &str, attribute: &str, value: i64) {
        self.set(bean, attribute, "long", JmxValue::Integer(value));
    }

    /// Make reads of one attribute fail until `heal` is called
    pub fn fail(&self, bean: &str, attribute: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((bean.to_string(), attribute.to_string()));
    }

    pub fn heal(&self, bean: &str, attribute: &str) {
        self.failing
            .lock()
            .unwrap()
            .remove(&(bean.to_string(), attribute.to_string()));
    }

    /// Every call fails with an I/O error while down
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn reject_credentials(&self, rejected: bool) {
        self.auth_rejected.store(rejected, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock().unwrap() = delay;
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ConnectionError> {
        if self.auth_rejected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Authentication("401 Unauthorized".to_string()));
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(ConnectionError::Io("connection refused".to_string()));
        }
        Ok(())
    }
}

// `domain:k=v,*` and exact names
fn scope_matches(scope: &str, bean: &Bean) -> bool {
    let Some((domain, props)) = scope.split_once(':') else {
        return false;
    };
    if domain != "*" && domain != bean.domain() {
        return false;
    }
    let mut wildcard = false;
    let mut constraints = Vec::new();
    for prop in props.split(',') {
        if prop == "*" {
            wildcard = true;
        } else if let Some((k, v)) = prop.split_once('=') {
            constraints.push((k, v));
        }
    }
    let all_present = constraints.iter().all(|(k, v)| bean.get(k) == Some(*v));
    all_present && (wildcard || constraints.len() == bean.parameters().len())
}

/// Connection over a shared [`FakeJmx`]
#[derive(Debug)]
pub struct FakeConnection {
    jmx: Arc<FakeJmx>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn query_bean_names(&self, scope: Option<&str>) -> Result<Vec<Bean>, ConnectionError> {
        self.jmx.check()?;
        self.jmx.queries.fetch_add(1, Ordering::SeqCst);
        let names: Vec<String> = self.jmx.beans.lock().unwrap().keys().cloned().collect();
        let mut beans = Vec::new();
        for name in names {
            let bean = Bean::parse(&name)?;
            if scope.map_or(true, |scope| scope_matches(scope, &bean)) {
                beans.push(bean);
            }
        }
        Ok(beans)
    }

    async fn list_attributes(&self, bean: &Bean) -> Result<Vec<AttributeInfo>, ConnectionError> {
        self.jmx.check()?;
        let beans = self.jmx.beans.lock().unwrap();
        let fake = beans
            .get(bean.string_form())
            .ok_or_else(|| ConnectionError::BeanNotFound(bean.to_string()))?;
        Ok(fake
            .attributes
            .iter()
            .map(|(name, (type_name, _))| AttributeInfo::new(name.clone(), type_name.clone()))
            .collect())
    }

    async fn get_attribute(&self, bean: &Bean, attribute: &str) -> Result<JmxValue, ConnectionError> {
        self.jmx.check()?;
        let delay = *self.jmx.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.jmx.reads.fetch_add(1, Ordering::SeqCst);
        let unavailable = |message: &str| ConnectionError::AttributeUnavailable {
            bean: bean.to_string(),
            attribute: attribute.to_string(),
            message: message.to_string(),
        };
        if self
            .jmx
            .failing
            .lock()
            .unwrap()
            .contains(&(bean.to_string(), attribute.to_string()))
        {
            return Err(unavailable("injected failure"));
        }
        let beans = self.jmx.beans.lock().unwrap();
        beans
            .get(bean.string_form())
            .and_then(|b| b.attributes.get(attribute))
            .map(|(_, value)| value.clone())
            .ok_or_else(|| unavailable("no such attribute"))
    }

    async fn get_class_name(&self, bean: &Bean) -> Result<String, ConnectionError> {
        self.jmx.check()?;
        let beans = self.jmx.beans.lock().unwrap();
        beans
            .get(bean.string_form())
            .map(|b| b.class_name.clone())
            .ok_or_else(|| ConnectionError::BeanNotFound(bean.to_string()))
    }

    async fn is_alive(&self) -> bool {
        self.jmx.check().is_ok()
    }

    async fn close(&self) {}

    async fn force_reconnect(&self) -> Result<(), ConnectionError> {
        self.jmx.check()
    }
}

/// Factory handing out connections to one [`FakeJmx`] per instance name
#[derive(Debug, Default)]
pub struct FakeFactory {
    servers: Mutex<BTreeMap<String, Arc<FakeJmx>>>,
    connects: AtomicUsize,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_server(self: &Arc<Self>, instance: &str, jmx: &Arc<FakeJmx>) -> Arc<Self> {
        self.servers
            .lock()
            .unwrap()
            .insert(instance.to_string(), Arc::clone(jmx));
        Arc::clone(self)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self, instance: &InstanceConfig) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let jmx = self
            .servers
            .lock()
            .unwrap()
            .get(&instance.name)
            .cloned()
            .ok_or_else(|| ConnectionError::Io(format!("no server for {}", instance.name)))?;
        jmx.check()?;
        Ok(Arc::new(FakeConnection { jmx }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub metric_type: MetricType,
    pub name: String,
    pub value: f64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub name: String,
    pub status: ServiceCheckStatus,
    pub message: Option<String>,
    pub tags: Vec<String>,
}

/// Reporter keeping every point and service check
#[derive(Debug, Default)]
pub struct RecordingReporter {
    points: Mutex<Vec<Point>>,
    checks: Mutex<Vec<Check>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().unwrap().clone()
    }

    pub fn point(&self, name: &str) -> Option<Point> {
        self.points().into_iter().rev().find(|p| p.name == name)
    }

    pub fn checks(&self) -> Vec<Check> {
        self.checks.lock().unwrap().clone()
    }

    /// Most recent check status of an instance
    pub fn last_status(&self, instance: &str) -> Option<ServiceCheckStatus> {
        let tag = format!("instance:{}", instance);
        self.checks()
            .into_iter()
            .rev()
            .find(|c| c.tags.contains(&tag))
            .map(|c| c.status)
    }

    pub fn clear(&self) {
        self.points.lock().unwrap().clear();
        self.checks.lock().unwrap().clear();
    }
}

impl Reporter for RecordingReporter {
    fn send_metric_point(&self, metric_type: MetricType, name: &str, value: f64, tags: &[String]) {
        self.points.lock().unwrap().push(Point {
            metric_type,
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
        });
    }

    fn send_service_check(
        &self,
        check_name: &str,
        status: ServiceCheckStatus,
        message: Option<&str>,
        tags: &[String],
    ) {
        self.checks.lock().unwrap().push(Check {
            name: check_name.to_string(),
            status,
            message: message.map(str::to_string),
            tags: tags.to_vec(),
        });
    }
}

/// Instance config with defaults and the given configurations
pub fn instance_config(name: &str, conf_yaml: &str) -> InstanceConfig {
    let mut config = InstanceConfig::new(name, "http://localhost:8778/jolokia");
    config.conf = serde_yaml::from_str(conf_yaml).unwrap();
    config
}
