//! Jolokia HTTP 커넥션
//!
//! Connection pooling과 타임아웃을 지원하는 비동기 HTTP 클라이언트로
//! `search`, `list`, `read`, `version` 요청을 보냅니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::parser::{escape_path, json_to_tabular, json_to_value, parse_response, JolokiaResponse};
use super::{AttributeInfo, Connection, ConnectionFactory};
use crate::attribute::{classify_type, AttributeKind};
use crate::bean::Bean;
use crate::config::InstanceConfig;
use crate::error::ConnectionError;
use crate::value::JmxValue;

/// Jolokia 요청 구조체
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum JolokiaRequest<'a> {
    Search { mbean: &'a str },
    List { path: String },
    Read { mbean: &'a str, attribute: &'a str },
    Version,
}

/// Bean 메타데이터 (list 응답)
#[derive(Debug, Clone, Default)]
struct BeanInfo {
    class_name: Option<String>,
    attributes: Vec<AttributeInfo>,
}

/// Jolokia HTTP 커넥션
pub struct JolokiaConnection {
    client: Client,
    base_url: String,
    timeout_ms: u64,
    /// bean 이름 -> list 결과 (read 응답의 TabularData 복원에 사용)
    info: RwLock<HashMap<String, BeanInfo>>,
    closed: AtomicBool,
}

impl JolokiaConnection {
    /// 새 커넥션 생성
    ///
    /// # Arguments
    /// * `base_url` - Jolokia 엔드포인트 URL (예: "http://localhost:8778/jolokia")
    /// * `timeout_ms` - 요청 타임아웃 (밀리초)
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self, ConnectionError> {
        let client = ClientBuilder::new()
            .timeout(Duration::from_millis(timeout_ms))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConnectionError::ClientInit(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_ms,
            info: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Endpoint URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: &JolokiaRequest<'_>) -> Result<JolokiaResponse, ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }

        let response = self
            .client
            .post(&self.base_url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ConnectionError::Authentication(format!(
                "{} answered {}",
                self.base_url, status
            )));
        }
        if !status.is_success() {
            return Err(ConnectionError::Io(format!(
                "{} answered {}",
                self.base_url, status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        parse_response(&body)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> ConnectionError {
        if err.is_timeout() {
            ConnectionError::Timeout(Some(self.timeout_ms))
        } else {
            err.into()
        }
    }

    fn cached_type(&self, bean: &Bean, attribute: &str) -> Option<AttributeKind> {
        let info = self.info.read().ok()?;
        info.get(bean.string_form())?
            .attributes
            .iter()
            .find(|a| a.name == attribute)
            .and_then(|a| classify_type(&a.type_name))
    }

    /// Bean 메타데이터 조회 (list)
    async fn bean_info(&self, bean: &Bean) -> Result<BeanInfo, ConnectionError> {
        let cached = self
            .info
            .read()
            .ok()
            .and_then(|cache| cache.get(bean.string_form()).cloned());
        if let Some(info) = cached {
            return Ok(info);
        }

        let path = format!(
            "{}/{}",
            escape_path(bean.domain()),
            escape_path(bean.string_form().split_once(':').map_or("", |(_, props)| props))
        );
        let value = self
            .send(&JolokiaRequest::List { path })
            .await?
            .into_value(bean.string_form(), None)?;

        let info = parse_bean_info(&value);
        if let Ok(mut cache) = self.info.write() {
            cache.insert(bean.string_form().to_string(), info.clone());
        }
        Ok(info)
    }
}

fn parse_bean_info(value: &Value) -> BeanInfo {
    let class_name = value
        .get("class")
        .and_then(Value::as_str)
        .map(str::to_string);
    let attributes = value
        .get("attr")
        .and_then(Value::as_object)
        .map(|attrs| {
            attrs
                .iter()
                .map(|(name, meta)| {
                    let type_name = meta
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("java.lang.Object");
                    AttributeInfo::new(name.clone(), type_name)
                })
                .collect()
        })
        .unwrap_or_default();
    BeanInfo {
        class_name,
        attributes,
    }
}

#[async_trait]
impl Connection for JolokiaConnection {
    #[instrument(skip(self))]
    async fn query_bean_names(&self, scope: Option<&str>) -> Result<Vec<Bean>, ConnectionError> {
        let pattern = scope.unwrap_or("*:*");
        let value = self
            .send(&JolokiaRequest::Search { mbean: pattern })
            .await?
            .into_value(pattern, None)?;

        let Value::Array(names) = value else {
            return Err(ConnectionError::Protocol(
                "search response is not a list".to_string(),
            ));
        };

        let mut beans = Vec::with_capacity(names.len());
        for name in names.iter().filter_map(Value::as_str) {
            match Bean::parse(name) {
                Ok(bean) => beans.push(bean),
                Err(e) => debug!(bean = %name, error = %e, "Skipping unparseable bean name"),
            }
        }
        Ok(beans)
    }

    #[instrument(skip(self), fields(bean = %bean))]
    async fn list_attributes(&self, bean: &Bean) -> Result<Vec<AttributeInfo>, ConnectionError> {
        Ok(self.bean_info(bean).await?.attributes)
    }

    #[instrument(skip(self), fields(bean = %bean))]
    async fn get_attribute(&self, bean: &Bean, attribute: &str) -> Result<JmxValue, ConnectionError> {
        let value = self
            .send(&JolokiaRequest::Read {
                mbean: bean.string_form(),
                attribute,
            })
            .await?
            .into_value(bean.string_form(), Some(attribute))?;

        Ok(match self.cached_type(bean, attribute) {
            Some(AttributeKind::Tabular) => json_to_tabular(value),
            _ => json_to_value(value),
        })
    }

    #[instrument(skip(self), fields(bean = %bean))]
    async fn get_class_name(&self, bean: &Bean) -> Result<String, ConnectionError> {
        self.bean_info(bean)
            .await?
            .class_name
            .ok_or_else(|| ConnectionError::Protocol(format!("no class reported for {}", bean)))
    }

    async fn is_alive(&self) -> bool {
        match self.send(&JolokiaRequest::Version).await {
            Ok(response) => response.status == 200,
            Err(e) => {
                debug!(url = %self.base_url, error = %e, "Liveness check failed");
                false
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut cache) = self.info.write() {
            cache.clear();
        }
    }

    async fn force_reconnect(&self) -> Result<(), ConnectionError> {
        if let Ok(mut cache) = self.info.write() {
            cache.clear();
        }
        self.closed.store(false, Ordering::Release);
        self.send(&JolokiaRequest::Version)
            .await?
            .into_value(&self.base_url, None)
            .map(|_| ())
    }
}

/// Builds [`JolokiaConnection`]s and checks the endpoint answers
#[derive(Debug, Clone, Default)]
pub struct JolokiaConnectionFactory;

#[async_trait]
impl ConnectionFactory for JolokiaConnectionFactory {
    async fn connect(&self, instance: &InstanceConfig) -> Result<Arc<dyn Connection>, ConnectionError> {
        let connection = JolokiaConnection::new(&instance.url, instance.request_timeout_ms)?;
        connection.force_reconnect().await?;
        debug!(instance = %instance.name, url = %instance.url, "Connected");
        Ok(Arc::new(connection))
    }
}
