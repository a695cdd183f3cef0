//! Jolokia JSON 응답 파서
//!
//! Jolokia 응답을 [`JmxValue`]로 변환합니다. TabularData는 Jolokia가 인덱스
//! 값을 키로 하는 중첩 객체로 직렬화하므로, 선언된 타입을 알고 있을 때만
//! 행(row) 구조로 복원합니다.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ConnectionError;
use crate::value::{JmxValue, TabularData, TabularRow};

/// Jolokia API 응답
#[derive(Debug, Clone, Deserialize)]
pub struct JolokiaResponse {
    /// 응답 값
    #[serde(default)]
    pub value: Option<Value>,
    /// 응답 상태 코드
    pub status: u16,
    /// 에러 메시지 (실패 시)
    #[serde(default)]
    pub error: Option<String>,
    /// 에러 타입 (실패 시)
    #[serde(default)]
    pub error_type: Option<String>,
}

/// 단일 응답 파싱
pub fn parse_response(json: &str) -> Result<JolokiaResponse, ConnectionError> {
    serde_json::from_str(json).map_err(|e| ConnectionError::Protocol(e.to_string()))
}

impl JolokiaResponse {
    /// Value of a successful response; errors are mapped by their Java type
    pub fn into_value(self, bean: &str, attribute: Option<&str>) -> Result<Value, ConnectionError> {
        if self.status == 200 {
            return Ok(self.value.unwrap_or(Value::Null));
        }

        let message = self
            .error
            .unwrap_or_else(|| format!("status {}", self.status));
        match (self.status, self.error_type.as_deref(), attribute) {
            (401 | 403, _, _) => Err(ConnectionError::Authentication(message)),
            (_, Some("javax.management.InstanceNotFoundException"), _) => {
                Err(ConnectionError::BeanNotFound(bean.to_string()))
            }
            (_, _, Some(attribute)) => Err(ConnectionError::AttributeUnavailable {
                bean: bean.to_string(),
                attribute: attribute.to_string(),
                message,
            }),
            _ => Err(ConnectionError::Protocol(message)),
        }
    }
}

/// Escape one path element of a Jolokia `list` request
pub fn escape_path(segment: &str) -> String {
    segment.replace('!', "!!").replace('/', "!/")
}

/// 일반 JSON 값 변환
pub fn json_to_value(value: Value) -> JmxValue {
    match value {
        Value::Null => JmxValue::Null,
        Value::Bool(b) => JmxValue::Boolean(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => JmxValue::Integer(i),
            None => n.as_f64().map_or(JmxValue::Null, JmxValue::Float),
        },
        Value::String(s) => JmxValue::String(s),
        Value::Array(items) => JmxValue::Array(items.into_iter().map(json_to_value).collect()),
        Value::Object(map) => JmxValue::Composite(
            map.into_iter()
                .map(|(k, v)| (k, json_to_value(v)))
                .collect(),
        ),
    }
}

/// TabularData 변환
///
/// Nested objects are descended until a row object (one holding a scalar) is
/// reached; the keys on the way form the row's index tuple. A flat object of
/// scalars is a `Map` MXBean and becomes `key`/`value` rows.
pub fn json_to_tabular(value: Value) -> JmxValue {
    let Value::Object(map) = value else {
        return json_to_value(value);
    };

    if !map.is_empty() && map.values().all(|v| !v.is_object() && !v.is_array()) {
        let rows = map
            .into_iter()
            .map(|(key, v)| TabularRow {
                key: vec![key.clone()],
                values: BTreeMap::from([
                    ("key".to_string(), JmxValue::String(key)),
                    ("value".to_string(), json_to_value(v)),
                ]),
            })
            .collect();
        return JmxValue::Tabular(TabularData {
            index_names: vec!["key".to_string()],
            rows,
        });
    }

    let mut rows = Vec::new();
    collect_rows(map, &mut Vec::new(), &mut rows);

    let depth = rows.first().map_or(0, |row| row.key.len());
    let index_names = (0..depth)
        .map(|level| index_name(&rows, level, depth))
        .collect();

    JmxValue::Tabular(TabularData { index_names, rows })
}

fn is_row(map: &serde_json::Map<String, Value>) -> bool {
    map.values().any(|v| !v.is_object())
}

fn collect_rows(map: serde_json::Map<String, Value>, key: &mut Vec<String>, rows: &mut Vec<TabularRow>) {
    for (segment, value) in map {
        let Value::Object(inner) = value else {
            continue;
        };
        key.push(segment);
        if is_row(&inner) {
            rows.push(TabularRow {
                key: key.clone(),
                values: inner
                    .into_iter()
                    .map(|(k, v)| (k, json_to_value(v)))
                    .collect(),
            });
        } else {
            collect_rows(inner, key, rows);
        }
        key.pop();
    }
}

// the column whose value equals the key segment in every row
fn index_name(rows: &[TabularRow], level: usize, depth: usize) -> String {
    let fallback = || {
        if depth == 1 {
            "key".to_string()
        } else {
            format!("key{}", level)
        }
    };
    let Some(first) = rows.first() else {
        return fallback();
    };
    first
        .values
        .iter()
        .filter(|(_, v)| v.scalar_string().as_deref() == first.key.get(level).map(String::as_str))
        .map(|(column, _)| column)
        .find(|column| {
            rows.iter().all(|row| {
                row.values.get(*column).and_then(JmxValue::scalar_string).as_deref()
                    == row.key.get(level).map(String::as_str)
            })
        })
        .cloned()
        .unwrap_or_else(fallback)
}
