//! Reporter writing every point to the log

use tracing::{info, warn};

use super::{Reporter, ServiceCheckStatus};
use crate::metric::MetricType;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Reporter for ConsoleReporter {
    fn send_metric_point(&self, metric_type: MetricType, name: &str, value: f64, tags: &[String]) {
        info!(metric = %name, kind = %metric_type, value, tags = %tags.join(","), "Metric point");
    }

    fn send_service_check(
        &self,
        check_name: &str,
        status: ServiceCheckStatus,
        message: Option<&str>,
        tags: &[String],
    ) {
        match status {
            ServiceCheckStatus::Ok => {
                info!(check = %check_name, status = %status, tags = %tags.join(","), "Service check")
            }
            _ => warn!(
                check = %check_name,
                status = %status,
                detail = message.unwrap_or_default(),
                tags = %tags.join(","),
                "Service check"
            ),
        }
    }
}
