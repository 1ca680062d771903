//! Metrics server renderer: stateful workload with TSDB storage.

use handlebars::Handlebars;
use serde_json::Value;

use super::common::{self, RenderInput, WorkloadParams};
use super::{template_data, ComponentRenderer};
use crate::crds::ComponentKind;
use crate::error::{Error, Result};

pub const TEMPLATE_NAME: &str = "metrics-config";
pub const TEMPLATE: &str = include_str!("../../templates/metrics.yml.hbs");

const PORT: i32 = 9090;

pub struct MetricsRenderer;

impl ComponentRenderer for MetricsRenderer {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Metrics
    }

    fn render(
        &self,
        handlebars: &Handlebars<'static>,
        input: &RenderInput<'_>,
    ) -> Result<Vec<Value>> {
        let config = handlebars
            .render(TEMPLATE_NAME, &template_data(input, PORT))
            .map_err(|e| Error::ConfigError(format!("metrics config render: {e}")))?;

        let params = WorkloadParams {
            image: format!("prom/prometheus:{}", input.component.version),
            port: PORT,
            port_name: "http",
            config_filename: "metrics.yml",
            config_mount_path: "/etc/metrics",
            args: vec![
                "--config.file=/etc/metrics/metrics.yml".to_string(),
                "--storage.tsdb.path=/data".to_string(),
                format!(
                    "--storage.tsdb.retention.time={}",
                    input.component.retention.as_deref().unwrap_or("30d")
                ),
            ],
            stateful: true,
            data_mount_path: "/data",
        };

        let mut objects = vec![
            common::config_map(input, params.config_filename, &config),
            common::service(input, PORT, params.port_name),
            common::workload(input, &params),
        ];
        if let Some(pdb) = common::pod_disruption_budget(input) {
            objects.push(pdb);
        }
        Ok(objects)
    }
}
