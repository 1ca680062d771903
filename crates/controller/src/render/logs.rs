//! Log store renderer: stateful workload with chunk storage.

use handlebars::Handlebars;
use serde_json::Value;

use super::common::{self, RenderInput, WorkloadParams};
use super::{template_data, ComponentRenderer};
use crate::crds::ComponentKind;
use crate::error::{Error, Result};

pub const TEMPLATE_NAME: &str = "logs-config";
pub const TEMPLATE: &str = include_str!("../../templates/logs.yml.hbs");

const PORT: i32 = 3100;

pub struct LogsRenderer;

impl ComponentRenderer for LogsRenderer {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Logs
    }

    fn render(
        &self,
        handlebars: &Handlebars<'static>,
        input: &RenderInput<'_>,
    ) -> Result<Vec<Value>> {
        let config = handlebars
            .render(TEMPLATE_NAME, &template_data(input, PORT))
            .map_err(|e| Error::ConfigError(format!("logs config render: {e}")))?;

        let params = WorkloadParams {
            image: format!("grafana/loki:{}", input.component.version),
            port: PORT,
            port_name: "http",
            config_filename: "logs.yml",
            config_mount_path: "/etc/logs",
            args: vec!["-config.file=/etc/logs/logs.yml".to_string()],
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
