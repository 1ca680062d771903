//! Dashboard server renderer: stateless workload.

use handlebars::Handlebars;
use serde_json::Value;

use super::common::{self, RenderInput, WorkloadParams};
use super::{template_data, ComponentRenderer};
use crate::crds::ComponentKind;
use crate::error::{Error, Result};

pub const TEMPLATE_NAME: &str = "dashboards-config";
pub const TEMPLATE: &str = include_str!("../../templates/dashboards.ini.hbs");

const PORT: i32 = 3000;

pub struct DashboardsRenderer;

impl ComponentRenderer for DashboardsRenderer {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Dashboards
    }

    fn render(
        &self,
        handlebars: &Handlebars<'static>,
        input: &RenderInput<'_>,
    ) -> Result<Vec<Value>> {
        let config = handlebars
            .render(TEMPLATE_NAME, &template_data(input, PORT))
            .map_err(|e| Error::ConfigError(format!("dashboards config render: {e}")))?;

        let params = WorkloadParams {
            image: format!("grafana/grafana:{}", input.component.version),
            port: PORT,
            port_name: "http",
            config_filename: "dashboards.ini",
            config_mount_path: "/etc/dashboards",
            args: vec!["--config=/etc/dashboards/dashboards.ini".to_string()],
            stateful: false,
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
