//! REST client for the ISY node server API.
//!
//! Every upstream report becomes one `GET` under `/rest/ns/<profile>/...`
//! (`restcall` goes to `/rest/<api>`), with basic auth and exponential
//! back-off on 5xx responses and connection failures. Timeouts are not
//! retried.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;

use pg_domain::config::ControllerConfig;
use pg_manager::{Controller, ControllerError, Delivery};
use pg_protocol::UpstreamReport;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RestController {
    http: Client,
    base_url: Url,
    username: String,
    password: Option<String>,
    max_retries: u32,
}

impl RestController {
    pub fn new(cfg: &ControllerConfig) -> Result<Self, ControllerError> {
        let http = Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(|e| ControllerError::Client(e.to_string()))?;
        let base_url = Url::parse(cfg.base_url.trim_end_matches('/'))
            .map_err(|e| ControllerError::Client(format!("invalid base_url `{}`: {e}", cfg.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(ControllerError::Client(format!("base_url `{}` is not a URL base", cfg.base_url)));
        }
        let password = cfg.password();
        if password.is_none() {
            tracing::warn!(env = %cfg.password_env, "controller password not set");
        }

        Ok(Self {
            http,
            base_url,
            username: cfg.username.clone(),
            password,
            max_retries: cfg.max_retries,
        })
    }

    // ── URL building ─────────────────────────────────────────────────

    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejected cannot-be-a-base URLs, so this always succeeds.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// `/rest/ns/<profile>/nodes/<address>/<tail...>`
    fn node_url(&self, profile: u32, address: &str, tail: &[&str]) -> Url {
        let profile = profile.to_string();
        let head = ["rest", "ns", profile.as_str(), "nodes", address];
        self.url(head.into_iter().chain(tail.iter().copied()))
    }

    /// The REST call a report maps to. `timeout` and `seq` stay local.
    pub fn report_url(&self, profile: u32, report: &UpstreamReport) -> Url {
        match report {
            UpstreamReport::Status(r) => {
                let (value, uom) = (segment(&r.value), segment(&r.uom));
                let tail = ["report", "status", r.driver_control.as_str(), value.as_str(), uom.as_str()];
                self.node_url(profile, &r.node_address, &tail)
            }
            UpstreamReport::Command(r) => {
                let value_uom = match (&r.value, &r.uom) {
                    (Some(value), Some(uom)) => Some((segment(value), segment(uom))),
                    _ => None,
                };
                let mut tail = vec!["report", "cmd", r.command.as_str()];
                if let Some((value, uom)) = &value_uom {
                    tail.extend([value.as_str(), uom.as_str()]);
                }
                let mut url = self.node_url(profile, &r.node_address, &tail);
                if !r.params.is_empty() {
                    let mut query = url.query_pairs_mut();
                    for (name, value) in &r.params {
                        query.append_pair(name, &segment(value));
                    }
                }
                url
            }
            UpstreamReport::Add(r) => {
                let mut url = self.node_url(profile, &r.node_address, &["add", r.node_def_id.as_str()]);
                url.query_pairs_mut()
                    .append_pair("primary", &r.primary)
                    .append_pair("name", &r.name);
                url
            }
            UpstreamReport::Change(r) => {
                self.node_url(profile, &r.node_address, &["change", r.node_def_id.as_str()])
            }
            UpstreamReport::Remove(r) => self.node_url(profile, &r.node_address, &["remove"]),
            UpstreamReport::Request(r) => {
                let profile = profile.to_string();
                let result = if r.result { "success" } else { "failed" };
                self.url(["rest", "ns", profile.as_str(), "report", "request", r.request_id.as_str(), result])
            }
            UpstreamReport::RestCall(r) => {
                let api = r.api.split('/').filter(|s| !s.is_empty());
                self.url(std::iter::once("rest").chain(api))
            }
        }
    }

    // ── retry engine ─────────────────────────────────────────────────

    /// Issue `GET url`, retrying 5xx responses and connection failures.
    /// 4xx responses and timeouts are returned at once.
    async fn get_with_retry(
        &self,
        command: &str,
        url: Url,
        timeout: Option<Duration>,
        text_needed: bool,
    ) -> Result<Delivery, ControllerError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(100 * 2u64.pow((attempt - 1).min(10)));
                tokio::time::sleep(backoff).await;
            }

            let mut rb = self
                .http
                .get(url.clone())
                .basic_auth(&self.username, self.password.as_deref());
            if let Some(timeout) = timeout {
                rb = rb.timeout(timeout);
            }

            match rb.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(command, url = %url, attempt, "report delivered");
                    let status_code = resp.status().as_u16();
                    let text = if text_needed {
                        let body = resp.text().await.map_err(|e| ControllerError::Unreachable {
                            reason: format!("reading response body: {e}"),
                            retries: attempt,
                        })?;
                        Some(body)
                    } else {
                        None
                    };
                    return Ok(Delivery {
                        status_code,
                        text,
                        retries: attempt,
                    });
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let err = ControllerError::Rejected {
                        command: command.to_string(),
                        status,
                        retries: attempt,
                    };
                    if !resp.status().is_server_error() {
                        return Err(err);
                    }
                    tracing::debug!(command, status, attempt, "controller error, retrying");
                    last_err = Some(err);
                }
                Err(e) if e.is_timeout() => return Err(ControllerError::Timeout(e.to_string())),
                Err(e) => {
                    tracing::debug!(command, error = %e, attempt, "controller unreachable, retrying");
                    last_err = Some(ControllerError::Unreachable {
                        reason: e.to_string(),
                        retries: attempt,
                    });
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ControllerError::Unreachable {
            reason: format!("{command}: all retries exhausted"),
            retries: self.max_retries,
        }))
    }
}

#[async_trait]
impl Controller for RestController {
    async fn send(&self, profile_number: u32, report: &UpstreamReport) -> Result<Delivery, ControllerError> {
        let url = self.report_url(profile_number, report);
        let text_needed = matches!(report, UpstreamReport::RestCall(_));
        self.get_with_retry(report.command(), url, report.timeout(), text_needed)
            .await
    }
}

/// A JSON value as a bare path/query segment (strings unquoted).
fn segment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_protocol::{AddNode, CommandReport, RemoveNode, RequestReport, RestCall, StatusReport};
    use serde_json::json;

    fn client(base_url: &str) -> RestController {
        RestController::new(&ControllerConfig {
            base_url: base_url.into(),
            max_retries: 0,
            ..Default::default()
        })
        .unwrap()
    }

    fn isy() -> RestController {
        client("http://isy.local:8080/")
    }

    #[test]
    fn status_url() {
        let report = UpstreamReport::Status(StatusReport {
            node_address: "hue_light1".into(),
            driver_control: "ST".into(),
            value: json!(100),
            uom: json!(51),
            timeout: Some(json!(10)),
            seq: Some(json!(1001)),
        });
        assert_eq!(
            isy().report_url(3, &report).as_str(),
            "http://isy.local:8080/rest/ns/3/nodes/hue_light1/report/status/ST/100/51"
        );
    }

    #[test]
    fn command_url_with_params() {
        let mut params = std::collections::BTreeMap::new();
        params.insert("ramp.58".to_string(), json!(2.5));
        let report = UpstreamReport::Command(CommandReport {
            node_address: "hue_light1".into(),
            command: "DON".into(),
            value: Some(json!("75")),
            uom: Some(json!(51)),
            timeout: None,
            seq: Some(json!(12)),
            params,
        });
        assert_eq!(
            isy().report_url(3, &report).as_str(),
            "http://isy.local:8080/rest/ns/3/nodes/hue_light1/report/cmd/DON/75/51?ramp.58=2.5"
        );
    }

    #[test]
    fn add_url_encodes_name() {
        let report = UpstreamReport::Add(AddNode {
            node_address: "hue_light1".into(),
            node_def_id: "COLOR_LIGHT".into(),
            primary: "hue_hub".into(),
            name: "Kitchen Lamp".into(),
            timeout: None,
            seq: None,
        });
        assert_eq!(
            isy().report_url(5, &report).as_str(),
            "http://isy.local:8080/rest/ns/5/nodes/hue_light1/add/COLOR_LIGHT?primary=hue_hub&name=Kitchen+Lamp"
        );
    }

    #[test]
    fn remove_and_request_urls() {
        let remove = UpstreamReport::Remove(RemoveNode {
            node_address: "hue_light 2".into(),
            timeout: None,
            seq: None,
        });
        assert_eq!(
            isy().report_url(1, &remove).as_str(),
            "http://isy.local:8080/rest/ns/1/nodes/hue_light%202/remove"
        );

        let failed = UpstreamReport::Request(RequestReport {
            request_id: "42".into(),
            result: false,
            timeout: None,
            seq: None,
        });
        assert_eq!(
            isy().report_url(1, &failed).as_str(),
            "http://isy.local:8080/rest/ns/1/report/request/42/failed"
        );
    }

    #[test]
    fn restcall_url_is_outside_the_profile() {
        let call = UpstreamReport::RestCall(RestCall {
            api: "/nodes/hue_light1/".into(),
            timeout: None,
            seq: Some(json!(7)),
        });
        assert_eq!(
            isy().report_url(4, &call).as_str(),
            "http://isy.local:8080/rest/nodes/hue_light1"
        );
    }

    #[test]
    fn rejects_bad_base_url() {
        let cfg = ControllerConfig {
            base_url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(RestController::new(&cfg), Err(ControllerError::Client(_))));
    }

    #[tokio::test]
    async fn unreachable_controller() {
        let report = UpstreamReport::Remove(RemoveNode {
            node_address: "hue_light1".into(),
            timeout: None,
            seq: None,
        });
        let err = client("http://127.0.0.1:1").send(1, &report).await.unwrap_err();
        assert!(matches!(err, ControllerError::Unreachable { .. }));
        assert_eq!(err.status_code(), 4);
    }
}
