//! fleet backend.
//!
//! Units are compiled with a [`UnitTemplate`] and submitted through the
//! fleet v1 HTTP API, one request per unit:
//!
//! - `PUT /fleet/v1/units/<name>.service` creates or updates a unit. fleet
//!   answers `409 Conflict` when the unit exists with different options;
//!   that is resolved as a replace (destroy, then create).
//! - `DELETE /fleet/v1/units/<name>.service` destroys a unit; `404` means
//!   it is already gone.
//! - Observed state joins `GET /fleet/v1/units` (options, for the recorded
//!   spec hash) with `GET /fleet/v1/state` (machine and systemd state).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use flotilla_id::{JobName, MinionId};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::unit::{job_name, spec_hash_of, unit_name, UnitFile, UnitOption, UnitTemplate};
use super::{batch_result, Backend, BackendError, ContainerState, UnitFailure};
use crate::job::{Container, State};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const API_PREFIX: &str = "/fleet/v1";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnitRequest<'a> {
    desired_state: &'a str,
    options: &'a [UnitOption],
}

#[derive(Debug, Deserialize)]
struct FleetUnit {
    name: String,
    #[serde(default)]
    options: Vec<UnitOption>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FleetUnitState {
    name: String,
    #[serde(rename = "machineID", default)]
    machine_id: Option<String>,
    #[serde(default)]
    systemd_active_state: Option<String>,
}

/// One page of a fleet list response.
trait Page: DeserializeOwned {
    type Item;

    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnitPage {
    #[serde(default)]
    units: Vec<FleetUnit>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl Page for UnitPage {
    type Item = FleetUnit;

    fn into_parts(self) -> (Vec<FleetUnit>, Option<String>) {
        (self.units, self.next_page_token)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatePage {
    #[serde(default)]
    states: Vec<FleetUnitState>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl Page for StatePage {
    type Item = FleetUnitState;

    fn into_parts(self) -> (Vec<FleetUnitState>, Option<String>) {
        (self.states, self.next_page_token)
    }
}

/// Maps systemd's `ActiveState` onto job state.
fn job_state(active_state: Option<&str>) -> State {
    match active_state {
        Some("active") => State::Running,
        Some("failed") => State::Failed,
        _ => State::Pending,
    }
}

/// Schedules units through the fleet HTTP API.
#[derive(Debug, Clone)]
pub struct FleetBackend {
    http: reqwest::Client,
    base_url: String,
    template: UnitTemplate,
}

impl FleetBackend {
    /// Create a backend for the fleet API at `base_url`.
    pub fn new(base_url: impl Into<String>, template: UnitTemplate) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            template,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Api { status, body })
    }

    async fn put_unit(&self, unit: &UnitFile) -> Result<StatusCode, BackendError> {
        let request = UnitRequest {
            desired_state: "launched",
            options: &unit.options,
        };
        let response = self
            .http
            .put(self.url(&format!("/units/{}", unit.name)))
            .json(&request)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(StatusCode::CONFLICT);
        }
        Ok(Self::check(response).await?.status())
    }

    /// Destroy a unit. Returns false if it did not exist.
    async fn delete_unit(&self, unit: &str) -> Result<bool, BackendError> {
        let response = self
            .http
            .delete(self.url(&format!("/units/{unit}")))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    async fn schedule_one(&self, container: &Container) -> Result<(), BackendError> {
        let unit = self.template.compile(container)?;

        if self.put_unit(&unit).await? == StatusCode::CONFLICT {
            debug!(unit = %unit.name, "Unit exists with different options, replacing");
            self.delete_unit(&unit.name).await?;
            let status = self.put_unit(&unit).await?;
            if status == StatusCode::CONFLICT {
                return Err(BackendError::Api {
                    status: status.as_u16(),
                    body: format!("unit {} still conflicts after destroy", unit.name),
                });
            }
        }

        Ok(())
    }

    async fn get_all<P: Page>(&self, path: &str) -> Result<Vec<P::Item>, BackendError> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut request = self.http.get(self.url(path));
            if let Some(token) = &token {
                request = request.query(&[("nextPageToken", token)]);
            }
            let page: P = Self::check(request.send().await?).await?.json().await?;

            let (mut batch, next) = page.into_parts();
            items.append(&mut batch);
            match next {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => return Ok(items),
            }
        }
    }
}

#[async_trait]
impl Backend for FleetBackend {
    fn name(&self) -> &'static str {
        "fleet"
    }

    #[instrument(skip_all, fields(count = containers.len()))]
    async fn schedule(&self, containers: &[Container]) -> Result<(), BackendError> {
        let mut failures = Vec::new();

        for container in containers {
            match self.schedule_one(container).await {
                Ok(()) => info!(unit = %container.name, image = %container.image, "Scheduled unit"),
                Err(error) => {
                    warn!(unit = %container.name, error = %error, "Failed to schedule unit");
                    failures.push(UnitFailure {
                        name: container.name.clone(),
                        error,
                    });
                }
            }
        }

        batch_result(containers.len(), failures)
    }

    #[instrument(skip_all, fields(count = names.len()))]
    async fn unschedule(&self, names: &[JobName]) -> Result<(), BackendError> {
        let mut failures = Vec::new();

        for name in names {
            match self.delete_unit(&unit_name(name)).await {
                Ok(existed) => info!(unit = %name, existed, "Unscheduled unit"),
                Err(error) => {
                    warn!(unit = %name, error = %error, "Failed to unschedule unit");
                    failures.push(UnitFailure {
                        name: name.clone(),
                        error,
                    });
                }
            }
        }

        batch_result(names.len(), failures)
    }

    async fn container_states(&self) -> Result<Vec<ContainerState>, BackendError> {
        let units = self.get_all::<UnitPage>("/units").await?;
        let states: BTreeMap<String, FleetUnitState> = self
            .get_all::<StatePage>("/state")
            .await?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        let mut observed: Vec<ContainerState> = units
            .into_iter()
            .filter_map(|unit| {
                let name = job_name(&unit.name)?;
                let state = states.get(&unit.name);
                Some(ContainerState {
                    name,
                    machine_id: state
                        .and_then(|s| s.machine_id.as_deref())
                        .and_then(|id| MinionId::parse(id).ok()),
                    state: job_state(state.and_then(|s| s.systemd_active_state.as_deref())),
                    spec_hash: spec_hash_of(&unit.options),
                })
            })
            .collect();
        observed.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(units = observed.len(), "Fetched fleet unit states");
        Ok(observed)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Some("active"), State::Running)]
    #[case(Some("failed"), State::Failed)]
    #[case(Some("activating"), State::Pending)]
    #[case(Some("inactive"), State::Pending)]
    #[case(None, State::Pending)]
    fn test_job_state(#[case] active: Option<&str>, #[case] expected: State) {
        assert_eq!(job_state(active), expected);
    }

    #[test]
    fn test_decode_state_page() {
        let page: StatePage = serde_json::from_value(serde_json::json!({
            "states": [{
                "name": "acme.web.1.service",
                "hash": "abc",
                "machineID": "m1",
                "systemdLoadState": "loaded",
                "systemdActiveState": "active",
                "systemdSubState": "running"
            }],
            "nextPageToken": "p2"
        }))
        .unwrap();

        let (states, next) = page.into_parts();
        assert_eq!(states[0].machine_id.as_deref(), Some("m1"));
        assert_eq!(states[0].systemd_active_state.as_deref(), Some("active"));
        assert_eq!(next.as_deref(), Some("p2"));
    }

    #[test]
    fn test_unit_request_shape() {
        let options = vec![UnitOption {
            section: "Service".to_string(),
            name: "Restart".to_string(),
            value: "on-failure".to_string(),
        }];
        let body = serde_json::to_value(UnitRequest {
            desired_state: "launched",
            options: &options,
        })
        .unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "desiredState": "launched",
                "options": [{"section": "Service", "name": "Restart", "value": "on-failure"}]
            })
        );
    }
}
