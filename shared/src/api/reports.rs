use serde_json::Value;
use tracing::{instrument, warn};

use super::{normalize, ApiClient, ApiError};
use crate::capabilities::{HttpError, HttpMethod, HttpTransport, KeyValueBackend};
use crate::model::{Report, ReportId};

pub const REPORTS_PATH: &str = "/api/reports";
pub const DELETED_REPORTS_PATH: &str = "/api/reports/deleted";
pub const TRASH_PATH: &str = "/api/reports/trash";

/// Accepts ids and statuses that are safe to splice into a path.
fn path_segment(value: &str) -> Result<&str, ApiError> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(value)
    } else {
        Err(HttpError::InvalidRequest {
            reason: format!("'{}' is not a valid path segment", value.escape_default()),
        }
        .into())
    }
}

fn parse_reports(body: &Value) -> Vec<Report> {
    normalize::list(body)
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "skipping malformed report");
                None
            }
        })
        .collect()
}

fn parse_report(body: &Value) -> Option<Report> {
    let entity = normalize::report(body)?;
    match serde_json::from_value(entity.clone()) {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(error = %e, "report in response does not parse");
            None
        }
    }
}

impl<T: HttpTransport, B: KeyValueBackend> ApiClient<T, B> {
    #[instrument(skip_all)]
    pub async fn list_reports(&self) -> Result<Vec<Report>, ApiError> {
        let body = self.request_json(HttpMethod::Get, REPORTS_PATH, None).await?;
        Ok(parse_reports(&body))
    }

    /// Creates a report. The body is passed through as given; the server
    /// owns report validation.
    #[instrument(skip_all)]
    pub async fn create_report(&self, report: &Value) -> Result<Option<Report>, ApiError> {
        let body = self
            .request_json(HttpMethod::Post, REPORTS_PATH, Some(report))
            .await?;
        Ok(parse_report(&body))
    }

    #[instrument(skip(self, changes), fields(id = %id))]
    pub async fn update_report(
        &self,
        id: &ReportId,
        changes: &Value,
    ) -> Result<Option<Report>, ApiError> {
        let path = format!("{}/{}", REPORTS_PATH, path_segment(id.as_str())?);
        let body = self
            .request_json(HttpMethod::Put, &path, Some(changes))
            .await?;
        Ok(parse_report(&body))
    }

    /// Moves a report to the trash.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn delete_report(&self, id: &ReportId) -> Result<(), ApiError> {
        let path = format!("{}/{}", REPORTS_PATH, path_segment(id.as_str())?);
        self.send(HttpMethod::Delete, &path, None).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(id = %id))]
    pub async fn restore_report(&self, id: &ReportId) -> Result<Option<Report>, ApiError> {
        let path = format!("{}/{}/restore", REPORTS_PATH, path_segment(id.as_str())?);
        let body = self.request_json(HttpMethod::Put, &path, None).await?;
        Ok(parse_report(&body))
    }

    #[instrument(skip_all)]
    pub async fn list_deleted_reports(&self) -> Result<Vec<Report>, ApiError> {
        let body = self
            .request_json(HttpMethod::Get, DELETED_REPORTS_PATH, None)
            .await?;
        Ok(parse_reports(&body))
    }

    #[instrument(skip(self))]
    pub async fn list_reports_by_status(&self, status: &str) -> Result<Vec<Report>, ApiError> {
        let path = format!("{}/status/{}", REPORTS_PATH, path_segment(status)?);
        let body = self.request_json(HttpMethod::Get, &path, None).await?;
        Ok(parse_reports(&body))
    }

    /// Permanently removes every trashed report.
    #[instrument(skip_all)]
    pub async fn empty_trash(&self) -> Result<(), ApiError> {
        self.send(HttpMethod::Delete, TRASH_PATH, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::ScriptedTransport;
    use crate::capabilities::MemoryKv;
    use crate::config::ApiConfig;
    use crate::session::SessionState;
    use serde_json::json;
    use std::sync::Arc;

    fn client() -> (Arc<ScriptedTransport>, ApiClient<ScriptedTransport, MemoryKv>) {
        let transport = Arc::new(ScriptedTransport::new());
        let client = ApiClient::new(
            Arc::clone(&transport),
            Arc::new(MemoryKv::new()),
            Arc::new(SessionState::new()),
            &ApiConfig::default(),
        )
        .unwrap();
        (transport, client)
    }

    #[tokio::test]
    async fn test_list_reports_skips_malformed_items() {
        let (transport, client) = client();
        transport.push_json(
            200,
            json!({"data": [{"_id": "r1", "status": "pending"}, {"drugName": "no id"}]}),
        );

        let reports = client.list_reports().await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id.as_str(), "r1");
    }

    #[tokio::test]
    async fn test_report_paths() {
        let (transport, client) = client();
        for _ in 0..6 {
            transport.push_json(200, json!({"success": true}));
        }
        let id = ReportId::new("r1");

        client.update_report(&id, &json!({"status": "resolved"})).await.unwrap();
        client.delete_report(&id).await.unwrap();
        client.restore_report(&id).await.unwrap();
        client.list_deleted_reports().await.unwrap();
        client.list_reports_by_status("pending").await.unwrap();
        client.empty_trash().await.unwrap();

        assert_eq!(
            transport.paths(),
            vec![
                "/api/reports/r1",
                "/api/reports/r1",
                "/api/reports/r1/restore",
                "/api/reports/deleted",
                "/api/reports/status/pending",
                "/api/reports/trash",
            ]
        );
        let methods: Vec<_> = transport.requests().iter().map(|r| r.method()).collect();
        assert_eq!(
            methods,
            vec![
                HttpMethod::Put,
                HttpMethod::Delete,
                HttpMethod::Put,
                HttpMethod::Get,
                HttpMethod::Get,
                HttpMethod::Delete,
            ]
        );
    }

    #[tokio::test]
    async fn test_create_report_returns_created_entity() {
        let (transport, client) = client();
        transport.push_json(
            201,
            json!({"success": true, "data": {"id": "r9", "drugName": "Paracetamol"}}),
        );

        let created = client
            .create_report(&json!({"drugName": "Paracetamol"}))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(created.id.as_str(), "r9");
        assert_eq!(created.fields["drugName"], "Paracetamol");
    }

    #[tokio::test]
    async fn test_unsafe_ids_rejected_before_sending() {
        let (transport, client) = client();

        for bad in ["", "..", "r1/../../admin", "r1?x=1"] {
            let err = client.delete_report(&ReportId::new(bad)).await.unwrap_err();
            assert!(matches!(err, ApiError::Http(HttpError::InvalidRequest { .. })));
        }
        assert!(transport.requests().is_empty());
    }
}
