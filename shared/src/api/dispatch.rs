use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{ApiClient, ApiError, AuthResult};
use crate::capabilities::{HttpTransport, KeyValueBackend};
use crate::model::{ProfileUpdate, ReportId};
use crate::outbox::{DispatchError, Dispatcher, QueuedMutation};

pub const UPDATE_PROFILE: &str = "UPDATE_PROFILE";
pub const CHANGE_PASSWORD: &str = "CHANGE_PASSWORD";
pub const CREATE_REPORT: &str = "CREATE_REPORT";
pub const UPDATE_REPORT: &str = "UPDATE_REPORT";
pub const DELETE_REPORT: &str = "DELETE_REPORT";
pub const RESTORE_REPORT: &str = "RESTORE_REPORT";
pub const EMPTY_TRASH: &str = "EMPTY_TRASH";

impl From<ApiError> for DispatchError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Http(e) => DispatchError::Http(e),
            ApiError::Unauthorized { .. } | ApiError::SessionExpired { .. } => {
                DispatchError::Unauthenticated
            }
            other => DispatchError::permanent(other.to_string()),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordChange {
    current_password: String,
    new_password: String,
}

#[derive(Deserialize)]
struct ReportRef {
    #[serde(alias = "_id", alias = "reportId")]
    id: ReportId,
}

/// Replays queued mutations through an [`ApiClient`].
pub struct ApiDispatcher<T, B> {
    client: Arc<ApiClient<T, B>>,
}

impl<T, B> Clone for ApiDispatcher<T, B> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl<T: HttpTransport, B: KeyValueBackend> ApiDispatcher<T, B> {
    pub fn new(client: Arc<ApiClient<T, B>>) -> Self {
        Self { client }
    }
}

fn payload<P: serde::de::DeserializeOwned>(mutation: &QueuedMutation) -> Result<P, DispatchError> {
    serde_json::from_value(mutation.payload.clone()).map_err(|e| DispatchError::InvalidPayload {
        kind: mutation.kind.clone(),
        reason: e.to_string(),
    })
}

/// Report changes travel either under `data` or inline next to the id.
fn report_changes(mutation: &QueuedMutation) -> Result<Value, DispatchError> {
    let Some(object) = mutation.payload.as_object() else {
        return Err(DispatchError::InvalidPayload {
            kind: mutation.kind.clone(),
            reason: "payload must be an object".into(),
        });
    };
    if let Some(data) = object.get("data") {
        return Ok(data.clone());
    }
    let changes = object
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "id" | "_id" | "reportId"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(Value::Object(changes))
}

fn accepted(result: AuthResult) -> Result<(), DispatchError> {
    if result.success {
        Ok(())
    } else {
        Err(DispatchError::permanent(
            result
                .message
                .unwrap_or_else(|| "server rejected the change".into()),
        ))
    }
}

#[async_trait]
impl<T: HttpTransport, B: KeyValueBackend> Dispatcher for ApiDispatcher<T, B> {
    async fn dispatch(&self, mutation: &QueuedMutation) -> Result<(), DispatchError> {
        debug!(id = %mutation.id, kind = %mutation.kind, "dispatching queued mutation");
        match mutation.kind.as_str() {
            UPDATE_PROFILE => {
                let update: ProfileUpdate = payload(mutation)?;
                accepted(self.client.update_profile(&update).await?)
            }
            CHANGE_PASSWORD => {
                let change: PasswordChange = payload(mutation)?;
                accepted(
                    self.client
                        .change_password(&change.current_password, &change.new_password)
                        .await?,
                )
            }
            CREATE_REPORT => {
                if !mutation.payload.is_object() {
                    return Err(DispatchError::InvalidPayload {
                        kind: mutation.kind.clone(),
                        reason: "payload must be an object".into(),
                    });
                }
                self.client.create_report(&mutation.payload).await?;
                Ok(())
            }
            UPDATE_REPORT => {
                let target: ReportRef = payload(mutation)?;
                let changes = report_changes(mutation)?;
                self.client.update_report(&target.id, &changes).await?;
                Ok(())
            }
            DELETE_REPORT => {
                let target: ReportRef = payload(mutation)?;
                self.client.delete_report(&target.id).await?;
                Ok(())
            }
            RESTORE_REPORT => {
                let target: ReportRef = payload(mutation)?;
                self.client.restore_report(&target.id).await?;
                Ok(())
            }
            EMPTY_TRASH => {
                self.client.empty_trash().await?;
                Ok(())
            }
            other => Err(DispatchError::UnknownType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::ScriptedTransport;
    use crate::capabilities::{HttpError, HttpMethod, MemoryKv};
    use crate::config::{ApiConfig, QueueConfig};
    use crate::outbox::{NewMutation, SyncQueue};
    use crate::session::SessionState;
    use serde_json::json;

    fn dispatcher() -> (Arc<ScriptedTransport>, ApiDispatcher<ScriptedTransport, MemoryKv>) {
        let transport = Arc::new(ScriptedTransport::new());
        let client = ApiClient::new(
            Arc::clone(&transport),
            Arc::new(MemoryKv::new()),
            Arc::new(SessionState::new()),
            &ApiConfig::default(),
        )
        .unwrap();
        (transport, ApiDispatcher::new(Arc::new(client)))
    }

    fn mutation(kind: &str, payload: Value) -> QueuedMutation {
        QueuedMutation {
            id: crate::model::MutationId::new("1"),
            kind: kind.into(),
            payload,
            created_at: 1,
            attempts: 0,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_routes_each_type() {
        let (transport, dispatcher) = dispatcher();
        for _ in 0..7 {
            transport.push_json(200, json!({"success": true}));
        }

        let cases = [
            (UPDATE_PROFILE, json!({"firstName": "Ama"})),
            (
                CHANGE_PASSWORD,
                json!({"currentPassword": "a", "newPassword": "b"}),
            ),
            (CREATE_REPORT, json!({"drugName": "X"})),
            (UPDATE_REPORT, json!({"id": "r1", "status": "resolved"})),
            (DELETE_REPORT, json!({"id": "r1"})),
            (RESTORE_REPORT, json!({"_id": "r1"})),
            (EMPTY_TRASH, Value::Null),
        ];
        for (kind, payload) in cases {
            dispatcher.dispatch(&mutation(kind, payload)).await.unwrap();
        }

        let sent: Vec<_> = transport
            .requests()
            .iter()
            .map(|r| (r.method(), r.url().path()))
            .collect();
        assert_eq!(
            sent,
            vec![
                (HttpMethod::Put, "/api/auth/update-profile".to_string()),
                (HttpMethod::Put, "/api/auth/change-password".to_string()),
                (HttpMethod::Post, "/api/reports".to_string()),
                (HttpMethod::Put, "/api/reports/r1".to_string()),
                (HttpMethod::Delete, "/api/reports/r1".to_string()),
                (HttpMethod::Put, "/api/reports/r1/restore".to_string()),
                (HttpMethod::Delete, "/api/reports/trash".to_string()),
            ]
        );
        let update_body: Value =
            serde_json::from_slice(transport.requests()[3].body().unwrap()).unwrap();
        assert_eq!(update_body, json!({"status": "resolved"}));
    }

    #[tokio::test]
    async fn test_update_report_data_envelope() {
        let (transport, dispatcher) = dispatcher();
        transport.push_json(200, json!({}));

        dispatcher
            .dispatch(&mutation(
                UPDATE_REPORT,
                json!({"id": "r2", "data": {"notes": "follow up"}}),
            ))
            .await
            .unwrap();

        let body: Value = serde_json::from_slice(transport.requests()[0].body().unwrap()).unwrap();
        assert_eq!(body, json!({"notes": "follow up"}));
    }

    #[tokio::test]
    async fn test_unknown_type_and_bad_payload_are_permanent() {
        let (transport, dispatcher) = dispatcher();

        let unknown = dispatcher
            .dispatch(&mutation("SEND_FAX", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(unknown, DispatchError::UnknownType(ref k) if k == "SEND_FAX"));
        assert!(!unknown.is_retryable());

        let bad = dispatcher
            .dispatch(&mutation(DELETE_REPORT, json!({"nope": 1})))
            .await
            .unwrap_err();
        assert!(matches!(bad, DispatchError::InvalidPayload { .. }));
        assert!(!bad.is_retryable());

        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_server_errors_classified_by_status() {
        let (transport, dispatcher) = dispatcher();
        transport.push_json(503, json!({"message": "maintenance"}));
        transport.push_json(400, json!({"message": "bad"}));

        let busy = dispatcher
            .dispatch(&mutation(CREATE_REPORT, json!({})))
            .await
            .unwrap_err();
        assert!(busy.is_retryable());

        let rejected = dispatcher
            .dispatch(&mutation(CREATE_REPORT, json!({})))
            .await
            .unwrap_err();
        assert!(!rejected.is_retryable());
    }

    #[tokio::test]
    async fn test_rejected_profile_update_is_permanent() {
        let (transport, dispatcher) = dispatcher();
        transport.push_json(200, json!({"success": false, "message": "Phone already in use"}));

        let err = dispatcher
            .dispatch(&mutation(UPDATE_PROFILE, json!({"phoneNumber": "1"})))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Phone already in use");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_flush_through_api_dispatcher() {
        let (transport, dispatcher) = dispatcher();
        let queue = SyncQueue::new(Arc::new(MemoryKv::new()), QueueConfig::default());
        queue
            .enqueue(NewMutation::new(DELETE_REPORT, json!({"id": "r1"})))
            .await;
        queue
            .enqueue(NewMutation::new(DELETE_REPORT, json!({"id": "r2"})))
            .await;
        transport.push_json(200, json!({}));
        transport.push_error(HttpError::ConnectionError {
            host: "api.medalert.app".into(),
            message: "offline".into(),
        });

        let report = queue.flush(&dispatcher).await;

        assert_eq!(report.flushed, 1);
        assert_eq!(report.remaining, 1);
        let left = queue.peek_all().await;
        assert_eq!(left[0].payload, json!({"id": "r2"}));
    }
}
