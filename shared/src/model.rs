use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(UserId);
typed_id!(ReportId);
typed_id!(MutationId);

/// Signed-in user as cached under the `user` key.
///
/// Fields the backend sends that are not modelled here are kept in
/// `extra` so a round trip through the cache does not drop them.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UserProfile {
    pub fn display_name(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(first), None) => Some(first.clone()),
            (None, Some(last)) => Some(last.clone()),
            (None, None) => None,
        }
    }
}

// Redact contact details; profiles end up in logs via error context.
impl fmt::Debug for UserProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserProfile")
            .field("id", &self.id)
            .field("email_present", &self.email.is_some())
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("phone_present", &self.phone_number.is_some())
            .field("avatar_present", &self.avatar.is_some())
            .field("extra_fields", &self.extra.len())
            .finish()
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

impl fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("password", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// A medication safety report.
///
/// Only the identifier and status are interpreted by the core; the rest
/// of the report is passed through untouched.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Report {
    #[serde(alias = "_id")]
    pub id: ReportId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_id_is_transparent() {
        let id = ReportId::new("r-1");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("r-1"));
        assert_eq!(id.to_string(), "r-1");
    }

    #[test]
    fn test_profile_keeps_unknown_fields() {
        let raw = json!({"id": "u1", "firstName": "Ama", "role": "pharmacist"});
        let profile: UserProfile = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(profile.first_name.as_deref(), Some("Ama"));
        assert_eq!(profile.extra.get("role"), Some(&json!("pharmacist")));
        assert_eq!(serde_json::to_value(&profile).unwrap(), raw);
    }

    #[test]
    fn test_profile_debug_redacts_contact_details() {
        let profile = UserProfile {
            email: Some("ama@example.com".into()),
            phone_number: Some("+233000000".into()),
            ..Default::default()
        };
        let debug = format!("{profile:?}");
        assert!(!debug.contains("ama@example.com"));
        assert!(!debug.contains("+233000000"));
    }

    #[test]
    fn test_register_request_debug_redacts_password() {
        let request = RegisterRequest {
            first_name: "Ama".into(),
            last_name: "Mensah".into(),
            email: "ama@example.com".into(),
            password: "hunter22".into(),
            phone_number: None,
        };
        assert!(!format!("{request:?}").contains("hunter22"));
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["firstName"], "Ama");
        assert!(body.get("phoneNumber").is_none());
    }

    #[test]
    fn test_report_accepts_mongo_style_id() {
        let report: Report =
            serde_json::from_value(json!({"_id": "r9", "status": "pending", "drugName": "X"}))
                .unwrap();
        assert_eq!(report.id.as_str(), "r9");
        assert_eq!(report.status.as_deref(), Some("pending"));
        assert_eq!(report.fields.get("drugName"), Some(&json!("X")));
    }

    #[test]
    fn test_display_name() {
        let profile = UserProfile {
            first_name: Some("Ama".into()),
            last_name: Some("Mensah".into()),
            ..Default::default()
        };
        assert_eq!(profile.display_name().as_deref(), Some("Ama Mensah"));
        assert_eq!(UserProfile::default().display_name(), None);
    }
}
