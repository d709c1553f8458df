//! Response-shape normalization.
//!
//! The backend has answered in several shapes over its lifetime
//! (`{data: {user}}`, `{user}`, a flat `data` object, a flat root). Each
//! lookup here walks an ordered list of shape matchers and takes the first
//! hit, so the precedence is written down in one place and tested.

use secrecy::SecretString;
use serde_json::{Map, Value};

use crate::model::{UserId, UserProfile};

type Matcher = fn(&Value) -> Option<&Value>;

fn data(body: &Value) -> Option<&Value> {
    body.get("data")
}

fn data_user(body: &Value) -> Option<&Value> {
    body.get("data")?.get("user").filter(|u| u.is_object())
}

fn root_user(body: &Value) -> Option<&Value> {
    body.get("user").filter(|u| u.is_object())
}

fn flat_data_user(body: &Value) -> Option<&Value> {
    body.get("data").filter(|d| looks_like_user(d))
}

fn flat_root_user(body: &Value) -> Option<&Value> {
    Some(body).filter(|b| looks_like_user(b))
}

const USER_SHAPES: &[(&str, Matcher)] = &[
    ("data.user", data_user),
    ("user", root_user),
    ("data", flat_data_user),
    ("root", flat_root_user),
];

const ACCESS_TOKEN_FIELDS: &[&str] = &["accessToken", "token", "access_token"];
const REFRESH_TOKEN_FIELDS: &[&str] = &["refreshToken", "refresh_token"];

const ID_FIELDS: &[&str] = &["id", "_id"];
const EMAIL_FIELDS: &[&str] = &["email"];
const FIRST_NAME_FIELDS: &[&str] = &["firstName", "first_name"];
const LAST_NAME_FIELDS: &[&str] = &["lastName", "last_name"];
const PHONE_FIELDS: &[&str] = &["phoneNumber", "phone_number", "phone"];
const AVATAR_FIELDS: &[&str] = &["avatar", "profileImage", "profile_image"];

// Never carried into the cached profile.
const SECRET_FIELDS: &[&str] = &["password", "passwordHash", "password_hash", "__v"];

fn data_list(body: &Value) -> Option<&Value> {
    body.get("data").filter(|d| d.is_array())
}

fn data_reports(body: &Value) -> Option<&Value> {
    body.get("data")?.get("reports").filter(|r| r.is_array())
}

fn root_reports(body: &Value) -> Option<&Value> {
    body.get("reports").filter(|r| r.is_array())
}

fn root_list(body: &Value) -> Option<&Value> {
    Some(body).filter(|b| b.is_array())
}

const LIST_SHAPES: &[(&str, Matcher)] = &[
    ("data", data_list),
    ("data.reports", data_reports),
    ("reports", root_reports),
    ("root", root_list),
];

fn data_report(body: &Value) -> Option<&Value> {
    body.get("data")?.get("report").filter(|r| r.is_object())
}

fn root_report(body: &Value) -> Option<&Value> {
    body.get("report").filter(|r| r.is_object())
}

fn flat_data_entity(body: &Value) -> Option<&Value> {
    body.get("data").filter(|d| has_id(d))
}

fn flat_root_entity(body: &Value) -> Option<&Value> {
    Some(body).filter(|b| has_id(b))
}

const REPORT_SHAPES: &[(&str, Matcher)] = &[
    ("data.report", data_report),
    ("report", root_report),
    ("data", flat_data_entity),
    ("root", flat_root_entity),
];

#[derive(Debug, Default)]
pub struct Tokens {
    pub access: Option<SecretString>,
    pub refresh: Option<SecretString>,
}

fn first_match<'a>(body: &'a Value, shapes: &[(&str, Matcher)]) -> Option<&'a Value> {
    shapes.iter().find_map(|(_, matcher)| matcher(body))
}

fn has_id(value: &Value) -> bool {
    value.is_object() && ID_FIELDS.iter().any(|f| value.get(*f).is_some_and(|v| !v.is_null()))
}

fn looks_like_user(value: &Value) -> bool {
    has_id(value) || value.get("email").is_some_and(Value::is_string)
}

fn first_string(object: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| match object.get(*f)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Extracts the user from whichever shape the body uses.
pub fn user(body: &Value) -> Option<UserProfile> {
    first_match(body, USER_SHAPES).and_then(user_from_object)
}

/// Builds a profile from a single user object, accepting every known alias
/// for each field. Unrecognized fields are kept in `extra`.
pub fn user_from_object(value: &Value) -> Option<UserProfile> {
    let object = value.as_object()?;

    let known = [
        ID_FIELDS,
        EMAIL_FIELDS,
        FIRST_NAME_FIELDS,
        LAST_NAME_FIELDS,
        PHONE_FIELDS,
        AVATAR_FIELDS,
        SECRET_FIELDS,
    ];
    let extra = object
        .iter()
        .filter(|(k, _)| !known.iter().any(|fields| fields.contains(&k.as_str())))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Some(UserProfile {
        id: first_string(object, ID_FIELDS).map(UserId::new),
        email: first_string(object, EMAIL_FIELDS),
        first_name: first_string(object, FIRST_NAME_FIELDS),
        last_name: first_string(object, LAST_NAME_FIELDS),
        phone_number: first_string(object, PHONE_FIELDS),
        avatar: first_string(object, AVATAR_FIELDS),
        extra,
    })
}

/// Token lookup checks `data` before the root, and within each scope the
/// field names in order.
pub fn tokens(body: &Value) -> Tokens {
    let scopes: [Option<&Value>; 2] = [data(body), Some(body)];
    let find = |fields: &[&str]| {
        scopes
            .iter()
            .flatten()
            .filter_map(|scope| scope.as_object())
            .find_map(|object| first_string(object, fields))
            .map(SecretString::new)
    };
    Tokens {
        access: find(ACCESS_TOKEN_FIELDS),
        refresh: find(REFRESH_TOKEN_FIELDS),
    }
}

pub fn message(body: &Value) -> Option<String> {
    let from = |v: Option<&Value>| v?.get("message")?.as_str().map(str::to_string);
    from(Some(body)).or_else(|| from(data(body)))
}

/// An explicit `success` flag wins; otherwise the HTTP status decides.
pub fn success(body: &Value, status_ok: bool) -> bool {
    body.get("success")
        .and_then(Value::as_bool)
        .unwrap_or(status_ok)
}

pub fn list(body: &Value) -> Vec<Value> {
    first_match(body, LIST_SHAPES)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

pub fn report(body: &Value) -> Option<&Value> {
    REPORT_SHAPES
        .iter()
        .find_map(|(_, matcher)| matcher(body).filter(|v| has_id(v)))
}
