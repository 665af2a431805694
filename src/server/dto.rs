use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Map of `x-*` request fields with the prefix stripped, forwarded to
/// transfer adapters and storage backends.
pub type Extra = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Download,
}

#[derive(Debug, Deserialize)]
pub struct RefSpec {
    #[allow(dead_code)]
    pub name: String,
}

fn default_transfers() -> Vec<String> {
    vec!["basic".to_string()]
}

/// Incoming batch request. Unknown top-level fields are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchRequest {
    pub operation: Operation,
    #[serde(default = "default_transfers")]
    pub transfers: Vec<String>,
    #[serde(rename = "ref")]
    pub reference: Option<RefSpec>,
    pub objects: Vec<ObjectSpec>,
}

/// One requested object. Fields prefixed `x-` are collected into `extra`
/// with the prefix stripped; other unknown fields are dropped.
#[derive(Debug, Deserialize)]
pub struct ObjectSpec {
    pub oid: String,
    pub size: u64,
    #[serde(flatten)]
    other: HashMap<String, Value>,
}

impl ObjectSpec {
    #[must_use]
    pub fn extra(&self) -> Extra {
        self.other
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("x-")
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub transfer: String,
    pub objects: Vec<ObjectResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub href: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub expires_in: u64,
}

impl Action {
    #[must_use]
    pub fn new(href: String, expires_in: u64) -> Self {
        Self {
            href,
            header: HashMap::new(),
            body: None,
            method: None,
            expires_in,
        }
    }

    #[must_use]
    pub fn with_header(mut self, header: HashMap<String, String>) -> Self {
        self.header = header;
        self
    }
}

/// One piece of a multipart upload.
#[derive(Debug, Clone, Serialize)]
pub struct PartAction {
    pub href: String,
    pub pos: u64,
    pub size: u64,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub want_digest: Option<String>,
}

/// Per-object action plan. Which slots are filled depends on the operation
/// and the transfer adapter.
#[derive(Debug, Default, Serialize)]
pub struct Actions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<PartAction>>,
}

impl Actions {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upload.is_none()
            && self.download.is_none()
            && self.verify.is_none()
            && self.commit.is_none()
            && self.abort.is_none()
            && self.parts.is_none()
    }
}

#[derive(Debug, Serialize)]
pub struct ObjectError {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ObjectResponse {
    pub oid: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Actions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ObjectError>,
}

impl ObjectResponse {
    #[must_use]
    pub fn with_actions(oid: String, size: u64, actions: Actions, authenticated: bool) -> Self {
        Self {
            oid,
            size,
            authenticated: Some(authenticated),
            actions: Some(actions),
            error: None,
        }
    }

    #[must_use]
    pub fn with_error(oid: String, size: u64, code: u16, message: impl Into<String>) -> Self {
        Self {
            oid,
            size,
            authenticated: None,
            actions: None,
            error: Some(ObjectError {
                code,
                message: message.into(),
            }),
        }
    }

    /// An upload target that already holds the object: no actions, no error.
    #[must_use]
    pub fn already_present(oid: String, size: u64) -> Self {
        Self {
            oid,
            size,
            authenticated: None,
            actions: None,
            error: None,
        }
    }

    /// True when this entry carries an error, optionally of a specific code.
    #[must_use]
    pub fn is_error(&self, code: Option<u16>) -> bool {
        match &self.error {
            Some(err) => code.is_none_or(|c| err.code == c),
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub oid: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_request_defaults() {
        let request: BatchRequest = serde_json::from_value(serde_json::json!({
            "operation": "download",
            "objects": [{"oid": "12345678", "size": 8}]
        }))
        .unwrap();

        assert_eq!(request.operation, Operation::Download);
        assert_eq!(request.transfers, vec!["basic"]);
        assert!(request.reference.is_none());
    }

    #[test]
    fn test_unknown_top_level_field_rejected() {
        let result: Result<BatchRequest, _> = serde_json::from_value(serde_json::json!({
            "operation": "download",
            "objects": [{"oid": "12345678", "size": 8}],
            "surprise": true
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_negative_size_rejected() {
        let result: Result<BatchRequest, _> = serde_json::from_value(serde_json::json!({
            "operation": "upload",
            "objects": [{"oid": "12345678", "size": -1}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_object_extra_fields() {
        let request: BatchRequest = serde_json::from_value(serde_json::json!({
            "operation": "download",
            "objects": [{
                "oid": "12345678",
                "size": 8,
                "x-filename": "model.bin",
                "ignored": "value"
            }]
        }))
        .unwrap();

        let extra = request.objects[0].extra();
        assert_eq!(extra.get("filename").unwrap(), "model.bin");
        assert!(!extra.contains_key("ignored"));
        assert!(!extra.contains_key("x-filename"));
    }

    #[test]
    fn test_object_response_serialization() {
        let response = ObjectResponse::with_error("abc".into(), 5, 404, "Object does not exist");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], 404);
        assert!(json.get("actions").is_none());
        assert!(json.get("authenticated").is_none());

        let response = ObjectResponse::already_present("abc".into(), 5);
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("actions").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_actions_skip_empty_slots() {
        let mut actions = Actions::default();
        actions.download = Some(Action::new("http://example.com/obj".into(), 900));
        let json = serde_json::to_value(&actions).unwrap();
        assert!(json.get("download").is_some());
        assert!(json.get("upload").is_none());
        assert!(json.get("parts").is_none());
        // Empty header maps are omitted entirely.
        assert!(json["download"].get("header").is_none());
    }
}
