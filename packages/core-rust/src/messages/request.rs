//! Request envelope: `{ id, method, params: { resource, args, ...options } }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ErrorCode, ErrorPayload};
use crate::mutation::MutationId;
use crate::resource::ResourceId;

/// Reserved method name for property reads. `args` is `[propertyName]`.
pub const PROPERTY_READ_METHOD: &str = "$get";

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(v: &bool) -> bool {
    !*v
}

/// A call addressed to a method of a host resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-chosen correlation token, unique within the caller's
    /// outstanding set.
    pub id: String,
    pub method: String,
    pub params: RequestParams,
}

/// Target resource, arguments, and call options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParams {
    pub resource: ResourceId,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Omit embedded mutation payloads from the response.
    #[serde(default, skip_serializing_if = "is_false")]
    pub compact_mode: bool,
    /// The caller only wants side effects; `result` is omitted.
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_return: bool,
    /// Routing hint identifying the calling window.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub window_id: Option<String>,
    /// Highest mutation the caller has already applied.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mutation_id: Option<MutationId>,
}

impl RequestParams {
    #[must_use]
    pub fn new(resource: ResourceId, args: Vec<Value>) -> Self {
        Self {
            resource,
            args,
            compact_mode: false,
            no_return: false,
            window_id: None,
            mutation_id: None,
        }
    }
}

impl Request {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        resource: ResourceId,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params: RequestParams::new(resource, args),
        }
    }

    /// Builds a property read request.
    #[must_use]
    pub fn property(id: impl Into<String>, resource: ResourceId, property: &str) -> Self {
        Self::new(
            id,
            resource,
            PROPERTY_READ_METHOD,
            vec![Value::String(property.to_string())],
        )
    }

    /// The property name, if this request is a property read.
    #[must_use]
    pub fn property_name(&self) -> Option<&str> {
        if self.method == PROPERTY_READ_METHOD {
            self.params.args.first().and_then(Value::as_str)
        } else {
            None
        }
    }

    /// Structurally validates a decoded frame.
    ///
    /// # Errors
    ///
    /// Returns a `RequestRejection` with `INVALID_REQUEST` when the frame is
    /// not a well-formed request. The rejection keeps the request id when one
    /// could be recovered so the caller's bookkeeping can terminate.
    pub fn from_value(value: Value) -> Result<Request, RequestRejection> {
        let Value::Object(map) = &value else {
            return Err(RequestRejection::invalid(None, "request must be an object"));
        };

        let id = match map.get("id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let Some(id) = id else {
            return Err(RequestRejection::invalid(None, "missing request id"));
        };

        match map.get("method") {
            Some(Value::String(m)) if !m.is_empty() => {}
            _ => return Err(RequestRejection::invalid(Some(id), "missing method")),
        }

        let Some(Value::Object(params)) = map.get("params") else {
            return Err(RequestRejection::invalid(Some(id), "missing params"));
        };
        match params.get("resource") {
            Some(Value::String(r)) if !r.is_empty() => {}
            _ => return Err(RequestRejection::invalid(Some(id), "missing resource")),
        }

        let mut normalized = value.clone();
        normalized["id"] = Value::String(id.clone());
        serde_json::from_value(normalized)
            .map_err(|e| RequestRejection::invalid(Some(id), e.to_string()))
    }
}

/// A frame that failed structural validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRejection {
    pub id: Option<String>,
    pub error: ErrorPayload,
}

impl RequestRejection {
    fn invalid(id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            error: ErrorPayload::new(ErrorCode::InvalidRequest, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn code_of(r: &RequestRejection) -> Option<ErrorCode> {
        r.error.kind()
    }

    #[test]
    fn parses_full_request() {
        let value = json!({
            "id": "c-1",
            "method": "addScene",
            "params": {
                "resource": "SceneList",
                "args": ["Scene A"],
                "compactMode": true,
                "noReturn": false,
                "windowId": "main",
                "mutationId": 10
            }
        });
        let req = Request::from_value(value).unwrap();
        assert_eq!(req.id, "c-1");
        assert_eq!(req.method, "addScene");
        assert_eq!(req.params.resource.as_str(), "SceneList");
        assert_eq!(req.params.args, vec![json!("Scene A")]);
        assert!(req.params.compact_mode);
        assert!(!req.params.no_return);
        assert_eq!(req.params.window_id.as_deref(), Some("main"));
        assert_eq!(req.params.mutation_id, Some(MutationId(10)));
    }

    #[test]
    fn options_default_when_absent() {
        let req = Request::from_value(json!({
            "id": "1", "method": "m", "params": {"resource": "R"}
        }))
        .unwrap();
        assert!(req.params.args.is_empty());
        assert!(!req.params.compact_mode);
        assert!(req.params.mutation_id.is_none());
    }

    #[test]
    fn numeric_ids_are_accepted_as_strings() {
        let req = Request::from_value(json!({
            "id": 42, "method": "m", "params": {"resource": "R"}
        }))
        .unwrap();
        assert_eq!(req.id, "42");
    }

    #[test]
    fn structural_problems_are_invalid_requests() {
        let cases = [
            (json!([1, 2]), None),
            (json!({"method": "m", "params": {"resource": "R"}}), None),
            (json!({"id": "1", "params": {"resource": "R"}}), Some("1")),
            (json!({"id": "1", "method": "m"}), Some("1")),
            (json!({"id": "1", "method": "m", "params": {}}), Some("1")),
            (json!({"id": "1", "method": "m", "params": {"resource": "bad name"}}), Some("1")),
            (json!({"id": "1", "method": "m", "params": {"resource": "R", "args": 3}}), Some("1")),
        ];
        for (value, id) in cases {
            let rejection = Request::from_value(value.clone()).unwrap_err();
            assert_eq!(code_of(&rejection), Some(ErrorCode::InvalidRequest), "{value}");
            assert_eq!(rejection.id.as_deref(), id, "{value}");
        }
    }

    #[test]
    fn property_reads_use_reserved_method() {
        let req = Request::property("p", ResourceId::parse("SceneList").unwrap(), "scenes");
        assert_eq!(req.method, PROPERTY_READ_METHOD);
        assert_eq!(req.property_name(), Some("scenes"));

        let call = Request::new("c", ResourceId::parse("SceneList").unwrap(), "scenes", vec![]);
        assert_eq!(call.property_name(), None);
    }

    #[test]
    fn serialization_skips_default_options() {
        let req = Request::new("1", ResourceId::parse("R").unwrap(), "m", vec![]);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            json!({"id": "1", "method": "m", "params": {"resource": "R", "args": []}})
        );
    }
}
