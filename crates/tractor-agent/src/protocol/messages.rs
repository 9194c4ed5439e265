use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

/// Client -> agent call.
///
/// `method` stays a string on the wire so an unknown method can be answered
/// with an error reply instead of a protocol failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    /// Workspace path or name.
    pub params: String,
}

impl Request {
    pub fn new(id: impl Into<String>, method: Method, params: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.to_string(),
            params: params.into(),
        }
    }
}

/// The remotely invocable workspace operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Connect,
    Start,
    Stop,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "connect",
            Method::Start => "start",
            Method::Stop => "stop",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(Method::Connect),
            "start" => Ok(Method::Start),
            "stop" => Ok(Method::Stop),
            other => Err(AgentError::UnknownMethod(other.to_string())),
        }
    }
}

/// Agent -> client response.
///
/// Each call gets exactly one. After `Hijacked` the connection stops carrying
/// JSONL and carries raw workspace output until either side closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    #[serde(rename = "reply")]
    Reply { id: String, reply: String },

    #[serde(rename = "error")]
    Error {
        id: String,
        code: String,
        message: String,
    },

    #[serde(rename = "hijacked")]
    Hijacked {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
    },
}

impl Response {
    pub fn id(&self) -> &str {
        match self {
            Response::Reply { id, .. }
            | Response::Error { id, .. }
            | Response::Hijacked { id, .. } => id,
        }
    }

    pub fn error(id: impl Into<String>, err: &AgentError) -> Self {
        Response::Error {
            id: id.into(),
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serde() {
        let req = Request::new("1", Method::Start, "/src/app");
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"id":"1","method":"start","params":"/src/app"}"#
        );
        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("connect".parse::<Method>().unwrap(), Method::Connect);
        assert_eq!("start".parse::<Method>().unwrap(), Method::Start);
        assert_eq!("stop".parse::<Method>().unwrap(), Method::Stop);

        let err = "restart".parse::<Method>().unwrap_err();
        assert_eq!(err.error_code(), "unknown_method");
        assert_eq!(err.to_string(), "unknown method: restart");
    }

    #[test]
    fn test_response_tags() {
        let reply = Response::Reply {
            id: "1".to_string(),
            reply: "started".to_string(),
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains(r#""type":"reply""#));

        let hijacked = Response::Hijacked {
            id: "2".to_string(),
            reply: None,
        };
        let json = serde_json::to_string(&hijacked).unwrap();
        assert_eq!(json, r#"{"type":"hijacked","id":"2"}"#);
    }

    #[test]
    fn test_error_response_from_agent_error() {
        let err = AgentError::WorkspaceNotFound("nope".to_string());
        let resp = Response::error("3", &err);
        match &resp {
            Response::Error { code, message, .. } => {
                assert_eq!(code, "workspace_not_found");
                assert_eq!(message, "workspace not found: nope");
            }
            other => panic!("expected error response, got {other:?}"),
        }
        assert_eq!(resp.id(), "3");
    }
}
