//! Negotiation and hub-link setup payloads.

use crate::codec::ProtocolError;
use serde::Deserialize;
use serde_json::Value;

/// Request header names sent to the negotiation endpoint.
pub mod headers {
    pub const USER_NAME: &str = "username";
    pub const DEVICE_ID: &str = "deviceid";
    pub const COMPANY_NAME: &str = "companyname";
    pub const TEAM_NAME: &str = "teamname";
    pub const AUTH_SERVICE_TOKEN: &str = "authservicetoken";
    pub const AUTH_SERVICE_NAME: &str = "authservicename";
    pub const AUTH_TOKEN: &str = "authtoken";
    pub const SEND_TO: &str = "sendto";
    pub const USER_OR_GROUP: &str = "userorgroup";
    pub const MESSAGE_TYPE: &str = "messagetype";
}

/// Service endpoint paths, relative to the server address.
pub mod paths {
    pub const NEGOTIATE: &str = "/api/Negotiate";
    pub const MESSAGE_TOKEN: &str = "/api/GetMessageToken";
    pub const MESSAGE: &str = "/api/Message";
}

/// Parsed response of the negotiation endpoint.
///
/// The wire form is a JSON array
/// `[userId, clientToken, clientUrl, serverTimeEpochSeconds, turnAuthz?]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateResponse {
    /// Full user id assigned to this client.
    pub user_id: String,
    /// Token authorizing the hub link and the first message-token request.
    pub client_token: String,
    /// Hub client endpoint.
    pub client_url: String,
    /// Server clock, seconds since the Unix epoch.
    pub server_time_secs: i64,
    /// TURN server authorization blob, passed through untouched.
    pub turn_authorization: Option<String>,
}

impl NegotiateResponse {
    /// Parse the negotiation response body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not an array of at least four
    /// elements or the server time is not an integer.
    pub fn parse(body: &str) -> Result<Self, ProtocolError> {
        let values: Vec<Value> = serde_json::from_str(body)?;
        if values.len() < 4 {
            return Err(ProtocolError::Invalid(format!(
                "negotiate response has {} elements, expected at least 4",
                values.len()
            )));
        }

        let server_time = value_to_string(&values[3]);
        let server_time_secs = server_time
            .parse()
            .map_err(|_| ProtocolError::Invalid(format!("invalid server time '{server_time}'")))?;

        Ok(Self {
            user_id: value_to_string(&values[0]),
            client_token: value_to_string(&values[1]),
            client_url: value_to_string(&values[2]),
            server_time_secs,
            turn_authorization: values.get(4).map(value_to_string),
        })
    }
}

/// Response of the hub link's own negotiate step.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkNegotiation {
    /// Connection id assigned by the hub.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Connection token (negotiate version 1).
    #[serde(default)]
    pub connection_token: Option<String>,
    /// Redirect url, when the hub hands off to another endpoint.
    #[serde(default)]
    pub url: Option<String>,
    /// Access token to use with the redirect url.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Negotiation error.
    #[serde(default)]
    pub error: Option<String>,
}

impl LinkNegotiation {
    /// Parse the link negotiation body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON or reports an error.
    pub fn parse(body: &str) -> Result<Self, ProtocolError> {
        let negotiation: Self = serde_json::from_str(body)?;
        if let Some(error) = &negotiation.error {
            return Err(ProtocolError::Invalid(format!("hub negotiation failed: {error}")));
        }
        Ok(negotiation)
    }

    /// The id to pass as the `id` query parameter of the socket url.
    #[must_use]
    pub fn link_id(&self) -> Option<&str> {
        self.connection_token
            .as_deref()
            .or(self.connection_id.as_deref())
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
