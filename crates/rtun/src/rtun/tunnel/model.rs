use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type Params = serde_json::Map<String, serde_json::Value>;

/// Describes a backend to connect to. Carried as the Open request payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dial {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub address: String,
    /// Milliseconds; 0 means the dialer's default.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
}

impl Dial {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            kind: "tcp".into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout))
    }

    /// Lower-cased kind with the empty kind treated as tcp.
    pub fn normalized_kind(&self) -> String {
        let k = self.kind.trim().to_ascii_lowercase();
        if k.is_empty() { "tcp".into() } else { k }
    }
}

/// Describes a port the server should open for a registering client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listen {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
}

impl Listen {
    pub fn tcp(port: u16) -> Self {
        Self {
            kind: "tcp".into(),
            port,
            ..Default::default()
        }
    }

    pub fn normalized_kind(&self) -> String {
        let k = self.kind.trim().to_ascii_lowercase();
        if k.is_empty() { "tcp".into() } else { k }
    }
}

/// Open response payload: the key the remote bound the stream to, and the
/// descriptor it actually dialed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialResponse {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub dial: Dial,
}

/// Register request payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<Listen>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_json_uses_millisecond_timeout() {
        let d = Dial::tcp(":80").with_timeout(Duration::from_secs(2));
        let s = serde_json::to_string(&d).unwrap();
        assert_eq!(s, r#"{"kind":"tcp","address":":80","timeout":2000}"#);

        let back: Dial = serde_json::from_str(&s).unwrap();
        assert_eq!(back.timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn sparse_payloads_decode_with_defaults() {
        let d: Dial = serde_json::from_str(r#"{"address":"127.0.0.1:22"}"#).unwrap();
        assert_eq!(d.normalized_kind(), "tcp");
        assert_eq!(d.timeout(), None);

        let r: RegisterRequest = serde_json::from_str(r#"{"username":"u","password":"p"}"#).unwrap();
        assert_eq!(r.username.as_deref(), Some("u"));
        assert!(r.listen.is_none());

        let r: RegisterRequest =
            serde_json::from_str(r#"{"listen":{"kind":"tcp","port":8080,"params":{"a":1}}}"#)
                .unwrap();
        let l = r.listen.unwrap();
        assert_eq!(l.port, 8080);
        assert_eq!(l.params.get("a"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn dial_response_round_trips_through_json() {
        let res = DialResponse {
            key: "k1".into(),
            dial: Dial::tcp(":80"),
        };
        let s = serde_json::to_vec(&res).unwrap();
        let back: DialResponse = serde_json::from_slice(&s).unwrap();
        assert_eq!(back, res);
    }
}
