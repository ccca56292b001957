use std::{
    fs,
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use url::Url;

use crate::query::{USER_DIRECTORY_PATH, UsageRequest, endpoint_url};

const REPLAY_USAGE_FILE: &str = "data.json";
const REPLAY_USERS_FILE: &str = "users.json";

/// One backend-aggregated billing bucket.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UsageRecord {
    pub model_name: String,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub quota: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DashboardUser {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
}

impl DashboardUser {
    /// The directory lists a synthetic id 0 entry meaning every user.
    pub fn is_all_users(&self) -> bool {
        self.id == 0
    }

    pub fn label(&self) -> String {
        if self.is_all_users() {
            return self.display_name.clone();
        }
        let name = if self.display_name.is_empty() {
            &self.username
        } else {
            &self.display_name
        };
        format!("{} ({})", name, self.username)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<Option<T>, FetchError> {
        if self.success {
            Ok(self.data)
        } else if self.message.is_empty() {
            Err(FetchError::Backend("server reported a failure".into()))
        } else {
            Err(FetchError::Backend(self.message))
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0}")]
    Backend(String),
    #[error("{url} answered HTTP {code}")]
    Status { url: String, code: u16 },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not read replay file {}: {source}", .path.display())]
    ReplayRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse replay file {}: {source}", .path.display())]
    ReplayParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid gateway url: {0}")]
    Url(#[from] url::ParseError),
}

/// Where usage records and the user directory come from.
pub trait UsageSource: Send + Sync {
    fn usage(&self, request: &UsageRequest) -> Result<Vec<UsageRecord>, FetchError>;
    fn users(&self) -> Result<Vec<DashboardUser>, FetchError>;
}

pub struct ApiClient {
    agent: ureq::Agent,
    base_url: String,
    access_token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, access_token: Option<String>, timeout: Duration) -> Self {
        ApiClient {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            base_url: base_url.into(),
            access_token,
        }
    }

    fn get<T: DeserializeOwned>(&self, url: &Url) -> Result<Envelope<T>, FetchError> {
        let mut request = self.agent.request_url("GET", url);
        if let Some(token) = &self.access_token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        let response = match request.call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, resp)) => {
                // The gateway usually explains rejections in the envelope.
                return match resp.into_json::<Envelope<serde_json::Value>>() {
                    Ok(envelope) if !envelope.message.is_empty() => {
                        Err(FetchError::Backend(format!("{} (HTTP {code})", envelope.message)))
                    }
                    _ => Err(FetchError::Status {
                        url: url.to_string(),
                        code,
                    }),
                };
            }
            Err(err) => {
                return Err(FetchError::Transport {
                    url: url.to_string(),
                    source: Box::new(err),
                });
            }
        };
        response.into_json().map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

impl UsageSource for ApiClient {
    fn usage(&self, request: &UsageRequest) -> Result<Vec<UsageRecord>, FetchError> {
        let url = request.url(&self.base_url)?;
        tracing::debug!(%url, "querying usage");
        let envelope: Envelope<Vec<UsageRecord>> = self.get(&url)?;
        let records = envelope.into_data()?.unwrap_or_default();
        tracing::info!(records = records.len(), scope = request.scope(), "usage query finished");
        Ok(records)
    }

    fn users(&self) -> Result<Vec<DashboardUser>, FetchError> {
        let url = endpoint_url(&self.base_url, USER_DIRECTORY_PATH)?;
        tracing::debug!(%url, "fetching user directory");
        let envelope: Envelope<Vec<DashboardUser>> = self.get(&url)?;
        Ok(envelope.into_data()?.unwrap_or_default())
    }
}

/// Serves saved gateway responses from a directory, verbatim.
pub struct ReplaySource {
    dir: PathBuf,
}

impl ReplaySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ReplaySource { dir: dir.into() }
    }

    fn read<T: DeserializeOwned>(&self, file: &str) -> Result<Envelope<T>, FetchError> {
        let path = self.dir.join(file);
        let contents = fs::read_to_string(&path).map_err(|source| FetchError::ReplayRead {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| FetchError::ReplayParse { path, source })
    }
}

impl UsageSource for ReplaySource {
    fn usage(&self, request: &UsageRequest) -> Result<Vec<UsageRecord>, FetchError> {
        tracing::debug!(dir = %self.dir.display(), scope = request.scope(), "replaying usage");
        let envelope: Envelope<Vec<UsageRecord>> = self.read(REPLAY_USAGE_FILE)?;
        Ok(envelope.into_data()?.unwrap_or_default())
    }

    fn users(&self) -> Result<Vec<DashboardUser>, FetchError> {
        let envelope: Envelope<Vec<DashboardUser>> = self.read(REPLAY_USERS_FILE)?;
        Ok(envelope.into_data()?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Endpoint, Granularity};

    fn request() -> UsageRequest {
        UsageRequest {
            endpoint: Endpoint::SelfScope,
            start_timestamp: 0,
            end_timestamp: 100,
            granularity: Granularity::Hour,
        }
    }

    fn replay_dir(data: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(REPLAY_USAGE_FILE), data).unwrap();
        dir
    }

    #[test]
    fn backend_failure_carries_message() {
        let dir = replay_dir(r#"{"success":false,"message":"no permission","data":null}"#);
        let err = ReplaySource::new(dir.path()).usage(&request()).unwrap_err();
        assert!(matches!(err, FetchError::Backend(ref m) if m == "no permission"));
        assert_eq!(err.to_string(), "no permission");
    }

    #[test]
    fn null_data_is_empty() {
        let dir = replay_dir(r#"{"success":true,"message":"","data":null}"#);
        let records = ReplaySource::new(dir.path()).usage(&request()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn decodes_records_with_float_quota() {
        let dir = replay_dir(
            r#"{"success":true,"message":"","data":[{"model_name":"gpt-4","count":3,"quota":1500.5,"created_at":90000,"user_id":9}]}"#,
        );
        let records = ReplaySource::new(dir.path()).usage(&request()).unwrap();
        assert_eq!(
            records,
            vec![UsageRecord {
                model_name: "gpt-4".into(),
                count: 3,
                quota: 1500.5,
                created_at: 90_000,
            }]
        );
    }

    #[test]
    fn missing_users_file_is_an_error() {
        let dir = replay_dir(r#"{"success":true,"data":[]}"#);
        let err = ReplaySource::new(dir.path()).users().unwrap_err();
        assert!(matches!(err, FetchError::ReplayRead { .. }));
    }

    #[test]
    fn user_labels() {
        let all = DashboardUser {
            id: 0,
            username: String::new(),
            display_name: "All users".into(),
        };
        let named = DashboardUser {
            id: 3,
            username: "alice".into(),
            display_name: "Alice".into(),
        };
        let bare = DashboardUser {
            id: 4,
            username: "bob".into(),
            display_name: String::new(),
        };
        assert_eq!(all.label(), "All users");
        assert_eq!(named.label(), "Alice (alice)");
        assert_eq!(bare.label(), "bob (bob)");
    }
}
