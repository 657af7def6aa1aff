use crate::opt_env_var;
use crate::session::Session;
use openssl::hash::{hash, MessageDigest};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, DNT, ORIGIN, USER_AGENT};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::time::Duration;

// This file implements the subset of the Panasonic Smart China cloud
// ("psmartcloud") app API that is needed to authenticate, list the
// devices bound to an account and read/write device status.
// None of this is documented by the vendor.

pub const DEFAULT_SERVER: &str = "https://app.psmartcloud.com";

const URL_GET_TOKEN: &str = "/App/UsrGetToken";
const URL_LOGIN: &str = "/App/UsrLogin";
const URL_GET_DEV: &str = "/App/UsrGetBindDevInfo";

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error codes that indicate the SSID is no longer valid
pub const SESSION_EXPIRED_CODES: &[&str] = &["3003", "3004"];

const UI_VERSION: f64 = 4.0;
const APP_USER_AGENT: &str = "SmartApp";
const DEVICE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 18_5 like Mac OS X)";

pub type JsonMap = Map<String, JsonValue>;

#[derive(thiserror::Error, Debug)]
pub enum CloudError {
    #[error("login challenge unavailable: server returned no results")]
    ChallengeUnavailable,
    #[error("login rejected: server returned no results")]
    LoginRejected,
    #[error("session expired (error code {code})")]
    SessionExpired { code: String },
    #[error("response contained no results (error code {code:?})")]
    NoResults { code: Option<String> },
    #[error("request {url} status {status}. Response body: {body}")]
    Http {
        url: String,
        status: u16,
        body: String,
    },
    #[error("transport failure: {0:#}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response: {0:#}")]
    Decode(#[from] serde_json::Error),
    #[error("digest failure: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

impl CloudError {
    /// The session needs to be re-established by logging in again
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired { .. })
    }

    /// The credentials were not accepted
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::ChallengeUnavailable | Self::LoginRejected)
    }
}

#[derive(clap::Parser, Debug)]
pub struct CloudArguments {
    /// The username (usually a phone number) of your Panasonic
    /// Smart account. If not passed here, it will be read from
    /// the PSMART_USERNAME environment variable.
    #[arg(long, global = true)]
    pub psmart_username: Option<String>,

    /// The password for your Panasonic Smart account.
    /// If not passed here, it will be read from
    /// the PSMART_PASSWORD environment variable.
    #[arg(long, global = true)]
    pub psmart_password: Option<String>,

    /// Override the cloud server base URL.
    /// Falls back to the PSMART_SERVER environment variable
    /// and then to the vendor server.
    #[arg(long, global = true)]
    pub psmart_server: Option<String>,
}

impl CloudArguments {
    pub fn opt_username(&self) -> anyhow::Result<Option<String>> {
        match &self.psmart_username {
            Some(name) => Ok(Some(name.to_string())),
            None => opt_env_var("PSMART_USERNAME"),
        }
    }

    pub fn opt_password(&self) -> anyhow::Result<Option<String>> {
        match &self.psmart_password {
            Some(pw) => Ok(Some(pw.to_string())),
            None => opt_env_var("PSMART_PASSWORD"),
        }
    }

    /// Returns the username and password if both are configured
    pub fn opt_credentials(&self) -> anyhow::Result<Option<Credentials>> {
        match (self.opt_username()?, self.opt_password()?) {
            (Some(username), Some(password)) => Ok(Some(Credentials { username, password })),
            _ => Ok(None),
        }
    }

    pub fn credentials(&self) -> anyhow::Result<Credentials> {
        self.opt_credentials()?.ok_or_else(|| {
            anyhow::anyhow!(
                "Please specify the account credentials either via the \
                --psmart-username and --psmart-password parameters or by \
                setting $PSMART_USERNAME and $PSMART_PASSWORD"
            )
        })
    }

    pub fn server(&self) -> anyhow::Result<String> {
        match &self.psmart_server {
            Some(server) => Ok(server.to_string()),
            None => Ok(opt_env_var("PSMART_SERVER")?.unwrap_or_else(|| DEFAULT_SERVER.to_string())),
        }
    }

    pub fn api_client(&self) -> anyhow::Result<PsmartCloudApi> {
        Ok(PsmartCloudApi::new(self.server()?)?)
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A device bound to the account, as reported by the directory call
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub raw_params: JsonMap,
}

impl DeviceInfo {
    pub const DEFAULT_NAME: &'static str = "Panasonic Device";

    #[cfg(test)]
    pub fn new<I: Into<String>, N: Into<String>>(device_id: I, device_name: N) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            raw_params: JsonMap::new(),
        }
    }

    fn from_entry(entry: DevListEntry) -> Self {
        let params = match entry.params {
            JsonValue::Object(map) => map,
            _ => JsonMap::new(),
        };
        let device_name = params
            .get("deviceName")
            .and_then(JsonValue::as_str)
            .or(entry.device_name.as_deref())
            .unwrap_or(Self::DEFAULT_NAME)
            .to_string();
        Self {
            device_id: entry.device_id,
            device_name,
            raw_params: params,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct DevListEntry {
    device_id: String,
    device_name: Option<String>,
    #[serde(default)]
    params: JsonValue,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct DevListResults {
    #[serde(default)]
    dev_list: Option<Vec<DevListEntry>>,
}

#[derive(Deserialize, Debug)]
struct ChallengeResults {
    token: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoginResults {
    #[serde(deserialize_with = "string_or_number")]
    pub usr_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub ss_id: String,
    #[serde(default)]
    pub family_id: JsonValue,
    #[serde(default)]
    pub real_family_id: JsonValue,
}

/// The envelope that wraps every response from the service
#[derive(Deserialize, Debug)]
struct ResponseEnvelope {
    results: Option<JsonValue>,
    #[serde(rename = "errorCode", default)]
    error_code: Option<JsonValue>,
}

impl ResponseEnvelope {
    fn error_code(&self) -> Option<String> {
        self.error_code.as_ref().and_then(value_as_string)
    }

    /// Unwraps the results, classifying a missing payload.
    /// A results payload is accepted even when an error code
    /// accompanies it.
    fn into_results(self) -> Result<JsonValue, CloudError> {
        let code = self.error_code();
        match self.results {
            Some(results) if !results.is_null() => Ok(results),
            _ => match code {
                Some(code) if is_session_expired_code(&code) => {
                    Err(CloudError::SessionExpired { code })
                }
                code => Err(CloudError::NoResults { code }),
            },
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AccountRequest<P: Serialize> {
    id: u32,
    ui_version: f64,
    params: P,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StatusRequest<'a> {
    id: u32,
    usr_id: &'a str,
    device_id: &'a str,
    token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a JsonMap>,
}

/// Everything needed to address a single device's status endpoints
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAccess {
    pub usr_id: String,
    pub ssid: String,
    pub device_id: String,
    pub token: String,
}

fn is_session_expired_code(code: &str) -> bool {
    SESSION_EXPIRED_CODES.contains(&code)
}

/// How the service answered a status write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    /// The write was refused because the SSID is no longer valid
    SessionExpired { code: String },
}

/// Returns a string for string or numeric json values
pub fn value_as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_or_number<'de, D: serde::de::Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    use serde::de::Error as _;
    let value = JsonValue::deserialize(deserializer)?;
    value_as_string(&value)
        .ok_or_else(|| D::Error::custom(format!("expected string or number, got {value}")))
}

fn md5_upper_hex(data: &str) -> Result<String, CloudError> {
    let digest = hash(MessageDigest::md5(), data.as_bytes())?;
    Ok(data_encoding::HEXUPPER.encode(&digest))
}

/// Computes the challenge-response credential submitted at login:
/// `MD5(MD5(MD5(password) + username) + challenge)`, each stage
/// rendered as upper case hex.
pub fn login_digest(username: &str, password: &str, challenge: &str) -> Result<String, CloudError> {
    let pwd = md5_upper_hex(password)?;
    let inner = md5_upper_hex(&format!("{pwd}{username}"))?;
    md5_upper_hex(&format!("{inner}{challenge}"))
}

#[derive(Clone)]
pub struct PsmartCloudApi {
    client: reqwest::Client,
    server: String,
}

impl PsmartCloudApi {
    pub fn new<S: Into<String>>(server: S) -> Result<Self, CloudError> {
        // The vendor certificate chain does not validate
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        let server = server.into().trim_end_matches('/').to_string();
        Ok(Self { client, server })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server)
    }

    fn account_headers(ssid: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(APP_USER_AGENT));
        if let Some(ssid) = ssid {
            if let Ok(value) = HeaderValue::from_str(&format!("SSID={ssid}")) {
                headers.insert(COOKIE, value);
            }
        }
        headers
    }

    fn device_headers(&self, ssid: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEVICE_USER_AGENT));
        if let Ok(value) = HeaderValue::from_str(&format!("SSID={ssid}")) {
            headers.insert("xtoken", value);
        }
        headers.insert(DNT, HeaderValue::from_static("1"));
        if let Ok(origin) = HeaderValue::from_str(&self.server) {
            headers.insert(ORIGIN, origin);
        }
        headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
        headers
    }

    async fn post_envelope<B: Serialize>(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
        body: &B,
    ) -> Result<ResponseEnvelope, CloudError> {
        let response = self
            .client
            .request(Method::POST, url)
            .headers(headers)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(CloudError::Http {
                url: url.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).to_string(),
            });
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Step 1 of the login exchange: obtain a challenge token
    pub async fn get_login_challenge(&self, username: &str) -> Result<String, CloudError> {
        let envelope = self
            .post_envelope(
                &self.url(URL_GET_TOKEN),
                Self::account_headers(None),
                AUTH_TIMEOUT,
                &AccountRequest {
                    id: 1,
                    ui_version: UI_VERSION,
                    params: serde_json::json!({"usrId": username}),
                },
            )
            .await?;

        let results = envelope
            .into_results()
            .map_err(|_| CloudError::ChallengeUnavailable)?;
        let challenge: ChallengeResults = serde_json::from_value(results)?;
        Ok(challenge.token)
    }

    /// Step 2 of the login exchange: submit the digest credential
    pub async fn login(&self, username: &str, digest: &str) -> Result<LoginResults, CloudError> {
        let envelope = self
            .post_envelope(
                &self.url(URL_LOGIN),
                Self::account_headers(None),
                AUTH_TIMEOUT,
                &AccountRequest {
                    id: 2,
                    ui_version: UI_VERSION,
                    params: serde_json::json!({
                        "telId": "00:00:00:00:00:00",
                        "checkFailCount": 0,
                        "usrId": username,
                        "pwd": digest,
                    }),
                },
            )
            .await?;

        let results = envelope
            .into_results()
            .map_err(|_| CloudError::LoginRejected)?;
        Ok(serde_json::from_value(results)?)
    }

    /// Retrieve the devices bound to the account.
    /// A results payload without a device list yields an empty map.
    pub async fn get_bound_devices(
        &self,
        usr_id: &str,
        ssid: &str,
        family_id: &JsonValue,
        real_family_id: &JsonValue,
    ) -> Result<BTreeMap<String, DeviceInfo>, CloudError> {
        let envelope = self
            .post_envelope(
                &self.url(URL_GET_DEV),
                Self::account_headers(Some(ssid)),
                AUTH_TIMEOUT,
                &AccountRequest {
                    id: 3,
                    ui_version: UI_VERSION,
                    params: serde_json::json!({
                        "realFamilyId": real_family_id,
                        "familyId": family_id,
                        "usrId": usr_id,
                    }),
                },
            )
            .await?;

        let results: DevListResults = serde_json::from_value(envelope.into_results()?)?;
        Ok(results
            .dev_list
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                let info = DeviceInfo::from_entry(entry);
                (info.device_id.clone(), info)
            })
            .collect())
    }

    /// Performs the full challenge/login/directory exchange
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Session, CloudError> {
        let challenge = self.get_login_challenge(username).await?;
        let digest = login_digest(username, password, &challenge)?;
        let login = self.login(username, &digest).await?;
        log::debug!("logged in as usrId={}", login.usr_id);

        let devices = match self
            .get_bound_devices(
                &login.usr_id,
                &login.ss_id,
                &login.family_id,
                &login.real_family_id,
            )
            .await
        {
            Ok(devices) => devices,
            Err(CloudError::NoResults { code }) => {
                log::warn!("device list request returned no results (code {code:?})");
                BTreeMap::new()
            }
            Err(err) => return Err(err),
        };

        Ok(Session {
            user_id: login.usr_id,
            session_id: login.ss_id,
            family_id: login.family_id,
            real_family_id: login.real_family_id,
            devices,
        })
    }

    /// Reads the current device parameters from `url`
    pub async fn get_status(
        &self,
        url: &str,
        access: &DeviceAccess,
        timeout: Duration,
    ) -> Result<JsonMap, CloudError> {
        let envelope = self
            .post_envelope(
                url,
                self.device_headers(&access.ssid),
                timeout,
                &StatusRequest {
                    id: 100,
                    usr_id: &access.usr_id,
                    device_id: &access.device_id,
                    token: &access.token,
                    params: None,
                },
            )
            .await?;

        match envelope.into_results()? {
            JsonValue::Object(map) => Ok(map),
            other => {
                log::debug!("status results for {} not an object: {other}", access.device_id);
                Err(CloudError::NoResults { code: None })
            }
        }
    }

    /// Pushes `params` to `url`. The response body is not
    /// required to carry results; the write is assumed to be
    /// accepted once the server answers with a success status,
    /// unless it reports that the session has expired.
    pub async fn set_status(
        &self,
        url: &str,
        access: &DeviceAccess,
        params: &JsonMap,
    ) -> Result<WriteOutcome, CloudError> {
        let envelope = self
            .post_envelope(
                url,
                self.device_headers(&access.ssid),
                WRITE_TIMEOUT,
                &StatusRequest {
                    id: 200,
                    usr_id: &access.usr_id,
                    device_id: &access.device_id,
                    token: &access.token,
                    params: Some(params),
                },
            )
            .await;

        match envelope {
            Ok(envelope) => match envelope.error_code() {
                Some(code) if is_session_expired_code(&code) => {
                    Ok(WriteOutcome::SessionExpired { code })
                }
                Some(code) => {
                    log::warn!(
                        "write to {} reported error code {code}; \
                         the next poll will reconcile state",
                        access.device_id
                    );
                    Ok(WriteOutcome::Accepted)
                }
                None => Ok(WriteOutcome::Accepted),
            },
            // Some firmware answers a write with an empty body
            Err(CloudError::Decode(err)) => {
                log::trace!("ignoring undecodable write response: {err:#}");
                Ok(WriteOutcome::Accepted)
            }
            Err(err) => Err(err),
        }
    }
}
