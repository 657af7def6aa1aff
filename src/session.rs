use crate::cloud_api::{CloudError, Credentials, DeviceInfo, PsmartCloudApi};
use arc_swap::ArcSwapOption;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// An authenticated account context
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub session_id: String,
    pub family_id: JsonValue,
    pub real_family_id: JsonValue,
    pub devices: BTreeMap<String, DeviceInfo>,
}

/// Holds the most recently established session so that repeated
/// setup operations don't need to log in every time.
/// The session is replaced as a whole; readers only ever observe
/// a complete Session. Having an empty cache is always correct,
/// it just costs an extra login.
#[derive(Default)]
pub struct SessionCache {
    current: ArcSwapOption<Session>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<Session>> {
        self.current.load_full()
    }

    pub fn replace(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.current.store(Some(Arc::clone(&session)));
        session
    }

    pub fn clear(&self) {
        self.current.store(None);
    }

    /// Re-issues the device list request using the session id,
    /// without logging in. Returns None when the session no longer
    /// produces a device list, which the caller should take to mean
    /// that the session has expired.
    pub async fn validate(
        api: &PsmartCloudApi,
        session: &Session,
    ) -> Option<BTreeMap<String, DeviceInfo>> {
        match api
            .get_bound_devices(
                &session.user_id,
                &session.session_id,
                &session.family_id,
                &session.real_family_id,
            )
            .await
        {
            Ok(devices) if !devices.is_empty() => Some(devices),
            Ok(_) => {
                log::debug!("session validation returned an empty device list");
                None
            }
            Err(err) => {
                log::debug!("session validation failed: {err:#}");
                None
            }
        }
    }

    /// Returns the cached session refreshed with the current device
    /// list, if it is still valid. An invalid session is evicted.
    pub async fn revalidate(&self, api: &PsmartCloudApi) -> Option<Arc<Session>> {
        let cached = self.get()?;
        log::info!("Found cached session, verifying validity...");
        match Self::validate(api, &cached).await {
            Some(devices) => {
                log::info!("Session valid. Skipping login.");
                Some(Arc::new(Session {
                    devices,
                    ..(*cached).clone()
                }))
            }
            None => {
                log::warn!("Cached session expired.");
                self.clear();
                None
            }
        }
    }

    /// Performs the full login exchange and publishes the result.
    pub async fn login(
        &self,
        api: &PsmartCloudApi,
        credentials: &Credentials,
    ) -> Result<Arc<Session>, CloudError> {
        let session = api
            .authenticate(&credentials.username, &credentials.password)
            .await?;
        Ok(self.replace(session))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cloud_api::test::mount_login;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn creds() -> Credentials {
        Credentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
        }
    }

    fn stale_session() -> Session {
        Session {
            user_id: "U-1".to_string(),
            session_id: "STALE".to_string(),
            family_id: json!(11),
            real_family_id: json!("22"),
            devices: BTreeMap::new(),
        }
    }

    const DEVICES: &str = r#"{"results": {"devList": [
        {"deviceId": "9C1221E32995_0840_Aircle-17-03", "params": {"deviceName": "Bedroom"}}
    ]}}"#;

    #[test]
    fn replace_and_clear() {
        let cache = SessionCache::new();
        assert!(cache.get().is_none());
        cache.replace(stale_session());
        assert_eq!(cache.get().unwrap().session_id, "STALE");
        cache.clear();
        assert!(cache.get().is_none());
    }

    #[tokio::test]
    async fn expired_session_is_evicted_and_login_is_full() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/App/UsrGetBindDevInfo"))
            .and(header("Cookie", "SSID=STALE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errorCode": "3003"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_login(&server, serde_json::from_str(DEVICES).unwrap(), 1).await;

        let api = PsmartCloudApi::new(server.uri()).unwrap();
        let cache = SessionCache::new();
        cache.replace(stale_session());

        assert!(cache.revalidate(&api).await.is_none());
        assert!(cache.get().is_none());

        let session = cache.login(&api, &creds()).await.unwrap();
        assert_eq!(session.session_id, "SSID-1");
        assert_eq!(cache.get().unwrap().session_id, "SSID-1");
        assert_eq!(session.devices.len(), 1);
        // the mock server verifies on drop that each login step ran once
    }

    #[tokio::test]
    async fn valid_session_skips_login() {
        let server = MockServer::start().await;
        // no login requests are expected
        mount_login(&server, serde_json::from_str(DEVICES).unwrap(), 0).await;

        let api = PsmartCloudApi::new(server.uri()).unwrap();
        let cache = SessionCache::new();
        cache.replace(Session {
            session_id: "SSID-1".to_string(),
            ..stale_session()
        });

        let session = cache.revalidate(&api).await.unwrap();
        assert_eq!(session.session_id, "SSID-1");
        assert_eq!(session.devices.len(), 1);
        // the cached object is only replaced by a login
        assert!(cache.get().unwrap().devices.is_empty());
    }
}
