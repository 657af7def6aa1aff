use crate::appliance::{CommandError, DeviceProfile, DeviceState, StateTier};
use crate::cloud_api::{DeviceAccess, JsonMap, PsmartCloudApi, WriteOutcome, READ_TIMEOUT};
use crate::device_store::DeviceConfig;
use crate::endpoints::{self, EndpointPair};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OnceCell, Semaphore};

/// The two tiers of device state.
/// `provisional` is only present after a write and is discarded
/// by the next successful read.
struct Tiers {
    confirmed: DeviceState,
    provisional: Option<DeviceState>,
    session_expired: bool,
}

impl Tiers {
    fn current(&self) -> &DeviceState {
        self.provisional.as_ref().unwrap_or(&self.confirmed)
    }
}

/// Owns the read-modify-write protocol for a single device.
///
/// Commands and refreshes are serialized through a single
/// permit so that a read issued before a write cannot land
/// after it and clobber the provisional state.
pub struct DeviceController {
    config: DeviceConfig,
    profile: DeviceProfile,
    access: DeviceAccess,
    api: PsmartCloudApi,
    endpoints: OnceCell<EndpointPair>,
    tiers: Mutex<Tiers>,
    permit: Semaphore,
    updates: watch::Sender<DeviceState>,
    shut_down: AtomicBool,
}

impl std::fmt::Display for DeviceController {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{} ({})", self.config.name, self.config.device_id)
    }
}

impl DeviceController {
    pub fn new(api: PsmartCloudApi, config: DeviceConfig) -> Result<Arc<Self>, CommandError> {
        let profile = config.profile()?;
        let initial = profile.initial_state();
        let (updates, _) = watch::channel(initial.clone());
        Ok(Arc::new(Self {
            access: config.access(),
            config,
            profile,
            api,
            endpoints: OnceCell::new(),
            tiers: Mutex::new(Tiers {
                confirmed: initial,
                provisional: None,
                session_expired: false,
            }),
            permit: Semaphore::new(1),
            updates,
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// Returns the provisional state if there is one, else the
    /// confirmed state
    pub fn current(&self) -> DeviceState {
        self.tiers.lock().current().clone()
    }

    /// Returns the state from the most recent successful read
    pub fn confirmed(&self) -> DeviceState {
        self.tiers.lock().confirmed.clone()
    }

    /// True when the last read was refused because the session
    /// has expired. The device must be re-added to recover.
    pub fn session_expired(&self) -> bool {
        self.tiers.lock().session_expired
    }

    /// The resolved endpoints, if they have been probed yet
    pub fn endpoints(&self) -> Option<EndpointPair> {
        self.endpoints.get().cloned()
    }

    /// Receives each state that is published by a refresh or a command
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.updates.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Prevents any further commands or refreshes.
    /// Anything already in flight has its result discarded.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.permit.close();
    }

    fn publish(&self, state: &DeviceState) {
        self.updates.send_replace(state.clone());
    }

    /// Reads the current device parameters.
    /// The first read also resolves the endpoints; the response
    /// that the probe accepted is used as the result of that read.
    async fn read(&self) -> Option<JsonMap> {
        let mut probed = None;
        let probed_ref = &mut probed;
        let pair = self
            .endpoints
            .get_or_init(|| async move {
                let resolved =
                    endpoints::resolve(&self.api, &self.access, self.profile.endpoint_candidates())
                        .await;
                *probed_ref = resolved.initial_params;
                resolved.pair
            })
            .await;

        if probed.is_some() {
            return probed;
        }

        match self
            .api
            .get_status(&pair.get_url, &self.access, READ_TIMEOUT)
            .await
        {
            Ok(params) => Some(params),
            Err(err) if err.is_session_expired() => {
                log::error!("{self}: session expired, the device needs to be added again");
                self.tiers.lock().session_expired = true;
                None
            }
            Err(err) => {
                log::warn!("{self}: status read failed: {err:#}");
                None
            }
        }
    }

    /// Fetches the device status and makes it the confirmed state.
    /// Returns None if the status could not be read; the prior
    /// state is retained in that case.
    pub async fn refresh(&self) -> Option<DeviceState> {
        let Ok(_permit) = self.permit.acquire().await else {
            return None;
        };

        let params = self.read().await?;
        if self.is_shut_down() {
            log::debug!("{self}: discarding status read after shutdown");
            return None;
        }

        let state = {
            let mut tiers = self.tiers.lock();
            // provisional values never carry over into the confirmed tier
            let state = self
                .profile
                .apply_params(&tiers.confirmed, &params, StateTier::Confirmed);
            tiers.confirmed = state.clone();
            tiers.provisional = None;
            tiers.session_expired = false;
            state
        };
        self.publish(&state);
        Some(state)
    }

    /// Applies `changes` using a read-modify-write cycle and
    /// returns the resulting state.
    /// A failed write is logged and leaves the state unchanged;
    /// the caller is not otherwise told about it.
    pub async fn apply_changes(&self, changes: JsonMap) -> DeviceState {
        let Ok(_permit) = self.permit.acquire().await else {
            log::debug!("{self}: ignoring command after shutdown");
            return self.current();
        };

        let mut merged = match self.read().await {
            Some(params) => params,
            None => {
                log::warn!("{self}: couldn't read latest status, using cached parameters");
                self.current().last_raw_params
            }
        };
        merged.extend(changes);

        let payload = self.profile.filter_params(&merged);
        log::trace!("{self}: writing {payload:?}");

        let Some(pair) = self.endpoints.get() else {
            // read() always resolves the endpoints
            return self.current();
        };

        let outcome = match self
            .api
            .set_status(&pair.set_url, &self.access, &payload)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                log::error!("{self}: status write failed: {err:#}");
                return self.current();
            }
        };

        if self.is_shut_down() {
            log::debug!("{self}: discarding write result after shutdown");
            return self.current();
        }

        let state = {
            let mut tiers = self.tiers.lock();
            if let WriteOutcome::SessionExpired { code } = outcome {
                log::error!(
                    "{self}: write refused with code {code}, \
                     the device needs to be added again"
                );
                tiers.session_expired = true;
            }
            let state = self
                .profile
                .apply_params(tiers.current(), &merged, StateTier::Provisional);
            tiers.provisional = Some(state.clone());
            state
        };
        self.publish(&state);
        state
    }

    pub async fn turn_on(&self) -> DeviceState {
        self.apply_changes(self.profile.power_changes(true)).await
    }

    pub async fn turn_off(&self) -> DeviceState {
        self.apply_changes(self.profile.power_changes(false)).await
    }

    pub async fn set_power(&self, on: bool) -> DeviceState {
        self.apply_changes(self.profile.power_changes(on)).await
    }

    pub async fn set_mode(&self, mode: &str) -> Result<DeviceState, CommandError> {
        let changes = self.profile.mode_changes(mode)?;
        Ok(self.apply_changes(changes).await)
    }

    pub async fn set_humidity(&self, humidity: u8) -> Result<DeviceState, CommandError> {
        let changes = self.profile.humidity_changes(humidity)?;
        Ok(self.apply_changes(changes).await)
    }

    pub async fn set_temperature(&self, celsius: f64) -> Result<DeviceState, CommandError> {
        let changes = self.profile.temperature_changes(celsius)?;
        Ok(self.apply_changes(changes).await)
    }

    pub async fn set_fan_mode(&self, fan: &str) -> Result<DeviceState, CommandError> {
        let changes = self.profile.fan_changes(fan)?;
        Ok(self.apply_changes(changes).await)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classify::DeviceType;
    use crate::device_store::test::humidifier_config;
    use serde_json::{json, Value as JsonValue};
    use tokio::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GET: &str = "/App/HumDevGetStatusInfo";
    const SET: &str = "/App/HumDevSetStatusInfo";

    fn snapshot() -> JsonValue {
        json!({"results": {
            "runStatus": 0,
            "runMode": 2,
            "setHumidity": 1,
            "currentHumidity": 45,
            "deviceName": "Bedroom",
            "firmwareVer": "1.0.3"
        }})
    }

    async fn mount_status(server: &MockServer, body: JsonValue) {
        Mock::given(method("POST"))
            .and(path(GET))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_set(server: &MockServer, status: u16, hits: u64) {
        Mock::given(method("POST"))
            .and(path(SET))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({"results": {}})))
            .expect(hits)
            .mount(server)
            .await;
    }

    async fn written_params(server: &MockServer) -> Vec<JsonValue> {
        server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|req| req.url.path() == SET)
            .map(|req| {
                let body: JsonValue = req.body_json().unwrap();
                assert_eq!(body["id"], 200);
                assert_eq!(body["token"], "TOKEN");
                body["params"].clone()
            })
            .collect()
    }

    fn controller(server: &MockServer) -> Arc<DeviceController> {
        let api = PsmartCloudApi::new(server.uri()).unwrap();
        DeviceController::new(api, humidifier_config("9C1221E32995_0840_Aircle-17-03")).unwrap()
    }

    #[tokio::test]
    async fn read_modify_write_keeps_current_params() {
        let server = MockServer::start().await;
        mount_status(&server, snapshot()).await;
        mount_set(&server, 200, 1).await;

        let ctrl = controller(&server);
        let mut updates = ctrl.subscribe();
        let state = ctrl.apply_changes(crate::appliance::test::map(json!({"runStatus": 1}))).await;

        assert!(state.is_on);
        assert_eq!(state.tier, StateTier::Provisional);
        assert_eq!(state.mode, "sleep");
        assert_eq!(state.target_humidity, Some(50));
        // the local state reflects the unfiltered merge
        assert_eq!(state.last_raw_params.get("deviceName"), Some(&json!("Bedroom")));
        assert!(ctrl.current().is_on);
        assert!(updates.has_changed().unwrap());
        assert!(updates.borrow_and_update().is_on);

        assert_eq!(
            written_params(&server).await,
            vec![json!({
                "runStatus": 1,
                "runMode": 2,
                "setHumidity": 1,
                "currentHumidity": 45
            })]
        );
    }

    #[tokio::test]
    async fn disallowed_keys_are_never_written() {
        let server = MockServer::start().await;
        mount_status(&server, snapshot()).await;
        mount_set(&server, 200, 1).await;

        let ctrl = controller(&server);
        ctrl.apply_changes(crate::appliance::test::map(
            json!({"setHumidity": 3, "bogusKey": 1, "deviceName": "renamed"}),
        ))
        .await;

        for params in written_params(&server).await {
            let params = params.as_object().unwrap();
            assert_eq!(params.get("setHumidity"), Some(&json!(3)));
            for key in params.keys() {
                assert!(
                    ctrl.profile().allowed_keys().contains(&key.as_str()),
                    "{key} was transmitted"
                );
            }
        }
    }

    #[tokio::test]
    async fn repeated_changes_are_idempotent() {
        let server = MockServer::start().await;
        mount_status(&server, snapshot()).await;
        mount_set(&server, 200, 2).await;

        let ctrl = controller(&server);
        let first = ctrl.set_mode("continuous").await.unwrap();
        let second = ctrl.set_mode("continuous").await.unwrap();
        assert!(first.same_values(&second));
        assert_eq!(second.mode, "continuous");

        let written = written_params(&server).await;
        assert_eq!(written[0], written[1]);
    }

    #[tokio::test]
    async fn failed_read_uses_cached_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GET))
            .respond_with(ResponseTemplate::new(200).set_body_json(snapshot()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(GET))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        mount_set(&server, 200, 2).await;

        let ctrl = controller(&server);
        ctrl.turn_on().await;
        let state = ctrl.set_humidity(70).await.unwrap();
        assert_eq!(state.target_humidity, Some(70));
        assert!(state.is_on);

        let written = written_params(&server).await;
        assert_eq!(
            written[1],
            json!({"runStatus": 1, "runMode": 2, "setHumidity": 3, "currentHumidity": 45})
        );
    }

    #[tokio::test]
    async fn failed_write_changes_nothing() {
        let server = MockServer::start().await;
        mount_status(&server, snapshot()).await;
        mount_set(&server, 500, 1).await;

        let ctrl = controller(&server);
        let before = ctrl.current();
        let after = ctrl.turn_on().await;
        assert!(!after.is_on);
        assert!(before.same_values(&after));
        assert_eq!(after.tier, StateTier::Initial);
    }

    #[tokio::test]
    async fn refresh_replaces_provisional_state() {
        let server = MockServer::start().await;
        mount_status(&server, snapshot()).await;
        mount_set(&server, 200, 1).await;

        let ctrl = controller(&server);
        assert!(ctrl.turn_on().await.is_on);

        // the device didn't actually turn on
        let state = ctrl.refresh().await.unwrap();
        assert!(!state.is_on);
        assert_eq!(state.tier, StateTier::Confirmed);
        assert_eq!(state.current_humidity, Some(45));
        assert!(ctrl.current().same_values(&ctrl.confirmed()));
        assert_eq!(
            ctrl.endpoints().unwrap().get_url,
            format!("{}{GET}", server.uri())
        );
    }

    #[tokio::test]
    async fn expired_session_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GET))
            .respond_with(ResponseTemplate::new(200).set_body_json(snapshot()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(GET))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errorCode": "3003"})))
            .mount(&server)
            .await;

        let ctrl = controller(&server);
        let confirmed = ctrl.refresh().await.unwrap();
        assert!(!ctrl.session_expired());

        assert!(ctrl.refresh().await.is_none());
        assert!(ctrl.session_expired());
        assert!(ctrl.current().same_values(&confirmed));
    }

    #[tokio::test]
    async fn nothing_happens_after_shutdown() {
        let server = MockServer::start().await;
        mount_status(&server, snapshot()).await;
        mount_set(&server, 200, 0).await;

        let ctrl = controller(&server);
        ctrl.shutdown();
        assert!(ctrl.refresh().await.is_none());
        assert!(!ctrl.turn_on().await.is_on);
        assert!(ctrl.endpoints().is_none());
    }

    #[tokio::test]
    async fn unsupported_commands() {
        let server = MockServer::start().await;
        let ctrl = controller(&server);
        assert_eq!(
            ctrl.set_temperature(22.).await.unwrap_err(),
            CommandError::Unsupported {
                op: "set_temperature",
                device_type: DeviceType::Humidifier
            }
        );
        assert!(ctrl.set_mode("turbo").await.is_err());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    async fn wait_for_request(server: &MockServer, route: &str) {
        while !server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .any(|req| req.url.path() == route)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn confirmed_read_drops_provisional_values() {
        const AC_GET: &str = "/App/ACDevGetStatusInfoAW";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(AC_GET))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"results": {"runStatus": 1, "runMode": 3, "setTemperature": 44}}),
            ))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        // later reads don't report a target temperature at all
        Mock::given(method("POST"))
            .and(path(AC_GET))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": {"runStatus": 1, "runMode": 3}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/App/ACDevSetStatusInfoAW"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let api = PsmartCloudApi::new(server.uri()).unwrap();
        let ctrl = DeviceController::new(
            api,
            DeviceConfig {
                device_type: DeviceType::AirConditioner,
                ..humidifier_config("ac-1")
            },
        )
        .unwrap();

        assert_eq!(ctrl.refresh().await.unwrap().target_temperature, Some(22.));

        let provisional = ctrl.set_temperature(28.).await.unwrap();
        assert_eq!(provisional.target_temperature, Some(28.));
        assert_eq!(provisional.tier, StateTier::Provisional);

        let state = ctrl.refresh().await.unwrap();
        assert_eq!(state.tier, StateTier::Confirmed);
        assert_eq!(state.target_temperature, Some(22.));
        assert!(!state.last_raw_params.contains_key("setTemperature"));
        assert_eq!(ctrl.confirmed(), state);
    }

    #[tokio::test]
    async fn expired_session_on_write_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GET))
            .respond_with(ResponseTemplate::new(200).set_body_json(snapshot()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(GET))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(SET))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errorCode": "3004"})))
            .expect(1)
            .mount(&server)
            .await;

        let ctrl = controller(&server);
        ctrl.refresh().await.unwrap();
        assert!(!ctrl.session_expired());

        // the read fails, so only the write can reveal the expiry
        let state = ctrl.turn_on().await;
        assert!(state.is_on);
        assert_eq!(state.tier, StateTier::Provisional);
        assert!(ctrl.session_expired());
    }

    #[tokio::test]
    async fn read_in_flight_at_shutdown_is_discarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GET))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(snapshot())
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let ctrl = controller(&server);
        let updates = ctrl.subscribe();
        let task = tokio::spawn({
            let ctrl = ctrl.clone();
            async move { ctrl.refresh().await }
        });

        wait_for_request(&server, GET).await;
        ctrl.shutdown();

        assert!(task.await.unwrap().is_none());
        assert_eq!(ctrl.current().tier, StateTier::Initial);
        assert!(ctrl.current().last_raw_params.is_empty());
        assert!(!updates.has_changed().unwrap());
    }

    #[tokio::test]
    async fn write_in_flight_at_shutdown_is_discarded() {
        let server = MockServer::start().await;
        mount_status(&server, snapshot()).await;
        Mock::given(method("POST"))
            .and(path(SET))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": {}}))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ctrl = controller(&server);
        let updates = ctrl.subscribe();
        let task = tokio::spawn({
            let ctrl = ctrl.clone();
            async move { ctrl.turn_on().await }
        });

        wait_for_request(&server, SET).await;
        ctrl.shutdown();

        let state = task.await.unwrap();
        assert!(!state.is_on);
        assert_eq!(state.tier, StateTier::Initial);
        assert!(!ctrl.current().is_on);
        assert!(!updates.has_changed().unwrap());
    }
}
