use crate::cloud_api::{CloudError, DeviceAccess, JsonMap, PsmartCloudApi};
use serde::Serialize;
use std::time::Duration;

// The service has several families of status endpoints and
// offers no way to ask which of them applies to a given device,
// so we try them in turn until one of them answers with results.

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Error codes that mean "not this endpoint" while probing
pub const NEGATIVE_PROBE_CODES: &[&str] = &["3003", "3004", "404", "500"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointCandidate {
    pub get_path: &'static str,
    pub set_path: &'static str,
}

const HUMIDIFIER: EndpointCandidate = EndpointCandidate {
    get_path: "/App/HumDevGetStatusInfo",
    set_path: "/App/HumDevSetStatusInfo",
};

const HUMIDIFIER_AW: EndpointCandidate = EndpointCandidate {
    get_path: "/App/HumDevGetStatusInfoAW",
    set_path: "/App/HumDevSetStatusInfoAW",
};

const AIR_CONDITIONER_AW: EndpointCandidate = EndpointCandidate {
    get_path: "/App/ACDevGetStatusInfoAW",
    set_path: "/App/ACDevSetStatusInfoAW",
};

const GENERIC: EndpointCandidate = EndpointCandidate {
    get_path: "/App/DevGetStatusInfo",
    set_path: "/App/DevSetStatusInfo",
};

/// Used when no candidate produces results
pub const FALLBACK_CANDIDATE: EndpointCandidate = AIR_CONDITIONER_AW;

pub const HUMIDIFIER_CANDIDATES: &[EndpointCandidate] =
    &[HUMIDIFIER, HUMIDIFIER_AW, AIR_CONDITIONER_AW, GENERIC];

pub const AIR_CONDITIONER_CANDIDATES: &[EndpointCandidate] = &[AIR_CONDITIONER_AW, GENERIC];

/// The status get/set URLs that a particular device answers on
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EndpointPair {
    pub get_url: String,
    pub set_url: String,
}

impl EndpointPair {
    pub fn from_candidate(api: &PsmartCloudApi, candidate: &EndpointCandidate) -> Self {
        Self {
            get_url: api.url(candidate.get_path),
            set_url: api.url(candidate.set_path),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("none of the {attempts} status endpoints accepted device {device_id}")]
pub struct ProbeExhausted {
    pub device_id: String,
    pub attempts: usize,
}

/// The result of resolving the endpoints for a device
#[derive(Debug)]
pub struct Resolved {
    pub pair: EndpointPair,
    /// The status that was returned by the accepted probe
    pub initial_params: Option<JsonMap>,
}

fn is_negative(err: &CloudError) -> bool {
    match err {
        CloudError::SessionExpired { code } => NEGATIVE_PROBE_CODES.contains(&code.as_str()),
        CloudError::NoResults { code: Some(code) } => NEGATIVE_PROBE_CODES.contains(&code.as_str()),
        CloudError::NoResults { code: None } => true,
        _ => false,
    }
}

/// Walks `candidates` in order, stopping at the first that
/// returns a results payload for the device.
pub async fn probe(
    api: &PsmartCloudApi,
    access: &DeviceAccess,
    candidates: &[EndpointCandidate],
) -> Result<(EndpointPair, JsonMap), ProbeExhausted> {
    for candidate in candidates {
        let pair = EndpointPair::from_candidate(api, candidate);
        match api.get_status(&pair.get_url, access, PROBE_TIMEOUT).await {
            Ok(params) => {
                log::info!(
                    "{}: status endpoint is {}",
                    access.device_id,
                    candidate.get_path
                );
                return Ok((pair, params));
            }
            Err(err) if is_negative(&err) => {
                log::debug!("{}: {} declined: {err}", access.device_id, candidate.get_path);
            }
            Err(err) => {
                log::debug!("{}: {} failed: {err:#}", access.device_id, candidate.get_path);
            }
        }
    }

    Err(ProbeExhausted {
        device_id: access.device_id.clone(),
        attempts: candidates.len(),
    })
}

/// Like `probe`, but settles on the fallback pair when every
/// candidate has been exhausted. The fallback may not actually
/// work for the device; reads and writes against it will fail
/// and be reported in the usual way.
pub async fn resolve(
    api: &PsmartCloudApi,
    access: &DeviceAccess,
    candidates: &[EndpointCandidate],
) -> Resolved {
    match probe(api, access, candidates).await {
        Ok((pair, params)) => Resolved {
            pair,
            initial_params: Some(params),
        },
        Err(err) => {
            log::warn!("{err}; falling back to {}", FALLBACK_CANDIDATE.get_path);
            Resolved {
                pair: EndpointPair::from_candidate(api, &FALLBACK_CANDIDATE),
                initial_params: None,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn access() -> DeviceAccess {
        DeviceAccess {
            usr_id: "U-1".to_string(),
            ssid: "SSID-1".to_string(),
            device_id: "9C1221E32995_0840_Aircle-17-03".to_string(),
            token: "TOKEN".to_string(),
        }
    }

    async fn mount(server: &MockServer, get_path: &str, body: serde_json::Value, hits: u64) {
        Mock::given(method("POST"))
            .and(path(get_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(hits)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn only_third_candidate_answers() {
        let server = MockServer::start().await;
        mount(&server, HUMIDIFIER.get_path, json!({"errorCode": "404"}), 1).await;
        mount(&server, HUMIDIFIER_AW.get_path, json!({"errorCode": "3004"}), 1).await;
        mount(
            &server,
            AIR_CONDITIONER_AW.get_path,
            json!({"results": {"runStatus": 1, "runMode": 2}}),
            1,
        )
        .await;
        // must never be reached
        mount(&server, GENERIC.get_path, json!({"results": {}}), 0).await;

        let api = PsmartCloudApi::new(server.uri()).unwrap();
        let (pair, params) = probe(&api, &access(), HUMIDIFIER_CANDIDATES)
            .await
            .unwrap();
        assert_eq!(pair.get_url, api.url("/App/ACDevGetStatusInfoAW"));
        assert_eq!(pair.set_url, api.url("/App/ACDevSetStatusInfoAW"));
        assert_eq!(params.get("runMode"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn http_errors_move_on() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(HUMIDIFIER.get_path))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        mount(&server, HUMIDIFIER_AW.get_path, json!({"results": {"runStatus": 0}}), 1).await;

        let api = PsmartCloudApi::new(server.uri()).unwrap();
        let (pair, _) = probe(&api, &access(), HUMIDIFIER_CANDIDATES)
            .await
            .unwrap();
        assert_eq!(pair.get_url, api.url(HUMIDIFIER_AW.get_path));
    }

    #[tokio::test]
    async fn exhausted_falls_back() {
        let server = MockServer::start().await;
        for candidate in HUMIDIFIER_CANDIDATES {
            mount(&server, candidate.get_path, json!({"errorCode": "500"}), 2).await;
        }

        let api = PsmartCloudApi::new(server.uri()).unwrap();
        let err = probe(&api, &access(), HUMIDIFIER_CANDIDATES)
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 4);

        let resolved = resolve(&api, &access(), HUMIDIFIER_CANDIDATES).await;
        assert_eq!(
            resolved.pair,
            EndpointPair::from_candidate(&api, &FALLBACK_CANDIDATE)
        );
        assert!(resolved.initial_params.is_none());
    }

    #[test]
    fn negative_codes() {
        assert!(is_negative(&CloudError::SessionExpired {
            code: "3003".to_string()
        }));
        assert!(is_negative(&CloudError::NoResults {
            code: Some("404".to_string())
        }));
        assert!(!is_negative(&CloudError::NoResults {
            code: Some("1234".to_string())
        }));
    }
}
