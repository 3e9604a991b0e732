use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use url::Url;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("offer request to {url} failed: {source}")]
    Request {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("offer request failed. status code: {status}, reason: {reason}")]
    BadStatus { status: u16, reason: String },
    #[error("failed to read SDP answer: {0}")]
    Body(#[source] reqwest::Error),
}

/// Result of a successful offer/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpAnswer {
    pub sdp: String,
    /// WHEP session resource, when the server announced one.
    pub session_url: Option<Url>,
}

/// One-shot WHEP signaling over HTTP.
#[derive(Debug, Clone)]
pub struct WhepClient {
    http: reqwest::Client,
    endpoint: Url,
    bearer_token: String,
}

impl WhepClient {
    pub fn new(endpoint: Url, bearer_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            bearer_token: bearer_token.into(),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Posts the SDP offer and returns the answer body verbatim.
    ///
    /// There is no retry: any failure here is meant to abort startup.
    pub async fn send_offer(&self, offer_sdp: &str) -> Result<SdpAnswer, SignalingError> {
        info!(url = %self.endpoint, "connecting to WHEP endpoint");
        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.bearer_token)
            .header(ACCEPT, SDP_CONTENT_TYPE)
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer_sdp.to_owned())
            .send()
            .await
            .map_err(|source| SignalingError::Request {
                url: self.endpoint.clone(),
                source,
            })?;

        let status = response.status();
        // Reported once, by whoever handles the error.
        if !status.is_success() {
            return Err(bad_status(status));
        }

        let session_url = self.session_url(&response);
        let sdp = response.text().await.map_err(SignalingError::Body)?;
        info!(session = ?session_url.as_ref().map(Url::as_str), "answer received");
        Ok(SdpAnswer { sdp, session_url })
    }

    /// Ends the WHEP session. Failures are only logged; some servers do not
    /// implement the DELETE endpoint.
    pub async fn delete_session(&self, session_url: &Url) {
        let result = self
            .http
            .delete(session_url.clone())
            .bearer_auth(&self.bearer_token)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(url = %session_url, "WHEP session deleted")
            }
            Ok(response) => {
                warn!(url = %session_url, status = %response.status(), "WHEP session delete rejected")
            }
            Err(e) => warn!(url = %session_url, error = %e, "WHEP session delete failed"),
        }
    }

    fn session_url(&self, response: &reqwest::Response) -> Option<Url> {
        let location = response.headers().get(LOCATION)?.to_str().ok()?;
        match self.endpoint.join(location) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(location, error = %e, "ignoring unparsable Location header");
                None
            }
        }
    }
}

fn bad_status(status: StatusCode) -> SignalingError {
    SignalingError::BadStatus {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("unknown").to_owned(),
    }
}
