// SDP offer/answer exchange with the realtime endpoint

use super::ConnectionError;
use crate::backend::{error_message, BrokerError};
use crate::config::SdpEncoding;
use crate::credentials::EphemeralCredential;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const TIMEOUT_SECS: u64 = 15;

#[async_trait]
pub trait Signaling: Send + Sync {
    /// Posts the local offer and returns the remote answer SDP.
    async fn exchange(
        &self,
        credential: &EphemeralCredential,
        offer_sdp: &str,
    ) -> Result<String, ConnectionError>;
}

#[derive(Serialize)]
struct OfferBody<'a> {
    sdp: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct AnswerBody {
    #[serde(default, alias = "answer")]
    sdp: Option<String>,
}

pub struct HttpSignaling {
    client: Client,
    encoding: SdpEncoding,
}

impl HttpSignaling {
    pub fn new(encoding: SdpEncoding) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self { client, encoding }
    }

    fn parse_answer(&self, body: &str) -> Result<String, ConnectionError> {
        let sdp = match self.encoding {
            SdpEncoding::Raw => body.to_string(),
            SdpEncoding::Json => serde_json::from_str::<AnswerBody>(body)
                .ok()
                .and_then(|b| b.sdp)
                .ok_or_else(|| {
                    ConnectionError::Negotiation("answer body has no sdp field".to_string())
                })?,
        };

        if !sdp.trim_start().starts_with("v=") {
            return Err(ConnectionError::Negotiation(
                "remote answer is not an SDP document".to_string(),
            ));
        }
        Ok(sdp)
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn exchange(
        &self,
        credential: &EphemeralCredential,
        offer_sdp: &str,
    ) -> Result<String, ConnectionError> {
        let request = self
            .client
            .post(&credential.webrtc_endpoint)
            .bearer_auth(&credential.key);

        let request = match self.encoding {
            SdpEncoding::Raw => request
                .header(CONTENT_TYPE, "application/sdp")
                .body(offer_sdp.to_string()),
            SdpEncoding::Json => request.json(&OfferBody {
                sdp: offer_sdp,
                kind: "offer",
            }),
        };

        tracing::info!("Posting SDP offer to {}", credential.webrtc_endpoint);
        let response = request
            .send()
            .await
            .map_err(|e| ConnectionError::Signaling(BrokerError::from_reqwest(e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ConnectionError::Signaling(BrokerError::from_reqwest(e)))?;

        if !status.is_success() {
            let message = error_message(status, &body);
            tracing::warn!("SDP exchange rejected: HTTP {} {}", status.as_u16(), message);
            return Err(ConnectionError::Signaling(BrokerError::Http {
                status: status.as_u16(),
                message,
            }));
        }

        self.parse_answer(&body)
    }
}
