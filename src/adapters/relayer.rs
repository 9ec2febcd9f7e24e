//! HTTP client for the decryption relayer
//!
//! Two endpoints are used:
//! - `POST /v1/public-decrypt` resolves handles to clear values with one
//!   proof for the batch
//! - `POST /v1/input-proof` encrypts move coordinates for a player
//!
//! Non-success statuses are mapped to [`OracleErrorKind`]; retryable kinds
//! are retried here with exponential backoff before the error reaches the
//! state machine.

use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::chain::{DecryptionOracle, InputEncryptor};
use crate::config::RelayerConfig;
use crate::domain::{Cell, Decryption, EncryptedMove, Handle};
use crate::error::{AgentError, OracleError, OracleErrorKind, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptRequest {
    contract_address: String,
    handles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DecryptResponse {
    values: HashMap<String, String>,
    proof: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InputProofRequest {
    contract_address: String,
    user_address: String,
    values: Vec<u8>,
    bits: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputProofResponse {
    handles: Vec<String>,
    input_proof: String,
}

fn malformed(message: impl Into<String>) -> AgentError {
    OracleError::new(OracleErrorKind::Malformed, message).into()
}

fn parse_bytes(value: &str) -> Result<Bytes> {
    Bytes::from_str(value).map_err(|e| malformed(format!("bad hex payload: {}", e)))
}

fn parse_handle(value: &str) -> Result<Handle> {
    Handle::from_str(value).map_err(|e| malformed(format!("bad handle {}: {}", value, e)))
}

fn into_decryption(requested: &[Handle], resp: DecryptResponse) -> Result<Decryption> {
    let mut values = HashMap::with_capacity(resp.values.len());
    for (handle, value) in &resp.values {
        let clear = U256::from_str(value)
            .map_err(|e| malformed(format!("bad clear value {}: {}", value, e)))?;
        values.insert(parse_handle(handle)?, clear);
    }
    if let Some(missing) = requested.iter().find(|h| !values.contains_key(*h)) {
        return Err(malformed(format!("no value for handle {:#x}", missing)));
    }
    Ok(Decryption {
        values,
        proof: parse_bytes(&resp.proof)?,
    })
}

fn into_encrypted(resp: InputProofResponse) -> Result<EncryptedMove> {
    let [x, y] = resp.handles.as_slice() else {
        return Err(malformed(format!(
            "expected 2 input handles, got {}",
            resp.handles.len()
        )));
    };
    Ok(EncryptedMove {
        x: parse_handle(x)?,
        y: parse_handle(y)?,
        proof: parse_bytes(&resp.input_proof)?,
    })
}

pub struct RelayerClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    max_attempts: u32,
    backoff: Duration,
}

impl RelayerClient {
    pub fn new(config: &RelayerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AgentError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        })
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    async fn post_once<B, R>(&self, path: &str, body: &B) -> std::result::Result<R, OracleError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut request = self.http.post(format!("{}{}", self.base_url, path)).json(body);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OracleError::new(OracleErrorKind::Unavailable, e.to_string()))?;
        let status = response.status();
        if status == StatusCode::ACCEPTED || !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OracleError::new(
                OracleErrorKind::from_status(status.as_u16()),
                format!("{} {}: {}", path, status, text.trim()),
            ));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| OracleError::new(OracleErrorKind::Malformed, e.to_string()))
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_once(path, body).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.kind.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Relayer {} failed ({}), retry {}/{} in {:?}",
                        path, e, attempt, self.max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl DecryptionOracle for RelayerClient {
    #[instrument(skip(self, handles), fields(count = handles.len()))]
    async fn decrypt(&self, contract: Address, handles: &[Handle]) -> Result<Decryption> {
        let body = DecryptRequest {
            contract_address: format!("{:#x}", contract),
            handles: handles.iter().map(|h| format!("{:#x}", h)).collect(),
        };
        let resp: DecryptResponse = self.post("/v1/public-decrypt", &body).await?;
        debug!("Decrypted {} handles", resp.values.len());
        into_decryption(handles, resp)
    }
}

#[async_trait]
impl InputEncryptor for RelayerClient {
    #[instrument(skip(self))]
    async fn encrypt_move(
        &self,
        contract: Address,
        player: Address,
        cell: Cell,
    ) -> Result<EncryptedMove> {
        let body = InputProofRequest {
            contract_address: format!("{:#x}", contract),
            user_address: format!("{:#x}", player),
            values: vec![cell.x, cell.y],
            bits: 8,
        };
        let resp: InputProofResponse = self.post("/v1/input-proof", &body).await?;
        into_encrypted(resp)
    }
}
