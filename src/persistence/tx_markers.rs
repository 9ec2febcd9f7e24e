//! Idempotent ledger submissions
//!
//! A marker is written with the transaction reference *before* the
//! transaction is broadcast, so a crash between the two never leads to a
//! second submission of the same logical step. Before any step is
//! (re)submitted, `begin` consults the stored marker and the ledger:
//!
//! | marker     | ledger                | decision                    |
//! |------------|-----------------------|-----------------------------|
//! | none       | -                     | Proceed                     |
//! | Failed     | -                     | Proceed                     |
//! | Dropped    | -                     | Proceed                     |
//! | Pending    | Pending               | Wait                        |
//! | Pending    | NotFound (in grace)   | Wait                        |
//! | Pending    | NotFound (after)      | Dropped, Proceed            |
//! | Pending    | Reverted              | Failed, Proceed             |
//! | Pending    | Success               | Confirmed (unless stale)    |
//! | Confirmed  | -                     | Confirmed (unless stale)    |
//!
//! A confirmed marker is stale when its parameters differ from the
//! requested ones, or when it was mined at or before the block the caller
//! observed: the caller's facts already include it and still ask for the
//! step, so the step is needed again.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::store::GameStore;
use crate::chain::Ledger;
use crate::config::MarkerConfig;
use crate::domain::{GameKey, LedgerCall, MarkerStatus, TxAction, TxMarker, TxRef, TxStatus};
use crate::error::{AgentError, Result};

/// Outcome of consulting the marker for one (game, action)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerDecision {
    /// Nothing in flight; submit now
    Proceed,
    /// A previous submission is still unresolved; do nothing this step
    Wait,
    /// A previous submission landed after the observed block
    Confirmed(TxMarker),
}

pub struct TxMarkerManager {
    store: Arc<dyn GameStore>,
    ledger: Arc<dyn Ledger>,
    config: MarkerConfig,
}

impl TxMarkerManager {
    pub fn new(store: Arc<dyn GameStore>, ledger: Arc<dyn Ledger>, config: MarkerConfig) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    /// Decide whether `action` may be submitted for `key`.
    #[instrument(skip(self, params_hash), fields(game = %key))]
    pub async fn begin(
        &self,
        key: &GameKey,
        action: TxAction,
        params_hash: &str,
        observed_block: u64,
    ) -> Result<MarkerDecision> {
        let Some(mut marker) = self.store.get_marker(key, action).await? else {
            return Ok(MarkerDecision::Proceed);
        };

        match marker.status {
            MarkerStatus::Failed | MarkerStatus::Dropped => Ok(MarkerDecision::Proceed),
            MarkerStatus::Confirmed => Ok(Self::judge_confirmed(
                marker,
                params_hash,
                observed_block,
            )),
            MarkerStatus::Pending => {
                let status = self.ledger.transaction_status(&marker.tx_ref).await?;
                match status {
                    TxStatus::Pending => {
                        debug!("{} {} still pending", action, marker.tx_ref);
                        Ok(MarkerDecision::Wait)
                    }
                    TxStatus::Success { block } => {
                        self.settle(&mut marker, MarkerStatus::Confirmed, Some(block))
                            .await?;
                        info!("{} {} confirmed in block {}", action, marker.tx_ref, block);
                        Ok(Self::judge_confirmed(marker, params_hash, observed_block))
                    }
                    TxStatus::Reverted { block } => {
                        self.settle(&mut marker, MarkerStatus::Failed, Some(block))
                            .await?;
                        warn!("{} {} reverted in block {}", action, marker.tx_ref, block);
                        Ok(MarkerDecision::Proceed)
                    }
                    TxStatus::NotFound => {
                        let age = Utc::now() - marker.created_at;
                        if age.num_seconds() < self.config.dropped_grace_secs as i64 {
                            debug!(
                                "{} {} not visible yet ({}s old)",
                                action,
                                marker.tx_ref,
                                age.num_seconds()
                            );
                            return Ok(MarkerDecision::Wait);
                        }
                        self.settle(&mut marker, MarkerStatus::Dropped, None).await?;
                        warn!("{} {} dropped by the network", action, marker.tx_ref);
                        Ok(MarkerDecision::Proceed)
                    }
                }
            }
        }
    }

    fn judge_confirmed(marker: TxMarker, params_hash: &str, observed_block: u64) -> MarkerDecision {
        if marker.params_hash.as_deref() != Some(params_hash) {
            debug!(
                "{} parameters changed since {}, resubmitting",
                marker.action, marker.tx_ref
            );
            return MarkerDecision::Proceed;
        }
        match marker.block {
            Some(block) if block > observed_block => MarkerDecision::Confirmed(marker),
            _ => {
                debug!(
                    "{} {} already reflected at block {}",
                    marker.action, marker.tx_ref, observed_block
                );
                MarkerDecision::Proceed
            }
        }
    }

    async fn settle(
        &self,
        marker: &mut TxMarker,
        status: MarkerStatus,
        block: Option<u64>,
    ) -> Result<()> {
        marker.status = status;
        marker.block = block.or(marker.block);
        marker.updated_at = Utc::now();
        self.store.upsert_marker(marker).await
    }

    /// Sign, record and broadcast `call`.
    ///
    /// The pending marker is durable before the broadcast starts. A broadcast
    /// that times out leaves the marker pending so `begin` can find out what
    /// happened; any other broadcast error marks it failed.
    #[instrument(skip(self, params_hash, call), fields(game = %key, action = %call.action()))]
    pub async fn submit(&self, key: &GameKey, params_hash: &str, call: LedgerCall) -> Result<TxRef> {
        let action = call.action();
        let prepared = self.ledger.prepare(call).await?;
        let now = Utc::now();
        let mut marker = TxMarker {
            key: *key,
            action,
            tx_ref: prepared.reference,
            status: MarkerStatus::Pending,
            block: None,
            params_hash: Some(params_hash.to_string()),
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_marker(&marker).await?;

        match self.ledger.broadcast(prepared).await {
            Ok(tx) => {
                info!("Broadcast {} {}", action, tx);
                Ok(tx)
            }
            Err(e @ AgentError::Timeout(_)) => {
                warn!("Broadcast of {} {} timed out: {}", action, marker.tx_ref, e);
                Err(e)
            }
            Err(e) => {
                warn!("Broadcast of {} {} failed: {}", action, marker.tx_ref, e);
                self.settle(&mut marker, MarkerStatus::Failed, None).await?;
                Err(e)
            }
        }
    }

    pub async fn marker(&self, key: &GameKey, action: TxAction) -> Result<Option<TxMarker>> {
        self.store.get_marker(key, action).await
    }

    /// Forget all markers of a finished game.
    pub async fn release_all(&self, key: &GameKey) -> Result<()> {
        let removed = self.store.delete_markers(key).await?;
        if removed > 0 {
            debug!("Released {} markers for {}", removed, key);
        }
        Ok(())
    }
}
