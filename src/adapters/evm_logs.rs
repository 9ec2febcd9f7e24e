use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::evm_ledger::{id_to_u64, with_timeout, IHiddenGrid};
use crate::chain::LogSource;
use crate::config::LedgerConfig;
use crate::domain::{GameEvent, GameEventKind};
use crate::error::{AgentError, Result};

fn signature(kind: GameEventKind) -> B256 {
    use IHiddenGrid::*;
    match kind {
        GameEventKind::GameStarted => GameStarted::SIGNATURE_HASH,
        GameEventKind::PlayerJoined => PlayerJoined::SIGNATURE_HASH,
        GameEventKind::MoveSubmitted => MoveSubmitted::SIGNATURE_HASH,
        GameEventKind::MoveInvalid => MoveInvalid::SIGNATURE_HASH,
        GameEventKind::MoveMade => MoveMade::SIGNATURE_HASH,
        GameEventKind::MovesProcessed => MovesProcessed::SIGNATURE_HASH,
        GameEventKind::Collision => Collision::SIGNATURE_HASH,
        GameEventKind::GameUpdated => GameUpdated::SIGNATURE_HASH,
        GameEventKind::BoardRevealed => BoardRevealed::SIGNATURE_HASH,
        GameEventKind::GameCancelled => GameCancelled::SIGNATURE_HASH,
        GameEventKind::GameTimeout => GameTimeout::SIGNATURE_HASH,
    }
}

/// Decode a raw contract log. Every consumed event carries the game id as
/// its first indexed topic.
fn decode(log: &Log) -> Option<GameEvent> {
    if log.removed {
        return None;
    }
    let topic0 = log.topic0()?;
    let kind = GameEventKind::ALL
        .into_iter()
        .find(|k| signature(*k) == *topic0)?;
    let game_topic = log.topics().get(1)?;
    let game_id = id_to_u64(U256::from_be_bytes(game_topic.0)).ok()?;
    Some(GameEvent {
        game_id,
        kind,
        block: log.block_number?,
        log_index: log.log_index?,
    })
}

/// Contract events over `eth_getLogs` and, when a WebSocket URL is set,
/// `eth_subscribe`.
pub struct EvmLogSource {
    http: DynProvider,
    ws_url: Option<String>,
    contract: Address,
    rpc_timeout: Duration,
}

impl EvmLogSource {
    pub fn connect(config: &LedgerConfig) -> Result<Self> {
        let rpc_url = config
            .rpc_url
            .parse()
            .map_err(|e| AgentError::Validation(format!("Invalid RPC URL: {}", e)))?;
        let contract = config
            .contract_address
            .parse()
            .map_err(|e| AgentError::Validation(format!("Invalid contract address: {}", e)))?;
        Ok(Self {
            http: ProviderBuilder::new().connect_http(rpc_url).erased(),
            ws_url: config.ws_url.clone(),
            contract,
            rpc_timeout: config.rpc_timeout(),
        })
    }

    fn filter(&self) -> Filter {
        let topics: Vec<B256> = GameEventKind::ALL.into_iter().map(signature).collect();
        Filter::new().address(self.contract).event_signature(topics)
    }
}

#[async_trait]
impl LogSource for EvmLogSource {
    async fn head(&self) -> Result<u64> {
        with_timeout(self.rpc_timeout, "eth_blockNumber", self.http.get_block_number()).await
    }

    async fn events_between(&self, from: u64, to: u64) -> Result<Vec<GameEvent>> {
        let filter = self.filter().from_block(from).to_block(to);
        let logs = with_timeout(self.rpc_timeout, "eth_getLogs", self.http.get_logs(&filter)).await?;
        let mut events: Vec<GameEvent> = logs.iter().filter_map(decode).collect();
        events.sort_by_key(|e| (e.block, e.log_index));
        debug!("Fetched {} events in blocks {}..={}", events.len(), from, to);
        Ok(events)
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, GameEvent>> {
        let url = self
            .ws_url
            .clone()
            .ok_or_else(|| AgentError::Rpc("No WebSocket URL configured".into()))?;
        let ws = with_timeout(
            self.rpc_timeout,
            "WebSocket connect",
            ProviderBuilder::new().connect_ws(WsConnect::new(url.clone())),
        )
        .await?
        .erased();
        let subscription = with_timeout(
            self.rpc_timeout,
            "eth_subscribe",
            ws.subscribe_logs(&self.filter()),
        )
        .await?;
        info!("Subscribed to contract logs at {}", url);

        let stream = subscription.into_stream().filter_map(move |log| {
            // The provider owns the socket; keep it alive with the stream.
            let _ws = &ws;
            let event = decode(&log);
            if event.is_none() {
                warn!("Ignoring undecodable log in tx {:?}", log.transaction_hash);
            }
            futures::future::ready(event)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData};

    fn raw(topics: Vec<B256>, block: u64, index: u64) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0xcc),
                data: LogData::new_unchecked(topics, Bytes::new()),
            },
            block_number: Some(block),
            log_index: Some(index),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_known_event() {
        let game = B256::from(U256::from(42u64).to_be_bytes::<32>());
        let log = raw(
            vec![IHiddenGrid::MoveMade::SIGNATURE_HASH, game, B256::ZERO],
            10,
            3,
        );
        let event = decode(&log).unwrap();
        assert_eq!(event.game_id, 42);
        assert_eq!(event.kind, GameEventKind::MoveMade);
        assert_eq!((event.block, event.log_index), (10, 3));
    }

    #[test]
    fn test_decode_skips_foreign_and_removed_logs() {
        let game = B256::from(U256::from(1u64).to_be_bytes::<32>());
        assert!(decode(&raw(vec![B256::repeat_byte(9), game], 1, 0)).is_none());

        let mut removed = raw(vec![IHiddenGrid::GameUpdated::SIGNATURE_HASH, game], 1, 0);
        removed.removed = true;
        assert!(decode(&removed).is_none());
    }
}
