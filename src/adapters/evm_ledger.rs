//! Hidden-grid contract client over alloy
//!
//! Reads are pinned to an explicit block. Writes are signed locally with the
//! configured key so the transaction hash is known before broadcast; a
//! submission lock keeps nonces ordered between `prepare` and `broadcast`.

use alloy::eips::BlockId;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::chain::{Ledger, PreparedTx};
use crate::config::LedgerConfig;
use crate::domain::{GameFacts, LedgerCall, MoveFacts, RoundHandles, TxRef, TxStatus, Winner};
use crate::error::{AgentError, Result};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IHiddenGrid {
        struct GameView {
            address player1;
            address player2;
            uint32 round;
            uint8 winner;
            bool cancelled;
            bool boardRevealed;
            uint8 boardSize;
            uint64 lastActionTimestamp;
            uint64 moveTimeout;
            bytes32 winnerHandle;
            bytes32 collisionHandle;
            bytes32[] board;
        }

        struct MoveView {
            bool isSubmitted;
            bool isMade;
            bytes32 isInvalidHandle;
        }

        function getGameById(uint256 gameId) external view returns (GameView memory game);
        function getMovesById(uint256 gameId) external view returns (MoveView memory player1Move, MoveView memory player2Move);
        function getOpenGames() external view returns (uint256[] memory gameIds);
        function getGamesByPlayer(address player) external view returns (uint256[] memory gameIds);
        function canSubmitMove(uint256 gameId, address player) external view returns (bool allowed);

        function startGame(uint64 moveTimeout) external returns (uint256 gameId);
        function joinGame(uint256 gameId) external;
        function cancelGame(uint256 gameId) external;
        function submitMove(uint256 gameId, bytes32 encryptedX, bytes32 encryptedY, bytes calldata inputProof) external;
        function finalizeMove(uint256 gameId, address player, bool isInvalid, bytes calldata proof) external;
        function finalizeGameState(uint256 gameId, uint8 winner, bool collision, bytes calldata proof) external;
        function revealBoard(uint256 gameId, uint8[] calldata board, bytes calldata proof) external;
        function claimTimeout(uint256 gameId) external;

        event GameStarted(uint256 indexed gameId, address indexed player1);
        event PlayerJoined(uint256 indexed gameId, address indexed player2);
        event MoveSubmitted(uint256 indexed gameId, address indexed player);
        event MoveInvalid(uint256 indexed gameId, address indexed player);
        event MoveMade(uint256 indexed gameId, address indexed player);
        event MovesProcessed(uint256 indexed gameId, uint32 round);
        event Collision(uint256 indexed gameId, uint32 round);
        event GameUpdated(uint256 indexed gameId);
        event BoardRevealed(uint256 indexed gameId);
        event GameCancelled(uint256 indexed gameId);
        event GameTimeout(uint256 indexed gameId, address indexed claimant);
    }
}

/// Gas limit headroom over the node's estimate, in percent
const GAS_HEADROOM_PCT: u64 = 20;

pub(crate) fn id_to_u64(value: U256) -> Result<u64> {
    u64::try_from(value).map_err(|_| AgentError::Rpc(format!("Game id {} exceeds u64", value)))
}

/// Wrap a provider future with the configured RPC timeout.
pub(crate) async fn with_timeout<F, T, E>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: IntoFuture<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(limit, fut.into_future()).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(AgentError::Rpc(format!("{}: {}", what, e))),
        Err(_) => Err(AgentError::Timeout(format!("{} after {:?}", what, limit))),
    }
}

fn move_facts(view: &IHiddenGrid::MoveView) -> MoveFacts {
    MoveFacts {
        is_submitted: view.isSubmitted,
        is_made: view.isMade,
        validity: (!view.isInvalidHandle.is_zero()).then_some(view.isInvalidHandle),
    }
}

pub struct EvmLedger {
    provider: DynProvider,
    contract: IHiddenGrid::IHiddenGridInstance<DynProvider>,
    address: Address,
    chain_id: u64,
    wallet: Option<EthereumWallet>,
    local: Address,
    rpc_timeout: Duration,
    submit_lock: Arc<Mutex<()>>,
}

impl EvmLedger {
    /// Connect over HTTP. Without a private key the ledger is read-only.
    pub fn connect(config: &LedgerConfig, private_key: Option<&str>) -> Result<Self> {
        let rpc_url = config
            .rpc_url
            .parse()
            .map_err(|e| AgentError::Validation(format!("Invalid RPC URL: {}", e)))?;
        let address: Address = config
            .contract_address
            .parse()
            .map_err(|e| AgentError::Validation(format!("Invalid contract address: {}", e)))?;

        let (wallet, local) = match private_key {
            Some(key) => {
                let signer: PrivateKeySigner = key
                    .trim()
                    .trim_start_matches("0x")
                    .parse()
                    .map_err(|e| AgentError::Wallet(format!("Invalid private key: {}", e)))?;
                let local = signer.address();
                (Some(EthereumWallet::from(signer)), local)
            }
            None => (None, Address::ZERO),
        };

        let provider = ProviderBuilder::new().connect_http(rpc_url).erased();
        let contract = IHiddenGrid::new(address, provider.clone());
        info!(
            "Ledger client ready: chain {} contract {:#x} player {:#x}",
            config.chain_id, address, local
        );

        Ok(Self {
            provider,
            contract,
            address,
            chain_id: config.chain_id,
            wallet,
            local,
            rpc_timeout: config.rpc_timeout(),
            submit_lock: Arc::new(Mutex::new(())),
        })
    }

    fn encode(&self, call: &LedgerCall) -> TransactionRequest {
        let c = &self.contract;
        match call {
            LedgerCall::StartGame { move_timeout_secs } => {
                c.startGame(*move_timeout_secs).into_transaction_request()
            }
            LedgerCall::JoinGame { game_id } => c.joinGame(U256::from(*game_id)).into_transaction_request(),
            LedgerCall::CancelGame { game_id } => {
                c.cancelGame(U256::from(*game_id)).into_transaction_request()
            }
            LedgerCall::SubmitMove {
                game_id, encrypted, ..
            } => c
                .submitMove(
                    U256::from(*game_id),
                    encrypted.x,
                    encrypted.y,
                    encrypted.proof.clone(),
                )
                .into_transaction_request(),
            LedgerCall::FinalizeMove {
                game_id,
                player,
                is_invalid,
                proof,
            } => c
                .finalizeMove(U256::from(*game_id), *player, *is_invalid, proof.clone())
                .into_transaction_request(),
            LedgerCall::FinalizeGameState {
                game_id,
                winner,
                collision,
                proof,
            } => c
                .finalizeGameState(U256::from(*game_id), winner.code(), *collision, proof.clone())
                .into_transaction_request(),
            LedgerCall::RevealBoard {
                game_id,
                board,
                proof,
            } => c
                .revealBoard(U256::from(*game_id), board.clone(), proof.clone())
                .into_transaction_request(),
            LedgerCall::ClaimTimeout { game_id } => {
                c.claimTimeout(U256::from(*game_id)).into_transaction_request()
            }
        }
    }
}

#[async_trait]
impl Ledger for EvmLedger {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn contract(&self) -> Address {
        self.address
    }

    fn local_address(&self) -> Address {
        self.local
    }

    async fn current_block(&self) -> Result<u64> {
        with_timeout(self.rpc_timeout, "eth_blockNumber", self.provider.get_block_number()).await
    }

    #[instrument(skip(self))]
    async fn get_game(&self, game_id: u64, block: u64) -> Result<GameFacts> {
        let call = self
            .contract
            .getGameById(U256::from(game_id))
            .block(BlockId::number(block));
        let g = with_timeout(self.rpc_timeout, "getGameById", call.call()).await?;

        let round_handles = (!g.winnerHandle.is_zero()).then_some(RoundHandles {
            winner: g.winnerHandle,
            collision: g.collisionHandle,
        });
        Ok(GameFacts {
            game_id,
            block,
            player1: g.player1,
            player2: (g.player2 != Address::ZERO).then_some(g.player2),
            round: g.round,
            winner: Winner::from_code(g.winner),
            cancelled: g.cancelled,
            board_revealed: g.boardRevealed,
            board_size: g.boardSize,
            last_action_at: g.lastActionTimestamp,
            move_timeout_secs: g.moveTimeout,
            round_handles,
            board: g.board,
            moves: [MoveFacts::default(); 2],
        })
    }

    async fn get_moves(&self, game_id: u64, block: u64) -> Result<[MoveFacts; 2]> {
        let call = self
            .contract
            .getMovesById(U256::from(game_id))
            .block(BlockId::number(block));
        let moves = with_timeout(self.rpc_timeout, "getMovesById", call.call()).await?;
        Ok([move_facts(&moves.player1Move), move_facts(&moves.player2Move)])
    }

    async fn get_open_games(&self) -> Result<Vec<u64>> {
        let call = self.contract.getOpenGames();
        let ids = with_timeout(self.rpc_timeout, "getOpenGames", call.call()).await?;
        ids.into_iter().map(id_to_u64).collect()
    }

    async fn get_games_by_player(&self, player: Address) -> Result<Vec<u64>> {
        let call = self.contract.getGamesByPlayer(player);
        let ids = with_timeout(self.rpc_timeout, "getGamesByPlayer", call.call()).await?;
        ids.into_iter().map(id_to_u64).collect()
    }

    async fn can_submit_move(&self, game_id: u64, player: Address, block: u64) -> Result<bool> {
        let call = self
            .contract
            .canSubmitMove(U256::from(game_id), player)
            .block(BlockId::number(block));
        with_timeout(self.rpc_timeout, "canSubmitMove", call.call()).await
    }

    async fn transaction_status(&self, tx: &TxRef) -> Result<TxStatus> {
        let receipt = with_timeout(
            self.rpc_timeout,
            "eth_getTransactionReceipt",
            self.provider.get_transaction_receipt(tx.0),
        )
        .await?;
        if let Some(receipt) = receipt {
            let block = receipt.block_number.unwrap_or_default();
            return Ok(if receipt.status() {
                TxStatus::Success { block }
            } else {
                TxStatus::Reverted { block }
            });
        }

        let known = with_timeout(
            self.rpc_timeout,
            "eth_getTransactionByHash",
            self.provider.get_transaction_by_hash(tx.0),
        )
        .await?;
        Ok(if known.is_some() {
            TxStatus::Pending
        } else {
            TxStatus::NotFound
        })
    }

    #[instrument(skip(self, call), fields(action = %call.action()))]
    async fn prepare(&self, call: LedgerCall) -> Result<PreparedTx> {
        let wallet = self
            .wallet
            .as_ref()
            .ok_or_else(|| AgentError::Wallet("No private key configured".into()))?;

        let permit = self.submit_lock.clone().lock_owned().await;

        let request = self
            .encode(&call)
            .with_from(self.local)
            .with_chain_id(self.chain_id);
        let nonce = with_timeout(
            self.rpc_timeout,
            "eth_getTransactionCount",
            self.provider.get_transaction_count(self.local).pending(),
        )
        .await?;
        let gas = with_timeout(
            self.rpc_timeout,
            "eth_estimateGas",
            self.provider.estimate_gas(request.clone()),
        )
        .await?;
        let fees = with_timeout(
            self.rpc_timeout,
            "fee estimation",
            self.provider.estimate_eip1559_fees(),
        )
        .await?;

        let envelope = request
            .with_nonce(nonce)
            .with_gas_limit(gas + gas * GAS_HEADROOM_PCT / 100)
            .with_max_fee_per_gas(fees.max_fee_per_gas)
            .with_max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
            .build(wallet)
            .await
            .map_err(|e| AgentError::Wallet(format!("Failed to sign transaction: {}", e)))?;

        let reference = TxRef(*envelope.tx_hash());
        debug!("Prepared {} with nonce {}", reference, nonce);
        Ok(PreparedTx::signed(reference, call, envelope, permit))
    }

    async fn broadcast(&self, tx: PreparedTx) -> Result<TxRef> {
        let PreparedTx {
            reference,
            envelope,
            permit,
            ..
        } = tx;
        let envelope = envelope.ok_or_else(|| {
            AgentError::InvalidState(format!("Transaction {} was never signed", reference))
        })?;

        let pending = with_timeout(
            self.rpc_timeout,
            "eth_sendRawTransaction",
            self.provider.send_tx_envelope(envelope),
        )
        .await?;
        drop(permit);

        let sent = TxRef(*pending.tx_hash());
        if sent != reference {
            return Err(AgentError::Rpc(format!(
                "Node returned hash {} for prepared {}",
                sent, reference
            )));
        }
        Ok(sent)
    }

    async fn started_game_id(&self, tx: &TxRef) -> Result<Option<u64>> {
        let receipt = with_timeout(
            self.rpc_timeout,
            "eth_getTransactionReceipt",
            self.provider.get_transaction_receipt(tx.0),
        )
        .await?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        for log in receipt.inner.logs() {
            if log.address() != self.address {
                continue;
            }
            if let Ok(started) = log.log_decode::<IHiddenGrid::GameStarted>() {
                return id_to_u64(started.inner.data.gameId).map(Some);
            }
        }
        Ok(None)
    }
}
