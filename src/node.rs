//! The single-writer engine actor and the services built around it: the
//! outbound pusher scheduler, the inbound listener, and the transactions
//! API.
//!
//! One file per concern, plain `tracing` spans at component boundaries.
//! `Graph` has exactly one owner, [`EngineActor`], and every other task
//! only ever reaches it through [`EngineHandle`]'s channel: the
//! single-writer discipline is enforced by construction, not convention.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::IteratorRandom;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::algorithm::datastructure::{Graph, PushError, PushKind};
use crate::algorithm::event::Hash;
use crate::config::{Config, QueueFullPolicy};
use crate::crypto::SigningIdentity;
use crate::ledger::Ledger;
use crate::network::{self, NetworkError};
use crate::persistence::{Store, StoreError};
use crate::transactions::Transaction;
use crate::{PeerId, Timestamp};

type SignedEvent = crate::algorithm::event::SignedEvent<Vec<Transaction>, PeerId>;

/// Commands the rest of the system sends to [`EngineActor`]. Every mutation
/// and every query that must see a consistent graph goes through this
/// channel; nothing outside `node` ever touches a `Graph` directly.
enum Command {
    InsertBatch {
        events: Vec<SignedEvent>,
        reply: oneshot::Sender<Vec<(Hash, PushError)>>,
    },
    NewEvent {
        payload: Vec<Transaction>,
        kind: PushKind,
        now: Timestamp,
        reply: oneshot::Sender<Result<Hash, PushError>>,
    },
    HeadsMap {
        reply: oneshot::Sender<HashMap<PeerId, (Hash, u64)>>,
    },
    MissingForPeer {
        peer_heads: HashMap<PeerId, (Hash, u64)>,
        reply: oneshot::Sender<Vec<SignedEvent>>,
    },
    HasEvent {
        id: Hash,
        reply: oneshot::Sender<bool>,
    },
    GetEvent {
        id: Hash,
        reply: oneshot::Sender<Option<SignedEvent>>,
    },
    RandomPeerAddress {
        exclude: PeerId,
        reply: oneshot::Sender<Option<(PeerId, String, u16)>>,
    },
    RegisterAddress {
        peer: PeerId,
        host: String,
        port: u16,
    },
    /// Wipes the hashgraph back to a fresh genesis for the local identity,
    /// discarding every other member's history. Confirming with a user is
    /// the caller's job, not the engine's.
    Reset {
        now: Timestamp,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A consistent, cheaply-cloned read view published at batch boundaries, so
/// readers never observe a torn mid-batch state.
#[derive(Clone, Default)]
pub struct Snapshot {
    ledger: Ledger,
    heads: HashMap<PeerId, (Hash, u64)>,
    /// `(event id, author, payload)` for every ordered event, oldest first.
    /// A linear scan over this is `history_of`'s whole implementation.
    history: Vec<(Hash, PeerId, Vec<Transaction>)>,
}

impl Snapshot {
    fn from_graph(graph: &Graph) -> Self {
        let history = graph
            .ordered_events()
            .iter()
            .map(|hash| {
                let event = graph.event(hash).expect("ordered event is in the graph");
                (hash.clone(), *event.author(), event.payload().clone())
            })
            .collect();
        Snapshot {
            ledger: graph.ledger().clone(),
            heads: graph.heads_map(),
            history,
        }
    }

    pub fn balance_of(&self, member: &PeerId) -> u64 {
        self.ledger.balance_of(member)
    }

    pub fn name_of(&self, member: &PeerId) -> Option<&str> {
        self.ledger.name_of(member)
    }

    /// Every transaction in consensus order naming `member` as sender,
    /// receiver, or name-publication subject.
    pub fn history_of(&self, member: &PeerId) -> Vec<(Hash, PeerId, Transaction)> {
        self.history
            .iter()
            .flat_map(|(hash, author, payload)| {
                payload.iter().filter_map(move |tx| {
                    let involves = match tx {
                        Transaction::Transfer { sender, receiver, .. } => {
                            sender == member || receiver == member
                        }
                        Transaction::PublishName { member: subject, .. } => subject == member,
                    };
                    involves.then(|| (hash.clone(), *author, tx.clone()))
                })
            })
            .collect()
    }

    pub fn heads(&self) -> &HashMap<PeerId, (Hash, u64)> {
        &self.heads
    }
}

/// A cloneable, `Send` handle to the engine actor. Every other task in the
/// system (pusher, listener connection handlers, the transactions API)
/// holds one of these instead of a `Graph`.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    queue_full_policy: QueueFullPolicy,
}

impl EngineHandle {
    async fn send_command(&self, command: Command) {
        match self.queue_full_policy {
            QueueFullPolicy::Block => {
                // Backpressure: wait for room rather than dropping.
                let _ = self.commands.send(command).await;
            }
            QueueFullPolicy::DropOldest => {
                if self.commands.try_send(command).is_err() {
                    warn!("engine command queue full, dropping command (QUEUE_FULL policy: drop_oldest)");
                }
            }
        }
    }

    pub async fn insert_batch(&self, events: Vec<SignedEvent>) -> Vec<(Hash, PushError)> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::InsertBatch { events, reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn new_event(
        &self,
        payload: Vec<Transaction>,
        kind: PushKind,
        now: Timestamp,
    ) -> Result<Hash, PushError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::NewEvent {
            payload,
            kind,
            now,
            reply,
        })
        .await;
        rx.await.map_err(|_| PushError::PeerNotFound(PeerId([0u8; 32])))?
    }

    pub async fn heads_map(&self) -> HashMap<PeerId, (Hash, u64)> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::HeadsMap { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn missing_for_peer(&self, peer_heads: HashMap<PeerId, (Hash, u64)>) -> Vec<SignedEvent> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::MissingForPeer { peer_heads, reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn has_event(&self, id: Hash) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::HasEvent { id, reply }).await;
        rx.await.unwrap_or(false)
    }

    pub async fn get_event(&self, id: Hash) -> Option<SignedEvent> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::GetEvent { id, reply }).await;
        rx.await.ok().flatten()
    }

    pub async fn random_peer_address(&self, exclude: PeerId) -> Option<(PeerId, String, u16)> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::RandomPeerAddress { exclude, reply }).await;
        rx.await.ok().flatten()
    }

    pub async fn register_address(&self, peer: PeerId, host: String, port: u16) {
        self.send_command(Command::RegisterAddress { peer, host, port }).await;
    }

    /// Discards all consensus state and starts over from a fresh genesis.
    /// The caller is responsible for any user confirmation; the engine
    /// performs the reset unconditionally.
    pub async fn reset(&self, now: Timestamp) {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Reset { now, reply }).await;
        let _ = rx.await;
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Shutdown { reply }).await;
        let _ = rx.await;
    }
}

/// Owns the one and only `Graph` in the process. Runs on its own task;
/// every other task reaches it exclusively through [`EngineHandle`].
struct EngineActor {
    graph: Graph,
    commands: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<Snapshot>,
    store: Option<Arc<dyn Store + Send + Sync>>,
}

impl EngineActor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::InsertBatch { events, reply } => {
                    let errors = self.graph.insert(events);
                    for (hash, error) in &errors {
                        debug!(?hash, %error, "rejected event during batch insertion");
                    }
                    self.graph.advance();
                    self.publish_snapshot();
                    let _ = reply.send(errors);
                }
                Command::NewEvent {
                    payload,
                    kind,
                    now,
                    reply,
                } => {
                    let result = self.graph.new_event(payload, kind, now);
                    self.graph.advance();
                    self.publish_snapshot();
                    let _ = reply.send(result);
                }
                Command::HeadsMap { reply } => {
                    let _ = reply.send(self.graph.heads_map());
                }
                Command::MissingForPeer { peer_heads, reply } => {
                    let missing = self.graph.missing_for_peer(&peer_heads).unwrap_or_default();
                    let _ = reply.send(missing);
                }
                Command::HasEvent { id, reply } => {
                    let _ = reply.send(self.graph.event(&id).is_some());
                }
                Command::GetEvent { id, reply } => {
                    let _ = reply.send(self.graph.event(&id).map(|e| e.inner().clone()));
                }
                Command::RandomPeerAddress { exclude, reply } => {
                    let mut rng = rand::thread_rng();
                    let chosen = self
                        .graph
                        .members()
                        .iter()
                        .filter(|(peer, member)| **peer != exclude && member.address.is_some())
                        .choose(&mut rng)
                        .map(|(peer, member)| {
                            let (host, port) = member.address.clone().expect("filtered above");
                            (*peer, host, port)
                        });
                    let _ = reply.send(chosen);
                }
                Command::RegisterAddress { peer, host, port } => {
                    self.graph.members_mut().set_address(&peer, host, port);
                }
                Command::Reset { now, reply } => {
                    let stake_default = self.graph.stake_default();
                    let coin_round_modulus = self.graph.coin_round_modulus();
                    let identity_bytes = self
                        .graph
                        .signing_identity()
                        .expect("a reset-capable node always has a local signing identity")
                        .to_bytes();
                    let identity = SigningIdentity::from_bytes(&identity_bytes);
                    match Graph::new(identity, stake_default, coin_round_modulus, now) {
                        Ok(fresh) => {
                            self.graph = fresh;
                            self.publish_snapshot();
                        }
                        Err(error) => warn!(%error, "failed to rebuild graph during reset"),
                    }
                    let _ = reply.send(());
                }
                Command::Shutdown { reply } => {
                    self.graph.advance();
                    self.publish_snapshot();
                    if let Some(store) = &self.store {
                        if let Err(error) = store.save(&self.graph) {
                            warn!(%error, "failed to save snapshot during shutdown");
                        }
                    }
                    let _ = reply.send(());
                    return;
                }
            }
        }
        // Channel closed without an explicit Shutdown command: a hard
        // stop. Best-effort save from whatever's in memory.
        if let Some(store) = &self.store {
            if let Err(error) = store.save(&self.graph) {
                warn!(%error, "failed to save snapshot after abrupt shutdown");
            }
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(Snapshot::from_graph(&self.graph));
    }
}

/// The transactions API: submit transfer/publish-name, query
/// balance/name/history. Submits go through [`EngineHandle`]; queries read
/// the latest published [`Snapshot`] without round-tripping the actor.
#[derive(Clone)]
pub struct TransactionsApi {
    engine: EngineHandle,
    snapshot: watch::Receiver<Snapshot>,
    self_id: PeerId,
}

impl TransactionsApi {
    fn new(engine: EngineHandle, snapshot: watch::Receiver<Snapshot>, self_id: PeerId) -> Self {
        TransactionsApi {
            engine,
            snapshot,
            self_id,
        }
    }

    async fn submit(&self, tx: Transaction, other_parent: Hash, now: Timestamp) -> Result<Hash, PushError> {
        self.engine
            .new_event(vec![tx], PushKind::Regular(other_parent), now)
            .await
    }

    pub async fn submit_transfer(
        &self,
        receiver: PeerId,
        amount: u64,
        comment: Option<String>,
        now: Timestamp,
    ) -> Result<Hash, PushError> {
        let heads = self.engine.heads_map().await;
        let (self_head, _) = heads
            .get(&self.self_id)
            .cloned()
            .ok_or(PushError::PeerNotFound(self.self_id))?;
        self.submit(
            Transaction::Transfer {
                sender: self.self_id,
                receiver,
                amount,
                comment,
            },
            self_head,
            now,
        )
        .await
    }

    pub async fn submit_publish_name(&self, name: String, now: Timestamp) -> Result<Hash, PushError> {
        let heads = self.engine.heads_map().await;
        let (self_head, _) = heads
            .get(&self.self_id)
            .cloned()
            .ok_or(PushError::PeerNotFound(self.self_id))?;
        self.submit(
            Transaction::PublishName {
                member: self.self_id,
                name,
            },
            self_head,
            now,
        )
        .await
    }

    pub fn balance_of(&self, member: &PeerId) -> u64 {
        self.snapshot.borrow().balance_of(member)
    }

    pub fn name_of(&self, member: &PeerId) -> Option<String> {
        self.snapshot.borrow().name_of(member).map(str::to_owned)
    }

    pub fn history_of(&self, member: &PeerId) -> Vec<(Hash, PeerId, Transaction)> {
        self.snapshot.borrow().history_of(member)
    }
}

/// Ties the engine actor, outbound pusher and inbound listener together.
pub struct Node {
    config: Config,
    engine: EngineHandle,
    self_id: PeerId,
    actor_task: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl Node {
    pub fn new(config: Config, identity: SigningIdentity, store: Option<Arc<dyn Store + Send + Sync>>) -> Result<(Self, TransactionsApi), StoreError> {
        let self_id = identity.verifying_key();
        let graph = Graph::new(identity, config.stake_default, config.coin_round_modulus, now_ms())?;
        let (commands_tx, commands_rx) = mpsc::channel(config.inbound_queue_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::from_graph(&graph));
        let engine = EngineHandle {
            commands: commands_tx,
            queue_full_policy: config.queue_full_policy,
        };
        let actor = EngineActor {
            graph,
            commands: commands_rx,
            snapshot_tx,
            store,
        };
        let actor_task = tokio::spawn(actor.run());
        let (shutdown_tx, _) = watch::channel(false);
        let api = TransactionsApi::new(engine.clone(), snapshot_rx, self_id);
        Ok((
            Node {
                config,
                engine,
                self_id,
                actor_task,
                shutdown_tx,
                background: Vec::new(),
            },
            api,
        ))
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Reconstructs a `Node` around an already-loaded `Graph` (e.g. from
    /// [`crate::persistence::Store::load`]), rather than starting a fresh
    /// genesis.
    pub fn from_graph(config: Config, graph: Graph, store: Option<Arc<dyn Store + Send + Sync>>) -> (Self, TransactionsApi) {
        let self_id = graph.self_id();
        let (commands_tx, commands_rx) = mpsc::channel(config.inbound_queue_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::from_graph(&graph));
        let engine = EngineHandle {
            commands: commands_tx,
            queue_full_policy: config.queue_full_policy,
        };
        let actor = EngineActor {
            graph,
            commands: commands_rx,
            snapshot_tx,
            store,
        };
        let actor_task = tokio::spawn(actor.run());
        let (shutdown_tx, _) = watch::channel(false);
        let api = TransactionsApi::new(engine.clone(), snapshot_rx, self_id);
        (
            Node {
                config,
                engine,
                self_id,
                actor_task,
                shutdown_tx,
                background: Vec::new(),
            },
            api,
        )
    }

    /// Spawns the inbound listener and the outbound pusher scheduler, and
    /// fires the bootstrap push if configured.
    pub async fn run(&mut self) -> std::io::Result<()> {
        let listener_task = {
            let engine = self.engine.clone();
            let self_id = self.self_id;
            let mut shutdown = self.shutdown_tx.subscribe();
            let listener = TcpListener::bind((self.config.listen_host.as_str(), self.config.listen_port)).await?;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!("listener stopping for graceful shutdown");
                                return;
                            }
                        }
                        accepted = listener.accept() => {
                            let Ok((stream, peer_addr)) = accepted else { continue };
                            let engine = engine.clone();
                            tokio::spawn(async move {
                                if let Err(error) = network::serve_one(stream, self_id, &engine).await {
                                    warn!(%peer_addr, %error, "inbound push failed");
                                }
                            });
                        }
                    }
                }
            })
        };

        let pusher_task = {
            let engine = self.engine.clone();
            let self_id = self.self_id;
            let interval = std::time::Duration::from_millis(self.config.push_interval_ms);
            let mut shutdown = self.shutdown_tx.subscribe();
            let in_flight = Arc::new(Mutex::new(()));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!("pusher stopping for graceful shutdown");
                                return;
                            }
                        }
                        _ = ticker.tick() => {
                            let Ok(guard) = in_flight.clone().try_lock_owned() else {
                                debug!("skipping scheduled push: one already in flight");
                                continue;
                            };
                            let Some((_, host, port)) = engine.random_peer_address(self_id).await else {
                                continue;
                            };
                            let engine = engine.clone();
                            tokio::spawn(async move {
                                let _guard = guard;
                                if let Err(error) = network::push(&host, port, self_id, &engine, now_ms()).await {
                                    warn!(%host, port, %error, "scheduled push failed");
                                }
                            });
                        }
                    }
                }
            })
        };

        if let Some(addr) = self.config.bootstrap_address().ok().flatten() {
            let engine = self.engine.clone();
            let self_id = self.self_id;
            tokio::spawn(async move {
                let (host, port) = addr;
                if let Err(error) = network::push(&host, port, self_id, &engine, now_ms()).await {
                    warn!(%host, port, %error, "bootstrap push failed");
                }
            });
        }

        // These tasks run until shutdown; `run` itself returns once both
        // have been spawned. `Node::shutdown` awaits them via `background`.
        self.background.push(listener_task);
        self.background.push(pusher_task);
        Ok(())
    }

    /// Explicit `push_to(host, port)` command.
    pub async fn push_to(&self, host: &str, port: u16) -> Result<(), NetworkError> {
        network::push(host, port, self.self_id, &self.engine, now_ms()).await
    }

    /// Discards all consensus state and starts over from a fresh genesis.
    /// Any user-facing confirmation belongs to the caller; this performs
    /// the reset unconditionally.
    pub async fn reset(&self) {
        self.engine.reset(now_ms()).await;
    }

    /// Graceful shutdown: stop scheduling new pushes/accepts, drain
    /// in-flight work, flush a snapshot, then exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.background {
            let _ = handle.await;
        }
        self.engine.shutdown().await;
        let _ = self.actor_task.await;
    }

    /// A hard shutdown: skip draining, still attempt a best-effort
    /// snapshot via the actor's channel-close path.
    pub async fn shutdown_hard(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.background {
            handle.abort();
        }
        drop(self.engine);
        let _ = self.actor_task.await;
    }
}

pub(crate) fn now_ms() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}
