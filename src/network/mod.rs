//! The push gossip protocol: handshake, frame codec, and the active/passive
//! sides of a push. The handshake and framing crypto are thin wrappers over
//! the [`crate::crypto::aead`] primitives.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::algorithm::event::Hash;
use crate::crypto::{EphemeralKeyAgreement, SessionError, SessionReceiver, SessionSender};
use crate::node::EngineHandle;
use crate::transactions::Transaction;
use crate::{PeerId, PushKind, Timestamp};

type SignedEvent = crate::algorithm::event::SignedEvent<Vec<Transaction>, PeerId>;

/// Largest frame this side will read before giving up on the peer: an
/// oversized/malformed frame closes the connection.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("peer sent a frame of {0} bytes, exceeding the {1} byte limit")]
    FrameTooLarge(u32, u32),
    #[error("peer closed the connection mid-handshake or mid-frame")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] bincode::Error),
    #[error("push target has no known address")]
    NoAddress,
}

#[derive(Serialize, Deserialize)]
struct Hello {
    verify_key: [u8; 32],
    ephemeral_pk: [u8; 32],
}

/// One wire frame kind after the handshake. `Bye` carries no payload; both
/// sides may send it before closing.
#[derive(Serialize, Deserialize)]
enum Frame {
    Heads(HashMap<PeerId, (Hash, u64)>),
    Request(HashSet<Hash>),
    Events(Vec<SignedEvent>),
    Bye,
}

async fn write_raw_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), NetworkError> {
    let len: u32 = bytes
        .len()
        .try_into()
        .map_err(|_| NetworkError::FrameTooLarge(u32::MAX, MAX_FRAME_BYTES))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    Ok(())
}

async fn read_raw_frame(stream: &mut TcpStream) -> Result<Vec<u8>, NetworkError> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(NetworkError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(NetworkError::FrameTooLarge(len, MAX_FRAME_BYTES));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_hello(stream: &mut TcpStream, hello: &Hello) -> Result<(), NetworkError> {
    let bytes = bincode::serialize(hello)?;
    write_raw_frame(stream, &bytes).await
}

async fn read_hello(stream: &mut TcpStream) -> Result<Hello, NetworkError> {
    let bytes = read_raw_frame(stream).await?;
    Ok(bincode::deserialize(&bytes)?)
}

async fn write_frame(
    stream: &mut TcpStream,
    sender: &mut SessionSender,
    frame: &Frame,
) -> Result<(), NetworkError> {
    let plaintext = bincode::serialize(frame)?;
    let ciphertext = sender.seal(&plaintext)?;
    write_raw_frame(stream, &ciphertext).await
}

async fn read_frame(
    stream: &mut TcpStream,
    receiver: &mut SessionReceiver,
) -> Result<Frame, NetworkError> {
    let ciphertext = read_raw_frame(stream).await?;
    let plaintext = receiver.open(&ciphertext)?;
    Ok(bincode::deserialize(&plaintext)?)
}

/// The active side of a push (initiator role).
///
/// Connects to `host:port`, exchanges head maps, sends every event the
/// target is missing, and appends a freshly signed "push event" recording
/// the gossip before disconnecting.
pub async fn push(
    host: &str,
    port: u16,
    self_id: PeerId,
    engine: &EngineHandle,
    now: Timestamp,
) -> Result<(), NetworkError> {
    let mut stream = TcpStream::connect((host, port)).await?;

    let mut rng = rand::thread_rng();
    let agreement = EphemeralKeyAgreement::generate(&mut rng);
    write_hello(
        &mut stream,
        &Hello {
            verify_key: self_id.0,
            ephemeral_pk: agreement.public_bytes(),
        },
    )
    .await?;
    let peer_hello = read_hello(&mut stream).await?;
    let peer_id = PeerId(peer_hello.verify_key);
    let mut session = agreement.derive_session(peer_hello.ephemeral_pk, true);

    let own_heads = engine.heads_map().await;
    write_frame(&mut stream, &mut session.sender, &Frame::Heads(own_heads)).await?;

    let peer_heads = match read_frame(&mut stream, &mut session.receiver).await? {
        Frame::Heads(heads) => heads,
        _ => {
            return Err(NetworkError::HandshakeFailed(
                "expected HEADS reply from push target".into(),
            ))
        }
    };
    if let Frame::Request(missing_heads) = read_frame(&mut stream, &mut session.receiver).await? {
        debug!(count = missing_heads.len(), %peer_id, "peer requested specific heads");
    }

    let mut batch = engine.missing_for_peer(peer_heads.clone()).await;

    let other_parent = peer_heads.get(&peer_id).map(|(head, _)| head.clone());
    if let Some(other_parent) = other_parent {
        if let Ok(push_event) = engine
            .new_event(Vec::new(), PushKind::Regular(other_parent), now)
            .await
        {
            if let Some(event) = engine.get_event(push_event).await {
                batch.push(event);
            }
        }
    }

    write_frame(&mut stream, &mut session.sender, &Frame::Events(batch)).await?;
    let _ = write_frame(&mut stream, &mut session.sender, &Frame::Bye).await;
    Ok(())
}

/// The passive side of a push (responder role), run once per accepted
/// connection.
pub async fn serve_one(
    mut stream: TcpStream,
    self_id: PeerId,
    engine: &EngineHandle,
) -> Result<(), NetworkError> {
    let peer_hello = read_hello(&mut stream).await?;
    let peer_id = PeerId(peer_hello.verify_key);

    let mut rng = rand::thread_rng();
    let agreement = EphemeralKeyAgreement::generate(&mut rng);
    write_hello(
        &mut stream,
        &Hello {
            verify_key: self_id.0,
            ephemeral_pk: agreement.public_bytes(),
        },
    )
    .await?;
    let mut session = agreement.derive_session(peer_hello.ephemeral_pk, false);

    let sender_heads = match read_frame(&mut stream, &mut session.receiver).await? {
        Frame::Heads(heads) => heads,
        _ => {
            return Err(NetworkError::HandshakeFailed(
                "expected HEADS from push initiator".into(),
            ))
        }
    };

    let own_heads = engine.heads_map().await;
    write_frame(&mut stream, &mut session.sender, &Frame::Heads(own_heads.clone())).await?;

    let missing_heads: HashSet<Hash> = sender_heads
        .iter()
        .filter(|(author, (_, height))| {
            own_heads.get(*author).map(|(_, h)| h < height).unwrap_or(true)
        })
        .map(|(_, (head, _))| head.clone())
        .collect();
    write_frame(&mut stream, &mut session.sender, &Frame::Request(missing_heads)).await?;

    match read_frame(&mut stream, &mut session.receiver).await? {
        Frame::Events(events) => {
            let errors = engine.insert_batch(events).await;
            for (hash, error) in &errors {
                debug!(?hash, %error, %peer_id, "rejected event during push");
            }
        }
        Frame::Bye => {}
        _ => {
            return Err(NetworkError::HandshakeFailed(
                "expected EVENTS or BYE from push initiator".into(),
            ))
        }
    }

    let _ = write_frame(&mut stream, &mut session.sender, &Frame::Bye).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::datastructure::Graph;
    use crate::config::Config;
    use crate::crypto::SigningIdentity;
    use crate::node::Node;
    use tokio::net::TcpListener;

    async fn spawn_node(port: u16) -> (Node, crate::node::TransactionsApi, PeerId) {
        let mut rng = rand::thread_rng();
        let identity = SigningIdentity::generate(&mut rng);
        let self_id = identity.verifying_key();
        let mut config = Config::default();
        config.listen_port = port;
        let graph = Graph::new(identity, config.stake_default, config.coin_round_modulus, 0).unwrap();
        let (mut node, api) = Node::from_graph(config, graph, None);
        node.run().await.unwrap();
        (node, api, self_id)
    }

    #[tokio::test]
    async fn push_replicates_genesis_to_an_empty_peer() {
        let (node_a, _api_a, id_a) = spawn_node(17401).await;
        let (node_b, _api_b, _id_b) = spawn_node(17402).await;

        push("127.0.0.1", 17402, id_a, node_a.engine(), 1).await.unwrap();

        let heads_b = node_b.engine().heads_map().await;
        assert!(heads_b.contains_key(&id_a));

        node_a.shutdown().await;
        node_b.shutdown().await;
    }

    /// A push carries more than just a genesis head: drive two real nodes
    /// through a pair of pushes (B teaches A about its genesis, then A mints
    /// a non-genesis event and pushes it onward) and check B actually gains
    /// that event and advances its view of A's head past genesis.
    #[tokio::test]
    async fn push_replicates_a_non_genesis_event_to_a_peer() {
        let (node_a, _api_a, id_a) = spawn_node(17403).await;
        let (node_b, _api_b, id_b) = spawn_node(17404).await;

        // B -> A so A learns B's genesis and can cite it as other-parent.
        push("127.0.0.1", 17403, id_b, node_b.engine(), 1).await.unwrap();

        let heads_after_first = node_a.engine().heads_map().await;
        let (b_genesis, _) = heads_after_first
            .get(&id_b)
            .cloned()
            .expect("A should know B's genesis after the first push");

        let a_event = node_a
            .engine()
            .new_event(Vec::new(), PushKind::Regular(b_genesis), 2)
            .await
            .unwrap();

        // A -> B: this is the push that must carry A's non-genesis event.
        push("127.0.0.1", 17404, id_a, node_a.engine(), 3).await.unwrap();

        assert!(
            node_b.engine().has_event(a_event).await,
            "B should have received A's non-genesis event over the wire"
        );
        let heads_b = node_b.engine().heads_map().await;
        let (_, height_b_sees_a) = heads_b
            .get(&id_a)
            .expect("B should know about A after the push");
        assert!(
            *height_b_sees_a >= 1,
            "B's view of A's head should be past genesis"
        );

        node_a.shutdown().await;
        node_b.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&(MAX_FRAME_BYTES + 1).to_be_bytes()).await.unwrap();
        });
        let mut client = TcpStream::connect(addr).await.unwrap();
        let err = read_raw_frame(&mut client).await.unwrap_err();
        assert!(matches!(err, NetworkError::FrameTooLarge(_, _)));
        server.await.unwrap();
    }
}
