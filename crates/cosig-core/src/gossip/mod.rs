//! Gossip-driven collective signing round
//!
//! One [`CosigProtocol`] runs per participant. The root arms the round with
//! [`CosigProtocol::start`], then every instance runs its own
//! [`CosigProtocol::dispatch`] loop while the transport delivers inbound
//! messages through [`MessageHandler`].
//!
//! ## Round Overview
//!
//! 1. The root signs the proposal and, every gossip tick, sends its whole
//!    response map to a random subset of peers.
//! 2. A node receiving its first rumor adopts the round parameters, adds
//!    its own share and gossips further. Later rumors are only relayed when
//!    they taught the node something new.
//! 3. Once the root has collected `threshold` signers it publishes the
//!    collective signature and sends a signed `Shutdown` down the tree.
//! 4. Every node verifies the shutdown, forwards it to its children and
//!    stops.

pub mod messages;
mod registry;

pub use registry::{ProtocolConstructor, ProtocolRegistry, DEFAULT_PROTOCOL_NAME};

use crate::aggregate::{new_aggregator, ResponseAggregator};
use crate::crypto::bls::{g1_to_bytes, MESSAGE_DST, SHUTDOWN_DST};
use crate::crypto::{BlsSignature, KeyPair, Mask, Roster};
use crate::error::IntegrityError;
use crate::net::{async_trait, MessageHandler, Transport, Tree};
use crate::types::{Parameters, DEFAULT_TIMEOUT, MIN_TIMEOUT, START_TIMEOUT};
use crate::{Error, NodeIndex, Result};
use messages::{ProtocolMessage, Response, Rumor, Shutdown};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Decides whether this node agrees to sign `(msg, data)`
pub type VerificationFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Lifecycle of a protocol instance
///
/// Root: `Created -> Armed -> Gossiping -> Finalizing -> ShuttingDown -> Done`.
/// Other nodes: `Created -> Gossiping -> ShuttingDown -> Done`. Any state
/// may jump to `Done` on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Armed,
    Gossiping,
    Finalizing,
    ShuttingDown,
    Done,
}

/// Everything the surrounding node hands to a protocol instance
#[derive(Clone)]
pub struct NodeContext {
    /// Our position in the roster
    pub index: NodeIndex,
    pub keypair: Arc<KeyPair>,
    pub roster: Arc<Roster>,
    /// Overlay used for the shutdown fan-out
    pub tree: Arc<Tree>,
    pub transport: Arc<dyn Transport>,
}

/// Round data, fixed once the node has joined
struct Session {
    params: Parameters,
    msg: Vec<u8>,
    data: Vec<u8>,
    responses: Arc<dyn ResponseAggregator>,
}

impl Session {
    fn new(params: Parameters, msg: Vec<u8>, data: Vec<u8>, roster: &Arc<Roster>) -> Result<Self> {
        let responses = new_aggregator(params.tree_mode, roster.clone())?;
        Ok(Self {
            params,
            msg,
            data,
            responses,
        })
    }

    fn rumor(&self) -> ProtocolMessage {
        ProtocolMessage::Rumor(Rumor {
            params: self.params.clone(),
            response_map: self.responses.map(),
            msg: self.msg.clone(),
            data: self.data.clone(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-node instance of the gossip collective signing protocol
pub struct CosigProtocol {
    index: NodeIndex,
    keypair: Arc<KeyPair>,
    roster: Arc<Roster>,
    tree: Arc<Tree>,
    transport: Arc<dyn Transport>,

    verification_fn: Option<VerificationFn>,
    msg: Option<Vec<u8>>,
    data: Vec<u8>,
    timeout: Duration,
    params: Parameters,
    rng: Mutex<ChaCha20Rng>,

    state: Mutex<State>,
    start: Notify,
    stop: watch::Sender<bool>,
    final_tx: Mutex<Option<oneshot::Sender<BlsSignature>>>,
    final_rx: Mutex<Option<oneshot::Receiver<BlsSignature>>>,
    session: Mutex<Option<Arc<Session>>>,
}

impl CosigProtocol {
    /// Bind a new instance to one participant
    ///
    /// Fails when the key pair is not the roster entry at `ctx.index`, or
    /// when the tree does not span the roster.
    pub fn new(ctx: NodeContext, verification_fn: Option<VerificationFn>) -> Result<Self> {
        let NodeContext {
            index,
            keypair,
            roster,
            tree,
            transport,
        } = ctx;

        if *roster.public(index)? != keypair.public() {
            let detail = match roster.index_of(&keypair.public()) {
                Some(owner) => format!("key pair belongs to roster entry {}, not {}", owner, index),
                None => format!("key pair of node {} is not in the roster", index),
            };
            return Err(Error::InvalidConfig(detail));
        }
        if tree.size() != roster.len() {
            return Err(Error::InvalidConfig(format!(
                "tree of {} nodes over a roster of {}",
                tree.size(),
                roster.len()
            )));
        }

        let (final_tx, final_rx) = oneshot::channel();
        let (stop, _) = watch::channel(false);
        let params = Parameters::default_for(roster.len());

        Ok(Self {
            index,
            keypair,
            roster,
            tree,
            transport,
            verification_fn,
            msg: None,
            data: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            params,
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
            state: Mutex::new(State::Created),
            start: Notify::new(),
            stop,
            final_tx: Mutex::new(Some(final_tx)),
            final_rx: Mutex::new(Some(final_rx)),
            session: Mutex::new(None),
        })
    }

    /// Proposal to co-sign. Required on the root; on other nodes it pins
    /// the proposal they accept to join.
    pub fn set_message(&mut self, msg: impl Into<Vec<u8>>) {
        self.msg = Some(msg.into());
    }

    /// Extra data handed to the verification function
    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) {
        self.data = data.into();
    }

    pub fn set_verification_fn(&mut self, verification_fn: VerificationFn) {
        self.verification_fn = Some(verification_fn);
    }

    /// Hard deadline of the round, counted from [`dispatch`](Self::dispatch)
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Round parameters, only meaningful on the root
    pub fn set_parameters(&mut self, params: Parameters) {
        self.params = params;
    }

    pub fn set_threshold(&mut self, threshold: usize) {
        self.params.threshold = threshold;
    }

    /// Reseed the peer selection
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = Mutex::new(ChaCha20Rng::seed_from_u64(seed));
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn is_root(&self) -> bool {
        self.tree.is_root(self.index)
    }

    pub fn state(&self) -> State {
        *lock(&self.state)
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Channel yielding the collective signature on the root
    ///
    /// The receiver can only be taken once. It errors if the round ends
    /// without a signature.
    pub fn final_signature(&self) -> Option<oneshot::Receiver<BlsSignature>> {
        lock(&self.final_rx).take()
    }

    /// Arm the round on the root
    #[instrument(skip(self), fields(node = self.index))]
    pub fn start(&self) -> Result<()> {
        if !self.is_root() {
            return Err(Error::NotRoot);
        }
        self.check_integrity()?;
        if self.is_stopped() {
            return Err(Error::NotStarted);
        }
        if !self.transition(&[State::Created], State::Armed) {
            return Err(Error::Internal("protocol already started".into()));
        }

        info!(
            threshold = self.params.threshold,
            nodes = self.roster.len(),
            "Starting collective signing round"
        );
        self.start.notify_one();
        Ok(())
    }

    /// Run the instance until the round ends or its deadline expires
    #[instrument(skip(self), fields(node = self.index, root = self.is_root()))]
    pub async fn dispatch(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        if self.is_root() {
            self.dispatch_root(deadline).await
        } else {
            tokio::select! {
                _ = self.stopped() => Ok(()),
                _ = sleep_until(deadline) => {
                    warn!("No shutdown received before the deadline");
                    self.shutdown();
                    Err(Error::Timeout)
                }
            }
        }
    }

    async fn dispatch_root(&self, deadline: Instant) -> Result<()> {
        tokio::select! {
            _ = self.start.notified() => {}
            _ = self.stopped() => return Err(Error::NotStarted),
            _ = sleep(START_TIMEOUT) => {
                warn!("Start signal never arrived");
                self.shutdown();
                return Err(Error::StartTimeout);
            }
        }

        let session = self.open_session()?;
        let mut ticker = interval(session.params.gossip_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.try_finalize(&session).await? {
                        return Ok(());
                    }
                    self.send_rumors(&session).await;
                }
                _ = self.stopped() => return Ok(()),
                _ = sleep_until(deadline) => {
                    warn!(
                        collected = session.responses.count(),
                        threshold = session.params.threshold,
                        "Threshold not reached before the deadline"
                    );
                    self.shutdown();
                    return Err(Error::GossipTimeout);
                }
            }
        }
    }

    /// Root side: build the session from our own configuration
    fn open_session(&self) -> Result<Arc<Session>> {
        let msg = self.msg.clone().ok_or(IntegrityError::MissingMessage)?;
        let session = Arc::new(Session::new(
            self.params.clone(),
            msg,
            self.data.clone(),
            &self.roster,
        )?);
        self.try_sign(&session)?;

        let mut slot = lock(&self.session);
        if self.is_stopped() || !self.transition(&[State::Armed], State::Gossiping) {
            return Err(Error::NotStarted);
        }
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Other nodes: adopt the round described by the first rumor
    ///
    /// The flag is `true` when this call created the session.
    fn join_round(&self, rumor: &Rumor) -> Result<Option<(Arc<Session>, bool)>> {
        let mut slot = lock(&self.session);
        if let Some(session) = slot.as_ref() {
            return Ok(Some((session.clone(), false)));
        }
        if self.is_stopped() {
            return Ok(None);
        }
        if self.msg.as_ref().is_some_and(|msg| *msg != rumor.msg) {
            return Err(Error::InvalidResponse(
                "rumor carries a different proposal".into(),
            ));
        }

        let session = Arc::new(Session::new(
            rumor.params.clone(),
            rumor.msg.clone(),
            rumor.data.clone(),
            &self.roster,
        )?);
        self.try_sign(&session)?;
        *slot = Some(session.clone());
        drop(slot);

        self.transition(&[State::Created], State::Gossiping);
        debug!(
            node = self.index,
            threshold = session.params.threshold,
            tree_mode = session.params.tree_mode,
            "Joined round"
        );
        Ok(Some((session, true)))
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    #[instrument(skip(self, rumor), fields(node = self.index))]
    async fn handle_rumor(&self, from: NodeIndex, rumor: Rumor) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let (session, joined) = match self.current_session() {
            Some(session) => (session, false),
            None if self.is_root() => {
                debug!("Ignoring rumor received before the round started");
                return Ok(());
            }
            None => match self.join_round(&rumor)? {
                Some(joined) => joined,
                None => return Ok(()),
            },
        };
        if session.msg != rumor.msg {
            return Err(Error::InvalidResponse(
                "rumor carries a different proposal".into(),
            ));
        }

        let before = session.responses.count();
        let merged = session.responses.update(&rumor.response_map);
        let after = session.responses.count();
        debug!(before, after, joined, "Merged rumor");

        // our own share is news to everyone else, even if the rumor was not
        if self.is_root() {
            self.try_finalize(&session).await?;
        } else if joined || after > before {
            self.send_rumors(&session).await;
        }
        merged
    }

    #[instrument(skip(self, shutdown), fields(node = self.index))]
    async fn handle_shutdown(&self, from: NodeIndex, shutdown: Shutdown) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        if let Err(e) = self.verify_shutdown(&shutdown) {
            warn!(error = %e, "Rejected shutdown");
            return Err(Error::ShutdownVerification(Box::new(e)));
        }
        if !self.transition(
            &[State::Created, State::Armed, State::Gossiping],
            State::ShuttingDown,
        ) {
            return Ok(());
        }

        self.forward_shutdown(&ProtocolMessage::Shutdown(shutdown))
            .await;
        self.shutdown();
        Ok(())
    }

    /// Root: finalize once the threshold is reached
    ///
    /// Returns `true` when this call finalized the round.
    async fn try_finalize(&self, session: &Session) -> Result<bool> {
        let count = session.responses.count();
        if count < session.params.threshold {
            return Ok(false);
        }
        if !self.transition(&[State::Gossiping], State::Finalizing) {
            return Ok(false);
        }

        let shutdown = match self.seal(session) {
            Ok(shutdown) => shutdown,
            Err(e) => {
                error!(node = self.index, error = %e, "Failed to finalize");
                self.shutdown();
                return Err(e);
            }
        };
        info!(
            node = self.index,
            signers = count,
            "Collective signature finalized"
        );

        let final_tx = lock(&self.final_tx).take();
        if let Some(final_tx) = final_tx {
            let _ = final_tx.send(shutdown.final_co_signature.clone());
        }

        self.transition(&[State::Finalizing], State::ShuttingDown);
        self.forward_shutdown(&ProtocolMessage::Shutdown(shutdown))
            .await;
        self.shutdown();
        Ok(true)
    }

    /// Aggregate the collected responses and sign the result
    fn seal(&self, session: &Session) -> Result<Shutdown> {
        let (point, mask) = session.responses.aggregate()?;
        let final_co_signature = BlsSignature::new(&g1_to_bytes(&point)?, &mask);
        let root_sig = self
            .keypair
            .sign(SHUTDOWN_DST, final_co_signature.as_bytes())?;
        Ok(Shutdown {
            final_co_signature,
            root_sig,
        })
    }

    /// Check the collective signature and the root's proof over it
    pub fn verify_shutdown(&self, shutdown: &Shutdown) -> Result<()> {
        let msg = self
            .current_session()
            .map(|session| session.msg.clone())
            .or_else(|| self.msg.clone())
            .ok_or(IntegrityError::MissingMessage)?;

        shutdown
            .final_co_signature
            .verify_aggregate(&msg, &self.roster)?;
        self.roster.public(self.tree.root())?.verify(
            SHUTDOWN_DST,
            shutdown.final_co_signature.as_bytes(),
            &shutdown.root_sig,
        )
    }

    async fn forward_shutdown(&self, shutdown: &ProtocolMessage) {
        let children = self.tree.children(self.index);
        if children.is_empty() {
            return;
        }
        let failures = self
            .transport
            .send_to_many(self.index, children, shutdown)
            .await;
        if !failures.is_empty() {
            let failed: Vec<String> = failures
                .iter()
                .map(|(child, e)| format!("{}: {}", child, e))
                .collect();
            error!(
                node = self.index,
                failed = ?failed,
                "Shutdown not delivered to every child"
            );
        }
    }

    async fn send_rumors(&self, session: &Session) {
        let peers = match self.random_peers(session.params.rumor_peers) {
            Ok(peers) => peers,
            Err(e) => {
                warn!(node = self.index, error = %e, "Cannot pick gossip targets");
                return;
            }
        };
        let rumor = session.rumor();
        for (peer, e) in self.transport.send_to_many(self.index, &peers, &rumor).await {
            debug!(node = self.index, peer, error = %e, "Rumor not delivered");
        }
    }

    /// Add our own share unless the verification function refuses
    fn try_sign(&self, session: &Session) -> Result<()> {
        let willing = self
            .verification_fn
            .as_ref()
            .is_some_and(|verify| verify(&session.msg, &session.data));
        if !willing {
            info!(node = self.index, "Refusing to sign the proposal");
            return Ok(());
        }

        let signature = self.keypair.sign(MESSAGE_DST, &session.msg)?;
        let mask = Mask::single(self.roster.len(), self.index)?;
        session.responses.add(
            self.index,
            &Response {
                signature,
                mask: mask.as_bytes().to_vec(),
            },
        )
    }

    /// Pick `k` distinct peers other than ourselves
    ///
    /// A roster of one targets the node itself.
    pub fn random_peers(&self, k: usize) -> Result<Vec<NodeIndex>> {
        let n = self.roster.len();
        if n == 1 {
            return Ok(vec![self.index]);
        }

        let mut pool: Vec<NodeIndex> = (0..n).filter(|idx| *idx != self.index).collect();
        if k > pool.len() {
            return Err(Error::NotEnoughPeers {
                requested: k,
                available: pool.len(),
            });
        }
        pool.shuffle(&mut *lock(&self.rng));
        pool.truncate(k);
        Ok(pool)
    }

    /// Reject configurations the round cannot complete with
    pub fn check_integrity(&self) -> Result<()> {
        if self.msg.is_none() {
            return Err(IntegrityError::MissingMessage.into());
        }
        if self.verification_fn.is_none() {
            return Err(IntegrityError::MissingVerificationFn.into());
        }
        if self.timeout < MIN_TIMEOUT {
            return Err(IntegrityError::UnrealisticTimeout(self.timeout).into());
        }
        let threshold = self.params.threshold;
        if threshold > self.tree.size() {
            return Err(IntegrityError::ThresholdTooLarge {
                threshold,
                nodes: self.tree.size(),
            }
            .into());
        }
        if threshold < 1 {
            return Err(IntegrityError::ThresholdTooSmall(threshold).into());
        }
        Ok(())
    }

    /// Whether `failures` nodes refusing makes the threshold unreachable
    pub fn check_failure_threshold(&self, failures: usize) -> bool {
        failures > self.roster.len().saturating_sub(self.params.threshold)
    }

    /// Tear the instance down; later calls are no-ops
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if *state == State::Done {
                return;
            }
            *state = State::Done;
        }
        self.stop.send_replace(true);
        lock(&self.final_tx).take();
        lock(&self.session).take();
        debug!(node = self.index, "Protocol instance done");
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    async fn stopped(&self) {
        let mut stop = self.stop.subscribe();
        while !*stop.borrow_and_update() {
            if stop.changed().await.is_err() {
                return;
            }
        }
    }

    fn transition(&self, from: &[State], to: State) -> bool {
        let mut state = lock(&self.state);
        if from.contains(&*state) {
            *state = to;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl MessageHandler for CosigProtocol {
    async fn handle_message(&self, from: NodeIndex, message: ProtocolMessage) -> Result<()> {
        match message {
            ProtocolMessage::Rumor(rumor) => self.handle_rumor(from, rumor).await,
            ProtocolMessage::Shutdown(shutdown) => self.handle_shutdown(from, shutdown).await,
            other => {
                debug!(node = self.index, from, kind = ?other.kind(), "Ignoring message");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::bls::PublicKey;
    use crate::crypto::ThresholdPolicy;
    use crate::gossip::messages::MessageKind;
    use crate::net::MemoryNetwork;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const MSG: &[u8] = b"hello";

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    struct Cluster {
        network: Arc<MemoryNetwork>,
        keypairs: Vec<Arc<KeyPair>>,
        roster: Arc<Roster>,
        nodes: Vec<Arc<CosigProtocol>>,
    }

    impl Cluster {
        /// `n` nodes in a binary tree rooted at 0, the first `willing` agree to sign
        fn new(n: usize, willing: usize, tree_mode: bool, round_timeout: Duration) -> Self {
            let signers: Vec<usize> = (0..willing).collect();
            Self::with_signers(n, &signers, tree_mode, round_timeout)
        }

        /// Same layout, only the nodes listed in `signers` agree to sign
        fn with_signers(
            n: usize,
            signers: &[usize],
            tree_mode: bool,
            round_timeout: Duration,
        ) -> Self {
            init_tracing();
            let mut rng = ChaCha20Rng::seed_from_u64(42);
            let keypairs: Vec<Arc<KeyPair>> = (0..n)
                .map(|_| Arc::new(KeyPair::generate(&mut rng)))
                .collect();
            let publics: Vec<PublicKey> = keypairs.iter().map(|k| k.public()).collect();
            let roster = Arc::new(Roster::new(publics).unwrap());
            let tree = Arc::new(Tree::new(n, 0, 2).unwrap());
            let network = Arc::new(MemoryNetwork::new());

            let mut params = Parameters::default_for(n);
            params.tree_mode = tree_mode;
            params.gossip_tick = Duration::from_millis(20);

            let nodes = (0..n)
                .map(|index| {
                    let ctx = NodeContext {
                        index,
                        keypair: keypairs[index].clone(),
                        roster: roster.clone(),
                        tree: tree.clone(),
                        transport: network.clone(),
                    };
                    let willing = signers.contains(&index);
                    let vf: VerificationFn =
                        Arc::new(move |msg: &[u8], _: &[u8]| willing && msg == MSG);
                    let mut node = CosigProtocol::new(ctx, Some(vf)).unwrap();
                    node.set_message(MSG);
                    node.set_parameters(params.clone());
                    node.set_timeout(round_timeout);
                    node.set_seed(index as u64);
                    let node = Arc::new(node);
                    network.register(index, &node);
                    node
                })
                .collect();

            Self {
                network,
                keypairs,
                roster,
                nodes,
            }
        }

        fn root(&self) -> &Arc<CosigProtocol> {
            &self.nodes[0]
        }

        fn spawn_dispatch(&self) -> Vec<JoinHandle<Result<()>>> {
            self.nodes
                .iter()
                .map(|node| {
                    let node = node.clone();
                    tokio::spawn(async move { node.dispatch().await })
                })
                .collect()
        }

        /// Collective signature over MSG by `signers`, correctly sealed by the root
        fn sealed(&self, signers: &[usize]) -> Shutdown {
            let responses = new_aggregator(true, self.roster.clone()).unwrap();
            for idx in signers {
                let response = Response {
                    signature: self.keypairs[*idx].sign(MESSAGE_DST, MSG).unwrap(),
                    mask: Mask::single(self.roster.len(), *idx)
                        .unwrap()
                        .as_bytes()
                        .to_vec(),
                };
                responses.add(*idx, &response).unwrap();
            }
            let (point, mask) = responses.aggregate().unwrap();
            let final_co_signature = BlsSignature::new(&g1_to_bytes(&point).unwrap(), &mask);
            let root_sig = self.keypairs[0]
                .sign(SHUTDOWN_DST, final_co_signature.as_bytes())
                .unwrap();
            Shutdown {
                final_co_signature,
                root_sig,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_round_completes_when_everyone_signs() {
        for tree_mode in [true, false] {
            let cluster = Cluster::new(4, 4, tree_mode, DEFAULT_TIMEOUT);
            let final_rx = cluster.root().final_signature().unwrap();
            let handles = cluster.spawn_dispatch();
            cluster.root().start().unwrap();

            let signature = timeout(DEFAULT_TIMEOUT, final_rx)
                .await
                .unwrap()
                .unwrap();
            signature
                .verify_aggregate_with_policy(MSG, &cluster.roster, &ThresholdPolicy::default_for(4))
                .unwrap();
            assert!(signature.mask(&cluster.roster).unwrap().count_enabled() >= 3);

            for handle in handles {
                handle.await.unwrap().unwrap();
            }
            for node in &cluster.nodes {
                assert_eq!(node.state(), State::Done);
            }
            assert!(cluster.network.sent_by(0, MessageKind::Shutdown) >= 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_round_times_out_without_enough_signers() {
        let cluster = Cluster::new(4, 2, true, Duration::from_millis(300));
        let final_rx = cluster.root().final_signature().unwrap();
        let handles = cluster.spawn_dispatch();
        cluster.root().start().unwrap();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert!(matches!(results[0], Err(Error::GossipTimeout)));
        for result in &results[1..] {
            assert!(matches!(result, Err(Error::Timeout)));
        }
        assert!(final_rx.await.is_err());
        assert_eq!(cluster.network.sent_by(0, MessageKind::Shutdown), 0);
    }

    #[tokio::test]
    async fn test_single_node_round() {
        let cluster = Cluster::new(1, 1, true, DEFAULT_TIMEOUT);
        let root = cluster.root();
        assert_eq!(root.random_peers(1).unwrap(), vec![0]);

        let final_rx = root.final_signature().unwrap();
        let handles = cluster.spawn_dispatch();
        root.start().unwrap();

        let signature = timeout(DEFAULT_TIMEOUT, final_rx).await.unwrap().unwrap();
        signature.verify_aggregate(MSG, &cluster.roster).unwrap();
        assert_eq!(signature.mask(&cluster.roster).unwrap().count_enabled(), 1);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_random_peers() {
        let cluster = Cluster::new(4, 4, true, DEFAULT_TIMEOUT);
        let node = &cluster.nodes[2];

        let mut peers = node.random_peers(3).unwrap();
        peers.sort_unstable();
        assert_eq!(peers, vec![0, 1, 3]);
        assert_eq!(node.random_peers(2).unwrap().len(), 2);

        let err = node.random_peers(4).unwrap_err();
        assert!(matches!(
            err,
            Error::NotEnoughPeers {
                requested: 4,
                available: 3
            }
        ));
        assert!(err.to_string().contains("not enough nodes in the roster"));
    }

    #[tokio::test]
    async fn test_check_integrity() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let keypair = Arc::new(KeyPair::generate(&mut rng));
        let roster = Arc::new(Roster::new(vec![keypair.public()]).unwrap());
        let ctx = NodeContext {
            index: 0,
            keypair,
            roster,
            tree: Arc::new(Tree::new(1, 0, 2).unwrap()),
            transport: Arc::new(MemoryNetwork::new()),
        };
        let vf: VerificationFn = Arc::new(|_: &[u8], _: &[u8]| true);

        let mut node = CosigProtocol::new(ctx.clone(), Some(vf.clone())).unwrap();
        assert!(matches!(
            node.check_integrity(),
            Err(Error::Integrity(IntegrityError::MissingMessage))
        ));
        node.set_message(MSG);
        node.check_integrity().unwrap();

        node.set_timeout(Duration::from_micros(100));
        assert!(matches!(
            node.check_integrity(),
            Err(Error::Integrity(IntegrityError::UnrealisticTimeout(_)))
        ));
        node.set_timeout(DEFAULT_TIMEOUT);

        node.set_threshold(0);
        assert!(matches!(
            node.check_integrity(),
            Err(Error::Integrity(IntegrityError::ThresholdTooSmall(0)))
        ));
        node.set_threshold(2);
        assert!(matches!(
            node.check_integrity(),
            Err(Error::Integrity(IntegrityError::ThresholdTooLarge {
                threshold: 2,
                nodes: 1
            }))
        ));

        let mut unverified = CosigProtocol::new(ctx, None).unwrap();
        unverified.set_message(MSG);
        assert!(matches!(
            unverified.check_integrity(),
            Err(Error::Integrity(IntegrityError::MissingVerificationFn))
        ));
        // failed integrity leaves the instance untouched
        assert!(unverified.start().is_err());
        assert_eq!(unverified.state(), State::Created);
    }

    #[tokio::test]
    async fn test_forged_shutdown_is_not_forwarded() {
        let cluster = Cluster::new(4, 4, true, DEFAULT_TIMEOUT);
        // node 1 has node 3 as its only child
        let node = &cluster.nodes[1];

        let mut forged = cluster.sealed(&[0, 1, 2, 3]);
        forged.root_sig = vec![0x5A; 48];
        let err = node
            .handle_message(0, ProtocolMessage::Shutdown(forged))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShutdownVerification(_)));

        let too_few = cluster.sealed(&[0, 1]);
        let err = node
            .handle_message(0, ProtocolMessage::Shutdown(too_few))
            .await
            .unwrap_err();
        match err {
            Error::ShutdownVerification(cause) => {
                assert!(matches!(*cause, Error::PolicyNotSatisfied { enabled: 2 }))
            }
            other => panic!("unexpected error: {}", other),
        }

        assert_eq!(cluster.network.sent_by(1, MessageKind::Shutdown), 0);
        assert_ne!(node.state(), State::Done);

        let valid = cluster.sealed(&[0, 1, 3]);
        node.handle_message(0, ProtocolMessage::Shutdown(valid))
            .await
            .unwrap();
        assert_eq!(cluster.network.sent_by(1, MessageKind::Shutdown), 1);
        assert_eq!(node.state(), State::Done);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_fan_out_survives_unreachable_child() {
        // node 6 is a child of node 2, next to node 5
        let cluster = Cluster::new(7, 7, true, Duration::from_millis(1500));
        cluster.network.disconnect(6);

        let final_rx = cluster.root().final_signature().unwrap();
        let handles = cluster.spawn_dispatch();
        cluster.root().start().unwrap();

        let signature = timeout(DEFAULT_TIMEOUT, final_rx).await.unwrap().unwrap();
        signature.verify_aggregate(MSG, &cluster.roster).unwrap();
        assert!(!signature.mask(&cluster.roster).unwrap().is_enabled(6));

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        for (index, result) in results[..6].iter().enumerate() {
            assert!(result.is_ok(), "node {} failed: {:?}", index, result);
        }
        assert!(matches!(results[6], Err(Error::Timeout)));
        assert_eq!(cluster.network.sent_by(2, MessageKind::Shutdown), 1);
        assert_eq!(cluster.nodes[5].state(), State::Done);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_round_completes_when_root_refuses() {
        for tree_mode in [true, false] {
            let cluster = Cluster::with_signers(4, &[1, 2, 3], tree_mode, DEFAULT_TIMEOUT);
            let final_rx = cluster.root().final_signature().unwrap();
            let handles = cluster.spawn_dispatch();
            cluster.root().start().unwrap();

            let signature = timeout(DEFAULT_TIMEOUT, final_rx)
                .await
                .unwrap()
                .unwrap();
            signature.verify_aggregate(MSG, &cluster.roster).unwrap();
            let mask = signature.mask(&cluster.roster).unwrap();
            assert_eq!(mask.enabled_indices().collect::<Vec<_>>(), vec![1, 2, 3]);

            for handle in handles {
                handle.await.unwrap().unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_rumor_for_another_proposal_is_rejected() {
        let cluster = Cluster::new(4, 4, true, DEFAULT_TIMEOUT);
        let rumor = Rumor {
            params: Parameters::default_for(4),
            response_map: Default::default(),
            msg: b"something else".to_vec(),
            data: Vec::new(),
        };
        assert!(cluster.nodes[1]
            .handle_message(0, ProtocolMessage::Rumor(rumor))
            .await
            .is_err());
        assert_eq!(cluster.nodes[1].state(), State::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout() {
        let cluster = Cluster::new(4, 4, true, DEFAULT_TIMEOUT);
        let root = cluster.root().clone();
        let result = root.dispatch().await;
        assert!(matches!(result, Err(Error::StartTimeout)));
        assert_eq!(root.state(), State::Done);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let cluster = Cluster::new(4, 4, true, DEFAULT_TIMEOUT);
        let root = cluster.root();
        let final_rx = root.final_signature().unwrap();
        assert!(root.final_signature().is_none());

        root.shutdown();
        root.shutdown();
        assert_eq!(root.state(), State::Done);
        assert!(final_rx.await.is_err());
        assert!(matches!(root.start(), Err(Error::NotStarted)));
        assert!(matches!(root.dispatch().await, Err(Error::NotStarted)));
    }

    #[tokio::test]
    async fn test_start_is_reserved_to_the_root() {
        let cluster = Cluster::new(4, 4, true, DEFAULT_TIMEOUT);
        assert!(matches!(cluster.nodes[2].start(), Err(Error::NotRoot)));
    }

    #[tokio::test]
    async fn test_failure_threshold() {
        let cluster = Cluster::new(4, 4, true, DEFAULT_TIMEOUT);
        assert!(!cluster.root().check_failure_threshold(1));
        assert!(cluster.root().check_failure_threshold(2));
    }

    #[test]
    fn test_rejects_foreign_keypair() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let keypairs: Vec<KeyPair> = (0..2).map(|_| KeyPair::generate(&mut rng)).collect();
        let roster = Arc::new(Roster::new(keypairs.iter().map(|k| k.public()).collect()).unwrap());
        let ctx = NodeContext {
            index: 0,
            keypair: Arc::new(keypairs[1].clone()),
            roster,
            tree: Arc::new(Tree::new(2, 0, 2).unwrap()),
            transport: Arc::new(MemoryNetwork::new()),
        };
        match CosigProtocol::new(ctx, None) {
            Err(Error::InvalidConfig(detail)) => {
                assert!(detail.contains("belongs to roster entry 1"))
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("foreign key pair accepted"),
        }
    }
}
