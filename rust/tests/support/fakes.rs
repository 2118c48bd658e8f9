// In-memory stand-ins for the wallet, the messaging network and the ownership API.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::BoxStream;
use futures::StreamExt;
use tokentalk_core::{
    now_millis, Address, AssetInfo, AssetType, ChainConfig, ConversationContext,
    ConversationHandle, ConversationStream, MessageStream, MessagingClient, MessagingConnector,
    MessagingError, Message, OwnershipApi, OwnershipError, SharedConversation,
    SharedMessagingClient, SharedWalletProvider, WalletError, WalletProvider,
};

pub fn addr(n: u32) -> Address {
    Address::new(format!("0x{n:040x}"))
}

// ---------------------------------------------------------------------------
// Messaging network
// ---------------------------------------------------------------------------

type Listener = flume::Sender<Result<Message, MessagingError>>;

pub struct FakeConversation {
    topic: String,
    members: [Address; 2],
    context: Option<ConversationContext>,
    messages: Mutex<Vec<Message>>,
    listeners: Mutex<Vec<Listener>>,
}

impl FakeConversation {
    fn involves(&self, a: &Address, b: &Address) -> bool {
        (&self.members[0] == a && &self.members[1] == b) || (&self.members[0] == b && &self.members[1] == a)
    }

    fn conversation_id(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.conversation_id.as_str())
    }

    fn deliver(&self, message: &Message) {
        self.messages.lock().unwrap().push(message.clone());
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| l.send(Ok(message.clone())).is_ok());
    }

    fn open_listeners(&self) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .filter(|l| !l.is_disconnected())
            .count()
    }
}

#[derive(Default)]
pub struct FakeNetwork {
    conversations: Mutex<Vec<Arc<FakeConversation>>>,
    discovery: Mutex<Vec<(Address, flume::Sender<Result<SharedConversation, MessagingError>>)>>,
    unreachable: Mutex<HashSet<Address>>,
    reject_sends: AtomicBool,
    slow_rejections: AtomicUsize,
    server_skew_ms: Mutex<i64>,
    next_topic: AtomicUsize,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Authoritative timestamps are the local clock shifted by this much.
    pub fn set_server_skew_ms(&self, skew: i64) {
        *self.server_skew_ms.lock().unwrap() = skew;
    }

    pub fn set_reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    /// The next `n` sends fail, each only after a delay, so later sends finish first.
    pub fn reject_next_sends_slowly(&self, n: usize) {
        self.slow_rejections.store(n, Ordering::SeqCst);
    }

    fn take_slow_rejection(&self) -> bool {
        self.slow_rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn set_unreachable(&self, address: &Address) {
        self.unreachable.lock().unwrap().insert(address.clone());
    }

    fn server_now(&self) -> i64 {
        now_millis() + *self.server_skew_ms.lock().unwrap()
    }

    fn find(&self, a: &Address, b: &Address, conversation_id: Option<&str>) -> Option<Arc<FakeConversation>> {
        self.conversations
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.involves(a, b) && c.conversation_id() == conversation_id)
            .cloned()
    }

    /// Get or create; a newly created conversation is announced to `to`.
    fn get_or_create(
        self: &Arc<Self>,
        from: &Address,
        to: &Address,
        context: Option<ConversationContext>,
    ) -> Arc<FakeConversation> {
        let id = context.as_ref().map(|c| c.conversation_id.clone());
        if let Some(existing) = self.find(from, to, id.as_deref()) {
            return existing;
        }
        let conv = Arc::new(FakeConversation {
            topic: format!("/fake/{}", self.next_topic.fetch_add(1, Ordering::SeqCst)),
            members: [from.clone(), to.clone()],
            context,
            messages: Mutex::new(vec![]),
            listeners: Mutex::new(vec![]),
        });
        self.conversations.lock().unwrap().push(conv.clone());

        let handle: SharedConversation = Arc::new(FakeHandle {
            network: self.clone(),
            conv: conv.clone(),
            me: to.clone(),
        });
        self.discovery
            .lock()
            .unwrap()
            .retain(|(who, tx)| who != to || tx.send(Ok(handle.clone())).is_ok());
        conv
    }

    /// Remote user `from` opens a direct conversation with `to`.
    pub fn start_direct(self: &Arc<Self>, from: &Address, to: &Address) {
        self.get_or_create(from, to, None);
    }

    /// Remote user `from` opens a group conversation with `to`.
    pub fn start_group(self: &Arc<Self>, from: &Address, to: &Address, name: &str, members: &[Address]) {
        let mut members = members.to_vec();
        members.sort();
        self.get_or_create(
            from,
            to,
            Some(ConversationContext {
                conversation_id: format!("group:{name}"),
                group: Some(tokentalk_core::GroupMetadata {
                    name: name.to_string(),
                    members,
                }),
            }),
        );
    }

    /// Remote user `from` sends into their direct conversation with `to`.
    pub fn send_as(self: &Arc<Self>, from: &Address, to: &Address, content: &str) -> Message {
        self.send_in(from, to, None, content)
    }

    pub fn send_in(
        self: &Arc<Self>,
        from: &Address,
        to: &Address,
        conversation_id: Option<&str>,
        content: &str,
    ) -> Message {
        let conv = match self.find(from, to, conversation_id) {
            Some(c) => c,
            None => self.get_or_create(from, to, None),
        };
        let message = Message::new(from.clone(), content, self.server_now());
        conv.deliver(&message);
        message
    }

    /// Fail every live subscription on the conversation between `a` and `b`.
    pub fn break_streams(&self, a: &Address, b: &Address) {
        if let Some(conv) = self.find(a, b, None) {
            for l in conv.listeners.lock().unwrap().drain(..) {
                let _ = l.send(Err(MessagingError::Stream("connection reset".into())));
            }
        }
    }

    pub fn messages_between(&self, a: &Address, b: &Address) -> Vec<Message> {
        self.find(a, b, None)
            .map(|c| c.messages.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn open_message_streams(&self) -> usize {
        self.conversations
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.open_listeners())
            .sum()
    }

    pub fn open_discovery_streams(&self) -> usize {
        self.discovery
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, tx)| !tx.is_disconnected())
            .count()
    }
}

pub struct FakeHandle {
    network: Arc<FakeNetwork>,
    conv: Arc<FakeConversation>,
    me: Address,
}

#[async_trait::async_trait]
impl ConversationHandle for FakeHandle {
    fn peer_address(&self) -> Address {
        if self.conv.members[0] == self.me {
            self.conv.members[1].clone()
        } else {
            self.conv.members[0].clone()
        }
    }

    fn topic(&self) -> String {
        self.conv.topic.clone()
    }

    fn context(&self) -> Option<ConversationContext> {
        self.conv.context.clone()
    }

    async fn messages(&self) -> Result<Vec<Message>, MessagingError> {
        Ok(self.conv.messages.lock().unwrap().clone())
    }

    async fn stream_messages(&self) -> Result<MessageStream, MessagingError> {
        let (tx, rx) = flume::unbounded();
        self.conv.listeners.lock().unwrap().push(tx);
        Ok(rx.into_stream().boxed())
    }

    async fn send(&self, content: &str) -> Result<Message, MessagingError> {
        if self.network.reject_sends.load(Ordering::SeqCst) {
            return Err(MessagingError::SendRejected("rejected by network".into()));
        }
        if self.network.take_slow_rejection() {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            return Err(MessagingError::SendRejected("rejected by network".into()));
        }
        let message = Message::new(self.me.clone(), content, self.network.server_now());
        self.conv.deliver(&message);
        Ok(message)
    }
}

pub struct FakeClient {
    network: Arc<FakeNetwork>,
    me: Address,
}

#[async_trait::async_trait]
impl MessagingClient for FakeClient {
    async fn list_conversations(&self) -> Result<Vec<SharedConversation>, MessagingError> {
        let convs = self.network.conversations.lock().unwrap().clone();
        Ok(convs
            .into_iter()
            .filter(|c| c.members.contains(&self.me))
            .map(|conv| {
                Arc::new(FakeHandle {
                    network: self.network.clone(),
                    conv,
                    me: self.me.clone(),
                }) as SharedConversation
            })
            .collect())
    }

    async fn new_conversation(
        &self,
        peer: &Address,
        context: Option<ConversationContext>,
    ) -> Result<SharedConversation, MessagingError> {
        if self.network.unreachable.lock().unwrap().contains(peer) {
            return Err(MessagingError::PeerUnreachable(peer.clone()));
        }
        let conv = self.network.get_or_create(&self.me, peer, context);
        Ok(Arc::new(FakeHandle {
            network: self.network.clone(),
            conv,
            me: self.me.clone(),
        }))
    }

    async fn stream_conversations(&self) -> Result<ConversationStream, MessagingError> {
        let (tx, rx) = flume::unbounded();
        self.network
            .discovery
            .lock()
            .unwrap()
            .push((self.me.clone(), tx));
        Ok(rx.into_stream().boxed())
    }
}

pub struct FakeConnector {
    network: Arc<FakeNetwork>,
    pub clients_created: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeConnector {
    pub fn new(network: Arc<FakeNetwork>) -> Arc<Self> {
        Arc::new(Self {
            network,
            clients_created: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait::async_trait]
impl MessagingConnector for FakeConnector {
    async fn create_client(
        &self,
        account: &Address,
        _wallet: SharedWalletProvider,
    ) -> Result<SharedMessagingClient, MessagingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MessagingError::ClientCreation("network unavailable".into()));
        }
        // Give a concurrent connect attempt a chance to overlap.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.clients_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeClient {
            network: self.network.clone(),
            me: account.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

pub struct FakeWallet {
    account: Address,
    authorized: Mutex<Vec<Address>>,
    pub reject: AtomicBool,
    pub prompts: AtomicUsize,
    chain: Mutex<u64>,
    known_chains: Mutex<Vec<u64>>,
    pub switch_fails: AtomicBool,
    listeners: Mutex<Vec<flume::Sender<u64>>>,
}

impl FakeWallet {
    /// Wallet on Linea holding `account`, not yet authorized for this origin.
    pub fn new(account: Address) -> Arc<Self> {
        Arc::new(Self {
            account,
            authorized: Mutex::new(vec![]),
            reject: AtomicBool::new(false),
            prompts: AtomicUsize::new(0),
            chain: Mutex::new(ChainConfig::linea_mainnet().chain_id),
            known_chains: Mutex::new(vec![1, ChainConfig::linea_mainnet().chain_id]),
            switch_fails: AtomicBool::new(false),
            listeners: Mutex::new(vec![]),
        })
    }

    pub fn authorize(&self) {
        *self.authorized.lock().unwrap() = vec![self.account.clone()];
    }

    pub fn chain(&self) -> u64 {
        *self.chain.lock().unwrap()
    }

    /// Start on `chain_id`; the wallet only knows chain 1 plus `known`.
    pub fn put_on_chain(&self, chain_id: u64, known: &[u64]) {
        *self.chain.lock().unwrap() = chain_id;
        let mut chains = vec![1];
        chains.extend_from_slice(known);
        *self.known_chains.lock().unwrap() = chains;
    }

    /// The user switches network from the wallet UI.
    pub fn emit_chain_change(&self, chain_id: u64) {
        *self.chain.lock().unwrap() = chain_id;
        self.notify(chain_id);
    }

    fn notify(&self, chain_id: u64) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|tx| tx.send(chain_id).is_ok());
    }

    pub fn open_network_listeners(&self) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_disconnected())
            .count()
    }
}

#[async_trait::async_trait]
impl WalletProvider for FakeWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(WalletError::Rejected);
        }
        self.authorize();
        Ok(vec![self.account.clone()])
    }

    async fn authorized_accounts(&self) -> Result<Vec<Address>, WalletError> {
        Ok(self.authorized.lock().unwrap().clone())
    }

    async fn chain_id(&self) -> Result<u64, WalletError> {
        Ok(self.chain())
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<(), WalletError> {
        if !self.known_chains.lock().unwrap().contains(&chain_id) {
            return Err(WalletError::UnrecognizedChain(chain_id));
        }
        if self.switch_fails.load(Ordering::SeqCst) {
            return Err(WalletError::Rejected);
        }
        self.emit_chain_change(chain_id);
        Ok(())
    }

    async fn add_chain(&self, chain: &ChainConfig) -> Result<(), WalletError> {
        if self.switch_fails.load(Ordering::SeqCst) {
            return Err(WalletError::Rejected);
        }
        self.known_chains.lock().unwrap().push(chain.chain_id);
        self.emit_chain_change(chain.chain_id);
        Ok(())
    }

    fn network_changes(&self) -> BoxStream<'static, u64> {
        let (tx, rx) = flume::unbounded();
        self.listeners.lock().unwrap().push(tx);
        rx.into_stream().boxed()
    }
}

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeOwnership {
    assets: Mutex<HashMap<Address, Vec<AssetInfo>>>,
    failing: Mutex<HashSet<Address>>,
    pub lookups: AtomicUsize,
}

impl FakeOwnership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace what `owner` holds with the given contracts.
    pub fn set_assets(&self, owner: &Address, contracts: &[&str]) {
        let assets = contracts
            .iter()
            .map(|c| AssetInfo {
                contract_address: Address::new(c),
                contract_name: format!("Collection {c}"),
                asset_type: AssetType::Erc721,
            })
            .collect();
        self.assets.lock().unwrap().insert(owner.clone(), assets);
    }

    pub fn set_failing(&self, owner: &Address, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(owner.clone());
        } else {
            set.remove(owner);
        }
    }
}

#[async_trait::async_trait]
impl OwnershipApi for FakeOwnership {
    async fn owned_assets(&self, address: &Address) -> Result<Vec<AssetInfo>, OwnershipError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(address) {
            return Err(OwnershipError::Request("503 Service Unavailable".into()));
        }
        Ok(self
            .assets
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }
}
