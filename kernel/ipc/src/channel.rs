//! Synchronous message channels.
//!
//! A channel pair is two coupled half-ends. Each half owns a FIFO message
//! queue behind its own lock, plus wait queues for arrival, back-pressure,
//! and peer-close notification. Halves reference each other weakly; the
//! back-pointer resolves only while both ends are alive.
//!
//! Sending enqueues onto the destination (peer) half and transfers
//! ownership of any attached objects with the message. Receivers park on
//! their half's arrival queue using the atomic park pattern, so a message
//! sent between the empty-check and the park is never missed.
//!
//! Conversation ids are drawn from a counter shared by the pair; they are
//! strictly monotonic and never reused. [`Channel::call`] layers the
//! request/reply convention on top: reserve an id, send, then receive the
//! message that echoes the same id.
//!
//! State locks are never held across wait-queue operations.

use alloc::borrow::ToOwned;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anillo_core::id::ConversationId;
use anillo_core::status::{KResult, Status};
use anillo_core::sync::{IrqSpinLock, SpinLock};
use anillo_mm::mapping::Mapping;
use anillo_sched::thread::Thread;
use anillo_sched::waitq::WaitQueue;

/// Messages a half-end will queue before senders hit back-pressure.
pub const QUEUE_LIMIT: usize = 64;

/// An object handed off with a message. Ownership transfers on send.
pub enum Attachment {
    /// Another channel end.
    Channel(Arc<Channel>),
    /// A shared memory mapping.
    Mapping(Arc<Mapping>),
    /// An inline data blob.
    Data(Vec<u8>),
}

/// A queued message.
pub struct Message {
    /// Body bytes.
    pub body: Vec<u8>,
    /// Attached objects, in order.
    pub attachments: Vec<Attachment>,
    /// Correlates requests and replies; [`ConversationId::NONE`] outside a
    /// conversation.
    pub conversation: ConversationId,
}

impl Message {
    /// A body-only message outside any conversation.
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            attachments: Vec::new(),
            conversation: ConversationId::NONE,
        }
    }

    /// Attaches an object.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Tags the message with a conversation id.
    pub fn with_conversation(mut self, conversation: ConversationId) -> Self {
        self.conversation = conversation;
        self
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("body_len", &self.body.len())
            .field("attachments", &self.attachments.len())
            .field("conversation", &self.conversation)
            .finish()
    }
}

/// State shared by both halves of a pair.
struct PairShared {
    next_conversation: AtomicU64,
}

struct HalfState {
    queue: VecDeque<Message>,
    closed: bool,
}

/// One half of a channel pair.
pub struct Channel {
    state: IrqSpinLock<HalfState>,
    /// Woken (all) when a message lands in this half's queue, and on close.
    message_arrival: WaitQueue,
    /// Woken (all) when space frees up in this half's queue; senders park
    /// here under back-pressure.
    queue_space: WaitQueue,
    /// Woken (all) when the peer half closes.
    peer_closed_waitq: WaitQueue,
    peer: SpinLock<Weak<Channel>>,
    shared: Arc<PairShared>,
}

impl Channel {
    /// Creates a coupled pair of half-ends.
    pub fn new_pair() -> (Arc<Channel>, Arc<Channel>) {
        let shared = Arc::new(PairShared {
            next_conversation: AtomicU64::new(0),
        });
        let make = |shared: &Arc<PairShared>| {
            Arc::new(Channel {
                state: IrqSpinLock::new(HalfState {
                    queue: VecDeque::new(),
                    closed: false,
                }),
                message_arrival: WaitQueue::new(),
                queue_space: WaitQueue::new(),
                peer_closed_waitq: WaitQueue::new(),
                peer: SpinLock::new(Weak::new()),
                shared: shared.clone(),
            })
        };
        let a = make(&shared);
        let b = make(&shared);
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }

    /// Resolves the peer half, while it is still alive.
    pub fn peer(&self) -> Option<Arc<Channel>> {
        self.peer.lock().upgrade()
    }

    /// Reserves a fresh conversation id (monotonic within the pair).
    pub fn reserve_conversation(&self) -> ConversationId {
        ConversationId::new(self.shared.next_conversation.fetch_add(1, Ordering::Relaxed) + 1)
    }

    // -- send ---------------------------------------------------------------

    /// Sends without blocking.
    ///
    /// Returns [`Status::NoWait`] (with the message intact) if the peer's
    /// queue is full, and [`Status::PermanentOutage`] if the peer is gone
    /// or closed.
    pub fn try_send(&self, message: Message) -> Result<(), (Status, Message)> {
        let peer = match self.peer() {
            Some(peer) => peer,
            None => return Err((Status::PermanentOutage, message)),
        };
        {
            let mut dst = peer.state.lock();
            if dst.closed {
                return Err((Status::PermanentOutage, message));
            }
            if dst.queue.len() >= QUEUE_LIMIT {
                return Err((Status::NoWait, message));
            }
            dst.queue.push_back(message);
        }
        peer.message_arrival.wake_all();
        Ok(())
    }

    /// Sends, parking the calling thread under back-pressure.
    ///
    /// Ownership of the message (and its attachments) transfers on
    /// success.
    pub fn send(&self, thread: &Arc<Thread>, message: Message) -> KResult<()> {
        let mut message = Some(message);
        loop {
            let peer = self.peer().ok_or(Status::PermanentOutage)?;
            // Atomic park: re-check the queue while holding the space
            // queue's lock so a concurrent receive cannot be missed. The
            // arrival wake happens only after this guard is dropped (wait
            // queues never nest).
            let guard = peer.queue_space.locked();
            let sent = {
                let mut dst = peer.state.lock();
                if dst.closed {
                    return Err(Status::PermanentOutage);
                }
                if dst.queue.len() < QUEUE_LIMIT {
                    dst.queue.push_back(message.take().expect("message consumed twice"));
                    true
                } else {
                    false
                }
            };
            if sent {
                drop(guard);
                peer.message_arrival.wake_all();
                return Ok(());
            }
            thread.wait_on_locked(&peer.queue_space, guard, None)?;
        }
    }

    // -- receive ------------------------------------------------------------

    /// Receives without blocking.
    ///
    /// Returns [`Status::NoWait`] if the queue is empty and the peer may
    /// still send, [`Status::PermanentOutage`] once the queue is drained
    /// and no more messages can arrive.
    pub fn try_receive(&self) -> KResult<Message> {
        // The peer check runs after our own lock is dropped: the two state
        // locks are never held together (a receiver on each half would
        // deadlock otherwise).
        let (popped, self_closed) = {
            let mut state = self.state.lock();
            (state.queue.pop_front(), state.closed)
        };
        match popped {
            Some(message) => {
                // Space freed: unblock senders and back-pressure watchers.
                self.queue_space.wake_all();
                Ok(message)
            }
            None if self_closed || self.peer_gone_or_closed() => {
                Err(Status::PermanentOutage)
            }
            None => Err(Status::NoWait),
        }
    }

    /// Receives, parking the calling thread until a message arrives.
    pub fn receive(&self, thread: &Arc<Thread>) -> KResult<Message> {
        loop {
            let guard = self.message_arrival.locked();
            let (popped, self_closed) = {
                let mut state = self.state.lock();
                (state.queue.pop_front(), state.closed)
            };
            match popped {
                Some(message) => {
                    drop(guard);
                    self.queue_space.wake_all();
                    return Ok(message);
                }
                None if self_closed || self.peer_gone_or_closed() => {
                    return Err(Status::PermanentOutage);
                }
                None => thread.wait_on_locked(&self.message_arrival, guard, None)?,
            }
        }
    }

    /// Receives the next message carrying the given conversation id,
    /// leaving others queued.
    pub fn receive_conversation(
        &self,
        thread: &Arc<Thread>,
        conversation: ConversationId,
    ) -> KResult<Message> {
        loop {
            let guard = self.message_arrival.locked();
            let (found, self_closed) = {
                let mut state = self.state.lock();
                let found = state
                    .queue
                    .iter()
                    .position(|m| m.conversation == conversation)
                    .and_then(|idx| state.queue.remove(idx));
                (found, state.closed)
            };
            if found.is_none() && (self_closed || self.peer_gone_or_closed()) {
                return Err(Status::PermanentOutage);
            }
            match found {
                Some(message) => {
                    drop(guard);
                    self.queue_space.wake_all();
                    return Ok(message);
                }
                None => thread.wait_on_locked(&self.message_arrival, guard, None)?,
            }
        }
    }

    /// Request/reply helper: reserves a conversation, sends the request,
    /// and receives the reply carrying the same id.
    pub fn call(&self, thread: &Arc<Thread>, message: Message) -> KResult<Message> {
        let conversation = self.reserve_conversation();
        self.send(thread, message.with_conversation(conversation))?;
        self.receive_conversation(thread, conversation)
    }

    // -- close and readiness ------------------------------------------------

    /// Closes this half. Idempotent.
    ///
    /// Messages already queued on the peer remain deliverable; blocked
    /// senders and receivers on both halves are woken so they can observe
    /// the close.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        // Our own waiters: receivers see the closed flag, senders parked
        // for space on our queue see the outage.
        self.message_arrival.wake_all();
        self.queue_space.wake_all();
        if let Some(peer) = self.peer() {
            peer.peer_closed_waitq.wake_all();
            peer.message_arrival.wake_all();
            peer.queue_space.wake_all();
        }
    }

    /// Returns `true` if this half has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns `true` if the peer is closed or dropped.
    pub fn peer_gone_or_closed(&self) -> bool {
        match self.peer() {
            Some(peer) => peer.state.lock().closed,
            None => true,
        }
    }

    /// Number of queued (deliverable) messages on this half.
    pub fn queued_messages(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns `true` if this half can accept another message.
    pub fn has_queue_space(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.queue.len() < QUEUE_LIMIT
    }

    /// This half's message-arrival wait queue (monitors park here).
    pub fn message_arrival_waitq(&self) -> &WaitQueue {
        &self.message_arrival
    }

    /// This half's queue-space wait queue.
    pub fn queue_space_waitq(&self) -> &WaitQueue {
        &self.queue_space
    }

    /// Woken when the peer half closes.
    pub fn peer_closed_waitq(&self) -> &WaitQueue {
        &self.peer_closed_waitq
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Queued messages die with the half, releasing their attachments.
        self.close();
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.state.lock().closed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Server realms
// ---------------------------------------------------------------------------

/// A listening point in the named realm.
///
/// [`connect`] creates a pair, queues one end here for acceptance, and
/// hands the other end to the connector.
pub struct ChannelServer {
    name: String,
    pending: IrqSpinLock<VecDeque<Arc<Channel>>>,
    arrival: WaitQueue,
    closed: AtomicBool,
}

/// Registered servers by name.
static REALM: SpinLock<BTreeMap<String, Arc<ChannelServer>>> = SpinLock::new(BTreeMap::new());

impl ChannelServer {
    /// Registers a new server under `name`.
    ///
    /// Fails with [`Status::AlreadyInProgress`] if the name is taken.
    pub fn register(name: &str) -> KResult<Arc<ChannelServer>> {
        let mut realm = REALM.lock();
        if realm.contains_key(name) {
            return Err(Status::AlreadyInProgress);
        }
        let server = Arc::new(ChannelServer {
            name: name.to_owned(),
            pending: IrqSpinLock::new(VecDeque::new()),
            arrival: WaitQueue::new(),
            closed: AtomicBool::new(false),
        });
        realm.insert(name.to_owned(), server.clone());
        Ok(server)
    }

    /// Accepts the next pending connection, parking until one arrives.
    pub fn accept(&self, thread: &Arc<Thread>) -> KResult<Arc<Channel>> {
        loop {
            let guard = self.arrival.locked();
            if let Some(channel) = self.pending.lock().pop_front() {
                return Ok(channel);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(Status::PermanentOutage);
            }
            thread.wait_on_locked(&self.arrival, guard, None)?;
        }
    }

    /// Accepts without blocking.
    pub fn try_accept(&self) -> KResult<Arc<Channel>> {
        if let Some(channel) = self.pending.lock().pop_front() {
            return Ok(channel);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::PermanentOutage);
        }
        Err(Status::NoWait)
    }

    /// Unregisters the server and wakes pending acceptors.
    pub fn unregister(&self) {
        self.closed.store(true, Ordering::Release);
        REALM.lock().remove(&self.name);
        self.arrival.wake_all();
    }
}

impl core::fmt::Debug for ChannelServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelServer")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Connects to the named server, returning the client half.
pub fn connect(name: &str) -> KResult<Arc<Channel>> {
    let server = REALM
        .lock()
        .get(name)
        .cloned()
        .ok_or(Status::NoSuchResource)?;
    if server.closed.load(Ordering::Acquire) {
        return Err(Status::PermanentOutage);
    }
    let (client, server_end) = Channel::new_pair();
    server.pending.lock().push_back(server_end);
    server.arrival.wake_all();
    Ok(client)
}
