//! One connected peer
//!
//! Tracks the handshake, liveness and the queue of tasks the peer works
//! through one at a time. All I/O goes through the outgoing channel of
//! its connection.

use crate::network::codec::WireError;
use crate::network::message::{
    Message, NetworkAddress, ServiceFlags, VersionMessage, USER_AGENT,
};
use crate::network::tasks::{CompletedTask, PeerTask, TaskResponse, TaskTimeout};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

pub type PeerId = u64;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Peer misbehaved: {0}")]
    Misbehaving(String),
    #[error("Unsuitable peer: {0}")]
    Unsuitable(String),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
}

impl PeerError {
    /// The address should not be tried again
    pub fn is_misbehaviour(&self) -> bool {
        matches!(
            self,
            PeerError::Misbehaving(_) | PeerError::Unsuitable(_) | PeerError::Wire(_)
        )
    }
}

/// Outcome of feeding a message to the peer's current task
#[derive(Debug)]
pub enum TaskEvent {
    /// No task consumed the message
    Unhandled,
    Handled,
    Completed(CompletedTask),
}

struct RunningTask {
    task: PeerTask,
    deadline: Instant,
}

pub struct Peer {
    pub id: PeerId,
    pub address: String,
    sender: mpsc::UnboundedSender<Message>,
    version: Option<VersionMessage>,
    verack_received: bool,
    connected: bool,
    tasks: VecDeque<PeerTask>,
    current: Option<RunningTask>,
    task_timeout: Duration,
    last_message: Instant,
    ping: Option<(u64, Instant)>,
}

impl Peer {
    pub fn new(id: PeerId, address: String, sender: mpsc::UnboundedSender<Message>, task_timeout: Duration) -> Self {
        Self {
            id,
            address,
            sender,
            version: None,
            verack_received: false,
            connected: false,
            tasks: VecDeque::new(),
            current: None,
            task_timeout,
            last_message: Instant::now(),
            ping: None,
        }
    }

    pub fn send(&self, message: Message) {
        log::trace!("-> {} {}", self.address, message.command());
        if self.sender.send(message).is_err() {
            log::debug!("Peer {} writer is gone", self.address);
        }
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    pub fn send_version(&self, start_height: u32, protocol_version: i32) {
        let receiver = self
            .address
            .parse()
            .map(|addr| NetworkAddress::new(addr, ServiceFlags::NODE_NETWORK))
            .unwrap_or_else(|_| NetworkAddress::unspecified());
        self.send(Message::Version(VersionMessage {
            version: protocol_version,
            services: ServiceFlags::empty(),
            timestamp: crate::utils::unix_time(),
            receiver,
            sender: NetworkAddress::unspecified(),
            nonce: rand::random(),
            user_agent: USER_AGENT.to_string(),
            start_height: start_height as i32,
            relay: false,
        }));
    }

    /// Remember the peer's version and acknowledge it. Returns whether the
    /// handshake just completed.
    pub fn handle_version(&mut self, version: VersionMessage) -> Result<bool, PeerError> {
        if self.version.is_some() {
            return Err(PeerError::Misbehaving("duplicate version".to_string()));
        }
        if !version.has_bloom_support() {
            return Err(PeerError::Unsuitable(format!(
                "no bloom filter support at protocol version {}",
                version.version
            )));
        }
        if !version.services.contains(ServiceFlags::NODE_NETWORK) {
            return Err(PeerError::Unsuitable("does not serve blocks".to_string()));
        }

        log::debug!(
            "Peer {} version {} {} at height {}",
            self.address,
            version.version,
            version.user_agent,
            version.start_height
        );
        self.version = Some(version);
        self.send(Message::VerAck);
        Ok(self.complete_handshake())
    }

    pub fn handle_verack(&mut self) -> bool {
        self.verack_received = true;
        self.complete_handshake()
    }

    fn complete_handshake(&mut self) -> bool {
        if self.connected || !self.verack_received || self.version.is_none() {
            return false;
        }
        self.connected = true;
        log::info!("Peer {} connected", self.address);
        true
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn announced_height(&self) -> u32 {
        self.version
            .as_ref()
            .map_or(0, |v| v.start_height.max(0) as u32)
    }

    pub fn set_announced_height(&mut self, height: u32) {
        if let Some(version) = self.version.as_mut() {
            version.start_height = version.start_height.max(height as i32);
        }
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    pub fn touch(&mut self) {
        self.last_message = Instant::now();
    }

    /// A pong for our keep-alive ping
    pub fn handle_pong(&mut self, nonce: u64) -> bool {
        match self.ping {
            Some((expected, _)) if expected == nonce => {
                self.ping = None;
                true
            }
            _ => false,
        }
    }

    /// Ping a quiet peer; fail one that ignored the ping for `timeout`
    pub fn check_alive(&mut self, ping_interval: Duration, timeout: Duration) -> Result<(), PeerError> {
        if let Some((_, sent)) = self.ping {
            if sent.elapsed() >= timeout {
                return Err(PeerError::Timeout("ping".to_string()));
            }
            return Ok(());
        }
        if self.last_message.elapsed() >= ping_interval {
            let nonce = rand::random();
            self.ping = Some((nonce, Instant::now()));
            self.send(Message::Ping(nonce));
        }
        Ok(())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Nothing queued or running
    pub fn is_ready(&self) -> bool {
        self.connected && self.current.is_none() && self.tasks.is_empty()
    }

    pub fn add_task(&mut self, task: PeerTask) {
        self.tasks.push_back(task);
        self.start_next_task();
    }

    fn start_next_task(&mut self) {
        if self.current.is_some() || !self.connected {
            return;
        }
        let Some(task) = self.tasks.pop_front() else {
            return;
        };
        log::debug!("Peer {} starts {}", self.address, task.name());
        for message in task.start() {
            self.send(message);
        }
        let deadline = Instant::now() + task.timeout(self.task_timeout);
        self.current = Some(RunningTask { task, deadline });
    }

    pub fn handle_task_message(&mut self, message: &Message) -> Result<TaskEvent, PeerError> {
        let Some(running) = self.current.as_mut() else {
            return Ok(TaskEvent::Unhandled);
        };
        match running.task.handle_message(message)? {
            TaskResponse::NotHandled => Ok(TaskEvent::Unhandled),
            TaskResponse::Handled { send } => {
                for message in send {
                    self.send(message);
                }
                Ok(TaskEvent::Handled)
            }
            TaskResponse::Completed { send, result } => {
                for message in send {
                    self.send(message);
                }
                self.current = None;
                self.start_next_task();
                Ok(TaskEvent::Completed(result))
            }
        }
    }

    /// Expire the running task when its deadline passed
    pub fn check_task_timeout(&mut self) -> Option<TaskTimeout> {
        if self.current.as_ref().map_or(true, |r| r.deadline > Instant::now()) {
            return None;
        }
        let running = self.current.take()?;
        let disposable = running.task.is_disposable();
        let outcome = running.task.handle_timeout();
        if disposable {
            self.start_next_task();
        }
        Some(outcome)
    }

    /// Tasks that were never started, for reassignment
    pub fn take_queued_tasks(&mut self) -> Vec<PeerTask> {
        self.tasks.drain(..).collect()
    }
}
