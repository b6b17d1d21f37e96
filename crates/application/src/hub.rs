//! 聊天广播中心
//!
//! 进程内唯一的房间注册表：会议 ID -> 当前正在查看该会议聊天的连接集合。
//!
//! 所有加入、离开、广播请求都经由一个有界队列送到单个任务中顺序处理，
//! 房间表只被这个任务持有和修改，因此任何操作都不会观察到中间状态。
//!
//! 每个连接的发送邮箱只有一个 `Sender`，并且由广播中心独占持有。
//! 把成员从房间中移除就是丢弃这个 `Sender`，邮箱随之关闭；
//! `ClientHandle` 在加入时被消费，所以已关闭的邮箱不可能再被加入任何房间，
//! 也不可能再收到任何消息。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use domain::{ChatIdentity, MeetingId, UserId};
use thiserror::Error;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// 编码完成、可直接写入 socket 的消息帧，所有成员共享同一份
pub type Payload = Arc<str>;

/// 连接唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("chat hub is not running")]
    Closed,
}

/// 连接在广播中心一侧的句柄：身份、所属房间以及邮箱的发送端
#[derive(Debug)]
pub struct ClientHandle {
    id: ConnectionId,
    meeting_id: MeetingId,
    identity: ChatIdentity,
    sender: mpsc::Sender<Payload>,
}

impl ClientHandle {
    /// 创建连接句柄和对应的邮箱，邮箱由连接自己的发送泵消费
    pub fn new(
        meeting_id: MeetingId,
        identity: ChatIdentity,
        mailbox_capacity: usize,
    ) -> (Self, Mailbox) {
        let (sender, receiver) = mpsc::channel(mailbox_capacity);
        let handle = Self {
            id: ConnectionId::generate(),
            meeting_id,
            identity,
            sender,
        };
        (handle, Mailbox { receiver })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn meeting_id(&self) -> MeetingId {
        self.meeting_id
    }

    pub fn identity(&self) -> &ChatIdentity {
        &self.identity
    }
}

/// 连接的有界发送队列
#[derive(Debug)]
pub struct Mailbox {
    receiver: mpsc::Receiver<Payload>,
}

impl Mailbox {
    /// 等待下一帧；返回 `None` 表示邮箱已被广播中心关闭且已排空
    pub async fn recv(&mut self) -> Option<Payload> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Payload, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// 广播请求：目标房间加一份已编码的消息
#[derive(Debug, Clone)]
struct BroadcastRequest {
    meeting_id: MeetingId,
    payload: Payload,
}

#[derive(Debug)]
enum HubCommand {
    Join(ClientHandle),
    Leave {
        meeting_id: MeetingId,
        connection_id: ConnectionId,
    },
    Broadcast(BroadcastRequest),
    Direct {
        meeting_id: MeetingId,
        connection_id: ConnectionId,
        payload: Payload,
    },
    Members {
        meeting_id: MeetingId,
        respond_to: oneshot::Sender<Vec<ConnectionId>>,
    },
    RoomCount {
        respond_to: oneshot::Sender<usize>,
    },
}

#[derive(Debug)]
struct Member {
    user_id: UserId,
    sender: mpsc::Sender<Payload>,
}

impl Member {
    /// 非阻塞投递；邮箱已满或接收端已消失时返回 false，调用方负责移除该成员
    fn offer(&self, meeting_id: MeetingId, connection_id: ConnectionId, payload: Payload) -> bool {
        match self.sender.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(
                    meeting_id = %meeting_id,
                    connection_id = %connection_id,
                    user_id = %self.user_id,
                    "mailbox full, evicting slow consumer"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    meeting_id = %meeting_id,
                    connection_id = %connection_id,
                    user_id = %self.user_id,
                    "mailbox receiver gone, evicting member"
                );
                false
            }
        }
    }
}

/// 房间注册表，运行在独立任务中
pub struct Hub {
    rooms: HashMap<MeetingId, HashMap<ConnectionId, Member>>,
    receiver: mpsc::Receiver<HubCommand>,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> (Self, HubHandle) {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let hub = Self {
            rooms: HashMap::new(),
            receiver,
        };
        (hub, HubHandle { sender })
    }

    /// 创建并在当前 runtime 上启动广播中心
    pub fn spawn(queue_capacity: usize) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(queue_capacity);
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// 顺序处理命令，直到所有 `HubHandle` 都被丢弃
    pub async fn run(mut self) {
        info!("chat hub started");
        while let Some(command) = self.receiver.recv().await {
            self.handle(command);
        }
        info!(rooms = self.rooms.len(), "chat hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Join(client) => self.join(client),
            HubCommand::Leave {
                meeting_id,
                connection_id,
            } => {
                self.leave(meeting_id, connection_id);
            }
            HubCommand::Broadcast(request) => self.broadcast(request),
            HubCommand::Direct {
                meeting_id,
                connection_id,
                payload,
            } => self.direct(meeting_id, connection_id, payload),
            HubCommand::Members {
                meeting_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.members_of(meeting_id));
            }
            HubCommand::RoomCount { respond_to } => {
                let _ = respond_to.send(self.rooms.len());
            }
        }
    }

    fn join(&mut self, client: ClientHandle) {
        let ClientHandle {
            id,
            meeting_id,
            identity,
            sender,
        } = client;

        let members = self.rooms.entry(meeting_id).or_default();
        members.entry(id).or_insert(Member {
            user_id: identity.user_id,
            sender,
        });

        debug!(
            meeting_id = %meeting_id,
            connection_id = %id,
            members = members.len(),
            "connection joined room"
        );
    }

    fn leave(&mut self, meeting_id: MeetingId, connection_id: ConnectionId) -> bool {
        let Some(members) = self.rooms.get_mut(&meeting_id) else {
            return false;
        };

        // 丢弃 Sender 即关闭邮箱
        let removed = members.remove(&connection_id).is_some();
        if members.is_empty() {
            self.rooms.remove(&meeting_id);
        }

        if removed {
            debug!(meeting_id = %meeting_id, connection_id = %connection_id, "connection left room");
        }
        removed
    }

    fn broadcast(&mut self, request: BroadcastRequest) {
        let BroadcastRequest {
            meeting_id,
            payload,
        } = request;

        let Some(members) = self.rooms.get_mut(&meeting_id) else {
            return;
        };

        members.retain(|connection_id, member| {
            member.offer(meeting_id, *connection_id, payload.clone())
        });

        if members.is_empty() {
            self.rooms.remove(&meeting_id);
        }
    }

    fn direct(&mut self, meeting_id: MeetingId, connection_id: ConnectionId, payload: Payload) {
        let delivered = match self
            .rooms
            .get(&meeting_id)
            .and_then(|members| members.get(&connection_id))
        {
            Some(member) => member.offer(meeting_id, connection_id, payload),
            None => return,
        };

        if !delivered {
            self.leave(meeting_id, connection_id);
        }
    }

    fn members_of(&self, meeting_id: MeetingId) -> Vec<ConnectionId> {
        self.rooms
            .get(&meeting_id)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// 广播中心的访问句柄，可自由克隆
#[derive(Clone, Debug)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn dispatch(&self, command: HubCommand) -> Result<(), HubError> {
        self.sender.send(command).await.map_err(|_| HubError::Closed)
    }

    /// 把连接加入其所属房间，房间不存在时自动创建
    pub async fn join(&self, client: ClientHandle) -> Result<(), HubError> {
        self.dispatch(HubCommand::Join(client)).await
    }

    /// 把连接移出房间并关闭其邮箱，重复调用无副作用
    pub async fn leave(
        &self,
        meeting_id: MeetingId,
        connection_id: ConnectionId,
    ) -> Result<(), HubError> {
        self.dispatch(HubCommand::Leave {
            meeting_id,
            connection_id,
        })
        .await
    }

    /// 同步上下文（例如 Drop）中使用的离开请求，队列满时转交后台任务
    pub fn leave_in_background(&self, meeting_id: MeetingId, connection_id: ConnectionId) {
        let command = HubCommand::Leave {
            meeting_id,
            connection_id,
        };
        match self.sender.try_send(command) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(command)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let sender = self.sender.clone();
                    runtime.spawn(async move {
                        let _ = sender.send(command).await;
                    });
                }
            }
        }
    }

    /// 向房间内所有当前成员（包括发送者本人）投递消息。
    /// 投递失败的成员被直接移除，不会向调用方报告。
    pub async fn broadcast(&self, meeting_id: MeetingId, payload: Payload) -> Result<(), HubError> {
        self.dispatch(HubCommand::Broadcast(BroadcastRequest {
            meeting_id,
            payload,
        }))
        .await
    }

    /// 只投递给房间内的某一个连接，用于私有的错误提示
    pub async fn send_to(
        &self,
        meeting_id: MeetingId,
        connection_id: ConnectionId,
        payload: Payload,
    ) -> Result<(), HubError> {
        self.dispatch(HubCommand::Direct {
            meeting_id,
            connection_id,
            payload,
        })
        .await
    }

    pub async fn room_members(&self, meeting_id: MeetingId) -> Result<Vec<ConnectionId>, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.dispatch(HubCommand::Members {
            meeting_id,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| HubError::Closed)
    }

    pub async fn room_count(&self) -> Result<usize, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.dispatch(HubCommand::RoomCount { respond_to }).await?;
        response.await.map_err(|_| HubError::Closed)
    }
}
