//! WebSocket 连接
//!
//! 每个连接由两个独立任务驱动：
//! - 发送泵：把邮箱中的帧按顺序写入 socket，写失败或邮箱被关闭时结束；
//! - 接收泵：读取客户端帧，先持久化再广播，读失败或客户端关闭时结束。
//!
//! 两个泵共享一个取消令牌，任一方结束都会让另一方尽快退出。
//! 接收泵持有离开守卫，守卫被丢弃时向广播中心发出离开请求，
//! 广播中心关闭邮箱后发送泵随之结束；离开请求是幂等的，
//! 所以无论哪一方先发现连接失效，清理都只生效一次。

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use application::{
    wire, ApplicationError, ChatService, ClientHandle, ConnectionId, HubError, HubHandle, Mailbox,
};
use axum::extract::ws::Message as WsMessage;
use domain::{ChatIdentity, MeetingId};
use futures_util::stream::Peekable;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 关闭 socket 写端的最长等待时间，对端不再读取时不能无限挂起
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// 每个连接需要的共享依赖
#[derive(Clone)]
pub struct ConnectionDeps {
    pub hub: HubHandle,
    pub chat_service: Arc<ChatService>,
    pub mailbox_capacity: usize,
}

/// 已加入房间的连接，持有两个泵的任务句柄
pub struct ChatConnection {
    id: ConnectionId,
    outbound: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

impl ChatConnection {
    /// 加入房间并启动收发两个泵。
    ///
    /// 加入在启动泵之前完成，所以连接的第一帧一定在加入之后才可能被广播。
    pub async fn admit<S, R, E>(
        sink: S,
        stream: R,
        meeting_id: MeetingId,
        identity: ChatIdentity,
        deps: ConnectionDeps,
    ) -> Result<Self, HubError>
    where
        S: Sink<WsMessage> + Unpin + Send + 'static,
        S::Error: fmt::Display + Send,
        R: Stream<Item = Result<WsMessage, E>> + Unpin + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (client, mailbox) =
            ClientHandle::new(meeting_id, identity.clone(), deps.mailbox_capacity);
        let connection_id = client.id();
        deps.hub.join(client).await?;

        info!(
            meeting_id = %meeting_id,
            connection_id = %connection_id,
            user_id = %identity.user_id,
            "chat connection admitted"
        );

        let token = CancellationToken::new();
        let guard = LeaveGuard {
            hub: deps.hub.clone(),
            meeting_id,
            connection_id,
            token: token.clone(),
        };
        let session = Session {
            meeting_id,
            connection_id,
            identity,
            hub: deps.hub,
            chat_service: deps.chat_service,
        };

        let outbound = tokio::spawn(outbound_pump(sink, mailbox, token.clone(), connection_id));
        let inbound = tokio::spawn(inbound_pump(stream, session, token, guard));

        Ok(Self {
            id: connection_id,
            outbound,
            inbound,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// 等待两个泵都结束
    pub async fn closed(self) {
        let (outbound, inbound) = tokio::join!(self.outbound, self.inbound);
        if let Err(err) = outbound {
            warn!(connection_id = %self.id, error = %err, "outbound pump panicked");
        }
        if let Err(err) = inbound {
            warn!(connection_id = %self.id, error = %err, "inbound pump panicked");
        }
    }
}

/// 被丢弃时取消两个泵并把连接移出房间
struct LeaveGuard {
    hub: HubHandle,
    meeting_id: MeetingId,
    connection_id: ConnectionId,
    token: CancellationToken,
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        self.token.cancel();
        self.hub
            .leave_in_background(self.meeting_id, self.connection_id);
        debug!(
            meeting_id = %self.meeting_id,
            connection_id = %self.connection_id,
            "chat connection released"
        );
    }
}

struct Session {
    meeting_id: MeetingId,
    connection_id: ConnectionId,
    identity: ChatIdentity,
    hub: HubHandle,
    chat_service: Arc<ChatService>,
}

impl Session {
    /// 持久化成功之后才广播，广播包含发送者自己
    async fn relay(&self, content: String) -> Result<(), ApplicationError> {
        let message = self
            .chat_service
            .save_message(self.meeting_id, &self.identity, content)
            .await?;
        let payload = wire::encode_message(&message)?;
        self.hub.broadcast(self.meeting_id, payload).await?;
        Ok(())
    }

    /// 只发给当前连接的错误帧
    async fn reject(&self, reason: &str) -> Result<(), HubError> {
        self.hub
            .send_to(self.meeting_id, self.connection_id, wire::encode_error(reason))
            .await
    }
}

fn client_error_message(err: &ApplicationError) -> String {
    match err {
        ApplicationError::Domain(domain_err) => domain_err.to_string(),
        _ => "failed to deliver message".to_string(),
    }
}

async fn outbound_pump<S>(
    mut sink: S,
    mut mailbox: Mailbox,
    token: CancellationToken,
    connection_id: ConnectionId,
) where
    S: Sink<WsMessage> + Unpin + Send,
    S::Error: fmt::Display + Send,
{
    loop {
        let frame = tokio::select! {
            frame = mailbox.recv() => frame,
            _ = token.cancelled() => break,
        };

        // 邮箱被广播中心关闭：连接已离开房间或被踢出
        let closing = frame.is_none();
        let message = match frame {
            Some(payload) => WsMessage::Text(payload.to_string().into()),
            None => WsMessage::Close(None),
        };

        // 写入同样要响应取消，否则对端停止读取时写端永远不会被关闭
        tokio::select! {
            result = sink.send(message) => {
                if let Err(err) = result {
                    debug!(connection_id = %connection_id, error = %err, "websocket write failed");
                    break;
                }
            }
            _ = token.cancelled() => break,
        }

        if closing {
            break;
        }
    }

    token.cancel();
    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        debug!(connection_id = %connection_id, "websocket close timed out");
    }
    debug!(connection_id = %connection_id, "outbound pump stopped");
}

/// 对端断开（流结束或读错误）时返回；已有待读的帧时一直挂起，留给下一轮读取
async fn peer_gone<R, E>(stream: &mut Peekable<R>)
where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
{
    match Pin::new(stream).peek().await {
        None | Some(Err(_)) => {}
        Some(Ok(_)) => std::future::pending().await,
    }
}

async fn inbound_pump<R, E>(
    stream: R,
    session: Session,
    token: CancellationToken,
    guard: LeaveGuard,
) where
    R: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    let mut stream = stream.peekable();
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = token.cancelled() => break,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!(connection_id = %session.connection_id, error = %err, "websocket read failed");
                break;
            }
            None => break,
        };

        let content = match message {
            WsMessage::Text(text) => text.as_str().to_owned(),
            WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    if session.reject("binary frames must be UTF-8 text").await.is_err() {
                        break;
                    }
                    continue;
                }
            },
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => break,
        };

        // 持久化进行中时仍然关注取消和对端断开，两者都会放弃这次保存
        let result = tokio::select! {
            result = session.relay(content) => result,
            _ = token.cancelled() => break,
            _ = peer_gone(&mut stream) => break,
        };

        match result {
            Ok(()) => {}
            Err(ApplicationError::Hub(_)) => break,
            Err(err) => {
                warn!(
                    meeting_id = %session.meeting_id,
                    connection_id = %session.connection_id,
                    error = %err,
                    "failed to relay chat message"
                );
                if session.reject(&client_error_message(&err)).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(guard);
    debug!(connection_id = %session.connection_id, "inbound pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::{
        ChatMessageRepository, ChatServiceDependencies, Hub, MeetingRepository, SystemClock,
    };
    use async_trait::async_trait;
    use domain::{ChatMessage, RepositoryError, UserId};
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use infrastructure::InMemoryStore;
    use serde_json::Value;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use uuid::Uuid;

    struct FailingMessages;

    #[async_trait]
    impl ChatMessageRepository for FailingMessages {
        async fn save(&self, _message: ChatMessage) -> Result<ChatMessage, RepositoryError> {
            Err(RepositoryError::storage("write timeout"))
        }

        async fn recent(
            &self,
            _meeting_id: MeetingId,
            _limit: u32,
        ) -> Result<Vec<ChatMessage>, RepositoryError> {
            Ok(Vec::new())
        }
    }

    /// 保存永远不会完成的仓储
    struct StalledMessages;

    #[async_trait]
    impl ChatMessageRepository for StalledMessages {
        async fn save(&self, _message: ChatMessage) -> Result<ChatMessage, RepositoryError> {
            std::future::pending().await
        }

        async fn recent(
            &self,
            _meeting_id: MeetingId,
            _limit: u32,
        ) -> Result<Vec<ChatMessage>, RepositoryError> {
            Ok(Vec::new())
        }
    }

    /// 对端不再读取的写端：poll_ready 一直挂起
    struct StalledSink {
        released: Arc<AtomicBool>,
    }

    impl Sink<WsMessage> for StalledSink {
        type Error = Infallible;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: WsMessage) -> Result<(), Infallible> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            self.released.store(true, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    impl Drop for StalledSink {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct Client {
        to_server: UnboundedSender<Result<WsMessage, Infallible>>,
        from_server: UnboundedReceiver<WsMessage>,
        connection: ChatConnection,
    }

    impl Client {
        fn send_text(&self, text: &str) {
            self.to_server
                .unbounded_send(Ok(WsMessage::Text(text.to_owned().into())))
                .unwrap();
        }

        async fn next_json(&mut self) -> Value {
            let frame = tokio::time::timeout(Duration::from_secs(1), self.from_server.next())
                .await
                .expect("frame in time")
                .expect("server stream open");
            match frame {
                WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        async fn assert_silent(&mut self) {
            let result =
                tokio::time::timeout(Duration::from_millis(100), self.from_server.next()).await;
            assert!(result.is_err(), "unexpected frame: {result:?}");
        }
    }

    fn deps_with(hub: HubHandle, messages: Arc<dyn ChatMessageRepository>) -> ConnectionDeps {
        let store = Arc::new(InMemoryStore::new());
        let meetings: Arc<dyn MeetingRepository> = store.clone();
        let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
            message_repository: messages,
            meeting_repository: meetings,
            user_repository: store,
            clock: Arc::new(SystemClock),
        }));
        ConnectionDeps {
            hub,
            chat_service,
            mailbox_capacity: 16,
        }
    }

    fn deps(hub: HubHandle) -> ConnectionDeps {
        deps_with(hub, Arc::new(InMemoryStore::new()))
    }

    async fn connect(meeting_id: MeetingId, name: &str, deps: ConnectionDeps) -> Client {
        let (to_server, server_stream) = unbounded();
        let (server_sink, from_server) = unbounded();
        let identity = ChatIdentity::new(UserId::from(Uuid::new_v4()), name, "");

        let connection = ChatConnection::admit(server_sink, server_stream, meeting_id, identity, deps)
            .await
            .unwrap();

        Client {
            to_server,
            from_server,
            connection,
        }
    }

    async fn wait_for_members(hub: &HubHandle, meeting_id: MeetingId, expected: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if hub.room_members(meeting_id).await.unwrap().len() == expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("membership settles");
    }

    #[tokio::test]
    async fn test_message_is_persisted_then_broadcast_to_all_including_sender() {
        let (hub, _task) = Hub::spawn(64);
        let meeting_id = MeetingId::from(Uuid::new_v4());
        let deps = deps(hub.clone());

        let mut u1 = connect(meeting_id, "u1", deps.clone()).await;
        let mut u2 = connect(meeting_id, "u2", deps.clone()).await;

        u1.send_text("hi");

        for client in [&mut u1, &mut u2] {
            let frame = client.next_json().await;
            assert_eq!(frame["type"], "TALK");
            assert_eq!(frame["content"], "hi");
            assert_eq!(frame["senderName"], "u1");
        }
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let (hub, _task) = Hub::spawn(64);
        let deps = deps(hub.clone());
        let (room_a, room_b) = (
            MeetingId::from(Uuid::new_v4()),
            MeetingId::from(Uuid::new_v4()),
        );

        let mut a = connect(room_a, "a", deps.clone()).await;
        let mut b = connect(room_b, "b", deps.clone()).await;

        a.send_text("only in a");
        assert_eq!(a.next_json().await["content"], "only in a");
        b.assert_silent().await;
    }

    #[tokio::test]
    async fn test_invalid_binary_frame_gets_private_error() {
        let (hub, _task) = Hub::spawn(64);
        let meeting_id = MeetingId::from(Uuid::new_v4());
        let deps = deps(hub.clone());

        let mut u1 = connect(meeting_id, "u1", deps.clone()).await;
        let mut u2 = connect(meeting_id, "u2", deps.clone()).await;

        u1.to_server
            .unbounded_send(Ok(WsMessage::Binary(vec![0xff, 0xfe].into())))
            .unwrap();

        let frame = u1.next_json().await;
        assert_eq!(frame["type"], "error");
        u2.assert_silent().await;

        // 连接仍然可用
        u1.send_text("still here");
        assert_eq!(u2.next_json().await["content"], "still here");
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported_only_to_sender() {
        let (hub, _task) = Hub::spawn(64);
        let meeting_id = MeetingId::from(Uuid::new_v4());
        let deps = deps_with(hub.clone(), Arc::new(FailingMessages));

        let mut u1 = connect(meeting_id, "u1", deps.clone()).await;
        let mut u2 = connect(meeting_id, "u2", deps.clone()).await;

        u1.send_text("lost");

        let frame = u1.next_json().await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "failed to deliver message");
        u2.assert_silent().await;
    }

    #[tokio::test]
    async fn test_blank_and_oversized_messages_are_rejected_privately() {
        let (hub, _task) = Hub::spawn(64);
        let meeting_id = MeetingId::from(Uuid::new_v4());
        let deps = deps(hub.clone());
        let mut u1 = connect(meeting_id, "u1", deps.clone()).await;
        let mut u2 = connect(meeting_id, "u2", deps.clone()).await;

        u1.send_text("   ");
        let frame = u1.next_json().await;
        assert_eq!(frame["type"], "error");
        assert_eq!(
            frame["message"],
            "invalid argument message_content: cannot be empty"
        );

        u1.send_text(&"x".repeat(domain::MAX_MESSAGE_CHARS + 1));
        let frame = u1.next_json().await;
        assert_eq!(frame["message"], "invalid argument message_content: too long");
        u2.assert_silent().await;

        // 连接仍然可用
        u1.send_text("  padded  ");
        assert_eq!(u2.next_json().await["content"], "  padded  ");
    }

    #[tokio::test]
    async fn test_client_disconnect_removes_connection_once() {
        let (hub, _task) = Hub::spawn(64);
        let meeting_id = MeetingId::from(Uuid::new_v4());
        let deps = deps(hub.clone());

        let u1 = connect(meeting_id, "u1", deps.clone()).await;
        let mut u2 = connect(meeting_id, "u2", deps.clone()).await;
        wait_for_members(&hub, meeting_id, 2).await;

        let Client {
            to_server,
            from_server,
            connection,
        } = u1;
        drop(to_server);
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .expect("both pumps stop");
        drop(from_server);

        assert_eq!(hub.room_members(meeting_id).await.unwrap(), vec![u2.connection.id()]);

        u2.send_text("anyone?");
        assert_eq!(u2.next_json().await["content"], "anyone?");
    }

    #[tokio::test]
    async fn test_write_failure_tears_down_connection() {
        let (hub, _task) = Hub::spawn(64);
        let meeting_id = MeetingId::from(Uuid::new_v4());
        let deps = deps(hub.clone());

        let u1 = connect(meeting_id, "u1", deps.clone()).await;
        let u2 = connect(meeting_id, "u2", deps.clone()).await;

        // u1 的读取端消失，下一次写入失败
        let Client {
            to_server: _keep_open,
            from_server,
            connection,
        } = u1;
        drop(from_server);

        u2.send_text("ping");

        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .expect("both pumps stop after write failure");
        wait_for_members(&hub, meeting_id, 1).await;
    }

    #[tokio::test]
    async fn test_eviction_by_hub_closes_socket() {
        let (hub, _task) = Hub::spawn(64);
        let meeting_id = MeetingId::from(Uuid::new_v4());
        let mut u1 = connect(meeting_id, "u1", deps(hub.clone())).await;

        hub.leave(meeting_id, u1.connection.id()).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), u1.from_server.next())
            .await
            .expect("close frame in time");
        assert!(matches!(frame, Some(WsMessage::Close(None))));

        let Client { connection, .. } = u1;
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .expect("both pumps stop after eviction");
        assert!(hub.room_members(meeting_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_frame_ends_connection() {
        let (hub, _task) = Hub::spawn(64);
        let meeting_id = MeetingId::from(Uuid::new_v4());
        let u1 = connect(meeting_id, "u1", deps(hub.clone())).await;

        u1.to_server.unbounded_send(Ok(WsMessage::Close(None))).unwrap();

        let Client {
            connection,
            to_server: _to_server,
            from_server: _from_server,
        } = u1;
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .expect("both pumps stop after close frame");
        wait_for_members(&hub, meeting_id, 0).await;
    }

    #[tokio::test]
    async fn test_stalled_write_does_not_block_teardown() {
        let (hub, _task) = Hub::spawn(64);
        let meeting_id = MeetingId::from(Uuid::new_v4());
        let released = Arc::new(AtomicBool::new(false));
        let (to_server, server_stream) = unbounded::<Result<WsMessage, Infallible>>();
        let identity = ChatIdentity::new(UserId::from(Uuid::new_v4()), "u1", "");

        let connection = ChatConnection::admit(
            StalledSink {
                released: released.clone(),
            },
            server_stream,
            meeting_id,
            identity,
            deps(hub.clone()),
        )
        .await
        .unwrap();

        // 广播把帧交给发送泵后，写入一直挂起
        to_server
            .unbounded_send(Ok(WsMessage::Text("hi".to_owned().into())))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!released.load(Ordering::SeqCst));

        drop(to_server);

        tokio::time::timeout(Duration::from_secs(2), connection.closed())
            .await
            .expect("both pumps stop while the write is stalled");
        assert!(released.load(Ordering::SeqCst));
        wait_for_members(&hub, meeting_id, 0).await;
    }

    #[tokio::test]
    async fn test_disconnect_abandons_in_flight_save() {
        let (hub, _task) = Hub::spawn(64);
        let meeting_id = MeetingId::from(Uuid::new_v4());
        let u1 = connect(meeting_id, "u1", deps_with(hub.clone(), Arc::new(StalledMessages))).await;

        u1.send_text("never stored");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let Client {
            to_server,
            from_server: _from_server,
            connection,
        } = u1;
        drop(to_server);

        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .expect("in-flight save is abandoned on disconnect");
        wait_for_members(&hub, meeting_id, 0).await;
    }

    #[tokio::test]
    async fn test_eviction_abandons_in_flight_save() {
        let (hub, _task) = Hub::spawn(64);
        let meeting_id = MeetingId::from(Uuid::new_v4());
        let mut u1 =
            connect(meeting_id, "u1", deps_with(hub.clone(), Arc::new(StalledMessages))).await;

        u1.send_text("never stored");
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.leave(meeting_id, u1.connection.id()).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), u1.from_server.next())
            .await
            .expect("close frame in time");
        assert!(matches!(frame, Some(WsMessage::Close(None))));

        let Client {
            connection,
            to_server: _to_server,
            ..
        } = u1;
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .expect("in-flight save is abandoned on eviction");
        assert!(hub.room_members(meeting_id).await.unwrap().is_empty());
    }
}
