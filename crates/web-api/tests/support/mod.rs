use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{
    meeting_event_channel, ChatService, ChatServiceDependencies, Hub, MeetingEventWorker,
    MeetingService, MeetingServiceDependencies, SystemClock,
};
use config::{ChatConfig, JwtConfig};
use domain::{ChatIdentity, Meeting, MeetingId, UserId};
use infrastructure::InMemoryStore;
use tokio::{net::TcpListener, sync::oneshot, time::sleep};
use uuid::Uuid;
use web_api::{router, AppState, JwtService};

/// 运行在随机端口上的完整服务，使用内存存储
pub struct TestApp {
    pub addr: SocketAddr,
    pub store: InMemoryStore,
    pub jwt: Arc<JwtService>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestApp {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws(&self, meeting_id: MeetingId, user_id: UserId) -> String {
        let token = self.token(user_id);
        format!(
            "ws://{}/api/v1/ws/meetings/{}?token={}",
            self.addr, meeting_id, token
        )
    }

    pub fn token(&self, user_id: UserId) -> String {
        self.jwt.generate_token(user_id).expect("token")
    }

    pub fn user(&self, nickname: &str) -> UserId {
        let identity = ChatIdentity::new(
            UserId::from(Uuid::new_v4()),
            nickname,
            format!("https://cdn.example.com/{nickname}.png"),
        );
        let user_id = identity.user_id;
        self.store.insert_user(identity);
        user_id
    }

    pub fn meeting(&self, host: UserId, participants: &[UserId], capacity: u32) -> MeetingId {
        let mut participant_ids = vec![host];
        participant_ids.extend_from_slice(participants);
        let meeting = Meeting {
            id: MeetingId::from(Uuid::new_v4()),
            host_id: host,
            max_participants: capacity,
            participant_ids,
        };
        let meeting_id = meeting.id;
        self.store.insert_meeting(meeting);
        meeting_id
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub async fn spawn_app() -> TestApp {
    let store = InMemoryStore::new();
    let shared = Arc::new(store.clone());
    let chat_config = ChatConfig::default();

    let (hub, _hub_task) = Hub::spawn(chat_config.hub_queue_capacity);
    let (publisher, events) = meeting_event_channel(chat_config.event_channel_capacity);

    let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
        message_repository: shared.clone(),
        meeting_repository: shared.clone(),
        user_repository: shared.clone(),
        clock: Arc::new(SystemClock),
    }));
    let meeting_service = Arc::new(MeetingService::new(MeetingServiceDependencies {
        meeting_repository: shared.clone(),
        publisher,
    }));
    tokio::spawn(MeetingEventWorker::new(events, chat_service.clone(), hub.clone()).run());

    let jwt = Arc::new(JwtService::new(JwtConfig {
        secret: "integration-secret-key-at-least-32-chars".to_string(),
        expiration_hours: 1,
    }));
    let state = AppState::new(
        chat_service,
        meeting_service,
        shared,
        hub,
        jwt.clone(),
        chat_config,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(state);

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    // allow server to start
    sleep(Duration::from_millis(50)).await;

    TestApp {
        addr,
        store,
        jwt,
        shutdown: Some(shutdown_tx),
    }
}
