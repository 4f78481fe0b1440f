use std::sync::Arc;
use std::time::Duration;

use tutor_rtc::config::Config;
use tutor_rtc::peer::ice::{HttpIceProvider, IceConfigProvider, StaticIceProvider};
use tutor_rtc::peer::PeerTransport;
use tutor_rtc::signaling::{MemoryStore, SignalingStore};
use tutor_rtc::testing::{FakeDevices, FakeEncoder, FlakyStore, LoopbackNetwork};
use tutor_rtc::{
    CallDeps, CallError, CallEvent, ConnectionState, EventStream, MediaError, Session,
    SignalingError, VideoCall,
};
use url::Url;

const WAIT: Duration = Duration::from_secs(2);

struct Party {
    call: VideoCall,
    devices: Arc<FakeDevices>,
    encoder: Arc<FakeEncoder>,
    events: EventStream,
}

struct Lesson {
    session: Session,
    store: Arc<dyn SignalingStore>,
    network: LoopbackNetwork,
    ice: Arc<dyn IceConfigProvider>,
}

impl Lesson {
    fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    fn with_store(store: Arc<dyn SignalingStore>) -> Self {
        Self {
            session: Session::new("lesson-42", "tutor", "student"),
            store,
            network: LoopbackNetwork::new(),
            ice: Arc::new(StaticIceProvider::default()),
        }
    }

    fn join(&self, who: &str, devices: FakeDevices) -> Party {
        let devices = Arc::new(devices);
        let encoder = Arc::new(FakeEncoder::new());
        let deps = CallDeps {
            store: self.store.clone(),
            ice: self.ice.clone(),
            peers: self.network.factory(),
            devices: devices.clone(),
            encoder: encoder.clone(),
            config: Config {
                recordings_dir: std::env::temp_dir().join("tutor-rtc-scenarios"),
                ..Config::default()
            },
        };
        let call = VideoCall::new(deps, &self.session, who.into()).expect("member");
        let events = call.take_events().expect("events");
        Party {
            call,
            devices,
            encoder,
            events,
        }
    }
}

async fn incoming_offer(party: &Party) {
    tokio::time::timeout(WAIT, async {
        while !party.call.has_incoming_offer().await {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("offer never arrived");
}

async fn connected(party: &Party) {
    tokio::time::timeout(WAIT, party.call.connected())
        .await
        .expect("timed out")
        .expect("connection");
}

fn drain(events: &mut EventStream) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn connect_pair(lesson: &Lesson, tutor: FakeDevices, student: FakeDevices) -> (Party, Party) {
    let tutor = lesson.join("tutor", tutor);
    let student = lesson.join("student", student);
    student.call.listen().await.expect("listen");
    tutor.call.start_call().await.expect("start");
    incoming_offer(&student).await;
    student.call.answer_call().await.expect("answer");
    connected(&tutor).await;
    connected(&student).await;
    (tutor, student)
}

#[tokio::test]
async fn both_sides_connect_and_receive_media() {
    let lesson = Lesson::new();
    let (tutor, student) = connect_pair(&lesson, FakeDevices::new(), FakeDevices::new()).await;

    for party in [&tutor, &student] {
        assert_eq!(party.call.connection_state(), ConnectionState::Connected);
        let remote = party.call.remote_stream().await.expect("remote stream");
        assert_eq!(remote.audio_tracks().count(), 1);
        assert_eq!(remote.video_tracks().count(), 1);
    }
}

#[tokio::test]
async fn callee_opening_after_the_offer_still_answers() {
    let lesson = Lesson::new();
    let tutor = lesson.join("tutor", FakeDevices::new());
    tutor.call.start_call().await.expect("start");

    let mut student = lesson.join("student", FakeDevices::new());
    student.call.listen().await.expect("listen");
    incoming_offer(&student).await;
    assert!(drain(&mut student.events).contains(&CallEvent::IncomingOffer));
    student.call.answer_call().await.expect("answer");
    connected(&tutor).await;
}

#[tokio::test]
async fn caller_without_camera_falls_back_to_audio_only() {
    let lesson = Lesson::new();
    let (tutor, student) =
        connect_pair(&lesson, FakeDevices::new().without_camera(), FakeDevices::new()).await;

    let local = tutor.call.local_stream().await.expect("local stream");
    assert_eq!(local.audio_tracks().count(), 1);
    assert!(!local.has_video());
    assert!(!tutor.call.is_video_enabled().await);

    let seen_by_student = student.call.remote_stream().await.expect("remote");
    assert!(!seen_by_student.has_video());
    assert_eq!(seen_by_student.audio_tracks().count(), 1);
}

#[tokio::test]
async fn unreachable_credential_service_degrades_to_public_stun() {
    let endpoint = Url::parse("http://127.0.0.1:9/functions/v1/turn").expect("url");
    let provider = HttpIceProvider::new(
        endpoint,
        Some("key".into()),
        Duration::from_millis(500),
        "stun:stun.l.google.com:19302".into(),
    );
    let servers = provider.ice_servers().await;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
    assert!(!servers[0].is_turn());

    let mut lesson = Lesson::new();
    lesson.ice = Arc::new(provider) as Arc<dyn IceConfigProvider>;
    let tutor = lesson.join("tutor", FakeDevices::new());
    tutor.call.start_call().await.expect("call setup proceeds");
    let seen = lesson.network.ice_servers_seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].len(), 1);
}

#[tokio::test]
async fn unanswered_call_ends_and_releases_media() {
    let lesson = Lesson::new();
    let mut tutor = lesson.join("tutor", FakeDevices::new());
    tutor.call.start_call().await.expect("start");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        tutor.call.connection_state(),
        ConnectionState::New | ConnectionState::Connecting
    ));
    assert_eq!(tutor.devices.issued_tracks(), 2);

    tutor.call.end_call().await;
    assert_eq!(tutor.devices.stopped_tracks(), tutor.devices.issued_tracks());
    assert_eq!(tutor.call.connection_state(), ConnectionState::Closed);
    assert!(tutor.call.local_stream().await.is_none());
    assert!(lesson
        .network
        .peers()
        .iter()
        .all(|p| p.connection_state() == ConnectionState::Closed));
    assert!(drain(&mut tutor.events).contains(&CallEvent::Ended));
}

#[tokio::test]
async fn publish_failure_tears_down_and_allows_retry() {
    let flaky = Arc::new(FlakyStore::new(MemoryStore::new()));
    let lesson = Lesson::with_store(flaky.clone());
    let tutor = lesson.join("tutor", FakeDevices::new());

    flaky.fail_appends(true);
    let err = tutor.call.start_call().await.expect_err("publish fails");
    assert!(matches!(err, CallError::Signaling(SignalingError::Publish(_))));
    assert_eq!(tutor.devices.stopped_tracks(), tutor.devices.issued_tracks());
    assert_eq!(flaky.inner().listener_count(&lesson.session.id), 0);
    assert!(lesson
        .network
        .peers()
        .iter()
        .all(|p| p.connection_state() == ConnectionState::Closed));

    flaky.fail_appends(false);
    tutor.call.start_call().await.expect("retry");
    assert_eq!(flaky.inner().listener_count(&lesson.session.id), 1);
}

#[tokio::test]
async fn denied_permission_blocks_setup() {
    let lesson = Lesson::new();
    let tutor = lesson.join("tutor", FakeDevices::new().deny_permission());
    let err = tutor.call.start_call().await.expect_err("denied");
    assert!(matches!(err, CallError::Media(MediaError::PermissionDenied)));
    assert!(lesson.network.peers().is_empty());
}

#[tokio::test]
async fn screen_share_swaps_track_without_renegotiating() {
    let lesson = Lesson::new();
    let (mut tutor, _student) = connect_pair(&lesson, FakeDevices::new(), FakeDevices::new()).await;
    let peer = lesson
        .network
        .peers()
        .into_iter()
        .find(|p| !p.is_answerer())
        .expect("tutor peer");
    let camera = peer.outbound_video().expect("camera sender");
    let history_before = peer.state_history().len();

    tutor.call.start_screen_share().await.expect("share");
    assert!(tutor.call.is_screen_sharing().await);
    let screen = tutor.call.screen_stream().await.expect("screen");
    let screen_id = screen.video_track().map(|t| t.id().to_string());
    assert_eq!(peer.outbound_video(), screen_id);

    tutor.call.stop_screen_share().await.expect("stop");
    assert!(!tutor.call.is_screen_sharing().await);
    assert_eq!(peer.outbound_video().as_deref(), Some(camera.as_str()));
    assert_eq!(peer.replacements(), 2);
    assert_eq!(peer.state_history().len(), history_before);
    assert_eq!(tutor.call.connection_state(), ConnectionState::Connected);

    let events = drain(&mut tutor.events);
    assert!(events.contains(&CallEvent::ScreenShare(true)));
    assert!(events.contains(&CallEvent::ScreenShare(false)));
    assert!(!events.contains(&CallEvent::ConnectionState(ConnectionState::Closed)));
    assert!(!events.contains(&CallEvent::ConnectionState(ConnectionState::New)));
}

#[tokio::test]
async fn ending_the_share_from_the_platform_restores_the_camera() {
    let lesson = Lesson::new();
    let (tutor, _student) = connect_pair(&lesson, FakeDevices::new(), FakeDevices::new()).await;
    let peer = lesson
        .network
        .peers()
        .into_iter()
        .find(|p| !p.is_answerer())
        .expect("tutor peer");
    let camera = peer.outbound_video();

    tutor.call.start_screen_share().await.expect("share");
    assert!(tutor.devices.end_screen_share());
    tokio::time::timeout(WAIT, async {
        while tutor.call.is_screen_sharing().await {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("camera fallback");
    assert_eq!(peer.outbound_video(), camera);
    assert_eq!(tutor.call.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn recording_is_saved_when_the_call_ends() {
    let lesson = Lesson::new();
    let (mut tutor, _student) = connect_pair(&lesson, FakeDevices::new(), FakeDevices::new()).await;

    assert!(tutor.call.start_recording().await);
    assert!(tutor.call.start_recording().await);
    assert!(tutor.call.is_recording().await);
    tutor.call.end_call().await;
    assert!(!tutor.call.is_recording().await);
    // local and remote tracks were stopped before the recorder
    assert_eq!(tutor.encoder.live_tracks_at_stop(), Some(0));

    let saved = drain(&mut tutor.events).into_iter().find_map(|e| match e {
        CallEvent::RecordingSaved(path) => Some(path),
        _ => None,
    });
    let path = saved.expect("recording saved");
    assert!(path.exists());
    let _ = tokio::fs::remove_file(&path).await;
}

#[tokio::test]
async fn dropping_the_call_releases_devices() {
    let lesson = Lesson::new();
    let devices = {
        let tutor = lesson.join("tutor", FakeDevices::new());
        tutor.call.start_call().await.expect("start");
        tutor.devices.clone()
    };
    assert_eq!(devices.issued_tracks(), 2);
    assert_eq!(devices.stopped_tracks(), 2);
}
