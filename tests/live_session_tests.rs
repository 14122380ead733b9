//! End-to-end tests against a local WebSocket server speaking the
//! BidiGenerateContent framing.

use futures_util::{SinkExt, StreamExt};
use gemini_live_conversation::audio::{
    AudioDevices, AudioOutput, CaptureSource, CapturedChunk, FrameSink, PlaybackChunk, SourceId,
};
use gemini_live_conversation::tools::{WeatherLookup, get_weather_declaration};
use gemini_live_conversation::{
    LiveClientBuilder, LiveConversation, LiveError, LiveSessionSettings, ServerEvent,
    SessionStatus, StaticCredentials, ToolRegistry,
};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

const WAIT: Duration = Duration::from_secs(5);

fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

enum Outbound {
    Json(Value),
    Close(u16),
}

struct MockServer {
    addr: SocketAddr,
    to_client: mpsc::Sender<Outbound>,
    from_client: mpsc::Receiver<Value>,
}

impl MockServer {
    fn endpoint(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn send(&self, message: Value) {
        self.to_client.send(Outbound::Json(message)).await.unwrap();
    }

    async fn close(&self, code: u16) {
        self.to_client.send(Outbound::Close(code)).await.unwrap();
    }

    async fn next_from_client(&mut self) -> Value {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("client sent nothing")
            .expect("server task ended")
    }
}

/// Accepts one connection. Every client frame is forwarded to the test; the
/// setup frame is acknowledged when `ack_setup` is set.
async fn mock_server(ack_setup: bool) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (to_client, mut outbound) = mpsc::channel::<Outbound>(16);
    let (inbound, from_client) = mpsc::channel::<Value>(16);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        loop {
            tokio::select! {
                frame = ws.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text.to_string(),
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => continue,
                    };
                    let value: Value = serde_json::from_str(&text).unwrap();
                    let is_setup = value.get("setup").is_some();
                    let _ = inbound.send(value).await;
                    if is_setup && ack_setup {
                        let ack = json!({"setupComplete": {}}).to_string();
                        ws.send(Message::Text(ack.into())).await.unwrap();
                    }
                }
                out = outbound.recv() => match out {
                    Some(Outbound::Json(value)) => {
                        ws.send(Message::Text(value.to_string().into())).await.unwrap();
                    }
                    Some(Outbound::Close(code)) => {
                        let _ = ws
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: "test close".into(),
                            })))
                            .await;
                    }
                    None => break,
                },
            }
        }
    });

    MockServer {
        addr,
        to_client,
        from_client,
    }
}

fn api_key() -> SecretString {
    SecretString::from("test-key".to_string())
}

async fn next_event(events: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("no event arrived")
        .expect("event stream ended")
}

#[tokio::test]
async fn test_setup_handshake_and_event_stream() {
    init_logger();
    let mut server = mock_server(true).await;

    let (mut client, mut events) = LiveClientBuilder::new(api_key(), "gemini-test")
        .voice("Zephyr")
        .input_audio_transcription(true)
        .endpoint(server.endpoint())
        .connect()
        .await
        .unwrap();

    let setup = server.next_from_client().await;
    assert_eq!(setup["setup"]["model"], "models/gemini-test");
    assert_eq!(
        setup["setup"]["generationConfig"]["responseModalities"],
        json!(["AUDIO"])
    );
    assert!(setup["setup"]["inputAudioTranscription"].is_object());

    server
        .send(json!({
            "serverContent": {
                "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAAAA=="}}]},
                "outputTranscription": {"text": "Hi"}
            }
        }))
        .await;
    server
        .send(json!({"serverContent": {"turnComplete": true}}))
        .await;

    match next_event(&mut events).await {
        ServerEvent::Audio(blob) => {
            let chunk = PlaybackChunk::from_blob(&blob).unwrap();
            assert_eq!(chunk.sample_rate, 24000);
            assert_eq!(chunk.frame_count(), 2);
        }
        other => panic!("Expected audio, got {:?}", other),
    }
    assert_eq!(
        next_event(&mut events).await,
        ServerEvent::OutputTranscription("Hi".into())
    );
    assert_eq!(next_event(&mut events).await, ServerEvent::TurnComplete);

    client
        .send_audio_chunk(&CapturedChunk::new(vec![0.0; 160]))
        .await
        .unwrap();
    let realtime = server.next_from_client().await;
    assert_eq!(
        realtime["realtimeInput"]["audio"]["mimeType"],
        "audio/pcm;rate=16000"
    );

    client.close();
}

#[tokio::test]
async fn test_remote_close_code_is_reported() {
    init_logger();
    let server = mock_server(true).await;
    let (_client, mut events) = LiveClientBuilder::new(api_key(), "gemini-test")
        .endpoint(server.endpoint())
        .connect()
        .await
        .unwrap();

    server.close(1011).await;
    match next_event(&mut events).await {
        ServerEvent::Closed { code, .. } => assert_eq!(code, Some(1011)),
        other => panic!("Expected close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unacknowledged_setup_times_out() {
    init_logger();
    let server = mock_server(false).await;
    let result = LiveClientBuilder::new(api_key(), "gemini-test")
        .endpoint(server.endpoint())
        .setup_timeout(Duration::from_millis(200))
        .connect()
        .await;
    match result {
        Err(LiveError::Connection(msg)) => assert!(msg.contains("setupComplete")),
        Err(other) => panic!("Expected connection error, got {:?}", other),
        Ok(_) => panic!("Expected connection error, got a session"),
    }
}

#[derive(Default)]
struct SilentMicrophone {
    sink: Arc<Mutex<Option<FrameSink>>>,
}

impl CaptureSource for SilentMicrophone {
    fn acquire(&mut self) -> Result<(), LiveError> {
        Ok(())
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), LiveError> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), LiveError> {
        self.sink.lock().unwrap().take();
        Ok(())
    }
}

struct DiscardingOutput;

impl AudioOutput for DiscardingOutput {
    fn current_time(&self) -> f64 {
        0.0
    }

    fn start(&mut self, _id: SourceId, _chunk: &PlaybackChunk, _at: f64) -> Result<(), LiveError> {
        Ok(())
    }

    fn stop(&mut self, _id: SourceId) -> Result<(), LiveError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), LiveError> {
        Ok(())
    }
}

struct TestDevices;

impl AudioDevices for TestDevices {
    fn open_capture(&self) -> Result<Box<dyn CaptureSource>, LiveError> {
        Ok(Box::new(SilentMicrophone::default()))
    }

    fn open_output(
        &self,
        _ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn AudioOutput>, LiveError> {
        Ok(Box::new(DiscardingOutput))
    }
}

async fn poll(conversation: &mut LiveConversation) -> bool {
    timeout(WAIT, conversation.poll_once())
        .await
        .expect("conversation did not wake up")
}

#[tokio::test]
async fn test_conversation_answers_a_function_call() {
    init_logger();
    let mut server = mock_server(true).await;

    let settings = LiveSessionSettings {
        endpoint: server.endpoint(),
        ..Default::default()
    };
    let mut tools = ToolRegistry::new();
    tools.register(
        get_weather_declaration(),
        WeatherLookup::with_latency(Duration::ZERO),
    );
    let mut conversation = LiveConversation::new(
        settings,
        Arc::new(TestDevices),
        Arc::new(StaticCredentials(api_key())),
        tools,
    );

    conversation.start().unwrap();
    assert!(poll(&mut conversation).await);
    assert_eq!(conversation.status(), SessionStatus::Active);

    let setup = server.next_from_client().await;
    assert_eq!(
        setup["setup"]["tools"][0]["functionDeclarations"][0]["name"],
        "getWeather"
    );

    server
        .send(json!({
            "toolCall": {"functionCalls": [
                {"id": "call-1", "name": "getWeather", "args": {"location": "Tokyo"}}
            ]}
        }))
        .await;
    assert!(poll(&mut conversation).await);
    assert_eq!(conversation.tool_status(), Some("Function call received..."));
    assert!(poll(&mut conversation).await);

    let response = server.next_from_client().await;
    let responses = &response["toolResponse"]["functionResponses"];
    assert_eq!(responses.as_array().unwrap().len(), 1);
    assert_eq!(responses[0]["id"], "call-1");
    assert!(
        responses[0]["response"]["result"]
            .as_str()
            .unwrap()
            .contains("Tokyo")
    );

    server.close(1000).await;
    assert!(!poll(&mut conversation).await);
    assert_eq!(conversation.status(), SessionStatus::Inactive);
    assert_eq!(
        conversation.error(),
        Some("Live session closed unexpectedly: Code 1000")
    );
}
