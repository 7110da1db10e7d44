//! # Tencent Cloud SOE (speaking oral evaluation) adapter
//!
//! Streams audio to `wss://{host}/soe/api/{app_id}` and turns the engine's JSON responses
//! into [`EngineListener`] callbacks.
//!
//! ## Request signing:
//! The query parameters are sorted by key and joined as `k=v&k=v` (raw values). The string
//! `{host}/soe/api/{app_id}?{query}` is signed with HMAC-SHA1 using the secret key, base64
//! encoded, and appended as `signature`. Values are URL-encoded only in the final URL.
//!
//! ## Response stream:
//! Every engine message is `{code, message, voice_id, final, result}`:
//! - the first message (`code == 0`) confirms the handshake
//! - `code != 0` at any time is a failure
//! - `final == 1` carries the final result
//! - anything else with a `result` is an intermediate result

use super::result::SentenceInfo;
use super::{
    AssessmentResult, EngineError, EngineHandle, EngineListener, EngineParams, RecognitionEngine,
};
use crate::config::SpeechConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type EngineSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type HmacSha1 = Hmac<Sha1>;

/// Text frame that tells the engine no more audio will follow.
const END_OF_INPUT: &str = r#"{"type":"end"}"#;

/// How long a signed request stays valid.
const SIGNATURE_TTL_SECS: i64 = 24 * 60 * 60;

/// One message from the engine.
#[derive(Debug, Deserialize)]
struct SoeResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    voice_id: String,
    #[serde(default, rename = "final")]
    final_flag: i64,
    #[serde(default)]
    result: Option<SentenceInfo>,
}

/// Engine factory holding the account credentials. Cheap to share behind an `Arc`.
pub struct SoeEngine {
    config: SpeechConfig,
}

impl SoeEngine {
    pub fn new(config: SpeechConfig) -> Self {
        Self { config }
    }

    fn query_params(&self, params: &EngineParams, now: i64) -> BTreeMap<&'static str, String> {
        let mut query = BTreeMap::new();
        query.insert("secretid", self.config.secret_id.clone());
        query.insert("timestamp", now.to_string());
        query.insert("expired", (now + SIGNATURE_TTL_SECS).to_string());
        query.insert("nonce", now.to_string());
        query.insert("voice_id", params.voice_id.clone());
        query.insert("voice_format", self.config.voice_format.to_string());
        query.insert("server_engine_type", params.server_engine_type.clone());
        query.insert("ref_text", params.ref_text.clone());
        query.insert("eval_mode", params.eval_mode.to_string());
        query.insert("text_mode", params.text_mode.to_string());
        query.insert("score_coeff", params.score_coeff.to_string());
        query.insert("sentence_info_enabled", "0".to_string());
        query.insert("rec_mode", "0".to_string());
        query
    }

    /// Base64 HMAC-SHA1 of `source` keyed with the secret key.
    fn sign(&self, source: &str) -> Result<String, EngineError> {
        let mut mac = HmacSha1::new_from_slice(self.config.secret_key.as_bytes())
            .map_err(|e| EngineError::Signing(e.to_string()))?;
        mac.update(source.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Build the signed `wss://` URL for one assessment.
    pub(crate) fn request_url(&self, params: &EngineParams, now: i64) -> Result<String, EngineError> {
        let query = self.query_params(params, now);
        let path = format!("{}/soe/api/{}", self.config.host, self.config.app_id);

        let raw_query = query
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&format!("{}?{}", path, raw_query))?;

        let encoded_query = query
            .iter()
            .map(|(key, value)| format!("{}={}", key, url_encode(value)))
            .collect::<Vec<_>>()
            .join("&");

        Ok(format!(
            "wss://{}?{}&signature={}",
            path,
            encoded_query,
            url_encode(&signature)
        ))
    }
}

fn url_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn parse_response(text: &str) -> Result<SoeResponse, EngineError> {
    serde_json::from_str(text).map_err(|e| EngineError::Protocol(format!("{}: {}", e, text)))
}

/// Wait for the next JSON message, skipping control and binary frames.
async fn next_response(stream: &mut SplitStream<EngineSocket>) -> Result<SoeResponse, EngineError> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => return parse_response(&text),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "no close frame".to_string());
                return Err(EngineError::Closed(reason));
            }
            Ok(_) => continue,
            Err(err) => return Err(EngineError::Connect(err.to_string())),
        }
    }
    Err(EngineError::Closed("connection ended during handshake".to_string()))
}

#[async_trait]
impl RecognitionEngine for SoeEngine {
    async fn start(
        &self,
        params: EngineParams,
        listener: Arc<dyn EngineListener>,
    ) -> Result<Box<dyn EngineHandle>, EngineError> {
        if !self.config.has_credentials() {
            return Err(EngineError::MissingCredentials);
        }

        let url = self.request_url(&params, chrono::Utc::now().timestamp())?;

        let handshake = async {
            let (socket, _) = connect_async(url.as_str())
                .await
                .map_err(|e| EngineError::Connect(e.to_string()))?;
            let (sink, mut stream) = socket.split();

            let first = next_response(&mut stream).await?;
            if first.code != 0 {
                return Err(EngineError::Rejected {
                    code: first.code,
                    message: first.message,
                });
            }
            Ok::<_, EngineError>((sink, stream, first.voice_id))
        };

        let (sink, stream, engine_voice_id) =
            tokio::time::timeout(self.config.connect_timeout(), handshake)
                .await
                .map_err(|_| EngineError::Timeout(self.config.connect_timeout_secs))??;

        info!(
            voice_id = %params.voice_id,
            engine_voice_id = %engine_voice_id,
            engine_type = %params.server_engine_type,
            eval_mode = params.eval_mode,
            "Engine session started"
        );
        listener.on_start(&params.voice_id).await;

        let reader = tokio::spawn(read_responses(stream, listener, params.voice_id.clone()));

        Ok(Box::new(SoeHandle {
            sink,
            reader: Some(reader),
            slice_size: self.config.slice_size,
            write_timeout: self.config.write_timeout(),
            stopped: false,
            voice_id: params.voice_id,
        }))
    }
}

/// Delivers engine messages to the listener until exactly one terminal callback was made.
async fn read_responses(
    mut stream: SplitStream<EngineSocket>,
    listener: Arc<dyn EngineListener>,
    voice_id: String,
) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "no close frame".to_string());
                listener
                    .on_fail(EngineError::Closed(format!("before final result: {}", reason)))
                    .await;
                return;
            }
            Ok(_) => continue,
            Err(err) => {
                listener.on_fail(EngineError::Closed(err.to_string())).await;
                return;
            }
        };

        let response = match parse_response(&text) {
            Ok(response) => response,
            Err(err) => {
                listener.on_fail(err).await;
                return;
            }
        };

        if response.code != 0 {
            warn!(voice_id = %voice_id, code = response.code, message = %response.message, "Engine reported failure");
            listener
                .on_fail(EngineError::Rejected {
                    code: response.code,
                    message: response.message,
                })
                .await;
            return;
        }

        if response.final_flag == 1 {
            let result: AssessmentResult = response.result.map(Into::into).unwrap_or_default();
            debug!(voice_id = %voice_id, overall_score = result.overall_score, "Engine final result");
            listener.on_complete(result).await;
            return;
        }

        if let Some(info) = response.result {
            listener.on_intermediate_result(info.into()).await;
        }
    }

    listener
        .on_fail(EngineError::Closed(
            "connection ended before final result".to_string(),
        ))
        .await;
}

/// Write side of one engine session.
///
/// Every send is bounded by `write_timeout`: callers hold the session's engine lock while
/// writing, so a stalled engine connection must not block them indefinitely.
pub struct SoeHandle {
    sink: SplitSink<EngineSocket, Message>,
    reader: Option<JoinHandle<()>>,
    slice_size: usize,
    write_timeout: Duration,
    stopped: bool,
    voice_id: String,
}

impl SoeHandle {
    async fn send_bounded(&mut self, message: Message) -> Result<(), EngineError> {
        match tokio::time::timeout(self.write_timeout, self.sink.send(message)).await {
            Ok(sent) => sent.map_err(|e| EngineError::Write(e.to_string())),
            Err(_) => Err(EngineError::Timeout(self.write_timeout.as_secs())),
        }
    }
}

#[async_trait]
impl EngineHandle for SoeHandle {
    async fn write_audio(&mut self, audio: &[u8]) -> Result<(), EngineError> {
        if self.stopped {
            return Err(EngineError::Stopped);
        }

        let slice = if self.slice_size == 0 { audio.len().max(1) } else { self.slice_size };
        for chunk in audio.chunks(slice) {
            self.send_bounded(Message::Binary(chunk.to_vec())).await?;
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Err(err) = self.send_bounded(Message::Text(END_OF_INPUT.to_string())).await {
            debug!(voice_id = %self.voice_id, error = %err, "End-of-input not delivered to engine");
        }
    }
}

impl Drop for SoeHandle {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn engine() -> SoeEngine {
        SoeEngine::new(SpeechConfig {
            app_id: "1300000000".to_string(),
            secret_id: "AKIDexample".to_string(),
            secret_key: "secret".to_string(),
            host: "soe.cloud.tencent.com".to_string(),
            voice_format: 1,
            slice_size: 0,
            connect_timeout_secs: 5,
            write_timeout_secs: 5,
        })
    }

    fn params(ref_text: &str) -> EngineParams {
        EngineParams {
            voice_id: "voice-1".to_string(),
            ref_text: ref_text.to_string(),
            server_engine_type: "16k_en".to_string(),
            score_coeff: 1.1,
            eval_mode: 1,
            text_mode: 0,
        }
    }

    #[test]
    fn test_request_url_is_sorted_encoded_and_signed() {
        let engine = engine();
        let url = engine.request_url(&params("The cat sat."), 1_700_000_000).unwrap();

        assert!(url.starts_with("wss://soe.cloud.tencent.com/soe/api/1300000000?eval_mode=1&expired=1700086400&nonce="));
        assert!(url.contains("&ref_text=The+cat+sat.&"));
        assert!(url.contains("&score_coeff=1.1&"));
        assert!(url.contains("&voice_format=1&voice_id=voice-1&signature="));

        let raw_query = engine
            .query_params(&params("The cat sat."), 1_700_000_000)
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let mut mac = HmacSha1::new_from_slice(b"secret").unwrap();
        mac.update(format!("soe.cloud.tencent.com/soe/api/1300000000?{}", raw_query).as_bytes());
        let expected = STANDARD.encode(mac.finalize().into_bytes());

        assert!(url.ends_with(&format!("&signature={}", url_encode(&expected))));
    }

    #[test]
    fn test_parse_final_and_failure_responses() {
        let final_msg = r#"{"code":0,"message":"success","voice_id":"v","final":1,
            "result":{"SuggestedScore":72.5,"PronAccuracy":80.0,"PronFluency":0.9,"PronCompletion":1.0,"Words":[]}}"#;
        let response = parse_response(final_msg).unwrap();
        assert_eq!(response.final_flag, 1);
        assert_eq!(response.result.unwrap().suggested_score, 72.5);

        let failure = r#"{"code":4002,"message":"signature mismatch","voice_id":"v"}"#;
        let response = parse_response(failure).unwrap();
        assert_eq!(response.code, 4002);
        assert!(response.result.is_none());

        assert!(matches!(parse_response("not json"), Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_start_without_credentials_fails_fast() {
        struct Silent;
        #[async_trait]
        impl EngineListener for Silent {
            async fn on_start(&self, _voice_id: &str) {}
            async fn on_intermediate_result(&self, _result: AssessmentResult) {}
            async fn on_complete(&self, _result: AssessmentResult) {}
            async fn on_fail(&self, _error: EngineError) {}
        }

        let engine = SoeEngine::new(crate::config::AppConfig::default().speech);
        let outcome = engine.start(params("cat"), Arc::new(Silent)).await;
        assert!(matches!(outcome, Err(EngineError::MissingCredentials)));
    }

    /// Records every callback as one line.
    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EngineListener for RecordingListener {
        async fn on_start(&self, voice_id: &str) {
            self.push(format!("start {}", voice_id));
        }
        async fn on_intermediate_result(&self, result: AssessmentResult) {
            self.push(format!("intermediate {}", result.overall_score));
        }
        async fn on_complete(&self, result: AssessmentResult) {
            self.push(format!("complete {}", result.overall_score));
        }
        async fn on_fail(&self, error: EngineError) {
            self.push(format!("fail {}", error));
        }
    }

    const HANDSHAKE: &str = r#"{"code":0,"message":"success","voice_id":"v","final":0}"#;
    const PARTIAL: &str = r#"{"code":0,"voice_id":"v","final":0,
        "result":{"SuggestedScore":60.0,"PronAccuracy":61.0,"PronFluency":0.5,"PronCompletion":0.5,"Words":[]}}"#;
    const FINAL: &str = r#"{"code":0,"voice_id":"v","final":1,
        "result":{"SuggestedScore":72.5,"PronAccuracy":80.0,"PronFluency":0.9,"PronCompletion":1.0,"Words":[]}}"#;

    /// Local engine stand-in: sends `replies`, optionally closes, then idles until the
    /// client goes away.
    async fn scripted_engine(replies: Vec<&'static str>, close_after: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            for reply in replies {
                if ws.send(Message::Text(reply.to_string())).await.is_err() {
                    return;
                }
            }
            if close_after {
                let _ = ws.close(None).await;
            }
            while let Some(Ok(_)) = ws.next().await {}
        });

        format!("ws://{}", addr)
    }

    async fn deliver(replies: Vec<&'static str>, close_after: bool) -> Vec<String> {
        let url = scripted_engine(replies, close_after).await;
        let (socket, _) = connect_async(url.as_str()).await.unwrap();
        let (_sink, stream) = socket.split();

        let listener = Arc::new(RecordingListener::default());
        tokio::time::timeout(
            Duration::from_secs(5),
            read_responses(stream, listener.clone(), "voice-1".to_string()),
        )
        .await
        .expect("response reader did not finish");
        listener.events()
    }

    #[tokio::test]
    async fn test_intermediate_then_final_result() {
        let events = deliver(vec![HANDSHAKE, PARTIAL, FINAL, PARTIAL], false).await;
        assert_eq!(events, vec!["intermediate 60", "complete 72.5"]);
    }

    #[tokio::test]
    async fn test_error_code_is_the_only_callback() {
        let failure = r#"{"code":4002,"message":"signature mismatch","voice_id":"v"}"#;
        let events = deliver(vec![failure, FINAL], false).await;
        assert_eq!(
            events,
            vec!["fail engine rejected request (code 4002): signature mismatch"]
        );
    }

    #[tokio::test]
    async fn test_close_before_final_result_fails_once() {
        let events = deliver(vec![PARTIAL], true).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], "intermediate 60");
        assert!(events[1].starts_with("fail engine connection closed"));
    }

    #[tokio::test]
    async fn test_unparseable_response_fails() {
        let events = deliver(vec!["<html>bad gateway</html>"], false).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("fail unexpected engine response"));
    }

    #[tokio::test]
    async fn test_stalled_engine_write_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            // Handshake, then never read again.
            let ws = accept_async(tcp).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(ws);
        });

        let (socket, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let (sink, _stream) = socket.split();
        let mut handle = SoeHandle {
            sink,
            reader: None,
            slice_size: 0,
            write_timeout: Duration::from_millis(200),
            stopped: false,
            voice_id: "voice-1".to_string(),
        };

        // Far more than the loopback socket buffers can absorb.
        let audio = vec![0u8; 32 * 1024 * 1024];
        let written = tokio::time::timeout(Duration::from_secs(5), handle.write_audio(&audio))
            .await
            .expect("write was not bounded");
        assert!(matches!(written, Err(EngineError::Timeout(_))));

        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop was not bounded");
        assert_eq!(handle.write_audio(&[0, 0]).await, Err(EngineError::Stopped));
    }
}
