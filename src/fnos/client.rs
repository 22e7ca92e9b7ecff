//! WebSocket client for the fnOS main channel
//!
//! One [`FnosClient`] is one connection: it owns the per-connection AES key
//! and IV, tracks the request counter, and after login holds the signing key
//! used for every further request.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::core::config::Settings;
use crate::error::{FnosError, Result};
use crate::fnos::crypto;
use crate::fnos::error_handler::classify_reply;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// `backId` used before the server assigns one
const DEFAULT_BACK_ID: &str = "0000000000000000";

/// Requests whose body is wrapped with RSA + AES before sending
const ENCRYPTED_REQUESTS: &[&str] = &["user.login"];

/// Session details returned by `user.login`
#[derive(Debug)]
pub struct LoginReply {
    pub token: SecretString,
    pub uid: Option<i64>,
    pub admin: bool,
    pub has_long_token: bool,
}

/// A live connection to an fnOS server
pub struct FnosClient {
    sink: WsSink,
    source: WsSource,
    timeout: Duration,
    aes_key: String,
    iv: [u8; 16],
    back_id: String,
    sign_key: Option<String>,
    pub_key: Option<String>,
    si: Option<Value>,
    counter: u16,
}

impl FnosClient {
    /// Open the main WebSocket channel of `server`
    pub async fn connect(server: &str, settings: &Settings) -> Result<Self> {
        let scheme = if settings.use_ssl { "wss" } else { "ws" };
        let url = format!("{}://{}/websocket?type=main", scheme, server);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| FnosError::InvalidInput(format!("Invalid server '{}': {}", server, e)))?;

        if settings.use_ssl && !settings.fn_connect_cookie.is_empty() {
            let cookie = HeaderValue::from_str(&settings.fn_connect_cookie).map_err(|_| {
                FnosError::Config("fn_connect_cookie is not a valid header value".into())
            })?;
            request.headers_mut().insert("Cookie", cookie);
        }

        debug!(url = %url, "connecting to fnOS");
        let (stream, _) = timeout(settings.timeout(), connect_async(request))
            .await
            .map_err(|_| FnosError::NetworkTimeout(format!("connecting to {} timed out", server)))??;

        let (sink, source) = stream.split();
        Ok(Self {
            sink,
            source,
            timeout: settings.timeout(),
            aes_key: crypto::random_aes_key(),
            iv: crypto::random_iv(),
            back_id: DEFAULT_BACK_ID.to_string(),
            sign_key: None,
            pub_key: None,
            si: None,
            counter: 0,
        })
    }

    fn next_reqid(&mut self) -> String {
        self.counter = self.counter.wrapping_add(1);
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        format!("{:08x}{}{:04x}", secs, self.back_id, self.counter)
    }

    /// Send `req` with `params` and wait for the reply carrying its `reqid`
    ///
    /// Replies with `errno` are returned as-is; callers classify them.
    pub async fn request(&mut self, req: &str, params: Value) -> Result<Value> {
        let reqid = self.next_reqid();

        let mut body = Map::new();
        body.insert("req".into(), Value::from(req));
        body.insert("reqid".into(), Value::from(reqid.as_str()));
        if let Value::Object(extra) = params {
            body.extend(extra);
        }
        let mut payload = Value::Object(body);

        if ENCRYPTED_REQUESTS.contains(&req) {
            let pub_key = self
                .pub_key
                .as_deref()
                .ok_or_else(|| FnosError::ProtocolMismatch("no RSA public key".into()))?;
            let json = serde_json::to_string(&payload)?;
            payload = crypto::encrypt_login_request(&json, pub_key, &self.aes_key, &self.iv)?;
        }

        let message = crypto::sign_request(&payload, self.sign_key.as_deref())?;
        self.sink.send(Message::Text(message)).await?;
        debug!(req, reqid = %reqid, "sent request");

        timeout(self.timeout, self.wait_for(&reqid))
            .await
            .map_err(|_| FnosError::NetworkTimeout(format!("request {} timed out", req)))?
    }

    async fn wait_for(&mut self, reqid: &str) -> Result<Value> {
        while let Some(message) = self.source.next().await {
            let text = match message? {
                Message::Text(text) => text.to_string(),
                Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
                Message::Close(_) => break,
                _ => continue,
            };

            let reply: Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "ignoring malformed message from server");
                    continue;
                }
            };

            if reply.get("reqid").and_then(Value::as_str) == Some(reqid) {
                return Ok(reply);
            }
            debug!("skipping unrelated message");
        }

        Err(FnosError::NetworkTimeout("connection closed by server".into()))
    }

    /// Fetch the server's RSA key and session identifier
    pub async fn get_rsa_pub(&mut self) -> Result<()> {
        let reply = self.request("util.crypto.getRSAPub", json!({})).await?;
        if let Some(err) = classify_reply("util.crypto.getRSAPub", &reply) {
            return Err(err);
        }

        let pub_key = reply
            .get("pub")
            .and_then(Value::as_str)
            .ok_or_else(|| FnosError::ProtocolMismatch("getRSAPub reply has no key".into()))?;
        self.pub_key = Some(pub_key.to_string());
        self.si = reply.get("si").cloned();
        Ok(())
    }

    /// Log in with a password, keeping the signing key for later requests
    pub async fn login(
        &mut self,
        username: &str,
        password: &SecretString,
        settings: &Settings,
    ) -> Result<LoginReply> {
        if self.pub_key.is_none() {
            self.get_rsa_pub().await?;
        }

        let params = json!({
            "user": username,
            "password": password.expose_secret(),
            "stay": true,
            "deviceType": settings.device_type,
            "deviceName": settings.device_name,
            "si": self.si.clone().unwrap_or(Value::Null),
        });
        let reply = self.request("user.login", params).await?;
        if let Some(err) = classify_reply("user.login", &reply) {
            return Err(err);
        }

        let token = reply
            .get("token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FnosError::ProtocolMismatch("login reply has no token".into()))?;

        if let Some(back_id) = reply.get("backId").and_then(Value::as_str) {
            self.back_id = back_id.to_string();
        }
        if let Some(secret) = reply.get("secret").and_then(Value::as_str) {
            self.sign_key = Some(crypto::aes_decrypt(secret, &self.aes_key, &self.iv)?);
        }

        Ok(LoginReply {
            token: SecretString::from(token.to_string()),
            uid: reply.get("uid").and_then(Value::as_i64),
            admin: reply.get("admin").and_then(Value::as_bool).unwrap_or(false),
            has_long_token: reply.get("longToken").is_some(),
        })
    }

    /// Exchange the session for an entry-token usable in HTTP cookies
    pub async fn exchange_entry_token(&mut self) -> Result<SecretString> {
        let req = "appcgi.sac.entry.v1.exchangeEntryToken";
        let reply = self.request(req, json!({})).await?;
        if let Some(err) = classify_reply(req, &reply) {
            return Err(err);
        }

        reply
            .pointer("/data/token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(|t| SecretString::from(t.to_string()))
            .ok_or_else(|| FnosError::ProtocolMismatch("exchange reply has no token".into()))
    }

    /// Close the connection, ignoring transport errors
    pub async fn close(mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "error while closing connection");
        }
    }
}
