//! fnOS reply classification
//!
//! Maps `errno` replies from the WebSocket API onto the handshake's error
//! kinds so the retry policy and the CLI exit codes can act on them.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::FnosError;

/// Messages that indicate the account needs a second factor
static TWO_FACTOR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(2fa|otp|totp|two[- ]?factor|二次验证|双重验证|动态验证码)")
        .expect("Invalid regex pattern for two-factor detection")
});

/// Requests whose failure means the username/password pair was refused
const CREDENTIAL_REQUESTS: &[&str] = &["user.login", "user.tokenLogin"];

/// Requests that fail only when the server speaks another protocol
const BOOTSTRAP_REQUESTS: &[&str] = &["util.crypto.getRSAPub", "util.getSI"];

/// Classify a reply to `req`, returning an error if it carries `errno`
pub fn classify_reply(req: &str, reply: &Value) -> Option<FnosError> {
    let errno = reply.get("errno")?;
    let message = reply_message(reply).unwrap_or_else(|| format!("errno {}", errno));

    if requires_second_factor(reply, &message) {
        return Some(FnosError::TwoFactorRequired);
    }

    if CREDENTIAL_REQUESTS.contains(&req) {
        return Some(FnosError::InvalidCredentials);
    }

    if BOOTSTRAP_REQUESTS.contains(&req) {
        return Some(FnosError::ProtocolMismatch(format!("{} failed: {}", req, message)));
    }

    Some(FnosError::ServerRejected(format!("{} failed: {}", req, message)))
}

fn reply_message(reply: &Value) -> Option<String> {
    ["msg", "error", "message"]
        .iter()
        .find_map(|key| reply.get(*key).and_then(Value::as_str))
        .filter(|msg| !msg.is_empty())
        .map(str::to_string)
}

fn requires_second_factor(reply: &Value, message: &str) -> bool {
    let flagged = ["needOtp", "need2fa", "otp"]
        .iter()
        .any(|key| reply.get(*key).and_then(Value::as_bool).unwrap_or(false));

    flagged || TWO_FACTOR_PATTERN.is_match(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_successful_reply_is_not_an_error() {
        let reply = json!({"result": "succ", "token": "abc"});
        assert!(classify_reply("user.login", &reply).is_none());
    }

    #[test]
    fn test_login_errno_is_invalid_credentials() {
        let reply = json!({"errno": 131073, "msg": "password error"});
        assert!(matches!(
            classify_reply("user.login", &reply),
            Some(FnosError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_two_factor_detection() {
        let by_flag = json!({"errno": 1, "needOtp": true});
        let by_message = json!({"errno": 1, "msg": "请输入动态验证码"});
        let by_english = json!({"errno": 1, "error": "Two-factor authentication required"});

        for reply in [by_flag, by_message, by_english] {
            assert!(matches!(
                classify_reply("user.login", &reply),
                Some(FnosError::TwoFactorRequired)
            ));
        }
    }

    #[test]
    fn test_bootstrap_failure_is_protocol_mismatch() {
        let reply = json!({"errno": 2});
        match classify_reply("util.crypto.getRSAPub", &reply) {
            Some(FnosError::ProtocolMismatch(msg)) => assert!(msg.contains("errno 2")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_other_failures_are_server_rejected() {
        let reply = json!({"errno": 9, "msg": "busy"});
        assert!(matches!(
            classify_reply("appcgi.sac.entry.v1.exchangeEntryToken", &reply),
            Some(FnosError::ServerRejected(_))
        ));
    }
}
