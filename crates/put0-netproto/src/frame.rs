use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    command::StompCommand,
    constants::{
        CONTENT_TYPE_JSON, HDR_ACCEPT_VERSION, HDR_ACK, HDR_AUTHORIZATION, HDR_CONTENT_TYPE,
        HDR_DESTINATION, HDR_HEART_BEAT, HDR_HOST, HDR_ID, HDR_MESSAGE, HDR_RECEIPT,
        HDR_SUBSCRIPTION, STOMP_VERSION,
    },
    error::CodecError,
};

/// Frame headers.
///
/// Order is irrelevant to the protocol but is kept stable so encoded frames are
/// deterministic. When a decoded frame repeats a header, the first occurrence
/// is the one [`Headers::get`] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of the first header named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set `name` to `value`, replacing every existing occurrence.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|(k, _)| *k == name) {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut idx = pos + 1;
                while idx < self.entries.len() {
                    if self.entries[idx].0 == name {
                        self.entries.remove(idx);
                    } else {
                        idx += 1;
                    }
                }
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Append without replacing. Used by the decoder to keep repeated headers.
    pub(crate) fn append(&mut self, name: String, value: String) {
        self.entries.push((name, value));
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == name)?;
        let (_, value) = self.entries.remove(pos);
        self.entries.retain(|(k, _)| k != name);
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// One STOMP frame: command, headers and an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: StompCommand,
    pub headers: Headers,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn destination(&self) -> Option<&str> {
        self.header(HDR_DESTINATION)
    }

    pub fn subscription(&self) -> Option<&str> {
        self.header(HDR_SUBSCRIPTION)
    }

    /// Human-readable error text of an ERROR frame: the `message` header, or
    /// the body when the header is absent.
    pub fn error_message(&self) -> String {
        match self.header(HDR_MESSAGE) {
            Some(msg) => msg.to_string(),
            None => String::from_utf8_lossy(&self.body).into_owned(),
        }
    }

    pub fn body_str(&self) -> Result<&str, CodecError> {
        Ok(std::str::from_utf8(&self.body)?)
    }

    /// Decode a JSON body. A missing `content-type` is treated as JSON.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        if let Some(ct) = self.header(HDR_CONTENT_TYPE) {
            let mime = ct.split(';').next().unwrap_or_default().trim();
            if !mime.eq_ignore_ascii_case(CONTENT_TYPE_JSON) {
                return Err(CodecError::UnsupportedContentType(ct.to_string()));
            }
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// CONNECT frame opening a STOMP session.
    ///
    /// `heartbeat` is `(cx, cy)` in milliseconds: how often this client sends
    /// heartbeats and how often it wants to receive them.
    pub fn connect(host: &str, heartbeat: (u64, u64), bearer: Option<&str>) -> Self {
        let mut frame = Frame::new(StompCommand::Connect)
            .with_header(HDR_ACCEPT_VERSION, STOMP_VERSION)
            .with_header(HDR_HOST, host)
            .with_header(HDR_HEART_BEAT, format!("{},{}", heartbeat.0, heartbeat.1));
        if let Some(token) = bearer {
            frame = frame.with_header(HDR_AUTHORIZATION, format!("Bearer {token}"));
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(StompCommand::Subscribe)
            .with_header(HDR_ID, id)
            .with_header(HDR_DESTINATION, destination)
            .with_header(HDR_ACK, "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(StompCommand::Unsubscribe).with_header(HDR_ID, id)
    }

    /// SEND frame with a JSON body.
    pub fn send_json<T: Serialize + ?Sized>(
        destination: &str,
        payload: &T,
    ) -> Result<Self, CodecError> {
        let body = serde_json::to_vec(payload)?;
        Ok(Frame::new(StompCommand::Send)
            .with_header(HDR_DESTINATION, destination)
            .with_header(HDR_CONTENT_TYPE, CONTENT_TYPE_JSON)
            .with_body(body))
    }

    pub fn disconnect(receipt: Option<&str>) -> Self {
        let frame = Frame::new(StompCommand::Disconnect);
        match receipt {
            Some(r) => frame.with_header(HDR_RECEIPT, r),
            None => frame,
        }
    }

    /// Parsed `heart-beat` header as `(x, y)` milliseconds; `(0, 0)` when absent.
    pub fn heartbeat(&self) -> (u64, u64) {
        self.header(HDR_HEART_BEAT)
            .and_then(|v| {
                let (x, y) = v.split_once(',')?;
                Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
            })
            .unwrap_or((0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_all_occurrences() {
        let mut headers = Headers::new();
        headers.append("a".into(), "1".into());
        headers.append("b".into(), "2".into());
        headers.append("a".into(), "3".into());
        assert_eq!(headers.get("a"), Some("1"));

        headers.insert("a", "9");
        assert_eq!(headers.get("a"), Some("9"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn heartbeat_header_parses() {
        let frame = Frame::new(StompCommand::Connected).with_header(HDR_HEART_BEAT, "0, 10000");
        assert_eq!(frame.heartbeat(), (0, 10_000));

        let bogus = Frame::new(StompCommand::Connected).with_header(HDR_HEART_BEAT, "x,1");
        assert_eq!(bogus.heartbeat(), (0, 0));
    }

    #[test]
    fn json_body_rejects_other_content_types() {
        let frame = Frame::new(StompCommand::Message)
            .with_header(HDR_CONTENT_TYPE, "text/plain")
            .with_body("{}");
        assert!(matches!(
            frame.json_body::<serde_json::Value>(),
            Err(CodecError::UnsupportedContentType(_))
        ));

        let frame = Frame::new(StompCommand::Message)
            .with_header(HDR_CONTENT_TYPE, "application/json;charset=UTF-8")
            .with_body("{\"a\":1}");
        let value: serde_json::Value = frame.json_body().unwrap();
        assert_eq!(value["a"], 1);
    }
}
