//! Jupyter wire format
//!
//! A message on a ZeroMQ socket is a multipart frame list:
//!
//! ```text
//! [identities...] <IDS|MSG> signature header parent_header metadata content [buffers...]
//! ```
//!
//! The signature is the hex HMAC-SHA256 of the four JSON frames, keyed with
//! the connection file's `key`. An empty key means unsigned messages.

use crate::error::{KernelError, Result};
use crate::kernel::{CellFailure, CellReply};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use jupyter_protocol::JupyterMessage;
use nbstatic_notebook::{MultilineText, Output};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::HashMap;

/// Frame separating routing identities from the signed message
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies messages for one connection
#[derive(Clone)]
pub struct Signer {
    mac: Option<HmacSha256>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("signed", &self.mac.is_some())
            .finish()
    }
}

impl Signer {
    /// Signer for `key`; an empty key disables signing
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Protocol`] if the key is rejected.
    pub fn new(key: &str) -> Result<Self> {
        if key.is_empty() {
            return Ok(Self { mac: None });
        }
        let mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| KernelError::Protocol(format!("invalid signing key: {e}")))?;
        Ok(Self { mac: Some(mac) })
    }

    /// Hex signature of `parts`, empty when unsigned
    #[must_use]
    pub fn sign(&self, parts: &[&[u8]]) -> String {
        let Some(mac) = &self.mac else {
            return String::new();
        };
        let mut mac = mac.clone();
        for part in parts {
            mac.update(part);
        }
        format!("{:x}", mac.finalize().into_bytes())
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| KernelError::Protocol(e.to_string()))
}

/// Frames of `message`, signed with `signer`
///
/// # Errors
///
/// Returns [`KernelError::Protocol`] if a part cannot be serialized.
pub fn encode(message: &JupyterMessage, signer: &Signer) -> Result<Vec<Bytes>> {
    let header = to_json(&message.header)?;
    let parent_header = match &message.parent_header {
        Some(parent) => to_json(parent)?,
        None => b"{}".to_vec(),
    };
    let metadata = to_json(&message.metadata)?;
    let content = to_json(&message.content)?;
    let signature = signer.sign(&[&header[..], &parent_header[..], &metadata[..], &content[..]]);

    let mut frames = message.zmq_identities.clone();
    frames.push(Bytes::from_static(DELIMITER));
    frames.push(Bytes::from(signature));
    frames.push(Bytes::from(header));
    frames.push(Bytes::from(parent_header));
    frames.push(Bytes::from(metadata));
    frames.push(Bytes::from(content));
    frames.extend(message.buffers.iter().cloned());
    Ok(frames)
}

#[derive(Deserialize)]
struct IncomingHeader {
    msg_type: String,
}

/// A received message, with just what the client acts on
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub msg_type: String,
    /// `msg_id` of the request this message answers
    pub parent_msg_id: Option<String>,
    pub content: Value,
}

/// Verify and parse the frames of a received message
///
/// # Errors
///
/// Returns [`KernelError::Protocol`] for a missing delimiter, a short
/// message, a bad signature or unparsable JSON.
pub fn decode(frames: &[Bytes], signer: &Signer) -> Result<Incoming> {
    let delimiter = frames
        .iter()
        .position(|frame| &frame[..] == DELIMITER)
        .ok_or_else(|| KernelError::Protocol("message has no <IDS|MSG> delimiter".to_string()))?;
    let parts = &frames[delimiter + 1..];
    let [signature, header, parent_header, metadata, content, ..] = parts else {
        return Err(KernelError::Protocol(format!(
            "message has {} parts after the delimiter, expected at least 5",
            parts.len()
        )));
    };

    let expected = signer.sign(&[&header[..], &parent_header[..], &metadata[..], &content[..]]);
    if &signature[..] != expected.as_bytes() {
        return Err(KernelError::Protocol("invalid message signature".to_string()));
    }

    let parse = |frame: &Bytes| -> Result<Value> {
        serde_json::from_slice(frame).map_err(|e| KernelError::Protocol(e.to_string()))
    };
    let header: IncomingHeader = serde_json::from_value(parse(header)?)
        .map_err(|e| KernelError::Protocol(format!("bad header: {e}")))?;
    let parent_msg_id = parse(parent_header)?
        .get("msg_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Incoming {
        msg_type: header.msg_type,
        parent_msg_id,
        content: parse(content)?,
    })
}

/// Folds iopub messages of one request into notebook outputs
///
/// Streams of the same name are merged, `clear_output` honours its `wait`
/// flag, and `update_display_data` rewrites earlier outputs sharing a
/// display id.
#[derive(Debug, Default)]
pub struct OutputCollector {
    outputs: Vec<Output>,
    clear_pending: bool,
    display_ids: HashMap<String, Vec<usize>>,
    idle: bool,
}

impl OutputCollector {
    /// Whether the kernel reported idle for the request
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.idle
    }

    /// Apply one iopub message
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Protocol`] if an output message is malformed.
    pub fn handle(&mut self, msg_type: &str, content: Value) -> Result<()> {
        match msg_type {
            "status" => {
                if content.get("execution_state").and_then(Value::as_str) == Some("idle") {
                    self.idle = true;
                }
            }
            "clear_output" => {
                if content.get("wait").and_then(Value::as_bool).unwrap_or(false) {
                    self.clear_pending = true;
                } else {
                    self.clear();
                }
            }
            "stream" => {
                self.flush_pending_clear();
                let name = content.get("name").and_then(Value::as_str).unwrap_or("stdout");
                let text = content.get("text").and_then(Value::as_str).unwrap_or_default();
                if let Some(Output::Stream {
                    name: last,
                    text: MultilineText(buffer),
                    ..
                }) = self.outputs.last_mut()
                {
                    if last == name {
                        buffer.push_str(text);
                        return Ok(());
                    }
                }
                self.outputs.push(Output::stream(name, text));
            }
            "display_data" | "execute_result" | "error" => {
                self.flush_pending_clear();
                let (output, display_id) = to_output(msg_type, content)?;
                if let Some(id) = display_id {
                    self.display_ids
                        .entry(id)
                        .or_default()
                        .push(self.outputs.len());
                }
                self.outputs.push(output);
            }
            "update_display_data" => {
                let (update, display_id) = to_output("display_data", content)?;
                let Some(id) = display_id else { return Ok(()) };
                let Output::DisplayData {
                    data: new_data,
                    metadata: new_metadata,
                    ..
                } = update
                else {
                    return Ok(());
                };
                for &index in self.display_ids.get(&id).into_iter().flatten() {
                    if let Some(
                        Output::DisplayData { data, metadata, .. }
                        | Output::ExecuteResult { data, metadata, .. },
                    ) = self.outputs.get_mut(index)
                    {
                        data.clone_from(&new_data);
                        metadata.clone_from(&new_metadata);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.outputs.clear();
        self.display_ids.clear();
        self.clear_pending = false;
    }

    fn flush_pending_clear(&mut self) {
        if self.clear_pending {
            self.clear();
        }
    }

    /// Outputs collected so far
    #[must_use]
    pub fn into_outputs(self) -> Vec<Output> {
        self.outputs
    }
}

/// nbformat output for an iopub `content`, with its display id if any
///
/// Only the keys nbformat defines for the output type are kept.
fn to_output(msg_type: &str, content: Value) -> Result<(Output, Option<String>)> {
    let Value::Object(mut content) = content else {
        return Err(KernelError::Protocol(format!("{msg_type} content is not an object")));
    };
    let display_id = content
        .get("transient")
        .and_then(|transient| transient.get("display_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let keys: &[&str] = match msg_type {
        "execute_result" => &["execution_count", "data", "metadata"],
        "error" => &["ename", "evalue", "traceback"],
        _ => &["data", "metadata"],
    };
    let mut output = Map::new();
    output.insert("output_type".to_string(), Value::String(msg_type.to_string()));
    for key in keys {
        if let Some(value) = content.remove(*key) {
            output.insert((*key).to_string(), value);
        }
    }
    if msg_type != "error" {
        output
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let output = serde_json::from_value(Value::Object(output))
        .map_err(|e| KernelError::Protocol(format!("bad {msg_type} message: {e}")))?;
    Ok((output, display_id))
}

/// Cell reply from an `execute_reply` content and the collected outputs
#[must_use]
pub fn cell_reply(reply: &Value, outputs: Vec<Output>) -> CellReply {
    let status = reply.get("status").and_then(Value::as_str).unwrap_or("ok");
    if status == "ok" {
        return CellReply::ok(outputs);
    }

    let last_error = outputs.iter().rev().find_map(|output| match output {
        Output::Error {
            ename,
            evalue,
            traceback,
            ..
        } => Some((ename.clone(), evalue.clone(), traceback.clone())),
        _ => None,
    });
    let text = |key: &str| reply.get(key).and_then(Value::as_str).map(str::to_string);
    let traceback: Option<Vec<String>> = reply.get("traceback").and_then(|tb| {
        tb.as_array().map(|lines| {
            lines
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    });
    let (fallback_name, fallback_value, fallback_traceback) = last_error.unwrap_or_else(|| {
        let name = if status == "aborted" { "Aborted" } else { "Error" };
        (name.to_string(), String::new(), Vec::new())
    });

    CellReply {
        outputs,
        failure: Some(CellFailure {
            ename: text("ename").unwrap_or(fallback_name),
            evalue: text("evalue").unwrap_or(fallback_value),
            traceback: traceback
                .filter(|lines| !lines.is_empty())
                .unwrap_or(fallback_traceback),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jupyter_protocol::{ExecuteRequest, JupyterMessageContent};
    use serde_json::json;

    fn frames(signer: &Signer, msg_type: &str, parent: &str, content: &Value) -> Vec<Bytes> {
        let header = json!({"msg_id": "m1", "msg_type": msg_type, "session": "s",
                            "username": "k", "date": "2024-01-01T00:00:00Z", "version": "5.3"})
        .to_string();
        let parent = json!({"msg_id": parent}).to_string();
        let metadata = "{}".to_string();
        let content = content.to_string();
        let signature = signer.sign(&[
            header.as_bytes(),
            parent.as_bytes(),
            metadata.as_bytes(),
            content.as_bytes(),
        ]);
        vec![
            Bytes::from_static(b"kernel.abc.stream"),
            Bytes::from_static(DELIMITER),
            Bytes::from(signature),
            Bytes::from(header),
            Bytes::from(parent),
            Bytes::from(metadata),
            Bytes::from(content),
        ]
    }

    #[test]
    fn test_signature_matches_reference_hmac() {
        // echo -n 'abc' | openssl dgst -sha256 -hmac key
        let signer = Signer::new("key").unwrap();
        assert_eq!(
            signer.sign(&[b"a".as_slice(), b"bc".as_slice()]),
            "9c196e32dc0175f86f4b1cb89289d6619de6bee699e4c378e68309ed97a1a6ab"
        );
        assert_eq!(Signer::new("").unwrap().sign(&[b"abc".as_slice()]), "");
    }

    #[test]
    fn test_encode_signs_the_four_json_frames() {
        let signer = Signer::new("secret").unwrap();
        let message = JupyterMessage::new(ExecuteRequest::new("1 + 1".to_string()), None);
        let frames = encode(&message, &signer).unwrap();

        assert_eq!(frames[0].as_ref(), DELIMITER);
        assert_eq!(frames[3].as_ref(), b"{}");
        let expected = signer.sign(&[&frames[2][..], &frames[3][..], &frames[4][..], &frames[5][..]]);
        assert_eq!(frames[1].as_ref(), expected.as_bytes());

        let header: Value = serde_json::from_slice(&frames[2]).unwrap();
        assert_eq!(header["msg_type"], "execute_request");
        let content: Value = serde_json::from_slice(&frames[5]).unwrap();
        assert_eq!(content["code"], "1 + 1");
        assert!(matches!(message.content, JupyterMessageContent::ExecuteRequest(_)));
    }

    #[test]
    fn test_decode_checks_signature() {
        let signer = Signer::new("secret").unwrap();
        let content = json!({"name": "stdout", "text": "hi\n"});
        let incoming = decode(&frames(&signer, "stream", "req-1", &content), &signer).unwrap();
        assert_eq!(incoming.msg_type, "stream");
        assert_eq!(incoming.parent_msg_id.as_deref(), Some("req-1"));
        assert_eq!(incoming.content, content);

        let other = Signer::new("other").unwrap();
        let err = decode(&frames(&other, "stream", "req-1", &content), &signer).unwrap_err();
        assert!(matches!(err, KernelError::Protocol(msg) if msg.contains("signature")));
    }

    #[test]
    fn test_decode_rejects_short_messages() {
        let signer = Signer::new("").unwrap();
        let short = vec![Bytes::from_static(DELIMITER), Bytes::from_static(b"")];
        assert!(decode(&short, &signer).is_err());
        assert!(decode(&[Bytes::from_static(b"{}")], &signer).is_err());
    }

    #[test]
    fn test_collector_merges_streams_and_honours_clear_wait() {
        let mut collector = OutputCollector::default();
        collector
            .handle("stream", json!({"name": "stdout", "text": "a"}))
            .unwrap();
        collector
            .handle("stream", json!({"name": "stdout", "text": "b\n"}))
            .unwrap();
        collector
            .handle("stream", json!({"name": "stderr", "text": "warn\n"}))
            .unwrap();
        collector.handle("clear_output", json!({"wait": true})).unwrap();
        collector
            .handle(
                "execute_result",
                json!({"execution_count": 3, "data": {"text/plain": "42"}, "metadata": {}}),
            )
            .unwrap();
        assert!(!collector.is_idle());
        collector
            .handle("status", json!({"execution_state": "idle"}))
            .unwrap();
        assert!(collector.is_idle());

        let outputs = collector.into_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(
            outputs[0].data().unwrap().get_text("text/plain").as_deref(),
            Some("42")
        );
    }

    #[test]
    fn test_collector_streams_before_clear_are_kept_without_clear() {
        let mut collector = OutputCollector::default();
        collector
            .handle("stream", json!({"name": "stdout", "text": "a"}))
            .unwrap();
        collector
            .handle("stream", json!({"name": "stdout", "text": "b\n"}))
            .unwrap();
        assert_eq!(
            collector.into_outputs(),
            vec![Output::stream("stdout", "ab\n")]
        );
    }

    #[test]
    fn test_collector_updates_display_by_id() {
        let mut collector = OutputCollector::default();
        collector
            .handle(
                "display_data",
                json!({"data": {"text/plain": "0%"}, "metadata": {},
                       "transient": {"display_id": "progress"}}),
            )
            .unwrap();
        collector
            .handle(
                "update_display_data",
                json!({"data": {"text/plain": "100%"}, "metadata": {},
                       "transient": {"display_id": "progress"}}),
            )
            .unwrap();
        let outputs = collector.into_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(
            outputs[0].data().unwrap().get_text("text/plain").as_deref(),
            Some("100%")
        );
        let json = serde_json::to_value(&outputs[0]).unwrap();
        assert!(json.get("transient").is_none());
        assert_eq!(json["output_type"], "display_data");
    }

    #[test]
    fn test_error_reply_uses_reply_content() {
        let mut collector = OutputCollector::default();
        collector
            .handle(
                "error",
                json!({"ename": "ValueError", "evalue": "bad", "traceback": ["ValueError: bad"]}),
            )
            .unwrap();
        let reply = cell_reply(
            &json!({"status": "error", "ename": "ValueError", "evalue": "bad",
                    "traceback": ["ValueError: bad"]}),
            collector.into_outputs(),
        );
        let failure = reply.failure.unwrap();
        assert_eq!(failure.ename, "ValueError");
        assert_eq!(failure.traceback, vec!["ValueError: bad"]);
        assert!(matches!(reply.outputs[0], Output::Error { .. }));
    }

    #[test]
    fn test_error_reply_without_details_falls_back_to_outputs() {
        let outputs = vec![Output::error("CompilationError", "CS0103", vec![])];
        let reply = cell_reply(&json!({"status": "error"}), outputs);
        assert_eq!(reply.failure.unwrap().ename, "CompilationError");

        let reply = cell_reply(&json!({"status": "aborted"}), Vec::new());
        assert_eq!(reply.failure.unwrap().ename, "Aborted");

        assert!(cell_reply(&json!({"status": "ok"}), Vec::new()).failure.is_none());
    }
}
