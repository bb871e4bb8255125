//! Typed decoding of queue deliveries.
//!
//! Every delivery is decoded once, according to the role of the queue it came from, into an
//! [`Operation`]. Upstream producers are loose about field types, so field decoding is
//! lenient: a field of an unexpected type reads as empty instead of failing the delivery.

use crate::core::identity::UNKNOWN_CHAT;
use crate::infrastructure::entities::{Chat, Customer, Message};
use crate::infrastructure::http::OutboundRequest;
use crate::infrastructure::settings::QueueRole;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value, json};
use thiserror::Error;

pub const IMAGE_PLACEHOLDER: &str = "📷 Imagem enviada";
pub const AUDIO_PLACEHOLDER: &str = "Áudio enviado";
pub const DOCUMENT_PLACEHOLDER: &str = "📄 Documento enviado";

#[derive(Debug, Error)]
#[error("malformed {kind} payload: {source}")]
pub struct MalformedPayload {
    pub kind: &'static str,
    #[source]
    pub source: serde_json::Error,
}

impl MalformedPayload {
    fn of(kind: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Self { kind, source }
    }
}

/// Strings only; anything else reads as empty.
pub(crate) fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        _ => String::new(),
    })
}

/// Non-empty strings only; anything else reads as absent.
pub(crate) fn lenient_opt_string<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    })
}

/// `true`/`false` or their string spellings (`"1"`, `"t"`, `"TRUE"`, ...).
pub(crate) fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Bool(b) => b,
        Value::String(s) => matches!(s.trim(), "1" | "t" | "T" | "true" | "TRUE" | "True"),
        _ => false,
    })
}

/// Numeric or string identifiers, as text.
pub(crate) fn lenient_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// Operations carried by the outgoing queue, in legacy detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingMarker {
    UpsertChat,
    UpsertCustomer,
    SendMessage,
    UpsertMessage,
    SendRequest,
}

impl OutgoingMarker {
    pub const ALL: [OutgoingMarker; 5] = [
        OutgoingMarker::UpsertChat,
        OutgoingMarker::UpsertCustomer,
        OutgoingMarker::SendMessage,
        OutgoingMarker::UpsertMessage,
        OutgoingMarker::SendRequest,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            OutgoingMarker::UpsertChat => "upsertChat",
            OutgoingMarker::UpsertCustomer => "upsertCustomer",
            OutgoingMarker::SendMessage => "sendMessage",
            OutgoingMarker::UpsertMessage => "upsertMessage",
            OutgoingMarker::SendRequest => "sendRequest",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|marker| marker.tag() == tag)
    }

    /// Legacy detection: the first marker whose tag occurs anywhere in the raw body.
    pub fn scan(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|marker| raw.contains(marker.tag()))
    }
}

/// A message event as it is appended to a chat's message log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub text: String,
    pub body: String,
    pub kind: String,
    pub timestamp: String,
    pub extension: Option<String>,
}

impl IncomingMessage {
    pub fn to_json(&self) -> Value {
        let mut message = json!({
            "id": self.id,
            "from": self.from,
            "to": self.to,
            "text": self.text,
            "body": self.body,
            "type": self.kind,
            "timestamp": self.timestamp,
        });
        if let (Some(extension), Some(fields)) = (&self.extension, message.as_object_mut()) {
            fields.insert("extension".to_owned(), extension.clone().into());
        }
        message
    }
}

/// A decoded chat-platform event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingEvent {
    /// Participant identity as received, not normalized.
    pub identity: String,
    /// Contact document to seed the chat record with, when the event is a contact record.
    pub contact: Option<Value>,
    pub message: Option<IncomingMessage>,
    /// Connection (platform instance) the event arrived on; empty if unknown.
    pub connection: String,
    pub apikey: Option<String>,
}

/// Result of a message sent through the chat platform, to be logged in its chat.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub identity: String,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    UpsertChat(Chat),
    UpsertCustomer(Customer),
    UpsertMessage(Message),
    SendRequest(OutboundRequest),
    IncomingChatMessage(IncomingEvent),
    /// `None` when the update lacks its key or message and is to be ignored.
    OutboundStatusUpdate(Option<StatusUpdate>),
    Unrecognized,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::UpsertChat(_) => "upsertChat",
            Operation::UpsertCustomer(_) => "upsertCustomer",
            Operation::UpsertMessage(_) => "upsertMessage",
            Operation::SendRequest(_) => "sendRequest",
            Operation::IncomingChatMessage(_) => "incomingChatMessage",
            Operation::OutboundStatusUpdate(_) => "outboundStatusUpdate",
            Operation::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Deserialize)]
struct ChatPayload {
    #[serde(default, deserialize_with = "lenient_string")]
    id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    situation: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    is_active: bool,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    agent_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    tabulation: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    customer_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    instance_id: String,
}

impl From<ChatPayload> for Chat {
    fn from(p: ChatPayload) -> Self {
        Chat {
            id: p.id,
            situation: p.situation,
            is_active: p.is_active,
            agent_id: p.agent_id,
            tabulation: p.tabulation,
            customer_id: p.customer_id,
            instance_id: p.instance_id,
        }
    }
}

#[derive(Deserialize)]
struct CustomerPayload {
    #[serde(default, deserialize_with = "lenient_string")]
    id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    number: String,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    last_chat_id: Option<String>,
}

impl From<CustomerPayload> for Customer {
    fn from(p: CustomerPayload) -> Self {
        Customer {
            id: p.id,
            name: p.name,
            number: p.number,
            last_chat_id: p.last_chat_id,
        }
    }
}

#[derive(Deserialize)]
struct MessagePayload {
    #[serde(default, deserialize_with = "lenient_id")]
    id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    from: String,
    #[serde(default, deserialize_with = "lenient_string")]
    to: String,
    #[serde(default, deserialize_with = "lenient_string")]
    text: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    delivered: bool,
    #[serde(default, deserialize_with = "lenient_string")]
    chat_id: String,
}

impl From<MessagePayload> for Message {
    fn from(p: MessagePayload) -> Self {
        Message {
            id: p.id,
            from: p.from,
            to: p.to,
            text: p.text,
            delivered: p.delivered,
            chat_id: p.chat_id,
        }
    }
}

fn object(body: &[u8], kind: &'static str) -> Result<Map<String, Value>, MalformedPayload> {
    serde_json::from_slice(body).map_err(MalformedPayload::of(kind))
}

fn str_at<'a>(doc: &'a Value, pointer: &str) -> Option<&'a str> {
    doc.pointer(pointer).and_then(Value::as_str)
}

fn non_empty_str_at<'a>(doc: &'a Value, pointer: &str) -> Option<&'a str> {
    str_at(doc, pointer).filter(|s| !s.is_empty())
}

/// Decodes a delivery from a queue with the given role.
pub fn classify(role: QueueRole, body: &[u8]) -> Result<Operation, MalformedPayload> {
    match role {
        QueueRole::Outgoing => classify_outgoing(body),
        QueueRole::Incoming => decode_incoming(body).map(Operation::IncomingChatMessage),
        QueueRole::StatusUpdate => decode_status_update(body).map(Operation::OutboundStatusUpdate),
    }
}

/// An explicit `operation` tag wins; otherwise the raw body is scanned for a marker. The
/// operation's payload is the `body` field when there is one, else the whole document.
fn classify_outgoing(body: &[u8]) -> Result<Operation, MalformedPayload> {
    let mut envelope = object(body, "outgoing")?;

    let explicit = envelope
        .get("operation")
        .and_then(Value::as_str)
        .and_then(OutgoingMarker::from_tag);
    let Some(marker) = explicit.or_else(|| OutgoingMarker::scan(&String::from_utf8_lossy(body)))
    else {
        return Ok(Operation::Unrecognized);
    };

    let payload = match envelope.remove("body") {
        Some(inner) => inner,
        None => Value::Object(envelope),
    };

    let kind = marker.tag();
    Ok(match marker {
        OutgoingMarker::UpsertChat => Operation::UpsertChat(
            serde_json::from_value::<ChatPayload>(payload)
                .map_err(MalformedPayload::of(kind))?
                .into(),
        ),
        OutgoingMarker::UpsertCustomer => Operation::UpsertCustomer(
            serde_json::from_value::<CustomerPayload>(payload)
                .map_err(MalformedPayload::of(kind))?
                .into(),
        ),
        OutgoingMarker::SendMessage | OutgoingMarker::UpsertMessage => Operation::UpsertMessage(
            serde_json::from_value::<MessagePayload>(payload)
                .map_err(MalformedPayload::of(kind))?
                .into(),
        ),
        OutgoingMarker::SendRequest => Operation::SendRequest(
            serde_json::from_value(payload).map_err(MalformedPayload::of(kind))?,
        ),
    })
}

/// Identity lookup order: `status_string.key.remote_jid`, `data.key.remoteJid`, `number`.
fn incoming_identity(doc: &Value) -> &str {
    ["/status_string/key/remote_jid", "/data/key/remoteJid", "/number"]
        .into_iter()
        .find_map(|pointer| non_empty_str_at(doc, pointer))
        .unwrap_or(UNKNOWN_CHAT)
}

fn is_contact(doc: &Value) -> bool {
    ["name", "number", "created_at"]
        .into_iter()
        .all(|field| doc.get(field).is_some_and(|v| !v.is_null()))
}

fn file_extension(file_name: &str) -> Option<&str> {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
}

fn incoming_message(doc: &Value, data: &Value) -> IncomingMessage {
    let text = str_at(data, "/message/conversation").unwrap_or_default();
    let base64 = str_at(data, "/message/base64").unwrap_or_default();
    let mut message = IncomingMessage {
        id: format!("msg_{}", str_at(data, "/key/id").unwrap_or_default()),
        from: str_at(doc, "/sender").unwrap_or_default().to_owned(),
        to: str_at(data, "/key/remoteJid").unwrap_or_default().to_owned(),
        text: text.to_owned(),
        body: text.to_owned(),
        kind: str_at(data, "/messageType").unwrap_or_default().to_owned(),
        timestamp: str_at(doc, "/date_time").unwrap_or_default().to_owned(),
        extension: non_empty_str_at(doc, "/extension").map(str::to_owned),
    };

    match message.kind.as_str() {
        "imageMessage" => {
            message.kind = "image".to_owned();
            message.body = format!("data:image/png;base64,{base64}");
            message.text = IMAGE_PLACEHOLDER.to_owned();
        }
        "audioMessage" => {
            message.kind = "audio".to_owned();
            message.body = format!("data:audio/ogg;base64,{base64}");
            message.text = AUDIO_PLACEHOLDER.to_owned();
        }
        "documentMessage" => {
            message.body = base64.to_owned();
            message.text = DOCUMENT_PLACEHOLDER.to_owned();
            if message.extension.is_none() {
                message.extension = str_at(data, "/message/documentMessage/fileName")
                    .and_then(file_extension)
                    .map(str::to_owned);
            }
        }
        _ => {}
    }
    message
}

fn decode_incoming(body: &[u8]) -> Result<IncomingEvent, MalformedPayload> {
    let doc = Value::Object(object(body, "incoming")?);

    let connection = non_empty_str_at(&doc, "/instance_id")
        .or_else(|| non_empty_str_at(&doc, "/data/instanceId"))
        .unwrap_or_default()
        .to_owned();

    let contact = is_contact(&doc).then(|| {
        let mut contact = doc.clone();
        if let Some(fields) = contact.as_object_mut() {
            let missing = fields.get("instance_id").is_none_or(Value::is_null);
            if missing {
                if let Some(instance) = doc.pointer("/data/instanceId") {
                    fields.insert("instance_id".to_owned(), instance.clone());
                }
            }
        }
        contact
    });

    let message = doc
        .get("data")
        .filter(|data| data.is_object())
        .map(|data| incoming_message(&doc, data));

    Ok(IncomingEvent {
        identity: incoming_identity(&doc).to_owned(),
        contact,
        message,
        connection,
        apikey: non_empty_str_at(&doc, "/apikey").map(str::to_owned),
    })
}

fn decode_status_update(body: &[u8]) -> Result<Option<StatusUpdate>, MalformedPayload> {
    let doc = Value::Object(object(body, "status update")?);

    let identity = non_empty_str_at(&doc, "/status_string/key/remote_jid");
    let message = doc
        .pointer("/status_string/message")
        .and_then(Value::as_object);
    let (Some(identity), Some(message)) = (identity, message) else {
        return Ok(None);
    };

    let mut message = message.clone();
    if let Some(base64) = message
        .get("base64")
        .and_then(Value::as_str)
        .filter(|b| !b.is_empty())
        .map(str::to_owned)
    {
        message.insert("body".to_owned(), Value::String(base64));
    }

    Ok(Some(StatusUpdate {
        identity: identity.to_owned(),
        message: Value::Object(message),
    }))
}
