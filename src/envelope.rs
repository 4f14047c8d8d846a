/// Correlation envelope published to a topic.
///
/// `Envelope` wraps the caller's message with the identity and creation time
/// of the request. When the caller expects a reply, it also names the
/// response topic the reply will be published to.
///
/// ## Wire format
///
/// The envelope is serialized as a single JSON object, one record per staging
/// file:
///
/// ```json
/// {"id":"…","timestamp":1700000000000,"message":{"sku":"A1"},"response_topic":"response.orders.…"}
/// ```
///
/// `response_topic` is omitted entirely when no reply is expected.
///
/// ## Example
///
/// ```rust
/// use elytron::Envelope;
///
/// let envelope = Envelope::new(serde_json::json!({ "sku": "A1" }));
/// let json = envelope.to_json().unwrap();
///
/// assert!(json.contains("\"sku\":\"A1\""));
/// assert!(!json.contains("response_topic"));
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    /// Request identifier, unique per publish.
    pub id: uuid::Uuid,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Caller payload. Opaque to this crate, may be `null`.
    pub message: serde_json::Value,
    /// Topic the reply to this request is expected on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_topic: Option<String>,
}

impl Envelope {
    /// Build an envelope with a fresh id and the current time.
    pub fn new(message: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            message,
            response_topic: None,
        }
    }

    /// Attach the topic a reply should be published to.
    pub fn with_response_topic(mut self, topic: impl Into<String>) -> Self {
        self.response_topic = Some(topic.into());
        self
    }

    /// Serialize the envelope into its canonical JSON text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Name of the topic carrying the reply to request `id` sent on `topic`.
///
/// Publisher and responder both derive the name from the request, so no side
/// channel is needed to agree on it.
pub fn response_topic(topic: &str, id: &uuid::Uuid) -> String {
    format!("response.{topic}.{id}")
}
