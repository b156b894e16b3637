//! The mock data model — the unit of record.
//!
//! A `Mock` captures one recorded exchange with an outbound dependency:
//! the decoded request and response payloads for its protocol, the
//! envelope metadata used by the matching engine, and the lifecycle
//! flags that decide whether the mock is consumed once (filtered) or
//! reused across a whole replay (unfiltered config traffic).
//!
//! Every shape here is plain serde data. Parsers decode wire bytes into
//! these shapes at record time and re-encode them bit-compatibly at
//! replay time; the daemon persists them as JSON lines.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheme version stamped on every recorded mock.
pub const MOCK_SCHEME_VERSION: &str = "shunt.dev/v1";

static NEXT_SORT_ORDER: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(1);

/// Allocate the next recording sort order. Unique process-wide so the
/// filtered partition replays in the order exchanges were observed.
pub fn next_sort_order() -> i64 {
    NEXT_SORT_ORDER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// Metadata key holding the human-readable operation summary.
pub const META_OPERATION: &str = "operation";
/// Metadata key threading the originating connection id.
pub const META_CONNECTION_ID: &str = "connection_id";
/// Metadata key marking reusable configuration/handshake traffic.
pub const META_TYPE: &str = "type";
/// Metadata value for reusable configuration/handshake traffic.
pub const META_TYPE_CONFIG: &str = "config";

/// Protocol a mock was recorded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MockKind {
    Http,
    Mongo,
    Grpc,
    Postgres,
    Redis,
    Generic,
    Kafka,
}

impl MockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MockKind::Http => "HTTP",
            MockKind::Mongo => "MONGO",
            MockKind::Grpc => "GRPC",
            MockKind::Postgres => "POSTGRES",
            MockKind::Redis => "REDIS",
            MockKind::Generic => "GENERIC",
            MockKind::Kafka => "KAFKA",
        }
    }
}

/// Lifecycle flags controlling a mock's fate in the store.
///
/// Filtered mocks are consumable: replay serves each one at most once,
/// in `sort_order`. Unfiltered mocks are reusable configuration traffic
/// (handshakes, heartbeats) that must survive the whole replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestModeInfo {
    pub is_filtered: bool,
    pub sort_order: i64,
}

/// A recorded request/response exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mock {
    pub version: String,
    pub kind: MockKind,
    pub name: String,
    pub spec: MockSpec,
    pub test_mode_info: TestModeInfo,
}

impl Mock {
    /// Build a new filtered mock with the given sort order.
    pub fn new(kind: MockKind, name: impl Into<String>, spec: MockSpec, sort_order: i64) -> Self {
        Self {
            version: MOCK_SCHEME_VERSION.to_string(),
            kind,
            name: name.into(),
            spec,
            test_mode_info: TestModeInfo {
                is_filtered: true,
                sort_order,
            },
        }
    }

    /// Mark this mock as reusable configuration traffic (unfiltered).
    pub fn into_config(mut self) -> Self {
        self.test_mode_info.is_filtered = false;
        self.spec
            .metadata
            .insert(META_TYPE.to_string(), META_TYPE_CONFIG.to_string());
        self
    }

    /// Whether the mock is reusable configuration/handshake traffic.
    pub fn is_config(&self) -> bool {
        self.spec.metadata.get(META_TYPE).map(String::as_str) == Some(META_TYPE_CONFIG)
    }

    /// The recorded operation summary, if present.
    pub fn operation(&self) -> &str {
        self.spec
            .metadata
            .get(META_OPERATION)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// The protocol payloads and envelope of a mock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockSpec {
    pub metadata: BTreeMap<String, String>,
    pub payload: ProtocolPayload,
    pub created_at: DateTime<Utc>,
    pub req_timestamp: DateTime<Utc>,
    pub res_timestamp: DateTime<Utc>,
}

impl MockSpec {
    /// Build a spec stamped `now` for both timestamps.
    pub fn new(payload: ProtocolPayload) -> Self {
        let now = Utc::now();
        Self {
            metadata: BTreeMap::new(),
            payload,
            created_at: now,
            req_timestamp: now,
            res_timestamp: now,
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Per-protocol request/response payloads, decoded from the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolPayload {
    Http {
        req: HttpReq,
        resp: HttpResp,
    },
    Mongo {
        requests: Vec<MongoRequest>,
        responses: Vec<MongoResponse>,
    },
    Grpc {
        req: GrpcReq,
        resp: GrpcResp,
    },
    Postgres {
        requests: Vec<PgFrame>,
        responses: Vec<PgFrame>,
    },
    Redis {
        requests: Vec<RespPayload>,
        responses: Vec<RespPayload>,
    },
    /// Opaque byte blobs for unrecognized protocols (and the Kafka stub).
    Generic {
        request_b64: String,
        response_b64: String,
    },
}

// ── HTTP ───────────────────────────────────────────────────────────

/// A recorded HTTP/1.x request. Bodies are normalized to strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpReq {
    pub method: String,
    pub url: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub url_params: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// A recorded HTTP/1.x response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResp {
    pub status_code: u16,
    pub status_message: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

// ── MongoDB ────────────────────────────────────────────────────────

/// MongoDB wire message header (16 bytes, little-endian on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MongoHeader {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub opcode: i32,
}

/// One section of an `OP_MSG` message.
///
/// Documents are stored as canonical extended-JSON strings so the BSON
/// round-trips losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MongoSection {
    /// Section kind 0: a single body document.
    Body { document: String },
    /// Section kind 1: an identified document sequence.
    DocSequence {
        identifier: String,
        documents: Vec<String>,
    },
}

/// A decoded MongoDB wire message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MongoMessage {
    Msg {
        flag_bits: u32,
        sections: Vec<MongoSection>,
        checksum: u32,
    },
    Query {
        flags: i32,
        full_collection_name: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: String,
        return_fields_selector: Option<String>,
    },
    Reply {
        response_flags: i32,
        cursor_id: i64,
        starting_from: i32,
        number_returned: i32,
        documents: Vec<String>,
    },
    /// Opcodes we don't decode; replayed from the raw bytes.
    Unknown { raw_b64: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoRequest {
    pub header: MongoHeader,
    pub message: MongoMessage,
    pub read_delay_ns: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoResponse {
    pub header: MongoHeader,
    pub message: MongoMessage,
    pub read_delay_ns: i64,
}

// ── gRPC ───────────────────────────────────────────────────────────

/// Captured HTTP/2 header block, split into pseudo and ordinary headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrpcHeaders {
    pub pseudo: BTreeMap<String, String>,
    pub ordinary: BTreeMap<String, String>,
}

/// The 5-byte-prefixed gRPC message framing, with the payload rendered
/// into the schema-less wire-text form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthPrefixedMessage {
    pub compression_flag: u8,
    pub message_length: u32,
    pub decoded_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcReq {
    pub headers: GrpcHeaders,
    pub body: LengthPrefixedMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcResp {
    pub headers: GrpcHeaders,
    pub body: LengthPrefixedMessage,
    pub trailers: GrpcHeaders,
}

// ── PostgreSQL ─────────────────────────────────────────────────────

/// One PostgreSQL v3 frame: the raw bytes for bit-exact replay plus the
/// decoded fields the matcher compares.
///
/// `tag` is the single-character message type; `'\0'` for the untyped
/// startup packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgFrame {
    pub tag: char,
    pub raw_b64: String,
    pub decoded: PgDecoded,
}

/// Decoded fields of a PostgreSQL frame, used for structural matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PgDecoded {
    Startup {
        protocol_version: u32,
        parameters: BTreeMap<String, String>,
    },
    SslRequest,
    CancelRequest,
    Parse {
        name: String,
        query: String,
        param_oids: Vec<u32>,
    },
    Bind {
        portal: String,
        statement: String,
        parameters_b64: Vec<Option<String>>,
    },
    Describe {
        target: char,
        name: String,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Query {
        query: String,
    },
    Sync,
    Terminate,
    PasswordMessage,
    Authentication {
        code: i32,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData,
    ParseComplete,
    BindComplete,
    CloseComplete,
    RowDescription {
        fields: Vec<String>,
    },
    DataRow {
        columns_b64: Vec<Option<String>>,
    },
    CommandComplete {
        command_tag: String,
    },
    EmptyQueryResponse,
    ErrorResponse {
        fields: BTreeMap<String, String>,
    },
    NoticeResponse,
    ReadyForQuery {
        status: char,
    },
    /// Any frame type we don't decode; matched on raw bytes.
    Opaque,
}

// ── Redis ──────────────────────────────────────────────────────────

/// A RESP value in canonical form. Bulk strings keep their bytes as
/// base64 so binary-safe values survive serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RespValue {
    Simple { value: String },
    Error { value: String },
    Integer { value: i64 },
    Bulk { value_b64: String },
    NullBulk,
    Array { items: Vec<RespValue> },
    NullArray,
}

/// One logical RESP exchange unit (a command or a reply).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespPayload {
    pub message: Vec<RespValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_http_spec() -> MockSpec {
        MockSpec::new(ProtocolPayload::Http {
            req: HttpReq {
                method: "GET".into(),
                url: "/users?id=42".into(),
                proto_major: 1,
                proto_minor: 1,
                headers: BTreeMap::from([("host".to_string(), "api".to_string())]),
                body: String::new(),
                url_params: BTreeMap::from([("id".to_string(), "42".to_string())]),
                timestamp: Utc::now(),
            },
            resp: HttpResp {
                status_code: 200,
                status_message: "OK".into(),
                headers: BTreeMap::new(),
                body: "{\"name\":\"alice\"}".into(),
                timestamp: Utc::now(),
            },
        })
    }

    #[test]
    fn mock_serde_round_trip() {
        let mock = Mock::new(MockKind::Http, "mock-1", sample_http_spec(), 1);
        let json = serde_json::to_string(&mock).unwrap();
        let back: Mock = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, MockKind::Http);
        assert_eq!(back.name, "mock-1");
        assert!(back.test_mode_info.is_filtered);
        assert_eq!(back.test_mode_info.sort_order, 1);
    }

    #[test]
    fn into_config_clears_filtered_and_tags_metadata() {
        let mock = Mock::new(MockKind::Mongo, "hb", sample_http_spec(), 7).into_config();
        assert!(!mock.test_mode_info.is_filtered);
        assert!(mock.is_config());
    }

    #[test]
    fn timestamps_are_ordered_at_creation() {
        let spec = sample_http_spec();
        assert!(spec.req_timestamp <= spec.res_timestamp);
    }

    #[test]
    fn kind_strings() {
        assert_eq!(MockKind::Postgres.as_str(), "POSTGRES");
        assert_eq!(MockKind::Kafka.as_str(), "KAFKA");
    }

    #[test]
    fn mongo_message_serde_is_tagged() {
        let msg = MongoMessage::Msg {
            flag_bits: 2,
            sections: vec![MongoSection::Body {
                document: "{\"hello\":1}".into(),
            }],
            checksum: 0,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"op\":\"msg\""));
        let back: MongoMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
