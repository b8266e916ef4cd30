/// STOMP protocol version negotiated in `CONNECT`/`CONNECTED`.
pub const STOMP_VERSION: &str = "1.2";

/// Frame terminator.
pub const NULL: u8 = 0;

/// End-of-line. A frame made only of EOLs is a heartbeat.
pub const EOL: u8 = b'\n';

/// Carriage return, tolerated before `EOL`.
pub const CR: u8 = b'\r';

/// Content type of every body this protocol produces.
pub const CONTENT_TYPE_JSON: &str = "application/json";

// Header names.
pub const HDR_ACCEPT_VERSION: &str = "accept-version";
pub const HDR_AUTHORIZATION: &str = "Authorization";
pub const HDR_CONTENT_LENGTH: &str = "content-length";
pub const HDR_CONTENT_TYPE: &str = "content-type";
pub const HDR_DESTINATION: &str = "destination";
pub const HDR_HEART_BEAT: &str = "heart-beat";
pub const HDR_HOST: &str = "host";
pub const HDR_ID: &str = "id";
pub const HDR_ACK: &str = "ack";
pub const HDR_MESSAGE: &str = "message";
pub const HDR_MESSAGE_ID: &str = "message-id";
pub const HDR_RECEIPT: &str = "receipt";
pub const HDR_RECEIPT_ID: &str = "receipt-id";
pub const HDR_SERVER: &str = "server";
pub const HDR_SESSION: &str = "session";
pub const HDR_SUBSCRIPTION: &str = "subscription";
pub const HDR_VERSION: &str = "version";
