//! Log streaming for pod containers.

mod stream;

pub use stream::{
    ERROR_EVENT, HEARTBEAT_INTERVAL, LogFrame, LogQuery, LogStream, LogStreamer, PING_EVENT,
    RECONNECT_EVENT, parse_last_event_id, split_timestamp,
};
