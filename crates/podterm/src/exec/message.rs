//! JSON frames exchanged with the browser.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Bind,
    Stdin,
    Stdout,
    Resize,
    Toast,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalMessage {
    #[serde(alias = "Op")]
    pub op: Op,
    #[serde(alias = "Data", default)]
    pub data: String,
    #[serde(alias = "SessionID", default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(alias = "Rows", default)]
    pub rows: u16,
    #[serde(alias = "Cols", default)]
    pub cols: u16,
}

impl TerminalMessage {
    fn new(op: Op, data: impl Into<String>) -> Self {
        Self {
            op,
            data: data.into(),
            session_id: String::new(),
            rows: 0,
            cols: 0,
        }
    }

    pub fn bind(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::new(Op::Bind, "")
        }
    }

    pub fn stdin(data: impl Into<String>) -> Self {
        Self::new(Op::Stdin, data)
    }

    pub fn stdout(data: impl Into<String>) -> Self {
        Self::new(Op::Stdout, data)
    }

    pub fn toast(data: impl Into<String>) -> Self {
        Self::new(Op::Toast, data)
    }

    pub fn resize(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            ..Self::new(Op::Resize, "")
        }
    }
}
