//! HMR channel messages and the browser client that speaks them.
//!
//! The wire format is Vite-compatible JSON. Only two custom events belong to
//! coalesce; everything else is the host's plain reload protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server → client: an ordered list of URLs that went stale.
pub const INVALIDATE_MODULES_EVENT: &str = "coalesce:invalidate-modules";

/// Client → server: the miss threshold was exceeded, regenerate the bundle.
pub const UPDATE_MODULES_EVENT: &str = "coalesce:update-modules";

/// Page global seeded with the server's invalidated URL snapshot.
pub const INVALIDATED_URLS_GLOBAL: &str = "__COALESCE_INVALIDATED_URLS__";

/// Route of the HMR client module.
pub const HMR_CLIENT_PATH: &str = "/@hmr-client";

/// Route of the HMR websocket.
pub const HMR_SOCKET_PATH: &str = "/__hmr";

/// A message on the HMR websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HmrMessage {
    /// Connected confirmation.
    Connected,
    /// Full page reload.
    Reload,
    /// Named event with an arbitrary payload, in either direction.
    Custom {
        event: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
}

impl HmrMessage {
    /// The invalidate event for `urls`, in order.
    #[must_use]
    pub fn invalidate_modules(urls: Vec<String>) -> Self {
        Self::Custom {
            event: INVALIDATE_MODULES_EVENT.to_string(),
            data: Value::from(urls),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"reload"}"#.to_string())
    }

    /// Parse a client frame. Frames this side does not understand are `None`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// HMR client runtime served at [`HMR_CLIENT_PATH`], connecting back to
/// `port`.
#[must_use]
pub fn client_runtime(port: u16) -> String {
    HMR_CLIENT_RUNTIME
        .replace("__HMR_PORT__", &port.to_string())
        .replace("__HMR_SOCKET_PATH__", HMR_SOCKET_PATH)
}

/// Reload-only HMR client with custom event support:
/// - `hot.on(event, cb)` listens for server events
/// - `hot.send(event, data)` sends a custom event to the server
const HMR_CLIENT_RUNTIME: &str = r"
// coalesce HMR client
const hmrPort = __HMR_PORT__;
const customListeners = new Map();
const outbox = [];

let ws;
let isConnected = false;

function setupWebSocket() {
  ws = new WebSocket(`ws://${location.hostname}:${hmrPort}__HMR_SOCKET_PATH__`);

  ws.onopen = () => {
    isConnected = true;
    while (outbox.length) ws.send(outbox.shift());
  };

  ws.onmessage = (event) => {
    handleMessage(JSON.parse(event.data));
  };

  ws.onclose = () => {
    if (isConnected) {
      console.log('[coalesce] server connection lost. Polling for restart...');
      isConnected = false;
      setTimeout(() => location.reload(), 1000);
    }
  };

  ws.onerror = (err) => {
    console.error('[coalesce] websocket error:', err);
  };
}

function handleMessage(msg) {
  switch (msg.type) {
    case 'connected':
      console.log('[coalesce] connected.');
      break;

    case 'reload':
      location.reload();
      break;

    case 'custom': {
      const listeners = customListeners.get(msg.event);
      if (listeners) {
        listeners.forEach((cb) => cb(msg.data));
      }
      break;
    }
  }
}

export function createHotContext(ownerPath) {
  return {
    ownerPath,

    on(event, cb) {
      if (!customListeners.has(event)) {
        customListeners.set(event, []);
      }
      customListeners.get(event).push(cb);
    },

    send(event, data) {
      const frame = JSON.stringify({ type: 'custom', event, data });
      if (ws && ws.readyState === WebSocket.OPEN) {
        ws.send(frame);
      } else {
        outbox.push(frame);
      }
    },
  };
}

setupWebSocket();
";
