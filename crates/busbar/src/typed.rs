//! Dispatch for schema-described bodies: the wire type name selects a
//! decoder plus handler. Records are serde types carried as JSON, so a
//! handler registers once with its record type and never touches raw bytes.

use std::{collections::HashMap, sync::Arc};

use busbar_network::Socket;
use busbar_proto::{FrameHead, TypedBody, pack_response};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::warn;

pub const QUERY_SERVICES_REQ: &str = "busbar.QueryServicesReq";
pub const QUERY_SERVICES_RSP: &str = "busbar.QueryServicesRsp";

/// Asks the broker for every service name containing `match_prefix`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueryServicesReq {
    pub match_prefix: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueryServicesRsp {
    pub service_names: Vec<String>,
}

type Handler = Box<dyn Fn(&Arc<Socket>, &FrameHead, &[u8]) + Send + Sync>;

#[derive(Default)]
pub struct TypedDispatch {
    handlers: HashMap<String, Handler>,
}

impl TypedDispatch {
    /// Registers `f` for `type_name`; the raw record is decoded as `T`
    /// first, and undecodable records are logged and dropped.
    pub fn register_json<T, F>(&mut self, type_name: &str, f: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(&Arc<Socket>, &FrameHead, T) + Send + Sync + 'static,
    {
        let name = type_name.to_string();
        self.handlers.insert(
            type_name.to_string(),
            Box::new(move |sock, head, data| match serde_json::from_slice::<T>(data) {
                Ok(record) => f(sock, head, record),
                Err(err) => {
                    warn!(type_name = %name, ?err, "typed: undecodable record dropped");
                }
            }),
        );
    }

    pub fn dispatch(&self, sock: &Arc<Socket>, head: &FrameHead, body: &TypedBody) {
        match self.handlers.get(&body.type_name) {
            Some(handler) => handler(sock, head, &body.data),
            None => warn!(type_name = %body.type_name, "typed: no handler registered, dropped"),
        }
    }
}

/// Packs `record` as a typed response frame and queues it on `sock`.
pub fn send_typed_response<T: Serialize>(
    sock: &Arc<Socket>,
    msg_id: u32,
    type_name: &str,
    record: &T,
) -> bool {
    match serde_json::to_vec(record) {
        Ok(data) => {
            let body = TypedBody { type_name: type_name.to_string(), data: data.into() };
            sock.send_data(&pack_response(msg_id, &body))
        }
        Err(err) => {
            warn!(type_name, ?err, "typed: response failed to serialise");
            false
        }
    }
}
