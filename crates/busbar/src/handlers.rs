//! One handler per request kind. Frames are split on the read thread, but
//! all request processing runs on the worker pool so a heavy handler never
//! starves I/O.

use std::sync::Arc;

use busbar_network::{Socket, SocketHandler};
use busbar_proto::{
    BodyType, ConfirmAliveReq, ConfirmAliveRsp, FrameHead, GetClientReq, GetClientRsp,
    HEAD_SIZE, MSG_TYPE_REQUEST, MSG_TYPE_RESPONSE, RegisterReq, RegisterRsp, SendMsgReq,
    SendMsgRsp, TypedBody, UnregisterReq, WireBody, pack_request, pack_response, split_frame,
};
use busbar_utils::WorkKind;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    forward::{BroadcastTask, UnicastTask},
    registry::RegistryError,
    server::BrokerCtx,
};

/// Per-connection hooks for every accepted client.
pub struct BrokerConn {
    ctx: Arc<BrokerCtx>,
}

impl BrokerConn {
    pub fn new(ctx: Arc<BrokerCtx>) -> Self {
        Self { ctx }
    }
}

impl SocketHandler for BrokerConn {
    fn on_read(&self, sock: &Arc<Socket>, data: &[u8]) -> usize {
        let mut consumed = 0;
        loop {
            match split_frame(&data[consumed..]) {
                Ok(None) => return consumed,
                Ok(Some((head, body))) => {
                    consumed += HEAD_SIZE + body.len();
                    let body = Bytes::copy_from_slice(body);
                    let ctx = Arc::clone(&self.ctx);
                    let conn = Arc::clone(sock);
                    let queued = self.ctx.pool.queue_work(
                        move || process_frame(&ctx, &conn, &head, &body),
                        WorkKind::Pooled,
                    );
                    if let Err(err) = queued {
                        warn!(id = sock.id(), ?err, "broker: request dropped, pool unavailable");
                    }
                }
                Err(err) => {
                    warn!(id = sock.id(), ?err, "broker: corrupt frame head, closing client");
                    self.ctx.registry.on_connection_closed(sock.id());
                    sock.close();
                    return consumed;
                }
            }
        }
    }

    fn on_error(&self, sock: &Arc<Socket>) {
        self.ctx.registry.on_connection_closed(sock.id());
    }

    fn on_close(&self, sock: &Arc<Socket>) {
        self.ctx.registry.on_connection_closed(sock.id());
    }

    fn on_timeout(&self, sock: &Arc<Socket>) -> bool {
        warn!(id = sock.id(), "broker: disconnecting idle client");
        self.ctx.registry.on_connection_closed(sock.id());
        sock.close();
        true
    }
}

fn process_frame(ctx: &Arc<BrokerCtx>, sock: &Arc<Socket>, head: &FrameHead, body: &Bytes) {
    if head.msg_type == MSG_TYPE_RESPONSE {
        // responses from clients (sync-send replies etc.) are not ours
        return;
    }
    if head.msg_type != MSG_TYPE_REQUEST {
        warn!(id = sock.id(), msg_type = head.msg_type, "broker: unknown message kind");
        return;
    }
    let Some(kind) = head.body_kind() else {
        warn!(id = sock.id(), body_type = head.body_type, "broker: unknown body type, frame dropped");
        return;
    };
    // Only registration and heartbeats are allowed before the first
    // successful register.
    if !matches!(kind, BodyType::ReqRegister | BodyType::ReqConfirmAlive)
        && !ctx.registry.is_conn_registered(sock.id())
    {
        warn!(id = sock.id(), req = ?kind, "broker: request from unregistered client ignored");
        return;
    }
    match kind {
        BodyType::ReqRegister => on_register(ctx, sock, head, body),
        BodyType::ReqUnregister => on_unregister(ctx, sock, body),
        BodyType::ReqSendMsg => on_send_msg(ctx, sock, head, body),
        BodyType::ReqGetClient => on_get_client(ctx, sock, head, body),
        BodyType::ReqConfirmAlive => on_confirm_alive(sock, head, body),
        BodyType::Typed => on_typed(ctx, sock, head, body),
        _ => debug!(id = sock.id(), req = ?kind, "broker: response body type in a request"),
    }
}

fn decode<B: WireBody>(sock: &Arc<Socket>, body: &Bytes) -> Option<B> {
    match B::decode_body(body) {
        Ok(req) => Some(req),
        Err(err) => {
            warn!(id = sock.id(), req = ?B::BODY_TYPE, ?err, "broker: malformed body dropped");
            None
        }
    }
}

/// Fills an omitted endpoint ip from the connection's peer address.
fn fill_host_ip(sock: &Arc<Socket>, host: &mut busbar_proto::Endpoint) -> Result<(), RegistryError> {
    if host.ip.is_empty() {
        match sock.peer_addr() {
            Some(addr) => host.ip = addr.ip().to_string(),
            None => return Err(RegistryError::NoHostIp),
        }
    }
    Ok(())
}

fn on_register(ctx: &Arc<BrokerCtx>, sock: &Arc<Socket>, head: &FrameHead, body: &Bytes) {
    let Some(req) = decode::<RegisterReq>(sock, body) else { return };
    debug!(id = sock.id(), name = %req.service_name, "broker: register request");

    let mut host = req.host;
    let result = fill_host_ip(sock, &mut host)
        .and_then(|()| ctx.registry.register(&req.service_name, host, sock));
    let rsp = match result {
        Ok(()) => RegisterRsp {
            ret_code: 0,
            service_name: req.service_name,
            err_msg: String::new(),
        },
        Err(err) => RegisterRsp {
            ret_code: 1,
            service_name: req.service_name,
            err_msg: err.to_string(),
        },
    };
    respond(sock, head, &rsp);
}

fn on_unregister(ctx: &Arc<BrokerCtx>, sock: &Arc<Socket>, body: &Bytes) {
    let Some(req) = decode::<UnregisterReq>(sock, body) else { return };
    if req.service_name.is_empty() {
        return;
    }
    debug!(id = sock.id(), name = %req.service_name, "broker: unregister request");
    let mut host = req.host;
    if fill_host_ip(sock, &mut host).is_err() {
        return;
    }
    ctx.registry.unregister(&req.service_name, &host);
}

fn on_send_msg(ctx: &Arc<BrokerCtx>, sock: &Arc<Socket>, head: &FrameHead, body: &Bytes) {
    let Some(req) = decode::<SendMsgReq>(sock, body) else { return };
    let rsp = if ctx.registry.has_match(&req.dest_name) {
        // Re-pack the whole request frame so recipients decode it with the
        // same codec, then hand one shared block to the queues.
        let payload = pack_request(head.msg_id, &req);
        if req.dest_name.is_empty() {
            ctx.forwarder.queue_broadcast(BroadcastTask { payload });
        } else {
            ctx.forwarder
                .queue_unicast(UnicastTask { dest_name: req.dest_name.clone(), payload });
        }
        SendMsgRsp { ret_code: 0, err_msg: String::new() }
    } else {
        SendMsgRsp { ret_code: 1, err_msg: "dest client not found.".to_string() }
    };
    respond(sock, head, &rsp);
}

fn on_get_client(ctx: &Arc<BrokerCtx>, sock: &Arc<Socket>, head: &FrameHead, body: &Bytes) {
    let Some(req) = decode::<GetClientReq>(sock, body) else { return };
    let rsp = match ctx.registry.lookup(&req.dest_name) {
        Some(host) => GetClientRsp { ret_code: 0, dest_name: req.dest_name, host },
        None => GetClientRsp {
            ret_code: 1,
            dest_name: req.dest_name,
            host: busbar_proto::Endpoint::default(),
        },
    };
    respond(sock, head, &rsp);
}

fn on_confirm_alive(sock: &Arc<Socket>, head: &FrameHead, body: &Bytes) {
    let Some(req) = decode::<ConfirmAliveReq>(sock, body) else { return };
    if req.alive_flag != 0 {
        debug!(id = sock.id(), flag = req.alive_flag, "broker: odd keep-alive flag");
    }
    respond(sock, head, &ConfirmAliveRsp { ret_code: req.alive_flag as u16 });
}

fn on_typed(ctx: &Arc<BrokerCtx>, sock: &Arc<Socket>, head: &FrameHead, body: &Bytes) {
    let Some(req) = decode::<TypedBody>(sock, body) else { return };
    ctx.typed.dispatch(sock, head, &req);
}

fn respond<B: WireBody>(sock: &Arc<Socket>, head: &FrameHead, rsp: &B) {
    if !sock.send_data(&pack_response(head.msg_id, rsp)) {
        debug!(id = sock.id(), rsp = ?B::BODY_TYPE, "broker: response dropped");
    }
}
