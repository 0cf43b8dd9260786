//! Client dial and server accept: the CM event sequences that produce a
//! fully-wired [`Proxy`].

use crate::cm::{CmEventKind, CmId, EventChannel};
use crate::config::Config;
use crate::error::{RdmaError, RdmaResult};
use crate::proxy::Proxy;
use crate::verbs::{self, MrRegistrar};
use slog::Logger;
use std::net::SocketAddrV4;
use std::sync::Arc;

fn build_proxy_over(cm_id: CmId, config: &Config, log: Logger) -> RdmaResult<Arc<Proxy>> {
    let verbs_ctx = cm_id.verbs_context();
    let pd = verbs::alloc_pd(verbs_ctx)?;
    let send_cq = verbs::create_cq(verbs_ctx, config.max_send_cqe)?;
    let recv_cq = verbs::create_cq(verbs_ctx, config.max_recv_cqe)?;
    let registrar: Arc<dyn MrRegistrar> = Arc::new(verbs::VerbsRegistrar);
    Proxy::generate(cm_id, pd, send_cq, recv_cq, registrar, config, log)
}

/// Dials a server by address and port, producing a ready-to-use Proxy.
pub struct Client {
    log: Logger,
}

impl Client {
    pub fn new(log: Logger) -> Client {
        Client { log }
    }

    pub fn connect(&self, host: &str, port: u16, config: &Config) -> RdmaResult<Arc<Proxy>> {
        let ec = EventChannel::create()?;
        let cm_id = CmId::create(&ec)?;

        cm_id.resolve_addr(host, port, config.resolve_timeout_ms)?;
        crate::cm::wait_for_event(ec.0, CmEventKind::AddrResolved)?;

        cm_id.resolve_route(config.resolve_timeout_ms)?;
        crate::cm::wait_for_event(ec.0, CmEventKind::RouteResolved)?;

        let proxy = build_proxy_over(cm_id, config, self.log.clone())?;

        cm_id.connect()?;
        crate::cm::wait_for_event(ec.0, CmEventKind::Established)?;

        // keep_ec: the channel this side created at the start of dialing
        // stays bound to the id for the life of the connection.
        proxy.finish_setup(ec);
        Ok(proxy)
    }
}

/// Listens on a port and accepts one connection at a time.
pub struct Server {
    log: Logger,
    ec: EventChannel,
    listen_id: CmId,
}

impl Server {
    pub fn new(log: Logger) -> RdmaResult<Server> {
        let ec = EventChannel::create()?;
        let listen_id = CmId::create(&ec)?;
        Ok(Server { log, ec, listen_id })
    }

    pub fn bind_and_listen(&mut self, port: u16, config: &Config) -> RdmaResult<()> {
        let addr = SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port);
        self.listen_id.bind_addr(addr)?;
        self.listen_id.listen(config.listen_backlog)
    }

    pub fn accept(&mut self, config: &Config) -> RdmaResult<Arc<Proxy>> {
        let conn_id = crate::cm::wait_for_event(self.ec.0, CmEventKind::ConnectRequest)?;

        let proxy = build_proxy_over(conn_id, config, self.log.clone())?;

        conn_id.accept()?;
        crate::cm::wait_for_event(self.ec.0, CmEventKind::Established)?;

        // keep_ec = false: give the connection its own event channel so
        // the listener's channel stays dedicated to further requests.
        let conn_ec = EventChannel::create()?;
        conn_id
            .migrate_id(&conn_ec)
            .map_err(|_| RdmaError::setup("failed to migrate accepted connection to its own channel"))?;
        proxy.finish_setup(conn_ec);
        Ok(proxy)
    }
}
