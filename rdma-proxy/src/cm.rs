//! Safe-ish wrappers over the `rdma_cm` half of the external capability:
//! event channels, CM ids, and the handshake primitives
//! (`resolve_addr`/`resolve_route`/`connect`/`accept`/`listen`/`bind`/
//! `disconnect`/`migrate_id`/`get_event`/`ack_event`/`destroy_id`).

use crate::error::{RdmaError, RdmaResult};
use crate::ffi;
use std::ffi::CString;
use std::io;
use std::mem;
use std::net::SocketAddrV4;
use std::ptr;

#[derive(Debug)]
pub struct EventChannel(pub(crate) *mut ffi::rdma_event_channel);

unsafe impl Send for EventChannel {}

impl EventChannel {
    pub fn create() -> RdmaResult<EventChannel> {
        let ec = unsafe { ffi::rdma_create_event_channel() };
        if ec.is_null() {
            return Err(RdmaError::from_errno("rdma_create_event_channel"));
        }
        Ok(EventChannel(ec))
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { ffi::rdma_destroy_event_channel(self.0) };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    RouteResolved,
    Established,
    ConnectRequest,
    Disconnected,
    Other(u32),
}

impl CmEventKind {
    fn from_raw(kind: u32) -> CmEventKind {
        match kind {
            k if k == ffi::RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
            k if k == ffi::RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
            k if k == ffi::RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
            k if k == ffi::RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
            k if k == ffi::RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
            other => CmEventKind::Other(other),
        }
    }
}

/// A raw `rdma_cm_id`, the handle shared between CM and verbs calls.
#[derive(Debug, Clone, Copy)]
pub struct CmId(pub(crate) *mut ffi::rdma_cm_id);

unsafe impl Send for CmId {}

impl CmId {
    pub fn create(ec: &EventChannel) -> RdmaResult<CmId> {
        let mut id: *mut ffi::rdma_cm_id = ptr::null_mut();
        let rc = unsafe {
            ffi::rdma_create_id(ec.0, &mut id, ptr::null_mut(), ffi::RDMA_PS_TCP)
        };
        if rc != 0 || id.is_null() {
            return Err(RdmaError::from_errno("rdma_create_id"));
        }
        Ok(CmId(id))
    }

    pub fn destroy(self) -> RdmaResult<()> {
        let rc = unsafe { ffi::rdma_destroy_id(self.0) };
        if rc != 0 {
            return Err(RdmaError::from_errno("rdma_destroy_id"));
        }
        Ok(())
    }

    pub fn verbs_context(&self) -> *mut ffi::ibv_context {
        unsafe { (*self.0).verbs }
    }

    pub fn bind_addr(&self, addr: SocketAddrV4) -> RdmaResult<()> {
        let sockaddr = to_sockaddr_in(addr);
        let rc = unsafe {
            ffi::rdma_bind_addr(self.0, &sockaddr as *const _ as *mut ffi::sockaddr)
        };
        if rc != 0 {
            return Err(RdmaError::from_errno("rdma_bind_addr"));
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> RdmaResult<()> {
        let rc = unsafe { ffi::rdma_listen(self.0, backlog) };
        if rc != 0 {
            return Err(RdmaError::from_errno("rdma_listen"));
        }
        Ok(())
    }

    pub fn resolve_addr(&self, host: &str, port: u16, timeout_ms: i32) -> RdmaResult<()> {
        let addr: SocketAddrV4 = match format!("{}:{}", host, port).parse() {
            Ok(addr) => addr,
            Err(_) => resolve_host(host, port).map_err(RdmaError::Io)?,
        };
        let sockaddr = to_sockaddr_in(addr);
        let rc = unsafe {
            ffi::rdma_resolve_addr(
                self.0,
                ptr::null_mut(),
                &sockaddr as *const _ as *mut ffi::sockaddr,
                timeout_ms,
            )
        };
        if rc != 0 {
            return Err(RdmaError::from_errno("rdma_resolve_addr"));
        }
        Ok(())
    }

    pub fn resolve_route(&self, timeout_ms: i32) -> RdmaResult<()> {
        let rc = unsafe { ffi::rdma_resolve_route(self.0, timeout_ms) };
        if rc != 0 {
            return Err(RdmaError::from_errno("rdma_resolve_route"));
        }
        Ok(())
    }

    pub fn connect(&self) -> RdmaResult<()> {
        let mut params: ffi::rdma_conn_param = unsafe { mem::zeroed() };
        let rc = unsafe { ffi::rdma_connect(self.0, &mut params) };
        if rc != 0 {
            return Err(RdmaError::from_errno("rdma_connect"));
        }
        Ok(())
    }

    pub fn accept(&self) -> RdmaResult<()> {
        let mut params: ffi::rdma_conn_param = unsafe { mem::zeroed() };
        let rc = unsafe { ffi::rdma_accept(self.0, &mut params) };
        if rc != 0 {
            return Err(RdmaError::from_errno("rdma_accept"));
        }
        Ok(())
    }

    pub fn disconnect(&self) -> RdmaResult<()> {
        let rc = unsafe { ffi::rdma_disconnect(self.0) };
        if rc != 0 {
            return Err(RdmaError::from_errno("rdma_disconnect"));
        }
        Ok(())
    }

    pub fn migrate_id(&self, ec: &EventChannel) -> RdmaResult<()> {
        let rc = unsafe { ffi::rdma_migrate_id(self.0, ec.0) };
        if rc != 0 {
            return Err(RdmaError::from_errno("rdma_migrate_id"));
        }
        Ok(())
    }

    pub fn channel(&self) -> *mut ffi::rdma_event_channel {
        unsafe { (*self.0).channel }
    }

    /// Builds an RC queue pair on this id via `rdma_create_qp`, which
    /// stashes the resulting `ibv_qp*` on the id itself (`qp()` reads it
    /// back out) rather than returning it directly.
    pub fn create_qp(
        &self,
        pd: crate::verbs::ProtectionDomain,
        send_cq: crate::verbs::RawCq,
        recv_cq: crate::verbs::RawCq,
        max_send_wr: u32,
        max_recv_wr: u32,
    ) -> RdmaResult<()> {
        let mut attr: ffi::ibv_qp_init_attr = unsafe { mem::zeroed() };
        attr.qp_type = ffi::IBV_QPT_RC;
        attr.send_cq = send_cq.0;
        attr.recv_cq = recv_cq.0;
        attr.cap.max_send_wr = max_send_wr;
        attr.cap.max_recv_wr = max_recv_wr;
        attr.cap.max_send_sge = 1;
        attr.cap.max_recv_sge = 1;

        let rc = unsafe { ffi::rdma_create_qp(self.0, pd.0, &mut attr) };
        if rc != 0 {
            return Err(RdmaError::from_errno("rdma_create_qp"));
        }
        Ok(())
    }

    pub fn qp(&self) -> *mut ffi::ibv_qp {
        unsafe { (*self.0).qp }
    }

    pub fn destroy_qp(&self) {
        unsafe { ffi::rdma_destroy_qp(self.0) };
    }
}

/// Blocks for exactly one CM event and matches it against `expected`,
/// acking it either way. Every handshake step in `connection.rs` is one
/// call to this.
pub fn wait_for_event(ec: *mut ffi::rdma_event_channel, expected: CmEventKind) -> RdmaResult<CmId> {
    let mut event: *mut ffi::rdma_cm_event = ptr::null_mut();
    let rc = unsafe { ffi::rdma_get_cm_event(ec, &mut event) };
    if rc != 0 || event.is_null() {
        return Err(RdmaError::from_errno("rdma_get_cm_event"));
    }
    let kind = CmEventKind::from_raw(unsafe { (*event).event });
    let id = unsafe { (*event).id };
    unsafe { ffi::rdma_ack_cm_event(event) };
    if kind != expected {
        return Err(RdmaError::setup(format!(
            "expected {:?}, got {:?}",
            expected, kind
        )));
    }
    Ok(CmId(id))
}

/// Blocks for exactly one CM event without an expectation, used by the
/// disconnect watcher, which treats every kind but `DISCONNECTED` as a
/// (logged) anomaly rather than a hard failure.
pub fn next_event(ec: *mut ffi::rdma_event_channel) -> RdmaResult<CmEventKind> {
    let mut event: *mut ffi::rdma_cm_event = ptr::null_mut();
    let rc = unsafe { ffi::rdma_get_cm_event(ec, &mut event) };
    if rc != 0 || event.is_null() {
        return Err(RdmaError::from_errno("rdma_get_cm_event"));
    }
    let kind = CmEventKind::from_raw(unsafe { (*event).event });
    unsafe { ffi::rdma_ack_cm_event(event) };
    Ok(kind)
}

fn to_sockaddr_in(addr: SocketAddrV4) -> ffi::sockaddr_in {
    let mut sin: ffi::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = ffi::AF_INET as ffi::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    sin
}

/// Resolves `host:port` via the OS resolver, keeping the first IPv4
/// address it returns. Any failure along the way, from a malformed
/// hostname to a resolver error, surfaces as the underlying `io::Error`.
fn resolve_host(host: &str, port: u16) -> io::Result<SocketAddrV4> {
    use std::net::ToSocketAddrs;
    CString::new(host).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    (host, port)
        .to_socket_addrs()?
        .find_map(|addr| match addr {
            std::net::SocketAddr::V4(v4) => Some(v4),
            _ => None,
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no IPv4 address found for {}:{}", host, port),
            )
        })
}
