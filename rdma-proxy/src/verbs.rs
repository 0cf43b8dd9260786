//! Safe-ish wrappers over the `libibverbs` half of the external capability
//! (`alloc_pd` / `create_cq` / `reg_mr` / `create_qp` / `post_send` /
//! `post_recv` / `poll_cq`), plus the [`CompletionSource`] / [`QueuePair`]
//! / [`MrRegistrar`] seams that let the allocator and proxy state machine
//! be driven in-process by a fake instead of real hardware.

use crate::error::{RdmaError, RdmaResult};
use crate::ffi;
use std::ptr;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct ProtectionDomain(pub(crate) *mut ffi::ibv_pd);

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

pub fn alloc_pd(verbs_ctx: *mut ffi::ibv_context) -> RdmaResult<ProtectionDomain> {
    let pd = unsafe { ffi::ibv_alloc_pd(verbs_ctx) };
    if pd.is_null() {
        return Err(RdmaError::from_errno("ibv_alloc_pd"));
    }
    Ok(ProtectionDomain(pd))
}

pub fn dealloc_pd(pd: ProtectionDomain) -> RdmaResult<()> {
    let rc = unsafe { ffi::ibv_dealloc_pd(pd.0) };
    if rc != 0 {
        return Err(RdmaError::from_errno("ibv_dealloc_pd"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct RawCq(pub(crate) *mut ffi::ibv_cq);

unsafe impl Send for RawCq {}
unsafe impl Sync for RawCq {}

pub fn create_cq(verbs_ctx: *mut ffi::ibv_context, capacity: i32) -> RdmaResult<RawCq> {
    let cq = unsafe {
        ffi::ibv_create_cq(verbs_ctx, capacity, ptr::null_mut(), ptr::null_mut(), 0)
    };
    if cq.is_null() {
        return Err(RdmaError::from_errno("ibv_create_cq"));
    }
    Ok(RawCq(cq))
}

pub fn destroy_cq(cq: RawCq) -> RdmaResult<()> {
    let rc = unsafe { ffi::ibv_destroy_cq(cq.0) };
    if rc != 0 {
        return Err(RdmaError::from_errno("ibv_destroy_cq"));
    }
    Ok(())
}

/// Which side of a QP a work completion belongs to, collapsed down from
/// the much larger `ibv_wc_opcode` space: everything this crate posts is
/// either a tagged `SEND` or an untagged receive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
    Other(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub success: bool,
    pub raw_status: u32,
    pub opcode: WcOpcode,
    /// Bytes actually written by the peer; meaningful for recv
    /// completions only.
    pub byte_len: u32,
}

/// One non-blocking poll of a completion queue. Implemented for real CQs
/// via `ibv_poll_cq`, and by an in-process fake in tests.
pub trait CompletionSource: Send + Sync {
    fn poll(&self) -> Option<WorkCompletion>;
}

pub struct LiveCq {
    cq: RawCq,
}

impl LiveCq {
    pub fn new(cq: RawCq) -> LiveCq {
        LiveCq { cq }
    }
}

impl CompletionSource for LiveCq {
    fn poll(&self) -> Option<WorkCompletion> {
        let mut wc: ffi::ibv_wc = unsafe { std::mem::zeroed() };
        let n = unsafe { ffi::ibv_poll_cq(self.cq.0, 1, &mut wc) };
        if n <= 0 {
            return None;
        }
        let opcode = if wc.opcode & ffi::IBV_WC_RECV != 0 {
            WcOpcode::Recv
        } else if wc.opcode == ffi::IBV_WC_SEND {
            WcOpcode::Send
        } else {
            WcOpcode::Other(wc.opcode)
        };
        Some(WorkCompletion {
            wr_id: wc.wr_id,
            success: wc.status == ffi::IBV_WC_SUCCESS,
            raw_status: wc.status,
            opcode,
            byte_len: wc.byte_len,
        })
    }
}

/// A registered memory region: the raw handle and the `lkey` WRs need to
/// reference it.
#[derive(Debug, Clone, Copy)]
pub struct RegisteredMr {
    pub lkey: u32,
    pub(crate) raw: *mut ffi::ibv_mr,
}

unsafe impl Send for RegisteredMr {}

/// Mediates MR registration so the allocator's free-list logic can be
/// exercised without a PD or real hardware: tests register against
/// [`NullRegistrar`], production code against [`VerbsRegistrar`].
pub trait MrRegistrar: Send + Sync {
    fn reg_mr(&self, pd: ProtectionDomain, addr: *mut u8, len: usize) -> RdmaResult<RegisteredMr>;
    fn dereg_mr(&self, mr: RegisteredMr) -> RdmaResult<()>;
}

pub struct VerbsRegistrar;

impl MrRegistrar for VerbsRegistrar {
    fn reg_mr(&self, pd: ProtectionDomain, addr: *mut u8, len: usize) -> RdmaResult<RegisteredMr> {
        let access = ffi::IBV_ACCESS_LOCAL_WRITE | ffi::IBV_ACCESS_REMOTE_WRITE;
        let raw = unsafe {
            ffi::ibv_reg_mr(pd.0, addr as *mut std::ffi::c_void, len, access as i32)
        };
        if raw.is_null() {
            return Err(RdmaError::from_errno("ibv_reg_mr"));
        }
        let lkey = unsafe { (*raw).lkey };
        Ok(RegisteredMr { lkey, raw })
    }

    fn dereg_mr(&self, mr: RegisteredMr) -> RdmaResult<()> {
        let rc = unsafe { ffi::ibv_dereg_mr(mr.raw) };
        if rc != 0 {
            return Err(RdmaError::from_errno("ibv_dereg_mr"));
        }
        Ok(())
    }
}

/// Fakes out registration with a monotonically increasing `lkey` and no
/// actual hardware call; used by the allocator's own tests.
pub struct NullRegistrar {
    next_lkey: Mutex<u32>,
}

impl NullRegistrar {
    pub fn new() -> NullRegistrar {
        NullRegistrar { next_lkey: Mutex::new(1) }
    }
}

impl Default for NullRegistrar {
    fn default() -> NullRegistrar {
        NullRegistrar::new()
    }
}

impl MrRegistrar for NullRegistrar {
    fn reg_mr(&self, _pd: ProtectionDomain, _addr: *mut u8, _len: usize) -> RdmaResult<RegisteredMr> {
        let mut next = self.next_lkey.lock().unwrap();
        let lkey = *next;
        *next += 1;
        Ok(RegisteredMr { lkey, raw: ptr::null_mut() })
    }

    fn dereg_mr(&self, _mr: RegisteredMr) -> RdmaResult<()> {
        Ok(())
    }
}

/// A posted send or recv descriptor, ready to submit to a [`QueuePair`].
#[derive(Debug, Clone, Copy)]
pub struct PostedWr {
    pub wr_id: u64,
    pub addr: *mut u8,
    pub len: u32,
    pub lkey: u32,
}

unsafe impl Send for PostedWr {}

/// The submit half of a QP: posting sends/recvs. Implemented against the
/// real QP in production and against an in-process loopback fake in
/// tests (see `proxy::tests`).
pub trait QueuePair: Send + Sync {
    fn post_send(&self, wr: PostedWr) -> RdmaResult<()>;
    fn post_recv(&self, wr: PostedWr) -> RdmaResult<()>;

    /// Called once on disconnect so still-posted recv WRs that will never
    /// see a matching send are retired instead of leaking in-flight
    /// credits forever. Real QP teardown does this implicitly by flushing
    /// outstanding work with an error status when the QP is destroyed, so
    /// [`LiveQp`] leaves this a no-op; an in-process fake QP must do it
    /// itself since nothing destroys real hardware underneath it.
    fn flush(&self) {}
}

pub struct LiveQp {
    qp: *mut ffi::ibv_qp,
}

unsafe impl Send for LiveQp {}
unsafe impl Sync for LiveQp {}

impl LiveQp {
    pub fn new(qp: *mut ffi::ibv_qp) -> LiveQp {
        LiveQp { qp }
    }
}

impl QueuePair for LiveQp {
    fn post_send(&self, wr: PostedWr) -> RdmaResult<()> {
        let mut sge = ffi::ibv_sge {
            addr: wr.addr as u64,
            length: wr.len,
            lkey: wr.lkey,
        };
        let mut send_wr: ffi::ibv_send_wr = unsafe { std::mem::zeroed() };
        send_wr.wr_id = wr.wr_id;
        send_wr.opcode = ffi::IBV_WR_SEND;
        send_wr.send_flags = ffi::IBV_SEND_SIGNALED;
        send_wr.sg_list = &mut sge;
        send_wr.num_sge = 1;

        let mut bad_wr: *mut ffi::ibv_send_wr = ptr::null_mut();
        let rc = unsafe { ffi::ibv_post_send(self.qp, &mut send_wr, &mut bad_wr) };
        if rc != 0 {
            return Err(RdmaError::WrSubmission(format!("ibv_post_send rc={}", rc)));
        }
        Ok(())
    }

    fn post_recv(&self, wr: PostedWr) -> RdmaResult<()> {
        let mut sge = ffi::ibv_sge {
            addr: wr.addr as u64,
            length: wr.len,
            lkey: wr.lkey,
        };
        let mut recv_wr: ffi::ibv_recv_wr = unsafe { std::mem::zeroed() };
        recv_wr.wr_id = wr.wr_id;
        recv_wr.sg_list = &mut sge;
        recv_wr.num_sge = 1;

        let mut bad_wr: *mut ffi::ibv_recv_wr = ptr::null_mut();
        let rc = unsafe { ffi::ibv_post_recv(self.qp, &mut recv_wr, &mut bad_wr) };
        if rc != 0 {
            return Err(RdmaError::WrSubmission(format!("ibv_post_recv rc={}", rc)));
        }
        Ok(())
    }
}
