//! The Proxy runtime: owns a connection's two MR allocators, its CQs and
//! QP, and drives it through the CQ-poller and disconnect-watcher
//! threads from construction to teardown.

use crate::allocator::MrAllocator;
use crate::cm::CmId;
use crate::config::Config;
use crate::error::{RdmaError, RdmaResult};
use crate::verbs::{self, CompletionSource, MrRegistrar, PostedWr, ProtectionDomain, QueuePair, RawCq, WcOpcode, WorkCompletion};
use slog::Logger;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

struct Inner {
    messages: VecDeque<Vec<u8>>,
    recv_wrs: HashMap<u64, PostedWr>,
}

/// Resources torn down in a fixed order on the way out: QP, then MRs
/// (via the allocators' own `Drop`), then PD, then CM id, then event
/// channel. Absent entirely in test-harness proxies, which own none of
/// it.
struct ProxyContext {
    cm_id: Option<CmId>,
    pd: Option<ProtectionDomain>,
    event_channel: Option<crate::cm::EventChannel>,
}

pub struct Proxy {
    log: Logger,
    qp: Arc<dyn QueuePair>,
    send_cq: Arc<dyn CompletionSource>,
    recv_cq: Arc<dyn CompletionSource>,
    send_alloc: Arc<MrAllocator>,
    recv_alloc: Arc<MrAllocator>,
    inner: Mutex<Inner>,
    cv: Condvar,
    next_wr_id: AtomicU64,
    in_flight: AtomicI64,
    closing: AtomicBool,
    recv_slot_size: usize,
    poller: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    ctx: Mutex<Option<ProxyContext>>,
}

impl Proxy {
    /// Builds a Proxy over a fully-wired QP: allocates both MRs, creates
    /// the QP on `cm_id`, primes the recv credit pool, and starts the CQ
    /// poller. Called once CM has handed back a connected id with a PD
    /// and two CQs of adequate capacity.
    pub(crate) fn generate(
        cm_id: CmId,
        pd: ProtectionDomain,
        send_cq_raw: RawCq,
        recv_cq_raw: RawCq,
        registrar: Arc<dyn MrRegistrar>,
        config: &Config,
        log: Logger,
    ) -> RdmaResult<Arc<Proxy>> {
        let send_alloc = Arc::new(MrAllocator::new(Arc::clone(&registrar), log.clone()));
        send_alloc.register(pd, config.rdma_buffer_size)?;
        let recv_alloc = Arc::new(MrAllocator::new(registrar, log.clone()));
        recv_alloc.register(pd, config.rdma_buffer_size)?;

        cm_id.create_qp(pd, send_cq_raw, recv_cq_raw, config.max_send_wr, config.max_recv_wr)?;
        let qp: Arc<dyn QueuePair> = Arc::new(verbs::LiveQp::new(cm_id.qp()));
        let send_cq: Arc<dyn CompletionSource> = Arc::new(verbs::LiveCq::new(send_cq_raw));
        let recv_cq: Arc<dyn CompletionSource> = Arc::new(verbs::LiveCq::new(recv_cq_raw));

        let proxy = Proxy::assemble(
            qp, send_cq, recv_cq, send_alloc, recv_alloc, config, log, Some(cm_id), Some(pd),
        );
        for _ in 0..config.max_recv_cqe {
            proxy.post_recv()?;
        }
        Proxy::spawn_poller(&proxy);
        Ok(proxy)
    }

    /// Attaches the event channel the connection-setup handshake settled
    /// on (the client's original channel, or the server's freshly
    /// migrated one) and starts the disconnect watcher. Called exactly
    /// once per Proxy after setup's CM event consumption is complete.
    pub(crate) fn finish_setup(self: &Arc<Self>, ec: crate::cm::EventChannel) {
        let ec_ptr = ec.0;
        {
            let mut ctx = self.ctx.lock().unwrap();
            if let Some(ctx) = ctx.as_mut() {
                ctx.event_channel = Some(ec);
            }
        }
        let weak: Weak<Proxy> = Arc::downgrade(self);
        let ec_ptr = ec_ptr as usize;
        let handle = std::thread::spawn(move || Proxy::run_watcher(weak, ec_ptr));
        *self.watcher.lock().unwrap() = Some(handle);
    }

    fn assemble(
        qp: Arc<dyn QueuePair>,
        send_cq: Arc<dyn CompletionSource>,
        recv_cq: Arc<dyn CompletionSource>,
        send_alloc: Arc<MrAllocator>,
        recv_alloc: Arc<MrAllocator>,
        config: &Config,
        log: Logger,
        cm_id: Option<CmId>,
        pd: Option<ProtectionDomain>,
    ) -> Arc<Proxy> {
        Arc::new(Proxy {
            log,
            qp,
            send_cq,
            recv_cq,
            send_alloc,
            recv_alloc,
            inner: Mutex::new(Inner { messages: VecDeque::new(), recv_wrs: HashMap::new() }),
            cv: Condvar::new(),
            next_wr_id: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            closing: AtomicBool::new(false),
            recv_slot_size: config.recv_slot_size,
            poller: Mutex::new(None),
            watcher: Mutex::new(None),
            ctx: Mutex::new(Some(ProxyContext { cm_id, pd, event_channel: None })),
        })
    }

    fn spawn_poller(proxy: &Arc<Proxy>) {
        let owned = Arc::clone(proxy);
        let handle = std::thread::spawn(move || owned.run_poller());
        *proxy.poller.lock().unwrap() = Some(handle);
    }

    pub fn send_message(&self, payload: &[u8]) -> RdmaResult<()> {
        let wr_id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);
        let send_wr = self.send_alloc.allocate_send(wr_id, payload)?;
        let posted: PostedWr = (&send_wr).into();
        match self.qp.post_send(posted) {
            Ok(()) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.send_alloc.release(wr_id);
                Err(e)
            }
        }
    }

    /// Blocks until a message is available or the proxy has closed with
    /// nothing left to deliver. `None` means closed.
    pub fn recv_message(&self) -> Option<Vec<u8>> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(msg) = guard.messages.pop_front() {
                return Some(msg);
            }
            if self.closing.load(Ordering::SeqCst) {
                return None;
            }
            let (next, _timeout) =
                self.cv.wait_timeout(guard, Duration::from_millis(1000)).unwrap();
            guard = next;
        }
    }

    pub fn disconnect(&self) -> RdmaResult<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.qp.flush();
        self.cv.notify_all();
        let ctx = self.ctx.lock().unwrap();
        if let Some(cm_id) = ctx.as_ref().and_then(|c| c.cm_id) {
            return cm_id.disconnect();
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.closing.load(Ordering::SeqCst)
    }

    fn post_recv(&self) -> RdmaResult<()> {
        let wr_id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);
        let recv_wr = self.recv_alloc.allocate_recv(wr_id, self.recv_slot_size)?;
        let posted: PostedWr = (&recv_wr).into();

        self.inner.lock().unwrap().recv_wrs.insert(wr_id, posted);
        match self.qp.post_recv(posted) {
            Ok(()) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.inner.lock().unwrap().recv_wrs.remove(&wr_id);
                self.recv_alloc.release(wr_id);
                Err(e)
            }
        }
    }

    fn run_poller(self: Arc<Proxy>) {
        loop {
            while let Some(wc) = self.send_cq.poll() {
                self.handle_completion(wc);
            }
            while let Some(wc) = self.recv_cq.poll() {
                self.handle_completion(wc);
            }
            if self.in_flight.load(Ordering::SeqCst) <= 0 && self.closing.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(3));
        }
    }

    fn handle_completion(&self, wc: WorkCompletion) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !wc.success {
            if !self.closing.load(Ordering::SeqCst) {
                let err = RdmaError::Completion { wr_id: wc.wr_id, status: wc.raw_status as i32 };
                slog::error!(self.log, "{}", err; "error" => %err);
            }
            return;
        }
        match wc.opcode {
            WcOpcode::Recv => self.handle_recv_completion(wc),
            WcOpcode::Send => self.send_alloc.release(wc.wr_id),
            WcOpcode::Other(code) => {
                slog::warn!(self.log, "unknown completion opcode"; "opcode" => code);
            }
        }
    }

    fn handle_recv_completion(&self, wc: WorkCompletion) {
        let posted = self.inner.lock().unwrap().recv_wrs.remove(&wc.wr_id);
        let posted = match posted {
            Some(p) => p,
            None => return,
        };

        let mut bytes = unsafe {
            std::slice::from_raw_parts(posted.addr as *const u8, wc.byte_len as usize)
        }
        .to_vec();
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        self.recv_alloc.release(wc.wr_id);

        self.inner.lock().unwrap().messages.push_back(bytes);
        self.cv.notify_all();

        if !self.closing.load(Ordering::SeqCst) {
            if let Err(e) = self.post_recv() {
                slog::warn!(self.log, "recv credit replenishment failed"; "error" => %e);
            }
        }
    }

    fn run_watcher(weak: Weak<Proxy>, ec_ptr: usize) {
        let ec = ec_ptr as *mut crate::ffi::rdma_event_channel;
        let kind = crate::cm::next_event(ec);
        if let Some(proxy) = weak.upgrade() {
            match kind {
                Ok(crate::cm::CmEventKind::Disconnected) => {}
                Ok(other) => {
                    slog::warn!(proxy.log, "unexpected cm event on watcher"; "kind" => format!("{:?}", other));
                }
                Err(e) => {
                    slog::warn!(proxy.log, "cm event channel error"; "error" => %e);
                }
            }
            proxy.closing.store(true, Ordering::SeqCst);
            proxy.cv.notify_all();
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.disconnect();

        if let Some(h) = self.watcher.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.poller.lock().unwrap().take() {
            let _ = h.join();
        }

        let ctx = self.ctx.lock().unwrap().take();
        if let Some(cm_id) = ctx.as_ref().and_then(|c| c.cm_id) {
            cm_id.destroy_qp();
        }
        if let Err(e) = self.send_alloc.deregister() {
            slog::warn!(self.log, "dereg send mr failed"; "error" => %e);
        }
        if let Err(e) = self.recv_alloc.deregister() {
            slog::warn!(self.log, "dereg recv mr failed"; "error" => %e);
        }
        if let Some(ctx) = ctx {
            if let Some(pd) = ctx.pd {
                if let Err(e) = verbs::dealloc_pd(pd) {
                    slog::warn!(self.log, "dealloc_pd failed"; "error" => %e);
                }
            }
            if let Some(cm_id) = ctx.cm_id {
                if let Err(e) = cm_id.destroy() {
                    slog::warn!(self.log, "destroy cm id failed"; "error" => %e);
                }
            }
            // ctx.event_channel, if any, is destroyed when it drops here.
        }
    }
}

#[cfg(test)]
impl Proxy {
    /// Builds a Proxy over an in-process fake QP/CQ pair instead of real
    /// hardware, exercising the same send/recv/completion/teardown code
    /// paths as `generate` without a PD, CM id, or event channel.
    fn for_test(
        qp: Arc<dyn QueuePair>,
        send_cq: Arc<dyn CompletionSource>,
        recv_cq: Arc<dyn CompletionSource>,
        config: &Config,
        log: Logger,
    ) -> RdmaResult<Arc<Proxy>> {
        let registrar: Arc<dyn MrRegistrar> = Arc::new(verbs::NullRegistrar::new());
        let send_alloc = Arc::new(MrAllocator::new(Arc::clone(&registrar), log.clone()));
        send_alloc.register(ProtectionDomain(std::ptr::null_mut()), config.rdma_buffer_size)?;
        let recv_alloc = Arc::new(MrAllocator::new(registrar, log.clone()));
        recv_alloc.register(ProtectionDomain(std::ptr::null_mut()), config.rdma_buffer_size)?;

        let proxy = Proxy::assemble(qp, send_cq, recv_cq, send_alloc, recv_alloc, config, log, None, None);
        for _ in 0..config.max_recv_cqe {
            proxy.post_recv()?;
        }
        Proxy::spawn_poller(&proxy);
        Ok(proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque as Deque;

    /// One side's worth of in-process "hardware": a queue of recv slots
    /// posted but not yet filled, plus the two completion queues a real
    /// CQ pair would deliver.
    struct Shared {
        pending_recv: Mutex<Deque<PostedWr>>,
        recv_cq: Mutex<Deque<WorkCompletion>>,
        send_cq: Mutex<Deque<WorkCompletion>>,
    }

    impl Shared {
        fn new() -> Arc<Shared> {
            Arc::new(Shared {
                pending_recv: Mutex::new(Deque::new()),
                recv_cq: Mutex::new(Deque::new()),
                send_cq: Mutex::new(Deque::new()),
            })
        }
    }

    /// A QP whose `post_send` writes straight into the peer's next
    /// pending recv slot and synthesizes both sides' completions,
    /// standing in for the wire.
    struct LoopbackQp {
        local: Arc<Shared>,
        peer: Arc<Shared>,
    }

    impl QueuePair for LoopbackQp {
        fn post_send(&self, wr: PostedWr) -> RdmaResult<()> {
            let payload =
                unsafe { std::slice::from_raw_parts(wr.addr as *const u8, wr.len as usize) }.to_vec();

            // Real RC hardware retries a send that arrives with no recv
            // buffer posted (receiver-not-ready) rather than dropping it;
            // spin briefly for the peer's poller to replenish its credit
            // pool instead of losing the message.
            let slot = loop {
                if let Some(slot) = self.peer.pending_recv.lock().unwrap().pop_front() {
                    break slot;
                }
                std::thread::sleep(Duration::from_micros(200));
            };
            let n = payload.len().min(slot.len as usize);
            unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), slot.addr, n) };
            self.peer.recv_cq.lock().unwrap().push_back(WorkCompletion {
                wr_id: slot.wr_id,
                success: true,
                raw_status: 0,
                opcode: WcOpcode::Recv,
                byte_len: n as u32,
            });

            self.local.send_cq.lock().unwrap().push_back(WorkCompletion {
                wr_id: wr.wr_id,
                success: true,
                raw_status: 0,
                opcode: WcOpcode::Send,
                byte_len: wr.len,
            });
            Ok(())
        }

        fn post_recv(&self, wr: PostedWr) -> RdmaResult<()> {
            self.local.pending_recv.lock().unwrap().push_back(wr);
            Ok(())
        }

        fn flush(&self) {
            let mut pending = self.local.pending_recv.lock().unwrap();
            let mut cq = self.local.recv_cq.lock().unwrap();
            while let Some(wr) = pending.pop_front() {
                cq.push_back(WorkCompletion {
                    wr_id: wr.wr_id,
                    success: false,
                    raw_status: 5,
                    opcode: WcOpcode::Recv,
                    byte_len: 0,
                });
            }
        }
    }

    struct LoopbackCq {
        shared: Arc<Shared>,
        is_send: bool,
    }

    impl CompletionSource for LoopbackCq {
        fn poll(&self) -> Option<WorkCompletion> {
            let queue = if self.is_send { &self.shared.send_cq } else { &self.shared.recv_cq };
            queue.lock().unwrap().pop_front()
        }
    }

    fn make_pair() -> (Arc<Proxy>, Arc<Proxy>) {
        let a = Shared::new();
        let b = Shared::new();
        let cfg = Config { max_recv_cqe: 8, max_send_cqe: 8, max_recv_wr: 8, max_send_wr: 8, ..Config::default() };
        let log = flux::logging::discard();

        let qp_a: Arc<dyn QueuePair> = Arc::new(LoopbackQp { local: Arc::clone(&a), peer: Arc::clone(&b) });
        let send_cq_a: Arc<dyn CompletionSource> = Arc::new(LoopbackCq { shared: Arc::clone(&a), is_send: true });
        let recv_cq_a: Arc<dyn CompletionSource> = Arc::new(LoopbackCq { shared: Arc::clone(&a), is_send: false });

        let qp_b: Arc<dyn QueuePair> = Arc::new(LoopbackQp { local: Arc::clone(&b), peer: Arc::clone(&a) });
        let send_cq_b: Arc<dyn CompletionSource> = Arc::new(LoopbackCq { shared: Arc::clone(&b), is_send: true });
        let recv_cq_b: Arc<dyn CompletionSource> = Arc::new(LoopbackCq { shared: b, is_send: false });

        let client = Proxy::for_test(qp_a, send_cq_a, recv_cq_a, &cfg, log.clone()).unwrap();
        let server = Proxy::for_test(qp_b, send_cq_b, recv_cq_b, &cfg, log).unwrap();
        (client, server)
    }

    #[test]
    fn p1_single_echo() {
        let (client, server) = make_pair();
        client.send_message(b"hello").unwrap();
        let msg = server.recv_message().expect("message");
        assert_eq!(msg, b"hello");
    }

    #[test]
    fn p2_concurrent_producers() {
        let (client, server) = make_pair();
        let mut handles = Vec::new();
        for i in 0..3 {
            let c = Arc::clone(&client);
            handles.push(std::thread::spawn(move || {
                for j in 0..10 {
                    c.send_message(format!("thread {} : {}", i, j).as_bytes()).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..30 {
            received.push(server.recv_message().expect("message"));
        }

        let mut expected: Vec<Vec<u8>> = Vec::new();
        for i in 0..3 {
            for j in 0..10 {
                expected.push(format!("thread {} : {}", i, j).into_bytes());
            }
        }
        received.sort();
        expected.sort();
        assert_eq!(received, expected);
    }

    #[test]
    fn p3_clean_teardown() {
        let (client, server) = make_pair();
        client.send_message(b"x").unwrap();
        assert!(server.recv_message().is_some());

        client.disconnect().unwrap();
        // Stands in for the CM DISCONNECTED event a real watcher would
        // receive once the peer tears its connection down.
        server.disconnect().unwrap();

        assert_eq!(server.recv_message(), None);

        std::thread::sleep(Duration::from_millis(50));
        assert!(!client.is_active());
        assert!(!server.is_active());
    }
}
