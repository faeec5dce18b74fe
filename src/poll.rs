//! The per-device poll worker: waits on the UIO file for kernel
//! notifications, turns ring entries into [`ScsiCmd`]s, and posts responses
//! back into the ring.

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc::{Receiver, SendError, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;

use rustix::event::{PollFd, PollFlags};
use rustix::fd::OwnedFd;
use rustix::io::Errno;

use crate::error::{Error, Result};
use crate::ring::{Mailbox, RingOp, RSP_STATUS};
use crate::scsi::{ScsiCmd, ScsiResponse};

/// Capacity of the command and response channels. Keeping it small turns a
/// slow consumer into flow control on the kernel through the unadvanced
/// ring tail.
pub(crate) const CHANNEL_DEPTH: usize = 5;

/// How long to sit in poll(2) between delivery retries when the command
/// channel is full.
const DISPATCH_WAIT_MS: i32 = 10;

/// Commands produced by the poll worker, in ring order. The channel closes
/// when the device is shut down or the worker hits ring corruption.
pub type CmdReceiver = Receiver<ScsiCmd>;

/// Hands completed commands back to the poll worker.
///
/// Sending blocks while the response channel is full. Cloneable, so
/// responses may be produced from any number of threads and in any order.
#[derive(Clone)]
pub struct ResponseSender {
    tx: SyncSender<ScsiResponse>,
    doorbell: Arc<OwnedFd>,
}

impl fmt::Debug for ResponseSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSender").finish_non_exhaustive()
    }
}

impl ResponseSender {
    pub(crate) fn new(tx: SyncSender<ScsiResponse>, doorbell: Arc<OwnedFd>) -> Self {
        Self { tx, doorbell }
    }

    /// Queue `resp` for posting. Fails only after the device is closed.
    pub fn send(&self, resp: ScsiResponse) -> std::result::Result<(), SendError<ScsiResponse>> {
        self.tx.send(resp)?;
        // Wake the worker; it drains the counter, so a lost wakeup only
        // means the response rides along with the next one.
        let _ = rustix::io::write(&self.doorbell, &1u64.to_ne_bytes());
        Ok(())
    }
}

/// One consumed ring entry that the published tail may not pass yet.
struct Pending {
    /// Tail value once this entry is complete.
    end: u32,
    cmd_id: u16,
    status_off: usize,
    sense_off: usize,
    sense_cap: usize,
    done: bool,
}

pub(crate) struct PollWorker {
    mailbox: Mailbox,
    uio: Arc<OwnedFd>,
    exit: Arc<OwnedFd>,
    doorbell: Arc<OwnedFd>,
    cmd_tx: SyncSender<ScsiCmd>,
    resp_rx: Receiver<ScsiResponse>,
    /// Local read cursor; the published tail trails it while entries are
    /// outstanding.
    tail: u32,
    pending: VecDeque<Pending>,
    stop: bool,
}

impl PollWorker {
    pub fn new(
        mailbox: Mailbox,
        uio: Arc<OwnedFd>,
        exit: Arc<OwnedFd>,
        doorbell: Arc<OwnedFd>,
        cmd_tx: SyncSender<ScsiCmd>,
        resp_rx: Receiver<ScsiResponse>,
    ) -> Self {
        let tail = mailbox.cmd_tail();
        Self {
            mailbox,
            uio,
            exit,
            doorbell,
            cmd_tx,
            resp_rx,
            tail,
            pending: VecDeque::new(),
            stop: false,
        }
    }

    /// Run until shutdown or a fatal ring error. Dropping `self` afterwards
    /// closes the command channel, which is how the owner observes a fatal
    /// exit.
    pub fn run(mut self) {
        if let Err(err) = self.serve() {
            log::error!("poll worker failed: {err}");
        }
        log::debug!("poll worker exited");
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            self.post_responses();
            self.drain_ring()?;
            if self.stop {
                break;
            }
            self.wait_events()?;
        }
        self.drain_inflight();
        Ok(())
    }

    /// Walk the ring from the read cursor to the current head, emitting
    /// commands in ring order.
    fn drain_ring(&mut self) -> Result<()> {
        while !self.stop {
            let head = self.mailbox.cmd_head();
            if head == self.tail {
                break;
            }
            let hdr = self.mailbox.entry_at(self.tail)?;
            let end = (self.tail + hdr.stride) % self.mailbox.cmdr_size();
            match hdr.op() {
                Some(RingOp::Cmd) => {
                    let block = self.mailbox.cmd_block(&hdr)?;
                    let status_off =
                        (self.mailbox.cmdr_off() + hdr.off) as usize + RSP_STATUS;
                    self.pending.push_back(Pending {
                        end,
                        cmd_id: hdr.cmd_id,
                        status_off,
                        sense_off: block.sense_off,
                        sense_cap: block.sense_cap,
                        done: false,
                    });
                    let cmd = ScsiCmd::new(
                        Arc::clone(self.mailbox.region()),
                        hdr.cmd_id,
                        block,
                        self.mailbox.data_base(),
                    );
                    log::trace!("-> {cmd:?}");
                    if !self.dispatch(cmd) {
                        self.tail = end;
                        break;
                    }
                }
                Some(RingOp::Pad) => {
                    log::trace!("pad entry at {:#x}, {} bytes", hdr.off, hdr.stride);
                    self.push_completed(end);
                }
                Some(RingOp::Tmr) => {
                    // Task management is not dispatched; complete silently.
                    log::debug!("ignoring task-management entry {}", hdr.cmd_id);
                    self.push_completed(end);
                }
                None => {
                    log::warn!("skipping entry with unknown opcode at {:#x}", hdr.off);
                    self.push_completed(end);
                }
            }
            self.tail = end;
        }
        // Leading auto-completed entries may have unblocked the tail.
        self.advance_tail();
        Ok(())
    }

    fn push_completed(&mut self, end: u32) {
        self.pending.push_back(Pending {
            end,
            cmd_id: 0,
            status_off: 0,
            sense_off: 0,
            sense_cap: 0,
            done: true,
        });
    }

    /// Deliver one command, draining responses while the channel is full so
    /// a slow consumer cannot wedge completion.
    fn dispatch(&mut self, mut cmd: ScsiCmd) -> bool {
        loop {
            match self.cmd_tx.try_send(cmd) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    cmd = back;
                    self.post_responses();
                    if self.stop || self.poll_events(DISPATCH_WAIT_MS, false).is_err() {
                        log::debug!("dropping command {} on shutdown", cmd.id());
                        return false;
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::warn!("command channel closed by receiver, stopping");
                    self.stop = true;
                    return false;
                }
            }
        }
    }

    /// Post everything currently queued on the response channel.
    fn post_responses(&mut self) {
        let mut progressed = false;
        while let Ok(resp) = self.resp_rx.try_recv() {
            self.complete(resp);
            progressed = true;
        }
        if progressed {
            self.advance_tail();
        }
    }

    fn complete(&mut self, resp: ScsiResponse) {
        let Some(slot) = self
            .pending
            .iter_mut()
            .find(|p| !p.done && p.cmd_id == resp.id())
        else {
            log::warn!("response for unknown command id {}", resp.id());
            return;
        };
        let region = self.mailbox.region();
        let sense = resp.sense();
        if !sense.is_empty() {
            let n = sense.len().min(slot.sense_cap);
            region.copy_in(slot.sense_off, &sense[..n]);
        }
        region.write_u8_at(slot.status_off, resp.status());
        slot.done = true;
        log::trace!("<- command {} status {:#04x}", resp.id(), resp.status());
    }

    /// Publish the tail across the longest completed prefix and re-arm the
    /// kernel notification.
    fn advance_tail(&mut self) {
        let mut tail = None;
        while let Some(front) = self.pending.front() {
            if !front.done {
                break;
            }
            tail = Some(front.end);
            self.pending.pop_front();
        }
        if let Some(tail) = tail {
            self.mailbox.set_cmd_tail(tail);
            self.kick_kernel();
        }
    }

    fn kick_kernel(&self) {
        if let Err(err) = rustix::io::write(&self.uio, &0u32.to_ne_bytes()) {
            if err != Errno::AGAIN {
                log::warn!("failed to notify kernel: {err}");
            }
        }
    }

    /// Block until the kernel, a response, or shutdown wakes us.
    fn wait_events(&mut self) -> Result<()> {
        self.poll_events(-1, true)
    }

    fn poll_events(&mut self, timeout_ms: i32, include_uio: bool) -> Result<()> {
        let (exit_ready, bell_ready, uio_ready) = {
            let mut fds = vec![
                PollFd::new(&self.exit, PollFlags::IN),
                PollFd::new(&self.doorbell, PollFlags::IN),
            ];
            if include_uio {
                fds.push(PollFd::new(&self.uio, PollFlags::IN));
            }
            match rustix::event::poll(&mut fds, timeout_ms) {
                Ok(_) => {}
                Err(err) if err == Errno::INTR => return Ok(()),
                Err(err) => return Err(Error::Io(err.into())),
            }
            (
                fds[0].revents().contains(PollFlags::IN),
                fds[1].revents().contains(PollFlags::IN),
                include_uio && fds[2].revents().contains(PollFlags::IN),
            )
        };
        if exit_ready {
            self.stop = true;
        }
        if bell_ready {
            let _ = rustix::io::read(&self.doorbell, &mut [0u8; 8]);
        }
        if uio_ready {
            // Each read returns the cumulative interrupt counter.
            let _ = rustix::io::read(&self.uio, &mut [0u8; 4]);
        }
        Ok(())
    }

    /// Final bounded drain so responses already in flight still complete.
    fn drain_inflight(&mut self) {
        for _ in 0..CHANNEL_DEPTH {
            match self.resp_rx.try_recv() {
                Ok(resp) => self.complete(resp),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        self.advance_tail();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::thread;
    use std::time::{Duration, Instant};

    use rustix::event::{eventfd, EventfdFlags};

    use super::*;
    use crate::ring::testing::{TestEntry, TestRing};
    use crate::scsi::status;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        uio: UnixStream,
        exit: Arc<OwnedFd>,
        cmd_rx: CmdReceiver,
        responder: ResponseSender,
        worker: Option<thread::JoinHandle<()>>,
    }

    impl Harness {
        fn spawn(ring: &TestRing) -> Self {
            let mailbox = ring.mailbox();
            let (uio_worker, uio_test) = UnixStream::pair().unwrap();
            uio_worker.set_nonblocking(true).unwrap();
            let make_eventfd = || {
                Arc::new(
                    eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).unwrap(),
                )
            };
            let exit = make_eventfd();
            let doorbell = make_eventfd();
            let (cmd_tx, cmd_rx) = mpsc::sync_channel(CHANNEL_DEPTH);
            let (resp_tx, resp_rx) = mpsc::sync_channel(CHANNEL_DEPTH);
            let responder = ResponseSender::new(resp_tx, Arc::clone(&doorbell));
            let worker = PollWorker::new(
                mailbox,
                Arc::new(uio_worker.into()),
                Arc::clone(&exit),
                doorbell,
                cmd_tx,
                resp_rx,
            );
            Self {
                uio: uio_test,
                exit,
                cmd_rx,
                responder,
                worker: Some(thread::spawn(move || worker.run())),
            }
        }

        /// Pretend the kernel raised a UIO interrupt.
        fn kick(&mut self) {
            self.uio.write_all(&1u32.to_ne_bytes()).unwrap();
        }

        fn recv(&self) -> ScsiCmd {
            self.cmd_rx.recv_timeout(TIMEOUT).unwrap()
        }

        fn shutdown(&mut self) {
            let _ = rustix::io::write(&self.exit, &1u64.to_ne_bytes());
            if let Some(handle) = self.worker.take() {
                handle.join().unwrap();
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown();
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn wait_status(ring: &TestRing, ent: &TestEntry, status: u8) {
        wait_until(|| ring.status_at(ent) == status);
    }

    #[test]
    fn emits_in_ring_order_and_completes_out_of_order() {
        let mut ring = TestRing::new(64, 1024, 8192);
        let e7 = ring.push_cmd(7, &[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0], &[], 32);
        let e9 = ring.push_cmd(9, &[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0], &[], 32);
        let e11 = ring.push_cmd(11, &[0x2a, 0, 0, 0, 0, 0, 0, 0, 1, 0], &[], 32);
        let ring_end = ring.head();

        let mut h = Harness::spawn(&ring);
        h.kick();
        let ids: Vec<u16> = (0..3).map(|_| h.recv().id()).collect();
        assert_eq!(ids, [7, 9, 11]);

        // A response for an id that is not outstanding is ignored.
        h.responder.send(ScsiResponse::new(99, status::BUSY)).unwrap();

        h.responder
            .send(ScsiResponse::new(11, status::TASK_SET_FULL))
            .unwrap();
        wait_status(&ring, &e11, status::TASK_SET_FULL);
        // Entries 7 and 9 are still outstanding, so the tail cannot move.
        assert_eq!(ring.shared_tail(), e7.off);

        h.responder.send(ScsiResponse::new(7, status::BUSY)).unwrap();
        wait_until(|| ring.shared_tail() == e9.off);
        assert_eq!(ring.status_at(&e7), status::BUSY);

        h.responder
            .send(ScsiResponse::new(9, status::CHECK_CONDITION))
            .unwrap();
        wait_until(|| ring.shared_tail() == ring_end);
    }

    #[test]
    fn pad_at_ring_end_wraps_to_start() {
        let mut ring = TestRing::new(64, 256, 8192);
        ring.seek(192);
        ring.push_pad_to_end();
        let ent = ring.push_cmd(5, &[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0], &[], 32);
        assert_eq!(ent.off, 0);
        let ring_end = ring.head();

        let mut h = Harness::spawn(&ring);
        h.kick();
        let cmd = h.recv();
        assert_eq!(cmd.id(), 5);
        // Only the command came out; the pad was consumed silently.
        assert!(h.cmd_rx.try_recv().is_err());

        h.responder.send(cmd.ok()).unwrap();
        wait_until(|| ring.shared_tail() == ring_end);
        assert_eq!(ring.status_at(&ent), status::GOOD);
    }

    #[test]
    fn tmr_entries_are_skipped() {
        let mut ring = TestRing::new(64, 1024, 8192);
        ring.push_tmr(3);
        ring.push_cmd(4, &[0x00, 0, 0, 0, 0, 0], &[], 32);
        let ring_end = ring.head();

        let mut h = Harness::spawn(&ring);
        h.kick();
        let cmd = h.recv();
        assert_eq!(cmd.id(), 4);
        h.responder.send(cmd.ok()).unwrap();
        wait_until(|| ring.shared_tail() == ring_end);
    }

    #[test]
    fn sense_data_is_truncated_to_capacity() {
        let mut ring = TestRing::new(64, 1024, 8192);
        let ent = ring.push_cmd(2, &[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0], &[], 8);

        let mut h = Harness::spawn(&ring);
        h.kick();
        let cmd = h.recv();
        h.responder
            .send(cmd.check_condition(crate::scsi::sense_key::MEDIUM_ERROR, 0x1100))
            .unwrap();
        wait_status(&ring, &ent, status::CHECK_CONDITION);

        let mut expect = vec![0u8; 8];
        expect[0] = 0x70;
        expect[2] = crate::scsi::sense_key::MEDIUM_ERROR;
        expect[7] = 10;
        assert_eq!(ring.sense_at(&ent, 8), expect);
        // The byte past the capacity (entry padding) stays untouched.
        let mut past = [0xffu8; 1];
        ring.region.copy_out(ent.sense_off + 8, &mut past);
        assert_eq!(past, [0]);
    }

    #[test]
    fn close_under_backpressure_drops_and_exits() {
        let mut ring = TestRing::new(64, 2048, 8192);
        for id in 0..7 {
            ring.push_cmd(id, &[0x00, 0, 0, 0, 0, 0], &[], 32);
        }

        let mut h = Harness::spawn(&ring);
        h.kick();
        // Give the worker time to fill the channel and block on entry 5.
        thread::sleep(Duration::from_millis(100));
        h.shutdown();

        let mut delivered = Vec::new();
        loop {
            match h.cmd_rx.recv_timeout(TIMEOUT) {
                Ok(cmd) => delivered.push(cmd.id()),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => panic!("channel left open"),
            }
        }
        assert_eq!(delivered, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn ring_corruption_closes_the_channel() {
        let mut ring = TestRing::new(64, 1024, 8192);
        // Advance the producer index over a slot that holds no entry; the
        // zero header reads as a zero-length entry.
        ring.publish_raw(64);

        let mut h = Harness::spawn(&ring);
        h.kick();
        match h.cmd_rx.recv_timeout(TIMEOUT) {
            Err(RecvTimeoutError::Disconnected) => {}
            other => panic!("expected closed channel, got {other:?}"),
        }
        h.worker.take().unwrap().join().unwrap();
    }
}
