//! UVC Stream Orchestrator (spec §4.6): glues source -> buffer pool ->
//! sink, reacting to STREAMON/STREAMOFF and buffer-ready events.

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::FourCc;
use crate::pool::BufferPool;
use crate::reactor::{Interest, Reactor, WatchId};
use crate::sink::Sink;
use crate::source::VideoSource;

const POOL_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Configured,
    Streaming,
}

pub struct Orchestrator {
    sink: Rc<RefCell<Sink>>,
    source: Box<dyn VideoSource>,
    reactor: Rc<Reactor>,
    pool: Option<BufferPool>,
    state: StreamState,
    buffer_watch: Option<WatchId>,
}

impl Orchestrator {
    pub fn new(sink: Rc<RefCell<Sink>>, source: Box<dyn VideoSource>, reactor: Rc<Reactor>) -> Self {
        Orchestrator { sink, source, reactor, pool: None, state: StreamState::Idle, buffer_watch: None }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// If `Streaming`, stop first (spec §9 open question: the safe order
    /// is stop -> reconfigure -> restart, not reconfigure-in-place).
    pub fn apply_format(&mut self, width: u32, height: u32, fourcc: FourCc) {
        if self.state == StreamState::Streaming {
            self.stop_streaming();
        }

        if let Err(e) = self.source.set_format(fourcc) {
            log::warn!("source rejected format {:?}: {e}; keeping previous configuration", fourcc.as_u32());
            return;
        }
        self.source.set_frame_size(width, height);

        if let Err(e) = self.sink.borrow_mut().set_format(fourcc, width, height) {
            log::warn!("sink rejected format: {e}");
            return;
        }

        if let Some(pool) = self.pool.take() {
            if let Err(e) = self.sink.borrow_mut().release_buffers(pool) {
                log::warn!("failed to release previous buffer pool: {e}");
            }
            self.source.free_buffers();
        }

        match self.sink.borrow_mut().request_buffers(POOL_SIZE) {
            Ok(pool) => {
                self.pool = Some(pool);
                self.state = StreamState::Configured;
                log::info!("stream configured: {width}x{height} {:?}", fourcc.as_u32());
            }
            Err(e) => {
                log::warn!("buffer allocation failed: {e}; awaiting re-commit");
                self.pool = None;
                self.state = StreamState::Configured;
            }
        }
    }

    pub fn set_fps(&mut self, fps: u32) {
        self.source.set_frame_rate(fps);
    }

    /// `Orchestrator::enable` takes `orch` as an explicit `Rc` (rather
    /// than `&mut self`) because turning the stream on registers a
    /// reactor callback that itself needs a handle back to this
    /// orchestrator (spec §9: no cyclic back-reference from source/sink
    /// to the orchestrator, but the reactor's callback table does need
    /// one).
    pub fn enable(orch: &Rc<RefCell<Orchestrator>>, on: bool) {
        if on {
            Self::enable_streaming(orch);
        } else {
            Self::disable_streaming(orch);
        }
    }

    fn enable_streaming(orch: &Rc<RefCell<Orchestrator>>) {
        let mut this = orch.borrow_mut();
        if this.state != StreamState::Configured {
            log::warn!(
                "{}",
                crate::error::Error::protocol(format!(
                    "STREAMON refused: stream is {:?}, not Configured",
                    this.state
                ))
            );
            return;
        }
        if this.pool.is_none() {
            log::warn!("STREAMON refused: no buffer pool (await re-commit)");
            return;
        }

        // Prime: queue every Free buffer before stream_on (spec §4.2
        // ordering requirement), drawn round-robin so priming order
        // matches the fairness order buffers are later recycled in.
        loop {
            let index = match this.pool.as_mut().unwrap().acquire_free() {
                Some(buf) => buf.index,
                None => break,
            };
            if let Err(e) = this.sink.borrow().queue(index, 0) {
                log::warn!("failed to prime buffer {index}: {e}");
                continue;
            }
            log::trace!("primed buffer {index}");
            this.pool.as_mut().unwrap().mark_queued(index);
        }
        debug_assert!(this.pool.as_ref().unwrap().invariant_holds());

        if let Err(e) = this.sink.borrow().stream_on() {
            log::warn!("STREAMON failed: {e}");
            return;
        }
        this.source.stream_on();
        this.state = StreamState::Streaming;
        log::info!("stream started");

        let sink_fd = this.sink.borrow().fd();
        let orch_for_cb = orch.clone();
        let watch_id = this.reactor.watch(
            sink_fd,
            Interest::READABLE,
            Box::new(move |_fd| {
                orch_for_cb.borrow_mut().on_buffer_ready();
            }),
        );
        this.buffer_watch = Some(watch_id);
    }

    fn disable_streaming(orch: &Rc<RefCell<Orchestrator>>) {
        let mut this = orch.borrow_mut();
        this.stop_streaming();
    }

    /// Shutdown sequence step (spec §4.8 step 8): stop the stream if
    /// running and release the buffer pool, if any.
    pub fn shutdown(orch: &Rc<RefCell<Orchestrator>>) {
        Self::disable_streaming(orch);
        let mut this = orch.borrow_mut();
        if let Some(pool) = this.pool.take() {
            if let Err(e) = this.sink.borrow_mut().release_buffers(pool) {
                log::warn!("failed to release buffers at shutdown: {e}");
            }
        }
        this.source.destroy();
    }

    fn stop_streaming(&mut self) {
        if self.state != StreamState::Streaming {
            return;
        }
        if let Some(id) = self.buffer_watch.take() {
            self.reactor.unwatch(id);
        }

        if let Err(e) = self.sink.borrow().stream_off() {
            log::warn!("STREAMOFF failed: {e}");
        }
        self.source.stream_off();

        // Drain kernel-owned buffers until would-block.
        if let Some(pool) = self.pool.as_mut() {
            loop {
                match self.sink.borrow().dequeue() {
                    Ok(Some(index)) => pool.mark_free(index),
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("error draining buffers on stop: {e}");
                        break;
                    }
                }
            }
        }
        self.state = StreamState::Configured;
        log::info!("stream stopped");
    }

    fn on_buffer_ready(&mut self) {
        let Some(pool) = self.pool.as_mut() else { return };

        let index = match self.sink.borrow().dequeue() {
            Ok(Some(index)) => index,
            Ok(None) => return,
            Err(e) => {
                log::warn!("dequeue failed: {e}");
                return;
            }
        };
        log::trace!("dequeued buffer {index}");
        pool.mark_free(index);

        let bytesused = {
            let Some(buf) = pool.by_index_mut(index) else { return };
            if let Some(active_frame) = self.source.pull_queued() {
                let n = active_frame.len().min(buf.capacity);
                buf.as_mut_slice()[..n].copy_from_slice(&active_frame[..n]);
                n
            } else {
                self.source.fill(buf.as_mut_slice())
            }
        };
        log::trace!("filled buffer {index} with {bytesused} bytes");
        pool.mark_filled(index, bytesused);

        if let Err(e) = self.sink.borrow().queue(index, bytesused as u32) {
            log::warn!("re-queue failed: {e}");
            return;
        }
        log::trace!("queued buffer {index}");
        pool.mark_queued(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use crate::sink::Sink;
    use crate::source::StaticSource;
    use std::fs;

    static NEXT: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

    /// A plain writable temp file stands in for the kernel device node:
    /// `enable_streaming`'s refusal path returns before any sink ioctl is
    /// issued, so no real v4l2 behavior is needed here.
    fn dummy_sink() -> Rc<RefCell<Sink>> {
        let path = std::env::temp_dir().join(format!(
            "uvc-gadget-daemon-orch-test-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        ));
        fs::write(&path, b"").unwrap();
        Rc::new(RefCell::new(Sink::open(&path).unwrap()))
    }

    /// S4 — STREAMON without a prior commit must be refused and the
    /// stream must stay Idle.
    #[test]
    fn streamon_without_commit_is_refused_and_stream_stays_idle() {
        let sink = dummy_sink();
        let source: Box<dyn VideoSource> = Box::new(StaticSource::new());
        let reactor = Rc::new(Reactor::new().unwrap());
        let orch = Rc::new(RefCell::new(Orchestrator::new(sink, source, reactor)));

        assert_eq!(orch.borrow().state(), StreamState::Idle);
        Orchestrator::enable(&orch, true);
        assert_eq!(orch.borrow().state(), StreamState::Idle);
    }
}
