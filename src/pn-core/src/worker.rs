//! Per-core worker runtime (spec.md §4.8). Grounded on `pn_icc::IccHandlerTable` (the typed
//! `icc_register(type, fn_ptr)` replacement already used by the original's `main.c` worker
//! registration) and on `macos/vstate.rs`'s `Vcpu::run` shape — a boot-signal wait followed by a
//! context-switch loop that reports back to its controller once the guest exits — regenerated on
//! top of [`pn_icc`]'s mailbox router instead of HVF's park/signal machinery.
//!
//! Actual guest execution (the ELF loader and the vCPU context switch itself) is out of scope for
//! this workspace: [`GuestLoader`] and [`GuestTask`] name the seam a real backend fills in. This
//! runtime only owns the ICC-visible state machine around that seam: dispatching START/PAUSE/
//! RESUME/STOP and turning a guest's exit reason into the right reply.
//!
//! PAUSE is dispatched through the same mailbox as every other message, rather than delivered
//! out-of-band on interrupt vector 49 (see [`pn_icc::PAUSE_VECTOR`]) — there is no real interrupt
//! controller in this workspace to preempt a running guest context switch, the same
//! simplification `crate::vm_registry` makes on the sending side.

use std::sync::Arc;

use parking_lot::Mutex;

use pn_icc::{
    IccHandlerTable, IccMessage, IccMessageType, IccPayload, IccRouter, StartedPayload,
    StdioRingHandle, StoppedPayload,
};

/// How a guest task's `step()` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestExit {
    /// The guest returned voluntarily and remains resumable (spec.md §4.8: "a voluntary guest
    /// return" with the task still live).
    Yielded,
    /// The guest returned voluntarily and will not run again, e.g. it called an exit syscall.
    Exited { return_code: i32 },
    /// The guest trapped into a fault handler; `vector` becomes `errno` (spec.md §4.8).
    Fault { vector: i32 },
}

/// One loaded, resumable guest execution context. A real implementation wraps a vCPU and the
/// loaded image; `step` performs the context-switch in and blocks until the guest yields back.
pub trait GuestTask {
    fn step(&mut self) -> GuestExit;
}

/// Loads a guest image at `vm_addr` into a fresh [`GuestTask`] (spec.md §4.8's "ELF loader
/// collaborator"). `vm_addr` is the VM record handed in the `Start` message's payload.
pub trait GuestLoader {
    type Task: GuestTask;

    fn load(&mut self, vm_addr: u64) -> Result<Self::Task, LoaderError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("guest image load failed: {reason}")]
pub struct LoaderError {
    pub reason: String,
}

struct WorkerState<L: GuestLoader> {
    loader: L,
    task: Option<L::Task>,
}

/// Drives one non-manager core's ICC handlers and guest task. Constructed once per core; `poll`
/// is driven from that core's own loop (spec.md §4.8: "registers ICC handlers ... then runs its
/// event loop").
pub struct WorkerRuntime<L: GuestLoader> {
    apic_id: u32,
    icc: Arc<IccRouter>,
    handlers: IccHandlerTable,
    state: Arc<Mutex<WorkerState<L>>>,
}

impl<L> WorkerRuntime<L>
where
    L: GuestLoader + Send + 'static,
    L::Task: Send,
{
    pub fn new(apic_id: u32, icc: Arc<IccRouter>, loader: L) -> Self {
        let state = Arc::new(Mutex::new(WorkerState { loader, task: None }));
        let handlers = IccHandlerTable::new();

        register(&handlers, IccMessageType::Start, &state, &icc, apic_id, on_start);
        register(&handlers, IccMessageType::Pause, &state, &icc, apic_id, on_pause);
        register(&handlers, IccMessageType::Resume, &state, &icc, apic_id, on_resume);
        register(&handlers, IccMessageType::Stop, &state, &icc, apic_id, on_stop);

        Self {
            apic_id,
            icc,
            handlers,
            state,
        }
    }

    /// Drains and dispatches one pending ICC message, if any. Returns whether one was processed,
    /// so a caller driving several idle cores can round-robin without blocking on any one of
    /// them.
    pub fn poll(&self) -> bool {
        match self.icc.try_recv(self.apic_id) {
            Ok(Some(msg)) => {
                let _ = self.handlers.dispatch(msg);
                true
            }
            _ => false,
        }
    }
}

/// Registers `on` for `ty`, closing over `state`/`icc`/`apic_id` for the handler's lifetime.
/// A thin adapter so [`WorkerRuntime::new`] doesn't repeat the clone-then-box dance four times.
fn register<L>(
    handlers: &IccHandlerTable,
    ty: IccMessageType,
    state: &Arc<Mutex<WorkerState<L>>>,
    icc: &Arc<IccRouter>,
    apic_id: u32,
    on: fn(u32, &IccRouter, &Mutex<WorkerState<L>>, IccMessage),
) where
    L: GuestLoader + Send + 'static,
    L::Task: Send,
{
    let state = Arc::clone(state);
    let icc = Arc::clone(icc);
    handlers
        .register(
            ty,
            Arc::new(move |msg: IccMessage| on(apic_id, &icc, &state, msg)),
        )
        .expect("WorkerRuntime registers each message type exactly once");
}

fn reply(icc: &IccRouter, apic_id: u32, payload: IccPayload) {
    let _ = icc.send(0, IccMessage::new(apic_id, payload));
}

fn reply_with_result(icc: &IccRouter, apic_id: u32, payload: IccPayload, result: i32) {
    let _ = icc.send(0, IccMessage::with_result(apic_id, payload, result));
}

/// No real guest-physical memory backs these rings in this workspace (`crate::vm_registry`'s
/// manager side never reads back the `StartedPayload` handle fields, only `IccMessage::result`),
/// so there is nothing meaningful to report here beyond a nominal capacity.
fn placeholder_ring_handle() -> StdioRingHandle {
    StdioRingHandle {
        ptr: 0,
        head: 0,
        tail: 0,
        size: 0,
    }
}

fn on_start<L: GuestLoader>(apic_id: u32, icc: &IccRouter, state: &Mutex<WorkerState<L>>, msg: IccMessage) {
    let IccPayload::Start { vm_addr } = msg.payload else {
        return;
    };

    let mut guard = state.lock();
    match guard.loader.load(vm_addr) {
        Ok(task) => {
            guard.task = Some(task);
            drop(guard);
            reply(
                icc,
                apic_id,
                IccPayload::Started(StartedPayload {
                    stdin: placeholder_ring_handle(),
                    stdout: placeholder_ring_handle(),
                    stderr: placeholder_ring_handle(),
                }),
            );
            run_until_yield_or_exit(apic_id, icc, state);
        }
        Err(err) => {
            // LoaderFailure (spec.md §7): the guest never ran, so this is reported the same way
            // a fault would be — the core never leaves the manager's view of it as not running.
            tracing::error!(apic_id, %err, "guest load failed");
            reply_with_result(icc, apic_id, IccPayload::Stopped(StoppedPayload { return_code: 0 }), -1);
        }
    }
}

fn on_resume<L: GuestLoader>(apic_id: u32, icc: &IccRouter, state: &Mutex<WorkerState<L>>, _msg: IccMessage) {
    if state.lock().task.is_none() {
        return;
    }
    reply(icc, apic_id, IccPayload::Resumed);
    run_until_yield_or_exit(apic_id, icc, state);
}

fn on_pause<L: GuestLoader>(apic_id: u32, icc: &IccRouter, _state: &Mutex<WorkerState<L>>, _msg: IccMessage) {
    // The task stays loaded; RESUME re-enters it. Nothing to do beyond acknowledging.
    reply(icc, apic_id, IccPayload::Paused);
}

fn on_stop<L: GuestLoader>(apic_id: u32, icc: &IccRouter, state: &Mutex<WorkerState<L>>, _msg: IccMessage) {
    state.lock().task = None;
    reply(icc, apic_id, IccPayload::Stopped(StoppedPayload { return_code: 0 }));
}

/// Context-switches into the loaded task and turns its exit reason into the matching reply
/// (spec.md §4.8's exception-capture and voluntary-return rules).
fn run_until_yield_or_exit<L: GuestLoader>(apic_id: u32, icc: &IccRouter, state: &Mutex<WorkerState<L>>) {
    let mut guard = state.lock();
    let Some(task) = guard.task.as_mut() else {
        return;
    };

    match task.step() {
        GuestExit::Yielded => {
            drop(guard);
            reply(icc, apic_id, IccPayload::Paused);
        }
        GuestExit::Exited { return_code } => {
            guard.task = None;
            drop(guard);
            reply(icc, apic_id, IccPayload::Stopped(StoppedPayload { return_code }));
        }
        GuestExit::Fault { vector } => {
            tracing::warn!(apic_id, vector, "guest faulted, destroying task");
            guard.task = None;
            drop(guard);
            reply_with_result(icc, apic_id, IccPayload::Stopped(StoppedPayload { return_code: 0 }), vector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedTask {
        exits: std::collections::VecDeque<GuestExit>,
    }

    impl GuestTask for ScriptedTask {
        fn step(&mut self) -> GuestExit {
            self.exits.pop_front().unwrap_or(GuestExit::Exited { return_code: 0 })
        }
    }

    struct ScriptedLoader {
        loads: Arc<AtomicUsize>,
        fail: bool,
        exits: Vec<GuestExit>,
    }

    impl GuestLoader for ScriptedLoader {
        type Task = ScriptedTask;

        fn load(&mut self, _vm_addr: u64) -> Result<Self::Task, LoaderError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LoaderError {
                    reason: "no such image".into(),
                });
            }
            Ok(ScriptedTask {
                exits: self.exits.clone().into(),
            })
        }
    }

    fn router() -> Arc<IccRouter> {
        let icc = Arc::new(IccRouter::new(8));
        icc.register_core(0);
        icc.register_core(1);
        icc
    }

    #[test]
    fn start_with_immediate_yield_replies_started_then_paused() {
        let icc = router();
        let loads = Arc::new(AtomicUsize::new(0));
        let loader = ScriptedLoader {
            loads: Arc::clone(&loads),
            fail: false,
            exits: vec![GuestExit::Yielded],
        };
        let worker = WorkerRuntime::new(1, Arc::clone(&icc), loader);

        icc.send(1, IccMessage::new(0, IccPayload::Start { vm_addr: 0x2000_0000 }))
            .unwrap();
        assert!(worker.poll());

        let started = icc.try_recv(0).unwrap().unwrap();
        assert_eq!(started.ty(), IccMessageType::Started);
        let paused = icc.try_recv(0).unwrap().unwrap();
        assert_eq!(paused.ty(), IccMessageType::Paused);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guest_fault_replies_stopped_with_vector_as_result() {
        let icc = router();
        let loader = ScriptedLoader {
            loads: Arc::new(AtomicUsize::new(0)),
            fail: false,
            exits: vec![GuestExit::Fault { vector: 13 }],
        };
        let worker = WorkerRuntime::new(1, Arc::clone(&icc), loader);

        icc.send(1, IccMessage::new(0, IccPayload::Start { vm_addr: 0 })).unwrap();
        worker.poll();

        let _started = icc.try_recv(0).unwrap().unwrap();
        let stopped = icc.try_recv(0).unwrap().unwrap();
        assert_eq!(stopped.ty(), IccMessageType::Stopped);
        assert_eq!(stopped.result, 13);
    }

    #[test]
    fn loader_failure_replies_stopped_without_loading_task() {
        let icc = router();
        let loader = ScriptedLoader {
            loads: Arc::new(AtomicUsize::new(0)),
            fail: true,
            exits: vec![],
        };
        let worker = WorkerRuntime::new(1, Arc::clone(&icc), loader);

        icc.send(1, IccMessage::new(0, IccPayload::Start { vm_addr: 0 })).unwrap();
        worker.poll();

        let stopped = icc.try_recv(0).unwrap().unwrap();
        assert_eq!(stopped.ty(), IccMessageType::Stopped);
        assert_eq!(stopped.result, -1);
    }

    #[test]
    fn resume_without_a_loaded_task_is_a_no_op() {
        let icc = router();
        let loader = ScriptedLoader {
            loads: Arc::new(AtomicUsize::new(0)),
            fail: false,
            exits: vec![],
        };
        let worker = WorkerRuntime::new(1, Arc::clone(&icc), loader);

        icc.send(1, IccMessage::new(0, IccPayload::Resume)).unwrap();
        worker.poll();

        assert!(icc.try_recv(0).unwrap().is_none());
    }

    #[test]
    fn pause_then_resume_continues_the_same_task() {
        let icc = router();
        let loader = ScriptedLoader {
            loads: Arc::new(AtomicUsize::new(0)),
            fail: false,
            exits: vec![GuestExit::Yielded, GuestExit::Exited { return_code: 7 }],
        };
        let worker = WorkerRuntime::new(1, Arc::clone(&icc), loader);

        icc.send(1, IccMessage::new(0, IccPayload::Start { vm_addr: 0 })).unwrap();
        worker.poll();
        icc.try_recv(0).unwrap(); // Started
        icc.try_recv(0).unwrap(); // Paused

        icc.send(1, IccMessage::new(0, IccPayload::Pause)).unwrap();
        worker.poll();
        assert_eq!(icc.try_recv(0).unwrap().unwrap().ty(), IccMessageType::Paused);

        icc.send(1, IccMessage::new(0, IccPayload::Resume)).unwrap();
        worker.poll();
        icc.try_recv(0).unwrap(); // Resumed
        let stopped = icc.try_recv(0).unwrap().unwrap();
        assert_eq!(stopped.ty(), IccMessageType::Stopped);
        assert_eq!(stopped.result, 0);
        if let IccPayload::Stopped(p) = stopped.payload {
            assert_eq!(p.return_code, 7);
        } else {
            panic!("expected Stopped payload");
        }
    }
}
