/// Threads and processes
///
/// A process owns an address space, an attribute table, and its threads; a
/// thread belongs to one process for its whole life. Thread execution
/// state follows the Setup -> Ready -> Running -> Waiting -> Dead machine;
/// the `active` flag tracks run-queue membership and is the handshake
/// between the wait protocol and the scheduler.

use alloc::borrow::ToOwned;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use spin::Mutex;

use crate::arch::{self, ExecFrame, ExtendedRegs};
use crate::mm::vmm::AddressSpace;
use crate::mm::{phys_to_virt, pmm, PAGE_SIZE};
use crate::wait::WaitControl;

/// Kernel stack size per thread.
const STACK_PAGES: usize = 4;

/// No cpu affinity.
pub const NO_AFFINITY: usize = usize::MAX;

static NEXT_PROCESS_ID: AtomicUsize = AtomicUsize::new(1);
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Setup,
    Ready,
    Running,
    Waiting,
    Dead,
}

pub struct Process {
    id: usize,
    name: String,
    space: Option<Arc<AddressSpace>>,
    threads: Mutex<Vec<Arc<Thread>>>,
    attributes: Mutex<BTreeMap<String, String>>,
}

impl Process {
    pub fn create(name: &str, space: Option<Arc<AddressSpace>>) -> Arc<Process> {
        Arc::new(Process {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            space,
            threads: Mutex::new(Vec::new()),
            attributes: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The process's address space; None means the kernel space.
    pub fn space(&self) -> Option<&Arc<AddressSpace>> {
        self.space.as_ref()
    }

    pub fn set_attribute(&self, key: &str, value: &str) {
        self.attributes
            .lock()
            .insert(key.to_owned(), value.to_owned());
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.lock().get(key).cloned()
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().clone()
    }
}

lazy_static::lazy_static! {
    static ref KERNEL_PROCESS: Arc<Process> = Process::create("kernel", None);
}

/// The process owning all kernel threads.
pub fn kernel_process() -> &'static Arc<Process> {
    &KERNEL_PROCESS
}

pub struct Thread {
    id: usize,
    name: String,
    process: Weak<Process>,

    state: Mutex<ThreadState>,
    /// Base scheduling priority; wake-time boosts do not change it.
    priority: AtomicUsize,
    /// On a run queue (or about to be switched to).
    active: AtomicBool,
    affinity: AtomicUsize,

    frame: AtomicPtr<ExecFrame>,
    /// Wired fxsave-style save area; null for stackless bootstrap threads.
    ext_regs: AtomicPtr<ExtendedRegs>,
    /// Back-pointer to the in-flight wait operation while Waiting.
    wait_control: AtomicPtr<WaitControl>,

    stack_base: AtomicUsize,
}

impl Thread {
    /// Create a thread in `Setup` state with its own kernel stack.
    pub fn create(
        process: &Arc<Process>,
        entry: extern "C" fn(usize),
        arg: usize,
        name: &str,
    ) -> Option<Arc<Thread>> {
        let stack_base = pmm::alloc_contiguous(STACK_PAGES)?;
        let stack_top = phys_to_virt(stack_base) as usize + STACK_PAGES * PAGE_SIZE;
        let frame = arch::init_exec_frame(stack_top, entry as usize, arg, false);

        let ext_regs = crate::mm::wired::wired_alloc(arch::EXTENDED_REGS_SIZE)?
            .cast::<ExtendedRegs>()
            .as_ptr();
        arch::init_extended_regs(ext_regs);

        let thread = Arc::new(Thread {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            process: Arc::downgrade(process),
            state: Mutex::new(ThreadState::Setup),
            priority: AtomicUsize::new(usize::MAX),
            active: AtomicBool::new(false),
            affinity: AtomicUsize::new(NO_AFFINITY),
            frame: AtomicPtr::new(frame),
            ext_regs: AtomicPtr::new(ext_regs),
            wait_control: AtomicPtr::new(core::ptr::null_mut()),
            stack_base: AtomicUsize::new(stack_base),
        });
        process.threads.lock().push(thread.clone());
        Some(thread)
    }

    /// Idle threads get their frame and stack from scheduler init.
    pub(crate) fn new_idle(cpu_id: usize) -> Arc<Thread> {
        Arc::new(Thread {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            name: alloc::format!("idle/{}", cpu_id),
            process: Arc::downgrade(kernel_process()),
            state: Mutex::new(ThreadState::Ready),
            priority: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            affinity: AtomicUsize::new(cpu_id),
            frame: AtomicPtr::new(core::ptr::null_mut()),
            ext_regs: AtomicPtr::new(core::ptr::null_mut()),
            wait_control: AtomicPtr::new(core::ptr::null_mut()),
            stack_base: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }

    pub fn priority(&self) -> usize {
        self.priority.load(Ordering::Relaxed)
    }

    pub(crate) fn set_priority(&self, priority: usize) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn affinity(&self) -> Option<usize> {
        match self.affinity.load(Ordering::Relaxed) {
            NO_AFFINITY => None,
            cpu => Some(cpu),
        }
    }

    /// Pin to one cpu; migration is an explicit dequeue/enqueue.
    pub fn set_affinity(&self, cpu: Option<usize>) {
        self.affinity
            .store(cpu.unwrap_or(NO_AFFINITY), Ordering::Relaxed);
    }

    pub(crate) fn frame_slot(&self) -> &AtomicPtr<ExecFrame> {
        &self.frame
    }

    pub(crate) fn ext_regs(&self) -> *mut ExtendedRegs {
        self.ext_regs.load(Ordering::Acquire)
    }

    pub fn wait_control(&self) -> *mut WaitControl {
        self.wait_control.load(Ordering::Acquire)
    }

    pub(crate) fn set_wait_control(&self, control: *mut WaitControl) {
        self.wait_control.store(control, Ordering::Release);
    }

    /// Mark this thread finished; it will never be enqueued again.
    pub fn exit(&self) {
        self.set_state(ThreadState::Dead);
        super::dequeue(self);
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        let ext_regs = self.ext_regs.load(Ordering::Relaxed);
        if let Some(ext_regs) = core::ptr::NonNull::new(ext_regs) {
            crate::mm::wired::wired_free(ext_regs.cast(), arch::EXTENDED_REGS_SIZE);
        }
        let stack_base = self.stack_base.load(Ordering::Relaxed);
        if stack_base != 0 {
            pmm::free_many(stack_base, STACK_PAGES);
        }
    }
}
