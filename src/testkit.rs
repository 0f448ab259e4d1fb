// Host-side stand-ins for the scheduler, VM, loader and user mode
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use x86_64::VirtAddr;

use crate::config::LifecycleConfig;
use crate::process::context::CpuRegisters;
use crate::process::pcb::Process;
use crate::process::scheduler::{SchedError, Scheduler, ThreadEntry, ThreadId, UserMode};
use crate::services::file_system_service::{Executable, LoadError, Loader};
use crate::services::memory_service::{copy_in, copy_out, AddressSpace, Fault, VmError, VmService};
use crate::services::process_service::{init_process_service, Platform, ProcessService};

/// Start of the data region every fresh address space has mapped.
pub const DATA_BASE: u64 = 0x40_0000;
pub const DATA_SIZE: u64 = 0x1_0000;
/// Top of the user stack region mapped by `define_stack`.
pub const STACK_TOP: u64 = 0x7fff_ffff_0000;
pub const STACK_SIZE: u64 = 0x4_0000;

pub const WAIT: Duration = Duration::from_secs(5);

// ---- scheduler -----------------------------------------------------------

/// Unwind payload used to tear down a retired execution context.
struct Retired;

#[derive(Default)]
struct Registry {
    by_os: HashMap<thread::ThreadId, ThreadId>,
    handles: HashMap<ThreadId, thread::Thread>,
}

#[derive(Default)]
struct SchedState {
    next_id: AtomicU64,
    registry: Mutex<Registry>,
    running: AtomicUsize,
    fail_next_spawn: AtomicBool,
    hold_retired: AtomicBool,
    panics: Mutex<Vec<String>>,
}

impl SchedState {
    fn adopt(&self, id: ThreadId) {
        let me = thread::current();
        let mut reg = self.registry.lock().unwrap();
        reg.by_os.insert(me.id(), id);
        reg.handles.insert(id, me);
    }

    fn fresh_id(&self) -> ThreadId {
        ThreadId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Execution contexts are OS threads; block/wake are park/unpark, which
/// already carry a wakeup permit.
pub struct HostScheduler {
    state: Arc<SchedState>,
}

impl HostScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(SchedState::default()),
        })
    }

    /// Make the calling (non-spawned) thread known to the scheduler.
    pub fn register_current(&self) -> ThreadId {
        self.current()
    }

    pub fn fail_next_spawn(&self) {
        self.state.fail_next_spawn.store(true, Ordering::SeqCst);
    }

    /// Retire contexts by parking them forever instead of unwinding, like a
    /// context switch that never comes back. Nothing on their stacks drops.
    pub fn hold_retired_contexts(&self) {
        self.state.hold_retired.store(true, Ordering::SeqCst);
    }

    /// Wait until every spawned context has finished unwinding.
    pub fn wait_idle(&self) {
        let deadline = Instant::now() + WAIT;
        while self.state.running.load(Ordering::SeqCst) != 0 {
            assert!(Instant::now() < deadline, "execution contexts still running");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Panic messages from spawned contexts (retirements excluded).
    pub fn panics(&self) -> Vec<String> {
        self.state.panics.lock().unwrap().clone()
    }
}

impl Scheduler for HostScheduler {
    fn spawn(&self, name: &str, entry: ThreadEntry) -> Result<ThreadId, SchedError> {
        if self.state.fail_next_spawn.swap(false, Ordering::SeqCst) {
            return Err(SchedError::OutOfResources);
        }
        let id = self.state.fresh_id();
        let state = Arc::clone(&self.state);
        state.running.fetch_add(1, Ordering::SeqCst);
        let body = move || {
            state.adopt(id);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                if !payload.is::<Retired>() {
                    let msg = payload
                        .downcast_ref::<String>()
                        .cloned()
                        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                        .unwrap_or_else(|| "unknown panic".to_string());
                    state.panics.lock().unwrap().push(msg);
                }
            }
            state.running.fetch_sub(1, Ordering::SeqCst);
        };
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|_| SchedError::OutOfResources)?;
        let os = handle.thread().clone();
        let mut reg = self.state.registry.lock().unwrap();
        reg.by_os.insert(os.id(), id);
        reg.handles.insert(id, os);
        Ok(id)
    }

    fn current(&self) -> ThreadId {
        let me = thread::current();
        let mut reg = self.state.registry.lock().unwrap();
        if let Some(id) = reg.by_os.get(&me.id()) {
            return *id;
        }
        let id = self.state.fresh_id();
        reg.by_os.insert(me.id(), id);
        reg.handles.insert(id, me);
        id
    }

    fn block_current(&self) {
        thread::park();
    }

    fn wake(&self, thread: ThreadId) {
        let handle = self.state.registry.lock().unwrap().handles.get(&thread).cloned();
        match handle {
            Some(handle) => handle.unpark(),
            None => panic!("wake of unknown {}", thread),
        }
    }

    fn retire_current(&self) -> ! {
        if self.state.hold_retired.load(Ordering::SeqCst) {
            self.state.running.fetch_sub(1, Ordering::SeqCst);
            loop {
                thread::park();
            }
        }
        panic::resume_unwind(Box::new(Retired))
    }
}

// ---- address spaces ------------------------------------------------------

#[derive(Default)]
struct VmState {
    live: AtomicUsize,
    activations: AtomicUsize,
    deactivations: AtomicUsize,
    fail_next_create: AtomicBool,
    fail_next_duplicate: AtomicBool,
}

/// Sparse byte-addressed address space over a list of mapped regions.
pub struct MockSpace {
    regions: Vec<(u64, u64)>,
    bytes: BTreeMap<u64, u8>,
    vm: Arc<VmState>,
}

impl MockSpace {
    fn new(vm: &Arc<VmState>, regions: Vec<(u64, u64)>, bytes: BTreeMap<u64, u8>) -> Self {
        vm.live.fetch_add(1, Ordering::SeqCst);
        Self {
            regions,
            bytes,
            vm: Arc::clone(vm),
        }
    }

    fn check(&self, addr: u64, len: usize) -> Result<(), Fault> {
        for offset in 0..len as u64 {
            let a = addr + offset;
            if !self.regions.iter().any(|(start, end)| a >= *start && a < *end) {
                return Err(Fault { addr: a });
            }
        }
        Ok(())
    }
}

impl AddressSpace for MockSpace {
    fn duplicate(&self) -> Result<Box<dyn AddressSpace>, VmError> {
        if self.vm.fail_next_duplicate.swap(false, Ordering::SeqCst) {
            return Err(VmError::OutOfMemory);
        }
        Ok(Box::new(MockSpace::new(&self.vm, self.regions.clone(), self.bytes.clone())))
    }

    fn activate(&self) {
        self.vm.activations.fetch_add(1, Ordering::SeqCst);
    }

    fn define_stack(&mut self) -> Result<VirtAddr, VmError> {
        self.regions.push((STACK_TOP - STACK_SIZE, STACK_TOP));
        Ok(VirtAddr::new(STACK_TOP))
    }

    fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), Fault> {
        let base = addr.as_u64();
        self.check(base, buf.len())?;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.bytes.get(&(base + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&mut self, addr: VirtAddr, data: &[u8]) -> Result<(), Fault> {
        let base = addr.as_u64();
        self.check(base, data.len())?;
        for (i, byte) in data.iter().enumerate() {
            self.bytes.insert(base + i as u64, *byte);
        }
        Ok(())
    }
}

impl Drop for MockSpace {
    fn drop(&mut self) {
        self.vm.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct HostVm {
    state: Arc<VmState>,
}

impl HostVm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(VmState::default()),
        })
    }

    /// Address spaces created and not yet dropped.
    pub fn live_spaces(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn activations(&self) -> usize {
        self.state.activations.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> usize {
        self.state.deactivations.load(Ordering::SeqCst)
    }

    pub fn fail_next_create(&self) {
        self.state.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_duplicate(&self) {
        self.state.fail_next_duplicate.store(true, Ordering::SeqCst);
    }
}

impl VmService for HostVm {
    fn create(&self) -> Result<Box<dyn AddressSpace>, VmError> {
        if self.state.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(VmError::OutOfMemory);
        }
        let regions = vec![(DATA_BASE, DATA_BASE + DATA_SIZE)];
        Ok(Box::new(MockSpace::new(&self.state, regions, BTreeMap::new())))
    }

    fn deactivate(&self) {
        self.state.deactivations.fetch_add(1, Ordering::SeqCst);
    }
}

// ---- loader --------------------------------------------------------------

#[derive(Clone, Copy)]
enum Image {
    Entry(u64),
    Corrupt,
}

struct HostExecutable {
    image: Image,
}

impl Executable for HostExecutable {
    fn load(&self, _space: &mut dyn AddressSpace) -> Result<VirtAddr, LoadError> {
        match self.image {
            Image::Entry(entry) => Ok(VirtAddr::new(entry)),
            Image::Corrupt => Err(LoadError::BadFormat),
        }
    }
}

/// Path to entry-point table standing in for a file system.
#[derive(Default)]
pub struct HostLoader {
    images: Mutex<HashMap<String, Image>>,
    opens: AtomicUsize,
}

impl HostLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn install(&self, path: &str, entry: u64) {
        self.images.lock().unwrap().insert(path.to_string(), Image::Entry(entry));
    }

    /// A file that exists but does not load.
    pub fn install_corrupt(&self, path: &str) {
        self.images.lock().unwrap().insert(path.to_string(), Image::Corrupt);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Loader for HostLoader {
    fn open(&self, path: &str) -> Result<Box<dyn Executable>, LoadError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let image = self.images.lock().unwrap().get(path).copied();
        match image {
            Some(image) => Ok(Box::new(HostExecutable { image })),
            None => Err(LoadError::NotFound),
        }
    }
}

// ---- user mode -----------------------------------------------------------

pub enum ServiceHandle {
    Owned(Arc<ProcessService>),
    Global(&'static ProcessService),
}

impl Deref for ServiceHandle {
    type Target = ProcessService;

    fn deref(&self) -> &ProcessService {
        match self {
            ServiceHandle::Owned(service) => &**service,
            ServiceHandle::Global(service) => *service,
        }
    }
}

/// What a user routine sees when it "runs" in user mode.
pub struct UserCtx {
    pub service: ServiceHandle,
    pub process: Arc<Process>,
    pub frame: CpuRegisters,
}

impl UserCtx {
    pub fn pid(&self) -> u64 {
        self.process.pid()
    }

    pub fn poke(&self, addr: u64, data: &[u8]) {
        self.process.with_space(|s| copy_out(s, addr, data)).unwrap();
    }

    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.process.with_space(|s| copy_in(s, addr, &mut buf)).unwrap();
        buf
    }

    pub fn peek_i32(&self, addr: u64) -> i32 {
        let raw = self.peek(addr, 4);
        i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    pub fn peek_u64(&self, addr: u64) -> u64 {
        let raw = self.peek(addr, 8);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw);
        u64::from_le_bytes(bytes)
    }

    /// Frame for a fork issued from here whose child resumes at `child_entry`.
    pub fn fork_frame(&self, child_entry: u64) -> CpuRegisters {
        CpuRegisters {
            rax: 2,
            rip: child_entry,
            ..self.frame
        }
    }
}

/// User code: runs with the process's context and returns its exit code.
pub type Routine = Arc<dyn Fn(&UserCtx) -> i32 + Send + Sync>;

/// Dispatches on the entry address in `rip` to a registered routine. A
/// routine that returns exits its process with the returned code.
#[derive(Default)]
pub struct HostUserMode {
    routines: Mutex<HashMap<u64, Routine>>,
    service: OnceLock<Weak<ProcessService>>,
}

impl HostUserMode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, service: &Arc<ProcessService>) {
        let _ = self.service.set(Arc::downgrade(service));
    }

    pub fn routine(&self, entry: u64, routine: Routine) {
        self.routines.lock().unwrap().insert(entry, routine);
    }

    fn service(&self) -> ServiceHandle {
        if let Some(service) = self.service.get().and_then(Weak::upgrade) {
            return ServiceHandle::Owned(service);
        }
        match crate::services::process_service::process_service() {
            Some(service) => ServiceHandle::Global(service),
            None => panic!("no process service to run user code against"),
        }
    }
}

impl UserMode for HostUserMode {
    fn enter_user(&self, process: Arc<Process>, frame: CpuRegisters) -> ! {
        let routine = self.routines.lock().unwrap().get(&frame.rip).cloned();
        let Some(routine) = routine else {
            panic!("no user routine at {:#x}", frame.rip)
        };
        let ctx = UserCtx {
            service: self.service(),
            process,
            frame,
        };
        let code = routine(&ctx);
        let UserCtx { service, process, .. } = ctx;
        service.exit(process, code)
    }
}

// ---- assembled world -----------------------------------------------------

pub struct World {
    pub sched: Arc<HostScheduler>,
    pub vm: Arc<HostVm>,
    pub loader: Arc<HostLoader>,
    pub user: Arc<HostUserMode>,
    pub service: Arc<ProcessService>,
}

fn platform(
    sched: &Arc<HostScheduler>,
    vm: &Arc<HostVm>,
    loader: &Arc<HostLoader>,
    user: &Arc<HostUserMode>,
) -> Platform {
    Platform {
        scheduler: sched.clone(),
        vm: vm.clone(),
        loader: loader.clone(),
        user: user.clone(),
    }
}

impl World {
    pub fn new() -> Self {
        Self::with_config(LifecycleConfig::default())
    }

    pub fn with_config(config: LifecycleConfig) -> Self {
        let sched = HostScheduler::new();
        let vm = HostVm::new();
        let loader = HostLoader::new();
        let user = HostUserMode::new();
        let service = Arc::new(ProcessService::new(platform(&sched, &vm, &loader, &user), config));
        user.attach(&service);
        Self {
            sched,
            vm,
            loader,
            user,
            service,
        }
    }

    /// Install a program at `path` whose code is `routine`.
    pub fn program<F>(&self, path: &str, entry: u64, routine: F)
    where
        F: Fn(&UserCtx) -> i32 + Send + Sync + 'static,
    {
        self.loader.install(path, entry);
        self.user.routine(entry, Arc::new(routine));
    }

    /// Register code reachable only through fork.
    pub fn routine<F>(&self, entry: u64, routine: F)
    where
        F: Fn(&UserCtx) -> i32 + Send + Sync + 'static,
    {
        self.user.routine(entry, Arc::new(routine));
    }

    /// Wait for every context to finish and check nothing panicked.
    pub fn settle(&self) {
        self.sched.wait_idle();
        assert_eq!(self.sched.panics(), Vec::<String>::new());
    }
}

/// Build the pieces for the process-wide service and install it globally.
pub fn global_world() -> (Arc<HostScheduler>, Arc<HostVm>, Arc<HostLoader>, Arc<HostUserMode>, &'static ProcessService) {
    let sched = HostScheduler::new();
    let vm = HostVm::new();
    let loader = HostLoader::new();
    let user = HostUserMode::new();
    let service = init_process_service(ProcessService::new(
        platform(&sched, &vm, &loader, &user),
        LifecycleConfig::default(),
    ));
    (sched, vm, loader, user, service)
}

/// Channel whose sending half can be shared by `Fn` routines.
pub struct Reporter<T> {
    tx: Mutex<Sender<T>>,
}

impl<T> Reporter<T> {
    pub fn send(&self, value: T) {
        let _ = self.tx.lock().unwrap().send(value);
    }
}

pub fn reporter<T>() -> (Arc<Reporter<T>>, Receiver<T>) {
    let (tx, rx) = mpsc::channel();
    (Arc::new(Reporter { tx: Mutex::new(tx) }), rx)
}
