// Process Management Service: fork, exit, waitpid and execv
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::convert::Infallible;
use x86_64::VirtAddr;

use crate::config::{LifecycleConfig, FORK_NAME_SUFFIX, POINTER_SIZE};
use crate::process::context::CpuRegisters;
use crate::process::pcb::{Process, ProcessError, ProcessId};
use crate::process::pid::PidAllocator;
use crate::process::scheduler::{Scheduler, UserMode};
use crate::process::table::{ProcessSnapshot, ProcessTable};
use crate::process::user_stack::{self, UserStack};
use crate::process::wait_status;
use crate::services::file_system_service::Loader;
use crate::services::memory_service::{
    copy_in_ptr, copy_in_str, copy_out, user_addr, AddressSpace, CopyStrError, VmService,
};

/// The collaborators the lifecycle core drives.
#[derive(Clone)]
pub struct Platform {
    pub scheduler: Arc<dyn Scheduler>,
    pub vm: Arc<dyn VmService>,
    pub loader: Arc<dyn Loader>,
    pub user: Arc<dyn UserMode>,
}

/// Process Management Service - owns the identifier space and the process
/// table, and coordinates process creation, exit and collection.
pub struct ProcessService {
    platform: Platform,
    config: LifecycleConfig,
    pids: Arc<PidAllocator>,
    table: ProcessTable,
}

/// A new program image that is ready to run but not yet installed anywhere.
struct PreparedImage {
    space: Box<dyn AddressSpace>,
    entry: VirtAddr,
    stack: UserStack,
}

/// Everything a new execution context needs to drop into user mode.
struct Handoff {
    process: Arc<Process>,
    frame: CpuRegisters,
    scheduler: Arc<dyn Scheduler>,
    user: Arc<dyn UserMode>,
}

impl Handoff {
    fn run(self) -> ! {
        self.process.set_thread(self.scheduler.current());
        self.process.activate_space();
        self.user.enter_user(self.process, self.frame)
    }
}

/// Table entry and child-list entry of a child being forked. Both are undone
/// on drop unless the fork commits.
struct ChildRegistration<'a> {
    table: &'a ProcessTable,
    parent: &'a Process,
    child: ProcessId,
    committed: bool,
}

impl<'a> ChildRegistration<'a> {
    fn register(table: &'a ProcessTable, parent: &'a Process, child: &Arc<Process>) -> Self {
        table.insert(Arc::clone(child));
        parent.add_child(child.pid());
        Self {
            table,
            parent,
            child: child.pid(),
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ChildRegistration<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.parent.remove_child(self.child);
            self.table.remove(self.child);
        }
    }
}

impl ProcessService {
    pub fn new(platform: Platform, config: LifecycleConfig) -> Self {
        Self {
            platform,
            config,
            pids: PidAllocator::new(config.max_pid),
            table: ProcessTable::new(),
        }
    }

    /// Caller's process id.
    pub fn getpid(&self, cur: &Process) -> ProcessId {
        cur.pid()
    }

    /// Duplicate `cur` into a new child that resumes from `frame` with a
    /// fork return value of 0. Returns the child's id.
    pub fn fork(&self, cur: &Arc<Process>, frame: &CpuRegisters) -> Result<ProcessId, ProcessError> {
        let pid = self.pids.allocate().map_err(|e| {
            log::warn!("fork from pid {} failed: {}", cur.pid(), e);
            e
        })?;
        let child_pid = pid.pid();

        let space = cur.with_space(|space| space.duplicate()).map_err(|e| {
            log::warn!("fork from pid {}: address space copy failed", cur.pid());
            ProcessError::from(e)
        })?;

        let mut name = cur.name();
        name.push_str(FORK_NAME_SUFFIX);
        let child = Process::new(pid, name, Some(Arc::downgrade(cur)), space);
        let registration = ChildRegistration::register(&self.table, cur, &child);

        let handoff = Handoff {
            process: Arc::clone(&child),
            frame: frame.fork_child(),
            scheduler: Arc::clone(&self.platform.scheduler),
            user: Arc::clone(&self.platform.user),
        };
        let thread_name = child.name();
        self.platform
            .scheduler
            .spawn(&thread_name, Box::new(move || {
                handoff.run();
            }))
            .map_err(|e| {
                log::warn!("fork from pid {}: could not start child {}", cur.pid(), child_pid);
                ProcessError::from(e)
            })?;
        registration.commit();

        log::info!("pid {} forked child {}", cur.pid(), child_pid);
        Ok(child_pid)
    }

    /// Terminate the calling process with `code`. Never returns.
    ///
    /// The identifier goes back to the allocator when the record is reaped,
    /// here for an orphan or later by the parent's `waitpid`, whether or not
    /// the retired context still holds references to the record.
    pub fn exit(&self, cur: Arc<Process>, code: i32) -> ! {
        let pid = cur.pid();

        let space = cur.take_space();
        self.platform.vm.deactivate();
        drop(space);

        for child_pid in cur.take_children() {
            let Some(child) = self.table.lookup(child_pid) else {
                continue;
            };
            if let Some(id) = child.detach_parent() {
                self.table.remove(child_pid);
                drop(id);
                log::debug!("pid {} reaped zombie child {} on exit", pid, child_pid);
            }
        }

        if let Some(id) = cur.publish_exit(code, &*self.platform.scheduler) {
            self.table.remove(pid);
            drop(id);
            log::info!("pid {} exited with code {} (no parent, reaped)", pid, code);
        } else {
            log::info!("pid {} exited with code {}", pid, code);
        }

        drop(cur);
        self.platform.scheduler.retire_current()
    }

    /// Wait for child `pid` to exit, store its encoded status at
    /// `status_ptr` in the caller's memory and reap it.
    pub fn waitpid(
        &self,
        cur: &Arc<Process>,
        pid: ProcessId,
        status_ptr: u64,
        options: u64,
    ) -> Result<ProcessId, ProcessError> {
        if options != 0 {
            return Err(ProcessError::InvalidArgument);
        }
        let slot_len = core::mem::size_of::<i32>();
        if user_addr(status_ptr, slot_len).is_err() || status_ptr % slot_len as u64 != 0 {
            return Err(ProcessError::InvalidPointer);
        }
        if !self.pids.in_domain(pid) {
            return Err(ProcessError::NoSuchProcess);
        }
        let child = self.table.lookup(pid).ok_or(ProcessError::NoSuchProcess)?;
        if !cur.has_child(pid) {
            return Err(ProcessError::NotMyChild);
        }

        if child.exit_code().is_none() {
            log::debug!("pid {} waiting for child {}", cur.pid(), pid);
        }
        let code = child.wait_for_exit(&*self.platform.scheduler);

        let status = wait_status::make_exit(code);
        cur.with_space(|space| copy_out(space, status_ptr, &status.to_le_bytes()))?;

        cur.remove_child(pid);
        if let Some(id) = child.mark_reaped() {
            self.table.remove(pid);
            drop(id);
        }
        log::debug!("pid {} collected child {} (code {})", cur.pid(), pid, code);
        Ok(pid)
    }

    /// Replace the caller's program image with the executable at `path_ptr`,
    /// passing it the NULL-terminated argument vector at `argv_ptr`.
    ///
    /// Only returns on failure, in which case the caller is untouched.
    pub fn execv(&self, cur: &Arc<Process>, path_ptr: u64, argv_ptr: u64) -> Result<Infallible, ProcessError> {
        let (path, args) = cur.with_space(|space| self.copy_in_exec_args(space, path_ptr, argv_ptr))?;

        let image = self.prepare_image(&path, &args).map_err(|e| {
            log::warn!("pid {}: execv {} failed: {}", cur.pid(), path, e);
            e
        })?;

        let old = cur.replace_space(image.space);
        cur.activate_space();
        drop(old);
        cur.set_name(path.clone());

        log::info!("pid {} exec {} with {} args", cur.pid(), path, args.len());
        let frame = CpuRegisters::program_entry(image.entry, image.stack.sp, image.stack.argc, image.stack.argv);
        self.platform.user.enter_user(Arc::clone(cur), frame)
    }

    /// Start the program at `path` as a new process with no parent.
    ///
    /// Used by the kernel to launch the first user program.
    pub fn spawn_program(&self, path: &str, args: &[&str]) -> Result<ProcessId, ProcessError> {
        if path.len() + 1 > self.config.path_max {
            return Err(ProcessError::NameTooLong);
        }
        if args.len() > self.config.max_args {
            return Err(ProcessError::ArgumentListTooLong);
        }
        let total: usize = args.iter().map(|a| a.len() + 1).sum();
        if total > self.config.arg_max_bytes {
            return Err(ProcessError::ArgumentListTooLong);
        }

        let pid = self.pids.allocate()?;
        let args: Vec<Vec<u8>> = args.iter().map(|a| a.as_bytes().to_vec()).collect();
        let image = self.prepare_image(path, &args).map_err(|e| {
            log::warn!("spawn of {} failed: {}", path, e);
            e
        })?;

        let process = Process::new(pid, String::from(path), None, image.space);
        let pid = process.pid();
        self.table.insert(Arc::clone(&process));

        let handoff = Handoff {
            process,
            frame: CpuRegisters::program_entry(image.entry, image.stack.sp, image.stack.argc, image.stack.argv),
            scheduler: Arc::clone(&self.platform.scheduler),
            user: Arc::clone(&self.platform.user),
        };
        let entry = Box::new(move || {
            handoff.run();
        });
        if let Err(e) = self.platform.scheduler.spawn(path, entry) {
            self.table.remove(pid);
            log::warn!("spawn of {} failed: could not start pid {}", path, pid);
            return Err(e.into());
        }

        log::info!("spawned {} as pid {}", path, pid);
        Ok(pid)
    }

    // ---- diagnostics -----------------------------------------------------

    pub fn lookup(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.table.lookup(pid)
    }

    /// Get process count
    pub fn process_count(&self) -> usize {
        self.table.count()
    }

    /// List all processes
    pub fn list_processes(&self) -> Vec<ProcessSnapshot> {
        self.table.snapshot()
    }

    /// Number of identifiers still bound to a record.
    pub fn live_pids(&self) -> usize {
        self.pids.in_use()
    }

    // ---- helpers ---------------------------------------------------------

    fn copy_in_exec_args(
        &self,
        space: &dyn AddressSpace,
        path_ptr: u64,
        argv_ptr: u64,
    ) -> Result<(String, Vec<Vec<u8>>), ProcessError> {
        let path = copy_in_str(space, path_ptr, self.config.path_max)?;
        // The loader names files by `str`; no such file can have this name.
        let path = String::from_utf8(path).map_err(|_| ProcessError::NoSuchFile)?;

        // Count first, so an oversized vector is refused before any string
        // is copied.
        let mut pointers = Vec::new();
        loop {
            let slot = (pointers.len() as u64)
                .checked_mul(POINTER_SIZE)
                .and_then(|off| argv_ptr.checked_add(off))
                .ok_or(ProcessError::InvalidPointer)?;
            let ptr = copy_in_ptr(space, slot)?;
            if ptr == 0 {
                break;
            }
            if pointers.len() == self.config.max_args {
                return Err(ProcessError::ArgumentListTooLong);
            }
            pointers.push(ptr);
        }

        let mut total = 0;
        let mut args = Vec::with_capacity(pointers.len());
        for ptr in pointers {
            let arg = copy_in_str(space, ptr, self.config.arg_max_bytes - total).map_err(|e| match e {
                CopyStrError::TooLong => ProcessError::ArgumentListTooLong,
                CopyStrError::Fault(_) => ProcessError::InvalidPointer,
            })?;
            total += arg.len() + 1;
            args.push(arg);
        }
        Ok((path, args))
    }

    /// Open, load and set up the stack of a new image. Nothing outside the
    /// returned image is touched; on error it is simply dropped.
    fn prepare_image(&self, path: &str, args: &[Vec<u8>]) -> Result<PreparedImage, ProcessError> {
        let executable = self.platform.loader.open(path)?;
        let mut space = self.platform.vm.create()?;
        let entry = executable.load(&mut *space)?;
        let top = space.define_stack()?;
        let stack = user_stack::build(&mut *space, top, args).map_err(|_| ProcessError::OutOfMemory)?;
        Ok(PreparedImage { space, entry, stack })
    }
}

static PROCESS_SERVICE: OnceCell<ProcessService> = OnceCell::uninit();

/// Install the system-wide process service used by the syscall entry.
pub fn init_process_service(service: ProcessService) -> &'static ProcessService {
    if PROCESS_SERVICE.try_init_once(|| service).is_err() {
        log::warn!("process service already initialized; keeping the first one");
    }
    match PROCESS_SERVICE.get() {
        Some(service) => service,
        None => panic!("process service missing right after initialization"),
    }
}

/// The installed process service, if any.
pub fn process_service() -> Option<&'static ProcessService> {
    PROCESS_SERVICE.get()
}
