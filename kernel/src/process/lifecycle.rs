//! Process lifecycle: fork, exec, waitpid, exit, kill.

use alloc::string::ToString;
use alloc::vec::Vec;

use super::pcb::{Pid, ProcessState, SignalDisposition, NSIG, SIGCHLD, SIGKILL};
use super::{signal, table};
use crate::error::{KernelError, KernelResult};
use crate::mm::vma;
use crate::{elf, fs, sched};

/// Duplicate the calling process: fd table and signal dispositions are
/// copied, a fresh pid is assigned, and the child starts ready.
pub fn fork() -> KernelResult<Pid> {
    let parent = table::current_pid();
    let name = table::with_process(parent, |p| p.name.clone())?;

    let child = table::create(&name, parent)?;
    table::with_process_pair(parent, child, |parent, child| {
        child.pgid = parent.pgid;
        child.fd_table = parent.fd_table.clone();
        child.blocked_signals = parent.blocked_signals;
        child.handlers = parent.handlers;
        child.uid = parent.uid;
        child.gid = parent.gid;
    })?;

    // Inherited pipe ends are additional holders.
    let pipe_ends: Vec<(usize, bool)> = table::with_process(child, |proc| {
        proc.fd_table
            .iter()
            .filter_map(|(_, entry)| entry.pipe.map(|id| (id, entry.flags.write)))
            .collect()
    })?;
    for (id, write_end) in pipe_ends {
        let _ = crate::ipc::pipe::add_ref(id, write_end);
    }

    log::debug!("fork: pid {} created child {}", parent, child);
    Ok(child)
}

/// Replace the current process image with the ELF at `path`.
///
/// On success the bare-metal path transfers to the new image's entry
/// point in user ring and does not return.
pub fn exec(path: &str, argv: &[&str]) -> KernelResult<()> {
    let pid = table::current_pid();

    // Pull the whole image through the VFS before touching the process.
    let node = fs::lookup(path)?;
    let size = node.metadata()?.size;
    let mut image = Vec::new();
    image.try_reserve(size).map_err(|_| KernelError::NoMemory)?;
    image.resize(size, 0);
    let read = node.read(0, &mut image)?;
    image.truncate(read);

    // Cheap validation first: a malformed image must not cost the caller
    // its existing mappings.
    elf::validate(&image)?;

    // The old image's areas would collide with the new segments; from
    // here the old image is gone.
    vma::release_process(pid);

    let loaded = elf::load(&image, pid)?;

    // Point of no return for the old image.
    let base_name = path.rsplit('/').next().unwrap_or(path);
    table::with_process(pid, |proc| {
        proc.name = base_name.to_string();
        proc.pending_signals = 0;
        proc.handlers = [SignalDisposition::Default; NSIG];
        proc.fd_table.close_cloexec();
    })?;
    vma::set_brk_base(pid, loaded.brk_base);

    log::info!("exec: pid {} -> '{}' entry {:#010x}", pid, path, loaded.entry);
    let _ = argv; // argument vector plumbing is the user runtime's side

    elf::execute(&loaded)
}

/// Reap one zombie child. Never blocks: with live children but no zombie
/// yet the caller gets `WouldBlock`, with no matching children at all
/// `NoSuchProcess`.
pub fn waitpid(pid: i32, options: u32) -> KernelResult<(Pid, i32)> {
    let _ = options;
    let parent = table::current_pid();
    let which = if pid > 0 { Some(pid as Pid) } else { None };

    if let Some((child, exit_code)) = table::find_zombie_child(parent, which) {
        // Harvest: drop the scheduler slot, then the table slot.
        if let Some(task) = sched::task_for_pid(child) {
            sched::reap_task(task);
        }
        table::release(child)?;
        log::debug!("waitpid: pid {} reaped child {}", parent, child);
        return Ok((child, exit_code));
    }

    if table::has_children(parent) {
        Err(KernelError::WouldBlock)
    } else {
        Err(KernelError::NoSuchProcess)
    }
}

/// Terminate the calling process. Children are handed to init, the
/// parent learns through SIGCHLD, and the record lingers as a zombie
/// holding only pid, ppid, and the exit code until reaped.
pub fn exit(status: i32) {
    let pid = table::current_pid();
    if pid <= 1 {
        log::warn!("exit: refusing to end pid {}", pid);
        return;
    }

    vma::release_process(pid);
    table::reparent_children(pid);

    // Open pipe ends are released; plain descriptors drop with the table.
    let pipe_ends: Vec<(usize, bool)> = table::with_process(pid, |proc| {
        proc.fd_table
            .iter()
            .filter_map(|(_, entry)| entry.pipe.map(|id| (id, entry.flags.write)))
            .collect()
    })
    .unwrap_or_default();
    for (id, write_end) in pipe_ends {
        let _ = crate::ipc::pipe::close_end(id, write_end);
    }

    let ppid = table::with_process(pid, |proc| {
        proc.exit_code = status;
        proc.state = ProcessState::Zombie;
        proc.fd_table = crate::fs::file::FdTable::new();
        proc.ppid
    })
    .unwrap_or(1);

    let _ = signal::send(ppid, SIGCHLD);

    sched::scheduler::retire_task_for_pid(pid);
    log::debug!("exit: pid {} -> zombie (status {})", pid, status);
}

/// Forced termination. Pids 0 and 1 are untouchable.
pub fn kill(pid: Pid) -> KernelResult<()> {
    if pid == 0 || pid == 1 {
        return Err(KernelError::PermissionDenied);
    }
    if !table::exists(pid) {
        return Err(KernelError::NoSuchProcess);
    }

    vma::release_process(pid);
    table::reparent_children(pid);
    let ppid = table::with_process(pid, |proc| {
        proc.exit_code = -(SIGKILL as i32);
        proc.state = ProcessState::Zombie;
        proc.ppid
    })?;
    let _ = signal::send(ppid, SIGCHLD);

    sched::scheduler::retire_task_for_pid(pid);
    log::debug!("kill: pid {} terminated", pid);
    Ok(())
}

pub fn setpgid(pid: Pid, pgid: Pid) -> KernelResult<()> {
    let target = if pid == 0 { table::current_pid() } else { pid };
    table::with_process(target, |proc| {
        proc.pgid = if pgid == 0 { proc.pid } else { pgid };
    })
}

pub fn getpgid(pid: Pid) -> KernelResult<Pid> {
    let target = if pid == 0 { table::current_pid() } else { pid };
    table::with_process(target, |proc| proc.pgid)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::table::testing;

    #[test]
    fn fork_copies_fds_and_dispositions() {
        let _guard = testing::lock();
        table::set_current(1);

        // Give the parent something recognizable to inherit.
        table::with_process(1, |p| {
            p.blocked_signals = 0b1010;
            p.handlers[5] = SignalDisposition::Ignore;
        })
        .unwrap();

        let child = fork().expect("fork succeeds");
        let (blocked, disp, ppid, state) = table::with_process(child, |p| {
            (p.blocked_signals, p.handlers[5], p.ppid, p.state)
        })
        .unwrap();

        assert_eq!(blocked, 0b1010);
        assert_eq!(disp, SignalDisposition::Ignore);
        assert_eq!(ppid, 1);
        assert_eq!(state, ProcessState::Ready);

        table::with_process(1, |p| {
            p.blocked_signals = 0;
            p.handlers[5] = SignalDisposition::Default;
        })
        .unwrap();
        table::release(child).expect("cleanup");
    }

    #[test]
    fn wait_reaps_exited_child_with_its_status() {
        let _guard = testing::lock();
        table::set_current(1);

        let child = fork().expect("fork succeeds");

        // No zombie yet: the call must not block, only report.
        assert_eq!(waitpid(child as i32, 0), Err(KernelError::WouldBlock));

        // The child runs and exits.
        table::set_current(child);
        exit(7);
        assert_eq!(
            table::with_process(child, |p| p.state).unwrap(),
            ProcessState::Zombie
        );

        // The parent reaps it and the slot is gone.
        table::set_current(1);
        let (reaped, status) = waitpid(child as i32, 0).expect("zombie child is reapable");
        assert_eq!(reaped, child);
        assert_eq!(status, 7);
        assert!(!table::exists(child));
    }

    #[test]
    fn wait_with_no_children_reports_no_process() {
        let _guard = testing::lock();
        let lonely = table::create("lonely", 1).expect("slot");
        table::set_current(lonely);
        assert_eq!(waitpid(-1, 0), Err(KernelError::NoSuchProcess));
        table::set_current(1);
        table::release(lonely).expect("cleanup");
    }

    #[test]
    fn exit_reparents_orphans_and_signals_parent() {
        let _guard = testing::lock();
        table::set_current(1);

        let parent = fork().expect("fork parent");
        table::set_current(parent);
        let orphan = fork().expect("fork orphan");

        table::with_process(1, |p| p.pending_signals = 0).unwrap();
        exit(0);

        // The grandchild now belongs to init, and init got SIGCHLD.
        assert_eq!(table::with_process(orphan, |p| p.ppid).unwrap(), 1);
        let pending = table::with_process(1, |p| p.pending_signals).unwrap();
        assert_ne!(pending & (1 << (SIGCHLD - 1)), 0);

        table::set_current(1);
        let _ = waitpid(parent as i32, 0);
        table::release(orphan).expect("cleanup");
        table::with_process(1, |p| p.pending_signals = 0).unwrap();
    }

    /// A minimal i386 ET_EXEC image with one loadable segment.
    fn tiny_exec_image() -> Vec<u8> {
        let vaddr: u32 = 0x0804_8000;
        let ph_off: u32 = 52;
        let payload_off: u32 = ph_off + 32;
        let mut image = alloc::vec![0u8; payload_off as usize + 32];
        image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        image[4] = 1; // 32-bit
        image[5] = 1; // little-endian
        image[6] = 1;
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        image[24..28].copy_from_slice(&vaddr.to_le_bytes());
        image[28..32].copy_from_slice(&ph_off.to_le_bytes());
        image[42..44].copy_from_slice(&32u16.to_le_bytes());
        image[44..46].copy_from_slice(&1u16.to_le_bytes());

        let ph = ph_off as usize;
        image[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        image[ph + 4..ph + 8].copy_from_slice(&payload_off.to_le_bytes());
        image[ph + 8..ph + 12].copy_from_slice(&vaddr.to_le_bytes());
        image[ph + 16..ph + 20].copy_from_slice(&32u32.to_le_bytes());
        image[ph + 20..ph + 24].copy_from_slice(&32u32.to_le_bytes());
        image[ph + 24..ph + 28].copy_from_slice(&5u32.to_le_bytes()); // R+X
        image
    }

    #[test]
    fn exec_replaces_image_name_and_close_on_exec_fds() {
        let _guard = testing::lock();
        crate::mm::testing::ensure_frame_pool();

        // A root filesystem carrying the executable.
        let root_fs = crate::fs::ramfs::RamFs::new();
        crate::fs::set_root(root_fs.root());
        let bin = root_fs
            .root()
            .create(
                "init.elf",
                crate::fs::NodeType::File,
                crate::fs::Permissions::FILE_DEFAULT,
            )
            .expect("create binary");
        bin.write(0, &tiny_exec_image()).expect("store image");

        table::set_current(1);
        let pid = fork().expect("fork");
        table::set_current(pid);

        table::with_process(pid, |p| {
            p.pending_signals = 0xF0;
            let fd = p.fd_table.alloc().expect("fd");
            p.fd_table.get_mut(fd).expect("entry").flags.close_on_exec = true;
        })
        .unwrap();

        exec("/init.elf", &[]).expect("exec succeeds on a valid image");

        let (name, pending, cloexec_gone) = table::with_process(pid, |p| {
            (
                p.name.clone(),
                p.pending_signals,
                p.fd_table.get(3).is_err(),
            )
        })
        .unwrap();
        assert_eq!(name, "init.elf");
        assert_eq!(pending, 0, "exec clears pending signals");
        assert!(cloexec_gone, "close-on-exec descriptors are dropped");

        // Segment and stack areas belong to the new image.
        let areas = vma::with_table(pid, |t| t.count()).unwrap();
        assert_eq!(areas, 2);
        assert_eq!(
            vma::brk(pid, None).expect("brk query"),
            0x0804_8000 + crate::mm::PAGE_SIZE
        );

        // A bogus image fails without touching the (new) current image.
        assert!(exec("/init.elf.missing", &[]).is_err());
        bin.truncate(8).expect("truncate to garbage");
        assert!(exec("/init.elf", &[]).is_err());
        assert_eq!(vma::with_table(pid, |t| t.count()).unwrap(), 2);

        table::set_current(1);
        let _ = crate::process::kill(pid);
        let _ = waitpid(pid as i32, 0);
        table::with_process(1, |p| p.pending_signals = 0).unwrap();
    }

    #[test]
    fn kill_protects_pid_zero_and_one() {
        let _guard = testing::lock();
        assert_eq!(kill(0), Err(KernelError::PermissionDenied));
        assert_eq!(kill(1), Err(KernelError::PermissionDenied));
        assert_eq!(kill(60), Err(KernelError::NoSuchProcess));
    }

    #[test]
    fn process_groups_default_and_follow() {
        let _guard = testing::lock();
        table::set_current(1);
        let child = fork().expect("fork");

        // Fork inherits the parent's group.
        assert_eq!(getpgid(child).unwrap(), getpgid(1).unwrap());

        setpgid(child, 0).expect("own group");
        assert_eq!(getpgid(child).unwrap(), child);

        setpgid(child, 1).expect("explicit group");
        assert_eq!(getpgid(child).unwrap(), 1);

        table::release(child).expect("cleanup");
    }
}
