//! Child process attachment
//!
//! Spawning is split in two phases. [`Command::prepare`] runs in the parent
//! and does every allocation: C strings, argv/envp arrays, PATH lookup. After
//! `fork` the child only makes raw system calls, in this fixed order:
//!
//! 1. reset signal mask and dispositions
//! 2. `setsid` (leave the parent's controlling terminal, lead a new session)
//! 3. open the slave path
//! 4. `TIOCSCTTY` (the slave becomes the controlling terminal)
//! 5. `dup2` the slave onto stdin, stdout and stderr
//! 6. apply the initial window size
//! 7. close the original slave descriptor, `chdir` if requested
//! 8. `execve`
//!
//! A failing step writes `(step, errno)` to a close-on-exec pipe and exits
//! with [`ChildStep::exit_code`]. The parent blocks on that pipe: end of file
//! means `execve` succeeded.

use std::ffi::{CStr, CString, OsStr, OsString};
use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, ForkResult, Pid};

use crate::error::SpawnError;
use crate::pty::child::ChildProcess;
use crate::size::WindowSize;

/// Step inside the forked child that can fail before the program runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChildStep {
    Setsid = 1,
    OpenSlave = 2,
    ControllingTerminal = 3,
    DupStdio = 4,
    WindowSize = 5,
    Chdir = 6,
    Exec = 7,
}

impl ChildStep {
    /// Exit status the child uses when this step fails
    pub fn exit_code(self) -> i32 {
        120 + self as i32
    }

    pub fn from_exit_code(code: i32) -> Option<Self> {
        Self::from_u8(u8::try_from(code.checked_sub(120)?).ok()?)
    }

    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => ChildStep::Setsid,
            2 => ChildStep::OpenSlave,
            3 => ChildStep::ControllingTerminal,
            4 => ChildStep::DupStdio,
            5 => ChildStep::WindowSize,
            6 => ChildStep::Chdir,
            7 => ChildStep::Exec,
            _ => return None,
        })
    }
}

impl fmt::Display for ChildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChildStep::Setsid => "create session",
            ChildStep::OpenSlave => "open slave terminal",
            ChildStep::ControllingTerminal => "set controlling terminal",
            ChildStep::DupStdio => "duplicate slave onto stdio",
            ChildStep::WindowSize => "apply window size",
            ChildStep::Chdir => "change directory",
            ChildStep::Exec => "execute program",
        })
    }
}

/// Builder describing the program to run on a slave terminal
#[derive(Debug, Clone)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    inherit_env: bool,
    cwd: Option<PathBuf>,
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Command {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: Vec::new(),
            inherit_env: true,
            cwd: None,
        }
    }

    /// The user's shell from `$SHELL`, falling back to `/bin/sh`
    pub fn default_shell() -> Self {
        let shell = std::env::var_os("SHELL").unwrap_or_else(|| OsString::from("/bin/sh"));
        Self::new(shell)
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set an environment variable, overriding any inherited value
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        let key = key.as_ref().to_os_string();
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.as_ref().to_os_string()));
        self
    }

    /// Do not inherit the parent's environment
    pub fn env_clear(mut self) -> Self {
        self.inherit_env = false;
        self.env.clear();
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    fn lookup_env(&self, key: &str) -> Option<OsString> {
        if let Some((_, v)) = self.env.iter().find(|(k, _)| k == key) {
            return Some(v.clone());
        }
        if self.inherit_env {
            return std::env::var_os(key);
        }
        None
    }

    /// Resolve the program and build every C string the child needs.
    ///
    /// `term` is injected as `TERM` when the resulting environment lacks one.
    pub fn prepare(&self, term: &str) -> Result<PreparedCommand, SpawnError> {
        let program_path = self.resolve_program()?;

        let program = CString::new(program_path.into_os_string().into_vec())?;
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(CString::new(self.program.as_bytes())?);
        for arg in &self.args {
            args.push(CString::new(arg.as_bytes())?);
        }

        let mut vars: Vec<(OsString, OsString)> = if self.inherit_env {
            std::env::vars_os()
                .filter(|(k, _)| !self.env.iter().any(|(key, _)| key == k))
                .collect()
        } else {
            Vec::new()
        };
        vars.extend(self.env.iter().cloned());
        if !vars.iter().any(|(k, _)| k == "TERM") {
            vars.push((OsString::from("TERM"), OsString::from(term)));
        }

        let mut env = Vec::with_capacity(vars.len());
        for (key, value) in vars {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            env.push(CString::new(entry)?);
        }

        let cwd = match &self.cwd {
            Some(dir) => Some(CString::new(dir.as_os_str().as_bytes())?),
            None => None,
        };

        Ok(PreparedCommand::new(program, args, env, cwd))
    }

    fn resolve_program(&self) -> Result<PathBuf, SpawnError> {
        let program = Path::new(&self.program);
        if self.program.as_bytes().contains(&b'/') {
            return Ok(program.to_path_buf());
        }
        let path = self
            .lookup_env("PATH")
            .unwrap_or_else(|| OsString::from("/usr/local/bin:/usr/bin:/bin"));
        std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
            .ok_or_else(|| SpawnError::ProgramNotFound(self.program.to_string_lossy().into_owned()))
    }
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && unistd::access(path, unistd::AccessFlags::X_OK).is_ok()
}

/// A command whose memory is fully laid out for `execve`
pub struct PreparedCommand {
    program: CString,
    _args: Vec<CString>,
    _env: Vec<CString>,
    cwd: Option<CString>,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
}

impl PreparedCommand {
    fn new(program: CString, args: Vec<CString>, env: Vec<CString>, cwd: Option<CString>) -> Self {
        // CString heap buffers do not move when the Vecs holding them move
        let argv = args
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        let envp = env
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        PreparedCommand {
            program,
            _args: args,
            _env: env,
            cwd,
            argv,
            envp,
        }
    }

    pub fn program(&self) -> &CStr {
        &self.program
    }
}

impl fmt::Debug for PreparedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedCommand")
            .field("program", &self.program)
            .field("args", &self._args)
            .field("cwd", &self.cwd)
            .finish()
    }
}

/// Spawns children with a slave terminal as their controlling terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct SlaveAttacher;

impl SlaveAttacher {
    /// Fork a child bound to `slave_path` and replace its image with `command`.
    ///
    /// Returns once the child has either executed the program or reported
    /// which step failed. No other thread may close or reuse the slave path's
    /// pair while this runs.
    pub fn attach_and_spawn(
        &self,
        slave_path: &CStr,
        command: &PreparedCommand,
        size: WindowSize,
    ) -> Result<ChildProcess, SpawnError> {
        let (status_read, status_write) = cloexec_pipe().map_err(SpawnError::Pipe)?;
        let winsize = size.to_winsize();

        // SAFETY: the child branch only performs async-signal-safe calls on
        // memory prepared before the fork, then execs or exits
        match unsafe { unistd::fork() }.map_err(SpawnError::Fork)? {
            ForkResult::Child => unsafe {
                exec_child(slave_path, command, &winsize, status_write.as_raw_fd())
            },
            ForkResult::Parent { child } => {
                drop(status_write);
                tracing::debug!(pid = child.as_raw(), program = ?command.program(), "forked child");
                let report = read_child_report(&status_read);
                let mut process = ChildProcess::new(child);
                match report {
                    Ok(None) => Ok(process),
                    Ok(Some((step, errno))) => {
                        let _ = process.reap_blocking();
                        Err(SpawnError::Child {
                            step,
                            source: errno,
                        })
                    }
                    Err(errno) => {
                        // Unknown whether exec happened; do not leave it running
                        tracing::warn!(pid = child.as_raw(), error = %errno, "spawn status unreadable, killing child");
                        let _ = signal::kill(child, Signal::SIGKILL);
                        let _ = process.reap_blocking();
                        Err(SpawnError::StatusUnreadable(errno))
                    }
                }
            }
        }
    }
}

/// Wait for exec (EOF) or a `(step, errno)` failure record.
///
/// A truncated or unrecognised record is an error, as is any read failure.
fn read_child_report(pipe: &OwnedFd) -> Result<Option<(ChildStep, Errno)>, Errno> {
    let mut record = [0u8; 5];
    let mut filled = 0;
    while filled < record.len() {
        match unistd::read(pipe.as_raw_fd(), &mut record[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    match filled {
        0 => return Ok(None),
        n if n < record.len() => return Err(Errno::EIO),
        _ => {}
    }
    let step = ChildStep::from_u8(record[0]).ok_or(Errno::EINVAL)?;
    let errno = i32::from_ne_bytes([record[1], record[2], record[3], record[4]]);
    Ok(Some((step, Errno::from_i32(errno))))
}

#[cfg(target_os = "linux")]
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for the two descriptors pipe2 writes
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return Err(Errno::last());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(not(target_os = "linux"))]
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for the two descriptors pipe writes
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(Errno::last());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    crate::pty::allocator::set_cloexec(pair.0.as_raw_fd())?;
    crate::pty::allocator::set_cloexec(pair.1.as_raw_fd())?;
    Ok(pair)
}

/// Runs in the forked child. Never returns.
unsafe fn exec_child(
    slave_path: &CStr,
    command: &PreparedCommand,
    winsize: &libc::winsize,
    status_fd: RawFd,
) -> ! {
    let mut empty: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::sigprocmask(libc::SIG_SETMASK, &empty, ptr::null_mut());
    for sig in [
        libc::SIGCHLD,
        libc::SIGHUP,
        libc::SIGINT,
        libc::SIGQUIT,
        libc::SIGTERM,
        libc::SIGALRM,
        libc::SIGPIPE,
        libc::SIGWINCH,
        libc::SIGTSTP,
        libc::SIGTTIN,
        libc::SIGTTOU,
    ] {
        libc::signal(sig, libc::SIG_DFL);
    }

    if libc::setsid() == -1 {
        fail(status_fd, ChildStep::Setsid);
    }

    let slave = libc::open(slave_path.as_ptr(), libc::O_RDWR);
    if slave == -1 {
        fail(status_fd, ChildStep::OpenSlave);
    }

    if libc::ioctl(slave, libc::TIOCSCTTY as _, 0) == -1 {
        fail(status_fd, ChildStep::ControllingTerminal);
    }

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if libc::dup2(slave, target) == -1 {
            fail(status_fd, ChildStep::DupStdio);
        }
    }

    if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSWINSZ as _, winsize) == -1 {
        fail(status_fd, ChildStep::WindowSize);
    }

    if slave > libc::STDERR_FILENO {
        libc::close(slave);
    }

    if let Some(cwd) = &command.cwd {
        if libc::chdir(cwd.as_ptr()) == -1 {
            fail(status_fd, ChildStep::Chdir);
        }
    }

    libc::execve(
        command.program.as_ptr(),
        command.argv.as_ptr(),
        command.envp.as_ptr(),
    );
    fail(status_fd, ChildStep::Exec)
}

unsafe fn fail(status_fd: RawFd, step: ChildStep) -> ! {
    let errno = Errno::last() as i32;
    let mut record = [0u8; 5];
    record[0] = step as u8;
    record[1..].copy_from_slice(&errno.to_ne_bytes());
    libc::write(status_fd, record.as_ptr().cast(), record.len());
    libc::_exit(step.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_round_trip() {
        for step in [
            ChildStep::Setsid,
            ChildStep::OpenSlave,
            ChildStep::ControllingTerminal,
            ChildStep::DupStdio,
            ChildStep::WindowSize,
            ChildStep::Chdir,
            ChildStep::Exec,
        ] {
            assert_eq!(ChildStep::from_exit_code(step.exit_code()), Some(step));
        }
        assert_eq!(ChildStep::Exec.exit_code(), 127);
        assert_eq!(ChildStep::from_exit_code(0), None);
        assert_eq!(ChildStep::from_exit_code(128), None);
    }

    fn report_pipe(bytes: &[u8]) -> OwnedFd {
        let (r, w) = cloexec_pipe().unwrap();
        unistd::write(w.as_raw_fd(), bytes).unwrap();
        r
    }

    #[test]
    fn test_child_report_parsing() {
        assert_eq!(read_child_report(&report_pipe(b"")).unwrap(), None);

        let mut record = vec![6u8];
        record.extend_from_slice(&libc::ENOENT.to_ne_bytes());
        assert_eq!(
            read_child_report(&report_pipe(&record)).unwrap(),
            Some((ChildStep::Chdir, Errno::ENOENT))
        );

        // Truncated record
        assert_eq!(read_child_report(&report_pipe(&[6u8, 0])), Err(Errno::EIO));
        // Unknown step
        assert_eq!(
            read_child_report(&report_pipe(&[99u8, 0, 0, 0, 0])),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn test_unreadable_report_is_an_error() {
        // A write-only end cannot be read from
        let (r, w) = cloexec_pipe().unwrap();
        drop(r);
        assert_eq!(read_child_report(&w), Err(Errno::EBADF));
    }

    #[test]
    fn test_prepare_resolves_path() {
        let prepared = Command::new("sh").arg("-c").arg("true").prepare("xterm").unwrap();
        let program = prepared.program().to_str().unwrap();
        assert!(program.ends_with("/sh"), "resolved to {}", program);
        assert_eq!(prepared._args.len(), 3);
        assert_eq!(prepared.argv.len(), 4);
        assert!(prepared.argv[3].is_null());
    }

    #[test]
    fn test_prepare_env() {
        let prepared = Command::new("/bin/sh")
            .env_clear()
            .env("FOO", "bar")
            .env("FOO", "baz")
            .prepare("xterm-256color")
            .unwrap();
        let env: Vec<_> = prepared._env.iter().map(|e| e.to_str().unwrap()).collect();
        assert_eq!(env, vec!["FOO=baz", "TERM=xterm-256color"]);
    }

    #[test]
    fn test_prepare_keeps_explicit_term() {
        let prepared = Command::new("/bin/sh")
            .env_clear()
            .env("TERM", "vt100")
            .prepare("xterm-256color")
            .unwrap();
        let env: Vec<_> = prepared._env.iter().map(|e| e.to_str().unwrap()).collect();
        assert_eq!(env, vec!["TERM=vt100"]);
    }

    #[test]
    fn test_prepare_rejects_nul() {
        let err = Command::new("/bin/sh").arg("a\0b").prepare("xterm").unwrap_err();
        assert!(matches!(err, SpawnError::InvalidArgument(_)));
    }

    #[test]
    fn test_prepare_missing_program() {
        let err = Command::new("definitely-not-a-real-program-ptykit")
            .prepare("xterm")
            .unwrap_err();
        assert!(matches!(err, SpawnError::ProgramNotFound(_)));
    }
}
