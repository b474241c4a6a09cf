//! Interactive credential prompts.

use std::io::{self, BufRead, IsTerminal, Write};

/// Username and password typed by the user.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Source of login credentials. Called from a blocking thread.
pub trait Prompter: Send + Sync {
    fn credentials(&self) -> io::Result<Credentials>;
}

/// Reads credentials from the controlling terminal; the password is not echoed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn credentials(&self) -> io::Result<Credentials> {
        let username = prompt_line("Username: ")?;
        let password = prompt_hidden("Password: ")?;
        Ok(Credentials { username, password })
    }
}

fn prompt_line(prompt: &str) -> io::Result<String> {
    eprint!("{prompt}");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(trim_newline(line))
}

fn prompt_hidden(prompt: &str) -> io::Result<String> {
    eprint!("{prompt}");
    io::stderr().flush()?;

    let mut line = String::new();
    let read_result = read_hidden_line(&mut line);
    eprintln!();
    read_result?;
    Ok(trim_newline(line))
}

fn trim_newline(mut line: String) -> String {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

#[cfg(unix)]
fn read_hidden_line(buf: &mut String) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let stdin = io::stdin();
    if !stdin.is_terminal() {
        stdin.lock().read_line(buf)?;
        return Ok(());
    }

    let fd = stdin.as_raw_fd();
    // SAFETY: zeroed termios is overwritten by tcgetattr before use.
    let mut original = unsafe { std::mem::zeroed::<libc::termios>() };

    // SAFETY: fd is the open stdin descriptor and `original` is writable.
    if unsafe { libc::tcgetattr(fd, &mut original) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut no_echo = original;
    no_echo.c_lflag &= !libc::ECHO;

    // SAFETY: fd is valid and no_echo came from tcgetattr.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &no_echo) } != 0 {
        return Err(io::Error::last_os_error());
    }

    struct RestoreTermios {
        fd: i32,
        original: libc::termios,
    }

    impl Drop for RestoreTermios {
        fn drop(&mut self) {
            // SAFETY: restores the settings read by the successful tcgetattr above.
            let _ = unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &self.original) };
        }
    }

    let _restore = RestoreTermios { fd, original };
    stdin.lock().read_line(buf)?;
    Ok(())
}

#[cfg(not(unix))]
fn read_hidden_line(buf: &mut String) -> io::Result<()> {
    io::stdin().lock().read_line(buf)?;
    Ok(())
}
