use std::io::{self, BufRead, Write};
use std::os::fd::AsFd;
use std::sync::Mutex;

use nix::sys::termios::{self, LocalFlags, SetArg};

use crate::error::{Error, IoResultExt, Result};

/// username that diverts the login prompt into account registration
pub const REGISTER: &str = "REGISTER";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_register(&self) -> bool {
        self.username == REGISTER
    }
}

/// new account details, posted to `<endpoint>/accounts`
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Registration {
    pub email: String,
    pub nick: String,
    pub password: String,
}

/// source of interactive credentials
pub trait CredentialPrompt: Send + Sync {
    /// credentials for `endpoint`; `attempt` counts from 1
    fn credentials(&self, endpoint: &str, realm: &str, attempt: u32) -> Result<Credentials>;

    fn registration(&self, endpoint: &str) -> Result<Registration>;
}

/// prompts on the controlling terminal, password without echo
#[derive(Debug, Default)]
pub struct TtyPrompt;

impl CredentialPrompt for TtyPrompt {
    fn credentials(&self, endpoint: &str, realm: &str, attempt: u32) -> Result<Credentials> {
        eprintln!("*** Login (/type [{REGISTER}] to register) @ {endpoint} ({realm}) ***");
        if attempt > 1 {
            eprintln!("login failed, attempt {attempt}");
        }
        let username = read_line("Username: ")?;
        let password = read_hidden("Password: ")?;
        Ok(Credentials { username, password })
    }

    fn registration(&self, endpoint: &str) -> Result<Registration> {
        eprintln!("*** REGISTER ACCOUNT @ {endpoint} ***");
        let email = read_line("Email: ")?;
        let nick = read_line("Username: ")?;
        let password = read_hidden("Password: ")?;
        let confirm = read_hidden("Password (repeat): ")?;
        if password != confirm {
            return Err(Error::Auth("passwords do not match".into()));
        }
        Ok(Registration {
            email,
            nick,
            password,
        })
    }
}

fn read_line(prompt: &str) -> Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{prompt}").with_path("<stderr>")?;
    stderr.flush().with_path("<stderr>")?;

    let mut line = String::new();
    let n = io::stdin()
        .lock()
        .read_line(&mut line)
        .with_path("<stdin>")?;
    if n == 0 {
        return Err(Error::Auth("no input for credentials".into()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn read_hidden(prompt: &str) -> Result<String> {
    let stdin = io::stdin();
    let fd = stdin.as_fd();

    // not a tty: plain read
    let Ok(original) = termios::tcgetattr(fd) else {
        return read_line(prompt);
    };
    let mut silent = original.clone();
    silent.local_flags.remove(LocalFlags::ECHO);
    termios::tcsetattr(fd, SetArg::TCSANOW, &silent).map_err(|e| Error::Io {
        path: "<stdin>".into(),
        source: io::Error::from(e),
    })?;

    let result = read_line(prompt);
    let _ = termios::tcsetattr(fd, SetArg::TCSANOW, &original);
    eprintln!();
    result
}

/// refuses every prompt; used when stdin is not interactive
#[derive(Debug, Default)]
pub struct NoPrompt;

impl CredentialPrompt for NoPrompt {
    fn credentials(&self, endpoint: &str, _realm: &str, _attempt: u32) -> Result<Credentials> {
        Err(Error::Auth(format!(
            "{endpoint} requires login and no credentials are available"
        )))
    }

    fn registration(&self, endpoint: &str) -> Result<Registration> {
        Err(Error::Auth(format!("cannot register at {endpoint} non-interactively")))
    }
}

/// answers from a fixed list, one entry per attempt
#[derive(Debug, Default)]
pub struct FixedPrompt {
    answers: Mutex<Vec<Credentials>>,
    registration: Option<Registration>,
}

impl FixedPrompt {
    pub fn new(answers: Vec<Credentials>) -> Self {
        let mut answers = answers;
        answers.reverse();
        Self {
            answers: Mutex::new(answers),
            registration: None,
        }
    }

    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }
}

impl CredentialPrompt for FixedPrompt {
    fn credentials(&self, endpoint: &str, _realm: &str, _attempt: u32) -> Result<Credentials> {
        self.answers
            .lock()
            .ok()
            .and_then(|mut answers| answers.pop())
            .ok_or_else(|| Error::Auth(format!("no more credentials for {endpoint}")))
    }

    fn registration(&self, endpoint: &str) -> Result<Registration> {
        self.registration
            .clone()
            .ok_or_else(|| Error::Auth(format!("no registration for {endpoint}")))
    }
}
