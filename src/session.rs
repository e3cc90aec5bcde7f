use crate::client::{ClientError, Connector, Credentials, Session};
use eyre::{Context, Result, eyre};
use std::io::{self, BufRead, Write};
use std::ops::Deref;
use std::path::Path;

/// Source of the interactive bits of a login. Injected so a batch run can
/// answer from pre-fetched values instead of a terminal.
pub trait LoginPrompt {
    fn login_code(&mut self) -> Result<String>;
    fn password(&mut self) -> Result<String>;
}

/// Asks on stdin/stderr.
pub struct ConsolePrompt;

impl ConsolePrompt {
    fn ask(label: &str) -> Result<String> {
        let mut stderr = io::stderr();
        write!(stderr, "{}: ", label)?;
        stderr.flush()?;
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .wrap_err("Failed to read from stdin")?;
        let answer = line.trim().to_string();
        if answer.is_empty() {
            return Err(eyre!("No input given for {}", label));
        }
        Ok(answer)
    }
}

impl LoginPrompt for ConsolePrompt {
    fn login_code(&mut self) -> Result<String> {
        Self::ask("Telegram login code")
    }

    fn password(&mut self) -> Result<String> {
        Self::ask("Two-step verification password")
    }
}

/// Answers with fixed values; fails if a value was not provided.
#[derive(Default)]
pub struct StaticPrompt {
    pub codes: Vec<String>,
    pub password: Option<String>,
}

impl LoginPrompt for StaticPrompt {
    fn login_code(&mut self) -> Result<String> {
        if self.codes.is_empty() {
            return Err(eyre!("A login code is required but none was supplied"));
        }
        Ok(self.codes.remove(0))
    }

    fn password(&mut self) -> Result<String> {
        self.password
            .take()
            .ok_or_else(|| eyre!("A two-step verification password is required but none was supplied"))
    }
}

/// Log in if the stored session is not already authorized.
///
/// A rejected code is asked for once more; a second factor triggers one
/// password prompt. Anything else is returned as an error.
pub fn authenticate<S: Session>(
    session: &S,
    phone: Option<&str>,
    prompt: &mut dyn LoginPrompt,
) -> Result<()> {
    if session.is_authorized().wrap_err("Failed to check authorization")? {
        tracing::debug!("Session already authorized");
        return Ok(());
    }

    let phone = phone.ok_or(ClientError::PhoneRequired)?;
    tracing::info!("Session not authorized, requesting login code");
    let token = session
        .request_login_code(phone)
        .wrap_err("Failed to request login code")?;

    let mut attempts = 0;
    loop {
        attempts += 1;
        let code = prompt.login_code()?;
        match session.sign_in(&token, &code) {
            Ok(()) => break,
            Err(ClientError::InvalidCode) if attempts < 2 => {
                tracing::warn!("Login code rejected, asking again");
            }
            Err(ClientError::PasswordRequired) => {
                let password = prompt.password()?;
                session
                    .check_password(&password)
                    .wrap_err("Two-step verification failed")?;
                break;
            }
            Err(e) => return Err(e).wrap_err("Sign-in failed"),
        }
    }

    tracing::info!("Signed in");
    Ok(())
}

/// Owns a connected session for the length of a run and disconnects it on
/// every exit path.
pub struct SessionGuard<S: Session> {
    session: S,
}

impl<S: Session> SessionGuard<S> {
    pub fn new(session: S) -> Self {
        Self { session }
    }
}

impl<S: Session> Deref for SessionGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: Session> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        self.session.disconnect();
        tracing::debug!("Session disconnected");
    }
}

/// Connect with the session file at `session_path`, then authenticate.
pub fn open<C: Connector>(
    connector: &C,
    credentials: &Credentials,
    session_path: &Path,
    prompt: &mut dyn LoginPrompt,
) -> Result<SessionGuard<C::Session>> {
    if let Some(dir) = session_path.parent() {
        crate::utils::ensure_dir(dir)?;
    }
    let session = connector
        .connect(credentials, session_path)
        .wrap_err_with(|| format!("Failed to connect using {}", session_path.display()))?;
    let guard = SessionGuard::new(session);
    authenticate(&*guard, credentials.phone.as_deref(), prompt)?;
    Ok(guard)
}
